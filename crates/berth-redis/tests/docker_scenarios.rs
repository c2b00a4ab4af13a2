//! End-to-end scenarios against a local Docker daemon.
//!
//! Run with `cargo test -p berth-redis -- --ignored`.

use berth_fixture::telemetry::init_tracing;
use berth_fixture::{DockerRuntime, FixtureSession, SessionConfig, SharedRuntime, StoreClient};
use berth_redis::{presets, RedisClientFactory};
use std::sync::Arc;

async fn docker_runtime(config: &SessionConfig) -> anyhow::Result<SharedRuntime> {
    let _ = init_tracing(&config.logging);
    let runtime = DockerRuntime::with_config(config.runtime.docker()).await?;
    Ok(Arc::new(runtime))
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_single_node_round_trip() -> anyhow::Result<()> {
    let config = SessionConfig::from_env_or(presets::single_session())?;
    let runtime = docker_runtime(&config).await?;
    let factory = RedisClientFactory::new();

    let mut session = FixtureSession::open(runtime.clone(), &config, &factory).await?;
    {
        let client = session.client().expect("session is open");
        client.set("foo", "bar").await?;
        assert_eq!(client.get("foo").await?, Some("bar".to_string()));
    }
    let report = session.close().await;
    assert!(report.is_clean(), "{}", report);

    // A fresh session gets a fresh container.
    let mut session = FixtureSession::open(runtime, &config, &factory).await?;
    assert_eq!(session.client().expect("session is open").get("foo").await?, None);
    assert!(session.close().await.is_clean());

    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_cluster_round_trip() -> anyhow::Result<()> {
    let config = presets::cluster_session();
    let runtime = docker_runtime(&config).await?;
    let factory = RedisClientFactory::new();

    let mut session = FixtureSession::open(runtime, &config, &factory).await?;
    assert_eq!(session.translation_table().map(|t| t.len()), Some(6));

    {
        let client = session.client().expect("session is open");
        for i in 0..32 {
            let key = format!("key-{}", i);
            client.set(&key, "val").await?;
            assert_eq!(client.get(&key).await?, Some("val".to_string()));
            assert!(client.delete(&key).await?);
            assert_eq!(client.get(&key).await?, None);
        }
    }

    let report = session.close().await;
    assert!(report.is_clean(), "{}", report);
    Ok(())
}
