//! Fixture sessions.
//!
//! A [`FixtureSession`] is what a test holds: the started fixtures (one
//! container or a cluster group) and a connected client. It is torn down in
//! reverse acquisition order: client first, then the fixtures, then the
//! cluster network.

use berth_core::{AddressTranslationTable, Endpoint};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backend::{SharedRuntime, SESSION_LABEL};
use crate::client::{ClientFactory, ConnectOptions, StoreClient};
use crate::config::{SessionConfig, SessionMode};
use crate::container::ContainerFixture;
use crate::error::{FixtureError, Result};
use crate::topology::ClusterFixtureGroup;

/// Failures recorded while closing a session.
///
/// Closing never fails; what went wrong is logged and collected here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    failures: Vec<String>,
}

impl TeardownReport {
    /// Returns true if every resource was released.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the recorded failures in the order they happened.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    fn record(&mut self, what: &str, err: &FixtureError) {
        self.failures.push(format!("{}: {}", what, err));
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            f.write_str("clean teardown")
        } else {
            write!(f, "{} teardown failures: {}", self.failures.len(), self.failures.join("; "))
        }
    }
}

enum Fixtures {
    Single(ContainerFixture),
    Cluster(ClusterFixtureGroup),
}

/// Started fixtures plus a connected client.
///
/// # Example
///
/// ```ignore
/// let runtime: SharedRuntime = Arc::new(DockerRuntime::new().await?);
/// let config = SessionConfig::single(&presets::redis_single());
///
/// let mut session = FixtureSession::open(runtime, &config, &RedisClientFactory::new()).await?;
/// let client = session.client().expect("open session has a client");
/// client.set("foo", "bar").await?;
///
/// let report = session.close().await;
/// assert!(report.is_clean());
/// ```
pub struct FixtureSession<C: StoreClient> {
    id: String,
    mode: SessionMode,
    client: Option<C>,
    fixtures: Option<Fixtures>,
    endpoints: Vec<Endpoint>,
    table: Option<Arc<AddressTranslationTable>>,
    closed: bool,
}

impl<C: StoreClient> FixtureSession<C> {
    /// Starts the configured fixtures and connects a client.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::Launch`] if the configuration is invalid, a
    /// fixture fails to start, or the client cannot connect. Everything
    /// acquired before the failure has been released by then.
    pub async fn open<F>(runtime: SharedRuntime, config: &SessionConfig, factory: &F) -> Result<Self>
    where
        F: ClientFactory<Client = C>,
    {
        if let Err(e) = config.validate() {
            return Err(FixtureError::launch_caused_by("session configuration", e));
        }

        if !runtime.is_ready().await {
            return Err(FixtureError::launch(format!("runtime {} is not reachable", runtime.name())));
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", config.runtime.session_prefix, &suffix[..12]);
        let retry = config.runtime.readiness_retry();

        info!(
            session = %id,
            mode = ?config.mode,
            runtime = %runtime.name(),
            image = %config.fixture.image,
            "Opening session"
        );

        let mut session = Self {
            id,
            mode: config.mode,
            client: None,
            fixtures: None,
            endpoints: Vec::new(),
            table: None,
            closed: false,
        };

        match config.mode {
            SessionMode::Single => {
                let mut spec = config.fixture.to_spec();
                spec.labels.insert(SESSION_LABEL.to_string(), session.id.clone());

                let mut fixture = ContainerFixture::new(runtime, spec).with_readiness_retry(retry);
                session.endpoints = fixture.start().await?;
                session.fixtures = Some(Fixtures::Single(fixture));
            }
            SessionMode::Cluster => {
                let mut group = ClusterFixtureGroup::new(runtime, config.cluster_spec())
                    .with_label(SESSION_LABEL, session.id.clone())
                    .with_readiness_retry(retry);
                let table = group.start().await?;
                let endpoints = group.endpoints();
                session.fixtures = Some(Fixtures::Cluster(group));
                session.table = Some(Arc::new(table));

                match endpoints {
                    Ok(endpoints) => session.endpoints = endpoints,
                    Err(e) => return Err(session.abort("cluster endpoints", e).await),
                }
            }
        }

        let options = ConnectOptions {
            translation_table: session.table.clone(),
            ..config.client.connect_options()
        };

        let connected = tokio::time::timeout(
            options.connect_timeout,
            factory.connect(&session.endpoints, &options),
        )
        .await
        .unwrap_or_else(|_| {
            Err(FixtureError::timeout(format!(
                "client connection within {}s",
                options.connect_timeout.as_secs()
            )))
        });

        match connected {
            Ok(client) => session.client = Some(client),
            Err(e) => return Err(session.abort("client connection", e).await),
        }

        info!(
            session = %session.id,
            endpoints = ?session.endpoints.iter().map(ToString::to_string).collect::<Vec<_>>(),
            translated = session.table.as_ref().map(|t| t.len()),
            "Session open"
        );
        Ok(session)
    }

    /// Returns the session identifier, also the `berth.session` label value.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the session mode.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Returns the client until the session is closed.
    pub fn client(&self) -> Option<&C> {
        self.client.as_ref()
    }

    /// Returns the external endpoints of every started fixture.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the translation table in cluster mode.
    pub fn translation_table(&self) -> Option<&AddressTranslationTable> {
        self.table.as_deref()
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the client, stops the fixtures and removes the network.
    ///
    /// Never fails. Every failure is logged and listed in the returned
    /// report. Calling it again returns an empty report.
    pub async fn close(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.closed {
            return report;
        }
        self.closed = true;

        info!(session = %self.id, "Closing session");

        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!(session = %self.id, error = %e, "Failed to close client");
                report.record("client", &e);
            }
        }

        match self.fixtures.take() {
            Some(Fixtures::Single(mut fixture)) => {
                if let Err(e) = fixture.stop().await {
                    error!(session = %self.id, error = %e, "Failed to stop fixture");
                    report.record(fixture.name(), &e);
                }
            }
            Some(Fixtures::Cluster(mut group)) => {
                if let Err(e) = group.stop().await {
                    error!(session = %self.id, error = %e, "Failed to stop cluster");
                    report.record(group.name(), &e);
                }
            }
            None => {}
        }

        self.endpoints.clear();
        self.table = None;

        if report.is_clean() {
            info!(session = %self.id, "Session closed");
        } else {
            warn!(session = %self.id, failures = report.failures().len(), "Session closed with failures");
        }
        report
    }

    async fn abort(&mut self, what: &str, cause: FixtureError) -> FixtureError {
        error!(session = %self.id, error = %cause, "Session failed to open, releasing fixtures");
        let report = self.close().await;
        if !report.is_clean() {
            warn!(session = %self.id, report = %report, "Release after failed open was incomplete");
        }
        FixtureError::launch_caused_by(format!("{} for session {}", what, self.id), cause)
    }
}

impl<C: StoreClient> fmt::Debug for FixtureSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureSession")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("endpoints", &self.endpoints)
            .field("connected", &self.client.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<C: StoreClient> Drop for FixtureSession<C> {
    fn drop(&mut self) {
        if !self.closed && self.fixtures.is_some() {
            warn!(session = %self.id, "Session dropped without close, releasing fixtures in background");
        }
        // The client goes before the fixtures it is connected to.
        drop(self.client.take());
        drop(self.fixtures.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContainerRuntime, InMemoryRuntime, InstanceRef, LaunchRequest};
    use crate::client::{InMemoryClient, InMemoryClientFactory};
    use crate::container::{FixtureSpec, WaitStrategy};
    use crate::topology::{NetworkRef, NetworkSpec};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::time::Duration;

    fn single_config() -> SessionConfig {
        let spec = FixtureSpec::builder("redis:7-alpine")
            .port(6379)
            .wait_for(WaitStrategy::log_message("Ready to accept connections"))
            .startup_timeout(Duration::from_secs(5))
            .build();
        SessionConfig::single(&spec)
    }

    fn cluster_config(node_count: usize) -> SessionConfig {
        let spec = FixtureSpec::builder("grokzen/redis-cluster:7.0.10")
            .ports(7000..=7005)
            .wait_for(WaitStrategy::log_message("Ready to accept connections"))
            .startup_timeout(Duration::from_secs(5))
            .build();
        SessionConfig::cluster("redis-cluster", &spec, node_count)
    }

    async fn settle(runtime: &InMemoryRuntime) {
        for _ in 0..50 {
            if runtime.running_instances().await == 0 && runtime.live_networks().await == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_single_mode_scenario() -> anyhow::Result<()> {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();
        let config = single_config();

        let mut session: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime.clone(), &config, &factory).await?;

        assert_eq!(session.mode(), SessionMode::Single);
        assert_eq!(session.endpoints().len(), 1);
        assert!(session.translation_table().is_none());

        let client = session.client().expect("open session has a client");
        assert!(!client.is_cluster());
        client.set("foo", "bar").await?;
        assert_eq!(client.get("foo").await?, Some("bar".to_string()));

        assert!(session.close().await.is_clean());
        assert!(session.is_closed());
        assert!(session.client().is_none());
        assert_eq!(runtime.running_instances().await, 0);

        // A fresh session gets a fresh fixture.
        let mut next: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime.clone(), &config, &factory).await?;
        let client = next.client().expect("open session has a client");
        assert_eq!(client.get("foo").await?, None);
        assert!(next.close().await.is_clean());

        Ok(())
    }

    #[tokio::test]
    async fn test_cluster_mode_scenario() -> anyhow::Result<()> {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();

        let mut session: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime.clone(), &cluster_config(1), &factory).await?;

        assert_eq!(session.mode(), SessionMode::Cluster);
        let table = session.translation_table().expect("cluster session has a table");
        assert_eq!(table.len(), 6);
        assert_eq!(session.endpoints().len(), 6);

        let client = session.client().expect("open session has a client");
        assert!(client.is_cluster());
        client.set("foo", "bar").await?;
        assert_eq!(client.get("foo").await?, Some("bar".to_string()));
        assert!(client.delete("foo").await?);
        assert_eq!(client.get("foo").await?, None);

        assert!(session.close().await.is_clean());
        assert_eq!(runtime.running_instances().await, 0);
        assert_eq!(runtime.live_networks().await, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();
        let mut session: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime.clone(), &single_config(), &factory)
                .await
                .unwrap();

        assert!(session.close().await.is_clean());
        assert!(session.close().await.is_clean());
        assert_eq!(runtime.stop_order().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_never_ready_leaves_nothing_behind() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.never_ready_on_launch(2).await;
        let factory = InMemoryClientFactory::new();

        let err = FixtureSession::<InMemoryClient>::open(runtime.clone(), &cluster_config(3), &factory)
            .await
            .unwrap_err();

        assert!(err.is_launch());
        assert_eq!(runtime.running_instances().await, 0);
        assert_eq!(runtime.live_networks().await, 0);
    }

    #[tokio::test]
    async fn test_client_failure_releases_fixtures() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();
        factory.refuse_connections(true);

        let err = FixtureSession::<InMemoryClient>::open(runtime.clone(), &cluster_config(2), &factory)
            .await
            .unwrap_err();

        assert!(err.is_launch());
        assert!(matches!(err.root_cause(), FixtureError::Client(_)));
        assert_eq!(runtime.running_instances().await, 0);
        assert_eq!(runtime.live_networks().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_launch_error() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();

        let err = FixtureSession::<InMemoryClient>::open(runtime.clone(), &SessionConfig::default(), &factory)
            .await
            .unwrap_err();

        assert!(err.is_launch());
        assert_eq!(runtime.launch_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_records_failures_without_raising() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();
        let mut session: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime.clone(), &cluster_config(2), &factory)
                .await
                .unwrap();

        runtime.fail_next_stops(1).await;
        let report = session.close().await;

        assert!(!report.is_clean());
        assert_eq!(report.failures().len(), 1);
        assert!(report.failures()[0].starts_with("redis-cluster"));
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_open_releases_resources() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.never_ready_on_launch(3).await;
        let factory = InMemoryClientFactory::new();
        let config = cluster_config(3);

        let open = FixtureSession::<InMemoryClient>::open(runtime.clone(), &config, &factory);
        assert!(tokio::time::timeout(Duration::from_secs(1), open).await.is_err());

        settle(&runtime).await;
        assert_eq!(runtime.running_instances().await, 0);
        assert_eq!(runtime.live_networks().await, 0);
    }

    #[tokio::test]
    async fn test_session_label_reaches_containers() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();
        let mut session: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime, &single_config(), &factory)
                .await
                .unwrap();

        assert!(session.id().starts_with("berth-"));
        match &session.fixtures {
            Some(Fixtures::Single(fixture)) => {
                assert_eq!(fixture.spec().labels.get(SESSION_LABEL), Some(&session.id().to_string()));
            }
            _ => panic!("single session holds one fixture"),
        }
        session.close().await;
    }

    /// Runtime that records how many clients were still open at each stop.
    struct StopRecorder {
        inner: Arc<InMemoryRuntime>,
        factory: Arc<InMemoryClientFactory>,
        open_at_stop: std::sync::Mutex<Vec<usize>>,
    }

    impl StopRecorder {
        fn open_at_stop(&self) -> Vec<usize> {
            self.open_at_stop.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for StopRecorder {
        fn name(&self) -> &str {
            "recording"
        }

        async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkRef> {
            self.inner.create_network(spec).await
        }

        async fn launch(&self, request: &LaunchRequest) -> Result<InstanceRef> {
            self.inner.launch(request).await
        }

        async fn wait_until_ready(&self, instance: &InstanceRef, strategy: &WaitStrategy) -> Result<()> {
            self.inner.wait_until_ready(instance, strategy).await
        }

        async fn instance_host(&self, instance: &InstanceRef) -> Result<String> {
            self.inner.instance_host(instance).await
        }

        async fn mapped_port(&self, instance: &InstanceRef, port: u16) -> Result<u16> {
            self.inner.mapped_port(instance, port).await
        }

        async fn instance_ip_address(&self, instance: &InstanceRef, network: &NetworkRef) -> Result<IpAddr> {
            self.inner.instance_ip_address(instance, network).await
        }

        async fn stop(&self, instance: &InstanceRef) -> Result<()> {
            self.open_at_stop.lock().unwrap().push(self.factory.open_clients());
            self.inner.stop(instance).await
        }

        async fn remove_network(&self, network: &NetworkRef) -> Result<()> {
            self.inner.remove_network(network).await
        }
    }

    #[tokio::test]
    async fn test_client_closed_before_fixtures_even_when_close_fails() {
        let inner = Arc::new(InMemoryRuntime::new());
        let factory = Arc::new(InMemoryClientFactory::new());
        factory.fail_close(true);
        let runtime = Arc::new(StopRecorder {
            inner: inner.clone(),
            factory: factory.clone(),
            open_at_stop: std::sync::Mutex::new(Vec::new()),
        });

        let mut session: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime.clone(), &cluster_config(2), &*factory)
                .await
                .unwrap();
        assert_eq!(factory.open_clients(), 1);

        let report = session.close().await;

        assert_eq!(report.failures().len(), 1);
        assert!(report.failures()[0].starts_with("client"));

        let open_at_stop = runtime.open_at_stop();
        assert_eq!(open_at_stop.len(), 2);
        assert!(open_at_stop.iter().all(|&open| open == 0));

        assert_eq!(inner.running_instances().await, 0);
        assert_eq!(inner.live_networks().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_launch_error() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.set_unreachable(true).await;
        let factory = InMemoryClientFactory::new();

        let err = FixtureSession::<InMemoryClient>::open(runtime.clone(), &single_config(), &factory)
            .await
            .unwrap_err();

        assert!(err.is_launch());
        assert!(err.to_string().contains("not reachable"));
        assert_eq!(runtime.launch_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_session_releases_client_then_fixtures() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let factory = InMemoryClientFactory::new();

        let session: FixtureSession<InMemoryClient> =
            FixtureSession::open(runtime.clone(), &cluster_config(2), &factory)
                .await
                .unwrap();
        assert_eq!(factory.open_clients(), 1);

        drop(session);
        assert_eq!(factory.open_clients(), 0);

        settle(&runtime).await;
        assert_eq!(runtime.running_instances().await, 0);
        assert_eq!(runtime.live_networks().await, 0);
    }

    #[test]
    fn test_teardown_report_display() {
        let mut report = TeardownReport::default();
        assert_eq!(report.to_string(), "clean teardown");

        report.record("redis", &FixtureError::teardown("boom"));
        assert_eq!(report.to_string(), "1 teardown failures: redis: teardown failed: boom");
    }
}
