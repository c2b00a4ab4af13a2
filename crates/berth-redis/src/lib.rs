//! Redis support for berth sessions.
//!
//! - [`RedisClientFactory`] connects a [`SingleNodeClient`] to a single
//!   fixture, or a [`ClusterClient`] to a cluster group, following `MOVED`
//!   and `ASK` redirects through the group's translation table
//! - [`presets`] provides ready-made fixture specs and session configs
//!
//! # Example
//!
//! ```ignore
//! use berth_fixture::{DockerRuntime, FixtureSession, StoreClient};
//! use berth_redis::{presets, RedisClientFactory};
//! use std::sync::Arc;
//!
//! let runtime = Arc::new(DockerRuntime::new().await?);
//! let mut session = FixtureSession::open(runtime, &presets::cluster_session(), &RedisClientFactory::new()).await?;
//!
//! let client = session.client().expect("connected");
//! client.set("key", "val").await?;
//! assert_eq!(client.get("key").await?, Some("val".to_string()));
//!
//! session.close().await;
//! ```

pub mod cluster;
pub mod error;
pub mod factory;
#[cfg(test)]
mod fake_server;
pub mod presets;
pub mod single;

pub use cluster::ClusterClient;
pub use factory::{RedisClient, RedisClientFactory};
pub use single::SingleNodeClient;
