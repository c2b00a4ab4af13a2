//! Container-backed fixtures for integration tests.
//!
//! This crate starts disposable service containers for a test, hands the
//! test stable endpoints to reach them and releases everything afterwards,
//! including when a start fails halfway or the test is cancelled.
//!
//! # Overview
//!
//! - **Single fixtures**: one container, its ports published on ephemeral
//!   host ports
//! - **Cluster groups**: several members on a dedicated network, plus the
//!   [`AddressTranslationTable`](berth_core::AddressTranslationTable) that
//!   maps the addresses members advertise to ones reachable from the host
//! - **Sessions**: fixtures plus a connected client, torn down in reverse
//!   acquisition order
//!
//! # Architecture
//!
//! - [`backend`]: container runtime trait, Docker and in-memory runtimes
//! - [`container`]: fixture specs and the [`ContainerFixture`] lifecycle
//! - [`topology`]: networks and [`ClusterFixtureGroup`]
//! - [`client`]: store client and factory traits
//! - [`session`]: [`FixtureSession`]
//! - [`config`]: TOML session configuration
//! - [`telemetry`]: tracing setup
//!
//! # Example
//!
//! ```ignore
//! use berth_fixture::{
//!     backend::DockerRuntime,
//!     config::SessionConfig,
//!     container::{FixtureSpec, WaitStrategy},
//!     FixtureSession,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn stores_values() -> anyhow::Result<()> {
//!     let spec = FixtureSpec::builder("redis:7-alpine")
//!         .port(6379)
//!         .wait_for(WaitStrategy::log_message("Ready to accept connections"))
//!         .build();
//!
//!     let runtime = Arc::new(DockerRuntime::new().await?);
//!     let mut session = FixtureSession::open(runtime, &SessionConfig::single(&spec), &factory).await?;
//!
//!     let client = session.client().expect("connected");
//!     client.set("foo", "bar").await?;
//!     assert_eq!(client.get("foo").await?, Some("bar".into()));
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod container;
pub mod error;
pub mod session;
pub mod telemetry;
pub mod topology;

pub use backend::{ContainerRuntime, DockerRuntime, InMemoryRuntime, SharedRuntime};
pub use client::{ClientFactory, ConnectOptions, StoreClient};
pub use config::{SessionConfig, SessionMode};
pub use container::{ContainerFixture, FixtureSpec, FixtureState, WaitStrategy};
pub use error::{FixtureError, Result};
pub use session::{FixtureSession, TeardownReport};
pub use topology::{ClusterFixtureGroup, ClusterSpec};
