//! Container runtime trait definition.
//!
//! This module defines the narrow interface the fixture core consumes from a
//! container runtime, along with the request and reference types that cross
//! it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::container::{ContainerImage, FixtureSpec, WaitStrategy};
use crate::error::Result;
use crate::topology::{NetworkRef, NetworkSpec};

/// Core trait for container runtimes.
///
/// A runtime creates networks and containers on behalf of fixtures and
/// answers questions about them. It holds no fixture state of its own; the
/// fixtures decide when to launch, how long to wait and when to release.
///
/// # Lifecycle
///
/// 1. `create_network()` for grouped fixtures
/// 2. `launch()` creates and starts a container
/// 3. `wait_until_ready()` suspends until the readiness signal fires; the
///    caller bounds it with a timeout
/// 4. `instance_host()`, `mapped_port()`, `instance_ip_address()` describe
///    the running container
/// 5. `stop()` for every launched container, then `remove_network()`
///
/// # Failure contract
///
/// `launch()` either returns a running instance or leaves nothing behind.
/// `stop()` and `remove_network()` must tolerate resources that are already
/// gone.
///
/// # Example
///
/// ```ignore
/// use berth_fixture::backend::{ContainerRuntime, DockerRuntime, LaunchRequest};
///
/// let runtime = DockerRuntime::new().await?;
/// let instance = runtime.launch(&request).await?;
/// runtime.wait_until_ready(&instance, &WaitStrategy::Running).await?;
/// let port = runtime.mapped_port(&instance, 6379).await?;
/// runtime.stop(&instance).await?;
/// ```
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the name of this runtime.
    fn name(&self) -> &str;

    /// Creates an isolated network.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkRef>;

    /// Creates and starts a container.
    ///
    /// Every declared port is published on an ephemeral host port. If the
    /// request names a network the container is attached to it.
    async fn launch(&self, request: &LaunchRequest) -> Result<InstanceRef>;

    /// Suspends until the container satisfies `strategy`.
    ///
    /// May wait forever; callers bound it with a timeout.
    async fn wait_until_ready(&self, instance: &InstanceRef, strategy: &WaitStrategy) -> Result<()>;

    /// Returns the host on which the container's ports are published.
    async fn instance_host(&self, instance: &InstanceRef) -> Result<String>;

    /// Returns the host port mapped to a declared container port.
    async fn mapped_port(&self, instance: &InstanceRef, port: u16) -> Result<u16>;

    /// Returns the container's IP address inside `network`.
    async fn instance_ip_address(&self, instance: &InstanceRef, network: &NetworkRef) -> Result<IpAddr>;

    /// Stops and removes a container.
    async fn stop(&self, instance: &InstanceRef) -> Result<()>;

    /// Removes a network.
    async fn remove_network(&self, network: &NetworkRef) -> Result<()>;

    /// Checks if the runtime is reachable.
    async fn is_ready(&self) -> bool {
        true
    }
}

/// A runtime shared between a session and its fixtures.
pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// Everything a runtime needs to launch one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Unique container name.
    pub name: String,

    /// The image to run.
    pub image: ContainerImage,

    /// Ports to publish.
    pub ports: Vec<u16>,

    /// Network to attach to, if any.
    pub network: Option<NetworkRef>,

    /// Environment variables.
    pub environment: BTreeMap<String, String>,

    /// Command override.
    pub command: Option<Vec<String>>,

    /// Labels to apply.
    pub labels: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Builds a request from a fixture spec.
    pub fn from_spec(spec: &FixtureSpec, name: impl Into<String>, network: Option<NetworkRef>) -> Self {
        Self {
            name: name.into(),
            image: spec.image.clone(),
            ports: spec.ports.clone(),
            network,
            environment: spec.environment.clone(),
            command: spec.command.clone(),
            labels: spec.labels.clone(),
        }
    }

    /// Returns `KEY=value` pairs for the container environment.
    pub fn env_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Reference to a container launched by a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Runtime-assigned identifier.
    pub id: String,

    /// Container name.
    pub name: String,
}

impl InstanceRef {
    /// Creates a new instance reference.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Returns the short container ID (first 12 characters).
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.short_id())
    }
}
