//! In-memory container runtime.
//!
//! Simulates networks and containers without a Docker daemon. Host ports and
//! network addresses are allocated from fixed ranges so tests can assert on
//! them, and failures can be injected per launch or per image.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::r#trait::{ContainerRuntime, InstanceRef, LaunchRequest};
use crate::container::WaitStrategy;
use crate::error::{FixtureError, Result};
use crate::topology::{NetworkRef, NetworkSpec};

/// First host port handed out.
const FIRST_HOST_PORT: u16 = 32768;

#[derive(Debug)]
struct MemoryInstance {
    name: String,
    ports: BTreeMap<u16, u16>,
    network: Option<NetworkRef>,
    ip: Ipv4Addr,
    never_ready: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    next_host_port: u16,
    next_host_octet: u16,
    launches: u64,
    networks: BTreeMap<String, NetworkRef>,
    instances: BTreeMap<String, MemoryInstance>,
    stopped: Vec<String>,
    failing_images: BTreeSet<String>,
    failing_launches: BTreeSet<u64>,
    never_ready_launches: BTreeSet<u64>,
    transient_readiness_failures: u32,
    failing_stops: u32,
    failing_network_removals: u32,
    launch_delay: Duration,
    unreachable: bool,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:012x}", prefix, self.next_id)
    }

    fn allocate_host_port(&mut self) -> Result<u16> {
        let port = FIRST_HOST_PORT
            .checked_add(self.next_host_port)
            .ok_or_else(|| FixtureError::runtime("host port range exhausted"))?;
        self.next_host_port += 1;
        Ok(port)
    }

    fn allocate_ip(&mut self) -> Result<Ipv4Addr> {
        let n = self
            .next_host_octet
            .checked_add(2)
            .ok_or_else(|| FixtureError::runtime("network address range exhausted"))?;
        self.next_host_octet += 1;
        Ok(Ipv4Addr::new(172, 28, (n >> 8) as u8, (n & 0xff) as u8))
    }
}

/// Container runtime that keeps everything in memory.
///
/// # Example
///
/// ```
/// use berth_fixture::backend::InMemoryRuntime;
///
/// # tokio_test_block_on(async {
/// let runtime = InMemoryRuntime::new();
/// runtime.never_ready_on_launch(2).await;
/// assert_eq!(runtime.running_instances().await, 0);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryRuntime {
    host: String,
    state: Mutex<MemoryState>,
}

impl InMemoryRuntime {
    /// Creates a runtime publishing ports on `127.0.0.1`.
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    /// Creates a runtime publishing ports on `host`.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Makes every launch of `image` fail.
    pub async fn fail_launch_of(&self, image: impl Into<String>) {
        self.state.lock().await.failing_images.insert(image.into());
    }

    /// Makes the `ordinal`-th launch (1-based) fail.
    pub async fn fail_launch_on(&self, ordinal: u64) {
        self.state.lock().await.failing_launches.insert(ordinal);
    }

    /// Makes the container from the `ordinal`-th launch (1-based) never
    /// become ready.
    pub async fn never_ready_on_launch(&self, ordinal: u64) {
        self.state.lock().await.never_ready_launches.insert(ordinal);
    }

    /// Makes the next `count` readiness checks fail with a transient error.
    pub async fn transient_readiness_failures(&self, count: u32) {
        self.state.lock().await.transient_readiness_failures = count;
    }

    /// Makes the next `count` container stops fail.
    pub async fn fail_next_stops(&self, count: u32) {
        self.state.lock().await.failing_stops = count;
    }

    /// Makes the next `count` network removals fail.
    pub async fn fail_next_network_removals(&self, count: u32) {
        self.state.lock().await.failing_network_removals = count;
    }

    /// Makes every launch hold for `delay` after the container exists,
    /// like a daemon that created the container but has not started it.
    pub async fn slow_launches(&self, delay: Duration) {
        self.state.lock().await.launch_delay = delay;
    }

    /// Makes [`ContainerRuntime::is_ready`] report the runtime as down.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Returns the number of launch attempts so far.
    pub async fn launch_count(&self) -> u64 {
        self.state.lock().await.launches
    }

    /// Returns the number of containers currently running.
    pub async fn running_instances(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Returns the number of networks that have not been removed.
    pub async fn live_networks(&self) -> usize {
        self.state.lock().await.networks.len()
    }

    /// Returns the names of stopped containers in the order they stopped.
    pub async fn stop_order(&self) -> Vec<String> {
        self.state.lock().await.stopped.clone()
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkRef> {
        let mut state = self.state.lock().await;
        let id = state.next_id("net");
        let network = NetworkRef::new(id.clone(), spec.name.clone());
        state.networks.insert(id, network.clone());

        debug!(network = %network, "Created in-memory network");
        Ok(network)
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<InstanceRef> {
        let mut state = self.state.lock().await;
        state.launches += 1;
        let ordinal = state.launches;

        if state.failing_images.contains(request.image.reference()) || state.failing_launches.contains(&ordinal) {
            return Err(FixtureError::runtime(format!(
                "container {} from image {} exited during startup",
                request.name, request.image
            )));
        }

        if let Some(network) = &request.network {
            if !state.networks.contains_key(&network.id) {
                return Err(FixtureError::runtime(format!("network {} not found", network)));
            }
        }

        let mut ports = BTreeMap::new();
        for &port in &request.ports {
            ports.insert(port, state.allocate_host_port()?);
        }
        let ip = state.allocate_ip()?;
        let id = state.next_id("mem");
        let never_ready = state.never_ready_launches.contains(&ordinal);

        state.instances.insert(
            id.clone(),
            MemoryInstance {
                name: request.name.clone(),
                ports,
                network: request.network.clone(),
                ip,
                never_ready,
            },
        );

        let instance = InstanceRef::new(id, request.name.clone());
        debug!(container = %instance, "Launched in-memory container");

        let delay = state.launch_delay;
        drop(state);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(instance)
    }

    async fn wait_until_ready(&self, instance: &InstanceRef, strategy: &WaitStrategy) -> Result<()> {
        let never_ready = {
            let mut state = self.state.lock().await;
            let never_ready = state
                .instances
                .get(&instance.id)
                .map(|i| i.never_ready)
                .ok_or_else(|| FixtureError::runtime(format!("container {} not found", instance)))?;

            if state.transient_readiness_failures > 0 {
                state.transient_readiness_failures -= 1;
                return Err(FixtureError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "readiness check connection reset",
                )));
            }
            never_ready
        };

        if never_ready {
            std::future::pending::<()>().await;
        }

        if let WaitStrategy::Delay { millis } = strategy {
            tokio::time::sleep(Duration::from_millis(*millis)).await;
        }
        Ok(())
    }

    async fn instance_host(&self, instance: &InstanceRef) -> Result<String> {
        let state = self.state.lock().await;
        if !state.instances.contains_key(&instance.id) {
            return Err(FixtureError::runtime(format!("container {} not found", instance)));
        }
        Ok(self.host.clone())
    }

    async fn mapped_port(&self, instance: &InstanceRef, port: u16) -> Result<u16> {
        let state = self.state.lock().await;
        state
            .instances
            .get(&instance.id)
            .and_then(|i| i.ports.get(&port).copied())
            .ok_or_else(|| FixtureError::runtime(format!("port {} of {} is not published", port, instance)))
    }

    async fn instance_ip_address(&self, instance: &InstanceRef, network: &NetworkRef) -> Result<IpAddr> {
        let state = self.state.lock().await;
        let entry = state
            .instances
            .get(&instance.id)
            .ok_or_else(|| FixtureError::runtime(format!("container {} not found", instance)))?;

        match &entry.network {
            Some(attached) if attached.id == network.id => Ok(IpAddr::V4(entry.ip)),
            _ => Err(FixtureError::no_network(&entry.name, &network.name)),
        }
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_stops > 0 {
            state.failing_stops -= 1;
            return Err(FixtureError::runtime(format!("failed to stop {}", instance)));
        }

        if state.instances.remove(&instance.id).is_some() {
            state.stopped.push(instance.name.clone());
            debug!(container = %instance, "Stopped in-memory container");
        }
        Ok(())
    }

    async fn remove_network(&self, network: &NetworkRef) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_network_removals > 0 {
            state.failing_network_removals -= 1;
            return Err(FixtureError::runtime(format!("failed to remove network {}", network)));
        }

        let attached = state
            .instances
            .values()
            .filter(|i| i.network.as_ref().map(|n| &n.id) == Some(&network.id))
            .count();
        if attached > 0 {
            return Err(FixtureError::runtime(format!(
                "network {} has {} active endpoints",
                network, attached
            )));
        }

        state.networks.remove(&network.id);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        !self.state.lock().await.unreachable
    }
}
