//! Container fixture lifecycle.
//!
//! A [`ContainerFixture`] owns exactly one launched container: it starts it,
//! waits (bounded) for readiness, discovers the mapped ports and internal
//! address, and releases it again. Every failure during acquisition releases
//! whatever was created before the error is returned.

use berth_core::{Endpoint, InternalAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::backend::{spawn_release, InstanceRef, LaunchRequest, SharedRuntime};
use crate::container::FixtureSpec;
use crate::error::{FixtureError, Result};
use crate::topology::NetworkRef;

/// Fixture lifecycle state.
///
/// `Created → Starting → Ready → Stopping → Stopped`; any state except
/// `Stopped` may move to `Failed`. Nothing leaves `Stopped` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixtureState {
    /// Fixture has been created but not started.
    Created,

    /// Container is being launched or waited on.
    Starting,

    /// Container is ready to serve.
    Ready,

    /// Container is being released.
    Stopping,

    /// Container has been released.
    Stopped,

    /// An unrecoverable error occurred.
    Failed {
        /// Error message.
        reason: String,
    },
}

impl FixtureState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }

    /// Returns true if the transition to `next` is allowed.
    pub fn can_transition_to(&self, next: &FixtureState) -> bool {
        use FixtureState::*;

        match (self, next) {
            (Stopped, _) | (Failed { .. }, _) => false,
            (_, Failed { .. }) => true,
            (Created, Starting) | (Starting, Ready) | (Ready, Stopping) | (Stopping, Stopped) => true,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl fmt::Display for FixtureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Retry policy for transient readiness failures.
///
/// At most one retry is ever made. Timeouts and structural failures are
/// never retried regardless of this policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessRetry {
    max_retries: u32,
    backoff: Duration,
}

impl ReadinessRetry {
    /// Creates a policy; `max_retries` is clamped to 1.
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries: max_retries.min(1),
            backoff,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Returns the number of retries allowed.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the delay before the retry.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl Default for ReadinessRetry {
    fn default() -> Self {
        Self::new(1, Duration::from_millis(500))
    }
}

/// One container-backed fixture.
///
/// # Example
///
/// ```ignore
/// let spec = FixtureSpec::builder("redis:7-alpine")
///     .port(6379)
///     .wait_for(WaitStrategy::log_message("Ready to accept connections"))
///     .build();
///
/// let mut fixture = ContainerFixture::new(runtime, spec);
/// let endpoints = fixture.start().await?;
/// println!("redis at {}", endpoints[0]);
/// fixture.stop().await?;
/// ```
pub struct ContainerFixture {
    runtime: SharedRuntime,
    spec: FixtureSpec,
    container_name: String,
    network: Option<NetworkRef>,
    retry: ReadinessRetry,
    state: FixtureState,
    instance: Option<InstanceRef>,
    host: Option<String>,
    mapped_ports: BTreeMap<u16, u16>,
    internal_ip: Option<IpAddr>,
}

impl ContainerFixture {
    /// Creates a fixture in the `Created` state. Nothing is launched yet.
    pub fn new(runtime: SharedRuntime, spec: FixtureSpec) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let container_name = format!("{}-{}", spec.name, &suffix[..8]);

        Self {
            runtime,
            spec,
            container_name,
            network: None,
            retry: ReadinessRetry::default(),
            state: FixtureState::Created,
            instance: None,
            host: None,
            mapped_ports: BTreeMap::new(),
            internal_ip: None,
        }
    }

    /// Attaches the fixture to a network when it starts.
    pub fn on_network(mut self, network: NetworkRef) -> Self {
        self.network = Some(network);
        self
    }

    /// Sets the readiness retry policy.
    pub fn with_readiness_retry(mut self, retry: ReadinessRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the fixture name from its spec.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Returns the unique container name.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Returns the fixture spec.
    pub fn spec(&self) -> &FixtureSpec {
        &self.spec
    }

    /// Returns the current state.
    pub fn state(&self) -> &FixtureState {
        &self.state
    }

    /// Returns the network the fixture attaches to, if any.
    pub fn network(&self) -> Option<&NetworkRef> {
        self.network.as_ref()
    }

    /// Returns the launched container, if one is live.
    pub fn instance(&self) -> Option<&InstanceRef> {
        self.instance.as_ref()
    }

    /// Returns true if the fixture still owns a container.
    pub fn holds_container(&self) -> bool {
        self.instance.is_some()
    }

    /// Launches the container and waits for it to become ready.
    ///
    /// Returns one endpoint per declared port, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::Launch`] if the spec is invalid, the runtime
    /// refuses the launch, readiness fails, or the startup timeout elapses.
    /// Any container created along the way has been released by then.
    pub async fn start(&mut self) -> Result<Vec<Endpoint>> {
        if self.state != FixtureState::Created {
            return Err(FixtureError::invalid_state_transition(
                &self.state,
                FixtureState::Starting,
            ));
        }

        if let Err(e) = self.spec.validate() {
            self.state = FixtureState::Failed {
                reason: e.to_string(),
            };
            return Err(FixtureError::launch_caused_by(
                format!("fixture {} has an invalid spec", self.spec.name),
                e,
            ));
        }

        self.transition(FixtureState::Starting)?;

        let timeout = self.spec.startup_timeout();
        info!(
            fixture = %self.spec.name,
            image = %self.spec.image,
            ports = ?self.spec.ports,
            network = ?self.network.as_ref().map(|n| n.name.as_str()),
            timeout_secs = timeout.as_secs(),
            "Starting fixture"
        );

        let outcome = tokio::time::timeout(timeout, self.launch_and_discover()).await;

        let cause = match outcome {
            Ok(Ok(endpoints)) => {
                self.transition(FixtureState::Ready)?;
                info!(
                    fixture = %self.spec.name,
                    container = %self.container_name,
                    endpoints = ?endpoints.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "Fixture ready"
                );
                return Ok(endpoints);
            }
            Ok(Err(e)) => e,
            Err(_) => FixtureError::timeout(format!(
                "{} ({}) within {}s",
                self.container_name,
                self.spec.wait.describe(),
                timeout.as_secs()
            )),
        };

        error!(fixture = %self.spec.name, error = %cause, "Fixture failed to start");
        self.abort(&cause).await;

        Err(FixtureError::launch_caused_by(
            format!("fixture {} ({})", self.spec.name, self.spec.image),
            cause,
        ))
    }

    /// Returns the host port mapped to a declared port.
    ///
    /// Stable for as long as the fixture stays `Ready`.
    pub fn mapped_port(&self, port: u16) -> Result<u16> {
        self.ensure_ready()?;
        self.mapped_ports
            .get(&port)
            .copied()
            .ok_or_else(|| FixtureError::UndeclaredPort {
                fixture: self.spec.name.clone(),
                port,
            })
    }

    /// Returns the host the container's ports are published on.
    pub fn host(&self) -> Result<&str> {
        self.ensure_ready()?;
        self.host
            .as_deref()
            .ok_or_else(|| FixtureError::not_started(&self.spec.name, &self.state))
    }

    /// Returns the external endpoint for a declared port.
    pub fn endpoint(&self, port: u16) -> Result<Endpoint> {
        let mapped = self.mapped_port(port)?;
        Ok(Endpoint::new(self.host()?, mapped)?)
    }

    /// Returns external endpoints for every declared port, in order.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        self.spec.ports.iter().map(|&p| self.endpoint(p)).collect()
    }

    /// Returns the internal address of a declared port inside `network`.
    ///
    /// # Errors
    ///
    /// [`FixtureError::NoNetwork`] if the fixture is not attached to
    /// `network`; [`FixtureError::NotStarted`] unless `Ready`.
    pub fn internal_address(&self, network: &NetworkRef, port: u16) -> Result<InternalAddress> {
        match &self.network {
            Some(attached) if attached.id == network.id => {}
            _ => return Err(FixtureError::no_network(&self.spec.name, &network.name)),
        }

        self.ensure_ready()?;

        if !self.spec.declares(port) {
            return Err(FixtureError::UndeclaredPort {
                fixture: self.spec.name.clone(),
                port,
            });
        }

        let ip = self
            .internal_ip
            .ok_or_else(|| FixtureError::no_network(&self.spec.name, &network.name))?;
        Ok(InternalAddress::new(ip, port)?)
    }

    /// Releases the container.
    ///
    /// Idempotent: a fixture that was never started, is already stopped, or
    /// failed and released its container, stops as a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::Teardown`] if the runtime fails to release the
    /// container; the fixture is then `Failed` and keeps the reference so a
    /// later call can try again.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(instance) = self.instance.take() else {
            match self.state {
                FixtureState::Ready | FixtureState::Stopping => self.state = FixtureState::Stopped,
                FixtureState::Starting => self.mark_start_aborted(),
                _ => {}
            }
            return Ok(());
        };

        if self.state.can_transition_to(&FixtureState::Stopping) {
            self.state = FixtureState::Stopping;
        }

        debug!(fixture = %self.spec.name, container = %instance, "Stopping fixture");

        match self.runtime.stop(&instance).await {
            Ok(()) => {
                match self.state {
                    FixtureState::Stopping => self.state = FixtureState::Stopped,
                    FixtureState::Starting => self.mark_start_aborted(),
                    _ => {}
                }
                self.host = None;
                self.mapped_ports.clear();
                self.internal_ip = None;
                info!(fixture = %self.spec.name, container = %instance, "Stopped fixture");
                Ok(())
            }
            Err(e) => {
                error!(
                    fixture = %self.spec.name,
                    container = %instance,
                    error = %e,
                    "Failed to stop fixture"
                );
                let reason = format!("failed to stop {}: {}", instance, e);
                self.instance = Some(instance);
                self.state = FixtureState::Failed {
                    reason: reason.clone(),
                };
                Err(FixtureError::teardown(reason))
            }
        }
    }

    /// Hands over the live container without releasing it.
    ///
    /// Used by a group that has to release members in a fixed order from
    /// a background task.
    pub(crate) fn detach_instance(&mut self) -> Option<InstanceRef> {
        self.instance.take()
    }

    async fn launch_and_discover(&mut self) -> Result<Vec<Endpoint>> {
        let request = LaunchRequest::from_spec(&self.spec, &self.container_name, self.network.clone());
        let instance = self.launch_detached(request).await?;
        self.instance = Some(instance.clone());

        debug!(
            fixture = %self.spec.name,
            container = %instance,
            wait = %self.spec.wait.describe(),
            "Waiting for readiness"
        );
        self.wait_ready(&instance).await?;

        let host = self.runtime.instance_host(&instance).await?;
        let mut mapped_ports = BTreeMap::new();
        for &port in &self.spec.ports {
            let mapped = self.runtime.mapped_port(&instance, port).await?;
            mapped_ports.insert(port, mapped);
        }

        if let Some(network) = &self.network {
            let ip = self.runtime.instance_ip_address(&instance, network).await?;
            self.internal_ip = Some(ip);
        }

        let endpoints = self
            .spec
            .ports
            .iter()
            .map(|p| Endpoint::new(host.clone(), mapped_ports[p]))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.host = Some(host);
        self.mapped_ports = mapped_ports;
        Ok(endpoints)
    }

    /// Launches on a spawned task so a container created while the start
    /// is being cancelled still has an owner. If nobody is waiting for the
    /// result any more, the task stops the container itself.
    async fn launch_detached(&self, request: LaunchRequest) -> Result<InstanceRef> {
        let runtime = self.runtime.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let launched = runtime.launch(&request).await;
            if let Err(Ok(orphan)) = tx.send(launched) {
                warn!(container = %orphan, "Start abandoned during launch, releasing container");
                if let Err(e) = runtime.stop(&orphan).await {
                    warn!(container = %orphan, error = %e, "Failed to release abandoned container");
                }
            }
        });

        PendingLaunch {
            runtime: self.runtime.clone(),
            rx,
            received: false,
        }
        .wait()
        .await
    }

    async fn wait_ready(&self, instance: &InstanceRef) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.runtime.wait_until_ready(instance, &self.spec.wait).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries() => {
                    attempt += 1;
                    warn!(
                        fixture = %self.spec.name,
                        container = %instance,
                        error = %e,
                        backoff_ms = self.retry.backoff().as_millis() as u64,
                        "Readiness check failed, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn abort(&mut self, cause: &FixtureError) {
        if let Some(instance) = self.instance.take() {
            if let Err(e) = self.runtime.stop(&instance).await {
                warn!(
                    fixture = %self.spec.name,
                    container = %instance,
                    error = %e,
                    "Failed to release container after failed start"
                );
                self.instance = Some(instance);
            }
        }
        self.host = None;
        self.mapped_ports.clear();
        self.internal_ip = None;
        self.state = FixtureState::Failed {
            reason: cause.to_string(),
        };
    }

    /// A start whose future was dropped before it finished.
    fn mark_start_aborted(&mut self) {
        self.state = FixtureState::Failed {
            reason: "start aborted".to_string(),
        };
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == FixtureState::Ready {
            Ok(())
        } else {
            Err(FixtureError::not_started(&self.spec.name, &self.state))
        }
    }

    fn transition(&mut self, next: FixtureState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(FixtureError::invalid_state_transition(&self.state, &next));
        }
        self.state = next;
        Ok(())
    }
}

/// Receiving end of a detached launch.
///
/// Dropped unread, it closes the channel so the launch task releases a late
/// container, and releases one that was already delivered.
struct PendingLaunch {
    runtime: SharedRuntime,
    rx: oneshot::Receiver<Result<InstanceRef>>,
    received: bool,
}

impl PendingLaunch {
    async fn wait(mut self) -> Result<InstanceRef> {
        let launched = (&mut self.rx).await;
        self.received = true;
        launched.map_err(|_| FixtureError::runtime("launch task ended without a result"))?
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        if self.received {
            return;
        }
        self.rx.close();
        if let Ok(Ok(instance)) = self.rx.try_recv() {
            spawn_release(self.runtime.clone(), vec![instance], None);
        }
    }
}

impl fmt::Debug for ContainerFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerFixture")
            .field("name", &self.spec.name)
            .field("container_name", &self.container_name)
            .field("runtime", &self.runtime.name())
            .field("state", &self.state)
            .field("instance", &self.instance)
            .field("mapped_ports", &self.mapped_ports)
            .finish()
    }
}

impl Drop for ContainerFixture {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            warn!(
                fixture = %self.spec.name,
                container = %instance,
                "Fixture dropped while holding a container, releasing in background"
            );
            spawn_release(self.runtime.clone(), vec![instance], None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContainerRuntime, InMemoryRuntime};
    use crate::container::WaitStrategy;
    use std::sync::Arc;

    fn redis_spec() -> FixtureSpec {
        FixtureSpec::builder("redis:7-alpine")
            .port(6379)
            .wait_for(WaitStrategy::log_message("Ready to accept connections"))
            .startup_timeout(Duration::from_secs(5))
            .build()
    }

    #[test]
    fn test_state_transitions() {
        use FixtureState::*;

        assert!(Created.can_transition_to(&Starting));
        assert!(Starting.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Stopping));
        assert!(Stopping.can_transition_to(&Stopped));
        assert!(Starting.can_transition_to(&Failed { reason: "x".into() }));

        assert!(!Created.can_transition_to(&Ready));
        assert!(!Stopped.can_transition_to(&Failed { reason: "x".into() }));
        assert!(!Failed { reason: "x".into() }.can_transition_to(&Created));
        assert!(Stopped.is_terminal());
        assert!(!Ready.is_terminal());
    }

    #[test]
    fn test_readiness_retry_is_clamped() {
        let retry = ReadinessRetry::new(5, Duration::from_millis(10));
        assert_eq!(retry.max_retries(), 1);
        assert_eq!(ReadinessRetry::none().max_retries(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());

        assert!(matches!(
            fixture.mapped_port(6379),
            Err(FixtureError::NotStarted { .. })
        ));

        let endpoints = fixture.start().await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(fixture.state(), &FixtureState::Ready);
        assert_eq!(runtime.running_instances().await, 1);

        let port = fixture.mapped_port(6379).unwrap();
        assert_eq!(fixture.mapped_port(6379).unwrap(), port);
        assert_eq!(endpoints[0].port(), port);
        assert_eq!(fixture.endpoint(6379).unwrap(), endpoints[0]);

        assert!(matches!(
            fixture.mapped_port(6380),
            Err(FixtureError::UndeclaredPort { port: 6380, .. })
        ));

        fixture.stop().await.unwrap();
        assert_eq!(fixture.state(), &FixtureState::Stopped);
        assert_eq!(runtime.running_instances().await, 0);
        assert!(matches!(
            fixture.mapped_port(6379),
            Err(FixtureError::NotStarted { .. })
        ));

        // Second stop is a no-op.
        fixture.stop().await.unwrap();
        assert_eq!(fixture.state(), &FixtureState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let mut fixture = ContainerFixture::new(runtime, redis_spec());

        fixture.stop().await.unwrap();
        assert_eq!(fixture.state(), &FixtureState::Created);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let mut fixture = ContainerFixture::new(runtime, redis_spec());

        fixture.start().await.unwrap();
        let err = fixture.start().await.unwrap_err();
        assert!(matches!(err, FixtureError::InvalidStateTransition { .. }));
        fixture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_spec_is_launch_error_without_launch() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let spec = FixtureSpec::builder("redis").build();
        let mut fixture = ContainerFixture::new(runtime.clone(), spec);

        let err = fixture.start().await.unwrap_err();
        assert!(err.is_launch());
        assert!(matches!(err.root_cause(), FixtureError::Validation(_)));
        assert_eq!(runtime.launch_count().await, 0);
        assert!(matches!(fixture.state(), FixtureState::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_releases_container() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.never_ready_on_launch(1).await;
        let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());

        let err = fixture.start().await.unwrap_err();

        assert!(err.is_launch());
        assert!(matches!(err.root_cause(), FixtureError::Timeout { .. }));
        assert!(matches!(fixture.state(), FixtureState::Failed { .. }));
        assert!(!fixture.holds_container());
        assert_eq!(runtime.running_instances().await, 0);

        // Failed fixtures stop as a no-op.
        fixture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_launch_releases_late_container() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.slow_launches(Duration::from_secs(30)).await;

        {
            let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());
            let err = fixture.start().await.unwrap_err();

            assert!(matches!(err.root_cause(), FixtureError::Timeout { .. }));
            assert!(!fixture.holds_container());
            fixture.stop().await.unwrap();
        }

        // The container exists while the launch is still in flight.
        assert_eq!(runtime.running_instances().await, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runtime.running_instances().await, 0);
        assert_eq!(runtime.stop_order().await.len(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_not_retried() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.fail_launch_of("redis:7-alpine").await;
        let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());

        let err = fixture.start().await.unwrap_err();
        assert!(err.is_launch());
        assert_eq!(runtime.launch_count().await, 1);
        assert_eq!(runtime.running_instances().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_readiness_failure_is_retried_once() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.transient_readiness_failures(1).await;
        let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());

        fixture.start().await.unwrap();
        assert_eq!(fixture.state(), &FixtureState::Ready);
        fixture.stop().await.unwrap();

        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.transient_readiness_failures(2).await;
        let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());

        let err = fixture.start().await.unwrap_err();
        assert!(err.root_cause().is_retryable());
        assert_eq!(runtime.running_instances().await, 0);
    }

    #[tokio::test]
    async fn test_internal_address() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let network = runtime
            .create_network(&crate::topology::NetworkSpec::builder("net").build())
            .await
            .unwrap();
        let other = crate::topology::NetworkRef::new("other-id", "other");

        let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec()).on_network(network.clone());

        assert!(matches!(
            fixture.internal_address(&network, 6379),
            Err(FixtureError::NotStarted { .. })
        ));

        fixture.start().await.unwrap();

        let address = fixture.internal_address(&network, 6379).unwrap();
        assert_eq!(address.port(), 6379);
        assert!(matches!(
            fixture.internal_address(&other, 6379),
            Err(FixtureError::NoNetwork { .. })
        ));

        fixture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_internal_address_without_network() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let mut fixture = ContainerFixture::new(runtime, redis_spec());
        fixture.start().await.unwrap();

        let network = crate::topology::NetworkRef::new("id", "net");
        assert!(matches!(
            fixture.internal_address(&network, 6379),
            Err(FixtureError::NoNetwork { .. })
        ));
        fixture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_container_for_retry() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());
        fixture.start().await.unwrap();

        runtime.fail_next_stops(1).await;
        let err = fixture.stop().await.unwrap_err();
        assert!(err.is_teardown());
        assert!(fixture.holds_container());
        assert!(matches!(fixture.state(), FixtureState::Failed { .. }));

        fixture.stop().await.unwrap();
        assert!(!fixture.holds_container());
        assert_eq!(runtime.running_instances().await, 0);
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let runtime = Arc::new(InMemoryRuntime::new());
        {
            let mut fixture = ContainerFixture::new(runtime.clone(), redis_spec());
            fixture.start().await.unwrap();
        }

        for _ in 0..10 {
            if runtime.running_instances().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.running_instances().await, 0);
    }
}
