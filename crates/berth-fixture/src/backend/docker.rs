//! Docker runtime implementation.
//!
//! This module provides a container runtime that talks to the Docker daemon
//! directly via bollard. Every network and container it creates carries the
//! `berth.project` label plus whatever labels the request brings, normally
//! including the `berth.session` label of the owning session.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::NetworkCreateResponse;
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::r#trait::{ContainerRuntime, InstanceRef, LaunchRequest};
use crate::container::{ImagePullPolicy, WaitStrategy};
use crate::error::{FixtureError, Result};
use crate::topology::{NetworkRef, NetworkSpec};

/// Label carrying the session identifier on every created resource.
pub const SESSION_LABEL: &str = "berth.session";

/// Label carrying the project name on every created resource.
const PROJECT_LABEL: &str = "berth.project";

/// Interval between inspections while waiting for a container to run.
const RUNNING_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for the Docker runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerRuntimeConfig {
    /// Project name applied as a label to all resources.
    pub project_name: String,

    /// When to pull images before launching.
    pub pull_policy: ImagePullPolicy,

    /// Grace period before a stopping container is killed, in seconds.
    pub stop_timeout_secs: i64,

    /// Host on which published ports are reachable.
    ///
    /// Derived from `DOCKER_HOST` when unset.
    pub host: Option<String>,

    /// Additional labels to apply to all resources.
    pub labels: BTreeMap<String, String>,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            project_name: "berth".to_string(),
            pull_policy: ImagePullPolicy::IfNotPresent,
            stop_timeout_secs: 10,
            host: None,
            labels: BTreeMap::new(),
        }
    }
}

impl DockerRuntimeConfig {
    /// Returns the host published ports are reachable on.
    pub fn published_host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => host_from_docker_host(std::env::var("DOCKER_HOST").ok().as_deref()),
        }
    }
}

/// Extracts the daemon host from a `DOCKER_HOST` value.
///
/// Socket and pipe transports publish on the local machine.
fn host_from_docker_host(docker_host: Option<&str>) -> String {
    const LOCAL: &str = "127.0.0.1";

    let Some(value) = docker_host else {
        return LOCAL.to_string();
    };

    let Some((scheme, rest)) = value.split_once("://") else {
        return LOCAL.to_string();
    };

    if !matches!(scheme, "tcp" | "http" | "https") {
        return LOCAL.to_string();
    }

    let authority = rest.split('/').next().unwrap_or_default();
    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority)
    };

    if host.is_empty() {
        LOCAL.to_string()
    } else {
        host.to_string()
    }
}

/// Returns the id of a created network; the daemon may omit it.
fn created_network_id(response: NetworkCreateResponse, name: &str) -> Result<String> {
    response
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| FixtureError::runtime(format!("network {} was created without an ID", name)))
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Docker container runtime.
pub struct DockerRuntime {
    /// Docker client.
    docker: Docker,

    /// Runtime configuration.
    config: DockerRuntimeConfig,

    /// Host on which published ports are reachable.
    host: String,
}

impl DockerRuntime {
    /// Creates a new Docker runtime with default configuration.
    pub async fn new() -> Result<Self> {
        Self::with_config(DockerRuntimeConfig::default()).await
    }

    /// Creates a new Docker runtime with the given configuration.
    pub async fn with_config(config: DockerRuntimeConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;

        // Verify connection
        docker.ping().await?;

        let host = config.published_host();
        info!(
            project = %config.project_name,
            host = %host,
            "Connected to Docker daemon"
        );

        Ok(Self { docker, config, host })
    }

    /// Returns the runtime configuration.
    pub fn config(&self) -> &DockerRuntimeConfig {
        &self.config
    }

    /// Removes every container and network labelled with `session`.
    ///
    /// Returns the number of resources removed. Used to clean up after a
    /// process that died before its fixtures were released.
    pub async fn reap_session(&self, session: &str) -> Result<usize> {
        let filters: HashMap<String, Vec<String>> = [(
            "label".to_string(),
            vec![format!("{}={}", SESSION_LABEL, session)],
        )]
        .into_iter()
        .collect();

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: filters.clone(),
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        let mut errors = Vec::new();

        for container in containers {
            let Some(id) = container.id else { continue };
            match self.remove_container(&id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    error!(container = %id, error = %e, "Failed to reap container");
                    errors.push(e.to_string());
                }
            }
        }

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;

        for network in networks {
            let Some(id) = network.id else { continue };
            match self.docker.remove_network(&id).await {
                Ok(()) => removed += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    error!(network = %id, error = %e, "Failed to reap network");
                    errors.push(e.to_string());
                }
            }
        }

        info!(session = %session, removed, "Reaped session resources");

        if errors.is_empty() {
            Ok(removed)
        } else {
            Err(FixtureError::teardown(errors.join("; ")))
        }
    }

    fn labels(&self, extra: &BTreeMap<String, String>) -> HashMap<String, String> {
        let mut labels: HashMap<String, String> = self.config.labels.clone().into_iter().collect();
        labels.extend(extra.clone());
        labels.insert(PROJECT_LABEL.to_string(), self.config.project_name.clone());
        labels
    }

    /// Makes the image available according to the pull policy.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.config.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => match self.docker.inspect_image(image).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => self.pull_image(image).await,
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Pulls an image.
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(FixtureError::runtime(format!("failed to pull image {}: {}", image, e)));
                }
            }
        }

        Ok(())
    }

    /// Stops and removes a container, tolerating one that is already gone.
    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let stop_options = StopContainerOptions {
            t: self.config.stop_timeout_secs,
        };
        if let Err(e) = self.docker.stop_container(container_id, Some(stop_options)).await {
            if !is_not_found(&e) {
                warn!(container = %container_id, error = %e, "Failed to stop container");
            }
        }

        let remove_options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(container_id, Some(remove_options)).await {
            Ok(()) => {
                info!(container = %container_id, "Removed container");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fails if the container is no longer running.
    async fn ensure_running(&self, instance: &InstanceRef) -> Result<bool> {
        let inspect = self.docker.inspect_container(&instance.id, None).await?;
        let Some(state) = inspect.state else {
            return Ok(false);
        };

        if state.running == Some(true) {
            return Ok(true);
        }

        match state.status {
            Some(bollard::secret::ContainerStateStatusEnum::EXITED)
            | Some(bollard::secret::ContainerStateStatusEnum::DEAD) => Err(FixtureError::launch(format!(
                "container {} exited with code {} before becoming ready",
                instance,
                state.exit_code.unwrap_or(-1)
            ))),
            _ => Ok(false),
        }
    }

    async fn wait_for_running(&self, instance: &InstanceRef) -> Result<()> {
        while !self.ensure_running(instance).await? {
            tokio::time::sleep(RUNNING_POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Follows the container log until `message` has appeared `times` times.
    async fn wait_for_log(&self, instance: &InstanceRef, message: &str, times: usize) -> Result<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(&instance.id, Some(options));
        let mut pending = String::new();
        let mut seen = 0;

        while let Some(result) = stream.next().await {
            let chunk = result?;
            pending.push_str(&chunk.to_string());

            while let Some(newline) = pending.find('\n') {
                if pending[..newline].contains(message) {
                    seen += 1;
                }
                pending.drain(..=newline);
            }

            if seen >= times {
                return Ok(());
            }
        }

        if pending.contains(message) && seen + 1 >= times {
            return Ok(());
        }

        Err(FixtureError::launch(format!(
            "container {} exited after logging {:?} {} of {} times",
            instance, message, seen, times
        )))
    }

    /// Polls the image's health check.
    async fn wait_for_healthy(&self, instance: &InstanceRef, poll_interval: Duration) -> Result<()> {
        loop {
            self.ensure_running(instance).await?;
            let inspect = self.docker.inspect_container(&instance.id, None).await?;

            if let Some(state) = inspect.state {
                match state.health.and_then(|h| h.status) {
                    Some(bollard::secret::HealthStatusEnum::HEALTHY) => return Ok(()),
                    Some(bollard::secret::HealthStatusEnum::UNHEALTHY) => {
                        return Err(FixtureError::launch(format!("container {} is unhealthy", instance)));
                    }
                    Some(bollard::secret::HealthStatusEnum::NONE) | None => {
                        return Err(FixtureError::validation(format!(
                            "container {} has no health check",
                            instance
                        )));
                    }
                    _ => {}
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("config", &self.config)
            .field("host", &self.host)
            .finish()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkRef> {
        let labels_owned = self.labels(&spec.labels);

        // Convert to &str HashMap as required by bollard API
        let labels: HashMap<&str, &str> = labels_owned
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let config = CreateNetworkOptions {
            name: spec.name.as_str(),
            driver: spec.driver.as_str(),
            internal: spec.internal,
            labels,
            ..Default::default()
        };

        let response = self.docker.create_network(config).await?;

        let id = created_network_id(response, &spec.name)?;
        info!(network = %spec.name, id = %id, "Created network");
        Ok(NetworkRef::new(id, spec.name.clone()))
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<InstanceRef> {
        let image = request.image.pull_reference();
        self.ensure_image(&image).await?;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = request
            .ports
            .iter()
            .map(|p| (format!("{}/tcp", p), HashMap::new()))
            .collect();

        // No host port: the daemon picks an ephemeral one.
        let port_bindings: HashMap<String, Option<Vec<bollard::service::PortBinding>>> = request
            .ports
            .iter()
            .map(|p| {
                let binding = bollard::service::PortBinding {
                    host_ip: None,
                    host_port: None,
                };
                (format!("{}/tcp", p), Some(vec![binding]))
            })
            .collect();

        let host_config = bollard::service::HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: request.network.as_ref().map(|n| n.name.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.clone()),
            env: Some(request.env_pairs()),
            labels: Some(self.labels(&request.labels)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            cmd: request.command.clone(),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.as_str(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        let instance = InstanceRef::new(response.id, request.name.clone());

        info!(container = %instance, image = %image, "Created container");

        if let Err(e) = self
            .docker
            .start_container(&instance.id, None::<StartContainerOptions<String>>)
            .await
        {
            error!(container = %instance, error = %e, "Failed to start container");
            if let Err(cleanup) = self.remove_container(&instance.id).await {
                warn!(container = %instance, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }

        info!(container = %instance, "Started container");
        Ok(instance)
    }

    async fn wait_until_ready(&self, instance: &InstanceRef, strategy: &WaitStrategy) -> Result<()> {
        match strategy {
            WaitStrategy::Running => self.wait_for_running(instance).await,
            WaitStrategy::LogMessage { message, times } => self.wait_for_log(instance, message, *times).await,
            WaitStrategy::HealthCheck { poll_interval_ms } => {
                self.wait_for_healthy(instance, Duration::from_millis(*poll_interval_ms))
                    .await
            }
            WaitStrategy::Delay { millis } => {
                self.wait_for_running(instance).await?;
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                Ok(())
            }
        }
    }

    async fn instance_host(&self, _instance: &InstanceRef) -> Result<String> {
        Ok(self.host.clone())
    }

    async fn mapped_port(&self, instance: &InstanceRef, port: u16) -> Result<u16> {
        let inspect = self.docker.inspect_container(&instance.id, None).await?;
        let key = format!("{}/tcp", port);

        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .into_iter()
            .flatten()
            .find_map(|binding| binding.host_port.and_then(|p| p.parse::<u16>().ok()))
            .ok_or_else(|| FixtureError::runtime(format!("port {} of {} is not published", port, instance)))
    }

    async fn instance_ip_address(&self, instance: &InstanceRef, network: &NetworkRef) -> Result<IpAddr> {
        let inspect = self.docker.inspect_container(&instance.id, None).await?;

        let address = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(&network.name))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| FixtureError::no_network(&instance.name, &network.name))?;

        address
            .parse()
            .map_err(|_| FixtureError::runtime(format!("container {} reported invalid address {:?}", instance, address)))
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<()> {
        self.remove_container(&instance.id).await
    }

    async fn remove_network(&self, network: &NetworkRef) -> Result<()> {
        match self.docker.remove_network(&network.id).await {
            Ok(()) => {
                info!(network = %network, "Removed network");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_ready(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_docker_host() {
        assert_eq!(host_from_docker_host(None), "127.0.0.1");
        assert_eq!(host_from_docker_host(Some("unix:///var/run/docker.sock")), "127.0.0.1");
        assert_eq!(host_from_docker_host(Some("tcp://10.0.0.5:2375")), "10.0.0.5");
        assert_eq!(host_from_docker_host(Some("tcp://docker-host:2376/")), "docker-host");
        assert_eq!(host_from_docker_host(Some("tcp://[::1]:2375")), "::1");
        assert_eq!(host_from_docker_host(Some("npipe:////./pipe/docker_engine")), "127.0.0.1");
        assert_eq!(host_from_docker_host(Some("garbage")), "127.0.0.1");
    }

    #[test]
    fn test_config_defaults() {
        let config = DockerRuntimeConfig::default();
        assert_eq!(config.project_name, "berth");
        assert_eq!(config.pull_policy, ImagePullPolicy::IfNotPresent);
        assert_eq!(config.stop_timeout_secs, 10);

        let config = DockerRuntimeConfig {
            host: Some("docker.internal".to_string()),
            ..Default::default()
        };
        assert_eq!(config.published_host(), "docker.internal");
    }

    #[test]
    fn test_created_network_id() {
        let response = NetworkCreateResponse {
            id: Some("f2de39df4171".to_string()),
            ..Default::default()
        };
        assert_eq!(created_network_id(response, "redis-net").unwrap(), "f2de39df4171");

        let missing = NetworkCreateResponse::default();
        assert!(matches!(
            created_network_id(missing, "redis-net"),
            Err(FixtureError::Runtime(_))
        ));

        let empty = NetworkCreateResponse {
            id: Some(String::new()),
            ..Default::default()
        };
        assert!(created_network_id(empty, "redis-net").is_err());
    }

    #[test]
    fn test_not_found_detection() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_not_found(&err));

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(!is_not_found(&err));
    }
}
