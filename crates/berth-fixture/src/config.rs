//! Session configuration.
//!
//! Configuration is plain serde data loaded from TOML. Every section has
//! defaults, so a file only needs the values it changes:
//!
//! ```toml
//! mode = "cluster"
//!
//! [fixture]
//! image = "grokzen/redis-cluster:7.0.10"
//! ports = [7000, 7001, 7002, 7003, 7004, 7005]
//! wait = { kind = "log_message", message = "Ready to accept connections" }
//!
//! [cluster]
//! node_count = 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::backend::DockerRuntimeConfig;
use crate::client::{ConnectOptions, DEFAULT_MAX_REDIRECTS};
use crate::container::{FixtureSpec, ImagePullPolicy, ReadinessRetry, WaitStrategy};
use crate::error::{FixtureError, Result};
use crate::topology::{ClusterSpec, StartOrder};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "BERTH_CONFIG";

/// Whether a session runs one fixture or a cluster group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// A single container.
    #[default]
    Single,

    /// A cluster group on a dedicated network.
    Cluster,
}

/// Session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Single or cluster mode.
    pub mode: SessionMode,

    /// The fixture (or cluster member template) to launch.
    pub fixture: FixtureConfig,

    /// Cluster group settings, used in cluster mode.
    pub cluster: ClusterConfig,

    /// Container runtime settings.
    pub runtime: RuntimeConfig,

    /// Client connection settings.
    pub client: ClientConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Fixture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Fixture name. Derived from the image when unset.
    pub name: Option<String>,

    /// Image reference.
    pub image: String,

    /// Ports the service listens on.
    pub ports: Vec<u16>,

    /// Readiness strategy.
    pub wait: WaitStrategy,

    /// Startup timeout in seconds.
    pub startup_timeout_secs: u64,

    /// Environment variables.
    pub environment: BTreeMap<String, String>,

    /// Command override.
    pub command: Option<Vec<String>>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            name: None,
            image: String::new(),
            ports: Vec::new(),
            wait: WaitStrategy::default(),
            startup_timeout_secs: 60,
            environment: BTreeMap::new(),
            command: None,
        }
    }
}

impl FixtureConfig {
    /// Returns the startup timeout as a Duration.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Builds the fixture spec.
    pub fn to_spec(&self) -> FixtureSpec {
        let mut builder = FixtureSpec::builder(self.image.as_str())
            .ports(self.ports.iter().copied())
            .wait_for(self.wait.clone())
            .startup_timeout(self.startup_timeout());

        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        for (key, value) in &self.environment {
            builder = builder.env(key.clone(), value.clone());
        }
        if let Some(command) = &self.command {
            builder = builder.command(command.clone());
        }
        builder.build()
    }
}

impl From<&FixtureSpec> for FixtureConfig {
    fn from(spec: &FixtureSpec) -> Self {
        Self {
            name: Some(spec.name.clone()),
            image: spec.image.reference().to_string(),
            ports: spec.ports.clone(),
            wait: spec.wait.clone(),
            startup_timeout_secs: spec.startup_timeout_secs,
            environment: spec.environment.clone(),
            command: spec.command.clone(),
        }
    }
}

/// Cluster group configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Group name.
    pub name: String,

    /// Number of member containers.
    pub node_count: usize,

    /// How members are started.
    pub start_order: StartOrder,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            node_count: 1,
            start_order: StartOrder::Concurrent,
        }
    }
}

/// Container runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix of the generated session label value.
    pub session_prefix: String,

    /// When to pull images.
    pub pull_policy: ImagePullPolicy,

    /// Grace period before a stopping container is killed, in seconds.
    pub stop_timeout_secs: i64,

    /// Host published ports are reachable on.
    pub host: Option<String>,

    /// Retries for transient readiness failures (0 or 1).
    pub readiness_retries: u32,

    /// Backoff before a readiness retry in milliseconds.
    pub readiness_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_prefix: "berth".to_string(),
            pull_policy: ImagePullPolicy::IfNotPresent,
            stop_timeout_secs: 10,
            host: None,
            readiness_retries: 1,
            readiness_backoff_ms: 500,
        }
    }
}

impl RuntimeConfig {
    /// Returns the readiness backoff as a Duration.
    pub fn readiness_backoff(&self) -> Duration {
        Duration::from_millis(self.readiness_backoff_ms)
    }

    /// Returns the readiness retry policy.
    pub fn readiness_retry(&self) -> ReadinessRetry {
        ReadinessRetry::new(self.readiness_retries, self.readiness_backoff())
    }

    /// Returns the Docker runtime configuration.
    pub fn docker(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            pull_policy: self.pull_policy,
            stop_timeout_secs: self.stop_timeout_secs,
            host: self.host.clone(),
            ..Default::default()
        }
    }
}

/// Client connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Redirects followed per cluster command.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl ClientConfig {
    /// Returns the connect timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns connect options without a translation table.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            translation_table: None,
            connect_timeout: self.connect_timeout(),
            max_redirects: self.max_redirects,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl SessionConfig {
    /// Creates a single-mode configuration for `spec`.
    pub fn single(spec: &FixtureSpec) -> Self {
        Self {
            mode: SessionMode::Single,
            fixture: spec.into(),
            ..Default::default()
        }
    }

    /// Creates a cluster-mode configuration with `node_count` members.
    pub fn cluster(name: impl Into<String>, spec: &FixtureSpec, node_count: usize) -> Self {
        Self {
            mode: SessionMode::Cluster,
            fixture: spec.into(),
            cluster: ClusterConfig {
                name: name.into(),
                node_count,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FixtureError::configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Loads the file named by `BERTH_CONFIG` if set, otherwise uses
    /// `fallback`. The result is validated either way.
    pub fn from_env_or(fallback: SessionConfig) -> Result<Self> {
        let config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => fallback,
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns the cluster group spec for cluster mode.
    pub fn cluster_spec(&self) -> ClusterSpec {
        ClusterSpec::new(self.cluster.name.clone(), self.fixture.to_spec(), self.cluster.node_count)
            .start_order(self.cluster.start_order)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(FixtureError::configuration(format!(
                "invalid log level: {}",
                self.logging.level
            )));
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(FixtureError::configuration(format!(
                "invalid log format: {}",
                self.logging.format
            )));
        }

        if self.runtime.session_prefix.trim().is_empty() {
            return Err(FixtureError::configuration("runtime.session_prefix is empty"));
        }
        if self.runtime.readiness_retries > 1 {
            return Err(FixtureError::configuration(format!(
                "runtime.readiness_retries must be 0 or 1, got {}",
                self.runtime.readiness_retries
            )));
        }
        if self.client.connect_timeout_secs == 0 {
            return Err(FixtureError::configuration("client.connect_timeout_secs must be positive"));
        }
        if self.client.max_redirects == 0 {
            return Err(FixtureError::configuration("client.max_redirects must be positive"));
        }

        let check = match self.mode {
            SessionMode::Single => self.fixture.to_spec().validate(),
            SessionMode::Cluster => self.cluster_spec().validate(),
        };
        check.map_err(|e| FixtureError::configuration(e.to_string()))
    }
}
