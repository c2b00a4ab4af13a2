//! Fixture specification types.
//!
//! This module provides the image reference, readiness strategy and the
//! [`FixtureSpec`] describing one container fixture.

use berth_core::endpoint::validate_port;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{FixtureError, Result};

/// Container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerImage {
    reference: String,
}

impl ContainerImage {
    /// Creates a new container image from a reference string.
    ///
    /// # Examples
    ///
    /// ```
    /// use berth_fixture::container::ContainerImage;
    ///
    /// let image = ContainerImage::new("redis:7-alpine");
    /// assert_eq!(image.reference(), "redis:7-alpine");
    /// ```
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }

    /// Returns the full image reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the image name without tag or digest.
    pub fn name(&self) -> &str {
        let without_digest = self.reference.split('@').next().unwrap_or(&self.reference);
        // A colon after the last slash is a tag; before it, a registry port.
        match without_digest.rfind(':') {
            Some(idx) if !without_digest[idx..].contains('/') => &without_digest[..idx],
            _ => without_digest,
        }
    }

    /// Returns the image tag if present.
    pub fn tag(&self) -> Option<&str> {
        let without_digest = self.reference.split('@').next()?;
        let idx = without_digest.rfind(':')?;
        let tag = &without_digest[idx + 1..];
        if tag.contains('/') {
            None
        } else {
            Some(tag)
        }
    }

    /// Returns the reference with `:latest` added when no tag or digest is set.
    pub fn pull_reference(&self) -> String {
        if self.tag().is_some() || self.reference.contains('@') {
            self.reference.clone()
        } else {
            format!("{}:latest", self.reference)
        }
    }

    /// Checks that the reference is usable.
    pub fn validate(&self) -> Result<()> {
        if self.reference.trim().is_empty() {
            return Err(FixtureError::validation("image reference is empty"));
        }
        if self.reference.chars().any(char::is_whitespace) {
            return Err(FixtureError::validation(format!(
                "image reference {:?} contains whitespace",
                self.reference
            )));
        }
        Ok(())
    }
}

impl From<&str> for ContainerImage {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContainerImage {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for ContainerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference)
    }
}

/// Image pull policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePullPolicy {
    /// Always pull the image.
    Always,

    /// Pull if not present locally.
    #[default]
    IfNotPresent,

    /// Never pull (image must be present).
    Never,
}

/// How to decide that a started container is ready to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Ready as soon as the runtime reports the container running.
    Running,

    /// Ready once `message` has appeared `times` times in the container log.
    LogMessage {
        /// Substring to look for in stdout or stderr.
        message: String,
        /// Number of occurrences to wait for.
        #[serde(default = "default_times")]
        times: usize,
    },

    /// Ready once the image's own health check reports healthy.
    HealthCheck {
        /// Polling interval in milliseconds.
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },

    /// Ready after a fixed delay.
    Delay {
        /// Delay in milliseconds.
        millis: u64,
    },
}

fn default_times() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::Running
    }
}

impl WaitStrategy {
    /// Waits for a single occurrence of a log line.
    pub fn log_message(message: impl Into<String>) -> Self {
        Self::LogMessage {
            message: message.into(),
            times: 1,
        }
    }

    /// Waits for the health check with the default polling interval.
    pub fn health_check() -> Self {
        Self::HealthCheck {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Returns a short description for logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Running => "container running".to_string(),
            Self::LogMessage { message, times } if *times > 1 => {
                format!("log message {:?} x{}", message, times)
            }
            Self::LogMessage { message, .. } => format!("log message {:?}", message),
            Self::HealthCheck { .. } => "health check".to_string(),
            Self::Delay { millis } => format!("{}ms delay", millis),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::LogMessage { message, times } => {
                if message.is_empty() {
                    return Err(FixtureError::validation("log message to wait for is empty"));
                }
                if *times == 0 {
                    return Err(FixtureError::validation("log message count must be at least 1"));
                }
                Ok(())
            }
            Self::HealthCheck { poll_interval_ms } if *poll_interval_ms == 0 => Err(
                FixtureError::validation("health check poll interval must be positive"),
            ),
            _ => Ok(()),
        }
    }
}

/// Specification of a single container fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSpec {
    /// Fixture name, used for the container name and in logs.
    pub name: String,

    /// The image to run.
    pub image: ContainerImage,

    /// Ports the container listens on, published to the host.
    pub ports: Vec<u16>,

    /// Readiness strategy.
    pub wait: WaitStrategy,

    /// Upper bound for launch plus readiness, in seconds.
    pub startup_timeout_secs: u64,

    /// Environment variables.
    pub environment: BTreeMap<String, String>,

    /// Command override.
    pub command: Option<Vec<String>>,

    /// Labels to apply to the container.
    pub labels: BTreeMap<String, String>,
}

impl FixtureSpec {
    /// Creates a new fixture specification builder.
    pub fn builder(image: impl Into<ContainerImage>) -> FixtureSpecBuilder {
        FixtureSpecBuilder::new(image.into())
    }

    /// Returns the startup timeout.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Returns true if the port is declared.
    pub fn declares(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// Checks the structural preconditions for a launch.
    ///
    /// Failures here are never worth retrying.
    pub fn validate(&self) -> Result<()> {
        self.image.validate()?;

        if self.ports.is_empty() {
            return Err(FixtureError::validation(format!(
                "fixture {} declares no ports",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for &port in &self.ports {
            validate_port(u32::from(port))?;
            if !seen.insert(port) {
                return Err(FixtureError::validation(format!(
                    "fixture {} declares port {} twice",
                    self.name, port
                )));
            }
        }

        if self.startup_timeout_secs == 0 {
            return Err(FixtureError::validation("startup timeout must be positive"));
        }

        self.wait.validate()
    }
}

/// Builder for `FixtureSpec`.
#[derive(Debug)]
pub struct FixtureSpecBuilder {
    spec: FixtureSpec,
}

impl FixtureSpecBuilder {
    /// Creates a new builder with default values.
    pub fn new(image: ContainerImage) -> Self {
        Self {
            spec: FixtureSpec {
                name: default_name(&image),
                image,
                ports: Vec::new(),
                wait: WaitStrategy::default(),
                startup_timeout_secs: 60,
                environment: BTreeMap::new(),
                command: None,
                labels: BTreeMap::new(),
            },
        }
    }

    /// Sets the fixture name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    /// Declares a port.
    pub fn port(mut self, port: u16) -> Self {
        self.spec.ports.push(port);
        self
    }

    /// Declares several ports.
    pub fn ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.spec.ports.extend(ports);
        self
    }

    /// Sets the readiness strategy.
    pub fn wait_for(mut self, wait: WaitStrategy) -> Self {
        self.spec.wait = wait;
        self
    }

    /// Sets the startup timeout.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.spec.startup_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.insert(key.into(), value.into());
        self
    }

    /// Sets the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.spec.command = Some(cmd);
        self
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    /// Builds the specification.
    pub fn build(self) -> FixtureSpec {
        self.spec
    }
}

fn default_name(image: &ContainerImage) -> String {
    image
        .name()
        .rsplit('/')
        .next()
        .unwrap_or("fixture")
        .to_string()
}
