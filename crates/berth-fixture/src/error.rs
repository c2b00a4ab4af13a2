//! Error types for the fixture crate.
//!
//! Acquisition failures (`start`, `open`) surface as [`FixtureError::Launch`]
//! with the underlying cause chained as the error source. Release failures
//! surface as [`FixtureError::Teardown`] and are logged rather than
//! propagated past a session's `close`.

use berth_core::CoreError;
use thiserror::Error;

/// Result type for fixture operations.
pub type Result<T> = std::result::Result<T, FixtureError>;

/// Errors that can occur while managing fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// A container, network or group failed to start or become ready.
    #[error("launch failed: {reason}")]
    Launch {
        /// What failed to launch.
        reason: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<FixtureError>>,
    },

    /// Operation needs a fixture in the Ready state.
    #[error("fixture {fixture} is not started (state: {state})")]
    NotStarted {
        /// Fixture name.
        fixture: String,
        /// Current state.
        state: String,
    },

    /// The fixture is not attached to the requested network.
    #[error("fixture {fixture} is not attached to network {network}")]
    NoNetwork {
        /// Fixture name.
        fixture: String,
        /// The network that was asked for.
        network: String,
    },

    /// The port was not declared on the fixture.
    #[error("port {port} is not declared on fixture {fixture}")]
    UndeclaredPort {
        /// Fixture name.
        fixture: String,
        /// The port that was asked for.
        port: u16,
    },

    /// Best-effort release failed.
    #[error("teardown failed: {0}")]
    Teardown(String),

    /// Timeout waiting for a condition.
    #[error("timeout waiting for {condition}")]
    Timeout {
        /// The condition that timed out.
        condition: String,
    },

    /// The fixture lifecycle does not allow this transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// The starting state.
        from: String,
        /// The target state.
        to: String,
    },

    /// The container runtime reported a failure.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The store client reported a failure.
    #[error("client error: {0}")]
    Client(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),

    /// Endpoint or address translation error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Docker API error.
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixtureError {
    /// Creates a launch error without an underlying cause.
    pub fn launch(reason: impl Into<String>) -> Self {
        Self::Launch {
            reason: reason.into(),
            source: None,
        }
    }

    /// Creates a launch error caused by `source`.
    pub fn launch_caused_by(reason: impl Into<String>, source: FixtureError) -> Self {
        Self::Launch {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a not started error.
    pub fn not_started(fixture: impl Into<String>, state: impl ToString) -> Self {
        Self::NotStarted {
            fixture: fixture.into(),
            state: state.to_string(),
        }
    }

    /// Creates a no network error.
    pub fn no_network(fixture: impl Into<String>, network: impl Into<String>) -> Self {
        Self::NoNetwork {
            fixture: fixture.into(),
            network: network.into(),
        }
    }

    /// Creates a teardown error.
    pub fn teardown(reason: impl Into<String>) -> Self {
        Self::Teardown(reason.into())
    }

    /// Creates a timeout error.
    pub fn timeout(condition: impl Into<String>) -> Self {
        Self::Timeout {
            condition: condition.into(),
        }
    }

    /// Creates an invalid state transition error.
    pub fn invalid_state_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates a runtime error.
    pub fn runtime(reason: impl Into<String>) -> Self {
        Self::Runtime(reason.into())
    }

    /// Creates a client error.
    pub fn client(reason: impl Into<String>) -> Self {
        Self::Client(reason.into())
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Creates a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Returns true if this is a launch error.
    pub fn is_launch(&self) -> bool {
        matches!(self, Self::Launch { .. })
    }

    /// Returns true if this is a teardown error.
    pub fn is_teardown(&self) -> bool {
        matches!(self, Self::Teardown(_))
    }

    /// Returns true for transient transport failures worth one more try.
    ///
    /// Timeouts and structural failures (bad image, invalid port, refused
    /// launch) are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DockerApi(_) | Self::Io(_))
    }

    /// Walks the source chain and returns the innermost fixture error.
    pub fn root_cause(&self) -> &FixtureError {
        let mut current = self;
        while let Self::Launch {
            source: Some(inner),
            ..
        } = current
        {
            current = inner.as_ref();
        }
        current
    }
}

impl From<toml::de::Error> for FixtureError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}
