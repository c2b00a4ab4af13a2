//! Isolated network types.
//!
//! A cluster group attaches all of its members to one dedicated network so
//! that their addresses inside it are stable and discoverable. The addresses
//! are what the services advertise to each other, and therefore what the
//! address translation table is keyed on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Network specification for a fixture group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Name of the network.
    pub name: String,

    /// Network driver (bridge, overlay, etc.).
    pub driver: String,

    /// Whether the network is internal (no external connectivity).
    pub internal: bool,

    /// Network labels.
    pub labels: BTreeMap<String, String>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: "berth-network".to_string(),
            driver: "bridge".to_string(),
            internal: false,
            labels: BTreeMap::new(),
        }
    }
}

impl NetworkSpec {
    /// Creates a new network specification builder.
    pub fn builder(name: impl Into<String>) -> NetworkSpecBuilder {
        NetworkSpecBuilder::new(name)
    }
}

/// Builder for `NetworkSpec`.
#[derive(Debug)]
pub struct NetworkSpecBuilder {
    spec: NetworkSpec,
}

impl NetworkSpecBuilder {
    /// Creates a new builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: NetworkSpec {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Sets the network driver.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.spec.driver = driver.into();
        self
    }

    /// Sets whether the network is internal.
    pub fn internal(mut self, internal: bool) -> Self {
        self.spec.internal = internal;
        self
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    /// Builds the network specification.
    pub fn build(self) -> NetworkSpec {
        self.spec
    }
}

/// Reference to a network created by a container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkRef {
    /// Runtime-assigned identifier.
    pub id: String,

    /// Network name, used when attaching containers.
    pub name: String,
}

impl NetworkRef {
    /// Creates a new network reference.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NetworkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
