//! Cluster topology: isolated networks and fixture groups.

mod group;
mod network;

pub use group::{ClusterFixtureGroup, ClusterSpec, StartOrder};
pub use network::{NetworkRef, NetworkSpec, NetworkSpecBuilder};
