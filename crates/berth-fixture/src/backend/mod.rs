//! Container runtime implementations.
//!
//! This module provides the trait the fixture core consumes, a Docker
//! implementation over bollard and an in-memory implementation for tests.

mod docker;
mod memory;
mod release;
mod r#trait;

pub use docker::{DockerRuntime, DockerRuntimeConfig, SESSION_LABEL};
pub use memory::InMemoryRuntime;
pub(crate) use release::spawn_release;
pub use r#trait::{ContainerRuntime, InstanceRef, LaunchRequest, SharedRuntime};
