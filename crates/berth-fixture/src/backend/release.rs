//! Background release of resources whose owner was dropped.

use tracing::{debug, warn};

use super::{InstanceRef, SharedRuntime};
use crate::topology::NetworkRef;

/// Releases `instances` in order, then `network`, on the current tokio
/// runtime without blocking the caller.
///
/// Used from `Drop`, where no `.await` is possible. Outside a runtime the
/// resources are left to [`DockerRuntime::reap_session`](super::DockerRuntime::reap_session).
pub(crate) fn spawn_release(runtime: SharedRuntime, instances: Vec<InstanceRef>, network: Option<NetworkRef>) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!(
                containers = instances.len(),
                network = ?network.as_ref().map(|n| n.name.as_str()),
                "No async runtime available, leaking fixture resources"
            );
            return;
        }
    };

    handle.spawn(async move {
        for instance in &instances {
            match runtime.stop(instance).await {
                Ok(()) => debug!(container = %instance, "Released dropped container"),
                Err(e) => warn!(container = %instance, error = %e, "Failed to release dropped container"),
            }
        }

        if let Some(network) = network {
            if let Err(e) = runtime.remove_network(&network).await {
                warn!(network = %network, error = %e, "Failed to remove dropped network");
            }
        }
    });
}
