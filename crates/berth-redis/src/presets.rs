//! Fixture presets for Redis.
//!
//! Both presets wait for the log line Redis prints once it accepts
//! connections. The cluster preset runs all six nodes of a three-master,
//! three-replica cluster in one `grokzen/redis-cluster` container, one node
//! per port.

use berth_fixture::container::{FixtureSpec, WaitStrategy};
use berth_fixture::SessionConfig;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Image for single-node fixtures.
pub const REDIS_IMAGE: &str = "redis:7-alpine";

/// Port Redis listens on.
pub const REDIS_PORT: u16 = 6379;

/// Image running a complete cluster in one container.
pub const REDIS_CLUSTER_IMAGE: &str = "grokzen/redis-cluster:7.0.10";

/// Ports of the cluster nodes.
pub const REDIS_CLUSTER_PORTS: RangeInclusive<u16> = 7000..=7005;

/// Log line printed once a node accepts connections.
pub const READY_MESSAGE: &str = "Ready to accept connections";

/// A single Redis server.
pub fn redis_single() -> FixtureSpec {
    FixtureSpec::builder(REDIS_IMAGE)
        .name("redis")
        .port(REDIS_PORT)
        .wait_for(WaitStrategy::log_message(READY_MESSAGE))
        .startup_timeout(Duration::from_secs(60))
        .build()
}

/// A six-node Redis cluster in one container.
///
/// Every node logs the ready line, so the fixture waits for all six.
pub fn redis_cluster() -> FixtureSpec {
    let nodes = REDIS_CLUSTER_PORTS.count();

    FixtureSpec::builder(REDIS_CLUSTER_IMAGE)
        .name("redis-cluster")
        .ports(REDIS_CLUSTER_PORTS)
        .wait_for(WaitStrategy::LogMessage {
            message: READY_MESSAGE.to_string(),
            times: nodes,
        })
        .startup_timeout(Duration::from_secs(120))
        .build()
}

/// Session configuration for [`redis_single`].
pub fn single_session() -> SessionConfig {
    SessionConfig::single(&redis_single())
}

/// Session configuration for [`redis_cluster`].
pub fn cluster_session() -> SessionConfig {
    SessionConfig::cluster("redis-cluster", &redis_cluster(), 1)
}
