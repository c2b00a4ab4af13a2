//! Cluster fixture groups.
//!
//! A [`ClusterFixtureGroup`] starts the members of one logical cluster on a
//! dedicated network and produces the [`AddressTranslationTable`] clients
//! need to reach them from outside that network. The network strictly
//! encloses the members: it is created before any member starts and removed
//! only after every member has stopped.

use berth_core::{AddressTranslationTable, Endpoint};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::backend::{spawn_release, SharedRuntime};
use crate::container::{ContainerFixture, FixtureSpec, FixtureState, ReadinessRetry};
use crate::error::{FixtureError, Result};
use crate::topology::{NetworkRef, NetworkSpec};

/// How group members are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOrder {
    /// Start all members at once and join before reporting ready.
    #[default]
    Concurrent,

    /// Start members one after another.
    Sequential,
}

/// Specification of a cluster group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Group name, used for the network and member names.
    pub name: String,

    /// Template every member is launched from.
    pub node: FixtureSpec,

    /// Number of members.
    pub node_count: usize,

    /// How members are started.
    pub start_order: StartOrder,
}

impl ClusterSpec {
    /// Creates a spec for `node_count` members launched from `node`.
    pub fn new(name: impl Into<String>, node: FixtureSpec, node_count: usize) -> Self {
        Self {
            name: name.into(),
            node,
            node_count,
            start_order: StartOrder::default(),
        }
    }

    /// Sets the start order.
    pub fn start_order(mut self, order: StartOrder) -> Self {
        self.start_order = order;
        self
    }

    /// Returns the number of translation table entries a started group has.
    pub fn expected_entries(&self) -> usize {
        self.node_count * self.node.ports.len()
    }

    /// Validates the group and its member template.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FixtureError::validation("cluster name is empty"));
        }
        if self.node_count == 0 {
            return Err(FixtureError::validation(format!(
                "cluster {} needs at least one node",
                self.name
            )));
        }
        self.node.validate()
    }

    fn member_spec(&self, index: usize, labels: &BTreeMap<String, String>) -> FixtureSpec {
        let mut spec = self.node.clone();
        spec.name = format!("{}-{}", self.name, index);
        spec.labels.extend(labels.clone());
        spec
    }
}

/// The started members of one logical cluster plus their shared network.
///
/// # Example
///
/// ```ignore
/// let spec = ClusterSpec::new("redis-cluster", node_spec, 1);
/// let mut group = ClusterFixtureGroup::new(runtime, spec);
///
/// let table = group.start().await?;
/// let endpoint = table.resolve_advertised("172.18.0.2:7000")?;
///
/// group.stop().await?;
/// ```
pub struct ClusterFixtureGroup {
    runtime: SharedRuntime,
    spec: ClusterSpec,
    retry: ReadinessRetry,
    labels: BTreeMap<String, String>,
    network: Option<NetworkRef>,
    members: Vec<ContainerFixture>,
    table: Option<AddressTranslationTable>,
}

impl ClusterFixtureGroup {
    /// Creates a group. Nothing is created until [`start`](Self::start).
    pub fn new(runtime: SharedRuntime, spec: ClusterSpec) -> Self {
        Self {
            runtime,
            spec,
            retry: ReadinessRetry::default(),
            labels: BTreeMap::new(),
            network: None,
            members: Vec::new(),
            table: None,
        }
    }

    /// Sets the readiness retry policy for every member.
    pub fn with_readiness_retry(mut self, retry: ReadinessRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Adds a label to the network and every member.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns the group name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Returns the group spec.
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Returns the shared network while it exists.
    pub fn network(&self) -> Option<&NetworkRef> {
        self.network.as_ref()
    }

    /// Returns the members.
    pub fn members(&self) -> &[ContainerFixture] {
        &self.members
    }

    /// Returns the translation table once the group is started.
    pub fn translation_table(&self) -> Option<&AddressTranslationTable> {
        self.table.as_ref()
    }

    /// Returns true once every member is ready.
    pub fn is_started(&self) -> bool {
        self.table.is_some()
    }

    /// Returns the external endpoints of every member, member by member.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let mut endpoints = Vec::new();
        for member in &self.members {
            endpoints.extend(member.endpoints()?);
        }
        Ok(endpoints)
    }

    /// Creates the network, starts every member and builds the table.
    ///
    /// # Errors
    ///
    /// Returns a single [`FixtureError::Launch`] naming the failing member
    /// and the number of pending starts that were aborted. The network and
    /// every started member have been released by then.
    pub async fn start(&mut self) -> Result<AddressTranslationTable> {
        if self.network.is_some() || !self.members.is_empty() {
            return Err(FixtureError::invalid_state_transition("Started", "Starting"));
        }

        if let Err(e) = self.spec.validate() {
            return Err(FixtureError::launch_caused_by(
                format!("cluster {} has an invalid spec", self.spec.name),
                e,
            ));
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut network_spec = NetworkSpec::builder(format!("{}-{}", self.spec.name, &suffix[..8])).build();
        network_spec.labels.extend(self.labels.clone());

        info!(
            cluster = %self.spec.name,
            nodes = self.spec.node_count,
            ports = ?self.spec.node.ports,
            order = ?self.spec.start_order,
            "Starting cluster"
        );

        let network = self
            .runtime
            .create_network(&network_spec)
            .await
            .map_err(|e| FixtureError::launch_caused_by(format!("network for cluster {}", self.spec.name), e))?;
        self.network = Some(network.clone());

        self.members = (0..self.spec.node_count)
            .map(|i| {
                ContainerFixture::new(self.runtime.clone(), self.spec.member_spec(i, &self.labels))
                    .on_network(network.clone())
                    .with_readiness_retry(self.retry)
            })
            .collect();

        if let Err((index, cause)) = self.start_members().await {
            let aborted = self
                .members
                .iter()
                .filter(|m| matches!(m.state(), FixtureState::Created | FixtureState::Starting))
                .count();

            error!(
                cluster = %self.spec.name,
                node = index + 1,
                aborted,
                error = %cause,
                "Cluster member failed to start, rolling back"
            );
            self.rollback().await;

            return Err(FixtureError::launch_caused_by(
                format!(
                    "cluster {}: node {} of {} failed to start ({} pending starts aborted)",
                    self.spec.name,
                    index + 1,
                    self.spec.node_count,
                    aborted
                ),
                cause,
            ));
        }

        let table = match self.build_table(&network) {
            Ok(table) => table,
            Err(e) => {
                error!(cluster = %self.spec.name, error = %e, "Failed to build translation table");
                self.rollback().await;
                return Err(FixtureError::launch_caused_by(
                    format!("translation table for cluster {}", self.spec.name),
                    e,
                ));
            }
        };

        info!(
            cluster = %self.spec.name,
            network = %network,
            entries = table.len(),
            "Cluster ready"
        );

        self.table = Some(table.clone());
        Ok(table)
    }

    /// Stops every member, then removes the network.
    ///
    /// Continues past member failures and always attempts the network
    /// removal. Every failure is logged and reported in the returned
    /// [`FixtureError::Teardown`]; resources that could not be released are
    /// kept so a later call can retry.
    pub async fn stop(&mut self) -> Result<()> {
        let mut errors = Vec::new();

        for member in self.members.iter_mut().rev() {
            if let Err(e) = member.stop().await {
                error!(
                    cluster = %self.spec.name,
                    fixture = %member.name(),
                    error = %e,
                    "Failed to stop cluster member"
                );
                errors.push(e.to_string());
            }
        }

        if let Some(network) = self.network.take() {
            match self.runtime.remove_network(&network).await {
                Ok(()) => debug!(cluster = %self.spec.name, network = %network, "Removed cluster network"),
                Err(e) => {
                    error!(
                        cluster = %self.spec.name,
                        network = %network,
                        error = %e,
                        "Failed to remove cluster network"
                    );
                    errors.push(format!("network {}: {}", network, e));
                    self.network = Some(network);
                }
            }
        }

        self.table = None;

        if errors.is_empty() {
            info!(cluster = %self.spec.name, "Cluster stopped");
            Ok(())
        } else {
            Err(FixtureError::teardown(errors.join("; ")))
        }
    }

    /// Starts members; on failure returns the index of the failing member.
    async fn start_members(&mut self) -> std::result::Result<(), (usize, FixtureError)> {
        match self.spec.start_order {
            StartOrder::Concurrent => {
                // The first failure drops, and so aborts, the pending starts.
                try_join_all(
                    self.members
                        .iter_mut()
                        .enumerate()
                        .map(|(i, member)| async move { member.start().await.map_err(|e| (i, e)) }),
                )
                .await?;
            }
            StartOrder::Sequential => {
                for (i, member) in self.members.iter_mut().enumerate() {
                    member.start().await.map_err(|e| (i, e))?;
                }
            }
        }
        Ok(())
    }

    fn build_table(&self, network: &NetworkRef) -> Result<AddressTranslationTable> {
        let mut entries = Vec::with_capacity(self.spec.expected_entries());
        for member in &self.members {
            for &port in &member.spec().ports {
                entries.push((member.internal_address(network, port)?, member.endpoint(port)?));
            }
        }
        Ok(AddressTranslationTable::build(entries)?)
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.stop().await {
            warn!(cluster = %self.spec.name, error = %e, "Cluster rollback was incomplete");
        }
    }
}

impl fmt::Debug for ClusterFixtureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterFixtureGroup")
            .field("name", &self.spec.name)
            .field("network", &self.network)
            .field("members", &self.members)
            .field("entries", &self.table.as_ref().map(|t| t.len()))
            .finish()
    }
}

impl Drop for ClusterFixtureGroup {
    fn drop(&mut self) {
        let instances: Vec<_> = self
            .members
            .iter_mut()
            .rev()
            .filter_map(|m| m.detach_instance())
            .collect();
        let network = self.network.take();

        if instances.is_empty() && network.is_none() {
            return;
        }

        warn!(
            cluster = %self.spec.name,
            containers = instances.len(),
            "Cluster dropped while holding resources, releasing in background"
        );
        spawn_release(self.runtime.clone(), instances, network);
    }
}
