//! Redis Cluster client for fixtures behind address translation.
//!
//! Cluster nodes advertise the addresses they have inside the fixture
//! network, which are not reachable from the test process. This client sends
//! each command to a known node and, when the cluster answers with `MOVED` or
//! `ASK`, translates the advertised address through the
//! [`AddressTranslationTable`] before dialing it. Key hashing stays with the
//! server.

use async_trait::async_trait;
use berth_core::{AddressTranslationTable, Endpoint};
use berth_fixture::{FixtureError, Result, StoreClient};
use redis::aio::MultiplexedConnection;
use redis::{Cmd, FromRedisValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{client_error, Redirect};
use crate::single::open_connection;

/// Returns the advertised `ip:port@bus` address of every connected node in
/// a `CLUSTER NODES` reply.
pub(crate) fn advertised_nodes(cluster_nodes: &str) -> Vec<&str> {
    cluster_nodes
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| field.split(',').next().unwrap_or(field))
        .filter(|address| !address.starts_with(':') && !address.contains(":0@"))
        .collect()
}

/// Client for a Redis Cluster reached through a translation table.
pub struct ClusterClient {
    table: Arc<AddressTranslationTable>,
    entry: Endpoint,
    connect_timeout: Duration,
    max_redirects: u32,
    connections: Mutex<HashMap<Endpoint, MultiplexedConnection>>,
    closed: AtomicBool,
}

impl ClusterClient {
    /// Connects to the cluster through the first reachable seed endpoint.
    ///
    /// Every node the cluster advertises must have an entry in `table`.
    pub async fn connect(
        seeds: &[Endpoint],
        table: Arc<AddressTranslationTable>,
        connect_timeout: Duration,
        max_redirects: u32,
    ) -> Result<Self> {
        let mut last_error = None;

        for seed in seeds {
            match open_connection(seed, connect_timeout).await {
                Ok(connection) => {
                    let client = Self {
                        table,
                        entry: seed.clone(),
                        connect_timeout,
                        max_redirects,
                        connections: Mutex::new(HashMap::from([(seed.clone(), connection)])),
                        closed: AtomicBool::new(false),
                    };
                    client.verify_topology().await?;
                    return Ok(client);
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Cluster seed unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FixtureError::client("no cluster seeds given")))
    }

    /// Returns the translation table.
    pub fn translation_table(&self) -> &AddressTranslationTable {
        &self.table
    }

    /// Checks that every advertised node is reachable through the table.
    async fn verify_topology(&self) -> Result<()> {
        let mut connection = self.connection(&self.entry).await?;
        let nodes: String = redis::cmd("CLUSTER")
            .arg("NODES")
            .query_async(&mut connection)
            .await
            .map_err(client_error)?;

        let advertised = advertised_nodes(&nodes);
        for address in &advertised {
            let endpoint = self.table.resolve_advertised(address)?;
            debug!(advertised = %address, endpoint = %endpoint, "Cluster node translated");
        }

        info!(
            entry = %self.entry,
            nodes = advertised.len(),
            "Connected to Redis cluster"
        );
        Ok(())
    }

    async fn connection(&self, endpoint: &Endpoint) -> Result<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FixtureError::client("cluster connection is closed"));
        }

        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(endpoint) {
            return Ok(connection.clone());
        }

        let connection = open_connection(endpoint, self.connect_timeout).await?;
        connections.insert(endpoint.clone(), connection.clone());
        Ok(connection)
    }

    /// Runs `cmd`, following at most `max_redirects` redirects.
    async fn execute<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut target = self.entry.clone();
        let mut asking = false;

        for _ in 0..=self.max_redirects {
            let mut connection = self.connection(&target).await?;

            let result = if asking {
                let mut pipe = redis::pipe();
                pipe.cmd("ASKING").ignore().add_command(cmd.clone());
                pipe.query_async(&mut connection).await.map(|(value,): (T,)| value)
            } else {
                cmd.query_async(&mut connection).await
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(redirect) = Redirect::from_error(&err) else {
                return Err(client_error(err));
            };

            let next = self.table.resolve_advertised(&redirect.address)?.clone();
            debug!(
                slot = redirect.slot,
                advertised = %redirect.address,
                endpoint = %next,
                ask = redirect.ask,
                "Following cluster redirect"
            );
            target = next;
            asking = redirect.ask;
        }

        Err(FixtureError::client(format!(
            "gave up after {} cluster redirects",
            self.max_redirects
        )))
    }
}

#[async_trait]
impl StoreClient for ClusterClient {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.execute(&cmd).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.execute(&cmd).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self.execute(&cmd).await?;
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut connections = self.connections.lock().await;
            info!(connections = connections.len(), "Closed Redis cluster connections");
            connections.clear();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("entry", &self.entry)
            .field("nodes", &self.table.len())
            .field("max_redirects", &self.max_redirects)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
