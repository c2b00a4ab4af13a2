//! Single-node Redis client.

use async_trait::async_trait;
use berth_core::Endpoint;
use berth_fixture::{FixtureError, Result, StoreClient};
use redis::aio::MultiplexedConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::client_error;

/// Opens a multiplexed connection to `endpoint`, bounded by `timeout`.
pub(crate) async fn open_connection(endpoint: &Endpoint, timeout: Duration) -> Result<MultiplexedConnection> {
    let url = endpoint.url("redis");
    let client = redis::Client::open(url.as_str()).map_err(client_error)?;

    match tokio::time::timeout(timeout, client.get_multiplexed_async_connection()).await {
        Ok(connection) => connection.map_err(client_error),
        Err(_) => Err(FixtureError::timeout(format!(
            "connection to {} within {}s",
            endpoint,
            timeout.as_secs()
        ))),
    }
}

/// Client for one Redis server.
pub struct SingleNodeClient {
    endpoint: Endpoint,
    connection: MultiplexedConnection,
    closed: AtomicBool,
}

impl SingleNodeClient {
    /// Connects to the server behind `endpoint`.
    pub async fn connect(endpoint: Endpoint, timeout: Duration) -> Result<Self> {
        let mut connection = open_connection(&endpoint, timeout).await?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(client_error)?;
        debug!(endpoint = %endpoint, reply = %pong, "Connected to Redis");

        Ok(Self {
            endpoint,
            connection,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the endpoint the client is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FixtureError::client(format!("connection to {} is closed", self.endpoint)));
        }
        Ok(self.connection.clone())
    }
}

#[async_trait]
impl StoreClient for SingleNodeClient {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut connection = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut connection)
            .await
            .map_err(client_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(client_error)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(client_error)?;
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, "Closed Redis connection");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SingleNodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleNodeClient")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
