//! Redis client factory.

use async_trait::async_trait;
use berth_core::Endpoint;
use berth_fixture::{ClientFactory, ConnectOptions, FixtureError, Result, StoreClient};

use crate::cluster::ClusterClient;
use crate::single::SingleNodeClient;

/// A connected Redis client, single node or cluster.
#[derive(Debug)]
pub enum RedisClient {
    /// Connected to one server.
    Single(SingleNodeClient),

    /// Connected to a cluster through a translation table.
    Cluster(ClusterClient),
}

impl RedisClient {
    /// Returns true for a cluster client.
    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }
}

#[async_trait]
impl StoreClient for RedisClient {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Self::Single(client) => client.set(key, value).await,
            Self::Cluster(client) => client.set(key, value).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Self::Single(client) => client.get(key).await,
            Self::Cluster(client) => client.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self {
            Self::Single(client) => client.delete(key).await,
            Self::Cluster(client) => client.delete(key).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::Single(client) => client.close().await,
            Self::Cluster(client) => client.close().await,
        }
    }
}

/// Builds [`RedisClient`]s for berth sessions.
///
/// Without a translation table it connects to the first endpoint as a
/// single server; with one it connects as a cluster client.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisClientFactory;

impl RedisClientFactory {
    /// Creates a factory.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientFactory for RedisClientFactory {
    type Client = RedisClient;

    async fn connect(&self, endpoints: &[Endpoint], options: &ConnectOptions) -> Result<RedisClient> {
        match &options.translation_table {
            Some(table) => {
                let client = ClusterClient::connect(
                    endpoints,
                    table.clone(),
                    options.connect_timeout,
                    options.max_redirects,
                )
                .await?;
                Ok(RedisClient::Cluster(client))
            }
            None => {
                let endpoint = endpoints
                    .first()
                    .ok_or_else(|| FixtureError::client("no endpoints to connect to"))?;
                let client = SingleNodeClient::connect(endpoint.clone(), options.connect_timeout).await?;
                Ok(RedisClient::Single(client))
            }
        }
    }
}
