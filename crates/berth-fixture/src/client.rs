//! Store client interfaces.
//!
//! A session hands the endpoints of its fixtures, and in cluster mode the
//! address translation table, to a [`ClientFactory`]. The factory returns a
//! [`StoreClient`] the test body talks to. The wire protocol lives entirely
//! behind these traits.

use async_trait::async_trait;
use berth_core::{AddressTranslationTable, Endpoint};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{FixtureError, Result};

/// Default bound for establishing a client connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of cluster redirects followed per command.
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// Options passed to [`ClientFactory::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Translation table for cluster mode, `None` for a single node.
    pub translation_table: Option<Arc<AddressTranslationTable>>,

    /// Bound for establishing the connection.
    pub connect_timeout: Duration,

    /// Redirects followed per command before giving up.
    pub max_redirects: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            translation_table: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl ConnectOptions {
    /// Returns true if the client should run in cluster mode.
    pub fn is_cluster(&self) -> bool {
        self.translation_table.is_some()
    }
}

/// Key-value handle used by test code.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Stores `value` under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns the value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Removes `key`. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Closes the connection. Later operations fail.
    async fn close(&self) -> Result<()>;
}

/// Builds [`StoreClient`]s for started fixtures.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// The client type produced.
    type Client: StoreClient;

    /// Connects to the service behind `endpoints`.
    ///
    /// In cluster mode every address a node advertises must be resolved
    /// through `options.translation_table` before it is dialed.
    async fn connect(&self, endpoints: &[Endpoint], options: &ConnectOptions) -> Result<Self::Client>;
}

type Store = Arc<Mutex<BTreeMap<String, String>>>;

/// Client factory backed by in-process maps.
///
/// Data is keyed by the first endpoint a client connects to, so two
/// sessions on different fixtures never share state while clients of the
/// same fixture do.
#[derive(Debug, Default)]
pub struct InMemoryClientFactory {
    stores: Mutex<HashMap<Endpoint, Store>>,
    refuse_connections: AtomicBool,
    failing_close: AtomicBool,
    open_clients: Arc<AtomicUsize>,
}

impl InMemoryClientFactory {
    /// Creates a factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later connection attempt fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes `close` fail on clients connected from now on. The client is
    /// still released.
    pub fn fail_close(&self, fail: bool) {
        self.failing_close.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of clients neither closed nor dropped.
    pub fn open_clients(&self) -> usize {
        self.open_clients.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for InMemoryClientFactory {
    type Client = InMemoryClient;

    async fn connect(&self, endpoints: &[Endpoint], options: &ConnectOptions) -> Result<InMemoryClient> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(FixtureError::client("connection refused"));
        }

        let first = endpoints
            .first()
            .ok_or_else(|| FixtureError::client("no endpoints to connect to"))?;

        if let Some(table) = &options.translation_table {
            let reachable = table.endpoints();
            if let Some(missing) = endpoints.iter().find(|e| !reachable.contains(e)) {
                return Err(FixtureError::client(format!(
                    "endpoint {} is not in the translation table",
                    missing
                )));
            }
        }

        let store = self
            .stores
            .lock()
            .await
            .entry(first.clone())
            .or_default()
            .clone();

        self.open_clients.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryClient {
            endpoint: first.clone(),
            cluster: options.is_cluster(),
            store,
            closed: AtomicBool::new(false),
            fail_close: self.failing_close.load(Ordering::SeqCst),
            open_clients: self.open_clients.clone(),
        })
    }
}

/// Client produced by [`InMemoryClientFactory`].
#[derive(Debug)]
pub struct InMemoryClient {
    endpoint: Endpoint,
    cluster: bool,
    store: Store,
    closed: AtomicBool,
    fail_close: bool,
    open_clients: Arc<AtomicUsize>,
}

impl InMemoryClient {
    /// Returns the endpoint the client connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns true if the client was given a translation table.
    pub fn is_cluster(&self) -> bool {
        self.cluster
    }

    /// Returns true once the client is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(FixtureError::client(format!("connection to {} is closed", self.endpoint)))
        } else {
            Ok(())
        }
    }

    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_clients.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for InMemoryClient {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl StoreClient for InMemoryClient {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.store.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.store.lock().await.remove(key).is_some())
    }

    async fn close(&self) -> Result<()> {
        self.release();
        if self.fail_close {
            return Err(FixtureError::client(format!("error closing connection to {}", self.endpoint)));
        }
        Ok(())
    }
}
