//! Mapping of Redis errors onto fixture errors.

use berth_fixture::FixtureError;
use redis::{ErrorKind, RedisError};

/// Converts a Redis error into a client error.
///
/// I/O failures keep their kind so callers can tell a dropped connection
/// from a rejected command.
pub fn client_error(err: RedisError) -> FixtureError {
    if err.is_io_error() {
        let kind = if err.is_timeout() {
            std::io::ErrorKind::TimedOut
        } else {
            std::io::ErrorKind::ConnectionReset
        };
        return FixtureError::Io(std::io::Error::new(kind, err.to_string()));
    }
    FixtureError::client(err.to_string())
}

/// A cluster redirect extracted from a `MOVED` or `ASK` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Address the node advertised, as seen inside the cluster network.
    pub address: String,

    /// Hash slot the key belongs to.
    pub slot: u16,

    /// True for `ASK`, which needs `ASKING` before the retried command.
    pub ask: bool,
}

impl Redirect {
    /// Returns the redirect carried by `err`, if any.
    pub fn from_error(err: &RedisError) -> Option<Self> {
        let ask = match err.kind() {
            ErrorKind::Moved => false,
            ErrorKind::Ask => true,
            _ => return None,
        };
        let (address, slot) = err.redirect_node()?;
        Some(Self {
            address: address.to_string(),
            slot,
            ask,
        })
    }
}
