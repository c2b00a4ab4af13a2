//! Error types for endpoint construction and address translation.

use thiserror::Error;

use crate::endpoint::Endpoint;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the core value types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Port outside 1-65535.
    #[error("invalid port: {0}")]
    InvalidPort(u32),

    /// Host is empty or contains whitespace.
    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    /// Address could not be parsed as `ip:port`.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The offending input.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The same internal address was mapped to two different endpoints.
    #[error("duplicate internal address {address}: already mapped to {existing}, refusing {conflicting}")]
    DuplicateKey {
        /// The internal address seen twice.
        address: String,
        /// The endpoint recorded first.
        existing: Endpoint,
        /// The endpoint that conflicted with it.
        conflicting: Endpoint,
    },

    /// No entry was registered for the address.
    #[error("unknown internal address: {0}")]
    UnknownAddress(String),
}

impl CoreError {
    /// Creates an invalid address error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unknown address error.
    pub fn unknown_address(address: impl Into<String>) -> Self {
        Self::UnknownAddress(address.into())
    }

    /// Returns true if the error comes from inconsistent translation input.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }

    /// Returns true if a lookup missed.
    pub fn is_unknown_address(&self) -> bool {
        matches!(self, Self::UnknownAddress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::unknown_address("10.0.0.1:7000");
        assert_eq!(err.to_string(), "unknown internal address: 10.0.0.1:7000");

        let err = CoreError::InvalidPort(0);
        assert_eq!(err.to_string(), "invalid port: 0");
    }

    #[test]
    fn test_error_predicates() {
        let err = CoreError::DuplicateKey {
            address: "10.0.0.1:7000".to_string(),
            existing: Endpoint::new("localhost", 1000).unwrap(),
            conflicting: Endpoint::new("localhost", 1001).unwrap(),
        };
        assert!(err.is_duplicate_key());
        assert!(!err.is_unknown_address());
        assert!(err.to_string().contains("localhost:1001"));
    }
}
