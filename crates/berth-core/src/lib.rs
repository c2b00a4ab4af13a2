//! Berth Core - shared types for container-backed test fixtures.
//!
//! This crate provides the small set of value types that flow between the
//! fixture manager and the clients built on top of it:
//!
//! - [`endpoint`]: externally reachable [`Endpoint`]s and the
//!   [`InternalAddress`] keys services advertise inside an isolated network
//! - [`translation`]: the [`AddressTranslationTable`] mapping one to the other
//! - [`error`]: error types for constructing and querying these values
//!
//! # Example
//!
//! ```
//! use berth_core::{AddressTranslationTable, Endpoint, InternalAddress};
//!
//! let internal: InternalAddress = "172.18.0.2:7000".parse().unwrap();
//! let external = Endpoint::new("localhost", 55305).unwrap();
//!
//! let table = AddressTranslationTable::build([(internal.clone(), external.clone())]).unwrap();
//! assert_eq!(table.resolve(&internal).unwrap(), &external);
//! ```

pub mod endpoint;
pub mod error;
pub mod translation;

pub use endpoint::{Endpoint, InternalAddress};
pub use error::{CoreError, Result};
pub use translation::AddressTranslationTable;
