//! Address translation between an isolated network and the host.
//!
//! Services running inside an isolated container network advertise their
//! *internal* addresses to each other (for example during cluster topology
//! exchange). A client dialing from outside that network has to be redirected
//! to the *external* mapped endpoint for every internal address it runs into.
//! [`AddressTranslationTable`] holds that mapping. It is built once per
//! fixture group, before any client connects, and never changes afterwards.

use serde::Serialize;
use std::collections::btree_map::{BTreeMap, Entry};
use std::collections::BTreeSet;

use crate::endpoint::{Endpoint, InternalAddress};
use crate::error::{CoreError, Result};

/// Immutable mapping from [`InternalAddress`] to [`Endpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressTranslationTable {
    entries: BTreeMap<InternalAddress, Endpoint>,
}

impl AddressTranslationTable {
    /// Builds a table from `(internal, external)` pairs.
    ///
    /// The same pair appearing twice is accepted. The same internal address
    /// mapped to two different endpoints is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateKey`] on a conflicting entry.
    pub fn build<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (InternalAddress, Endpoint)>,
    {
        let mut map = BTreeMap::new();

        for (internal, external) in entries {
            match map.entry(internal) {
                Entry::Vacant(slot) => {
                    slot.insert(external);
                }
                Entry::Occupied(slot) => {
                    if slot.get() != &external {
                        return Err(CoreError::DuplicateKey {
                            address: slot.key().to_string(),
                            existing: slot.get().clone(),
                            conflicting: external,
                        });
                    }
                }
            }
        }

        Ok(Self { entries: map })
    }

    /// Resolves an internal address to the endpoint reachable from the host.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownAddress`] if the address was never registered.
    pub fn resolve(&self, address: &InternalAddress) -> Result<&Endpoint> {
        self.entries
            .get(address)
            .ok_or_else(|| CoreError::unknown_address(address.to_string()))
    }

    /// Parses an address as advertised by a service (`ip:port`, optionally
    /// followed by `@busport`) and resolves it.
    pub fn resolve_advertised(&self, advertised: &str) -> Result<&Endpoint> {
        let address: InternalAddress = advertised.parse()?;
        self.resolve(&address)
    }

    /// Returns true if the address has an entry.
    pub fn contains(&self, address: &InternalAddress) -> bool {
        self.entries.contains_key(address)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in internal address order.
    pub fn iter(&self) -> impl Iterator<Item = (&InternalAddress, &Endpoint)> {
        self.entries.iter()
    }

    /// Returns the distinct external endpoints, sorted.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.entries
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl<'a> IntoIterator for &'a AddressTranslationTable {
    type Item = (&'a InternalAddress, &'a Endpoint);
    type IntoIter = std::collections::btree_map::Iter<'a, InternalAddress, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn internal(last_octet: u8, port: u16) -> InternalAddress {
        InternalAddress::new(IpAddr::V4(Ipv4Addr::new(172, 18, 0, last_octet)), port).unwrap()
    }

    fn external(port: u16) -> Endpoint {
        Endpoint::new("localhost", port).unwrap()
    }

    #[test]
    fn test_build_and_resolve() {
        let table = AddressTranslationTable::build(vec![
            (internal(2, 7000), external(55305)),
            (internal(2, 7001), external(55306)),
        ])
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve(&internal(2, 7000)).unwrap(), &external(55305));
        assert_eq!(
            table.resolve_advertised("172.18.0.2:7001@17001").unwrap(),
            &external(55306)
        );
    }

    #[test]
    fn test_identical_duplicate_is_tolerated() {
        let table = AddressTranslationTable::build(vec![
            (internal(2, 7000), external(55305)),
            (internal(2, 7000), external(55305)),
        ])
        .unwrap();

        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_conflicting_duplicate_is_rejected() {
        let err = AddressTranslationTable::build(vec![
            (internal(2, 7000), external(55305)),
            (internal(2, 7000), external(55306)),
        ])
        .unwrap_err();

        match err {
            CoreError::DuplicateKey {
                address,
                existing,
                conflicting,
            } => {
                assert_eq!(address, "172.18.0.2:7000");
                assert_eq!(existing, external(55305));
                assert_eq!(conflicting, external(55306));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_address() {
        let table = AddressTranslationTable::build(vec![(internal(2, 7000), external(55305))]).unwrap();

        let err = table.resolve(&internal(3, 7000)).unwrap_err();
        assert!(err.is_unknown_address());
        assert!(!table.contains(&internal(3, 7000)));

        let err = table.resolve_advertised("not-an-address").unwrap_err();
        assert!(matches!(err, CoreError::InvalidAddress { .. }));
    }

    #[test]
    fn test_endpoints_are_deduplicated() {
        let table = AddressTranslationTable::build(vec![
            (internal(2, 7001), external(55306)),
            (internal(3, 7001), external(55306)),
            (internal(2, 7000), external(55305)),
        ])
        .unwrap();

        assert_eq!(table.endpoints(), vec![external(55305), external(55306)]);
        assert!(AddressTranslationTable::default().is_empty());
    }

    fn arb_entries() -> impl Strategy<Value = HashMap<(u8, u16), u16>> {
        prop::collection::hash_map((any::<u8>(), 1u16..), 1u16.., 0..64)
    }

    proptest! {
        #[test]
        fn test_build_resolve_round_trip(entries in arb_entries()) {
            let pairs: Vec<_> = entries
                .iter()
                .map(|(&(octet, port), &host_port)| (internal(octet, port), external(host_port)))
                .collect();

            let table = AddressTranslationTable::build(pairs.clone()).unwrap();

            prop_assert_eq!(table.len(), pairs.len());
            for (key, value) in &pairs {
                prop_assert_eq!(table.resolve(key).unwrap(), value);
            }
        }

        #[test]
        fn test_conflict_always_detected(
            octet in any::<u8>(),
            port in 1u16..,
            first in 1u16..,
            second in 1u16..,
        ) {
            prop_assume!(first != second);
            let result = AddressTranslationTable::build(vec![
                (internal(octet, port), external(first)),
                (internal(octet, port), external(second)),
            ]);
            prop_assert!(result.unwrap_err().is_duplicate_key());
        }
    }
}
