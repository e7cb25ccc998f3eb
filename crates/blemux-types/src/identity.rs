//! Simulated device identities and the roster that orders them.

use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::RosterError;

/// Longest local name the Bluetooth core allows (Vol 3, Part C, 12.1).
///
/// Names longer than the advertising budget are accepted here and truncated
/// by the payload builder.
pub const MAX_LOCAL_NAME_LEN: usize = 248;

/// One simulated device: an advertised name and a link-layer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Identity {
    name: String,
    address: Address,
}

impl Identity {
    /// Create an identity, rejecting empty or over-long names.
    ///
    /// # Examples
    ///
    /// ```
    /// use blemux_types::{Address, Identity};
    ///
    /// let id = Identity::new("DISP_01", Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])).unwrap();
    /// assert_eq!(id.name(), "DISP_01");
    /// assert!(Identity::new("", id.address()).is_err());
    /// ```
    pub fn new(name: impl Into<String>, address: Address) -> Result<Self, RosterError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RosterError::InvalidName {
                name,
                reason: "name cannot be empty",
            });
        }
        if name.len() > MAX_LOCAL_NAME_LEN {
            return Err(RosterError::InvalidName {
                name,
                reason: "name exceeds 248 bytes",
            });
        }
        Ok(Self { name, address })
    }

    /// The advertised local name (before any truncation).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The link-layer address presented while this identity is active.
    pub fn address(&self) -> Address {
        self.address
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            address: Address,
        }

        let raw = Raw::deserialize(deserializer)?;
        Identity::new(raw.name, raw.address).map_err(serde::de::Error::custom)
    }
}

/// An ordered, fixed, non-empty list of identities.
///
/// Insertion order is cycling order. Addresses are distinct. A roster cannot
/// be modified after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    identities: Vec<Identity>,
}

impl Roster {
    /// Build a roster, checking that it is non-empty and addresses are unique.
    pub fn new(identities: Vec<Identity>) -> Result<Self, RosterError> {
        if identities.is_empty() {
            return Err(RosterError::Empty);
        }

        let mut seen: HashMap<Address, usize> = HashMap::with_capacity(identities.len());
        for (i, identity) in identities.iter().enumerate() {
            if let Some(&first) = seen.get(&identity.address) {
                return Err(RosterError::DuplicateAddress {
                    address: identity.address,
                    first,
                    second: i,
                });
            }
            seen.insert(identity.address, i);
        }

        Ok(Self { identities })
    }

    /// Three demo identities, `DISP_01`..`DISP_03` at `AA:BB:CC:DD:EE:01`..`03`.
    pub fn reference() -> Self {
        let identities = (1u8..=3)
            .map(|n| Identity {
                name: format!("DISP_{:02}", n),
                address: Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, n]),
            })
            .collect();
        Self { identities }
    }

    /// Number of identities (always at least one).
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Always `false`; present for API symmetry with collections.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Identity at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.identities.get(index)
    }

    /// Index that follows `index` in round-robin order.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.identities.len()
    }

    /// Iterate identities in cycling order.
    pub fn iter(&self) -> std::slice::Iter<'_, Identity> {
        self.identities.iter()
    }
}

impl<'a> IntoIterator for &'a Roster {
    type Item = &'a Identity;
    type IntoIter = std::slice::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl TryFrom<Vec<Identity>> for Roster {
    type Error = RosterError;

    fn try_from(identities: Vec<Identity>) -> Result<Self, Self::Error> {
        Self::new(identities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str, last: u8) -> Identity {
        Identity::new(name, Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])).unwrap()
    }

    #[test]
    fn test_identity_rejects_bad_names() {
        let addr = Address::new([1; 6]);
        assert!(matches!(
            Identity::new("", addr),
            Err(RosterError::InvalidName { .. })
        ));
        assert!(Identity::new("x".repeat(MAX_LOCAL_NAME_LEN), addr).is_ok());
        assert!(Identity::new("x".repeat(MAX_LOCAL_NAME_LEN + 1), addr).is_err());
    }

    #[test]
    fn test_roster_rejects_empty() {
        assert_eq!(Roster::new(vec![]), Err(RosterError::Empty));
    }

    #[test]
    fn test_roster_rejects_duplicate_addresses() {
        let result = Roster::new(vec![id("A", 1), id("B", 2), id("C", 1)]);
        match result {
            Err(RosterError::DuplicateAddress { first, second, .. }) => {
                assert_eq!((first, second), (0, 2));
            }
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_roster_preserves_order_and_wraps() {
        let roster = Roster::new(vec![id("A", 1), id("B", 2), id("C", 3)]).unwrap();
        let names: Vec<_> = roster.iter().map(Identity::name).collect();
        assert_eq!(names, ["A", "B", "C"]);
        assert_eq!(roster.next_index(0), 1);
        assert_eq!(roster.next_index(2), 0);
        assert!(roster.get(3).is_none());
    }

    #[test]
    fn test_reference_roster() {
        let roster = Roster::reference();
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.get(0).unwrap().name(), "DISP_01");
        assert_eq!(
            roster.get(2).unwrap().address().to_string(),
            "AA:BB:CC:DD:EE:03"
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_identity_deserialize_validates() {
        let ok: Identity =
            serde_json::from_str(r#"{"name":"DISP_01","address":"AA:BB:CC:DD:EE:01"}"#).unwrap();
        assert_eq!(ok.name(), "DISP_01");
        assert!(
            serde_json::from_str::<Identity>(r#"{"name":"","address":"AA:BB:CC:DD:EE:01"}"#)
                .is_err()
        );
    }
}
