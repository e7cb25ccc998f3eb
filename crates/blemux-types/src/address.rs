//! Link-layer device addresses.

use core::fmt;
use core::str::FromStr;

use crate::error::AddressParseError;

/// A 6-byte Bluetooth link-layer address.
///
/// Bytes are stored most-significant first, the order in which addresses are
/// written (`AA:BB:CC:DD:EE:01` is `[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]`).
/// HCI transmits addresses least-significant first; use [`Address::to_le_bytes`]
/// when encoding commands.
///
/// # Examples
///
/// ```
/// use blemux_types::Address;
///
/// let addr: Address = "AA:BB:CC:DD:EE:01".parse().unwrap();
/// assert_eq!(addr.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
/// assert_eq!(addr.to_le_bytes(), [0x01, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
/// assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:01");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 6]);

impl Address {
    /// Create an address from octets in written order (most significant first).
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Octets in written order.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Octets in HCI wire order (least significant first).
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Build an address from HCI wire order.
    #[must_use]
    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// Whether this is a valid static random address.
    ///
    /// Static random addresses have the two most significant bits set and
    /// are neither all ones nor all zeros in the remaining 46 bits. Many
    /// controllers accept other values for LE Set Random Address, but
    /// scanners may classify them as non-resolvable or resolvable private
    /// addresses instead.
    #[must_use]
    pub fn is_static_random(&self) -> bool {
        if self.0[0] & 0xC0 != 0xC0 {
            return false;
        }
        let rest_zero = self.0[0] & 0x3F == 0 && self.0[1..].iter().all(|b| *b == 0);
        let rest_ones = self.0[0] & 0x3F == 0x3F && self.0[1..].iter().all(|b| *b == 0xFF);
        !rest_zero && !rest_ones
    }
}

impl From<[u8; 6]> for Address {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError {
            input: s.to_string(),
        };

        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(octets))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
