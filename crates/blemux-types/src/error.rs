//! Error types for blemux-types.
//!
//! These errors are platform-agnostic and never involve I/O. Controller and
//! transport failures belong in blemux-core.

use thiserror::Error;

use crate::address::Address;

/// Errors raised while building or decoding an advertising payload.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PayloadError {
    /// No bytes of the local name fit, and the builder requires a name.
    #[error("local name is empty after truncation")]
    EmptyName,

    /// A block would not fit in the 31-byte advertising buffer.
    #[error("payload overflow: block needs {needed} bytes, {available} available")]
    Overflow {
        /// Bytes required by the block being appended.
        needed: usize,
        /// Bytes still free in the buffer.
        available: usize,
    },

    /// The byte sequence is not a valid sequence of AD structures.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Errors raised when constructing an [`Identity`](crate::Identity) or
/// [`Roster`](crate::Roster).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RosterError {
    /// A roster must contain at least one identity.
    #[error("roster is empty")]
    Empty,

    /// Two identities share the same link-layer address.
    #[error("duplicate address {address} (entries {first} and {second})")]
    DuplicateAddress {
        /// The repeated address.
        address: Address,
        /// Index of the first identity using it.
        first: usize,
        /// Index of the second identity using it.
        second: usize,
    },

    /// The identity name is empty or longer than the Bluetooth local name limit.
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// Error returned when parsing an [`Address`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address '{input}': expected six colon-separated hex octets (AA:BB:CC:DD:EE:FF)")]
pub struct AddressParseError {
    /// The rejected input.
    pub input: String,
}

/// Error returned when advertising parameters are out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParameterError {
    /// Interval outside 0x0020..=0x4000 (20 ms to 10.24 s).
    #[error("advertising interval 0x{0:04X} out of range 0x0020..=0x4000")]
    IntervalOutOfRange(u16),

    /// `interval_min` is greater than `interval_max`.
    #[error("interval_min 0x{min:04X} exceeds interval_max 0x{max:04X}")]
    IntervalOrder {
        /// Configured minimum.
        min: u16,
        /// Configured maximum.
        max: u16,
    },

    /// Channel map must enable at least one of the three advertising channels.
    #[error("channel map 0x{0:02X} must enable at least one of channels 37, 38, 39")]
    InvalidChannelMap(u8),
}
