//! Platform-agnostic types for the BLE advertisement identity multiplexer.
//!
//! This crate holds the values shared by every controller binding
//! (blemux-core) and the command-line front end (blemux-cli). Nothing here
//! performs I/O.
//!
//! # Features
//!
//! - Link-layer addresses with HCI wire-order helpers
//! - Identities and the ordered, validated roster
//! - Legacy advertising payload building and decoding (31-byte bound)
//! - Advertising parameters with interval validation
//!
//! # Example
//!
//! ```
//! use blemux_types::{PayloadBuilder, Roster};
//!
//! let roster = Roster::reference();
//! let builder = PayloadBuilder::new();
//!
//! for identity in &roster {
//!     let built = builder.build(identity).unwrap();
//!     assert!(built.payload.len() <= 31);
//! }
//! ```

pub mod address;
pub mod error;
pub mod identity;
pub mod params;
pub mod payload;

pub use address::Address;
pub use error::{AddressParseError, ParameterError, PayloadError, RosterError};
pub use identity::{Identity, MAX_LOCAL_NAME_LEN, Roster};
pub use params::{AdvertisingParameters, AdvertisingType, ChannelMap, FilterPolicy, OwnAddressType};
pub use payload::{AdBlock, BuiltPayload, MAX_PAYLOAD_LEN, Payload, PayloadBuilder};
