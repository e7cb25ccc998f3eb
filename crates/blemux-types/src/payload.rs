//! Legacy advertising payload (AD structures) building and decoding.
//!
//! An advertising payload is at most 31 bytes of AD structures, each laid out
//! as `[length][ad_type][data...]` where `length = 1 + data.len()`.
//!
//! Every payload built here starts with a Flags structure
//! (`[0x02, 0x01, 0x06]`: LE General Discoverable, BR/EDR not supported),
//! followed by any fixed structures (16-bit service UUIDs), followed by the
//! Complete Local Name truncated to whatever budget remains.
//!
//! # Example
//!
//! ```
//! use blemux_types::{Address, Identity, payload};
//!
//! let identity = Identity::new("DISP_01", Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])).unwrap();
//! let built = payload::build(&identity).unwrap();
//!
//! assert_eq!(&built.payload.as_bytes()[..3], &[0x02, 0x01, 0x06]);
//! assert_eq!(built.payload.local_name().as_deref(), Some("DISP_01"));
//! assert!(!built.truncated);
//! ```

use core::fmt;

use crate::error::PayloadError;
use crate::identity::Identity;

/// Maximum size of a legacy advertising payload.
pub const MAX_PAYLOAD_LEN: usize = 31;

/// Bytes of overhead per AD structure (length byte + type byte).
pub const BLOCK_OVERHEAD: usize = 2;

/// Assigned AD type numbers used by this crate.
pub mod ad_type {
    /// Flags.
    pub const FLAGS: u8 = 0x01;
    /// Incomplete List of 16-bit Service Class UUIDs.
    pub const INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
    /// Complete List of 16-bit Service Class UUIDs.
    pub const COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
    /// Shortened Local Name.
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    /// Complete Local Name.
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
}

/// LE General Discoverable Mode flag bit.
pub const LE_GENERAL_DISCOVERABLE: u8 = 0x02;
/// BR/EDR Not Supported flag bit.
pub const BR_EDR_NOT_SUPPORTED: u8 = 0x04;

/// A legacy advertising payload, at most [`MAX_PAYLOAD_LEN`] bytes.
///
/// The bound is held by the type: bytes can only be appended through
/// [`Payload::push_block`], which refuses to write past the end.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    buf: [u8; MAX_PAYLOAD_LEN],
    len: usize,
}

impl Payload {
    /// An empty payload.
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_PAYLOAD_LEN],
            len: 0,
        }
    }

    /// Append one AD structure.
    ///
    /// Fails with [`PayloadError::Overflow`] if the structure does not fit;
    /// the payload is left unchanged in that case.
    pub fn push_block(&mut self, ad_type: u8, data: &[u8]) -> Result<(), PayloadError> {
        let needed = BLOCK_OVERHEAD + data.len();
        if needed > self.remaining() {
            return Err(PayloadError::Overflow {
                needed,
                available: self.remaining(),
            });
        }

        self.buf[self.len] = (1 + data.len()) as u8;
        self.buf[self.len + 1] = ad_type;
        self.buf[self.len + 2..self.len + needed].copy_from_slice(data);
        self.len += needed;
        Ok(())
    }

    /// The significant bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The payload zero-padded to 31 bytes, as HCI expects it.
    pub fn padded(&self) -> [u8; MAX_PAYLOAD_LEN] {
        self.buf
    }

    /// Number of significant bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no structures have been added.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still free.
    pub fn remaining(&self) -> usize {
        MAX_PAYLOAD_LEN - self.len
    }

    /// Decode the AD structures in this payload.
    pub fn blocks(&self) -> Result<Vec<AdBlock>, PayloadError> {
        parse_blocks(self.as_bytes())
    }

    /// Value of the Flags structure, if present.
    pub fn flags(&self) -> Option<u8> {
        self.find(ad_type::FLAGS)
            .and_then(|block| block.data.first().copied())
    }

    /// Contents of the Complete Local Name structure, if present.
    ///
    /// Invalid UTF-8 is replaced lossily.
    pub fn local_name(&self) -> Option<String> {
        self.find(ad_type::COMPLETE_LOCAL_NAME)
            .map(|block| String::from_utf8_lossy(&block.data).into_owned())
    }

    fn find(&self, ad_type: u8) -> Option<AdBlock> {
        self.blocks()
            .ok()?
            .into_iter()
            .find(|block| block.ad_type == ad_type)
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", hex(self.as_bytes()))
    }
}

impl TryFrom<&[u8]> for Payload {
    type Error = PayloadError;

    /// Wrap pre-encoded AD structures, validating length and structure.
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() > MAX_PAYLOAD_LEN {
            return Err(PayloadError::Overflow {
                needed: bytes.len(),
                available: MAX_PAYLOAD_LEN,
            });
        }
        parse_blocks(bytes)?;
        let mut payload = Self::new();
        payload.buf[..bytes.len()].copy_from_slice(bytes);
        payload.len = bytes.len();
        Ok(payload)
    }
}

/// One decoded AD structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdBlock {
    /// The AD type byte.
    pub ad_type: u8,
    /// The data following the type byte.
    pub data: Vec<u8>,
}

/// Decode a sequence of AD structures.
///
/// A zero length byte ends the significant part (the rest is padding).
/// A structure whose length runs past the end of the input is rejected.
pub fn parse_blocks(bytes: &[u8]) -> Result<Vec<AdBlock>, PayloadError> {
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let len = bytes[i] as usize;
        if len == 0 {
            break;
        }
        let end = i + 1 + len;
        if end > bytes.len() {
            return Err(PayloadError::Malformed(format!(
                "structure at offset {} declares {} bytes, only {} remain",
                i,
                len,
                bytes.len() - i - 1
            )));
        }
        blocks.push(AdBlock {
            ad_type: bytes[i + 1],
            data: bytes[i + 2..end].to_vec(),
        });
        i = end;
    }

    Ok(blocks)
}

/// Result of building a payload for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltPayload {
    /// The encoded payload.
    pub payload: Payload,
    /// Bytes of the name actually carried in the payload.
    pub name_len: usize,
    /// Whether the name was shortened to fit.
    pub truncated: bool,
}

/// Builds advertising payloads for identities.
///
/// The default builder emits Flags `0x06` and the Complete Local Name, which
/// leaves 26 bytes for the name. Every 16-bit service UUID added shrinks the
/// name budget; the first one costs 4 bytes, each further one 2 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBuilder {
    flags: u8,
    service_uuids: Vec<u16>,
    allow_empty_name: bool,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self {
            flags: LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED,
            service_uuids: Vec::new(),
            allow_empty_name: true,
        }
    }
}

impl PayloadBuilder {
    /// Builder with the default Flags + Complete Local Name layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Flags value.
    #[must_use]
    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Advertise a 16-bit service UUID ahead of the name.
    #[must_use]
    pub fn service_uuid(mut self, uuid: u16) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    /// Advertise several 16-bit service UUIDs ahead of the name.
    #[must_use]
    pub fn service_uuids(mut self, uuids: impl IntoIterator<Item = u16>) -> Self {
        self.service_uuids.extend(uuids);
        self
    }

    /// Whether a zero-length name is emitted (`true`) or rejected.
    ///
    /// When allowed, an empty name is encoded as the one-byte structure
    /// `[0x01, 0x09]`.
    #[must_use]
    pub fn allow_empty_name(mut self, allow: bool) -> Self {
        self.allow_empty_name = allow;
        self
    }

    /// Bytes used by the structures that precede the name.
    pub fn fixed_len(&self) -> usize {
        let flags = BLOCK_OVERHEAD + 1;
        let uuids = if self.service_uuids.is_empty() {
            0
        } else {
            BLOCK_OVERHEAD + 2 * self.service_uuids.len()
        };
        flags + uuids
    }

    /// Maximum name bytes that fit: `31 - fixed - 2`.
    pub fn name_budget(&self) -> usize {
        MAX_PAYLOAD_LEN.saturating_sub(self.fixed_len() + BLOCK_OVERHEAD)
    }

    /// Build the payload for an identity.
    pub fn build(&self, identity: &Identity) -> Result<BuiltPayload, PayloadError> {
        self.build_name(identity.name())
    }

    /// Build a payload carrying an arbitrary name.
    pub fn build_name(&self, name: &str) -> Result<BuiltPayload, PayloadError> {
        let mut payload = Payload::new();
        payload.push_block(ad_type::FLAGS, &[self.flags])?;

        if !self.service_uuids.is_empty() {
            let uuids: Vec<u8> = self
                .service_uuids
                .iter()
                .flat_map(|uuid| uuid.to_le_bytes())
                .collect();
            payload.push_block(ad_type::COMPLETE_SERVICE_UUIDS_16, &uuids)?;
        }

        let budget = payload.remaining().saturating_sub(BLOCK_OVERHEAD);
        let carried = truncate_utf8(name, budget);
        if carried.is_empty() && !self.allow_empty_name {
            return Err(PayloadError::EmptyName);
        }
        payload.push_block(ad_type::COMPLETE_LOCAL_NAME, carried.as_bytes())?;

        Ok(BuiltPayload {
            payload,
            name_len: carried.len(),
            truncated: carried.len() < name.len(),
        })
    }
}

/// Build a payload with the default layout.
pub fn build(identity: &Identity) -> Result<BuiltPayload, PayloadError> {
    PayloadBuilder::default().build(identity)
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Uppercase hex with no separators.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn identity(name: &str) -> Identity {
        Identity::new(name, Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])).unwrap()
    }

    #[test]
    fn test_reference_payload_bytes() {
        let built = build(&identity("DISP_01")).unwrap();
        assert_eq!(
            built.payload.as_bytes(),
            &[
                0x02, 0x01, 0x06, // flags
                0x08, 0x09, b'D', b'I', b'S', b'P', b'_', b'0', b'1', // name
            ]
        );
        assert_eq!(built.name_len, 7);
        assert!(!built.truncated);
    }

    #[test]
    fn test_thirty_byte_name_hits_boundary() {
        let built = build(&identity(&"x".repeat(30))).unwrap();
        let bytes = built.payload.as_bytes();
        assert_eq!(bytes.len(), 31);
        assert_eq!(bytes[3], 27);
        assert_eq!(bytes[4], ad_type::COMPLETE_LOCAL_NAME);
        assert_eq!(built.name_len, 26);
        assert!(built.truncated);
    }

    #[test]
    fn test_name_of_exactly_budget_is_not_truncated() {
        let built = build(&identity(&"n".repeat(26))).unwrap();
        assert_eq!(built.payload.len(), 31);
        assert!(!built.truncated);
    }

    #[test]
    fn test_service_uuid_shrinks_budget() {
        let builder = PayloadBuilder::new().service_uuid(0x180D);
        assert_eq!(builder.name_budget(), 22);

        let built = builder.build(&identity(&"y".repeat(40))).unwrap();
        let bytes = built.payload.as_bytes();
        assert_eq!(&bytes[3..7], &[0x03, 0x03, 0x0D, 0x18]);
        assert_eq!(built.name_len, 22);
        assert_eq!(bytes.len(), 31);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        // 25 ASCII bytes followed by a 2-byte character straddling the budget
        let name = format!("{}é", "a".repeat(25));
        let built = build(&identity(&name)).unwrap();
        assert_eq!(built.name_len, 25);
        assert_eq!(built.payload.local_name().unwrap(), "a".repeat(25));
    }

    #[test]
    fn test_empty_name_policy() {
        // Thirteen UUIDs consume 28 bytes after flags: nothing left for a name block
        let crowded = PayloadBuilder::new().service_uuids(0x1800..0x180D);
        assert!(matches!(
            crowded.build_name("x"),
            Err(PayloadError::Overflow { .. })
        ));

        // Twelve UUIDs leave exactly the 2-byte name header
        let tight = PayloadBuilder::new().service_uuids(0x1800..0x180C);
        assert_eq!(tight.name_budget(), 0);
        let built = tight.build_name("DISP_01").unwrap();
        let bytes = built.payload.as_bytes();
        assert_eq!(&bytes[bytes.len() - 2..], &[0x01, 0x09]);
        assert_eq!(built.name_len, 0);
        assert!(built.truncated);

        let strict = tight.allow_empty_name(false);
        assert_eq!(strict.build_name("DISP_01"), Err(PayloadError::EmptyName));
    }

    #[test]
    fn test_push_block_never_overflows() {
        let mut payload = Payload::new();
        payload.push_block(0xFF, &[0u8; 29]).unwrap();
        let before = payload;
        assert_eq!(
            payload.push_block(0xFF, &[]),
            Err(PayloadError::Overflow {
                needed: 2,
                available: 0
            })
        );
        assert_eq!(payload, before);
    }

    #[test]
    fn test_parse_blocks_handles_padding_and_errors() {
        let blocks = parse_blocks(&[0x02, 0x01, 0x06, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, vec![0x06]);

        assert!(matches!(
            parse_blocks(&[0x02, 0x01, 0x06, 0x05, 0x09, b'a']),
            Err(PayloadError::Malformed(_))
        ));
        assert!(parse_blocks(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_try_from_bytes() {
        let payload = Payload::try_from(&[0x02u8, 0x01, 0x06][..]).unwrap();
        assert_eq!(payload.flags(), Some(0x06));
        assert!(Payload::try_from(&[0u8; 32][..]).is_err());
        assert!(Payload::try_from(&[0x04u8, 0x09][..]).is_err());
    }

    #[test]
    fn test_padded_is_zero_filled() {
        let built = build(&identity("A")).unwrap();
        let padded = built.payload.padded();
        assert_eq!(&padded[..6], &[0x02, 0x01, 0x06, 0x02, 0x09, b'A']);
        assert!(padded[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_debug_is_hex() {
        let payload = Payload::try_from(&[0x02u8, 0x01, 0x06][..]).unwrap();
        assert_eq!(format!("{:?}", payload), "Payload(020106)");
    }
}
