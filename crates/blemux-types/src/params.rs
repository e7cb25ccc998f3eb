//! Legacy advertising parameters (LE Set Advertising Parameters).

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

/// Smallest legal advertising interval (20 ms) in 0.625 ms units.
pub const MIN_INTERVAL: u16 = 0x0020;
/// Largest legal advertising interval (10.24 s) in 0.625 ms units.
pub const MAX_INTERVAL: u16 = 0x4000;

/// Advertising PDU type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum AdvertisingType {
    /// ADV_IND: connectable and scannable undirected.
    #[default]
    ConnectableUndirected = 0x00,
    /// ADV_SCAN_IND: scannable undirected.
    ScannableUndirected = 0x02,
    /// ADV_NONCONN_IND: non-connectable undirected.
    NonConnectableUndirected = 0x03,
}

/// Which address the controller advertises with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum OwnAddressType {
    /// The controller's public address.
    Public = 0x00,
    /// The address last set with LE Set Random Address.
    #[default]
    Random = 0x01,
}

/// Scan and connection request filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum FilterPolicy {
    /// Process scan and connection requests from any device.
    #[default]
    AllowAny = 0x00,
    /// Scan requests from the accept list only.
    ScanAcceptList = 0x01,
    /// Connection requests from the accept list only.
    ConnectAcceptList = 0x02,
    /// Both from the accept list only.
    AcceptListOnly = 0x03,
}

/// Bitmask of primary advertising channels (bit 0 = 37, bit 1 = 38, bit 2 = 39).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct ChannelMap(u8);

impl ChannelMap {
    /// All three advertising channels.
    pub const ALL: ChannelMap = ChannelMap(0x07);

    /// Create a channel map, rejecting empty or out-of-range masks.
    pub fn new(bits: u8) -> Result<Self, ParameterError> {
        if bits == 0 || bits & !0x07 != 0 {
            return Err(ParameterError::InvalidChannelMap(bits));
        }
        Ok(Self(bits))
    }

    /// The raw bitmask.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ChannelMap {
    type Error = ParameterError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Self::new(bits)
    }
}

impl From<ChannelMap> for u8 {
    fn from(map: ChannelMap) -> Self {
        map.0
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::ALL
    }
}

/// Parameters for LE Set Advertising Parameters.
///
/// Intervals are in controller time units of 0.625 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdvertisingParameters {
    /// Minimum advertising interval.
    pub interval_min: u16,
    /// Maximum advertising interval.
    pub interval_max: u16,
    /// Advertising PDU type.
    pub adv_type: AdvertisingType,
    /// Address used in advertising PDUs.
    pub own_address_type: OwnAddressType,
    /// Channels to advertise on.
    pub channel_map: ChannelMap,
    /// Request filtering.
    pub filter_policy: FilterPolicy,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        Self::standard()
    }
}

impl AdvertisingParameters {
    /// 100 ms fixed interval, as used by the Linux HCI deployment.
    pub fn standard() -> Self {
        Self::with_intervals(0x00A0, 0x00A0)
    }

    /// 20–40 ms interval, as used by the ESP32 deployment.
    pub fn fast() -> Self {
        Self::with_intervals(0x0020, 0x0040)
    }

    /// Connectable undirected, random address, all channels, allow any.
    pub fn with_intervals(interval_min: u16, interval_max: u16) -> Self {
        Self {
            interval_min,
            interval_max,
            adv_type: AdvertisingType::default(),
            own_address_type: OwnAddressType::default(),
            channel_map: ChannelMap::default(),
            filter_policy: FilterPolicy::default(),
        }
    }

    /// Check interval bounds and ordering.
    pub fn validate(&self) -> Result<(), ParameterError> {
        for interval in [self.interval_min, self.interval_max] {
            if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&interval) {
                return Err(ParameterError::IntervalOutOfRange(interval));
            }
        }
        if self.interval_min > self.interval_max {
            return Err(ParameterError::IntervalOrder {
                min: self.interval_min,
                max: self.interval_max,
            });
        }
        Ok(())
    }
}

/// Convert a duration to 0.625 ms controller units, rounding down.
///
/// ```
/// use std::time::Duration;
/// use blemux_types::params::interval_units;
///
/// assert_eq!(interval_units(Duration::from_millis(100)), 0x00A0);
/// assert_eq!(interval_units(Duration::from_millis(20)), 0x0020);
/// ```
pub fn interval_units(duration: Duration) -> u16 {
    let units = duration.as_micros() / 625;
    units.min(u16::MAX as u128) as u16
}

/// Convert 0.625 ms controller units to a duration.
pub fn interval_duration(units: u16) -> Duration {
    Duration::from_micros(units as u64 * 625)
}
