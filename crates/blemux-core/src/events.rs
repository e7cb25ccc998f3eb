//! Controller and cycle event streams.
//!
//! Controller bindings publish a [`ControllerEvent`] for every acknowledgement
//! they receive; the cycler publishes a [`CycleEvent`] whenever an identity is
//! announced, skipped, retried, or the cycle shuts down. Both are serializable
//! so they can be logged as JSON lines.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use blemux_types::Address;

use crate::controller::{CommandKind, StatusCode};

/// Acknowledgement of a controller command.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ControllerEvent {
    /// Advertising was disabled.
    AdvertisingStopped { status: StatusCode },
    /// The random address was set.
    RandomAddressSet { status: StatusCode },
    /// The advertising payload was loaded.
    AdvertisingDataSet { status: StatusCode },
    /// Advertising parameters were configured.
    AdvertisingParametersSet { status: StatusCode },
    /// Advertising was enabled (or refused).
    AdvertisingStartResult { status: StatusCode },
}

impl ControllerEvent {
    /// The event acknowledging `command`.
    pub fn new(command: CommandKind, status: StatusCode) -> Self {
        match command {
            CommandKind::Stop => Self::AdvertisingStopped { status },
            CommandKind::SetAddress => Self::RandomAddressSet { status },
            CommandKind::SetData => Self::AdvertisingDataSet { status },
            CommandKind::SetParameters => Self::AdvertisingParametersSet { status },
            CommandKind::Start => Self::AdvertisingStartResult { status },
        }
    }

    /// The command this event acknowledges.
    pub fn command(&self) -> CommandKind {
        match self {
            Self::AdvertisingStopped { .. } => CommandKind::Stop,
            Self::RandomAddressSet { .. } => CommandKind::SetAddress,
            Self::AdvertisingDataSet { .. } => CommandKind::SetData,
            Self::AdvertisingParametersSet { .. } => CommandKind::SetParameters,
            Self::AdvertisingStartResult { .. } => CommandKind::Start,
        }
    }

    /// Status reported by the controller.
    pub fn status(&self) -> StatusCode {
        match *self {
            Self::AdvertisingStopped { status }
            | Self::RandomAddressSet { status }
            | Self::AdvertisingDataSet { status }
            | Self::AdvertisingParametersSet { status }
            | Self::AdvertisingStartResult { status } => status,
        }
    }
}

/// Progress of the advertisement cycle.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CycleEvent {
    /// An identity is now being advertised.
    Announced {
        index: usize,
        round: u64,
        name: String,
        address: Address,
        /// Name bytes carried in the payload.
        name_len: usize,
        truncated: bool,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A command failed.
    CommandFailed {
        index: usize,
        command: CommandKind,
        error: String,
        /// Whether the failure ended the cycle.
        fatal: bool,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// An identity was skipped because its payload could not be built.
    Skipped {
        index: usize,
        name: String,
        reason: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// The identity is being restarted from Stop after a critical failure.
    Retrying {
        index: usize,
        command: CommandKind,
        attempt: u32,
        delay_ms: u64,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// Advertising was stopped and the controller released.
    Shutdown {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
}

/// Sender for cycle events.
pub type EventSender = broadcast::Sender<CycleEvent>;

/// Receiver for cycle events.
pub type EventReceiver = broadcast::Receiver<CycleEvent>;

/// Sender for controller events.
pub type ControllerEventSender = broadcast::Sender<ControllerEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_event_mapping() {
        for command in CommandKind::SEQUENCE {
            let event = ControllerEvent::new(command, StatusCode(0x0C));
            assert_eq!(event.command(), command);
            assert_eq!(event.status(), StatusCode::COMMAND_DISALLOWED);
        }
    }

    #[test]
    fn test_controller_event_json() {
        let event = ControllerEvent::AdvertisingStartResult {
            status: StatusCode::SUCCESS,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"advertising_start_result","status":0}"#);
        let back: ControllerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_cycle_event_json() {
        let event = CycleEvent::Announced {
            index: 1,
            round: 0,
            name: "DISP_02".to_string(),
            address: "AA:BB:CC:DD:EE:02".parse().unwrap(),
            name_len: 7,
            truncated: false,
            at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "announced");
        assert_eq!(json["address"], "AA:BB:CC:DD:EE:02");
        assert_eq!(json["at"], "1970-01-01T00:00:00Z");
    }
}
