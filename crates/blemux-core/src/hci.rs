//! HCI command encoding, event decoding and the HCI controller binding.
//!
//! Commands are sent as HCI command packets:
//!
//! ```text
//! [0x01][opcode lo][opcode hi][param len][params...]
//! ```
//!
//! and acknowledged by a Command Complete (`0x0E`) or Command Status (`0x0F`)
//! event packet carrying the same opcode:
//!
//! ```text
//! [0x04][0x0E][len][num packets][opcode lo][opcode hi][status]
//! [0x04][0x0F][len][status][num packets][opcode lo][opcode hi]
//! ```
//!
//! [`HciController`] works over any [`HciTransport`]; on Linux
//! [`HciSocket`](socket::HciSocket) provides the raw socket transport.

#[cfg(target_os = "linux")]
pub mod socket;

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use blemux_types::{Address, AdvertisingParameters, Payload};

use crate::controller::{CommandKind, Controller, StatusCode};
use crate::error::{Error, Result, TransportError};
use crate::events::{ControllerEvent, ControllerEventSender};

/// HCI command packet indicator.
pub const HCI_COMMAND_PKT: u8 = 0x01;
/// HCI event packet indicator.
pub const HCI_EVENT_PKT: u8 = 0x04;

/// Command Complete event code.
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
/// Command Status event code.
pub const EVT_CMD_STATUS: u8 = 0x0F;

/// LE Controller command group.
pub const OGF_LE_CTL: u16 = 0x08;

/// OCF of LE Set Random Address.
pub const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
/// OCF of LE Set Advertising Parameters.
pub const OCF_LE_SET_ADVERTISING_PARAMETERS: u16 = 0x0006;
/// OCF of LE Set Advertising Data.
pub const OCF_LE_SET_ADVERTISING_DATA: u16 = 0x0008;
/// OCF of LE Set Advertise Enable.
pub const OCF_LE_SET_ADVERTISE_ENABLE: u16 = 0x000A;

/// Default time to wait for a command acknowledgement.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Combine a command group and command into an opcode.
pub const fn opcode(ogf: u16, ocf: u16) -> u16 {
    (ogf << 10) | ocf
}

/// An LE advertising command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciCommand {
    /// LE Set Advertise Enable.
    SetAdvertiseEnable(bool),
    /// LE Set Random Address.
    SetRandomAddress(Address),
    /// LE Set Advertising Parameters.
    SetAdvertisingParameters(AdvertisingParameters),
    /// LE Set Advertising Data.
    SetAdvertisingData(Payload),
}

impl HciCommand {
    /// Opcode of this command.
    pub fn opcode(&self) -> u16 {
        let ocf = match self {
            HciCommand::SetAdvertiseEnable(_) => OCF_LE_SET_ADVERTISE_ENABLE,
            HciCommand::SetRandomAddress(_) => OCF_LE_SET_RANDOM_ADDRESS,
            HciCommand::SetAdvertisingParameters(_) => OCF_LE_SET_ADVERTISING_PARAMETERS,
            HciCommand::SetAdvertisingData(_) => OCF_LE_SET_ADVERTISING_DATA,
        };
        opcode(OGF_LE_CTL, ocf)
    }

    /// The controller operation this command performs.
    pub fn kind(&self) -> CommandKind {
        match self {
            HciCommand::SetAdvertiseEnable(false) => CommandKind::Stop,
            HciCommand::SetAdvertiseEnable(true) => CommandKind::Start,
            HciCommand::SetRandomAddress(_) => CommandKind::SetAddress,
            HciCommand::SetAdvertisingParameters(_) => CommandKind::SetParameters,
            HciCommand::SetAdvertisingData(_) => CommandKind::SetData,
        }
    }

    /// Encode the full command packet, including the packet indicator.
    pub fn encode(&self) -> Bytes {
        let mut params = BytesMut::with_capacity(32);
        match self {
            HciCommand::SetAdvertiseEnable(enable) => {
                params.put_u8(u8::from(*enable));
            }
            HciCommand::SetRandomAddress(address) => {
                params.put_slice(&address.to_le_bytes());
            }
            HciCommand::SetAdvertisingParameters(p) => {
                params.put_u16_le(p.interval_min);
                params.put_u16_le(p.interval_max);
                params.put_u8(p.adv_type as u8);
                params.put_u8(p.own_address_type as u8);
                // Peer address type and peer address, unused for undirected advertising
                params.put_u8(0x00);
                params.put_slice(&[0u8; 6]);
                params.put_u8(p.channel_map.bits());
                params.put_u8(p.filter_policy as u8);
            }
            HciCommand::SetAdvertisingData(payload) => {
                params.put_u8(payload.len() as u8);
                params.put_slice(&payload.padded());
            }
        }

        let mut frame = BytesMut::with_capacity(4 + params.len());
        frame.put_u8(HCI_COMMAND_PKT);
        frame.put_u16_le(self.opcode());
        frame.put_u8(params.len() as u8);
        frame.put_slice(&params);
        frame.freeze()
    }
}

/// A decoded HCI event packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    /// Command Complete.
    CommandComplete {
        num_packets: u8,
        opcode: u16,
        status: StatusCode,
    },
    /// Command Status.
    CommandStatus {
        status: StatusCode,
        num_packets: u8,
        opcode: u16,
    },
    /// Any other event.
    Other { code: u8 },
}

impl HciEvent {
    /// Decode an event packet, including its packet indicator.
    pub fn decode(frame: &[u8]) -> std::result::Result<Self, TransportError> {
        let mut buf = frame;
        if buf.remaining() < 3 {
            return Err(TransportError::MalformedFrame(format!(
                "event frame too short ({} bytes)",
                frame.len()
            )));
        }

        let indicator = buf.get_u8();
        if indicator != HCI_EVENT_PKT {
            return Err(TransportError::MalformedFrame(format!(
                "unexpected packet indicator 0x{:02X}",
                indicator
            )));
        }
        let code = buf.get_u8();
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(TransportError::MalformedFrame(format!(
                "event 0x{:02X} declares {} parameter bytes, {} present",
                code,
                len,
                buf.remaining()
            )));
        }

        match code {
            EVT_CMD_COMPLETE if len >= 4 => {
                let num_packets = buf.get_u8();
                let opcode = buf.get_u16_le();
                let status = StatusCode(buf.get_u8());
                Ok(HciEvent::CommandComplete {
                    num_packets,
                    opcode,
                    status,
                })
            }
            EVT_CMD_STATUS if len >= 4 => {
                let status = StatusCode(buf.get_u8());
                let num_packets = buf.get_u8();
                let opcode = buf.get_u16_le();
                Ok(HciEvent::CommandStatus {
                    status,
                    num_packets,
                    opcode,
                })
            }
            EVT_CMD_COMPLETE | EVT_CMD_STATUS => Err(TransportError::MalformedFrame(format!(
                "event 0x{:02X} too short for an acknowledgement",
                code
            ))),
            code => Ok(HciEvent::Other { code }),
        }
    }

    /// Opcode and status if this event acknowledges a command.
    pub fn acknowledgement(&self) -> Option<(u16, StatusCode)> {
        match *self {
            HciEvent::CommandComplete { opcode, status, .. }
            | HciEvent::CommandStatus { opcode, status, .. } => Some((opcode, status)),
            HciEvent::Other { .. } => None,
        }
    }
}

/// A byte-oriented link to an HCI controller.
#[async_trait]
pub trait HciTransport: Send {
    /// Send one complete packet, including its indicator.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Receive the next packet, including its indicator.
    async fn recv_frame(&mut self) -> Result<Bytes>;

    /// Release the link.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Controller binding that speaks HCI.
///
/// Each request sends one command and waits for the acknowledgement carrying
/// its opcode. Events for other opcodes are discarded. When a request times
/// out, a completion for the same opcode that arrives within the following
/// timeout window is treated as belonging to the abandoned request and
/// discarded. If no second completion follows before the deadline, the
/// abandoned request's completion was lost and the held-back one is used.
pub struct HciController<T> {
    transport: T,
    name: String,
    command_timeout: Duration,
    /// Opcodes of timed-out commands and when their late completion stops being expected.
    stale: Vec<(u16, Instant)>,
    events: Option<ControllerEventSender>,
}

impl<T: HciTransport> HciController<T> {
    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            name: "hci".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            stale: Vec::new(),
            events: None,
        }
    }

    /// Set the name reported in logs.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set how long to wait for each acknowledgement.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Publish a [`ControllerEvent`] for every acknowledgement.
    #[must_use]
    pub fn with_events(mut self, sender: ControllerEventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Access the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a command and wait for its acknowledgement.
    pub async fn execute(&mut self, command: HciCommand) -> Result<()> {
        let opcode = command.opcode();
        let kind = command.kind();
        let frame = command.encode();

        let now = Instant::now();
        self.stale.retain(|(_, expires)| *expires > now);

        trace!(controller = %self.name, "sending opcode 0x{:04X}: {:02X?}", opcode, &frame[..]);
        self.transport.send_frame(&frame).await?;

        let deadline = Instant::now() + self.command_timeout;
        let mut held_back: Option<StatusCode> = None;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.transport.recv_frame()).await
            {
                Ok(frame) => frame?,
                Err(_) => {
                    if let Some(status) = held_back {
                        debug!(
                            controller = %self.name,
                            "no further acknowledgement for opcode 0x{:04X}, using the held-back one",
                            opcode
                        );
                        return self.acknowledged(kind, status);
                    }
                    self.stale
                        .push((opcode, Instant::now() + self.command_timeout));
                    return Err(Error::timeout(kind, self.command_timeout));
                }
            };

            let event = match HciEvent::decode(&frame) {
                Ok(event) => event,
                Err(e) => {
                    debug!(controller = %self.name, "discarding frame: {}", e);
                    continue;
                }
            };

            let Some((event_opcode, status)) = event.acknowledgement() else {
                debug!(controller = %self.name, ?event, "discarding unrelated event");
                continue;
            };

            if event_opcode != opcode {
                // A late completion for a timed-out command is no longer expected once seen
                if let Some(pos) = self.stale.iter().position(|(o, _)| *o == event_opcode) {
                    self.stale.remove(pos);
                }
                debug!(
                    controller = %self.name,
                    "discarding acknowledgement for opcode 0x{:04X} while waiting for 0x{:04X}",
                    event_opcode, opcode
                );
                continue;
            }

            if let Some(pos) = self.stale.iter().position(|(o, _)| *o == opcode) {
                self.stale.remove(pos);
                debug!(
                    controller = %self.name,
                    "holding back possibly stale acknowledgement for opcode 0x{:04X}", opcode
                );
                held_back = Some(status);
                continue;
            }

            return self.acknowledged(kind, status);
        }
    }

    fn acknowledged(&self, command: CommandKind, status: StatusCode) -> Result<()> {
        self.publish(command, status);
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::command(command, status))
        }
    }

    fn publish(&self, command: CommandKind, status: StatusCode) {
        let event = ControllerEvent::new(command, status);
        debug!(controller = %self.name, ?event, "controller event");
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

#[cfg(target_os = "linux")]
impl HciController<socket::HciSocket> {
    /// Open the raw HCI socket for `hci<device>`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(device: u16) -> Result<Self> {
        let socket = socket::HciSocket::open(device)?;
        Ok(Self::new(socket).named(format!("hci{}", device)))
    }
}

#[async_trait]
impl<T: HciTransport> Controller for HciController<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&mut self) -> Result<()> {
        self.execute(HciCommand::SetAdvertiseEnable(false)).await
    }

    async fn set_random_address(&mut self, address: Address) -> Result<()> {
        self.execute(HciCommand::SetRandomAddress(address)).await
    }

    async fn set_advertising_data(&mut self, payload: &Payload) -> Result<()> {
        self.execute(HciCommand::SetAdvertisingData(*payload)).await
    }

    async fn set_advertising_parameters(&mut self, params: &AdvertisingParameters) -> Result<()> {
        self.execute(HciCommand::SetAdvertisingParameters(*params))
            .await
    }

    async fn start(&mut self) -> Result<()> {
        self.execute(HciCommand::SetAdvertiseEnable(true)).await
    }

    async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use blemux_types::payload;
    use blemux_types::{Identity, OwnAddressType};

    fn complete(opcode: u16, status: u8) -> Vec<u8> {
        let [lo, hi] = opcode.to_le_bytes();
        vec![HCI_EVENT_PKT, EVT_CMD_COMPLETE, 4, 1, lo, hi, status]
    }

    fn command_status(opcode: u16, status: u8) -> Vec<u8> {
        let [lo, hi] = opcode.to_le_bytes();
        vec![HCI_EVENT_PKT, EVT_CMD_STATUS, 4, status, 1, lo, hi]
    }

    /// Transport that replays queued events and optionally acknowledges every command.
    #[derive(Default)]
    struct FakeTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        inbox: VecDeque<Vec<u8>>,
        auto_ack: bool,
    }

    #[async_trait]
    impl HciTransport for FakeTransport {
        async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(frame.to_vec());
            if self.auto_ack {
                let opcode = u16::from_le_bytes([frame[1], frame[2]]);
                self.inbox.push_back(complete(opcode, 0));
            }
            Ok(())
        }

        async fn recv_frame(&mut self) -> Result<Bytes> {
            match self.inbox.pop_front() {
                Some(frame) => Ok(Bytes::from(frame)),
                None => std::future::pending().await,
            }
        }
    }

    #[test]
    fn test_opcodes() {
        assert_eq!(HciCommand::SetRandomAddress(Address::new([0; 6])).opcode(), 0x2005);
        assert_eq!(
            HciCommand::SetAdvertisingParameters(AdvertisingParameters::default()).opcode(),
            0x2006
        );
        assert_eq!(HciCommand::SetAdvertisingData(Payload::new()).opcode(), 0x2008);
        assert_eq!(HciCommand::SetAdvertiseEnable(true).opcode(), 0x200A);
    }

    #[test]
    fn test_encode_enable() {
        assert_eq!(
            &HciCommand::SetAdvertiseEnable(false).encode()[..],
            &[0x01, 0x0A, 0x20, 0x01, 0x00]
        );
        assert_eq!(
            &HciCommand::SetAdvertiseEnable(true).encode()[..],
            &[0x01, 0x0A, 0x20, 0x01, 0x01]
        );
    }

    #[test]
    fn test_encode_random_address_is_little_endian() {
        let address: Address = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(
            &HciCommand::SetRandomAddress(address).encode()[..],
            &[0x01, 0x05, 0x20, 0x06, 0x01, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]
        );
    }

    #[test]
    fn test_encode_parameters() {
        let frame = HciCommand::SetAdvertisingParameters(AdvertisingParameters::standard()).encode();
        assert_eq!(
            &frame[..],
            &[
                0x01, 0x06, 0x20, 0x0F, // header
                0xA0, 0x00, 0xA0, 0x00, // intervals
                0x00, // connectable undirected
                0x01, // random own address
                0x00, 0, 0, 0, 0, 0, 0, // peer
                0x07, // all channels
                0x00, // allow any
            ]
        );

        let mut params = AdvertisingParameters::fast();
        params.own_address_type = OwnAddressType::Public;
        let frame = HciCommand::SetAdvertisingParameters(params).encode();
        assert_eq!(&frame[4..8], &[0x20, 0x00, 0x40, 0x00]);
        assert_eq!(frame[9], 0x00);
    }

    #[test]
    fn test_encode_advertising_data_is_padded() {
        let identity = Identity::new("DISP_01", "AA:BB:CC:DD:EE:01".parse().unwrap()).unwrap();
        let built = payload::build(&identity).unwrap();
        let frame = HciCommand::SetAdvertisingData(built.payload).encode();

        assert_eq!(frame.len(), 4 + 32);
        assert_eq!(&frame[..5], &[0x01, 0x08, 0x20, 0x20, 12]);
        assert_eq!(&frame[5..17], built.payload.as_bytes());
        assert!(frame[17..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_events() {
        assert_eq!(
            HciEvent::decode(&complete(0x200A, 0x0C)).unwrap(),
            HciEvent::CommandComplete {
                num_packets: 1,
                opcode: 0x200A,
                status: StatusCode(0x0C)
            }
        );
        assert_eq!(
            HciEvent::decode(&command_status(0x2005, 0))
                .unwrap()
                .acknowledgement(),
            Some((0x2005, StatusCode::SUCCESS))
        );
        assert_eq!(
            HciEvent::decode(&[0x04, 0x3E, 0x01, 0x02]).unwrap(),
            HciEvent::Other { code: 0x3E }
        );
        assert!(HciEvent::decode(&[0x04, 0x0E]).is_err());
        assert!(HciEvent::decode(&[0x04, 0x0E, 0x04, 0x01]).is_err());
        assert!(HciEvent::decode(&[0x02, 0x0E, 0x00]).is_err());
        assert!(HciEvent::decode(&[0x04, 0x0E, 0x01, 0x01]).is_err());
    }

    #[tokio::test]
    async fn test_controller_sends_sequence() {
        let transport = FakeTransport {
            auto_ack: true,
            ..Default::default()
        };
        let sent = Arc::clone(&transport.sent);
        let mut controller = HciController::new(transport);

        controller.stop().await.unwrap();
        controller
            .set_random_address(Address::new([0xC0, 0, 0, 0, 0, 1]))
            .await
            .unwrap();
        controller.start().await.unwrap();

        let opcodes: Vec<u16> = sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| u16::from_le_bytes([f[1], f[2]]))
            .collect();
        assert_eq!(opcodes, vec![0x200A, 0x2005, 0x200A]);
    }

    #[tokio::test]
    async fn test_non_zero_status_is_command_error() {
        let mut transport = FakeTransport::default();
        transport.inbox.push_back(complete(0x200A, 0x0C));
        let mut controller = HciController::new(transport);

        match controller.start().await {
            Err(Error::Command { command, status }) => {
                assert_eq!(command, CommandKind::Start);
                assert_eq!(status, StatusCode::COMMAND_DISALLOWED);
            }
            other => panic!("expected command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrelated_events_are_discarded() {
        let mut transport = FakeTransport::default();
        transport.inbox.push_back(vec![0x04, 0x3E, 0x01, 0x02]);
        transport.inbox.push_back(complete(0x2008, 0x00));
        transport.inbox.push_back(vec![0xFF]);
        transport.inbox.push_back(command_status(0x2005, 0x00));
        let mut controller = HciController::new(transport);

        controller
            .set_random_address(Address::new([0xC0, 0, 0, 0, 0, 2]))
            .await
            .unwrap();
        assert!(controller.transport().inbox.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_stale_completion_discarded() {
        let transport = FakeTransport::default();
        let mut controller =
            HciController::new(transport).command_timeout(Duration::from_millis(100));

        match controller.stop().await {
            Err(Error::Timeout { command, duration }) => {
                assert_eq!(command, CommandKind::Stop);
                assert_eq!(duration, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        // The late Stop completion arrives ahead of Start's own acknowledgement
        controller.transport.inbox.push_back(complete(0x200A, 0x00));
        controller.transport.inbox.push_back(complete(0x200A, 0x0C));
        assert!(matches!(
            controller.start().await,
            Err(Error::Command { command: CommandKind::Start, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_completion_does_not_cascade() {
        let transport = FakeTransport::default();
        let mut controller =
            HciController::new(transport).command_timeout(Duration::from_millis(100));

        assert!(controller.stop().await.is_err());

        // Only Start's own acknowledgement ever arrives
        controller.transport.inbox.push_back(complete(0x200A, 0x00));
        let started = Instant::now();
        controller.start().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));

        // Nothing stale remains
        controller.transport.inbox.push_back(complete(0x200A, 0x00));
        let started = Instant::now();
        controller.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_seen_during_other_command() {
        let transport = FakeTransport::default();
        let mut controller =
            HciController::new(transport).command_timeout(Duration::from_millis(1000));

        assert!(controller.stop().await.is_err());

        // The late Stop completion shows up while SetAddress is waiting
        controller.transport.inbox.push_back(complete(0x200A, 0x00));
        controller.transport.inbox.push_back(complete(0x2005, 0x00));
        controller
            .set_random_address(Address::new([0xC0, 0, 0, 0, 0, 1]))
            .await
            .unwrap();
        assert!(controller.stale.is_empty());

        controller.transport.inbox.push_back(complete(0x200A, 0x00));
        let started = Instant::now();
        controller.start().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expectation_expires() {
        let transport = FakeTransport::default();
        let mut controller =
            HciController::new(transport).command_timeout(Duration::from_millis(100));

        assert!(controller.stop().await.is_err());
        tokio::time::sleep(Duration::from_millis(250)).await;

        controller.transport.inbox.push_back(complete(0x200A, 0x00));
        controller.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_publishes_controller_events() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(8);
        let transport = FakeTransport {
            auto_ack: true,
            ..Default::default()
        };
        let mut controller = HciController::new(transport).with_events(tx);

        controller.stop().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ControllerEvent::AdvertisingStopped {
                status: StatusCode::SUCCESS
            }
        );
    }
}
