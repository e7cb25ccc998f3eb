//! The radio-control capability the cycler drives.
//!
//! A [`Controller`] exposes the five legacy advertising commands. Each call is
//! a bounded request/response: it resolves once the controller has
//! acknowledged the command, failed it, or the binding's timeout elapsed.
//!
//! Bindings:
//!
//! - [`HciController`](crate::hci::HciController) speaks HCI over any
//!   [`HciTransport`](crate::hci::HciTransport), such as the Linux raw socket.
//! - [`CallbackController`](crate::callback::CallbackController) adapts a host
//!   stack that acknowledges through asynchronous callbacks.
//! - [`MockController`](crate::mock::MockController) records calls for tests
//!   and dry runs.

use core::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use blemux_types::{Address, AdvertisingParameters, Payload};

use crate::error::Result;

/// The controller command a request or failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Disable advertising.
    Stop,
    /// Set the random device address.
    SetAddress,
    /// Load the advertising payload.
    SetData,
    /// Configure interval, type, channels and filtering.
    SetParameters,
    /// Enable advertising.
    Start,
}

impl CommandKind {
    /// All commands in the order the cycler issues them.
    pub const SEQUENCE: [CommandKind; 5] = [
        CommandKind::Stop,
        CommandKind::SetAddress,
        CommandKind::SetData,
        CommandKind::SetParameters,
        CommandKind::Start,
    ];

    /// Whether a failure of this command must be retried before advertising
    /// can continue.
    ///
    /// Stop and SetAddress failures leave the controller in a usable state
    /// (already stopped, or advertising with the previous address), so the
    /// cycler logs them and carries on.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            CommandKind::SetData | CommandKind::SetParameters | CommandKind::Start
        )
    }

    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Stop => "stop",
            CommandKind::SetAddress => "set_address",
            CommandKind::SetData => "set_data",
            CommandKind::SetParameters => "set_parameters",
            CommandKind::Start => "start",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw status byte reported by the controller for a command.
///
/// Values follow the HCI error code table (Core Vol 1, Part F). The callback
/// binding maps its stack's completion status onto the same byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u8);

impl StatusCode {
    /// Command succeeded.
    pub const SUCCESS: StatusCode = StatusCode(0x00);
    /// Unknown HCI command.
    pub const UNKNOWN_COMMAND: StatusCode = StatusCode(0x01);
    /// Hardware failure.
    pub const HARDWARE_FAILURE: StatusCode = StatusCode(0x03);
    /// Memory capacity exceeded.
    pub const MEMORY_CAPACITY_EXCEEDED: StatusCode = StatusCode(0x07);
    /// Command disallowed in the current state.
    pub const COMMAND_DISALLOWED: StatusCode = StatusCode(0x0C);
    /// Unsupported feature or parameter value.
    pub const UNSUPPORTED_PARAMETER: StatusCode = StatusCode(0x11);
    /// Invalid HCI command parameters.
    pub const INVALID_PARAMETERS: StatusCode = StatusCode(0x12);
    /// Unspecified error.
    pub const UNSPECIFIED: StatusCode = StatusCode(0x1F);
    /// Controller busy.
    pub const CONTROLLER_BUSY: StatusCode = StatusCode(0x3A);

    /// Whether this is the success status.
    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    /// Human-readable name for common codes.
    pub fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::SUCCESS => "success",
            Self::UNKNOWN_COMMAND => "unknown command",
            Self::HARDWARE_FAILURE => "hardware failure",
            Self::MEMORY_CAPACITY_EXCEEDED => "memory capacity exceeded",
            Self::COMMAND_DISALLOWED => "command disallowed",
            Self::UNSUPPORTED_PARAMETER => "unsupported feature or parameter value",
            Self::INVALID_PARAMETERS => "invalid parameters",
            Self::UNSPECIFIED => "unspecified error",
            Self::CONTROLLER_BUSY => "controller busy",
            _ => return None,
        })
    }
}

impl From<u8> for StatusCode {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "0x{:02X} ({})", self.0, name),
            None => write!(f, "0x{:02X}", self.0),
        }
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({})", self)
    }
}

/// Legacy advertising control.
///
/// Implementations must not return before the controller has acknowledged
/// the request (or a timeout has elapsed), so that at most one request is
/// ever in flight.
///
/// # Example
///
/// ```
/// use blemux_core::{Controller, MockController, Result};
///
/// async fn restart<C: Controller>(controller: &mut C) -> Result<()> {
///     controller.stop().await?;
///     controller.start().await
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut mock = MockController::new();
/// restart(&mut mock).await.unwrap();
/// # }
/// ```
#[async_trait]
pub trait Controller: Send {
    /// Name of this controller for logs.
    fn name(&self) -> &str;

    /// Disable advertising. Succeeds when advertising is already disabled.
    async fn stop(&mut self) -> Result<()>;

    /// Set the random address used while advertising.
    async fn set_random_address(&mut self, address: Address) -> Result<()>;

    /// Load the advertising payload.
    async fn set_advertising_data(&mut self, payload: &Payload) -> Result<()>;

    /// Configure advertising parameters.
    async fn set_advertising_parameters(&mut self, params: &AdvertisingParameters) -> Result<()>;

    /// Enable advertising.
    async fn start(&mut self) -> Result<()>;

    /// Release the underlying handle.
    ///
    /// The default implementation does nothing.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<C: Controller + ?Sized> Controller for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn stop(&mut self) -> Result<()> {
        (**self).stop().await
    }

    async fn set_random_address(&mut self, address: Address) -> Result<()> {
        (**self).set_random_address(address).await
    }

    async fn set_advertising_data(&mut self, payload: &Payload) -> Result<()> {
        (**self).set_advertising_data(payload).await
    }

    async fn set_advertising_parameters(&mut self, params: &AdvertisingParameters) -> Result<()> {
        (**self).set_advertising_parameters(params).await
    }

    async fn start(&mut self) -> Result<()> {
        (**self).start().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}
