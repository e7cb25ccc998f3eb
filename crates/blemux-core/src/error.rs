//! Error types for blemux-core.
//!
//! # Failure handling in the cycler
//!
//! | Error | Cycler reaction |
//! |-------|-----------------|
//! | [`Error::Command`] / [`Error::Timeout`] on Stop or SetAddress | Log at `warn`, continue |
//! | [`Error::Command`] / [`Error::Timeout`] on SetData, SetParameters, Start | Back off, restart the identity from Stop |
//! | Repeated critical failure | [`Error::RetriesExhausted`] (fatal) |
//! | [`Error::Payload`] | Skip the identity, advertising stays stopped |
//! | [`Error::Transport`] / [`Error::Io`] | Fatal |
//!
//! Only [`Error::Command`] and [`Error::Timeout`] are retryable; see
//! [`Error::is_retryable`].

use std::time::Duration;

use thiserror::Error;

use blemux_types::{PayloadError, RosterError};

use crate::controller::{CommandKind, StatusCode};

/// Errors that can occur while driving an advertising controller.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The link to the controller is unusable.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The controller rejected a command.
    #[error("Command '{command}' failed with status {status}")]
    Command {
        /// The rejected command.
        command: CommandKind,
        /// Status reported by the controller.
        status: StatusCode,
    },

    /// No acknowledgement arrived in time.
    #[error("Command '{command}' timed out after {duration:?}")]
    Timeout {
        /// The command that timed out.
        command: CommandKind,
        /// The timeout duration.
        duration: Duration,
    },

    /// The advertising payload could not be built.
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// The roster is invalid.
    #[error("Roster error: {0}")]
    Roster(#[from] RosterError),

    /// A critical command kept failing.
    #[error("Command '{command}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// The command that failed last.
        command: CommandKind,
        /// Total attempts made, including the first.
        attempts: u32,
        /// The last failure.
        #[source]
        source: Box<Error>,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the host-to-controller link.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The controller device could not be opened.
    #[error("failed to open {device}: {source}")]
    Open {
        /// Device description, e.g. `hci0`.
        device: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The transport was closed or its peer went away.
    #[error("transport closed")]
    Closed,

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The transport is not available on this platform.
    #[error("transport not supported on this platform: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Create a command failure.
    pub fn command(command: CommandKind, status: StatusCode) -> Self {
        Self::Command { command, status }
    }

    /// Create a timeout error.
    pub fn timeout(command: CommandKind, duration: Duration) -> Self {
        Self::Timeout { command, duration }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// The command this error refers to, if any.
    pub fn command_kind(&self) -> Option<CommandKind> {
        match self {
            Error::Command { command, .. }
            | Error::Timeout { command, .. }
            | Error::RetriesExhausted { command, .. } => Some(*command),
            _ => None,
        }
    }

    /// Whether repeating the failed command may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            // The controller may be momentarily busy
            Error::Command { .. } => true,
            // Lost or late acknowledgement
            Error::Timeout { .. } => true,
            // Dead link
            Error::Transport(_) => false,
            Error::Io(_) => false,
            // Same input, same result
            Error::Payload(_) => false,
            Error::Roster(_) => false,
            Error::InvalidConfig(_) => false,
            Error::RetriesExhausted { .. } => false,
            Error::Cancelled => false,
        }
    }
}

/// Result type alias using blemux-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::command(CommandKind::SetData, StatusCode(0x12));
        assert_eq!(
            err.to_string(),
            "Command 'set_data' failed with status 0x12 (invalid parameters)"
        );

        let err = Error::timeout(CommandKind::Start, Duration::from_secs(1));
        assert_eq!(err.to_string(), "Command 'start' timed out after 1s");

        let err = Error::Transport(TransportError::Closed);
        assert_eq!(err.to_string(), "Transport error: transport closed");
    }

    #[test]
    fn test_retries_exhausted_keeps_source() {
        use std::error::Error as _;

        let err = Error::RetriesExhausted {
            command: CommandKind::Start,
            attempts: 4,
            source: Box::new(Error::command(CommandKind::Start, StatusCode(0x0C))),
        };
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(err.source().is_some());
        assert_eq!(err.command_kind(), Some(CommandKind::Start));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::command(CommandKind::Stop, StatusCode(0x0C)).is_retryable());
        assert!(Error::timeout(CommandKind::SetData, Duration::from_millis(5)).is_retryable());
        assert!(!Error::Transport(TransportError::Closed).is_retryable());
        assert!(!Error::Payload(PayloadError::EmptyName).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Io(std::io::Error::other("gone")).is_retryable());
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = PayloadError::EmptyName.into();
        assert!(matches!(err, Error::Payload(PayloadError::EmptyName)));

        let err: Error = RosterError::Empty.into();
        assert!(matches!(err, Error::Roster(RosterError::Empty)));
        assert_eq!(err.command_kind(), None);
    }
}
