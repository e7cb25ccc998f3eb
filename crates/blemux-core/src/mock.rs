//! Mock controller implementation for testing and dry runs.
//!
//! This module provides a controller that records every call without
//! requiring Bluetooth hardware. It backs the CLI's `--simulate` mode and the
//! cycler tests.
//!
//! # Features
//!
//! - **Call recording**: Every request is logged as a [`ControllerCall`]
//! - **Failure injection**: Fail the n-th occurrence of a command with a status,
//!   a timeout, or a transport error
//! - **Latency simulation**: Add artificial delays to every request
//! - **Cancellation injection**: Cancel a token when a given call is made

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use blemux_types::{Address, AdvertisingParameters, Payload};

use crate::controller::{CommandKind, Controller, StatusCode};
use crate::error::{Error, Result, TransportError};
use crate::events::{ControllerEvent, ControllerEventSender};

/// One recorded controller request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCall {
    /// `stop()`
    Stop,
    /// `set_random_address()`
    SetRandomAddress(Address),
    /// `set_advertising_data()`
    SetAdvertisingData(Payload),
    /// `set_advertising_parameters()`
    SetAdvertisingParameters(AdvertisingParameters),
    /// `start()`
    Start,
    /// `close()`
    Close,
}

impl ControllerCall {
    /// The command this call issued, or `None` for `close()`.
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            ControllerCall::Stop => Some(CommandKind::Stop),
            ControllerCall::SetRandomAddress(_) => Some(CommandKind::SetAddress),
            ControllerCall::SetAdvertisingData(_) => Some(CommandKind::SetData),
            ControllerCall::SetAdvertisingParameters(_) => Some(CommandKind::SetParameters),
            ControllerCall::Start => Some(CommandKind::Start),
            ControllerCall::Close => None,
        }
    }
}

/// How an injected failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// The controller rejects the command with this status.
    Status(StatusCode),
    /// No acknowledgement arrives.
    Timeout,
    /// The transport goes away.
    Transport,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    command: CommandKind,
    /// 1-based occurrence of `command`; `None` fails every occurrence.
    occurrence: Option<u32>,
    failure: MockFailure,
}

/// Shared view of a [`MockController`]'s call log.
///
/// Obtain one with [`MockController::handle`] before moving the controller
/// into a cycler.
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    calls: Arc<Mutex<Vec<ControllerCall>>>,
}

impl MockHandle {
    /// All calls made so far, in order.
    pub async fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().await.clone()
    }

    /// Addresses passed to `set_random_address`, in order.
    pub async fn addresses(&self) -> Vec<Address> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                ControllerCall::SetRandomAddress(address) => Some(*address),
                _ => None,
            })
            .collect()
    }

    /// Number of calls that issued `command`.
    pub async fn count(&self, command: CommandKind) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.kind() == Some(command))
            .count()
    }

    /// Forget all recorded calls.
    pub async fn clear(&self) {
        self.calls.lock().await.clear();
    }
}

/// A mock advertising controller for testing.
///
/// Implements [`Controller`] so it can stand in for a real binding.
///
/// # Example
///
/// ```
/// use blemux_core::{CommandKind, Controller, MockController, StatusCode};
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut mock = MockController::new().fail_on(CommandKind::Start, 1, StatusCode::COMMAND_DISALLOWED);
/// let handle = mock.handle();
///
/// mock.stop().await.unwrap();
/// assert!(mock.start().await.is_err());
/// assert!(mock.start().await.is_ok());
/// assert_eq!(handle.count(CommandKind::Start).await, 2);
/// # }
/// ```
#[derive(Debug)]
pub struct MockController {
    name: String,
    handle: MockHandle,
    counts: HashMap<CommandKind, u32>,
    total_calls: usize,
    keep_calls: bool,
    failures: Vec<InjectedFailure>,
    latency: Duration,
    timeout: Duration,
    cancel_at: Option<(usize, CancellationToken)>,
    events: Option<ControllerEventSender>,
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockController {
    /// Create a mock controller that accepts every command.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            handle: MockHandle::default(),
            counts: HashMap::new(),
            total_calls: 0,
            keep_calls: true,
            failures: Vec::new(),
            latency: Duration::ZERO,
            timeout: Duration::from_secs(1),
            cancel_at: None,
            events: None,
        }
    }

    /// Set the name reported in logs.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reject the `occurrence`-th (1-based) `command` with `status`.
    #[must_use]
    pub fn fail_on(self, command: CommandKind, occurrence: u32, status: StatusCode) -> Self {
        self.inject(command, Some(occurrence), MockFailure::Status(status))
    }

    /// Reject every `command` with `status`.
    #[must_use]
    pub fn fail_always(self, command: CommandKind, status: StatusCode) -> Self {
        self.inject(command, None, MockFailure::Status(status))
    }

    /// Let the `occurrence`-th `command` go unacknowledged.
    #[must_use]
    pub fn timeout_on(self, command: CommandKind, occurrence: u32) -> Self {
        self.inject(command, Some(occurrence), MockFailure::Timeout)
    }

    /// Lose the transport on the `occurrence`-th `command`.
    #[must_use]
    pub fn transport_failure_on(self, command: CommandKind, occurrence: u32) -> Self {
        self.inject(command, Some(occurrence), MockFailure::Transport)
    }

    /// Inject an arbitrary failure.
    #[must_use]
    pub fn inject(
        mut self,
        command: CommandKind,
        occurrence: Option<u32>,
        failure: MockFailure,
    ) -> Self {
        self.failures.push(InjectedFailure {
            command,
            occurrence,
            failure,
        });
        self
    }

    /// Delay every request by `latency`.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Duration reported by injected timeouts (no actual wait happens).
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether calls are kept in the log (default `true`).
    ///
    /// Long-running simulations turn this off so the log does not grow.
    #[must_use]
    pub fn keep_calls(mut self, keep: bool) -> Self {
        self.keep_calls = keep;
        self
    }

    /// Cancel `token` when the `index`-th (0-based) call is made.
    ///
    /// The call itself completes normally.
    #[must_use]
    pub fn cancel_on_call(mut self, index: usize, token: CancellationToken) -> Self {
        self.cancel_at = Some((index, token));
        self
    }

    /// Publish a [`ControllerEvent`] for every acknowledged command.
    #[must_use]
    pub fn with_events(mut self, sender: ControllerEventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// A handle onto the call log that stays valid after the controller moves.
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    async fn record(&mut self, call: ControllerCall) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let kind = call.kind();
        let index = self.total_calls;
        self.total_calls += 1;
        if self.keep_calls {
            self.handle.calls.lock().await.push(call);
        }

        if let Some((at, token)) = &self.cancel_at
            && *at == index
        {
            debug!("mock cancelling token at call {}", index);
            token.cancel();
        }

        let Some(command) = kind else {
            return Ok(());
        };

        let count = self.counts.entry(command).or_insert(0);
        *count += 1;
        let occurrence = *count;

        let failure = self
            .failures
            .iter()
            .find(|f| {
                f.command == command && f.occurrence.is_none_or(|n| n == occurrence)
            })
            .map(|f| f.failure);

        match failure {
            None => {
                self.publish(command, StatusCode::SUCCESS);
                Ok(())
            }
            Some(MockFailure::Status(status)) => {
                self.publish(command, status);
                Err(Error::command(command, status))
            }
            Some(MockFailure::Timeout) => Err(Error::timeout(command, self.timeout)),
            Some(MockFailure::Transport) => Err(TransportError::Closed.into()),
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

#[async_trait]
impl Controller for MockController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&mut self) -> Result<()> {
        self.record(ControllerCall::Stop).await
    }

    async fn set_random_address(&mut self, address: Address) -> Result<()> {
        self.record(ControllerCall::SetRandomAddress(address)).await
    }

    async fn set_advertising_data(&mut self, payload: &Payload) -> Result<()> {
        self.record(ControllerCall::SetAdvertisingData(*payload))
            .await
    }

    async fn set_advertising_parameters(&mut self, params: &AdvertisingParameters) -> Result<()> {
        self.record(ControllerCall::SetAdvertisingParameters(*params))
            .await
    }

    async fn start(&mut self) -> Result<()> {
        self.record(ControllerCall::Start).await
    }

    async fn close(&mut self) -> Result<()> {
        self.record(ControllerCall::Close).await
    }
}
