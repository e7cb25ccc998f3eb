//! Controller binding for host stacks that acknowledge through callbacks.
//!
//! Vendor BLE stacks (for example an ESP32 Bluedroid GAP API) accept a request
//! immediately and report completion later from their own task by invoking a
//! registered callback. [`GapStack`] models the request side; the callback
//! side forwards completions into a [`GapEventSink`], which is safe to call
//! from any thread.
//!
//! [`CallbackController`] turns that pair into request/response calls: each
//! request gets a sequence number and an expected event kind, and waits for
//! the matching event. Events of another kind, and late events from requests
//! that already timed out, are logged and discarded. A late event is only
//! recognised as such if another event of its kind follows before the
//! deadline; otherwise it is taken as the answer.
//!
//! The vendor API takes advertising parameters when advertising starts, so
//! `set_advertising_parameters` only caches them for the next `start`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use blemux_types::{Address, AdvertisingParameters, Payload};

use crate::controller::{CommandKind, Controller, StatusCode};
use crate::error::{Error, Result, TransportError};
use crate::events::{ControllerEvent, ControllerEventSender};

/// Default time to wait for a completion callback.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Completion events reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GapEventKind {
    /// Advertising stopped.
    AdvStopComplete,
    /// Random address set.
    RandAddrSet,
    /// Raw advertising data configured.
    AdvDataRawSetComplete,
    /// Advertising started (or failed to).
    AdvStartComplete,
}

/// One completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapEvent {
    /// Which operation completed.
    pub kind: GapEventKind,
    /// Completion status, mapped onto the HCI status table.
    pub status: StatusCode,
}

impl GapEvent {
    /// A successful completion.
    pub fn success(kind: GapEventKind) -> Self {
        Self {
            kind,
            status: StatusCode::SUCCESS,
        }
    }
}

/// Where the stack's callback delivers completions.
///
/// Cloneable and usable from any thread, including one the async runtime
/// does not own.
#[derive(Debug, Clone)]
pub struct GapEventSink {
    tx: mpsc::UnboundedSender<GapEvent>,
}

impl GapEventSink {
    /// Forward a completion. Returns `false` if the controller is gone.
    pub fn deliver(&self, event: GapEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// The request side of a callback-driven stack.
///
/// Each call only submits the request and returns the submission status;
/// completion arrives later through the [`GapEventSink`].
pub trait GapStack: Send {
    /// Request that advertising stops.
    fn stop_advertising(&mut self) -> std::result::Result<(), StatusCode>;

    /// Request a new random address.
    fn set_rand_addr(&mut self, address: Address) -> std::result::Result<(), StatusCode>;

    /// Configure raw advertising data (significant bytes only).
    fn config_adv_data_raw(&mut self, data: &[u8]) -> std::result::Result<(), StatusCode>;

    /// Request that advertising starts with `params`.
    fn start_advertising(
        &mut self,
        params: &AdvertisingParameters,
    ) -> std::result::Result<(), StatusCode>;
}

#[derive(Debug, Clone, Copy)]
struct StaleRequest {
    seq: u64,
    kind: GapEventKind,
    expires: Instant,
}

/// Controller binding over a [`GapStack`].
pub struct CallbackController<S> {
    stack: S,
    rx: mpsc::UnboundedReceiver<GapEvent>,
    name: String,
    event_timeout: Duration,
    params: AdvertisingParameters,
    seq: u64,
    stale: Vec<StaleRequest>,
    events: Option<ControllerEventSender>,
}

impl<S: GapStack> CallbackController<S> {
    /// Wrap a stack. Register the returned sink with the stack's callback.
    pub fn new(stack: S) -> (Self, GapEventSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            stack,
            rx,
            name: "gap".to_string(),
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            params: AdvertisingParameters::default(),
            seq: 0,
            stale: Vec::new(),
            events: None,
        };
        (controller, GapEventSink { tx })
    }

    /// Set the name reported in logs.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set how long to wait for each completion.
    #[must_use]
    pub fn event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Publish a [`ControllerEvent`] for every completion.
    #[must_use]
    pub fn with_events(mut self, sender: ControllerEventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Access the wrapped stack.
    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Parameters that the next `start` will use.
    pub fn parameters(&self) -> &AdvertisingParameters {
        &self.params
    }

    async fn request<F>(
        &mut self,
        command: CommandKind,
        expected: GapEventKind,
        submit: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut S) -> std::result::Result<(), StatusCode>,
    {
        self.seq += 1;
        let seq = self.seq;

        let now = Instant::now();
        self.stale.retain(|s| s.expires > now);

        if let Err(status) = submit(&mut self.stack) {
            debug!(controller = %self.name, seq, %command, %status, "request rejected on submission");
            return Err(Error::command(command, status));
        }

        let deadline = Instant::now() + self.event_timeout;
        let mut held_back: Option<GapEvent> = None;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(TransportError::Closed.into()),
                Err(_) => {
                    if let Some(event) = held_back {
                        debug!(controller = %self.name, seq, "no second completion, using the held-back event");
                        return self.completed(command, event.status);
                    }
                    self.stale.push(StaleRequest {
                        seq,
                        kind: expected,
                        expires: Instant::now() + self.event_timeout,
                    });
                    return Err(Error::timeout(command, self.event_timeout));
                }
            };

            if event.kind != expected {
                // A late completion for a timed-out request is no longer expected once seen
                if let Some(pos) = self.stale.iter().position(|s| s.kind == event.kind) {
                    self.stale.remove(pos);
                }
                debug!(
                    controller = %self.name,
                    seq,
                    ?event,
                    "discarding event while waiting for {:?}", expected
                );
                continue;
            }

            if let Some(pos) = self.stale.iter().position(|s| s.kind == expected) {
                let late = self.stale.remove(pos);
                debug!(
                    controller = %self.name,
                    ?event,
                    "holding back event that may belong to request #{}", late.seq
                );
                held_back = Some(event);
                continue;
            }

            return self.completed(command, event.status);
        }
    }

    fn completed(&self, command: CommandKind, status: StatusCode) -> Result<()> {
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

#[async_trait]
impl<S: GapStack> Controller for CallbackController<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&mut self) -> Result<()> {
        self.request(CommandKind::Stop, GapEventKind::AdvStopComplete, |stack| {
            stack.stop_advertising()
        })
        .await
    }

    async fn set_random_address(&mut self, address: Address) -> Result<()> {
        self.request(CommandKind::SetAddress, GapEventKind::RandAddrSet, |stack| {
            stack.set_rand_addr(address)
        })
        .await
    }

    async fn set_advertising_data(&mut self, payload: &Payload) -> Result<()> {
        let payload = *payload;
        self.request(
            CommandKind::SetData,
            GapEventKind::AdvDataRawSetComplete,
            move |stack| stack.config_adv_data_raw(payload.as_bytes()),
        )
        .await
    }

    async fn set_advertising_parameters(&mut self, params: &AdvertisingParameters) -> Result<()> {
        self.params = *params;
        self.publish(CommandKind::SetParameters, StatusCode::SUCCESS);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let params = self.params;
        self.request(CommandKind::Start, GapEventKind::AdvStartComplete, move |stack| {
            stack.start_advertising(&params)
        })
        .await
    }
}
