//! The advertisement cycler.
//!
//! Drives one controller through the roster in round-robin order. For each
//! identity it issues, strictly in sequence:
//!
//! 1. Stop
//! 2. SetAddress
//! 3. SetData (payload built immediately before)
//! 4. SetParameters (every cycle, or once, see [`ParameterPolicy`])
//! 5. Start
//!
//! then dwells and advances to the next identity.
//!
//! Cancellation is checked before every request and during the dwell. A
//! request already sent is always awaited, so once the token fires the next
//! and last request is the final Stop issued by [`Cycler::shutdown`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use blemux_core::{Cycler, CyclerConfig, MockController};
//! use blemux_types::Roster;
//!
//! # #[tokio::main]
//! # async fn main() -> blemux_core::Result<()> {
//! let config = CyclerConfig {
//!     dwell: Duration::ZERO,
//!     ..Default::default()
//! };
//! let mut cycler = Cycler::new(MockController::new(), Roster::reference(), config);
//!
//! cycler.run_rounds(3).await?;
//! assert_eq!(cycler.state().round, 1);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use blemux_types::{AdvertisingParameters, BuiltPayload, Identity, PayloadBuilder, PayloadError, Roster};

use crate::controller::{CommandKind, Controller};
use crate::error::{Error, Result};
use crate::events::{CycleEvent, EventSender};
use crate::retry::RetryConfig;

/// Where the cycler is within the per-identity sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Waiting for Stop.
    Stopping,
    /// Waiting for SetAddress.
    SettingAddress,
    /// Waiting for SetData.
    SettingData,
    /// Waiting for SetParameters.
    SettingParams,
    /// Waiting for Start.
    Starting,
    /// The current identity is on air.
    Advertising,
}

/// Snapshot of the cycler's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleState {
    /// Roster index of the identity being (or about to be) announced.
    pub current_index: usize,
    /// Progress through the command sequence.
    pub phase: Phase,
    /// Completed passes over the roster.
    pub round: u64,
}

/// When advertising parameters are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterPolicy {
    /// Before every Start.
    #[default]
    EveryCycle,
    /// Until accepted once, and again whenever the parameters change.
    Once,
}

/// Result of one [`Cycler::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The identity is being advertised.
    Advertising,
    /// The identity's payload could not be built; advertising is stopped.
    Skipped,
    /// Cancellation was requested before the sequence completed.
    Cancelled,
}

/// Cycler settings.
#[derive(Debug, Clone)]
pub struct CyclerConfig {
    /// How long each identity stays on air.
    pub dwell: Duration,
    /// Parameters sent with SetParameters.
    pub parameters: AdvertisingParameters,
    /// When parameters are sent.
    pub parameter_policy: ParameterPolicy,
    /// Payload layout.
    pub payload: PayloadBuilder,
    /// Back-off for critical command failures.
    pub retry: RetryConfig,
}

impl Default for CyclerConfig {
    fn default() -> Self {
        Self {
            dwell: Duration::from_secs(1),
            parameters: AdvertisingParameters::default(),
            parameter_policy: ParameterPolicy::default(),
            payload: PayloadBuilder::default(),
            retry: RetryConfig::default(),
        }
    }
}

enum Announcement {
    Advertising(BuiltPayload),
    Skipped(PayloadError),
    Cancelled,
}

/// Round-robin advertiser over a fixed roster.
///
/// Owns its controller exclusively; get it back with [`Cycler::into_inner`].
pub struct Cycler<C> {
    controller: C,
    roster: Roster,
    config: CyclerConfig,
    state: CycleState,
    /// Parameters the controller last accepted.
    params_sent: Option<AdvertisingParameters>,
    cancel: CancellationToken,
    events: Option<EventSender>,
}

impl<C: Controller> Cycler<C> {
    /// Create a cycler positioned at the first identity.
    pub fn new(controller: C, roster: Roster, config: CyclerConfig) -> Self {
        Self {
            controller,
            roster,
            config,
            state: CycleState::default(),
            params_sent: None,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Publish [`CycleEvent`]s on `sender`.
    #[must_use]
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// A token that stops the cycle when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current position.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// The roster being cycled.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The controller being driven.
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Replace the advertising parameters from the next identity on.
    pub fn set_parameters(&mut self, parameters: AdvertisingParameters) {
        self.config.parameters = parameters;
    }

    /// Release the controller.
    pub fn into_inner(self) -> C {
        self.controller
    }

    /// Announce the current identity and advance to the next one.
    ///
    /// Critical command failures are retried from Stop with back-off; see the
    /// [error module](crate::error) for the full policy.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let index = self.state.current_index;
        let Some(identity) = self.roster.get(index).cloned() else {
            return Err(Error::invalid_config(format!(
                "cycle index {} outside roster of {}",
                index,
                self.roster.len()
            )));
        };

        let mut attempt = 0u32;
        loop {
            match self.announce(index, &identity).await {
                Ok(Announcement::Advertising(built)) => {
                    info!(
                        index,
                        round = self.state.round,
                        "Broadcasting {} with address {}",
                        identity.name(),
                        identity.address()
                    );
                    if built.truncated {
                        debug!(
                            "Name '{}' truncated to {} bytes",
                            identity.name(),
                            built.name_len
                        );
                    }
                    self.emit(CycleEvent::Announced {
                        index,
                        round: self.state.round,
                        name: identity.name().to_string(),
                        address: identity.address(),
                        name_len: built.name_len,
                        truncated: built.truncated,
                        at: OffsetDateTime::now_utc(),
                    });
                    self.advance();
                    return Ok(StepOutcome::Advertising);
                }
                Ok(Announcement::Skipped(err)) => {
                    warn!("Skipping {} ({}): {}", identity.name(), identity.address(), err);
                    self.emit(CycleEvent::Skipped {
                        index,
                        name: identity.name().to_string(),
                        reason: err.to_string(),
                        at: OffsetDateTime::now_utc(),
                    });
                    self.state.phase = Phase::Idle;
                    self.advance();
                    return Ok(StepOutcome::Skipped);
                }
                Ok(Announcement::Cancelled) => return Ok(StepOutcome::Cancelled),
                Err(err) => {
                    let command = match err.command_kind() {
                        Some(command) if err.is_retryable() => command,
                        _ => {
                            error!("Fatal error while announcing {}: {}", identity.name(), err);
                            self.emit_failure(index, &err, true);
                            return Err(err);
                        }
                    };

                    if attempt >= self.config.retry.max_retries {
                        error!(
                            "{} for {} failed after {} attempts: {}",
                            command,
                            identity.name(),
                            attempt + 1,
                            err
                        );
                        self.emit_failure(index, &err, true);
                        return Err(Error::RetriesExhausted {
                            command,
                            attempts: attempt + 1,
                            source: Box::new(err),
                        });
                    }

                    let delay = self.config.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        "{} for {} failed ({}), restarting from stop in {:?} (retry {}/{})",
                        command,
                        identity.name(),
                        err,
                        delay,
                        attempt,
                        self.config.retry.max_retries
                    );
                    self.emit_failure(index, &err, false);
                    self.emit(CycleEvent::Retrying {
                        index,
                        command,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        at: OffsetDateTime::now_utc(),
                    });

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(StepOutcome::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Cycle until the cancellation token fires, then shut down.
    ///
    /// Returns the first fatal error, after still attempting the final Stop.
    pub async fn run(&mut self) -> Result<()> {
        self.drive(None).await
    }

    /// Announce `steps` identities (dwelling after each), then shut down.
    ///
    /// Stops early if cancelled.
    pub async fn run_rounds(&mut self, steps: usize) -> Result<()> {
        self.drive(Some(steps)).await
    }

    /// Stop advertising and release the controller.
    ///
    /// A failing Stop is logged; a failing close is returned.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.state.phase = Phase::Stopping;
        if let Err(e) = self.controller.stop().await {
            warn!("Final stop on {} failed: {}", self.controller.name(), e);
        }
        self.state.phase = Phase::Idle;

        let closed = self.controller.close().await;
        info!("Advertising stopped, released {}", self.controller.name());
        self.emit(CycleEvent::Shutdown {
            at: OffsetDateTime::now_utc(),
        });
        closed
    }

    async fn drive(&mut self, limit: Option<usize>) -> Result<()> {
        info!(
            "Cycling {} identities on {} (dwell {:?})",
            self.roster.len(),
            self.controller.name(),
            self.config.dwell
        );

        let mut steps = 0usize;
        let result = loop {
            if limit.is_some_and(|n| steps >= n) {
                break Ok(());
            }
            match self.step().await {
                Ok(StepOutcome::Cancelled) => break Ok(()),
                Ok(_) => steps += 1,
                Err(e) => break Err(e),
            }
            if !self.dwell().await {
                break Ok(());
            }
        };

        if self.cancel.is_cancelled() {
            debug!("Cycle cancelled after {} steps", steps);
        }
        let shutdown = self.shutdown().await;
        result.and(shutdown)
    }

    /// Wait out the dwell. Returns `false` if cancelled.
    async fn dwell(&self) -> bool {
        if self.config.dwell.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.dwell) => true,
        }
    }

    async fn announce(&mut self, index: usize, identity: &Identity) -> Result<Announcement> {
        if self.cancel.is_cancelled() {
            return Ok(Announcement::Cancelled);
        }
        self.state.phase = Phase::Stopping;
        let stopped = self.controller.stop().await;
        self.tolerate(index, stopped)?;

        if self.cancel.is_cancelled() {
            return Ok(Announcement::Cancelled);
        }
        self.state.phase = Phase::SettingAddress;
        let addressed = self
            .controller
            .set_random_address(identity.address())
            .await;
        self.tolerate(index, addressed)?;

        let built = match self.config.payload.build(identity) {
            Ok(built) => built,
            Err(e) => return Ok(Announcement::Skipped(e)),
        };

        if self.cancel.is_cancelled() {
            return Ok(Announcement::Cancelled);
        }
        self.state.phase = Phase::SettingData;
        self.controller.set_advertising_data(&built.payload).await?;

        if self.needs_parameters() {
            if self.cancel.is_cancelled() {
                return Ok(Announcement::Cancelled);
            }
            self.state.phase = Phase::SettingParams;
            let parameters = self.config.parameters;
            self.controller
                .set_advertising_parameters(&parameters)
                .await?;
            self.params_sent = Some(parameters);
        }

        if self.cancel.is_cancelled() {
            return Ok(Announcement::Cancelled);
        }
        self.state.phase = Phase::Starting;
        self.controller.start().await?;
        self.state.phase = Phase::Advertising;

        Ok(Announcement::Advertising(built))
    }

    /// Swallow retryable failures of non-critical commands.
    fn tolerate(&self, index: usize, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_retryable() && e.command_kind().is_some_and(|c| !c.is_critical()) => {
                let command = e.command_kind().map_or("command", |c| c.as_str());
                warn!("{} failed on {}, continuing: {}", command, self.controller.name(), e);
                self.emit_failure(index, &e, false);
                Ok(())
            }
            other => other,
        }
    }

    fn needs_parameters(&self) -> bool {
        match self.config.parameter_policy {
            ParameterPolicy::EveryCycle => true,
            ParameterPolicy::Once => self.params_sent != Some(self.config.parameters),
        }
    }

    fn advance(&mut self) {
        self.state.current_index = self.roster.next_index(self.state.current_index);
        if self.state.current_index == 0 {
            self.state.round += 1;
        }
    }

    fn emit_failure(&self, index: usize, err: &Error, fatal: bool) {
        if let Some(command) = err.command_kind() {
            self.emit(CycleEvent::CommandFailed {
                index,
                command,
                error: err.to_string(),
                fatal,
                at: OffsetDateTime::now_utc(),
            });
        }
    }

    fn emit(&self, event: CycleEvent) {
        if let Some(sender) = &self.events {
            // Ignore error if no receivers
            let _ = sender.send(event);
        }
    }
}
