//! Advertisement cycler and controller bindings for the BLE identity
//! multiplexer.
//!
//! A single Bluetooth LE radio is made to appear as several distinct
//! peripherals by rotating through a fixed roster of identities. Each identity
//! (a static random address plus a local name) is advertised for a dwell
//! interval before the next one takes over.
//!
//! # Features
//!
//! - **Cycler**: round-robin sequencing of Stop, SetAddress, SetData,
//!   SetParameters and Start, with dwell, cancellation and back-off
//! - **HCI binding**: raw HCI commands over a byte transport, matched to
//!   Command Complete / Command Status events (Linux raw socket included)
//! - **Callback binding**: for stacks that report completion through
//!   asynchronous callbacks on a foreign thread
//! - **Mock controller**: records every request, with failure injection
//! - **Events**: cycle progress as serializable [`CycleEvent`]s
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use blemux_core::{Cycler, CyclerConfig, HciController};
//! use blemux_types::Roster;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Requires CAP_NET_RAW
//!     let controller = HciController::open(0)?;
//!     let config = CyclerConfig {
//!         dwell: Duration::from_secs(1),
//!         ..Default::default()
//!     };
//!
//!     let mut cycler = Cycler::new(controller, Roster::reference(), config);
//!     let token = cycler.cancellation_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         token.cancel();
//!     });
//!
//!     cycler.run().await?;
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod controller;
pub mod cycler;
pub mod error;
pub mod events;
pub mod hci;
pub mod mock;
pub mod retry;

// Re-export types from blemux-types
pub use blemux_types::{Address, AdvertisingParameters, Identity, Payload, PayloadBuilder, Roster};

// Core exports
pub use controller::{CommandKind, Controller, StatusCode};
pub use cycler::{CycleState, Cycler, CyclerConfig, ParameterPolicy, Phase, StepOutcome};
pub use error::{Error, Result, TransportError};

/// A controller chosen at runtime.
pub type BoxedController = Box<dyn Controller>;

pub use callback::{CallbackController, GapEvent, GapEventKind, GapEventSink, GapStack};
pub use events::{
    ControllerEvent, ControllerEventSender, CycleEvent, EventReceiver, EventSender,
    event_channel,
};
#[cfg(target_os = "linux")]
pub use hci::socket::HciSocket;
pub use hci::{HciCommand, HciController, HciEvent, HciTransport};
pub use mock::{ControllerCall, MockController, MockFailure, MockHandle};
pub use retry::RetryConfig;
