//! # radarfleet
//!
//! Serial command protocol and fleet scheduler for radar acquisition units.
//!
//! This library talks to radar units over USB/Serial with a byte-stuffed
//! framing protocol, drives each unit through its connect, init and
//! post-acquisition phases, and keeps a fleet of units in lock-step.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - One task per device, so a stalled port only stalls that device
//! - Barrier-synchronised acquisition cycles with configurable error and
//!   timeout policies
//! - Event stream for observers
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use radarfleet::{
//!     DeviceModule, DeviceOperation, Direction, Fleet, FleetPolicy, Host, LocalRunLock,
//!     ParamSpec, SerialTransport, Session, ValueType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), radarfleet::Error> {
//!     let module = DeviceModule::builder("radar")
//!         .identity(&b"ID"[..], &b"RDR-24"[..])
//!         .param(
//!             ParamSpec::new("range", Direction::Output, ValueType::U16, &b"RG"[..])
//!                 .on_post_acquisition()
//!                 .variable("range"),
//!         )
//!         .build()?;
//!
//!     let fleet = Fleet::new(
//!         "survey",
//!         FleetPolicy::new().cycle_time_ms(1000),
//!         Arc::new(LocalRunLock::default()),
//!     );
//!     let session = Session::new(SerialTransport::with_port("/dev/ttyUSB0"), module);
//!     fleet
//!         .add_device(DeviceOperation::new("north", session, Host::default()))
//!         .await?;
//!
//!     let mut events = fleet.subscribe(None);
//!     fleet.run().await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Frame codec and command-group payload layout
//! - [`types`] - Parameters, device modules and fleet policies
//! - [`transport`] - Transport implementations (currently USB/Serial)
//! - [`session`] - Per-device request/response engine
//! - [`operation`] - Per-device operation state machine and its task
//! - [`fleet`] - Fleet scheduler and coordinator
//! - [`event`] - Async event system for observers
//! - [`host`] - Collaborators supplied by the embedding application

pub mod error;
pub mod event;
pub mod fleet;
pub mod host;
pub mod operation;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use error::{Error, FrameError, Result};
pub use event::{
    DeviceEvent, DeviceEventKind, EventDispatcher, EventFilter, EventKind, FleetEvent,
    Subscription,
};
pub use fleet::{Barrier, Fleet, Scheduler};
pub use host::{
    DeviceSetup, Host, LocalRunLock, MemoryVariables, NoScripts, ProjectStore, RunLock, Script,
    ScriptRunner, VariableStore,
};
pub use operation::{DeviceCommand, DeviceHandle, DeviceOperation, OperationState};
pub use protocol::{CommandGroup, FrameDecoder, GroupId, decode_frame, encode_frame};
pub use session::{Session, SessionConfig, SessionState};
pub use transport::{SerialConfig, SerialTransport, Transport, serial::list_ports};
pub use types::{
    DeviceModule, Direction, ErrorPolicy, FleetPolicy, ParamId, ParamSpec, ParamStatus,
    ParamValue, TimeoutPolicy, ValueType,
};
