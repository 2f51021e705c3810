//! Data types for radar devices and fleets.
//!
//! This module contains the core data structures used throughout the library:
//! - Parameters, their values and wire types
//! - Device modules (parameter arenas with command-group indexes)
//! - Fleet policies

pub mod module;
pub mod param;
pub mod policy;

pub use module::{DeviceModule, DeviceModuleBuilder, Identity};
pub use param::{
    Direction, ParamId, ParamSpec, ParamStatus, ParamValue, PayloadSize, PhaseFlags, ValueType,
};
pub use policy::{DEFAULT_REINIT_LIMIT, ErrorPolicy, FleetPolicy, TimeoutPolicy};
