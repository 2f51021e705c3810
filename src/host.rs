//! Collaborators provided by the host application.
//!
//! The core never interprets scripts, stores variables or persists
//! projects itself; it calls these traits at the points where it needs
//! them. In-memory implementations are provided for hosts without a
//! scripting engine and for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::session::SessionConfig;
use crate::transport::SerialConfig;
use crate::types::{DeviceModule, FleetPolicy, ParamValue};

/// A script attached to a device phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Name used in logs and errors.
    pub name: String,
    /// Script text, passed to the runner unchanged.
    pub source: String,
}

impl Script {
    /// Creates a script.
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Runs device scripts.
///
/// Scripts run on tokio's blocking pool. Halting a device stops waiting for
/// its script, but the script itself runs to completion.
pub trait ScriptRunner: Send + Sync {
    /// Runs one script to completion, returning the failure reason on error.
    fn run(&self, script: &Script) -> std::result::Result<(), String>;
}

/// Named values shared between devices and scripts.
pub trait VariableStore: Send + Sync {
    /// Publishes a value.
    fn set_variable(&self, name: &str, value: &ParamValue);

    /// Reads a value, if set.
    fn get_variable(&self, name: &str) -> Option<ParamValue>;
}

/// Everything needed to attach one device.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    /// Device id, unique within the fleet.
    pub id: String,
    /// Serial port settings.
    pub serial: SerialConfig,
    /// Transaction timeouts.
    pub session: SessionConfig,
    /// Parameter definitions.
    pub module: DeviceModule,
    /// Scripts run after the init parameters.
    pub init_scripts: Vec<Script>,
    /// Scripts run after the post-acquisition parameters.
    pub post_acquisition_scripts: Vec<Script>,
}

/// Persisted project configuration.
pub trait ProjectStore: Send + Sync {
    /// Fleet policy of the project.
    fn policy(&self) -> Result<FleetPolicy>;

    /// Devices attached to the project, with their scripts.
    fn devices(&self) -> Result<Vec<DeviceSetup>>;
}

/// Mutual exclusion between fleets sharing a project.
pub trait RunLock: Send + Sync {
    /// Claims the project. Returns false if another fleet holds it.
    fn try_acquire(&self, project: &str) -> bool;

    /// Releases a claim taken with [`RunLock::try_acquire`].
    fn release(&self, project: &str);
}

/// Script runner for hosts without a scripting engine.
///
/// Rejects every script, so a device with attached scripts fails its phase
/// instead of silently skipping them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScripts;

impl ScriptRunner for NoScripts {
    fn run(&self, script: &Script) -> std::result::Result<(), String> {
        Err(format!("no script runner for '{}'", script.name))
    }
}

/// In-memory variable store.
#[derive(Debug, Default)]
pub struct MemoryVariables {
    values: Mutex<HashMap<String, ParamValue>>,
}

impl MemoryVariables {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl VariableStore for MemoryVariables {
    fn set_variable(&self, name: &str, value: &ParamValue) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), value.clone());
    }

    fn get_variable(&self, name: &str) -> Option<ParamValue> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Process-local run lock.
#[derive(Debug, Default)]
pub struct LocalRunLock {
    running: Mutex<HashSet<String>>,
}

impl RunLock for LocalRunLock {
    fn try_acquire(&self, project: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project.to_owned())
    }

    fn release(&self, project: &str) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project);
    }
}

/// Collaborators shared by all devices of a fleet.
#[derive(Clone)]
pub struct Host {
    /// Script runner.
    pub scripts: Arc<dyn ScriptRunner>,
    /// Variable store.
    pub variables: Arc<dyn VariableStore>,
}

impl Host {
    /// Creates a host from its collaborators.
    #[must_use]
    pub fn new(scripts: Arc<dyn ScriptRunner>, variables: Arc<dyn VariableStore>) -> Self {
        Self { scripts, variables }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new(Arc::new(NoScripts), Arc::new(MemoryVariables::new()))
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}
