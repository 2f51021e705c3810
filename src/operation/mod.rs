//! Per-device operation lifecycle.
//!
//! [`DeviceOperation`] drives one device through connect, init and the
//! post-acquisition loop on top of its [`Session`]. Each phase first
//! exchanges the parameters flagged for it, then runs the attached scripts
//! and writes back whatever the scripts changed. Progress is reported as
//! [`DeviceEvent`]s; the fleet scheduler decides what happens next.
//!
//! ```text
//! Idle -> Connecting -> Idle
//! Idle -> InitParamsStart -> InitParamsDone -> InitScriptsStart -> InitScriptsDone
//! InitScriptsDone | Restart -> PostAcqParamsStart -> PostAcqParamsDone
//!     -> PostAcqScriptsStart -> PostAcqScriptsDone -> Restart
//! any -> Halt -> Idle
//! ```

mod actor;

pub use actor::{DeviceCommand, DeviceHandle, spawn};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event::{DeviceEvent, DeviceEventKind};
use crate::host::{Host, Script};
use crate::session::Session;
use crate::transport::Transport;
use crate::types::{Direction, ParamId, ParamStatus};

/// Lifecycle state of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OperationState {
    #[default]
    Idle,
    Connecting,
    InitParamsStart,
    InitParamsDone,
    InitScriptsStart,
    InitScriptsDone,
    PostAcqParamsStart,
    PostAcqParamsDone,
    PostAcqScriptsStart,
    PostAcqScriptsDone,
    Restart,
    Halt,
}

impl OperationState {
    /// State name, for logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::InitParamsStart => "InitParamsStart",
            Self::InitParamsDone => "InitParamsDone",
            Self::InitScriptsStart => "InitScriptsStart",
            Self::InitScriptsDone => "InitScriptsDone",
            Self::PostAcqParamsStart => "PostAcqParamsStart",
            Self::PostAcqParamsDone => "PostAcqParamsDone",
            Self::PostAcqScriptsStart => "PostAcqScriptsStart",
            Self::PostAcqScriptsDone => "PostAcqScriptsDone",
            Self::Restart => "Restart",
            Self::Halt => "Halt",
        }
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    PostAcquisition,
}

impl Phase {
    /// Params-start, params-done, scripts-start and scripts-done states.
    const fn states(self) -> [OperationState; 4] {
        match self {
            Self::Init => [
                OperationState::InitParamsStart,
                OperationState::InitParamsDone,
                OperationState::InitScriptsStart,
                OperationState::InitScriptsDone,
            ],
            Self::PostAcquisition => [
                OperationState::PostAcqParamsStart,
                OperationState::PostAcqParamsDone,
                OperationState::PostAcqScriptsStart,
                OperationState::PostAcqScriptsDone,
            ],
        }
    }
}

/// Lifecycle driver for one device.
pub struct DeviceOperation<T> {
    id: String,
    session: Session<T>,
    state: OperationState,
    host: Host,
    init_scripts: Vec<Script>,
    post_scripts: Vec<Script>,
    events: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

impl<T: Transport> DeviceOperation<T> {
    /// Creates an idle operation for a device.
    #[must_use]
    pub fn new(id: impl Into<String>, session: Session<T>, host: Host) -> Self {
        Self {
            id: id.into(),
            session,
            state: OperationState::Idle,
            host,
            init_scripts: Vec::new(),
            post_scripts: Vec::new(),
            events: None,
        }
    }

    /// Sets the scripts run during init.
    #[must_use]
    pub fn init_scripts(mut self, scripts: Vec<Script>) -> Self {
        self.init_scripts = scripts;
        self
    }

    /// Sets the scripts run after every acquisition.
    #[must_use]
    pub fn post_acquisition_scripts(mut self, scripts: Vec<Script>) -> Self {
        self.post_scripts = scripts;
        self
    }

    /// Sends lifecycle events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Device id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> OperationState {
        self.state
    }

    /// The device's session.
    #[must_use]
    pub const fn session(&self) -> &Session<T> {
        &self.session
    }

    /// The device's session, for direct requests.
    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    fn emit(&self, kind: DeviceEventKind) {
        if let Some(events) = &self.events {
            // the coordinator may already be gone during shutdown
            let _ = events.send(DeviceEvent::new(self.id.clone(), kind));
        }
    }

    fn set_state(&mut self, state: OperationState) {
        if self.state == state {
            return;
        }
        tracing::debug!("{}: {} -> {}", self.id, self.state, state);
        self.state = state;
        self.emit(DeviceEventKind::StateChanged(state));
    }

    /// Checks whether a trigger may run. A halted device ignores every
    /// trigger with [`Error::PolicyHalt`] until [`DeviceOperation::set_idle`].
    fn admit(&self, trigger: &'static str, allowed: &[OperationState]) -> Result<()> {
        if self.state == OperationState::Halt {
            tracing::debug!("{}: halted, ignoring {}", self.id, trigger);
            return Err(Error::PolicyHalt);
        }
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.state.as_str(),
                trigger,
            })
        }
    }

    /// Opens the port if needed and runs the identity handshake.
    ///
    /// Emits `Connected` or `ConnectionError`; the device ends up `Idle`
    /// either way.
    pub async fn connect(&mut self) -> Result<()> {
        self.admit("connect", &[OperationState::Idle])?;
        self.set_state(OperationState::Connecting);

        let result = async {
            if !self.session.is_connected() {
                self.session.open().await?;
            }
            self.session.identify().await
        }
        .await;

        match result {
            Ok(instance) => {
                if let Some(instance) = instance {
                    tracing::info!(
                        "{}: connected to instance {}",
                        self.id,
                        String::from_utf8_lossy(&instance)
                    );
                } else {
                    tracing::info!("{}: connected", self.id);
                }
                self.set_state(OperationState::Idle);
                self.emit(DeviceEventKind::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{}: connection failed: {}", self.id, e);
                self.session.abort();
                self.set_state(OperationState::Idle);
                self.emit(DeviceEventKind::ConnectionError(e.to_string()));
                Err(e)
            }
        }
    }

    /// Runs the init phase: init parameters, then init scripts.
    ///
    /// Emits `InitDone` and stays in `InitScriptsDone`, or emits
    /// `InitError` and returns to `Idle`.
    pub async fn init_device(&mut self) -> Result<()> {
        self.admit("init", &[OperationState::Idle])?;
        match self.run_phase(Phase::Init).await {
            Ok(()) => {
                tracing::info!("{}: init done", self.id);
                self.emit(DeviceEventKind::InitDone);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{}: init failed in {}: {}", self.id, self.state, e);
                self.session.abort();
                self.set_state(OperationState::Idle);
                self.emit(DeviceEventKind::InitError(e.to_string()));
                Err(e)
            }
        }
    }

    /// Runs one post-acquisition cycle and loops back to `Restart`.
    ///
    /// Emits `PostAcquisitionDone`, or `PostAcquisitionError` and returns
    /// to `Idle`.
    pub async fn post_acquisition(&mut self) -> Result<()> {
        self.admit(
            "post-acquisition",
            &[OperationState::InitScriptsDone, OperationState::Restart],
        )?;
        match self.run_phase(Phase::PostAcquisition).await {
            Ok(()) => {
                self.emit(DeviceEventKind::PostAcquisitionDone);
                self.set_state(OperationState::Restart);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "{}: post-acquisition failed in {}: {}",
                    self.id,
                    self.state,
                    e
                );
                self.session.abort();
                self.set_state(OperationState::Idle);
                self.emit(DeviceEventKind::PostAcquisitionError(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stops the device from any state and drops its pending work.
    ///
    /// Calling it again has no further effect.
    pub fn halt(&mut self) {
        self.session.abort();
        if self.state != OperationState::Halt {
            tracing::info!("{}: halted in {}", self.id, self.state);
            self.set_state(OperationState::Halt);
            self.emit(DeviceEventKind::Halted);
        }
    }

    /// Leaves `Halt`. Only legal from `Halt` or `Idle`.
    pub fn set_idle(&mut self) -> Result<()> {
        match self.state {
            OperationState::Halt | OperationState::Idle => {
                self.set_state(OperationState::Idle);
                Ok(())
            }
            other => Err(Error::InvalidTransition {
                from: other.as_str(),
                trigger: "set idle",
            }),
        }
    }

    /// Closes the port.
    pub async fn close(&mut self) -> Result<()> {
        self.session.close().await
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<()> {
        let [params_start, params_done, scripts_start, scripts_done] = phase.states();

        self.set_state(params_start);
        self.queue_phase_params(phase);
        self.exchange().await?;
        self.set_state(params_done);

        self.set_state(scripts_start);
        let scripts = match phase {
            Phase::Init => self.init_scripts.clone(),
            Phase::PostAcquisition => self.post_scripts.clone(),
        };
        for script in scripts {
            tracing::debug!("{}: running script {}", self.id, script.name);
            let name = script.name.clone();
            let runner = Arc::clone(&self.host.scripts);
            // blocking pool; a halt may drop this await
            let outcome = tokio::task::spawn_blocking(move || runner.run(&script))
                .await
                .unwrap_or_else(|e| Err(format!("script task failed: {e}")));
            outcome.map_err(|reason| Error::ScriptExecution {
                script: name,
                reason,
            })?;
        }
        self.queue_script_writes();
        self.exchange().await?;
        self.set_state(scripts_done);
        Ok(())
    }

    /// Queues every parameter flagged for `phase`: reads for output
    /// parameters and inquirable bidirectional ones, writes otherwise.
    fn queue_phase_params(&mut self, phase: Phase) {
        let flagged: Vec<ParamId> = self
            .session
            .module()
            .params()
            .iter()
            .enumerate()
            .filter(|(_, p)| match phase {
                Phase::Init => p.phases.init,
                Phase::PostAcquisition => p.phases.post_acquisition,
            })
            .map(|(index, _)| ParamId(index))
            .collect();

        for id in flagged {
            let param = self.session.module().param(id);
            let read = match param.direction {
                Direction::Output => true,
                Direction::Bidirectional => param.inquiry_value.is_some(),
                Direction::Input => false,
            };
            if read {
                self.session.request_inquiry(id);
            } else {
                self.pull_variable(id);
                self.session.request_modify(id);
            }
        }
    }

    /// Queues writes for mapped parameters whose variables changed.
    fn queue_script_writes(&mut self) {
        let writable: Vec<ParamId> = self
            .session
            .module()
            .params()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_writable() && p.variable.is_some())
            .map(|(index, _)| ParamId(index))
            .collect();

        for id in writable {
            if self.pull_variable(id) {
                self.session.request_modify(id);
            }
        }
    }

    /// Copies a parameter's variable into it. Returns true if it changed.
    fn pull_variable(&mut self, id: ParamId) -> bool {
        let Some(name) = self.session.module().param(id).variable.clone() else {
            return false;
        };
        let Some(value) = self.host.variables.get_variable(&name) else {
            return false;
        };
        match self.session.module_mut().param_mut(id).set_value(value) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!("{}: ignoring variable {}: {}", self.id, name, e);
                false
            }
        }
    }

    /// Drains the session queues and publishes what was received.
    async fn exchange(&mut self) -> Result<()> {
        let report = self.session.drain().await;
        self.publish_received();
        match report?.failed.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    fn publish_received(&mut self) {
        let variables = &self.host.variables;
        for param in self.session.module_mut().params_mut() {
            if param.status != ParamStatus::Received {
                continue;
            }
            if let Some(name) = &param.variable {
                variables.set_variable(name, &param.value);
            }
            param.status = ParamStatus::Updated;
        }
    }
}
