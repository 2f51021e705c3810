//! Fleet coordination.
//!
//! A [`Fleet`] is a handle to one coordinator task. The coordinator owns
//! the [`Scheduler`], the device task handles and the cycle timer; device
//! events, timer expiry and handle requests are processed one at a time,
//! so every barrier decision sees a consistent set of device states.

mod scheduler;

pub use scheduler::{Action, Barrier, Scheduler};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use crate::error::{Error, Result};
use crate::event::{DeviceEvent, EventDispatcher, EventFilter, FleetEvent, Subscription};
use crate::host::{Host, ProjectStore, RunLock};
use crate::operation::{self, DeviceHandle, DeviceOperation, OperationState};
use crate::session::Session;
use crate::transport::{SerialTransport, Transport};
use crate::types::FleetPolicy;

/// Capacity of the observer broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Capacity of the request channel.
const COMMAND_CAPACITY: usize = 32;

enum Command {
    Attach(DeviceHandle, oneshot::Sender<Result<()>>),
    Remove(String, oneshot::Sender<Result<()>>),
    Halt(String, oneshot::Sender<Result<()>>),
    Run(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    SetPolicy(FleetPolicy, oneshot::Sender<()>),
    Snapshot(oneshot::Sender<Vec<(String, OperationState)>>),
    Shutdown,
}

/// Handle to a running fleet of devices.
///
/// Dropping the handle aborts the coordinator; device tasks then halt and
/// close their ports on their own. Use [`Fleet::shutdown`] to wait for that.
pub struct Fleet {
    project: String,
    commands: mpsc::Sender<Command>,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
    dispatcher: EventDispatcher,
    host: Host,
    task: Option<JoinHandle<()>>,
}

impl Fleet {
    /// Creates an empty, stopped fleet for `project`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(project: impl Into<String>, policy: FleetPolicy, run_lock: Arc<dyn RunLock>) -> Self {
        let project = project.into();
        let dispatcher = EventDispatcher::new(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (device_events, event_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            project: project.clone(),
            scheduler: Scheduler::new(policy),
            devices: HashMap::new(),
            retired: Vec::new(),
            dispatcher: dispatcher.clone(),
            run_lock,
            holds_lock: false,
            timer: Box::pin(tokio::time::sleep(Duration::ZERO)),
            timer_armed: false,
        };
        let task = tokio::spawn(coordinator.run(command_rx, event_rx));

        Self {
            project,
            commands,
            device_events,
            dispatcher,
            host: Host::default(),
            task: Some(task),
        }
    }

    /// Sets the collaborators used for devices attached from a project store.
    #[must_use]
    pub fn with_host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    /// Project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Subscribes to fleet events.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        self.dispatcher.subscribe(filter)
    }

    /// The event dispatcher, for [`EventDispatcher::wait_for`].
    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Attaches a device and starts its task.
    ///
    /// A device added while the fleet runs joins after the next barrier.
    pub async fn add_device<T: Transport + 'static>(
        &self,
        operation: DeviceOperation<T>,
    ) -> Result<()> {
        let handle = operation::spawn(operation.with_events(self.device_events.clone()));
        self.request(|reply| Command::Attach(handle, reply)).await?
    }

    /// Halts a device and detaches it.
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        let id = id.to_owned();
        self.request(|reply| Command::Remove(id, reply)).await?
    }

    /// Halts one device. It stays attached but no longer takes part.
    pub async fn halt_device(&self, id: &str) -> Result<()> {
        let id = id.to_owned();
        self.request(|reply| Command::Halt(id, reply)).await?
    }

    /// Resets every device and starts connecting.
    ///
    /// Fails with [`Error::AlreadyRunning`] if this fleet, or another fleet
    /// sharing the run lock, already runs the project.
    pub async fn run(&self) -> Result<()> {
        self.request(Command::Run).await?
    }

    /// Halts every device.
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    /// Replaces the fleet policy.
    pub async fn set_policy(&self, policy: FleetPolicy) -> Result<()> {
        self.request(|reply| Command::SetPolicy(policy, reply)).await
    }

    /// Last known state of every device, ordered by id.
    pub async fn snapshot(&self) -> Result<Vec<(String, OperationState)>> {
        self.request(Command::Snapshot).await
    }

    /// Loads the policy and the attached devices from a project store.
    ///
    /// Devices talk over serial ports. Returns the number of devices
    /// attached.
    pub async fn attach_from_store(&self, store: &dyn ProjectStore) -> Result<usize> {
        self.set_policy(store.policy()?).await?;
        let setups = store.devices()?;
        let count = setups.len();
        for setup in setups {
            let transport = SerialTransport::new(setup.serial);
            let session = Session::with_config(transport, setup.module, setup.session);
            let operation = DeviceOperation::new(setup.id, session, self.host.clone())
                .init_scripts(setup.init_scripts)
                .post_acquisition_scripts(setup.post_acquisition_scripts);
            self.add_device(operation).await?;
        }
        tracing::info!("{}: attached {} devices", self.project, count);
        Ok(count)
    }

    /// Stops the fleet and waits until every device task has finished.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("fleet coordinator failed: {}", e);
            }
        }
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Coordinator {
    project: String,
    scheduler: Scheduler,
    devices: HashMap<String, DeviceHandle>,
    retired: Vec<JoinHandle<()>>,
    dispatcher: EventDispatcher,
    run_lock: Arc<dyn RunLock>,
    holds_lock: bool,
    timer: Pin<Box<Sleep>>,
    timer_armed: bool,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.dispatcher.dispatch(FleetEvent::Device(event.clone()));
                    let actions = self.scheduler.on_event(&event);
                    self.apply(actions);
                }
                () = &mut self.timer, if self.timer_armed => {
                    self.timer_armed = false;
                    let actions = self.scheduler.on_timer();
                    self.apply(actions);
                }
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle(command),
                },
            }
        }
        self.shutdown().await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Attach(handle, reply) => {
                let id = handle.id().to_owned();
                let result = if self.scheduler.add(&id) {
                    tracing::info!("{}: attached {}", self.project, id);
                    self.devices.insert(id, handle);
                    Ok(())
                } else {
                    self.retired.push(handle.shutdown());
                    Err(Error::DuplicateDevice(id))
                };
                let _ = reply.send(result);
            }
            Command::Remove(id, reply) => {
                let result = if self.scheduler.contains(&id) {
                    let actions = self.scheduler.remove(&id);
                    self.apply(actions);
                    Ok(())
                } else {
                    Err(Error::UnknownDevice(id))
                };
                let _ = reply.send(result);
            }
            Command::Halt(id, reply) => {
                let result = if self.scheduler.contains(&id) {
                    let actions = self.scheduler.halt_device(&id);
                    self.apply(actions);
                    Ok(())
                } else {
                    Err(Error::UnknownDevice(id))
                };
                let _ = reply.send(result);
            }
            Command::Run(reply) => {
                let result = self.start();
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let actions = self.scheduler.stop();
                self.apply(actions);
                let _ = reply.send(());
            }
            Command::SetPolicy(policy, reply) => {
                self.scheduler.set_policy(policy);
                let _ = reply.send(());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.scheduler.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.scheduler.is_running() || !self.run_lock.try_acquire(&self.project) {
            return Err(Error::AlreadyRunning(self.project.clone()));
        }
        self.holds_lock = true;
        let actions = self.scheduler.start();
        self.apply(actions);
        Ok(())
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Command { device, command } => match self.devices.get(&device) {
                    Some(handle) => {
                        if !handle.send(command) {
                            tracing::warn!("{}: device task gone, {:?} dropped", device, command);
                        }
                    }
                    None => tracing::warn!("{}: not attached, {:?} dropped", device, command),
                },
                Action::Detach(device) => {
                    if let Some(handle) = self.devices.remove(&device) {
                        self.retired.push(handle.shutdown());
                    }
                }
                Action::ArmTimer(period) => {
                    self.timer.as_mut().reset(Instant::now() + period);
                    self.timer_armed = true;
                }
                Action::CancelTimer => self.timer_armed = false,
                Action::Emit(event) => {
                    if event == FleetEvent::Stopped {
                        self.release_lock();
                    }
                    self.dispatcher.dispatch(event);
                }
            }
        }
    }

    fn release_lock(&mut self) {
        if self.holds_lock {
            self.holds_lock = false;
            self.run_lock.release(&self.project);
        }
    }

    async fn shutdown(mut self) {
        let actions = self.scheduler.stop();
        self.apply(actions);
        self.release_lock();

        let mut tasks = std::mem::take(&mut self.retired);
        tasks.extend(self.devices.drain().map(|(_, handle)| handle.shutdown()));
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("device task failed: {}", e);
            }
        }
        tracing::debug!("{}: coordinator finished", self.project);
    }
}
