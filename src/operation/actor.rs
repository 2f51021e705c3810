//! Task wrapper running one [`DeviceOperation`].
//!
//! Every device runs in its own task so a stalled port only stalls that
//! device. Commands arrive over a channel and run in the order they were
//! sent. While a phase is running, `Halt` and `Shutdown` cancel it by
//! dropping it; other commands wait in a backlog until the phase ends.
//! `Halt` discards that backlog.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::DeviceOperation;
use crate::transport::Transport;

/// Commands accepted by a device task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Connect,
    Init,
    PostAcquisition,
    Halt,
    SetIdle,
    /// Halt, close the port and end the task.
    Shutdown,
}

impl DeviceCommand {
    const fn interrupts(self) -> bool {
        matches!(self, Self::Halt | Self::Shutdown)
    }
}

/// Handle to a running device task.
#[derive(Debug)]
pub struct DeviceHandle {
    id: String,
    commands: mpsc::UnboundedSender<DeviceCommand>,
    task: JoinHandle<()>,
}

impl DeviceHandle {
    /// Device id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sends a command. Returns false if the task has ended.
    pub fn send(&self, command: DeviceCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Asks the task to shut down and returns its join handle.
    pub fn shutdown(self) -> JoinHandle<()> {
        let _ = self.commands.send(DeviceCommand::Shutdown);
        self.task
    }
}

/// Spawns a task running `operation`.
pub fn spawn<T: Transport + 'static>(operation: DeviceOperation<T>) -> DeviceHandle {
    let id = operation.id().to_owned();
    let (commands, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(operation, rx));
    DeviceHandle { id, commands, task }
}

async fn run<T: Transport>(
    mut op: DeviceOperation<T>,
    mut rx: mpsc::UnboundedReceiver<DeviceCommand>,
) {
    let mut backlog = VecDeque::new();
    loop {
        let command = match backlog.pop_front() {
            Some(command) => command,
            None => match rx.recv().await {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            DeviceCommand::Halt => op.halt(),
            DeviceCommand::Shutdown => break,
            DeviceCommand::SetIdle => {
                if let Err(e) = op.set_idle() {
                    tracing::warn!("{}: {}", op.id(), e);
                }
            }
            DeviceCommand::Connect | DeviceCommand::Init | DeviceCommand::PostAcquisition => {
                let id = op.id().to_owned();
                let interrupt = tokio::select! {
                    biased;
                    interrupt = next_interrupt(&id, &mut rx, &mut backlog) => Some(interrupt),
                    () = step(&mut op, command) => None,
                };
                match interrupt {
                    None => {}
                    Some(Some(DeviceCommand::Halt)) => {
                        if !backlog.is_empty() {
                            tracing::debug!("{}: halt drops {} queued commands", id, backlog.len());
                            backlog.clear();
                        }
                        op.halt();
                    }
                    Some(_) => break,
                }
            }
        }
    }

    op.halt();
    if let Err(e) = op.close().await {
        tracing::warn!("{}: close failed: {}", op.id(), e);
    }
    tracing::debug!("{}: device task finished", op.id());
}

async fn step<T: Transport>(op: &mut DeviceOperation<T>, command: DeviceCommand) {
    // failures are reported as events
    let _ = match command {
        DeviceCommand::Connect => op.connect().await,
        DeviceCommand::Init => op.init_device().await,
        DeviceCommand::PostAcquisition => op.post_acquisition().await,
        DeviceCommand::Halt | DeviceCommand::SetIdle | DeviceCommand::Shutdown => Ok(()),
    };
}

/// Waits for `Halt` or `Shutdown`, moving anything else to the backlog.
/// `None` means the channel closed.
async fn next_interrupt(
    id: &str,
    rx: &mut mpsc::UnboundedReceiver<DeviceCommand>,
    backlog: &mut VecDeque<DeviceCommand>,
) -> Option<DeviceCommand> {
    loop {
        let command = rx.recv().await?;
        if command.interrupts() {
            return Some(command);
        }
        tracing::debug!("{}: busy, queueing {:?}", id, command);
        backlog.push_back(command);
    }
}
