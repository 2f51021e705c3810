//! Per-device transaction engine.
//!
//! A [`Session`] owns one device's transport and module definition and runs
//! exactly one request/response exchange at a time. Requests either run
//! directly through [`Session::transact`] or are queued with
//! [`Session::request_inquiry`] / [`Session::request_modify`] and worked off
//! by [`Session::drain`]. Both paths share one exchange routine.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::{
    FrameDecoder, GroupId, command_label, decode_response, encode_for_transmission, encode_frame,
};
use crate::transport::Transport;
use crate::types::{DeviceModule, ParamId, ParamStatus};

/// Default time allowed for writing a request.
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_millis(150);

/// Default time allowed for a complete response frame.
pub const DEFAULT_RX_TIMEOUT: Duration = Duration::from_millis(800);

/// Timeouts for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Write timeout.
    pub tx_timeout: Duration,
    /// Response timeout, measured from the end of the write.
    pub rx_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tx_timeout: DEFAULT_TX_TIMEOUT,
            rx_timeout: DEFAULT_RX_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// Sets the response timeout.
    #[must_use]
    pub const fn rx_timeout(mut self, timeout: Duration) -> Self {
        self.rx_timeout = timeout;
        self
    }
}

/// Transaction state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Transmitting,
    Receiving,
    ReceiveDone,
    Error,
    Timeout,
}

/// Outcome of one queued request.
#[derive(Debug)]
pub struct Completion {
    /// Group that was exchanged.
    pub group: GroupId,
    /// True for a read, false for a write.
    pub for_inquiry: bool,
    /// Result of the exchange.
    pub result: Result<()>,
}

/// Summary of a drained queue.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Groups exchanged successfully.
    pub completed: Vec<GroupId>,
    /// Groups rejected by a protocol error; their members are idle again.
    pub failed: Vec<(GroupId, Error)>,
}

impl DrainReport {
    /// Returns true if no group failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Transaction engine for one device.
pub struct Session<T> {
    transport: T,
    module: DeviceModule,
    config: SessionConfig,
    state: SessionState,
    decoder: FrameDecoder,
    last_tx: Bytes,
    last_rx: Bytes,
    in_flight: Option<GroupId>,
    to_inquiry: VecDeque<GroupId>,
    to_modify: VecDeque<GroupId>,
    awaiting: usize,
    instance_id: Option<Bytes>,
}

impl<T: Transport> Session<T> {
    /// Creates a session with default timeouts.
    #[must_use]
    pub fn new(transport: T, module: DeviceModule) -> Self {
        Self::with_config(transport, module, SessionConfig::default())
    }

    /// Creates a session with the given timeouts.
    #[must_use]
    pub fn with_config(transport: T, module: DeviceModule, config: SessionConfig) -> Self {
        Self {
            transport,
            module,
            config,
            state: SessionState::Idle,
            decoder: FrameDecoder::new(),
            last_tx: Bytes::new(),
            last_rx: Bytes::new(),
            in_flight: None,
            to_inquiry: VecDeque::new(),
            to_modify: VecDeque::new(),
            awaiting: 0,
            instance_id: None,
        }
    }

    /// The device module.
    #[must_use]
    pub const fn module(&self) -> &DeviceModule {
        &self.module
    }

    /// The device module, for updating values.
    pub fn module_mut(&mut self) -> &mut DeviceModule {
        &mut self.module
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Current transaction state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Timeouts in use.
    #[must_use]
    pub const fn config(&self) -> SessionConfig {
        self.config
    }

    /// Last frame written, including delimiters.
    #[must_use]
    pub const fn last_tx(&self) -> &Bytes {
        &self.last_tx
    }

    /// Last payload received.
    #[must_use]
    pub const fn last_rx(&self) -> &Bytes {
        &self.last_rx
    }

    /// Instance id reported during identification.
    #[must_use]
    pub const fn instance_id(&self) -> Option<&Bytes> {
        self.instance_id.as_ref()
    }

    /// Returns true if the transport is open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Number of parameters in queued groups that have not completed yet.
    /// Zero means the current phase's queued work is done.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.awaiting
    }

    /// Groups waiting to be read, in dispatch order.
    pub fn queued_inquiries(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.to_inquiry.iter().copied()
    }

    /// Groups waiting to be written, in dispatch order.
    pub fn queued_modifications(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.to_modify.iter().copied()
    }

    /// Opens the transport and resets the transaction state.
    pub async fn open(&mut self) -> Result<()> {
        self.transport.open().await?;
        self.state = SessionState::Idle;
        self.decoder.clear();
        Ok(())
    }

    /// Drops queued work and closes the transport.
    pub async fn close(&mut self) -> Result<()> {
        self.abort();
        self.instance_id = None;
        self.transport.close().await
    }

    /// Runs the identity handshake.
    ///
    /// Sends the module-id inquiry and checks the reported id, then sends
    /// the instance-id inquiry if the module declares one.
    pub async fn identify(&mut self) -> Result<Option<Bytes>> {
        let identity = self.module.identity().clone();
        if !identity.module_command.is_empty() {
            let reported = self.query(identity.module_command.clone()).await?;
            if reported != identity.module_id {
                self.state = SessionState::Error;
                return Err(Error::IdentityMismatch {
                    expected: command_label(&identity.module_id),
                    actual: command_label(&reported),
                });
            }
        }
        if let Some(command) = identity.instance_command {
            let instance = self.query(command).await?;
            tracing::info!(
                "{}: instance id {}",
                self.transport.endpoint(),
                command_label(&instance)
            );
            self.instance_id = Some(instance);
        }
        Ok(self.instance_id.clone())
    }

    /// Sends a raw command and returns the response body after the echoed
    /// command bytes.
    pub async fn query(&mut self, command: Bytes) -> Result<Bytes> {
        let response = self.round_trip(&command).await?;
        if let Some(body) = response.strip_prefix(&command[..]) {
            Ok(response.slice(response.len() - body.len()..))
        } else {
            self.state = SessionState::Error;
            Err(Error::CommandMismatch {
                expected: command_label(&command),
                actual: command_label(&response[..response.len().min(command.len())]),
            })
        }
    }

    /// Runs one exchange for a group and waits for its outcome.
    ///
    /// On success the members are [`ParamStatus::Received`] and the state is
    /// [`SessionState::ReceiveDone`]. On any failure every member is back to
    /// [`ParamStatus::Idle`]; a timeout leaves the state at
    /// [`SessionState::Timeout`], a bad response at [`SessionState::Error`].
    pub async fn transact(&mut self, group: GroupId, for_inquiry: bool) -> Result<()> {
        let payload = match encode_for_transmission(&self.module, group, for_inquiry) {
            Ok(payload) => payload,
            Err(e) => {
                self.module.set_group_status(group, ParamStatus::Idle);
                return Err(e);
            }
        };

        self.in_flight = Some(group);
        self.module.set_group_status(group, ParamStatus::Transmitting);
        let result = match self.round_trip(&payload).await {
            Ok(response) => decode_response(&mut self.module, group, &response).inspect_err(|_| {
                self.state = SessionState::Error;
            }),
            Err(e) => {
                self.module.set_group_status(group, ParamStatus::Idle);
                Err(e)
            }
        };
        self.in_flight = None;

        if let Err(e) = &result {
            tracing::warn!(
                "{}: {} {} failed: {}",
                self.transport.endpoint(),
                if for_inquiry { "inquiry" } else { "modify" },
                command_label(&self.module.group(group).command),
                e
            );
        }
        result
    }

    async fn round_trip(&mut self, payload: &[u8]) -> Result<Bytes> {
        if matches!(
            self.state,
            SessionState::Transmitting | SessionState::Receiving
        ) {
            return Err(Error::Busy);
        }
        if !self.transport.is_open() {
            return Err(Error::NotConnected);
        }

        let frame = encode_frame(payload);
        self.last_tx = frame.clone();
        if self.decoder.buffered() > 0 {
            tracing::debug!(
                "{}: discarding {} stale bytes",
                self.transport.endpoint(),
                self.decoder.buffered()
            );
            self.decoder.clear();
        }

        self.state = SessionState::Transmitting;
        tracing::trace!("{}: tx {}", self.transport.endpoint(), hex::encode(&frame));
        let expected = frame.len();
        match tokio::time::timeout(self.config.tx_timeout, self.transport.write(frame)).await {
            Ok(Ok(n)) if n == expected => {}
            Ok(Ok(n)) => {
                self.state = SessionState::Timeout;
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write: {n} of {expected} bytes"),
                )));
            }
            Ok(Err(e)) => {
                self.state = SessionState::Timeout;
                return Err(e);
            }
            Err(_) => {
                self.state = SessionState::Timeout;
                return Err(Error::TransmitTimeout {
                    timeout_ms: millis(self.config.tx_timeout),
                });
            }
        }

        self.state = SessionState::Receiving;
        let deadline = tokio::time::Instant::now() + self.config.rx_timeout;
        loop {
            match self.decoder.decode() {
                Ok(Some(response)) => {
                    tracing::trace!(
                        "{}: rx {}",
                        self.transport.endpoint(),
                        hex::encode(&response)
                    );
                    self.last_rx = response.clone();
                    self.state = SessionState::ReceiveDone;
                    return Ok(response);
                }
                Ok(None) => {}
                Err(e) => {
                    self.state = SessionState::Error;
                    return Err(e.into());
                }
            }

            match tokio::time::timeout_at(deadline, self.transport.read()).await {
                Ok(Ok(chunk)) => self.decoder.feed(&chunk),
                Ok(Err(e)) => {
                    self.state = SessionState::Error;
                    return Err(e);
                }
                Err(_) => {
                    self.state = SessionState::Timeout;
                    return Err(Error::ReceiveTimeout {
                        timeout_ms: millis(self.config.rx_timeout),
                    });
                }
            }
        }
    }

    /// Queues a read of the parameter's command group.
    ///
    /// Returns false if that group is already queued for reading.
    pub fn request_inquiry(&mut self, param: ParamId) -> bool {
        let group = self.module.group_id_of(param);
        self.enqueue(group, true)
    }

    /// Queues a write of the parameter's command group.
    ///
    /// Returns false if that group is already queued for writing.
    pub fn request_modify(&mut self, param: ParamId) -> bool {
        let group = self.module.group_id_of(param);
        self.enqueue(group, false)
    }

    fn enqueue(&mut self, group: GroupId, for_inquiry: bool) -> bool {
        let queue = if for_inquiry {
            &mut self.to_inquiry
        } else {
            &mut self.to_modify
        };
        if queue.contains(&group) {
            return false;
        }
        queue.push_back(group);
        self.awaiting += self.module.group(group).len();
        tracing::debug!(
            "{}: queued {} {} ({} params pending)",
            self.transport.endpoint(),
            if for_inquiry { "inquiry" } else { "modify" },
            command_label(&self.module.group(group).command),
            self.awaiting
        );
        true
    }

    /// Dispatches the next queued request, reads before writes.
    ///
    /// Returns `None` when both queues are empty.
    pub async fn next(&mut self) -> Option<Completion> {
        let (group, for_inquiry) = if let Some(group) = self.to_inquiry.pop_front() {
            (group, true)
        } else {
            (self.to_modify.pop_front()?, false)
        };
        let result = self.transact(group, for_inquiry).await;
        self.awaiting = self.awaiting.saturating_sub(self.module.group(group).len());
        Some(Completion {
            group,
            for_inquiry,
            result,
        })
    }

    /// Works off both queues until nothing is pending.
    ///
    /// Protocol errors are recorded in the report and do not stop the
    /// queue. Any other error, such as a timeout, drops the remaining work
    /// and is returned.
    pub async fn drain(&mut self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        while let Some(completion) = self.next().await {
            match completion.result {
                Ok(()) => report.completed.push(completion.group),
                Err(e) if e.is_protocol() => report.failed.push((completion.group, e)),
                Err(e) => {
                    self.clear_queues();
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// Drops all queued work and resets the queued members to idle.
    pub fn clear_queues(&mut self) {
        for group in self.to_inquiry.drain(..).chain(self.to_modify.drain(..)) {
            self.module.set_group_status(group, ParamStatus::Idle);
        }
        self.awaiting = 0;
    }

    /// Abandons everything in progress: queued work, a half-finished
    /// exchange and buffered input.
    pub fn abort(&mut self) {
        self.clear_queues();
        if let Some(group) = self.in_flight.take() {
            self.module.set_group_status(group, ParamStatus::Idle);
        }
        self.decoder.clear();
        self.state = SessionState::Idle;
    }
}
