//! Event system for fleet observers.
//!
//! Device actors report lifecycle changes as [`DeviceEvent`]s to the fleet
//! coordinator, which republishes them together with its own scheduling
//! events as [`FleetEvent`]s on a broadcast channel. Observers (UI, logs)
//! subscribe through an [`EventDispatcher`].

use std::time::Duration;

use tokio::sync::broadcast;

use crate::fleet::Barrier;
use crate::operation::OperationState;

/// What happened on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// Operation state changed.
    StateChanged(OperationState),
    /// Port opened and identity confirmed.
    Connected,
    /// Opening the port or the identity handshake failed.
    ConnectionError(String),
    /// Init parameters and scripts completed.
    InitDone,
    /// Init phase failed; the device is back to idle.
    InitError(String),
    /// One post-acquisition cycle completed.
    PostAcquisitionDone,
    /// Post-acquisition phase failed; the device is back to idle.
    PostAcquisitionError(String),
    /// The device entered `Halt`.
    Halted,
}

/// An event reported by a device actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    /// Device id.
    pub device: String,
    /// What happened.
    pub kind: DeviceEventKind,
}

impl DeviceEvent {
    /// Creates an event for a device.
    #[must_use]
    pub fn new(device: impl Into<String>, kind: DeviceEventKind) -> Self {
        Self {
            device: device.into(),
            kind,
        }
    }

    /// Returns true for connection, init and post-acquisition errors.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(
            self.kind,
            DeviceEventKind::ConnectionError(_)
                | DeviceEventKind::InitError(_)
                | DeviceEventKind::PostAcquisitionError(_)
        )
    }
}

/// Events published to fleet observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// A device event, forwarded as received.
    Device(DeviceEvent),
    /// The cycle timer fired before this device finished the cycle.
    TimeoutError { device: String, cycle: u64 },
    /// Every active device reached the barrier.
    BarrierReached(Barrier),
    /// A post-acquisition cycle started.
    CycleStarted { cycle: u64 },
    /// The scheduler halted the fleet; `device` names the device whose
    /// error triggered it, if any.
    PolicyHalt { device: Option<String> },
    /// A device was halted and removed from the fleet.
    DeviceDetached { device: String },
    /// The fleet started running.
    Started,
    /// The fleet stopped; no active device remains.
    Stopped,
}

/// Discriminant of a [`FleetEvent`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    Connected,
    ConnectionError,
    InitDone,
    InitError,
    PostAcquisitionDone,
    PostAcquisitionError,
    Halted,
    TimeoutError,
    BarrierReached,
    CycleStarted,
    PolicyHalt,
    DeviceDetached,
    Started,
    Stopped,
}

impl FleetEvent {
    /// Returns the event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Device(event) => match event.kind {
                DeviceEventKind::StateChanged(_) => EventKind::StateChanged,
                DeviceEventKind::Connected => EventKind::Connected,
                DeviceEventKind::ConnectionError(_) => EventKind::ConnectionError,
                DeviceEventKind::InitDone => EventKind::InitDone,
                DeviceEventKind::InitError(_) => EventKind::InitError,
                DeviceEventKind::PostAcquisitionDone => EventKind::PostAcquisitionDone,
                DeviceEventKind::PostAcquisitionError(_) => EventKind::PostAcquisitionError,
                DeviceEventKind::Halted => EventKind::Halted,
            },
            Self::TimeoutError { .. } => EventKind::TimeoutError,
            Self::BarrierReached(_) => EventKind::BarrierReached,
            Self::CycleStarted { .. } => EventKind::CycleStarted,
            Self::PolicyHalt { .. } => EventKind::PolicyHalt,
            Self::DeviceDetached { .. } => EventKind::DeviceDetached,
            Self::Started => EventKind::Started,
            Self::Stopped => EventKind::Stopped,
        }
    }

    /// Returns the device the event concerns, if any.
    #[must_use]
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::Device(event) => Some(&event.device),
            Self::TimeoutError { device, .. } | Self::DeviceDetached { device } => Some(device),
            Self::PolicyHalt { device } => device.as_deref(),
            Self::BarrierReached(_) | Self::CycleStarted { .. } | Self::Started | Self::Stopped => {
                None
            }
        }
    }
}

/// Subscription filter by device and event kind.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events concerning these devices.
    pub devices: Option<Vec<String>>,
    /// Only events of these kinds.
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    /// Creates a filter for one device.
    #[must_use]
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            devices: Some(vec![id.into()]),
            kinds: None,
        }
    }

    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            devices: None,
            kinds: Some(kinds),
        }
    }

    /// Restricts the filter to the given kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: Vec<EventKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &FleetEvent) -> bool {
        if let Some(ref devices) = self.devices {
            match event.device() {
                Some(device) if devices.iter().any(|d| d == device) => {}
                _ => return false,
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        true
    }
}

/// A subscription to fleet events.
pub struct Subscription {
    receiver: broadcast::Receiver<FleetEvent>,
    filter: Option<EventFilter>,
}

impl Subscription {
    /// Receives the next matching event, or `None` once the fleet is gone.
    pub async fn recv(&mut self) -> Option<FleetEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.as_ref().is_none_or(|f| f.matches(&event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Dispatches fleet events to subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: FleetEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<FleetEvent> {
        let mut subscription = self.subscribe(Some(filter));
        tokio::time::timeout(timeout, subscription.recv())
            .await
            .ok()
            .flatten()
    }
}
