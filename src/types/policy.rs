//! Fleet error and timeout policies.

use std::time::Duration;

/// Reaction to an init or post-acquisition error on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ErrorPolicy {
    /// Halt every device in the fleet.
    #[default]
    HaltAll,
    /// Halt and detach the failing device only.
    HaltDevice,
    /// Leave the device idle; it rejoins on the next barrier pass.
    ContinueOnError,
    /// Re-issue the failed phase for the failing device.
    Reinit,
}

/// Reaction to a device missing the cycle deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TimeoutPolicy {
    /// Report the timeout and keep waiting for the device.
    #[default]
    ContinueOnTimeout,
    /// Halt the whole fleet.
    HaltOnTimeout,
}

/// Default number of consecutive reinit attempts per device.
pub const DEFAULT_REINIT_LIMIT: u32 = 3;

/// Policies shared by all devices of a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetPolicy {
    /// Reaction to device errors.
    pub error_policy: ErrorPolicy,
    /// Reaction to cycle timeouts.
    pub timeout_policy: TimeoutPolicy,
    /// Cycle period in milliseconds; zero or less runs untimed.
    pub cycle_time_ms: i64,
    /// Consecutive `Reinit` retries before a device is halted.
    pub reinit_limit: u32,
}

impl Default for FleetPolicy {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            cycle_time_ms: 0,
            reinit_limit: DEFAULT_REINIT_LIMIT,
        }
    }
}

impl FleetPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the error policy.
    #[must_use]
    pub const fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Sets the timeout policy.
    #[must_use]
    pub const fn timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Sets the cycle time in milliseconds.
    #[must_use]
    pub const fn cycle_time_ms(mut self, ms: i64) -> Self {
        self.cycle_time_ms = ms;
        self
    }

    /// Sets the reinit limit.
    #[must_use]
    pub const fn reinit_limit(mut self, limit: u32) -> Self {
        self.reinit_limit = limit;
        self
    }

    /// Returns the cycle period, or `None` when the fleet runs untimed.
    #[must_use]
    pub fn cycle_time(&self) -> Option<Duration> {
        u64::try_from(self.cycle_time_ms)
            .ok()
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}
