//! Barrier and policy core of the fleet.
//!
//! The [`Scheduler`] holds the fleet's view of every device and turns
//! device events, timer expiry and operator requests into [`Action`]s. It
//! performs no I/O; the coordinator task executes the actions. Keeping all
//! barrier decisions in one place gives them a consistent view of the
//! device states.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::event::{DeviceEvent, DeviceEventKind, FleetEvent};
use crate::operation::{DeviceCommand, OperationState};
use crate::types::{ErrorPolicy, FleetPolicy, TimeoutPolicy};

/// Checkpoint every active device must reach before the fleet moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Barrier {
    /// All devices connected.
    Connected,
    /// All devices finished init.
    Initialized,
    /// All devices finished the given post-acquisition cycle.
    CycleDone(u64),
}

/// Work requested by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a command to a device task.
    Command {
        device: String,
        command: DeviceCommand,
    },
    /// Shut down and forget a device task.
    Detach(String),
    /// (Re)arm the cycle timer.
    ArmTimer(Duration),
    /// Disarm the cycle timer.
    CancelTimer,
    /// Publish an event.
    Emit(FleetEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Stopped,
    Connecting,
    Initializing,
    Acquiring { cycle: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Counted by the barriers.
    Active,
    /// Failed under `ContinueOnError` or added while running; catches up
    /// with connect and init after the next barrier pass.
    Deferred { catching_up: bool },
    /// Caught up; joins at the next cycle start.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failed {
    Connect,
    Init,
    PostAcquisition,
}

#[derive(Debug, Clone)]
struct Member {
    state: OperationState,
    role: Role,
    halted: bool,
    done: bool,
    reinits: u32,
    /// Re-running init after a post-acquisition failure.
    resume: bool,
}

impl Member {
    const fn new(role: Role) -> Self {
        Self {
            state: OperationState::Idle,
            role,
            halted: false,
            done: false,
            reinits: 0,
            resume: false,
        }
    }

    fn counts(&self) -> bool {
        !self.halted && self.role == Role::Active
    }
}

fn command(device: &str, command: DeviceCommand) -> Action {
    Action::Command {
        device: device.to_owned(),
        command,
    }
}

/// Barrier and policy state of one fleet.
#[derive(Debug)]
pub struct Scheduler {
    policy: FleetPolicy,
    members: BTreeMap<String, Member>,
    stage: Stage,
    timer_armed: bool,
    /// Cycle barrier passed before the timer fired.
    cycle_pending: bool,
}

impl Scheduler {
    /// Creates a stopped scheduler with no devices.
    #[must_use]
    pub const fn new(policy: FleetPolicy) -> Self {
        Self {
            policy,
            members: BTreeMap::new(),
            stage: Stage::Stopped,
            timer_armed: false,
            cycle_pending: false,
        }
    }

    /// Current policy.
    #[must_use]
    pub const fn policy(&self) -> FleetPolicy {
        self.policy
    }

    /// Replaces the policy. Takes effect at the next decision.
    pub fn set_policy(&mut self, policy: FleetPolicy) {
        self.policy = policy;
    }

    /// Returns true between [`Scheduler::start`] and the fleet stopping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stage != Stage::Stopped
    }

    /// Current post-acquisition cycle, once acquisition has started.
    #[must_use]
    pub const fn cycle(&self) -> Option<u64> {
        match self.stage {
            Stage::Acquiring { cycle } => Some(cycle),
            _ => None,
        }
    }

    /// Returns true if the device is attached.
    #[must_use]
    pub fn contains(&self, device: &str) -> bool {
        self.members.contains_key(device)
    }

    /// Last known state of every device, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, OperationState)> {
        self.members
            .iter()
            .map(|(id, m)| (id.clone(), m.state))
            .collect()
    }

    /// Attaches a device. A device added while running catches up after
    /// the next barrier pass. Returns false if the id is taken.
    pub fn add(&mut self, device: &str) -> bool {
        if self.members.contains_key(device) {
            return false;
        }
        let role = if self.is_running() {
            Role::Deferred { catching_up: false }
        } else {
            Role::Active
        };
        self.members.insert(device.to_owned(), Member::new(role));
        true
    }

    /// Halts and detaches a device.
    pub fn remove(&mut self, device: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.members.contains_key(device) {
            self.detach(device, &mut actions);
        }
        actions
    }

    /// Resets every device and connects the whole fleet.
    pub fn start(&mut self) -> Vec<Action> {
        self.stage = Stage::Connecting;
        self.timer_armed = false;
        self.cycle_pending = false;

        let mut actions = vec![Action::Emit(FleetEvent::Started)];
        for (id, member) in &mut self.members {
            *member = Member::new(Role::Active);
            actions.push(command(id, DeviceCommand::SetIdle));
            actions.push(command(id, DeviceCommand::Connect));
        }
        tracing::info!("fleet started with {} devices", self.members.len());
        self.advance(&mut actions);
        actions
    }

    /// Halts every device and stops the fleet.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_running() {
            self.halt_members(&mut actions);
            self.finish(&mut actions);
        }
        actions
    }

    /// Halts one device. It no longer counts for the barriers.
    pub fn halt_device(&mut self, device: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(member) = self.members.get_mut(device) {
            if !member.halted {
                member.halted = true;
                member.state = OperationState::Halt;
                actions.push(command(device, DeviceCommand::Halt));
            }
            self.advance(&mut actions);
        }
        actions
    }

    /// Applies a device event.
    pub fn on_event(&mut self, event: &DeviceEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        let id = event.device.as_str();
        let stage = self.stage;
        let Some(member) = self.members.get_mut(id) else {
            return actions;
        };

        match &event.kind {
            DeviceEventKind::StateChanged(state) => {
                member.state = *state;
                return actions;
            }
            DeviceEventKind::Halted => {
                member.state = OperationState::Halt;
                return actions;
            }
            _ if stage == Stage::Stopped || member.halted => return actions,
            DeviceEventKind::Connected => match member.role {
                Role::Deferred { .. } => actions.push(command(id, DeviceCommand::Init)),
                Role::Active if stage == Stage::Connecting => {
                    member.done = true;
                    member.reinits = 0;
                }
                Role::Active | Role::Ready => {}
            },
            DeviceEventKind::InitDone => match member.role {
                Role::Deferred { .. } => {
                    tracing::info!("{}: caught up, joining next cycle", id);
                    member.role = Role::Ready;
                }
                Role::Active if member.resume => {
                    member.resume = false;
                    actions.push(command(id, DeviceCommand::PostAcquisition));
                }
                Role::Active if stage == Stage::Initializing => {
                    member.done = true;
                    member.reinits = 0;
                }
                Role::Active | Role::Ready => {}
            },
            DeviceEventKind::PostAcquisitionDone => {
                if member.role == Role::Active && matches!(stage, Stage::Acquiring { .. }) {
                    member.done = true;
                    member.reinits = 0;
                }
            }
            DeviceEventKind::ConnectionError(reason) => {
                self.on_error(id, Failed::Connect, reason, &mut actions);
            }
            DeviceEventKind::InitError(reason) => {
                self.on_error(id, Failed::Init, reason, &mut actions);
            }
            DeviceEventKind::PostAcquisitionError(reason) => {
                self.on_error(id, Failed::PostAcquisition, reason, &mut actions);
            }
        }
        self.advance(&mut actions);
        actions
    }

    /// Handles expiry of the cycle timer.
    pub fn on_timer(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.timer_armed = false;
        let Stage::Acquiring { cycle } = self.stage else {
            return actions;
        };
        if self.cycle_pending {
            self.start_cycle(&mut actions);
            return actions;
        }

        let laggards: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| m.counts() && !m.done)
            .map(|(id, _)| id.clone())
            .collect();
        for device in &laggards {
            tracing::warn!("{}: cycle {} deadline missed", device, cycle);
            actions.push(Action::Emit(FleetEvent::TimeoutError {
                device: device.clone(),
                cycle,
            }));
        }
        if !laggards.is_empty() && self.policy.timeout_policy == TimeoutPolicy::HaltOnTimeout {
            self.halt_all(None, &mut actions);
        }
        actions
    }

    fn on_error(&mut self, id: &str, failed: Failed, reason: &str, actions: &mut Vec<Action>) {
        match self.policy.error_policy {
            ErrorPolicy::HaltAll => self.halt_all(Some(id), actions),
            ErrorPolicy::HaltDevice => self.detach(id, actions),
            ErrorPolicy::ContinueOnError => {
                if let Some(member) = self.members.get_mut(id) {
                    tracing::warn!("{}: {}, continuing without it", id, reason);
                    member.role = Role::Deferred { catching_up: false };
                    member.done = false;
                    member.resume = false;
                }
            }
            ErrorPolicy::Reinit => {
                let limit = self.policy.reinit_limit;
                let Some(member) = self.members.get_mut(id) else {
                    return;
                };
                if member.reinits >= limit {
                    tracing::error!("{}: reinit limit of {} reached", id, limit);
                    self.detach(id, actions);
                    return;
                }
                member.reinits += 1;
                tracing::warn!(
                    "{}: {}, reinit attempt {} of {}",
                    id,
                    reason,
                    member.reinits,
                    limit
                );
                let retry = match failed {
                    Failed::Connect => DeviceCommand::Connect,
                    Failed::Init => DeviceCommand::Init,
                    Failed::PostAcquisition => {
                        member.resume = true;
                        DeviceCommand::Init
                    }
                };
                actions.push(command(id, retry));
            }
        }
    }

    fn detach(&mut self, id: &str, actions: &mut Vec<Action>) {
        if self.members.remove(id).is_none() {
            return;
        }
        tracing::info!("{}: halted and detached", id);
        actions.push(command(id, DeviceCommand::Halt));
        actions.push(Action::Detach(id.to_owned()));
        actions.push(Action::Emit(FleetEvent::DeviceDetached {
            device: id.to_owned(),
        }));
    }

    fn halt_members(&mut self, actions: &mut Vec<Action>) {
        for (id, member) in &mut self.members {
            if !member.halted {
                member.halted = true;
                member.state = OperationState::Halt;
                actions.push(command(id, DeviceCommand::Halt));
            }
        }
    }

    fn halt_all(&mut self, cause: Option<&str>, actions: &mut Vec<Action>) {
        match cause {
            Some(device) => tracing::error!("{}: error policy halts the fleet", device),
            None => tracing::error!("cycle timeout halts the fleet"),
        }
        self.halt_members(actions);
        actions.push(Action::Emit(FleetEvent::PolicyHalt {
            device: cause.map(str::to_owned),
        }));
        self.finish(actions);
    }

    fn finish(&mut self, actions: &mut Vec<Action>) {
        if self.timer_armed {
            self.timer_armed = false;
            actions.push(Action::CancelTimer);
        }
        self.stage = Stage::Stopped;
        self.cycle_pending = false;
        tracing::info!("fleet stopped");
        actions.push(Action::Emit(FleetEvent::Stopped));
    }

    /// Moves the fleet on when every active device reached the current
    /// barrier.
    fn advance(&mut self, actions: &mut Vec<Action>) {
        if self.stage == Stage::Stopped || self.cycle_pending {
            return;
        }
        let active = self.members.values().filter(|m| m.counts()).count();
        if active == 0 {
            let waiting = self.members.values().any(|m| !m.halted);
            if !waiting {
                self.finish(actions);
                return;
            }
            // nobody left to wait for: let deferred devices catch up and
            // start cycling with those that have
            self.catch_up(actions);
            if self.members.values().any(|m| !m.halted && m.role == Role::Ready) {
                self.start_cycle(actions);
            }
            return;
        }
        if !self.members.values().filter(|m| m.counts()).all(|m| m.done) {
            return;
        }

        self.catch_up(actions);
        match self.stage {
            Stage::Stopped => {}
            Stage::Connecting => {
                actions.push(Action::Emit(FleetEvent::BarrierReached(Barrier::Connected)));
                self.stage = Stage::Initializing;
                for (id, member) in &mut self.members {
                    if member.counts() {
                        member.done = false;
                        actions.push(command(id, DeviceCommand::Init));
                    }
                }
            }
            Stage::Initializing => {
                actions.push(Action::Emit(FleetEvent::BarrierReached(Barrier::Initialized)));
                self.start_cycle(actions);
            }
            Stage::Acquiring { cycle } => {
                actions.push(Action::Emit(FleetEvent::BarrierReached(Barrier::CycleDone(
                    cycle,
                ))));
                if self.timer_armed {
                    self.cycle_pending = true;
                } else {
                    self.start_cycle(actions);
                }
            }
        }
    }

    fn catch_up(&mut self, actions: &mut Vec<Action>) {
        for (id, member) in &mut self.members {
            if !member.halted && member.role == (Role::Deferred { catching_up: false }) {
                member.role = Role::Deferred { catching_up: true };
                actions.push(command(id, DeviceCommand::Connect));
            }
        }
    }

    fn start_cycle(&mut self, actions: &mut Vec<Action>) {
        let cycle = match self.stage {
            Stage::Acquiring { cycle } => cycle + 1,
            _ => 1,
        };
        self.stage = Stage::Acquiring { cycle };
        self.cycle_pending = false;
        actions.push(Action::Emit(FleetEvent::CycleStarted { cycle }));
        for (id, member) in &mut self.members {
            if member.halted {
                continue;
            }
            if member.role == Role::Ready {
                member.role = Role::Active;
            }
            if member.role == Role::Active {
                member.done = false;
                actions.push(command(id, DeviceCommand::PostAcquisition));
            }
        }
        if let Some(period) = self.policy.cycle_time() {
            self.timer_armed = true;
            actions.push(Action::ArmTimer(period));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(device: &str, kind: DeviceEventKind) -> DeviceEvent {
        DeviceEvent::new(device, kind)
    }

    fn sent(actions: &[Action]) -> Vec<(&str, DeviceCommand)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Command { device, command } => Some((device.as_str(), *command)),
                _ => None,
            })
            .collect()
    }

    fn emitted(actions: &[Action]) -> Vec<FleetEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn fleet(policy: FleetPolicy, ids: &[&str]) -> Scheduler {
        let mut scheduler = Scheduler::new(policy);
        for id in ids {
            assert!(scheduler.add(id));
        }
        scheduler
    }

    /// Starts the fleet and connects every device.
    fn connected(policy: FleetPolicy, ids: &[&str]) -> Scheduler {
        let mut s = fleet(policy, ids);
        s.start();
        for id in ids {
            s.on_event(&ev(id, DeviceEventKind::Connected));
        }
        s
    }

    /// Runs every device through init into cycle 1.
    fn acquiring(policy: FleetPolicy, ids: &[&str]) -> Scheduler {
        let mut s = connected(policy, ids);
        for id in ids {
            s.on_event(&ev(id, DeviceEventKind::InitDone));
        }
        assert_eq!(s.cycle(), Some(1));
        s
    }

    #[test]
    fn test_start_connects_everyone() {
        let mut s = fleet(FleetPolicy::new(), &["r1", "r2"]);
        let actions = s.start();
        assert_eq!(
            sent(&actions),
            vec![
                ("r1", DeviceCommand::SetIdle),
                ("r1", DeviceCommand::Connect),
                ("r2", DeviceCommand::SetIdle),
                ("r2", DeviceCommand::Connect),
            ]
        );
        assert_eq!(emitted(&actions), vec![FleetEvent::Started]);
        assert!(s.is_running());
    }

    #[test]
    fn test_init_barrier_waits_for_every_device() {
        let mut s = connected(FleetPolicy::new(), &["r1", "r2", "r3"]);
        s.on_event(&ev("r2", DeviceEventKind::StateChanged(OperationState::InitParamsStart)));

        let a1 = s.on_event(&ev("r1", DeviceEventKind::InitDone));
        let a3 = s.on_event(&ev("r3", DeviceEventKind::InitDone));
        assert!(a1.is_empty());
        assert!(a3.is_empty());
        assert_eq!(s.cycle(), None);

        let a2 = s.on_event(&ev("r2", DeviceEventKind::InitDone));
        assert_eq!(
            emitted(&a2),
            vec![
                FleetEvent::BarrierReached(Barrier::Initialized),
                FleetEvent::CycleStarted { cycle: 1 },
            ]
        );
        assert_eq!(
            sent(&a2),
            vec![
                ("r1", DeviceCommand::PostAcquisition),
                ("r2", DeviceCommand::PostAcquisition),
                ("r3", DeviceCommand::PostAcquisition),
            ]
        );
    }

    #[test]
    fn test_connect_barrier_issues_init() {
        let mut s = fleet(FleetPolicy::new(), &["r1", "r2"]);
        s.start();
        assert!(sent(&s.on_event(&ev("r1", DeviceEventKind::Connected))).is_empty());
        let actions = s.on_event(&ev("r2", DeviceEventKind::Connected));
        assert_eq!(
            sent(&actions),
            vec![("r1", DeviceCommand::Init), ("r2", DeviceCommand::Init)]
        );
    }

    #[test]
    fn test_halt_device_policy_isolates_failure() {
        let policy = FleetPolicy::new().error_policy(ErrorPolicy::HaltDevice);
        let mut s = connected(policy, &["r1", "r2", "r3"]);
        s.on_event(&ev("r1", DeviceEventKind::StateChanged(OperationState::InitScriptsDone)));
        s.on_event(&ev("r3", DeviceEventKind::StateChanged(OperationState::InitParamsDone)));

        let actions = s.on_event(&ev("r2", DeviceEventKind::InitError("timeout".into())));

        assert_eq!(sent(&actions), vec![("r2", DeviceCommand::Halt)]);
        assert!(actions.contains(&Action::Detach("r2".into())));
        assert!(!s.contains("r2"));
        assert_eq!(
            s.snapshot(),
            vec![
                ("r1".to_owned(), OperationState::InitScriptsDone),
                ("r3".to_owned(), OperationState::InitParamsDone),
            ]
        );

        s.on_event(&ev("r1", DeviceEventKind::InitDone));
        let actions = s.on_event(&ev("r3", DeviceEventKind::InitDone));
        assert!(emitted(&actions).contains(&FleetEvent::BarrierReached(Barrier::Initialized)));
    }

    #[test]
    fn test_halt_all_policy_halts_fleet() {
        let mut s = connected(FleetPolicy::new(), &["r1", "r2", "r3"]);

        let actions = s.on_event(&ev("r2", DeviceEventKind::InitError("timeout".into())));

        assert_eq!(
            sent(&actions),
            vec![
                ("r1", DeviceCommand::Halt),
                ("r2", DeviceCommand::Halt),
                ("r3", DeviceCommand::Halt),
            ]
        );
        assert_eq!(
            emitted(&actions),
            vec![
                FleetEvent::PolicyHalt {
                    device: Some("r2".into())
                },
                FleetEvent::Stopped,
            ]
        );
        assert!(s.snapshot().iter().all(|(_, st)| *st == OperationState::Halt));
        assert!(!s.is_running());
    }

    #[test]
    fn test_continue_on_error_catches_up_next_pass() {
        let policy = FleetPolicy::new().error_policy(ErrorPolicy::ContinueOnError);
        let mut s = connected(policy, &["r1", "r2", "r3"]);

        let actions = s.on_event(&ev("r2", DeviceEventKind::InitError("bad reply".into())));
        assert!(sent(&actions).is_empty());

        s.on_event(&ev("r1", DeviceEventKind::InitDone));
        let actions = s.on_event(&ev("r3", DeviceEventKind::InitDone));
        assert_eq!(
            sent(&actions),
            vec![
                ("r2", DeviceCommand::Connect),
                ("r1", DeviceCommand::PostAcquisition),
                ("r3", DeviceCommand::PostAcquisition),
            ]
        );

        let actions = s.on_event(&ev("r2", DeviceEventKind::Connected));
        assert_eq!(sent(&actions), vec![("r2", DeviceCommand::Init)]);
        assert!(s.on_event(&ev("r2", DeviceEventKind::InitDone)).is_empty());

        s.on_event(&ev("r1", DeviceEventKind::PostAcquisitionDone));
        let actions = s.on_event(&ev("r3", DeviceEventKind::PostAcquisitionDone));
        assert_eq!(
            sent(&actions),
            vec![
                ("r1", DeviceCommand::PostAcquisition),
                ("r2", DeviceCommand::PostAcquisition),
                ("r3", DeviceCommand::PostAcquisition),
            ]
        );
    }

    #[test]
    fn test_reinit_retries_until_limit() {
        let policy = FleetPolicy::new()
            .error_policy(ErrorPolicy::Reinit)
            .reinit_limit(2);
        let mut s = connected(policy, &["r1", "r2"]);

        for _ in 0..2 {
            let actions = s.on_event(&ev("r1", DeviceEventKind::InitError("timeout".into())));
            assert_eq!(sent(&actions), vec![("r1", DeviceCommand::Init)]);
        }
        let actions = s.on_event(&ev("r1", DeviceEventKind::InitError("timeout".into())));
        assert_eq!(sent(&actions), vec![("r1", DeviceCommand::Halt)]);
        assert!(actions.contains(&Action::Detach("r1".into())));
    }

    #[test]
    fn test_reinit_after_post_acquisition_error_resumes_cycle() {
        let policy = FleetPolicy::new().error_policy(ErrorPolicy::Reinit);
        let mut s = acquiring(policy, &["r1", "r2"]);

        let actions = s.on_event(&ev(
            "r1",
            DeviceEventKind::PostAcquisitionError("timeout".into()),
        ));
        assert_eq!(sent(&actions), vec![("r1", DeviceCommand::Init)]);

        let actions = s.on_event(&ev("r1", DeviceEventKind::InitDone));
        assert_eq!(sent(&actions), vec![("r1", DeviceCommand::PostAcquisition)]);

        s.on_event(&ev("r2", DeviceEventKind::PostAcquisitionDone));
        let actions = s.on_event(&ev("r1", DeviceEventKind::PostAcquisitionDone));
        assert!(emitted(&actions).contains(&FleetEvent::CycleStarted { cycle: 2 }));
    }

    #[test]
    fn test_timer_reports_laggards_and_continues() {
        let policy = FleetPolicy::new().cycle_time_ms(100);
        let mut s = connected(policy, &["r1", "r2"]);
        s.on_event(&ev("r1", DeviceEventKind::InitDone));
        let actions = s.on_event(&ev("r2", DeviceEventKind::InitDone));
        assert!(actions.contains(&Action::ArmTimer(Duration::from_millis(100))));

        s.on_event(&ev("r1", DeviceEventKind::PostAcquisitionDone));
        let actions = s.on_timer();
        assert_eq!(
            emitted(&actions),
            vec![FleetEvent::TimeoutError {
                device: "r2".into(),
                cycle: 1
            }]
        );
        assert!(sent(&actions).is_empty());

        let actions = s.on_event(&ev("r2", DeviceEventKind::PostAcquisitionDone));
        assert!(emitted(&actions).contains(&FleetEvent::CycleStarted { cycle: 2 }));
        assert!(actions.contains(&Action::ArmTimer(Duration::from_millis(100))));
    }

    #[test]
    fn test_timer_paces_fast_cycles() {
        let policy = FleetPolicy::new().cycle_time_ms(100);
        let mut s = acquiring(policy, &["r1"]);

        let actions = s.on_event(&ev("r1", DeviceEventKind::PostAcquisitionDone));
        assert_eq!(
            emitted(&actions),
            vec![FleetEvent::BarrierReached(Barrier::CycleDone(1))]
        );
        assert!(sent(&actions).is_empty());

        let actions = s.on_timer();
        assert_eq!(sent(&actions), vec![("r1", DeviceCommand::PostAcquisition)]);
        assert_eq!(s.cycle(), Some(2));
    }

    #[test]
    fn test_halt_on_timeout_stops_fleet() {
        let policy = FleetPolicy::new()
            .cycle_time_ms(100)
            .timeout_policy(TimeoutPolicy::HaltOnTimeout);
        let mut s = acquiring(policy, &["r1", "r2"]);
        s.on_event(&ev("r1", DeviceEventKind::PostAcquisitionDone));

        let actions = s.on_timer();
        assert!(emitted(&actions).contains(&FleetEvent::PolicyHalt { device: None }));
        assert_eq!(
            sent(&actions),
            vec![("r1", DeviceCommand::Halt), ("r2", DeviceCommand::Halt)]
        );
        assert!(!s.is_running());
    }

    #[test]
    fn test_halted_device_does_not_block_barrier() {
        let mut s = connected(FleetPolicy::new(), &["r1", "r2"]);
        s.halt_device("r2");
        let actions = s.on_event(&ev("r1", DeviceEventKind::InitDone));
        assert_eq!(sent(&actions), vec![("r1", DeviceCommand::PostAcquisition)]);

        assert!(s.on_event(&ev("r2", DeviceEventKind::InitDone)).is_empty());
    }

    #[test]
    fn test_empty_fleet_stops_immediately() {
        let mut s = Scheduler::new(FleetPolicy::new());
        let actions = s.start();
        assert_eq!(
            emitted(&actions),
            vec![FleetEvent::Started, FleetEvent::Stopped]
        );
        assert!(!s.is_running());
    }

    #[test]
    fn test_remove_halts_then_detaches() {
        let mut s = fleet(FleetPolicy::new(), &["r1"]);
        let actions = s.remove("r1");
        assert_eq!(actions[0], command("r1", DeviceCommand::Halt));
        assert_eq!(actions[1], Action::Detach("r1".into()));
        assert!(s.remove("r1").is_empty());
    }
}
