//! The restarter's view of a single service instance.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::note::Reason;
use crate::path::ServicePath;
use crate::timer::TimerId;

/// How the restarter supervises a unit's processes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// The start command is the service; online once it is running.
    Simple,
    /// Runs to completion; online once started.
    Oneshot,
    /// The start command daemonizes; the real main PID arrives through fork
    /// discovery or a `MAINPID=` report before the method budget runs out.
    Forks,
    /// No processes of its own; aggregates dependencies.
    Group,
}

impl UnitKind {
    /// Kinds considered online as soon as their start method is running.
    pub fn online_on_start(self) -> bool {
        matches!(self, Self::Simple | Self::Oneshot | Self::Group)
    }
}

/// The five lifecycle methods a unit may define.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Runs before the main start method.
    Prestart,
    /// Launches the service.
    Start,
    /// Runs after the service is up.
    Poststart,
    /// Asks the service to shut down.
    Stop,
    /// Runs after all processes are gone.
    Poststop,
}

/// Lifecycle state of a unit.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Created but never driven.
    Uninitialised,
    /// Not running.
    Offline,
    /// Prestart method executing.
    PreStart,
    /// Start method executing.
    Start,
    /// Poststart method executing.
    PostStart,
    /// Terminal success state for a startup.
    Online,
    /// Stop method executing.
    Stop,
    /// SIGTERM sent; waiting for the PID set to empty.
    StopTerm,
    /// SIGKILL sent; waiting for the PID set to empty.
    StopKill,
    /// Poststop method executing.
    PostStop,
    /// Terminal failure; administrative action required to leave.
    Maintenance,
    /// Bookkeeping-only state.
    None,
}

impl UnitState {
    /// Whether the unit is somewhere in its shutdown sequence.
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            Self::Stop | Self::StopTerm | Self::StopKill | Self::PostStop
        )
    }
}

/// Per-instance supervision state: processes, methods, timers, counters.
#[derive(Debug)]
pub struct Unit {
    /// The instance this unit supervises.
    pub path: ServicePath,
    /// Supervision style.
    pub kind: UnitKind,
    /// Method table; absent entries are skipped during transitions.
    pub methods: BTreeMap<MethodKind, String>,
    /// Current state.
    pub state: UnitState,
    /// Where the current stop sequence is headed (`Offline` or
    /// `Maintenance`).
    pub target: UnitState,
    /// PID of the main process, once known.
    pub main_pid: Option<u32>,
    /// PID of the currently executing auxiliary method, if any.
    pub secondary_pid: Option<u32>,
    /// Every PID attributed to this unit.
    pub pids: BTreeSet<u32>,
    /// The single active method timer.
    pub method_timer: Option<TimerId>,
    /// Pending restart cooldown or re-entry timer.
    pub restart_timer: Option<TimerId>,
    /// State to re-enter once the restart timers run out.
    pub restart_state: Option<UnitState>,
    /// Consecutive failures per method.
    pub fail_counts: BTreeMap<MethodKind, u32>,
    /// Last STATUS= annotation received over the notify socket.
    pub status_text: Option<String>,
    /// Reason carried by the most recent graph request, echoed on the state
    /// changes this unit emits.
    pub last_reason: Reason,
}

impl Unit {
    /// Creates a fresh unit in `Uninitialised` with no tracked PIDs.
    pub fn new(
        path: ServicePath,
        kind: UnitKind,
        methods: BTreeMap<MethodKind, String>,
    ) -> Self {
        Self {
            path,
            kind,
            methods,
            state: UnitState::Uninitialised,
            target: UnitState::None,
            main_pid: None,
            secondary_pid: None,
            pids: BTreeSet::new(),
            method_timer: None,
            restart_timer: None,
            restart_state: None,
            fail_counts: BTreeMap::new(),
            status_text: None,
            last_reason: Reason::Restart,
        }
    }

    /// The method that is responsible for the current state, used to key the
    /// failure counters.
    pub fn method_for_state(state: UnitState) -> Option<MethodKind> {
        match state {
            UnitState::PreStart => Some(MethodKind::Prestart),
            UnitState::Start => Some(MethodKind::Start),
            UnitState::PostStart => Some(MethodKind::Poststart),
            UnitState::Stop => Some(MethodKind::Stop),
            UnitState::PostStop => Some(MethodKind::Poststop),
            _ => None,
        }
    }

    /// Consecutive failures recorded against a method.
    pub fn failures(&self, method: MethodKind) -> u32 {
        self.fail_counts.get(&method).copied().unwrap_or(0)
    }

    /// Checks the documented unit invariants; returns the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(pid) = self.main_pid
            && !self.pids.contains(&pid)
        {
            return Err(format!("main pid {pid} not in pid set"));
        }
        if let Some(pid) = self.secondary_pid
            && !self.pids.contains(&pid)
        {
            return Err(format!("secondary pid {pid} not in pid set"));
        }
        if self.state == UnitState::Online && self.method_timer.is_some() {
            return Err("online unit holds a method timer".into());
        }
        if self.state == UnitState::Maintenance && !self.pids.is_empty() {
            return Err("maintenance unit still tracks pids".into());
        }
        Ok(())
    }
}
