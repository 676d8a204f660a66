//! The restarter core: per-instance state machines over forked methods.
//!
//! One [`Restarter`] owns every unit. It reacts to graph requests, process
//! tracker events, timer firings, and readiness notifications, and reports
//! lifecycle transitions back onto the note bus as state-change notes. All
//! transitions run through a single `enter` function whose cases enumerate
//! the state machine.

use std::collections::{BTreeMap, HashMap};

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::constants::{
    MAX_METHOD_FAILURES, METHOD_TIMEOUT, RESTART_COOLDOWN, RESTART_ENTRY_DELAY,
};
use crate::error::GraphError;
use crate::note::{Note, NoteBus, Reason, RequestSub, StateSub};
use crate::path::ServicePath;
use crate::repository::Repository;
use crate::spawn::Forker;
use crate::timer::TimerSet;
use crate::tracker::{ExitFlags, ProcEvent, ProcessTracker};
use crate::unit::{MethodKind, Unit, UnitKind, UnitState};

/// Payload delivered when a timer registered by the supervisor fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerPayload {
    /// A unit's method timer ran out.
    Method(ServicePath),
    /// A unit's restart cooldown ended.
    RestartCooldown(ServicePath),
    /// A unit's restart re-entry delay ended.
    RestartEnter(ServicePath),
    /// Time to retry a failed repository lookup.
    RepoRetry,
}

/// Everything a restarter operation may touch besides the units themselves.
/// Constructed fresh by the event loop for each dispatch; tests build their
/// own.
pub struct RestarterCtx<'a> {
    /// The event loop's timer set.
    pub timers: &'a mut TimerSet<TimerPayload>,
    /// The shared note bus.
    pub bus: &'a mut NoteBus,
    /// Process creation seam.
    pub forker: &'a mut dyn Forker,
    /// Process event subscription.
    pub tracker: &'a mut dyn ProcessTracker,
    /// The service catalog.
    pub repo: &'a dyn Repository,
}

/// Owns and drives every unit's state machine.
#[derive(Default)]
pub struct Restarter {
    units: BTreeMap<ServicePath, Unit>,
    pid_owners: HashMap<u32, ServicePath>,
}

impl Restarter {
    /// Creates an empty restarter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds or creates the unit for a path. Creation reads the method table
    /// and unit kind from the repository; repeated calls return the existing
    /// unit untouched.
    pub fn unit_add(
        &mut self,
        path: &ServicePath,
        ctx: &mut RestarterCtx<'_>,
    ) -> Result<&Unit, GraphError> {
        if !self.units.contains_key(path) {
            let record = ctx
                .repo
                .lookup(path)
                .ok_or_else(|| GraphError::NotInRepository(path.clone()))?;
            let unit = Unit::new(path.clone(), record.kind, record.methods.clone());
            debug!("{path}: unit created");
            self.units.insert(path.clone(), unit);
        }
        Ok(&self.units[path])
    }

    /// Read access to a unit.
    pub fn unit(&self, path: &ServicePath) -> Option<&Unit> {
        self.units.get(path)
    }

    /// All units, in path order.
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// The unit owning a tracked PID.
    pub fn owner_of(&self, pid: u32) -> Option<&ServicePath> {
        self.pid_owners.get(&pid)
    }

    /// Accepts a start/stop request from the graph.
    pub fn unit_msg(
        &mut self,
        path: &ServicePath,
        sub: RequestSub,
        reason: Reason,
        ctx: &mut RestarterCtx<'_>,
    ) {
        if let Err(err) = self.unit_add(path, ctx) {
            warn!("{path}: dropping {sub} request: {err}");
            return;
        }
        let unit = self.units.get_mut(path).expect("unit_add inserted");
        unit.last_reason = reason;

        match sub {
            RequestSub::Start => match unit.state {
                UnitState::Uninitialised | UnitState::Offline | UnitState::None => {
                    unit.target = UnitState::Online;
                    self.enter(path, UnitState::PreStart, ctx);
                }
                UnitState::Maintenance => {
                    warn!("{path}: start requested while in maintenance; ignoring");
                }
                _ => debug!("{path}: start requested in state {}", unit.state),
            },
            RequestSub::Stop => match unit.state {
                UnitState::PreStart
                | UnitState::Start
                | UnitState::PostStart
                | UnitState::Online => {
                    unit.target = UnitState::Offline;
                    self.enter(path, UnitState::Stop, ctx);
                }
                UnitState::Uninitialised | UnitState::None => {
                    // Nothing to take down; complete the graph's bookkeeping.
                    ctx.bus.push(Note::StateChange {
                        path: path.clone(),
                        sub: StateSub::Offline,
                        reason,
                    });
                }
                // Already reported its offline transition.
                UnitState::Offline => debug!("{path}: stop requested while offline"),
                UnitState::Maintenance => {
                    debug!("{path}: stop requested while in maintenance")
                }
                _ => debug!("{path}: stop requested while already stopping"),
            },
        }
    }

    /// Consumes a process tracker event for a PID attributed to some unit.
    pub fn unit_ptevent(&mut self, event: ProcEvent, ctx: &mut RestarterCtx<'_>) {
        match event {
            ProcEvent::Child { parent, pid } => {
                let Some(owner) = self.pid_owners.get(&parent).cloned() else {
                    debug!("child event for untracked parent {parent}; discarding");
                    return;
                };
                let unit = self.units.get_mut(&owner).expect("owner index is coherent");
                unit.pids.insert(pid);
                self.pid_owners.insert(pid, owner);
                ctx.tracker.watch(pid);
            }
            ProcEvent::Exit { pid, flags } => {
                let Some(owner) = self.pid_owners.remove(&pid) else {
                    debug!("exit event for untracked pid {pid}; discarding");
                    return;
                };
                ctx.tracker.disregard(pid);
                self.handle_exit(&owner, pid, flags, ctx);
            }
        }
    }

    /// Readiness notification from a supervised child. Meaningful only in
    /// `Start`; ignored elsewhere.
    pub fn unit_notify_ready(&mut self, sender: u32, ctx: &mut RestarterCtx<'_>) {
        let Some(path) = self.pid_owners.get(&sender).cloned() else {
            debug!("READY from untracked pid {sender}; discarding");
            return;
        };
        let unit = self.units.get_mut(&path).expect("owner index is coherent");
        if unit.state == UnitState::Start {
            info!("{path}: ready");
            self.clear_method_timer(&path, ctx);
            self.enter(&path, UnitState::PostStart, ctx);
        } else {
            debug!("{path}: READY in state {}; ignoring", unit.state);
        }
    }

    /// Status annotation from a supervised child.
    pub fn unit_notify_status(&mut self, sender: u32, text: &str) {
        let Some(path) = self.pid_owners.get(&sender) else {
            debug!("STATUS from untracked pid {sender}; discarding");
            return;
        };
        let unit = self.units.get_mut(path).expect("owner index is coherent");
        info!("{}: status: {text}", unit.path);
        unit.status_text = Some(text.to_string());
    }

    /// MAINPID reassignment. The new main PID must already be tracked.
    pub fn unit_set_main_pid(&mut self, sender: u32, new_main: u32) {
        let Some(path) = self.pid_owners.get(&sender).cloned() else {
            debug!("MAINPID from untracked pid {sender}; discarding");
            return;
        };
        let unit = self.units.get_mut(&path).expect("owner index is coherent");
        if unit.pids.contains(&new_main) {
            debug!("{path}: main pid reassigned to {new_main}");
            unit.main_pid = Some(new_main);
        } else {
            warn!("{path}: MAINPID={new_main} is not a tracked pid; ignoring");
        }
    }

    /// Reacts to a fired timer. Payloads not owned by the restarter are the
    /// caller's mistake and are logged.
    pub fn on_timer(&mut self, payload: TimerPayload, ctx: &mut RestarterCtx<'_>) {
        match payload {
            TimerPayload::Method(path) => self.on_method_timeout(&path, ctx),
            TimerPayload::RestartCooldown(path) => {
                if let Some(unit) = self.units.get_mut(&path) {
                    unit.restart_timer = Some(
                        ctx.timers
                            .add(RESTART_ENTRY_DELAY, TimerPayload::RestartEnter(path)),
                    );
                }
            }
            TimerPayload::RestartEnter(path) => {
                let Some(unit) = self.units.get_mut(&path) else {
                    return;
                };
                unit.restart_timer = None;
                let Some(state) = unit.restart_state.take() else {
                    return;
                };
                // An administrative stop may have raced the cooldown.
                if unit.state == state {
                    info!("{path}: retrying {state}");
                    self.enter(&path, state, ctx);
                }
            }
            TimerPayload::RepoRetry => {
                warn!("repository retry timer routed to the restarter")
            }
        }
    }

    /// Checks every unit's documented invariants; used by tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        for unit in self.units.values() {
            unit.check_invariants()
                .map_err(|err| format!("{}: {err}", unit.path))?;
            for pid in &unit.pids {
                if self.pid_owners.get(pid) != Some(&unit.path) {
                    return Err(format!("{}: pid {pid} not in owner index", unit.path));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transition machinery
    // ------------------------------------------------------------------

    /// The single transition function. Cancels any standing method timer,
    /// then performs the entry work for `next`.
    fn enter(
        &mut self,
        path: &ServicePath,
        next: UnitState,
        ctx: &mut RestarterCtx<'_>,
    ) {
        self.clear_method_timer(path, ctx);
        let Some(unit) = self.units.get_mut(path) else {
            error!("{path}: transition to {next} for unknown unit");
            return;
        };
        debug!("{path}: {} -> {next}", unit.state);

        match next {
            UnitState::PreStart => {
                unit.state = UnitState::PreStart;
                if unit.methods.contains_key(&MethodKind::Prestart) {
                    self.fork_for_state(path, MethodKind::Prestart, true, ctx);
                } else {
                    self.enter(path, UnitState::Start, ctx);
                }
            }
            UnitState::Start => {
                unit.state = UnitState::Start;
                let online_on_start = unit.kind.online_on_start();
                if unit.methods.contains_key(&MethodKind::Start) {
                    if !self.fork_for_state(path, MethodKind::Start, true, ctx) {
                        return;
                    }
                } else if unit.kind != UnitKind::Group {
                    warn!("{path}: no start method defined");
                }
                if online_on_start {
                    self.enter(path, UnitState::PostStart, ctx);
                }
            }
            UnitState::PostStart => {
                unit.state = UnitState::PostStart;
                if unit.methods.contains_key(&MethodKind::Poststart) {
                    self.fork_for_state(path, MethodKind::Poststart, false, ctx);
                } else {
                    self.enter(path, UnitState::Online, ctx);
                }
            }
            UnitState::Online => {
                unit.state = UnitState::Online;
                unit.secondary_pid = None;
                unit.fail_counts.clear();
                unit.restart_state = None;
                let reason = unit.last_reason;
                info!("{path}: online");
                ctx.bus.push(Note::StateChange {
                    path: path.clone(),
                    sub: StateSub::Online,
                    reason,
                });
            }
            UnitState::Stop => {
                unit.state = UnitState::Stop;
                if unit.methods.contains_key(&MethodKind::Stop) {
                    if !self.fork_stop_method(path, ctx) {
                        self.enter(path, UnitState::StopTerm, ctx);
                    }
                } else {
                    self.enter(path, UnitState::StopTerm, ctx);
                }
            }
            UnitState::StopTerm => {
                unit.state = UnitState::StopTerm;
                if unit.pids.is_empty() {
                    self.stop_phase_complete(path, ctx);
                } else {
                    let main = unit.main_pid;
                    let pids: Vec<u32> = unit.pids.iter().copied().collect();
                    if let Some(main) = main {
                        ctx.forker.kill(main, Signal::SIGTERM);
                    }
                    for pid in pids {
                        if Some(pid) != main {
                            ctx.forker.kill(pid, Signal::SIGTERM);
                        }
                    }
                    self.arm_method_timer(path, ctx);
                }
            }
            UnitState::StopKill => {
                unit.state = UnitState::StopKill;
                if unit.pids.is_empty() {
                    self.stop_phase_complete(path, ctx);
                } else {
                    for pid in unit.pids.iter().copied().collect::<Vec<_>>() {
                        ctx.forker.kill(pid, Signal::SIGKILL);
                    }
                    self.arm_method_timer(path, ctx);
                }
            }
            UnitState::PostStop => {
                unit.state = UnitState::PostStop;
                if unit.methods.contains_key(&MethodKind::Poststop) {
                    if !self.fork_for_state(path, MethodKind::Poststop, false, ctx) {
                        return;
                    }
                } else {
                    self.finalize_stop(path, ctx);
                }
            }
            UnitState::Maintenance => {
                self.clear_restart_timer(path, ctx);
                let unit = self.units.get_mut(path).expect("checked above");
                unit.state = UnitState::Maintenance;
                unit.target = UnitState::None;
                error!("{path}: entering maintenance");
                self.purge_pids(path, false, ctx);
                ctx.bus.push(Note::StateChange {
                    path: path.clone(),
                    sub: StateSub::Maintenance,
                    reason: Reason::Error,
                });
            }
            UnitState::Offline => {
                unit.state = UnitState::Offline;
                unit.target = UnitState::None;
                unit.main_pid = None;
                unit.secondary_pid = None;
                let reason = unit.last_reason;
                info!("{path}: offline");
                ctx.bus.push(Note::StateChange {
                    path: path.clone(),
                    sub: StateSub::Offline,
                    reason,
                });
            }
            UnitState::Uninitialised | UnitState::None => {
                unit.state = next;
            }
        }
    }

    /// Reactions to a tracked PID exiting, after the PID set was updated.
    fn handle_exit(
        &mut self,
        path: &ServicePath,
        pid: u32,
        flags: ExitFlags,
        ctx: &mut RestarterCtx<'_>,
    ) {
        let Some(unit) = self.units.get_mut(path) else {
            return;
        };
        unit.pids.remove(&pid);

        let was_main = unit.main_pid == Some(pid);
        let was_secondary = unit.secondary_pid == Some(pid);
        if was_main {
            unit.main_pid = None;
        }
        if was_secondary {
            unit.secondary_pid = None;
        }

        let state = unit.state;
        let kind = unit.kind;
        let empty = unit.pids.is_empty();

        if state.is_stopping() {
            match state {
                UnitState::Stop if was_secondary => {
                    // The stop method finished (either way); move to signals.
                    if !flags.normal {
                        warn!("{path}: stop method failed; escalating");
                    }
                    self.enter(path, UnitState::StopTerm, ctx);
                }
                UnitState::PostStop if was_secondary => {
                    if flags.normal {
                        self.finalize_stop(path, ctx);
                    } else {
                        self.method_failure(path, MethodKind::Poststop, ctx);
                    }
                }
                UnitState::Stop if empty => self.enter(path, UnitState::StopTerm, ctx),
                UnitState::StopTerm if empty => {
                    self.stop_phase_complete(path, ctx)
                }
                UnitState::StopKill if empty => {
                    self.stop_phase_complete(path, ctx)
                }
                _ => {}
            }
            return;
        }

        if was_main {
            if flags.normal {
                match state {
                    UnitState::PreStart => {
                        self.purge_pids(path, true, ctx);
                        self.enter(path, UnitState::Start, ctx);
                    }
                    UnitState::PostStart | UnitState::Online
                        if kind == UnitKind::Simple =>
                    {
                        self.begin_stop(path, UnitState::Offline, ctx);
                    }
                    UnitState::PostStart | UnitState::Online
                        if kind != UnitKind::Group && empty =>
                    {
                        self.begin_stop(path, UnitState::Offline, ctx);
                    }
                    UnitState::Start if kind == UnitKind::Forks => {
                        // Classic daemon: the parent exits once the real
                        // main process is detached.
                        let unit = self.units.get_mut(path).expect("present");
                        if unit.pids.len() == 1 {
                            unit.main_pid = unit.pids.iter().next().copied();
                        } else if empty {
                            // The daemon may be detached already but not yet
                            // discovered; readiness or MAINPID has the rest
                            // of the method budget to surface it.
                            debug!(
                                "{path}: forking parent exited before its \
                                 daemon surfaced"
                            );
                        }
                    }
                    UnitState::Start if empty => {
                        self.method_failure(path, MethodKind::Start, ctx);
                    }
                    _ => {}
                }
            } else if state == UnitState::Online {
                // The graph decides restart policy from the offline note.
                warn!("{path}: main pid {pid} exited abnormally while online");
                self.purge_pids(path, true, ctx);
                self.begin_stop(path, UnitState::Offline, ctx);
            } else if let Some(method) = Unit::method_for_state(state) {
                self.method_failure(path, method, ctx);
            } else {
                warn!("{path}: abnormal exit of {pid} in state {state}");
            }
        } else if was_secondary && state == UnitState::PostStart {
            self.clear_method_timer(path, ctx);
            if flags.normal {
                self.enter(path, UnitState::Online, ctx);
            } else {
                self.method_failure(path, MethodKind::Poststart, ctx);
            }
        }
    }

    fn on_method_timeout(&mut self, path: &ServicePath, ctx: &mut RestarterCtx<'_>) {
        let Some(unit) = self.units.get_mut(path) else {
            return;
        };
        unit.method_timer = None;
        let state = unit.state;
        match state {
            UnitState::Stop => {
                warn!("{path}: stop method overran its budget");
                self.enter(path, UnitState::StopTerm, ctx);
            }
            UnitState::StopTerm => {
                warn!("{path}: processes survived SIGTERM; escalating");
                self.enter(path, UnitState::StopKill, ctx);
            }
            UnitState::StopKill => {
                error!("{path}: processes survived SIGKILL");
                self.stop_phase_complete(path, ctx);
            }
            UnitState::PreStart | UnitState::Start => {
                warn!("{path}: {state} method timed out");
                let method =
                    Unit::method_for_state(state).expect("startup states have methods");
                self.method_failure(path, method, ctx);
            }
            UnitState::PostStart | UnitState::PostStop => {
                warn!("{path}: {state} method timed out");
                if let Some(pid) = unit.secondary_pid {
                    ctx.forker.kill(pid, Signal::SIGKILL);
                }
                let method =
                    Unit::method_for_state(state).expect("aux states have methods");
                self.method_failure(path, method, ctx);
            }
            _ => error!("{path}: method timer fired in state {state}"),
        }
    }

    /// Transient failure policy: count, then either schedule a restart of
    /// the failed state or park the unit in maintenance.
    fn method_failure(
        &mut self,
        path: &ServicePath,
        method: MethodKind,
        ctx: &mut RestarterCtx<'_>,
    ) {
        self.clear_method_timer(path, ctx);
        self.purge_pids(path, true, ctx);
        let Some(unit) = self.units.get_mut(path) else {
            return;
        };
        let count = unit.failures(method) + 1;
        unit.fail_counts.insert(method, count);
        let state = unit.state;

        if count > MAX_METHOD_FAILURES {
            error!("{path}: {method} failed {count} times; giving up");
            self.enter(path, UnitState::Maintenance, ctx);
        } else {
            warn!(
                "{path}: {method} failed ({count}/{MAX_METHOD_FAILURES}); restarting \
                 in {}ms",
                RESTART_COOLDOWN.as_millis()
            );
            unit.restart_state = Some(state);
            unit.restart_timer = Some(ctx.timers.add(
                RESTART_COOLDOWN,
                TimerPayload::RestartCooldown(path.clone()),
            ));
        }
    }

    /// Begins a shutdown headed for `target`.
    fn begin_stop(
        &mut self,
        path: &ServicePath,
        target: UnitState,
        ctx: &mut RestarterCtx<'_>,
    ) {
        if let Some(unit) = self.units.get_mut(path) {
            unit.target = target;
        }
        self.enter(path, UnitState::Stop, ctx);
    }

    /// The PID set emptied during the kill ladder: run poststop if defined,
    /// otherwise land on the target state.
    fn stop_phase_complete(&mut self, path: &ServicePath, ctx: &mut RestarterCtx<'_>) {
        let Some(unit) = self.units.get(path) else {
            return;
        };
        if unit.state != UnitState::PostStop
            && unit.methods.contains_key(&MethodKind::Poststop)
        {
            self.enter(path, UnitState::PostStop, ctx);
        } else {
            self.finalize_stop(path, ctx);
        }
    }

    fn finalize_stop(&mut self, path: &ServicePath, ctx: &mut RestarterCtx<'_>) {
        self.clear_method_timer(path, ctx);
        let Some(unit) = self.units.get(path) else {
            return;
        };
        let target = match unit.target {
            UnitState::Maintenance => UnitState::Maintenance,
            _ => UnitState::Offline,
        };
        self.enter(path, target, ctx);
    }

    /// Forks the method for a state. On fork failure the unit lands in
    /// maintenance immediately (documented policy; kinder alternatives are a
    /// future policy review). Returns whether the fork took.
    fn fork_for_state(
        &mut self,
        path: &ServicePath,
        method: MethodKind,
        as_main: bool,
        ctx: &mut RestarterCtx<'_>,
    ) -> bool {
        match self.fork_method(path, method, ctx) {
            Ok(pid) => {
                let unit = self.units.get_mut(path).expect("present");
                if as_main {
                    unit.main_pid = Some(pid);
                } else {
                    unit.secondary_pid = Some(pid);
                }
                self.arm_method_timer(path, ctx);
                true
            }
            Err(err) => {
                error!("{path}: failed to fork {method}: {err}");
                self.enter(path, UnitState::Maintenance, ctx);
                false
            }
        }
    }

    /// Stop-method forks must not land in maintenance mid-shutdown; a
    /// failure just escalates the ladder. Returns whether the fork took.
    fn fork_stop_method(&mut self, path: &ServicePath, ctx: &mut RestarterCtx<'_>) -> bool {
        match self.fork_method(path, MethodKind::Stop, ctx) {
            Ok(pid) => {
                let unit = self.units.get_mut(path).expect("present");
                unit.secondary_pid = Some(pid);
                self.arm_method_timer(path, ctx);
                true
            }
            Err(err) => {
                error!("{path}: failed to fork stop method: {err}");
                false
            }
        }
    }

    fn fork_method(
        &mut self,
        path: &ServicePath,
        method: MethodKind,
        ctx: &mut RestarterCtx<'_>,
    ) -> Result<u32, crate::error::SpawnError> {
        let unit = self
            .units
            .get_mut(path)
            .expect("fork_method called for a known unit");
        let command = unit
            .methods
            .get(&method)
            .ok_or_else(|| crate::error::SpawnError::NoCommand(method.to_string()))?
            .clone();

        let pids = &mut unit.pids;
        let pid_owners = &mut self.pid_owners;
        let tracker = &mut *ctx.tracker;
        ctx.forker
            .fork_method(path, method, &command, &mut |pid| {
                // Enrollment happens while the child is still held.
                tracker.watch(pid);
                pids.insert(pid);
                pid_owners.insert(pid, path.clone());
            })
    }

    fn arm_method_timer(&mut self, path: &ServicePath, ctx: &mut RestarterCtx<'_>) {
        self.clear_method_timer(path, ctx);
        if let Some(unit) = self.units.get_mut(path) {
            unit.method_timer = Some(
                ctx.timers
                    .add(METHOD_TIMEOUT, TimerPayload::Method(path.clone())),
            );
        }
    }

    fn clear_method_timer(&mut self, path: &ServicePath, ctx: &mut RestarterCtx<'_>) {
        if let Some(unit) = self.units.get_mut(path)
            && let Some(id) = unit.method_timer.take()
        {
            ctx.timers.del(id);
        }
    }

    fn clear_restart_timer(&mut self, path: &ServicePath, ctx: &mut RestarterCtx<'_>) {
        if let Some(unit) = self.units.get_mut(path) {
            if let Some(id) = unit.restart_timer.take() {
                ctx.timers.del(id);
            }
            unit.restart_state = None;
        }
    }

    /// Drops every tracked PID, optionally killing survivors first.
    fn purge_pids(&mut self, path: &ServicePath, kill: bool, ctx: &mut RestarterCtx<'_>) {
        let Some(unit) = self.units.get_mut(path) else {
            return;
        };
        for pid in std::mem::take(&mut unit.pids) {
            if kill {
                ctx.forker.kill(pid, Signal::SIGKILL);
            }
            ctx.tracker.disregard(pid);
            self.pid_owners.remove(&pid);
        }
        unit.main_pid = None;
        unit.secondary_pid = None;
    }
}
