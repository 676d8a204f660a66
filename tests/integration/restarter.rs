//! Scenario tests for the restarter core: startup sequencing, failure
//! escalation, stop escalation, and readiness handling.

#[path = "common/mod.rs"]
mod common;

use common::{Harness, group, inst, service};
use unitd::graph::VertexState;
use unitd::note::{AdminSub, Reason, RequestSub, StateSub};
use unitd::repository::{GroupKind, InMemoryRepository};
use unitd::restarter::{Restarter, RestarterCtx, TimerPayload};
use unitd::spawn::FakeForker;
use unitd::timer::{ManualClock, TimerSet};
use unitd::tracker::ScriptedTracker;
use unitd::unit::{MethodKind, UnitKind, UnitState};

#[test]
fn simple_unit_clean_start() {
    let mut h = Harness::new(vec![service(
        "a",
        UnitKind::Simple,
        &[(MethodKind::Start, "/bin/true")],
        vec![],
    )]);

    h.admin(&inst("a"), AdminSub::Enable);

    let forked = h.forked();
    assert_eq!(forked.len(), 1);
    assert_eq!(forked[0], (inst("a"), MethodKind::Start, "/bin/true".into()));

    let unit = h.sup.restarter().unit(&inst("a")).expect("unit created");
    assert_eq!(unit.state, UnitState::Online);
    assert_eq!(unit.main_pid, Some(1000));
    assert!(unit.pids.contains(&1000));
    assert!(unit.method_timer.is_none());

    let vertex = h.sup.graph().vertex_by_path(&inst("a")).expect("vertex");
    assert_eq!(vertex.state, VertexState::Online);
    h.assert_invariants();
}

#[test]
fn prestart_runs_before_start() {
    let mut h = Harness::new(vec![service(
        "a",
        UnitKind::Simple,
        &[
            (MethodKind::Prestart, "/usr/libexec/setup"),
            (MethodKind::Start, "/usr/sbin/ad"),
        ],
        vec![],
    )]);

    h.admin(&inst("a"), AdminSub::Enable);
    let unit = h.sup.restarter().unit(&inst("a")).unwrap();
    assert_eq!(unit.state, UnitState::PreStart);

    // Prestart finished cleanly; the start method takes over as main.
    h.exit(1000, 0);
    let forked = h.forked();
    assert_eq!(forked.len(), 2);
    assert_eq!(forked[0].1, MethodKind::Prestart);
    assert_eq!(forked[1].1, MethodKind::Start);

    let unit = h.sup.restarter().unit(&inst("a")).unwrap();
    assert_eq!(unit.state, UnitState::Online);
    assert_eq!(unit.main_pid, Some(1001));
    h.assert_invariants();
}

#[test]
fn abnormal_exits_escalate_to_maintenance_on_the_sixth() {
    let mut h = Harness::new(vec![service(
        "u",
        UnitKind::Forks,
        &[(MethodKind::Start, "/bin/false")],
        vec![],
    )]);

    h.admin(&inst("u"), AdminSub::Enable);
    assert_eq!(h.forked().len(), 1);

    // Five failures each earn a retry after the 5000 ms cooldown and the
    // 500 ms re-entry delay.
    for round in 0..5u32 {
        let pid = 1000 + round;
        h.exit(pid, 1);
        assert_eq!(h.forked().len(), (round + 1) as usize);

        // Nothing restarts before the cooldown runs out.
        h.tick(4999);
        assert_eq!(h.forked().len(), (round + 1) as usize);
        h.tick(1);

        // Re-entry waits its own delay.
        h.tick(499);
        assert_eq!(h.forked().len(), (round + 1) as usize);
        h.tick(1);
        assert_eq!(h.forked().len(), (round + 2) as usize);
    }

    // The sixth failure parks the unit.
    h.exit(1005, 1);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::Maintenance);
    assert!(unit.pids.is_empty());
    assert!(unit.method_timer.is_none());
    assert!(unit.restart_timer.is_none());
    assert_eq!(h.sup.poll_timeout(), None);
    assert_eq!(h.forked().len(), 6);

    let vertex = h.sup.graph().vertex_by_path(&inst("u")).unwrap();
    assert_eq!(vertex.state, VertexState::Maintenance);
    h.assert_invariants();
}

#[test]
fn method_timeout_counts_as_a_failure() {
    let mut h = Harness::new(vec![service(
        "u",
        UnitKind::Forks,
        &[(MethodKind::Start, "/usr/sbin/slowd")],
        vec![],
    )]);

    h.admin(&inst("u"), AdminSub::Enable);
    assert_eq!(h.forked().len(), 1);

    // 2000 ms without completion or readiness fails the method.
    h.tick(2000);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.failures(MethodKind::Start), 1);
    assert!(unit.restart_timer.is_some());

    // The straggler was purged during the failure.
    assert!(unit.pids.is_empty());
    assert_eq!(h.kills(), vec![(1000, "SIGKILL".to_string())]);
    h.assert_invariants();
}

#[test]
fn stop_escalates_from_term_to_kill() {
    let mut h = Harness::new(vec![service(
        "u",
        UnitKind::Simple,
        &[(MethodKind::Start, "/usr/sbin/stubbornd")],
        vec![],
    )]);

    h.admin(&inst("u"), AdminSub::Enable);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::Online);

    h.admin(&inst("u"), AdminSub::Disable);

    // No stop method: straight to SIGTERM.
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::StopTerm);
    assert_eq!(h.kills(), vec![(1000, "SIGTERM".to_string())]);

    // The child ignored SIGTERM; 2000 ms later comes SIGKILL.
    h.tick(2000);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::StopKill);
    assert_eq!(
        h.kills(),
        vec![
            (1000, "SIGTERM".to_string()),
            (1000, "SIGKILL".to_string())
        ]
    );

    // SIGKILL lands; the unit settles on its target and the vertex is
    // disabled once the shutdown completes.
    h.exit_signaled(1000, 9);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::Offline);
    assert!(unit.pids.is_empty());

    let vertex = h.sup.graph().vertex_by_path(&inst("u")).unwrap();
    assert_eq!(vertex.state, VertexState::Disabled);
    assert!(!vertex.is_enabled);
    assert!(!vertex.to_offline);
    assert!(!vertex.to_disable);
    h.assert_invariants();
}

#[test]
fn readiness_advances_a_forks_unit() {
    let mut h = Harness::new(vec![service(
        "d",
        UnitKind::Forks,
        &[(MethodKind::Start, "/usr/sbin/dbd")],
        vec![],
    )]);

    h.admin(&inst("d"), AdminSub::Enable);
    let unit = h.sup.restarter().unit(&inst("d")).unwrap();
    assert_eq!(unit.state, UnitState::Start);

    h.sup.handle_notify(unitd::notify::NotifyMessage {
        pid: Some(1000),
        items: vec![unitd::notify::NotifyItem::Ready],
    });

    let unit = h.sup.restarter().unit(&inst("d")).unwrap();
    assert_eq!(unit.state, UnitState::Online);
    assert!(unit.method_timer.is_none());
    h.assert_invariants();
}

#[test]
fn daemonizing_start_adopts_the_surviving_child() {
    let mut h = Harness::new(vec![service(
        "d",
        UnitKind::Forks,
        &[(MethodKind::Start, "/usr/sbin/dbd")],
        vec![],
    )]);

    h.admin(&inst("d"), AdminSub::Enable);

    // The start method forks its real self, then the parent exits zero.
    h.sup.inject_proc_event(unitd::tracker::ProcEvent::Child {
        parent: 1000,
        pid: 4242,
    });
    h.exit(1000, 0);

    let unit = h.sup.restarter().unit(&inst("d")).unwrap();
    assert_eq!(unit.state, UnitState::Start);
    assert_eq!(unit.main_pid, Some(4242));
    assert!(unit.pids.contains(&4242));

    // STATUS and MAINPID annotations arrive from the adopted child.
    h.sup.handle_notify(unitd::notify::NotifyMessage {
        pid: Some(4242),
        items: vec![
            unitd::notify::NotifyItem::Status("recovering journal".into()),
            unitd::notify::NotifyItem::Ready,
        ],
    });
    let unit = h.sup.restarter().unit(&inst("d")).unwrap();
    assert_eq!(unit.state, UnitState::Online);
    assert_eq!(unit.status_text.as_deref(), Some("recovering journal"));
    h.assert_invariants();
}

#[test]
fn forks_parent_exit_waits_out_the_method_budget() {
    let mut h = Harness::new(vec![service(
        "d",
        UnitKind::Forks,
        &[(MethodKind::Start, "/usr/sbin/dbd")],
        vec![],
    )]);

    h.admin(&inst("d"), AdminSub::Enable);

    // The parent exits clean before its daemon was discovered. That is not
    // a failure yet; the method timer keeps running.
    h.exit(1000, 0);
    let unit = h.sup.restarter().unit(&inst("d")).unwrap();
    assert_eq!(unit.state, UnitState::Start);
    assert_eq!(unit.failures(MethodKind::Start), 0);
    assert!(unit.method_timer.is_some());

    // Nothing surfaced within the budget; the normal policy takes over.
    h.tick(2000);
    let unit = h.sup.restarter().unit(&inst("d")).unwrap();
    assert_eq!(unit.failures(MethodKind::Start), 1);
    assert!(unit.restart_timer.is_some());
    h.assert_invariants();
}

#[test]
fn poststop_runs_after_the_kill_ladder() {
    let mut h = Harness::new(vec![service(
        "u",
        UnitKind::Simple,
        &[
            (MethodKind::Start, "/usr/sbin/ud"),
            (MethodKind::Poststop, "/usr/libexec/cleanup"),
        ],
        vec![],
    )]);

    h.admin(&inst("u"), AdminSub::Enable);
    h.admin(&inst("u"), AdminSub::Disable);

    // Start pid got SIGTERM and died; poststop takes over.
    h.exit_signaled(1000, 15);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::PostStop);
    let forked = h.forked();
    assert_eq!(forked.last().unwrap().1, MethodKind::Poststop);

    h.exit(1001, 0);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::Offline);
    assert!(unit.pids.is_empty());
    h.assert_invariants();
}

#[test]
fn fork_failure_lands_in_maintenance() {
    let mut h = Harness::new(vec![service(
        "u",
        UnitKind::Simple,
        &[(MethodKind::Start, "/usr/sbin/ud")],
        vec![],
    )]);

    h.forker.0.borrow_mut().fail_next = true;
    h.admin(&inst("u"), AdminSub::Enable);

    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::Maintenance);
    assert!(unit.pids.is_empty());
    assert_eq!(h.sup.poll_timeout(), None);
    h.assert_invariants();
}

#[test]
fn crash_while_online_restarts_through_the_graph() {
    let mut h = Harness::new(vec![service(
        "u",
        UnitKind::Simple,
        &[(MethodKind::Start, "/usr/sbin/flakyd")],
        vec![],
    )]);

    h.admin(&inst("u"), AdminSub::Enable);
    assert_eq!(h.forked().len(), 1);

    // An abnormal exit while online purges the unit; the graph sees the
    // offline note, still considers the instance startable, and restarts it
    // in the same drain.
    h.exit(1000, 1);
    let unit = h.sup.restarter().unit(&inst("u")).unwrap();
    assert_eq!(unit.state, UnitState::Online);
    assert_eq!(unit.main_pid, Some(1001));
    assert_eq!(h.forked().len(), 2);
    h.assert_invariants();
}

// Direct restarter tests below use a hand-built context instead of the
// supervisor so they can exercise the unit API in isolation.

struct Parts {
    repo: InMemoryRepository,
    timers: TimerSet<TimerPayload>,
    bus: unitd::note::NoteBus,
    forker: FakeForker,
    tracker: ScriptedTracker,
}

impl Parts {
    fn new(records: Vec<unitd::repository::ServiceRecord>) -> Self {
        let mut repo = InMemoryRepository::new();
        for record in records {
            repo.insert(record);
        }
        Self {
            repo,
            timers: TimerSet::new(Box::new(ManualClock::new())),
            bus: unitd::note::NoteBus::new(),
            forker: FakeForker::new(),
            tracker: ScriptedTracker::new(),
        }
    }

    fn ctx(&mut self) -> RestarterCtx<'_> {
        RestarterCtx {
            timers: &mut self.timers,
            bus: &mut self.bus,
            forker: &mut self.forker,
            tracker: &mut self.tracker,
            repo: &self.repo,
        }
    }
}

#[test]
fn unit_add_is_idempotent() {
    let mut parts = Parts::new(vec![service(
        "a",
        UnitKind::Simple,
        &[(MethodKind::Start, "/bin/true")],
        vec![],
    )]);
    let mut restarter = Restarter::new();

    restarter.unit_add(&inst("a"), &mut parts.ctx()).unwrap();
    restarter
        .unit_msg(&inst("a"), RequestSub::Start, Reason::Restart, &mut parts.ctx());
    let state_before = restarter.unit(&inst("a")).unwrap().state;

    // A second add returns the same unit untouched.
    restarter.unit_add(&inst("a"), &mut parts.ctx()).unwrap();
    assert_eq!(restarter.units().count(), 1);
    assert_eq!(restarter.unit(&inst("a")).unwrap().state, state_before);

    // Unknown paths are refused, not fabricated.
    assert!(restarter.unit_add(&inst("ghost"), &mut parts.ctx()).is_err());
}

#[test]
fn start_then_stop_leaves_the_unit_offline_and_empty() {
    let mut parts = Parts::new(vec![service(
        "a",
        UnitKind::Simple,
        &[(MethodKind::Start, "/usr/sbin/ad")],
        vec![],
    )]);
    let mut restarter = Restarter::new();

    restarter
        .unit_msg(&inst("a"), RequestSub::Start, Reason::Restart, &mut parts.ctx());
    let pid = restarter.unit(&inst("a")).unwrap().main_pid.expect("forked");
    assert_eq!(restarter.unit(&inst("a")).unwrap().state, UnitState::Online);

    restarter
        .unit_msg(&inst("a"), RequestSub::Stop, Reason::Restart, &mut parts.ctx());
    restarter.unit_ptevent(
        unitd::tracker::ProcEvent::Exit {
            pid,
            flags: unitd::tracker::ExitFlags::signaled(15),
        },
        &mut parts.ctx(),
    );

    let unit = restarter.unit(&inst("a")).unwrap();
    assert_eq!(unit.state, UnitState::Offline);
    assert!(unit.pids.is_empty());
    assert!(parts.tracker.watched_count() == 0);

    // The bus carries online then offline state changes, in order.
    let mut subs = Vec::new();
    while let Some(note) = parts.bus.pop() {
        if let unitd::note::Note::StateChange { sub, .. } = note {
            subs.push(sub);
        }
    }
    assert_eq!(subs, vec![StateSub::Online, StateSub::Offline]);
    restarter.check_invariants().expect("restarter invariants");
}

#[test]
fn stop_request_for_an_idle_unit_completes_immediately() {
    let mut parts = Parts::new(vec![service(
        "a",
        UnitKind::Simple,
        &[(MethodKind::Start, "/bin/true")],
        vec![],
    )]);
    let mut restarter = Restarter::new();

    restarter
        .unit_msg(&inst("a"), RequestSub::Stop, Reason::Restart, &mut parts.ctx());
    // The graph's bookkeeping still gets its offline note.
    assert!(matches!(
        parts.bus.pop(),
        Some(unitd::note::Note::StateChange {
            sub: StateSub::Offline,
            ..
        })
    ));
    assert_eq!(parts.forker.forked.len(), 0);
}

#[test]
fn dependent_stop_propagates_before_dependency_shutdown() {
    // web requires db; disabling db stops web too.
    let mut h = Harness::new(vec![
        service(
            "db",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/dbd")],
            vec![],
        ),
        service(
            "web",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/webd")],
            vec![group(GroupKind::RequireAll, Reason::Any, &["db:i"])],
        ),
    ]);

    h.admin(&inst("db"), AdminSub::Enable);
    h.admin(&inst("web"), AdminSub::Enable);
    assert_eq!(h.sup.restarter().unit(&inst("web")).unwrap().state, UnitState::Online);

    h.admin(&inst("db"), AdminSub::Disable);

    // Both received SIGTERM; finish their shutdowns.
    let web_pid = h.sup.restarter().unit(&inst("web")).unwrap().pids.iter().copied().next();
    let db_pid = h.sup.restarter().unit(&inst("db")).unwrap().pids.iter().copied().next();
    if let Some(pid) = web_pid {
        h.exit_signaled(pid, 15);
    }
    if let Some(pid) = db_pid {
        h.exit_signaled(pid, 15);
    }

    let web = h.sup.graph().vertex_by_path(&inst("web")).unwrap();
    let db = h.sup.graph().vertex_by_path(&inst("db")).unwrap();
    assert_eq!(db.state, VertexState::Disabled);
    // web was stopped because its dependency left, not disabled itself.
    assert_eq!(web.state, VertexState::Offline);
    assert!(web.is_enabled);
    h.assert_invariants();
}
