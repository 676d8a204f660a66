//! Scenario tests for the graph engine: cycle rejection, exclusion,
//! restart-reason gating, and administrative round trips.

#[path = "common/mod.rs"]
mod common;

use common::{Harness, group, inst, service};
use unitd::graph::{Satisfy, VertexState};
use unitd::note::{AdminSub, Reason, StateSub};
use unitd::repository::GroupKind;
use unitd::unit::{MethodKind, UnitKind};

#[test]
fn mutual_requirement_rejects_the_closing_edge() {
    let h = Harness::new(vec![
        service(
            "a",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/ad")],
            vec![group(GroupKind::RequireAll, Reason::Any, &["b:i"])],
        ),
        service(
            "b",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/bd")],
            vec![group(GroupKind::RequireAll, Reason::Any, &["a:i"])],
        ),
    ]);

    // a:i's group kept its edge; the mirror group on b:i was refused.
    let a_group = h
        .sup
        .graph()
        .vertex_by_path(&inst("a").depgroup(0))
        .expect("a group vertex");
    let b_group = h
        .sup
        .graph()
        .vertex_by_path(&inst("b").depgroup(0))
        .expect("b group vertex");
    assert_eq!(a_group.dependencies.len(), 1);
    assert_eq!(b_group.dependencies.len(), 0);

    h.assert_invariants();
}

#[test]
fn installation_is_idempotent() {
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

    let vertex_count = h.sup.graph().len();
    let edge_count: usize = h
        .sup
        .graph()
        .vertices()
        .map(|v| v.dependencies.len())
        .sum();

    h.sup.bootstrap();

    assert_eq!(h.sup.graph().len(), vertex_count);
    let edge_count_after: usize = h
        .sup
        .graph()
        .vertices()
        .map(|v| v.dependencies.len())
        .sum();
    assert_eq!(edge_count_after, edge_count);
    h.assert_invariants();
}

#[test]
fn exclusion_tracks_the_target_lifecycle() {
    // a excludes b; b is supervised elsewhere, so its states arrive as
    // plain notes.
    let mut h = Harness::new(vec![
        service(
            "a",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/ad")],
            vec![group(GroupKind::ExcludeAll, Reason::None, &["b:i"])],
        ),
        service("b", UnitKind::Forks, &[], vec![]),
    ]);

    h.admin(&inst("b"), AdminSub::Enable);
    h.state_change(&inst("b"), StateSub::Online, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfiable);

    h.state_change(&inst("b"), StateSub::Offline, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfied);

    h.state_change(&inst("b"), StateSub::Disabled, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Satisfied);
    h.assert_invariants();
}

#[test]
fn exclusion_never_blocks_target_shutdown() {
    let mut h = Harness::new(vec![
        service(
            "a",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/ad")],
            vec![group(GroupKind::ExcludeAll, Reason::None, &["b:i"])],
        ),
        service(
            "b",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/bd")],
            vec![],
        ),
    ]);

    h.admin(&inst("b"), AdminSub::Enable);
    let b = h.sup.graph().vertex_by_path(&inst("b")).unwrap();
    assert_eq!(b.state, VertexState::Online);

    // a's exclusion edge points at b, but a is not a real dependent:
    // b can go down without consulting it.
    assert!(h.sup.graph().can_go_down(b.id));
}

#[test]
fn restart_reason_gating_cuts_weak_subscriptions() {
    // web requires db through a group subscribed at on-error severity.
    let mut h = Harness::new(vec![
        service("db", UnitKind::Forks, &[], vec![]),
        service(
            "web",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/webd")],
            vec![group(GroupKind::RequireAll, Reason::Error, &["db:i"])],
        ),
    ]);

    // Seed both online.
    h.state_change(&inst("db"), StateSub::Online, Reason::Restart);
    h.admin(&inst("web"), AdminSub::Enable);
    assert_eq!(
        h.sup.graph().vertex_by_path(&inst("web")).unwrap().state,
        VertexState::Online
    );

    // A restart-severity stop does not cross an on-error subscription.
    h.state_change(&inst("db"), StateSub::Offline, Reason::Restart);
    let web = h.sup.graph().vertex_by_path(&inst("web")).unwrap();
    assert_eq!(web.state, VertexState::Online);
    assert!(!web.to_offline);

    // An error-severity stop does.
    h.state_change(&inst("db"), StateSub::Online, Reason::Restart);
    h.state_change(&inst("db"), StateSub::Offline, Reason::Error);
    let web_unit = h.sup.restarter().unit(&inst("web")).unwrap();
    assert!(web_unit.state.is_stopping());
    h.assert_invariants();
}

#[test]
fn enable_then_disable_matches_a_single_disable() {
    let records = || {
        vec![service("a", UnitKind::Simple, &[], vec![])]
    };

    let mut enabled_then_disabled = Harness::new(records());
    enabled_then_disabled.admin(&inst("a"), AdminSub::Enable);
    enabled_then_disabled.admin(&inst("a"), AdminSub::Disable);

    let mut disabled_once = Harness::new(records());
    disabled_once.admin(&inst("a"), AdminSub::Disable);

    for path in [inst("a"), inst("a").service_path()] {
        let left = enabled_then_disabled
            .sup
            .graph()
            .vertex_by_path(&path)
            .unwrap();
        let right = disabled_once.sup.graph().vertex_by_path(&path).unwrap();
        assert_eq!(left.state, right.state, "{path}");
        assert_eq!(left.is_enabled, right.is_enabled, "{path}");
        assert_eq!(left.to_offline, right.to_offline, "{path}");
        assert_eq!(left.to_disable, right.to_disable, "{path}");
    }
    assert_eq!(
        enabled_then_disabled
            .sup
            .graph()
            .vertex_by_path(&inst("a"))
            .unwrap()
            .state,
        VertexState::Disabled
    );
}

#[test]
fn dependents_start_when_their_dependency_arrives() {
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

    // web is enabled first; its dependency is down, so it waits.
    h.admin(&inst("web"), AdminSub::Enable);
    assert_eq!(
        h.sup.graph().vertex_by_path(&inst("web")).unwrap().state,
        VertexState::Offline
    );
    assert!(h.forked().is_empty());

    // db coming up triggers the waiting dependent in the same drain.
    h.admin(&inst("db"), AdminSub::Enable);
    assert_eq!(
        h.sup.graph().vertex_by_path(&inst("db")).unwrap().state,
        VertexState::Online
    );
    assert_eq!(
        h.sup.graph().vertex_by_path(&inst("web")).unwrap().state,
        VertexState::Online
    );
    let methods: Vec<_> = h.forked().iter().map(|f| f.2.clone()).collect();
    assert_eq!(methods, vec!["/usr/sbin/dbd", "/usr/sbin/webd"]);
    h.assert_invariants();
}

#[test]
fn require_any_needs_only_one_target() {
    let mut h = Harness::new(vec![
        service("b", UnitKind::Forks, &[], vec![]),
        service("c", UnitKind::Forks, &[], vec![]),
        service(
            "a",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/ad")],
            vec![group(GroupKind::RequireAny, Reason::Any, &["b:i", "c:i"])],
        ),
    ]);

    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfied);

    h.state_change(&inst("c"), StateSub::Online, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Satisfied);

    // Both targets permanently out is the only unsatisfiable shape.
    h.state_change(&inst("b"), StateSub::Disabled, Reason::Restart);
    h.state_change(&inst("c"), StateSub::Disabled, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfiable);
}

#[test]
fn optional_all_excuses_the_unsatisfiable() {
    let mut h = Harness::new(vec![
        service("extras", UnitKind::Forks, &[], vec![]),
        service(
            "a",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/ad")],
            vec![group(GroupKind::OptionalAll, Reason::Any, &["extras:i"])],
        ),
    ]);

    // A target that might still come up holds the group open.
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfied);

    // A disabled target is excused entirely.
    h.state_change(&inst("extras"), StateSub::Disabled, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Satisfied);

    // And an online one satisfies it outright.
    h.state_change(&inst("extras"), StateSub::Online, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Satisfied);
}

#[test]
fn satisfiability_table_for_instance_states() {
    let mut h = Harness::new(vec![
        service("dep", UnitKind::Forks, &[], vec![]),
        service(
            "a",
            UnitKind::Simple,
            &[(MethodKind::Start, "/usr/sbin/ad")],
            vec![group(GroupKind::RequireAll, Reason::Any, &["dep:i"])],
        ),
    ]);

    // Uninitialised.
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfied);

    // Offline.
    h.state_change(&inst("dep"), StateSub::Offline, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfied);

    // Online.
    h.state_change(&inst("dep"), StateSub::Online, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Satisfied);

    // Maintenance.
    h.state_change(&inst("dep"), StateSub::Maintenance, Reason::Error);
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfiable);

    // Disabled.
    h.state_change(&inst("dep"), StateSub::Disabled, Reason::Restart);
    assert_eq!(h.probe(&inst("a")), Satisfy::Unsatisfiable);
}

#[test]
fn unknown_paths_are_logged_and_discarded() {
    let mut h = Harness::new(vec![service(
        "a",
        UnitKind::Simple,
        &[(MethodKind::Start, "/usr/sbin/ad")],
        vec![],
    )]);

    let before = h.sup.graph().len();
    h.state_change(
        &unitd::path::ServicePath::instance("ghost", "i"),
        StateSub::Online,
        Reason::Restart,
    );
    h.admin(
        &unitd::path::ServicePath::instance("ghost", "i"),
        AdminSub::Enable,
    );
    assert_eq!(h.sup.graph().len(), before);
    assert!(h.forked().is_empty());
    h.assert_invariants();
}
