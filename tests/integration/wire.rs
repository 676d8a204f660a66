//! Wire-format pinning for the note envelope and control messages.

use serde_json::Value;
use unitd::ipc::{ControlCommand, WireNote, WirePath};
use unitd::note::{AdminSub, Note, Reason, RequestSub, StateSub};
use unitd::path::ServicePath;

#[test]
fn envelope_field_order_and_names_are_pinned() {
    let note = Note::RestarterRequest {
        path: ServicePath::instance("svc", "inst"),
        sub: RequestSub::Start,
        reason: Reason::Refresh,
    };
    let json = serde_json::to_string(&WireNote::from(&note)).unwrap();
    assert_eq!(
        json,
        r#"{"kind":"restarter_req","sub":"start","path":{"svc":"svc","inst":"inst"},"reason":3}"#
    );
}

#[test]
fn null_instance_serializes_as_json_null() {
    let note = Note::AdminReq {
        path: ServicePath::service("svc"),
        sub: AdminSub::Restart,
        reason: Reason::Any,
    };
    let value: Value =
        serde_json::from_str(&serde_json::to_string(&WireNote::from(&note)).unwrap())
            .unwrap();
    assert_eq!(value["path"]["inst"], Value::Null);
    assert_eq!(value["reason"], Value::from(4));
}

#[test]
fn every_sub_type_survives_the_wire() {
    let path = ServicePath::instance("a", "i");
    let notes = [
        Note::StateChange {
            path: path.clone(),
            sub: StateSub::Online,
            reason: Reason::None,
        },
        Note::StateChange {
            path: path.clone(),
            sub: StateSub::Offline,
            reason: Reason::Error,
        },
        Note::StateChange {
            path: path.clone(),
            sub: StateSub::Disabled,
            reason: Reason::Restart,
        },
        Note::StateChange {
            path: path.clone(),
            sub: StateSub::Maintenance,
            reason: Reason::Error,
        },
        Note::AdminReq {
            path: path.clone(),
            sub: AdminSub::Enable,
            reason: Reason::Restart,
        },
        Note::AdminReq {
            path: path.clone(),
            sub: AdminSub::Disable,
            reason: Reason::Restart,
        },
        Note::AdminReq {
            path: path.clone(),
            sub: AdminSub::Restart,
            reason: Reason::Restart,
        },
        Note::RestarterRequest {
            path: path.clone(),
            sub: RequestSub::Start,
            reason: Reason::Restart,
        },
        Note::RestarterRequest {
            path,
            sub: RequestSub::Stop,
            reason: Reason::Any,
        },
    ];

    for note in notes {
        let wire = WireNote::from(&note);
        let line = serde_json::to_string(&wire).unwrap();
        let parsed: WireNote = serde_json::from_str(&line).unwrap();
        assert_eq!(Note::try_from(parsed).unwrap(), note, "{line}");
    }
}

#[test]
fn foreign_envelopes_are_rejected_not_guessed() {
    for (kind, sub) in [
        ("state_change", "enable"),
        ("admin_req", "online"),
        ("restarter_req", "disable"),
        ("query", "start"),
    ] {
        let wire = WireNote {
            kind: kind.into(),
            sub: sub.into(),
            path: WirePath {
                svc: "a".into(),
                inst: None,
            },
            reason: 0,
        };
        assert!(Note::try_from(wire).is_err(), "{kind}/{sub}");
    }
}

#[test]
fn control_commands_round_trip_as_lines() {
    let command = ControlCommand::Note(WireNote::from(&Note::AdminReq {
        path: ServicePath::instance("a", "i"),
        sub: AdminSub::Enable,
        reason: Reason::Restart,
    }));
    let line = serde_json::to_string(&command).unwrap();
    assert!(!line.contains('\n'));
    let parsed: ControlCommand = serde_json::from_str(&line).unwrap();
    match parsed {
        ControlCommand::Note(wire) => {
            assert_eq!(wire.kind, "admin_req");
            assert_eq!(wire.sub, "enable");
        }
        other => panic!("unexpected command: {other:?}"),
    }
}
