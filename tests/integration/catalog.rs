//! Catalog loading end to end: YAML file to repository to graph.

use std::fs;

use tempfile::tempdir;
use unitd::config::load_catalog;
use unitd::graph::Graph;
use unitd::path::ServicePath;
use unitd::repository::{GroupKind, Repository};
use unitd::unit::{MethodKind, UnitKind};

const CATALOG: &str = r#"
version: "1"
services:
  db:
    type: forks
    instances: [main]
    methods:
      prestart: /usr/libexec/db-init
      start: /usr/sbin/dbd
      stop: /usr/sbin/dbctl stop
  web:
    methods:
      start: /usr/sbin/webd
    dependencies:
      - name: storage
        kind: require_all
        restart_on: error
        targets: ["db:main"]
"#;

#[test]
fn catalog_file_builds_a_wired_graph() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("unitd.yaml");
    fs::write(&path, CATALOG).expect("write catalog");

    let catalog = load_catalog(&path).expect("load catalog");
    let repo = catalog.into_repository().expect("convert catalog");

    let db = repo.lookup(&ServicePath::service("db")).expect("db record");
    assert_eq!(db.kind, UnitKind::Forks);
    assert_eq!(db.methods.len(), 3);
    assert!(db.methods.contains_key(&MethodKind::Prestart));

    let mut graph = Graph::new();
    graph.install_from_repository(&repo);
    graph.check_invariants().expect("graph invariants");

    // Service, instance, and synthesized group vertices all present.
    assert!(graph.vertex_by_path(&ServicePath::service("web")).is_some());
    let web_inst = ServicePath::instance("web", "default");
    assert!(graph.vertex_by_path(&web_inst).is_some());
    let group = graph
        .vertex_by_path(&web_inst.depgroup(0))
        .expect("group vertex");
    assert_eq!(group.dependencies.len(), 1);

    let web = repo.lookup(&ServicePath::service("web")).unwrap();
    assert_eq!(web.depgroups[0].kind, GroupKind::RequireAll);
}

#[test]
fn missing_catalog_is_an_io_error() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nope.yaml");
    assert!(load_catalog(&path).is_err());
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("unitd.yaml");
    fs::write(&path, "services: [not, a, map").expect("write catalog");
    assert!(load_catalog(&path).is_err());
}
