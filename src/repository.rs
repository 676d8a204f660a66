//! The service repository: a read-mostly catalog of service descriptors.
//!
//! The graph engine and restarter consume the catalog through the
//! [`Repository`] trait; the canonical implementation is the in-memory
//! catalog populated by the YAML loader in `config`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::note::Reason;
use crate::path::ServicePath;
use crate::unit::{MethodKind, UnitKind};

/// Quantifier of a dependency group.
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
pub enum GroupKind {
    /// Every target must be satisfiable.
    RequireAll,
    /// At least one target must be satisfiable.
    RequireAny,
    /// Targets that can never come up are excused.
    OptionalAll,
    /// Negative dependency: targets must not be running.
    ExcludeAll,
}

/// A named bundle of dependencies with a quantifier and a restart-severity
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepGroup {
    /// Human-readable group name from the catalog.
    pub name: String,
    /// Quantifier.
    pub kind: GroupKind,
    /// Stop events below this severity do not propagate through the group.
    pub restart_on: Reason,
    /// Services or instances the group points at.
    pub targets: Vec<ServicePath>,
}

/// A service descriptor as stored in the repository.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Service-level path.
    pub path: ServicePath,
    /// Supervision style shared by the service's instances.
    pub kind: UnitKind,
    /// Method table shared by the service's instances.
    pub methods: BTreeMap<MethodKind, String>,
    /// Instance names.
    pub instances: Vec<String>,
    /// Dependency groups, in declaration order.
    pub depgroups: Vec<DepGroup>,
}

/// Read-mostly catalog access by path lookup.
pub trait Repository {
    /// Returns the record for a service-level path.
    fn lookup(&self, path: &ServicePath) -> Option<&ServiceRecord>;

    /// All records, in stable order.
    fn records(&self) -> Vec<&ServiceRecord>;

    /// Monotonic change counter; bumps on every mutation so consumers can
    /// re-run setup when the catalog moved underneath them.
    fn version(&self) -> u64;
}

/// In-memory repository backing both tests and the catalog loader.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: HashMap<ServicePath, ServiceRecord>,
    order: Vec<ServicePath>,
    version: u64,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, keyed by its service path.
    pub fn insert(&mut self, record: ServiceRecord) {
        let key = record.path.service_path();
        if !self.records.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.records.insert(key, record);
        self.version += 1;
    }

    /// Removes a record.
    pub fn remove(&mut self, path: &ServicePath) -> Option<ServiceRecord> {
        let key = path.service_path();
        let removed = self.records.remove(&key);
        if removed.is_some() {
            self.order.retain(|p| *p != key);
            self.version += 1;
        }
        removed
    }
}

impl Repository for InMemoryRepository {
    fn lookup(&self, path: &ServicePath) -> Option<&ServiceRecord> {
        self.records.get(&path.service_path())
    }

    fn records(&self) -> Vec<&ServiceRecord> {
        self.order
            .iter()
            .filter_map(|path| self.records.get(path))
            .collect()
    }

    fn version(&self) -> u64 {
        self.version
    }
}
