//! Catalog loading for unitd.
//!
//! The catalog is the YAML edge of the service repository: it declares
//! services, their instances, method tables, and dependency groups, and is
//! parsed once into an [`InMemoryRepository`] the core consumes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ServiceManagerError;
use crate::note::Reason;
use crate::path::ServicePath;
use crate::repository::{DepGroup, GroupKind, InMemoryRepository, ServiceRecord};
use crate::unit::{MethodKind, UnitKind};

/// Instance name used when a service declares none.
pub const DEFAULT_INSTANCE: &str = "default";

/// Represents the structure of the catalog file.
#[derive(Debug, Deserialize, Clone)]
pub struct Catalog {
    /// Catalog format version.
    pub version: String,
    /// Path of the service standing in for the repository itself, if the
    /// deployment tracks one.
    #[serde(default)]
    pub repository: Option<String>,
    /// Map of service names to their definitions.
    pub services: BTreeMap<String, ServiceEntry>,
}

/// Definition of an individual service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceEntry {
    /// Supervision style. Defaults to `simple`.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: UnitKind,
    /// Instance names. Defaults to a single `default` instance.
    #[serde(default)]
    pub instances: Option<Vec<String>>,
    /// Lifecycle method commands.
    #[serde(default)]
    pub methods: BTreeMap<MethodKind, String>,
    /// Dependency groups, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<DepGroupEntry>,
}

fn default_kind() -> UnitKind {
    UnitKind::Simple
}

/// Declaration of one dependency group.
#[derive(Debug, Deserialize, Clone)]
pub struct DepGroupEntry {
    /// Optional human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Quantifier.
    pub kind: GroupKind,
    /// Stop-propagation subscription. Defaults to `none`.
    #[serde(default = "default_restart_on")]
    pub restart_on: Reason,
    /// Target paths, `svc` or `svc:inst`.
    pub targets: Vec<String>,
}

fn default_restart_on() -> Reason {
    Reason::None
}

/// Loads and parses a catalog file.
pub fn load_catalog(path: &Path) -> Result<Catalog, ServiceManagerError> {
    let contents = std::fs::read_to_string(path)?;
    let catalog: Catalog = serde_yaml::from_str(&contents)?;
    Ok(catalog)
}

impl Catalog {
    /// The path of the repository service, when declared.
    pub fn repository_path(&self) -> Result<Option<ServicePath>, ServiceManagerError> {
        self.repository
            .as_deref()
            .map(|raw| {
                ServicePath::parse(raw)
                    .ok_or_else(|| ServiceManagerError::InvalidCatalogPath(raw.into()))
            })
            .transpose()
    }

    /// Converts the catalog into the in-memory repository.
    pub fn into_repository(self) -> Result<InMemoryRepository, ServiceManagerError> {
        let mut repo = InMemoryRepository::new();
        for (name, entry) in self.services {
            let mut depgroups = Vec::with_capacity(entry.dependencies.len());
            for (n, group) in entry.dependencies.into_iter().enumerate() {
                let mut targets = Vec::with_capacity(group.targets.len());
                for raw in &group.targets {
                    let target = ServicePath::parse(raw).ok_or_else(|| {
                        ServiceManagerError::InvalidCatalogPath(raw.clone())
                    })?;
                    targets.push(target);
                }
                depgroups.push(DepGroup {
                    name: group.name.unwrap_or_else(|| format!("depgroup-{n}")),
                    kind: group.kind,
                    restart_on: group.restart_on,
                    targets,
                });
            }

            let instances = entry
                .instances
                .unwrap_or_else(|| vec![DEFAULT_INSTANCE.to_string()]);

            repo.insert(ServiceRecord {
                path: ServicePath::service(name),
                kind: entry.kind,
                methods: entry.methods,
                instances,
                depgroups,
            });
        }
        Ok(repo)
    }
}
