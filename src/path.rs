//! Service path identifiers.
//!
//! A [`ServicePath`] names either a whole service or one of its instances.
//! Dependency-group vertices are embedded into the same namespace by
//! synthesizing an instance name of the form `<base>#depgroups/<n>`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::DEPGROUP_PATH_INFIX;

/// A two-part `(service, instance?)` identifier, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePath {
    /// Service name.
    pub svc: String,
    /// Instance name, when the path addresses a single instance.
    pub inst: Option<String>,
}

impl ServicePath {
    /// Path addressing a whole service.
    pub fn service(svc: impl Into<String>) -> Self {
        Self {
            svc: svc.into(),
            inst: None,
        }
    }

    /// Path addressing one instance of a service.
    pub fn instance(svc: impl Into<String>, inst: impl Into<String>) -> Self {
        Self {
            svc: svc.into(),
            inst: Some(inst.into()),
        }
    }

    /// Parses `svc` or `svc:inst` as used in catalog files and on the CLI.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        match trimmed.split_once(':') {
            Some((svc, inst)) if !svc.is_empty() && !inst.is_empty() => {
                Some(Self::instance(svc, inst))
            }
            Some(_) => None,
            None => Some(Self::service(trimmed)),
        }
    }

    /// Synthesizes the path of the `n`-th dependency group owned by this
    /// vertex. The owner's instance name (or service name for a service
    /// path) becomes the base so the group lands in the owner's namespace.
    pub fn depgroup(&self, n: usize) -> Self {
        let base = self.inst.as_deref().unwrap_or(&self.svc);
        Self {
            svc: self.svc.clone(),
            inst: Some(format!("{base}{DEPGROUP_PATH_INFIX}{n}")),
        }
    }

    /// Whether this path was synthesized for a dependency group.
    pub fn is_depgroup(&self) -> bool {
        self.inst
            .as_deref()
            .is_some_and(|inst| inst.contains(DEPGROUP_PATH_INFIX))
    }

    /// The service-level path for this path.
    pub fn service_path(&self) -> Self {
        Self::service(self.svc.clone())
    }
}

impl fmt::Display for ServicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inst {
            Some(inst) => write!(f, "{}:{}", self.svc, inst),
            None => write!(f, "{}", self.svc),
        }
    }
}
