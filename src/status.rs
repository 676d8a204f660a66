//! Status snapshot types served over the control socket.

use serde::{Deserialize, Serialize};

use crate::graph::VertexState;
use crate::unit::{UnitKind, UnitState};

/// A point-in-time view of the whole supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Snapshot format version.
    pub schema_version: String,
    /// Every unit the restarter owns.
    pub units: Vec<UnitStatus>,
    /// Every vertex the graph owns.
    pub vertices: Vec<VertexStatus>,
}

impl StatusSnapshot {
    /// An empty snapshot.
    pub fn empty() -> Self {
        Self {
            schema_version: "1".into(),
            units: Vec::new(),
            vertices: Vec::new(),
        }
    }
}

/// Restarter-side view of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Instance path.
    pub path: String,
    /// Supervision style.
    pub kind: UnitKind,
    /// Current state.
    pub state: UnitState,
    /// Main PID, once known.
    pub main_pid: Option<u32>,
    /// All tracked PIDs.
    pub pids: Vec<u32>,
    /// Total consecutive failures currently on the books.
    pub failures: u32,
    /// Last STATUS= annotation, if any.
    pub status_text: Option<String>,
}

/// Graph-side view of one vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexStatus {
    /// Vertex path.
    pub path: String,
    /// Lifecycle state.
    pub state: VertexState,
    /// Administratively enabled.
    pub enabled: bool,
    /// Awaiting shutdown.
    pub to_offline: bool,
    /// Awaiting disablement.
    pub to_disable: bool,
}
