//! Typed notes and the in-process note bus.
//!
//! The graph engine and the restarter core communicate exclusively through
//! [`Note`] values carried on a single FIFO [`NoteBus`]. The bus is drained
//! to empty after each external event; emission order is preserved and notes
//! are never coalesced.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::path::ServicePath;

/// Restart-on severity, totally ordered: `None < Error < Restart < Refresh <
/// Any`. Stop propagation through a dependency group is cut when the group's
/// subscription is strictly weaker than the triggering reason.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Never propagate.
    None = 0,
    /// Propagate on dependency failure.
    Error = 1,
    /// Propagate on dependency restart.
    Restart = 2,
    /// Propagate on dependency refresh.
    Refresh = 3,
    /// Propagate on everything.
    Any = 4,
}

impl Reason {
    /// Numeric severity as carried on the wire.
    pub fn severity(self) -> u8 {
        self as u8
    }

    /// Reconstructs a reason from its wire severity.
    pub fn from_severity(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Error),
            2 => Some(Self::Restart),
            3 => Some(Self::Refresh),
            4 => Some(Self::Any),
            _ => None,
        }
    }
}

/// Sub-type of a state-change note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StateSub {
    /// The node came up.
    Online,
    /// The node went down.
    Offline,
    /// The node was administratively disabled.
    Disabled,
    /// The node's restarter parked it for administrative attention.
    Maintenance,
}

/// Sub-type of an administrative request note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AdminSub {
    /// Enable the node and bring it up if satisfiable.
    Enable,
    /// Disable the node, stopping it and its dependents first.
    Disable,
    /// Stop and re-start the node.
    Restart,
}

/// Sub-type of a restarter request note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RequestSub {
    /// Begin the startup sequence.
    Start,
    /// Begin the shutdown sequence.
    Stop,
}

/// A typed message on the note bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    /// A node changed lifecycle state.
    StateChange {
        /// The node that changed.
        path: ServicePath,
        /// What it changed to.
        sub: StateSub,
        /// Why it changed.
        reason: Reason,
    },
    /// An administrative request against a node.
    AdminReq {
        /// The node addressed.
        path: ServicePath,
        /// The requested operation.
        sub: AdminSub,
        /// Severity attached to the request.
        reason: Reason,
    },
    /// A start/stop decision issued by the graph to the restarter.
    RestarterRequest {
        /// The unit addressed.
        path: ServicePath,
        /// The requested operation.
        sub: RequestSub,
        /// Severity that triggered the decision.
        reason: Reason,
    },
}

impl Note {
    /// The path the note addresses.
    pub fn path(&self) -> &ServicePath {
        match self {
            Note::StateChange { path, .. }
            | Note::AdminReq { path, .. }
            | Note::RestarterRequest { path, .. } => path,
        }
    }
}

/// Single in-process FIFO of notes. No priority, no coalescing.
#[derive(Debug, Default)]
pub struct NoteBus {
    queue: VecDeque<Note>,
}

impl NoteBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a note in emission order.
    pub fn push(&mut self, note: Note) {
        self.queue.push_back(note);
    }

    /// Removes and returns the oldest note.
    pub fn pop(&mut self) -> Option<Note> {
        self.queue.pop_front()
    }

    /// Number of queued notes.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the bus is drained.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
