//! Modular service manager for UNIX hosts.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
#[cfg(test)]
use predicates as _;
use strum as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Catalog loading.
pub mod config;

/// Constants.
pub mod constants;

/// Errors.
pub mod error;

/// Dependency graph engine.
pub mod graph;

/// Control channel and wire envelope.
pub mod ipc;

/// Notes and the note bus.
pub mod note;

/// Readiness notification receiver.
pub mod notify;

/// Service path identifiers.
pub mod path;

/// Service repository.
pub mod repository;

/// Restarter core.
pub mod restarter;

/// Runtime paths and modes.
pub mod runtime;

/// Method forking.
pub mod spawn;

/// Status snapshots.
pub mod status;

/// Supervisor context and event loop.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;

/// Timer set.
pub mod timer;

/// Process tracking.
pub mod tracker;

/// Unit model.
pub mod unit;
