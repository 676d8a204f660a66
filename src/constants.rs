//! Constants and configuration values for the unitd daemon.
//!
//! This module centralizes the magic numbers, strings, and timing values
//! used throughout the daemon to improve maintainability and clarity.

use std::time::Duration;

// ============================================================================
// Method Execution Timing
// ============================================================================

/// Default budget for a single method execution (prestart, start, poststart,
/// stop, poststop). A method that neither completes nor signals readiness
/// within this window is treated as failed.
pub const METHOD_TIMEOUT: Duration = Duration::from_millis(2000);

/// Cooldown observed after a method failure before a restart is attempted.
pub const RESTART_COOLDOWN: Duration = Duration::from_millis(5000);

/// Delay between the end of the restart cooldown and actual state re-entry.
pub const RESTART_ENTRY_DELAY: Duration = Duration::from_millis(500);

/// Number of consecutive failures a method may accumulate and still retry.
/// Exceeding this ceiling parks the unit in maintenance.
pub const MAX_METHOD_FAILURES: u32 = 5;

// ============================================================================
// Repository Availability
// ============================================================================

/// Initial delay before retrying a failed repository lookup.
pub const REPO_RETRY_INITIAL: Duration = Duration::from_millis(1000);

/// Ceiling for the repository retry backoff.
pub const REPO_RETRY_CAP: Duration = Duration::from_millis(30_000);

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the control socket created in the state directory.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";

/// Name of the readiness-notification datagram socket.
pub const NOTIFY_SOCKET_NAME: &str = "notify.sock";

/// Name of the supervisor PID file.
pub const SUPERVISOR_PID_FILE: &str = "unitd.pid";

/// Environment variable exported to every forked method so daemons can find
/// the readiness socket.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing service methods.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// Tracker Constants
// ============================================================================

/// Enumeration interval for the portable polling tracker backend.
pub const POLL_TRACKER_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Path Synthesis
// ============================================================================

/// Instance-name infix used when synthesizing dependency-group paths so that
/// groups share the namespace of real nodes.
pub const DEPGROUP_PATH_INFIX: &str = "#depgroups/";
