//! Process lifecycle tracking.
//!
//! The restarter core consumes process birth/exit events through the
//! [`ProcessTracker`] contract; the concrete backend is a deployment choice.
//! Two backends ship here: [`WaitTracker`], which discovers forks of watched
//! PIDs through `/proc` and reaps exits via `waitpid` under a child
//! subreaper, and [`PollTracker`], a portable fallback that periodically
//! enumerates watched PIDs (no child-fork visibility). Tests use
//! [`ScriptedTracker`].

use std::collections::{HashSet, VecDeque};
use std::fs;

use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

/// Exit disposition of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitFlags {
    /// A zero-status exit. Non-zero exits and signal deaths are abnormal.
    pub normal: bool,
    /// Exit code, when the process exited.
    pub code: Option<i32>,
    /// Terminating signal number, when the process was signaled.
    pub signal: Option<i32>,
}

impl ExitFlags {
    /// Flags for a plain exit with the given status code.
    pub fn exited(code: i32) -> Self {
        Self {
            normal: code == 0,
            code: Some(code),
            signal: None,
        }
    }

    /// Flags for a signal death.
    pub fn signaled(signal: i32) -> Self {
        Self {
            normal: false,
            code: None,
            signal: Some(signal),
        }
    }
}

/// An event observed for a watched PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEvent {
    /// A watched PID forked a child; the child is auto-enrolled.
    Child {
        /// The forking parent.
        parent: u32,
        /// The new child.
        pid: u32,
    },
    /// A watched PID exited.
    Exit {
        /// The exited PID.
        pid: u32,
        /// How it went.
        flags: ExitFlags,
    },
}

/// Platform-neutral subscription to process lifecycle events.
///
/// Contract: events are delivered in FIFO order per PID, and a `Child` event
/// for an auto-enrolled fork surfaces before any `Exit` involving it.
pub trait ProcessTracker {
    /// Begins watching a PID.
    fn watch(&mut self, pid: u32);

    /// Stops watching a PID. Events already observed still drain.
    fn disregard(&mut self, pid: u32);

    /// Returns all events observed since the last drain, oldest first.
    fn drain(&mut self) -> Vec<ProcEvent>;
}

/// Linux tracker for method processes and their forks.
///
/// Forks of watched PIDs are discovered by scanning
/// `/proc/<pid>/task/*/children` at the start of every drain, before exits
/// are reaped, so a `Child` event always orders ahead of the `Exit` events
/// that involve it. The supervisor is marked a child subreaper, so
/// descendants orphaned by a daemonizing parent reparent here and stay
/// reapable and signalable.
///
/// A parent that forks and exits entirely between two drains beats the
/// scan; daemons cover that window by reporting `MAINPID=` over the notify
/// socket while the forking parent is still tracked.
#[derive(Debug, Default)]
pub struct WaitTracker {
    watched: HashSet<u32>,
}

impl WaitTracker {
    /// Creates an empty tracker and claims subreaper status for the
    /// calling process.
    pub fn new() -> Self {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
        }
        Self::default()
    }

    /// Scans `/proc` for new children of watched PIDs, auto-enrolling each.
    fn discover_forks(&mut self, events: &mut Vec<ProcEvent>) {
        let parents: Vec<u32> = self.watched.iter().copied().collect();
        for parent in parents {
            let Ok(tasks) = fs::read_dir(format!("/proc/{parent}/task")) else {
                continue;
            };
            for task in tasks.flatten() {
                let Ok(listed) = fs::read_to_string(task.path().join("children"))
                else {
                    continue;
                };
                for token in listed.split_whitespace() {
                    let Ok(pid) = token.parse::<u32>() else {
                        continue;
                    };
                    if self.watched.insert(pid) {
                        debug!("pid {parent} forked {pid}");
                        events.push(ProcEvent::Child { parent, pid });
                    }
                }
            }
        }
    }
}

impl ProcessTracker for WaitTracker {
    fn watch(&mut self, pid: u32) {
        self.watched.insert(pid);
    }

    fn disregard(&mut self, pid: u32) {
        self.watched.remove(&pid);
    }

    fn drain(&mut self) -> Vec<ProcEvent> {
        let mut events = Vec::new();
        self.discover_forks(&mut events);
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    let pid = pid.as_raw() as u32;
                    if self.watched.contains(&pid) {
                        events.push(ProcEvent::Exit {
                            pid,
                            flags: ExitFlags::exited(code),
                        });
                    } else {
                        debug!("reaped unwatched pid {pid} (exit {code})");
                    }
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    let pid = pid.as_raw() as u32;
                    if self.watched.contains(&pid) {
                        events.push(ProcEvent::Exit {
                            pid,
                            flags: ExitFlags::signaled(signal as i32),
                        });
                    } else {
                        debug!("reaped unwatched pid {pid} (signal {signal})");
                    }
                }
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// Portable polling fallback: periodic enumeration of watched PIDs. Forks by
/// watched processes are not visible, and exit codes cannot be recovered, so
/// a disappearance is reported as an abnormal signal-less exit.
pub struct PollTracker {
    system: System,
    watched: HashSet<u32>,
}

impl PollTracker {
    /// Creates an empty poll tracker.
    pub fn new() -> Self {
        Self {
            system: System::new(),
            watched: HashSet::new(),
        }
    }
}

impl Default for PollTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTracker for PollTracker {
    fn watch(&mut self, pid: u32) {
        self.watched.insert(pid);
    }

    fn disregard(&mut self, pid: u32) {
        self.watched.remove(&pid);
    }

    fn drain(&mut self) -> Vec<ProcEvent> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let mut events = Vec::new();
        let gone: Vec<u32> = self
            .watched
            .iter()
            .copied()
            .filter(|pid| {
                self.system
                    .process(sysinfo::Pid::from_u32(*pid))
                    .is_none()
            })
            .collect();
        for pid in gone {
            self.watched.remove(&pid);
            events.push(ProcEvent::Exit {
                pid,
                flags: ExitFlags {
                    normal: false,
                    code: None,
                    signal: None,
                },
            });
        }
        events
    }
}

/// Tracker fed by the test itself.
#[derive(Debug, Default)]
pub struct ScriptedTracker {
    watched: HashSet<u32>,
    queue: VecDeque<ProcEvent>,
}

impl ScriptedTracker {
    /// Creates an empty scripted tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an event for the next drain.
    pub fn script(&mut self, event: ProcEvent) {
        self.queue.push_back(event);
    }

    /// Whether a PID is currently watched.
    pub fn is_watched(&self, pid: u32) -> bool {
        self.watched.contains(&pid)
    }

    /// Number of currently watched PIDs.
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

impl ProcessTracker for ScriptedTracker {
    fn watch(&mut self, pid: u32) {
        self.watched.insert(pid);
    }

    fn disregard(&mut self, pid: u32) {
        self.watched.remove(&pid);
    }

    fn drain(&mut self) -> Vec<ProcEvent> {
        self.queue.drain(..).collect()
    }
}
