//! Method forking with the pending-process handshake.
//!
//! Every fork pairs with a handshake: the child blocks on a pipe until the
//! parent has enrolled the PID with the tracker and the unit's PID set, then
//! the parent releases it. This closes the race where a short-lived child
//! exits before anyone is watching it.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::sys::signal::{self, Signal};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, warn};

use crate::constants::{DEFAULT_SHELL, NOTIFY_SOCKET_ENV, SHELL_COMMAND_FLAG};
use crate::error::SpawnError;
use crate::path::ServicePath;
use crate::unit::MethodKind;

/// Seam between the restarter core and process creation. The `enroll`
/// callback runs between `fork()` and the child's release so the caller can
/// record the PID while the child is still held.
pub trait Forker {
    /// Forks a method command, returning the child PID after release.
    fn fork_method(
        &mut self,
        path: &ServicePath,
        method: MethodKind,
        command: &str,
        enroll: &mut dyn FnMut(u32),
    ) -> Result<u32, SpawnError>;

    /// Delivers a signal to a PID. Vanished processes are not an error.
    fn kill(&mut self, pid: u32, signal: Signal);
}

/// The real forker: `fork`, hold the child on a pipe, release after
/// enrollment, then `exec` the command through the shell.
pub struct MethodForker {
    notify_socket: PathBuf,
}

impl MethodForker {
    /// Creates a forker whose children receive `NOTIFY_SOCKET` pointing at
    /// the given datagram path.
    pub fn new(notify_socket: PathBuf) -> Self {
        Self { notify_socket }
    }

    fn exec_held_child(&self, release_rx: OwnedFd, command: &str) -> ! {
        // Block until the parent has enrolled our PID.
        let mut byte = [0u8; 1];
        loop {
            let n = unsafe {
                libc::read(release_rx.as_raw_fd(), byte.as_mut_ptr().cast(), 1)
            };
            if n >= 0 || std::io::Error::last_os_error().raw_os_error()
                != Some(libc::EINTR)
            {
                break;
            }
        }
        drop(release_rx);

        let _ = unistd::setsid();
        unsafe {
            std::env::set_var(NOTIFY_SOCKET_ENV, &self.notify_socket);
        }

        let argv: Vec<CString> = [DEFAULT_SHELL, SHELL_COMMAND_FLAG, command]
            .iter()
            .filter_map(|arg| CString::new(*arg).ok())
            .collect();
        if argv.len() == 3 {
            let _ = unistd::execv(&argv[0], &argv);
        }
        // Exec failed; nothing sensible left to do in the child.
        unsafe { libc::_exit(127) }
    }
}

impl Forker for MethodForker {
    fn fork_method(
        &mut self,
        path: &ServicePath,
        method: MethodKind,
        command: &str,
        enroll: &mut dyn FnMut(u32),
    ) -> Result<u32, SpawnError> {
        let (release_rx, release_tx) =
            unistd::pipe().map_err(SpawnError::PipeFailed)?;

        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(release_tx);
                self.exec_held_child(release_rx, command);
            }
            Ok(ForkResult::Parent { child }) => {
                drop(release_rx);
                let pid = child.as_raw() as u32;
                debug!("{path}: forked {method} method as pid {pid}");
                enroll(pid);

                let released = unsafe {
                    libc::write(release_tx.as_raw_fd(), [1u8].as_ptr().cast(), 1)
                };
                drop(release_tx);
                if released != 1 {
                    let errno = nix::errno::Errno::last();
                    // An unreleased child must not run the method.
                    let _ = signal::kill(child, Signal::SIGKILL);
                    return Err(SpawnError::ReleaseFailed { pid, errno });
                }
                Ok(pid)
            }
            Err(errno) => Err(SpawnError::ForkFailed(errno)),
        }
    }

    fn kill(&mut self, pid: u32, signal: Signal) {
        match signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(errno) => warn!("failed to send {signal} to pid {pid}: {errno}"),
        }
    }
}

/// Recording forker for tests: hands out synthetic PIDs, still performs the
/// enrollment handshake, and captures every signal sent.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct FakeForker {
    next_pid: u32,
    /// Every fork performed, in order.
    pub forked: Vec<(ServicePath, MethodKind, String)>,
    /// Every signal delivered, in order.
    pub kills: Vec<(u32, Signal)>,
    /// When set, the next fork fails with this error.
    pub fail_next: bool,
}

impl FakeForker {
    /// Creates a fake forker starting at PID 1000.
    pub fn new() -> Self {
        Self {
            next_pid: 1000,
            forked: Vec::new(),
            kills: Vec::new(),
            fail_next: false,
        }
    }

    /// PID that the next fork will return.
    pub fn peek_pid(&self) -> u32 {
        self.next_pid
    }
}

impl Forker for FakeForker {
    fn fork_method(
        &mut self,
        path: &ServicePath,
        method: MethodKind,
        command: &str,
        enroll: &mut dyn FnMut(u32),
    ) -> Result<u32, SpawnError> {
        if self.fail_next {
            self.fail_next = false;
            return Err(SpawnError::ForkFailed(nix::errno::Errno::EAGAIN));
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.forked
            .push((path.clone(), method, command.to_string()));
        enroll(pid);
        Ok(pid)
    }

    fn kill(&mut self, pid: u32, signal: Signal) {
        self.kills.push((pid, signal));
    }
}

/// Clonable handle over a [`FakeForker`] so tests keep inspection access
/// after handing the forker to a supervisor.
#[doc(hidden)]
#[derive(Clone, Default)]
pub struct SharedForker(pub std::rc::Rc<std::cell::RefCell<FakeForker>>);

impl SharedForker {
    /// Creates a shared fake forker.
    pub fn new() -> Self {
        Self(std::rc::Rc::new(std::cell::RefCell::new(FakeForker::new())))
    }
}

impl Forker for SharedForker {
    fn fork_method(
        &mut self,
        path: &ServicePath,
        method: MethodKind,
        command: &str,
        enroll: &mut dyn FnMut(u32),
    ) -> Result<u32, SpawnError> {
        self.0.borrow_mut().fork_method(path, method, command, enroll)
    }

    fn kill(&mut self, pid: u32, signal: Signal) {
        self.0.borrow_mut().kill(pid, signal);
    }
}
