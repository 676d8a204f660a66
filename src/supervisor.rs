//! The supervisor: one context object owning all mutable state, driven by a
//! single-threaded event loop.
//!
//! External events (process exits, timer firings, readiness datagrams,
//! control commands) enter here and are dispatched to the restarter core or
//! the graph engine; the note bus is drained to empty after every one of
//! them. The only suspension point is the kernel poll.

use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd;
use tracing::{debug, error, info, warn};

use crate::config::Catalog;
use crate::constants::{REPO_RETRY_CAP, REPO_RETRY_INITIAL};
use crate::error::ServiceManagerError;
use crate::graph::Graph;
use crate::ipc::{self, ControlCommand, ControlResponse, WireNote};
use crate::note::{Note, NoteBus, StateSub};
use crate::notify::{NotifyItem, NotifyMessage, NotifyReceiver};
use crate::path::ServicePath;
use crate::repository::{InMemoryRepository, Repository};
use crate::restarter::{Restarter, RestarterCtx, TimerPayload};
use crate::spawn::{Forker, MethodForker};
use crate::status::{StatusSnapshot, UnitStatus, VertexStatus};
use crate::timer::{Clock, MonotonicClock, TimerId, TimerSet};
use crate::tracker::{ProcEvent, ProcessTracker, WaitTracker};
use crate::unit::UnitState;

static SIGCHLD_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_: libc::c_int) {
    let fd = SIGCHLD_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        // Async-signal-safe: a bare write to wake the poll loop.
        unsafe {
            libc::write(fd, [0u8; 1].as_ptr().cast(), 1);
        }
    }
}

/// The supervisor context: graph, restarter, timers, note bus, and the
/// process-facing collaborators, all owned by one value.
pub struct Supervisor {
    repo: InMemoryRepository,
    graph: Graph,
    restarter: Restarter,
    bus: NoteBus,
    timers: TimerSet<TimerPayload>,
    forker: Box<dyn Forker>,
    tracker: Box<dyn ProcessTracker>,
    repo_path: Option<ServicePath>,
    repo_up: bool,
    repo_retry_delay: Duration,
    repo_retry_timer: Option<TimerId>,
    shutdown: bool,
}

impl Supervisor {
    /// Builds a supervisor from explicit parts. Tests construct their own
    /// with fake forkers, scripted trackers, and a manual clock.
    pub fn with_parts(
        repo: InMemoryRepository,
        forker: Box<dyn Forker>,
        tracker: Box<dyn ProcessTracker>,
        clock: Box<dyn Clock>,
        repo_path: Option<ServicePath>,
    ) -> Self {
        Self {
            repo,
            graph: Graph::new(),
            restarter: Restarter::new(),
            bus: NoteBus::new(),
            timers: TimerSet::new(clock),
            forker,
            tracker,
            repo_path,
            repo_up: true,
            repo_retry_delay: REPO_RETRY_INITIAL,
            repo_retry_timer: None,
            shutdown: false,
        }
    }

    /// Builds the production supervisor from a loaded catalog.
    pub fn from_catalog(catalog: Catalog) -> Result<Self, ServiceManagerError> {
        let repo_path = catalog.repository_path()?;
        let notify_path = ipc::notify_socket_path()?;
        let repo = catalog.into_repository()?;
        Ok(Self::with_parts(
            repo,
            Box::new(MethodForker::new(notify_path)),
            Box::new(WaitTracker::new()),
            Box::new(MonotonicClock::new()),
            repo_path,
        ))
    }

    /// Installs the catalog into the graph. Idempotent.
    pub fn bootstrap(&mut self) {
        self.graph.install_from_repository(&self.repo);
        if let Some(repo_path) = &self.repo_path
            && self.repo.lookup(repo_path).is_none()
        {
            warn!("{repo_path}: repository service not in catalog");
        }
    }

    /// Read access to the graph engine.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Read access to the restarter core.
    pub fn restarter(&self) -> &Restarter {
        &self.restarter
    }

    /// Whether the repository is believed reachable.
    pub fn repo_is_up(&self) -> bool {
        self.repo_up
    }

    /// Milliseconds until the next timer, for the poll timeout.
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.timers.until_next()
    }

    // ------------------------------------------------------------------
    // External event entry points
    // ------------------------------------------------------------------

    /// Submits a note as an external event and drains the bus.
    pub fn submit(&mut self, note: Note) {
        self.bus.push(note);
        self.drain_notes();
    }

    /// Feeds one process tracker event through the restarter.
    pub fn inject_proc_event(&mut self, event: ProcEvent) {
        self.dispatch_proc_event(event);
        self.drain_notes();
    }

    /// Routes a parsed notification datagram to the owning unit.
    pub fn handle_notify(&mut self, msg: NotifyMessage) {
        let Some(pid) = msg.pid else {
            warn!("notification without credentials; discarding");
            return;
        };
        for item in msg.items {
            match item {
                NotifyItem::Ready => {
                    let Self {
                        restarter,
                        timers,
                        bus,
                        forker,
                        tracker,
                        repo,
                        ..
                    } = self;
                    restarter.unit_notify_ready(
                        pid,
                        &mut RestarterCtx {
                            timers,
                            bus,
                            forker: forker.as_mut(),
                            tracker: tracker.as_mut(),
                            repo: &*repo,
                        },
                    );
                }
                NotifyItem::Status(text) => self.restarter.unit_notify_status(pid, &text),
                NotifyItem::MainPid(new_main) => {
                    self.restarter.unit_set_main_pid(pid, new_main)
                }
            }
        }
        self.drain_notes();
    }

    /// Fires every due timer, draining the bus after each.
    pub fn advance_timers(&mut self) {
        loop {
            let expired = self.timers.expired();
            if expired.is_empty() {
                break;
            }
            for (id, payload) in expired {
                match payload {
                    TimerPayload::RepoRetry => self.repo_retry(id),
                    other => {
                        let Self {
                            restarter,
                            timers,
                            bus,
                            forker,
                            tracker,
                            repo,
                            ..
                        } = self;
                        restarter.on_timer(
                            other,
                            &mut RestarterCtx {
                                timers,
                                bus,
                                forker: forker.as_mut(),
                                tracker: tracker.as_mut(),
                                repo: &*repo,
                            },
                        );
                    }
                }
                self.drain_notes();
            }
        }
    }

    /// Handles one control command, returning the response to send back.
    pub fn handle_command(&mut self, command: ControlCommand) -> ControlResponse {
        match command {
            ControlCommand::Note(wire) => match Note::try_from(wire) {
                Ok(note) => {
                    debug!("control note: {note:?}");
                    self.submit(note);
                    ControlResponse::Ok
                }
                Err(err) => ControlResponse::Error(err.to_string()),
            },
            ControlCommand::Status => {
                ControlResponse::Status(Box::new(self.snapshot()))
            }
            ControlCommand::Shutdown => {
                self.begin_shutdown();
                ControlResponse::Message("unitd supervisor shutting down".into())
            }
        }
    }

    /// Builds a status snapshot of every unit and vertex.
    pub fn snapshot(&self) -> StatusSnapshot {
        let units = self
            .restarter
            .units()
            .map(|unit| UnitStatus {
                path: unit.path.to_string(),
                kind: unit.kind,
                state: unit.state,
                main_pid: unit.main_pid,
                pids: unit.pids.iter().copied().collect(),
                failures: unit.fail_counts.values().sum(),
                status_text: unit.status_text.clone(),
            })
            .collect();
        let vertices = self
            .graph
            .vertices()
            .map(|v| VertexStatus {
                path: v.path.to_string(),
                state: v.state,
                enabled: v.is_enabled,
                to_offline: v.to_offline,
                to_disable: v.to_disable,
            })
            .collect();
        StatusSnapshot {
            schema_version: "1".into(),
            units,
            vertices,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn dispatch_proc_event(&mut self, event: ProcEvent) {
        let Self {
            restarter,
            timers,
            bus,
            forker,
            tracker,
            repo,
            ..
        } = self;
        restarter.unit_ptevent(
            event,
            &mut RestarterCtx {
                timers,
                bus,
                forker: forker.as_mut(),
                tracker: tracker.as_mut(),
                repo: &*repo,
            },
        );
    }

    fn drain_notes(&mut self) {
        while let Some(note) = self.bus.pop() {
            self.track_repo_unit(&note);
            match note {
                Note::RestarterRequest { path, sub, reason } => {
                    let Self {
                        restarter,
                        timers,
                        bus,
                        forker,
                        tracker,
                        repo,
                        ..
                    } = self;
                    restarter.unit_msg(
                        &path,
                        sub,
                        reason,
                        &mut RestarterCtx {
                            timers,
                            bus,
                            forker: forker.as_mut(),
                            tracker: tracker.as_mut(),
                            repo: &*repo,
                        },
                    );
                }
                other => {
                    let Self {
                        graph, repo, bus, ..
                    } = self;
                    graph.process_note(&other, &*repo, bus);
                }
            }
        }
    }

    /// The unit standing in for the repository flips availability tracking
    /// so dependent subsystems can be reconnected.
    fn track_repo_unit(&mut self, note: &Note) {
        let Some(repo_path) = &self.repo_path else {
            return;
        };
        let Note::StateChange { path, sub, .. } = note else {
            return;
        };
        if path != repo_path {
            return;
        }
        match sub {
            StateSub::Online => {
                info!("{path}: repository online; resyncing catalog consumers");
                self.repo_up = true;
                self.repo_retry_delay = REPO_RETRY_INITIAL;
                if let Some(id) = self.repo_retry_timer.take() {
                    self.timers.del(id);
                }
            }
            StateSub::Offline | StateSub::Maintenance | StateSub::Disabled => {
                warn!("{path}: repository unavailable");
                self.repo_up = false;
                self.arm_repo_retry();
            }
        }
    }

    fn arm_repo_retry(&mut self) {
        if self.repo_retry_timer.is_some() {
            return;
        }
        let delay = self.repo_retry_delay;
        self.repo_retry_delay = (self.repo_retry_delay * 2).min(REPO_RETRY_CAP);
        self.repo_retry_timer = Some(self.timers.add(delay, TimerPayload::RepoRetry));
    }

    fn repo_retry(&mut self, fired: TimerId) {
        if self.repo_retry_timer == Some(fired) {
            self.repo_retry_timer = None;
        }
        if self.repo_up {
            return;
        }
        debug!("retrying repository sync");
        self.graph.install_from_repository(&self.repo);
        self.arm_repo_retry();
    }

    fn begin_shutdown(&mut self) {
        info!("shutdown requested; stopping all units");
        self.shutdown = true;
        let running: Vec<ServicePath> = self
            .restarter
            .units()
            .filter(|unit| {
                matches!(
                    unit.state,
                    UnitState::PreStart
                        | UnitState::Start
                        | UnitState::PostStart
                        | UnitState::Online
                )
            })
            .map(|unit| unit.path.clone())
            .collect();
        for path in running {
            self.bus.push(Note::RestarterRequest {
                path,
                sub: crate::note::RequestSub::Stop,
                reason: crate::note::Reason::Any,
            });
        }
        self.drain_notes();
    }

    fn shutdown_complete(&self) -> bool {
        self.shutdown
            && self.restarter.units().all(|unit| {
                matches!(
                    unit.state,
                    UnitState::Uninitialised
                        | UnitState::Offline
                        | UnitState::Maintenance
                        | UnitState::None
                )
            })
    }

    /// Drains the tracker and feeds each event through the restarter.
    fn pump_tracker(&mut self) {
        let events = self.tracker.drain();
        for event in events {
            self.dispatch_proc_event(event);
            self.drain_notes();
        }
    }

    // ------------------------------------------------------------------
    // The event loop
    // ------------------------------------------------------------------

    /// Runs the supervisor until a shutdown command completes. This is the
    /// only place the process blocks.
    pub fn run(&mut self) -> Result<(), ServiceManagerError> {
        ipc::cleanup_runtime()?;
        let socket_path = ipc::socket_path()?;
        let listener = UnixListener::bind(&socket_path).map_err(ServiceManagerError::Io)?;
        listener.set_nonblocking(true)?;
        ipc::write_supervisor_pid(std::process::id() as i32)?;

        let notify = NotifyReceiver::bind(&ipc::notify_socket_path()?)?;
        let sigchld_rx = install_sigchld_pipe()?;

        self.bootstrap();
        info!("unitd supervisor listening on {:?}", socket_path);

        let mut shutdown_deadline: Option<Instant> = None;
        loop {
            if self.shutdown {
                if shutdown_deadline.is_none() {
                    shutdown_deadline = Some(Instant::now() + Duration::from_secs(10));
                }
                if self.shutdown_complete() {
                    break;
                }
                if shutdown_deadline.is_some_and(|deadline| Instant::now() > deadline) {
                    error!("units still busy at shutdown deadline; exiting anyway");
                    break;
                }
            }

            let timeout_ms: u16 = self
                .poll_timeout()
                .map(|d| d.as_millis().min(u16::MAX as u128) as u16)
                .unwrap_or(u16::MAX);

            let mut fds = [
                PollFd::new(listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(notify.fd(), PollFlags::POLLIN),
                PollFd::new(sigchld_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }

            let control_ready = fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            let notify_ready = fds[1]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            let sigchld_ready = fds[2]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));

            if sigchld_ready {
                drain_pipe(&sigchld_rx);
            }
            // Reap on every wakeup; SIGCHLD coalesces.
            self.pump_tracker();

            if notify_ready {
                for msg in notify.drain() {
                    self.handle_notify(msg);
                }
            }

            if control_ready {
                self.accept_control(&listener);
            }

            self.advance_timers();
        }

        ipc::cleanup_runtime()?;
        Ok(())
    }

    fn accept_control(&mut self, listener: &UnixListener) {
        loop {
            match listener.accept() {
                Ok((mut stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(false) {
                        warn!("control stream setup failed: {err}");
                        continue;
                    }
                    match ipc::read_command(&mut stream) {
                        Ok(command) => {
                            debug!("supervisor received command: {command:?}");
                            let response = self.handle_command(command);
                            if let Err(err) = ipc::write_response(&mut stream, &response)
                            {
                                error!("failed to write control response: {err}");
                            }
                        }
                        Err(err) => {
                            warn!("invalid control command: {err}");
                            let _ = ipc::write_response(
                                &mut stream,
                                &ControlResponse::Error(err.to_string()),
                            );
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("control listener error: {err}");
                    break;
                }
            }
        }
    }
}

/// Converts an admin verb from the CLI into the wire note it rides in on.
pub fn admin_note(path: &ServicePath, sub: crate::note::AdminSub) -> WireNote {
    WireNote::from(&Note::AdminReq {
        path: path.clone(),
        sub,
        reason: crate::note::Reason::Restart,
    })
}

fn install_sigchld_pipe() -> Result<OwnedFd, ServiceManagerError> {
    let (rx, tx) = unistd::pipe()?;
    for fd in [rx.as_raw_fd(), tx.as_raw_fd()] {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
        }
    }
    SIGCHLD_PIPE_WR.store(tx.into_raw_fd(), Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGCHLD, &action)?;
    }
    Ok(rx)
}

fn drain_pipe(fd: &OwnedFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
        };
        if n <= 0 {
            break;
        }
    }
}
