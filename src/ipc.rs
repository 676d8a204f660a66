//! Control channel between CLI invocations and the resident supervisor.
//!
//! Commands and responses are line-delimited JSON over a unix stream
//! socket. The note envelope is the inter-daemon wire format and must stay
//! bit-exact: `{"kind": "...", "sub": "...", "path": {"svc": ..., "inst":
//! ...}, "reason": <int>}`.

use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

use crate::constants::{CONTROL_SOCKET_NAME, NOTIFY_SOCKET_NAME, SUPERVISOR_PID_FILE};
use crate::error::ControlError;
use crate::note::{AdminSub, Note, Reason, RequestSub, StateSub};
use crate::path::ServicePath;
use crate::runtime;
use crate::status::StatusSnapshot;

/// Directory where runtime artifacts (PID/socket files) are stored.
fn runtime_dir() -> Result<PathBuf, ControlError> {
    let path = runtime::state_dir();
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Returns the unix socket path used to communicate with the resident
/// supervisor.
pub fn socket_path() -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(CONTROL_SOCKET_NAME))
}

/// Returns the datagram socket path children use for readiness reports.
pub fn notify_socket_path() -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(NOTIFY_SOCKET_NAME))
}

/// Returns the path where the supervisor PID is recorded.
pub fn supervisor_pid_path() -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(SUPERVISOR_PID_FILE))
}

/// Records the supervisor PID for later liveness checks.
pub fn write_supervisor_pid(pid: i32) -> Result<(), ControlError> {
    fs::write(supervisor_pid_path()?, pid.to_string())?;
    Ok(())
}

/// Reads the recorded supervisor PID, if any.
pub fn read_supervisor_pid() -> Result<Option<i32>, ControlError> {
    let path = supervisor_pid_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(contents.trim().parse().ok())
}

/// Removes sockets and the PID file left behind by a previous run.
pub fn cleanup_runtime() -> Result<(), ControlError> {
    for path in [socket_path()?, notify_socket_path()?, supervisor_pid_path()?] {
        if path.exists() {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// The note envelope exchanged between daemons. Field order is part of the
/// format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNote {
    /// `state_change`, `admin_req`, or `restarter_req`.
    pub kind: String,
    /// Kind-specific sub-type.
    pub sub: String,
    /// Addressed path.
    pub path: WirePath,
    /// Numeric restart-on severity.
    pub reason: u8,
}

/// Wire form of a service path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePath {
    /// Service name.
    pub svc: String,
    /// Instance name or null.
    pub inst: Option<String>,
}

impl From<&ServicePath> for WirePath {
    fn from(path: &ServicePath) -> Self {
        Self {
            svc: path.svc.clone(),
            inst: path.inst.clone(),
        }
    }
}

impl From<WirePath> for ServicePath {
    fn from(path: WirePath) -> Self {
        Self {
            svc: path.svc,
            inst: path.inst,
        }
    }
}

impl From<&Note> for WireNote {
    fn from(note: &Note) -> Self {
        match note {
            Note::StateChange { path, sub, reason } => Self {
                kind: "state_change".into(),
                sub: sub.to_string(),
                path: path.into(),
                reason: reason.severity(),
            },
            Note::AdminReq { path, sub, reason } => Self {
                kind: "admin_req".into(),
                sub: sub.to_string(),
                path: path.into(),
                reason: reason.severity(),
            },
            Note::RestarterRequest { path, sub, reason } => Self {
                kind: "restarter_req".into(),
                sub: sub.to_string(),
                path: path.into(),
                reason: reason.severity(),
            },
        }
    }
}

impl TryFrom<WireNote> for Note {
    type Error = ControlError;

    fn try_from(wire: WireNote) -> Result<Self, Self::Error> {
        let reason = Reason::from_severity(wire.reason)
            .ok_or_else(|| ControlError::BadEnvelope(format!("reason {}", wire.reason)))?;
        let path: ServicePath = wire.path.into();
        match wire.kind.as_str() {
            "state_change" => {
                let sub: StateSub = wire
                    .sub
                    .parse()
                    .map_err(|_| ControlError::BadEnvelope(format!("sub {:?}", wire.sub)))?;
                Ok(Note::StateChange { path, sub, reason })
            }
            "admin_req" => {
                let sub: AdminSub = wire
                    .sub
                    .parse()
                    .map_err(|_| ControlError::BadEnvelope(format!("sub {:?}", wire.sub)))?;
                Ok(Note::AdminReq { path, sub, reason })
            }
            "restarter_req" => {
                let sub: RequestSub = wire
                    .sub
                    .parse()
                    .map_err(|_| ControlError::BadEnvelope(format!("sub {:?}", wire.sub)))?;
                Ok(Note::RestarterRequest { path, sub, reason })
            }
            other => Err(ControlError::BadEnvelope(format!("kind {other:?}"))),
        }
    }
}

/// Message sent from CLI invocations to the resident supervisor.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Submit a note to the supervisor's bus.
    Note(WireNote),
    /// Fetch a status snapshot.
    Status,
    /// Shut the supervisor down.
    Shutdown,
}

/// Response sent by the supervisor.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command completed successfully.
    Ok,
    /// Command completed with a status message.
    Message(String),
    /// Command failed with an error message.
    Error(String),
    /// Current status snapshot payload.
    Status(Box<StatusSnapshot>),
}

/// Sends a command to the supervisor and waits for a response.
pub fn send_command(command: &ControlCommand) -> Result<ControlResponse, ControlError> {
    let path = socket_path()?;
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    let payload = serde_json::to_vec(command)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Reads a command from a stream. Used by the supervisor event loop.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to a stream.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
