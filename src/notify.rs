//! Readiness notification receiver.
//!
//! Supervised children report through a datagram socket whose path they
//! receive in `NOTIFY_SOCKET`. Messages are newline-separated `KEY=VALUE`
//! lines; the sender is identified by its socket credentials so the owning
//! unit can be resolved from the PID.

use std::io::{self, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use nix::sys::socket::{ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, setsockopt, sockopt};
use tracing::{debug, warn};

/// One recognized directive inside a notification datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyItem {
    /// `READY=1`: the service finished starting up.
    Ready,
    /// `STATUS=<text>`: free-form status annotation.
    Status(String),
    /// `MAINPID=<n>`: the unit's main PID moved.
    MainPid(u32),
}

/// A parsed notification datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    /// Sender PID from socket credentials, when the kernel supplied them.
    pub pid: Option<u32>,
    /// Recognized directives, in line order.
    pub items: Vec<NotifyItem>,
}

/// Parses the newline-separated `KEY=VALUE` payload. Unknown keys and
/// malformed lines are skipped.
pub fn parse_payload(text: &str) -> Vec<NotifyItem> {
    let mut items = Vec::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            if !line.trim().is_empty() {
                debug!("malformed notify line: {line:?}");
            }
            continue;
        };
        match key {
            "READY" if value == "1" => items.push(NotifyItem::Ready),
            "STATUS" => items.push(NotifyItem::Status(value.to_string())),
            "MAINPID" => match value.parse::<u32>() {
                Ok(pid) => items.push(NotifyItem::MainPid(pid)),
                Err(_) => warn!("unparseable MAINPID value: {value:?}"),
            },
            _ => debug!("ignoring notify key {key:?}"),
        }
    }
    items
}

/// The bound notification socket.
pub struct NotifyReceiver {
    socket: UnixDatagram,
}

impl NotifyReceiver {
    /// Binds the datagram socket at `path`, replacing any stale socket, and
    /// enables credential passing so senders can be attributed.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        setsockopt(&socket, sockopt::PassCred, &true)?;
        Ok(Self { socket })
    }

    /// Borrowed fd for the event loop's poll set.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Receives every pending datagram, oldest first.
    pub fn drain(&self) -> Vec<NotifyMessage> {
        let mut messages = Vec::new();
        loop {
            let mut buf = [0u8; 4096];
            let received = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsg_space = nix::cmsg_space!(libc::ucred);
                match recvmsg::<UnixAddr>(
                    self.socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let pid = msg
                            .cmsgs()
                            .ok()
                            .and_then(|mut cmsgs| {
                                cmsgs.find_map(|cmsg| match cmsg {
                                    ControlMessageOwned::ScmCredentials(creds) => {
                                        Some(creds.pid() as u32)
                                    }
                                    _ => None,
                                })
                            });
                        Some((pid, msg.bytes))
                    }
                    Err(nix::errno::Errno::EAGAIN) => None,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(errno) => {
                        warn!("notify socket recv failed: {errno}");
                        None
                    }
                }
            };

            let Some((pid, len)) = received else {
                break;
            };
            let text = String::from_utf8_lossy(&buf[..len]);
            let items = parse_payload(&text);
            if !items.is_empty() {
                messages.push(NotifyMessage { pid, items });
            }
        }
        messages
    }
}
