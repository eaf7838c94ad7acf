//! Signal intake for the control loop
//!
//! Every delivery of a handled signal writes one small control message into a
//! socket pair straight from the signal handler. The read end is a plain
//! descriptor the control loop can multiplex with its listeners, so nothing
//! but the control task ever acts on a signal. Deliveries are never merged:
//! two SIGTERMs in quick succession arrive as two messages.
//!
//! SIGTERM and SIGINT request termination, SIGUSR1 requests a hot restart.

use nix::libc::{c_int, siginfo_t};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};
use signal_hook::low_level;
use signal_hook::SigId;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tracing::debug;

const MESSAGE_LEN: usize = 5;
const TERMINATE: u8 = b'T';
const RESTART: u8 = b'R';

/// A request delivered to the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stop accepting and drain. `sender` is the pid of the signalling
    /// process when the kernel reported one.
    Terminate { sender: Option<i32> },
    /// Spawn a successor and hand it the listening socket
    Restart,
}

impl ControlMessage {
    fn encode(self) -> [u8; MESSAGE_LEN] {
        let (kind, pid) = match self {
            Self::Terminate { sender } => (TERMINATE, sender.unwrap_or(0)),
            Self::Restart => (RESTART, 0),
        };
        let mut buf = [0u8; MESSAGE_LEN];
        buf[0] = kind;
        buf[1..].copy_from_slice(&pid.to_le_bytes());
        buf
    }

    fn decode(buf: [u8; MESSAGE_LEN]) -> Option<Self> {
        let pid = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        match buf[0] {
            TERMINATE => Some(Self::Terminate {
                sender: (pid > 0).then_some(pid),
            }),
            RESTART => Some(Self::Restart),
            _ => None,
        }
    }
}

/// Write end, cloneable so tests and the signal handlers can share it
#[derive(Debug)]
pub struct SignalSender {
    writer: UnixStream,
}

impl SignalSender {
    pub fn send(&self, message: ControlMessage) -> io::Result<()> {
        (&self.writer).write_all(&message.encode())
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            writer: self.writer.try_clone()?,
        })
    }
}

/// Read end, pollable by the control loop
#[derive(Debug)]
pub struct SignalChannel {
    reader: UnixStream,
}

impl SignalChannel {
    /// Read one message. Only call after the descriptor polled readable.
    /// Returns None when every sender is gone.
    pub fn recv(&mut self) -> io::Result<Option<ControlMessage>> {
        let mut buf = [0u8; MESSAGE_LEN];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        match ControlMessage::decode(buf) {
            Some(message) => Ok(Some(message)),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown control message kind {:#04x}", buf[0]),
            )),
        }
    }
}

impl AsFd for SignalChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// Create a connected sender/channel pair
pub fn channel() -> io::Result<(SignalSender, SignalChannel)> {
    let (writer, reader) = UnixStream::pair()?;
    Ok((SignalSender { writer }, SignalChannel { reader }))
}

/// Installed signal handlers, removed again by [`Registration::close`]
#[derive(Debug)]
pub struct Registration {
    ids: Vec<SigId>,
}

impl Registration {
    /// Unregister the handlers. Later deliveries are no longer forwarded.
    pub fn close(self) {
        for id in self.ids {
            low_level::unregister(id);
        }
    }
}

/// Install handlers for SIGTERM, SIGINT and SIGUSR1 that forward every
/// delivery to `sender`
///
/// The write end is switched to non-blocking so a handler never stalls the
/// interrupted thread. A message that does not fit in the socket buffer is
/// dropped.
pub fn listen(sender: SignalSender) -> io::Result<Registration> {
    sender.writer.set_nonblocking(true)?;
    let sender = Arc::new(sender);
    let mut ids = Vec::with_capacity(3);

    for signal in [SIGTERM, SIGINT, SIGUSR1] {
        let sender = Arc::clone(&sender);
        // SAFETY: the action only fills a stack buffer and issues a single
        // write(2) on a non-blocking socket, both async-signal-safe.
        let registered = unsafe {
            signal_hook_registry::register_sigaction(signal, move |info: &siginfo_t| {
                let _ = sender.send(message_for(signal, info));
            })
        };
        match registered {
            Ok(id) => ids.push(id),
            Err(e) => {
                Registration { ids }.close();
                return Err(e);
            }
        }
    }

    debug!(signals = ?[SIGTERM, SIGINT, SIGUSR1], "Signal handlers installed");
    Ok(Registration { ids })
}

fn message_for(signal: c_int, info: &siginfo_t) -> ControlMessage {
    match signal {
        SIGUSR1 => ControlMessage::Restart,
        _ => ControlMessage::Terminate {
            sender: sender_pid(info),
        },
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn sender_pid(info: &siginfo_t) -> Option<i32> {
    // SAFETY: reading the pid member of the union is defined for every
    // signal; kernel-originated signals leave it zero.
    let pid = unsafe { info.si_pid() };
    (pid > 0).then_some(pid)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn sender_pid(info: &siginfo_t) -> Option<i32> {
    (info.si_pid > 0).then_some(info.si_pid)
}
