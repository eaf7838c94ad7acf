//! Descriptor handoff channel
//!
//! A short-lived UNIX socket server that hands one open descriptor (the
//! listening socket) to the next process that connects, using SCM_RIGHTS.
//! The socket lives in a private temporary directory which is removed on
//! [`HandoffChannel::close`].

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::fs;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const SOCKET_NAME: &str = "file_descriptor_server.sock";

/// Serves one descriptor to one peer, then tears itself down
#[derive(Debug)]
pub struct HandoffChannel {
    descriptor: OwnedFd,
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    directory: Option<TempDir>,
}

impl HandoffChannel {
    /// Start listening on a fresh socket path for the peer that will receive
    /// a duplicate of `descriptor`
    pub fn new(descriptor: BorrowedFd<'_>) -> Result<Self> {
        let descriptor = descriptor.try_clone_to_owned()?;
        let directory = tempfile::Builder::new().prefix("seamless-").tempdir()?;
        let socket_path = directory.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;

        debug!(path = %socket_path.display(), fd = descriptor.as_raw_fd(), "Handoff channel listening");

        Ok(Self {
            descriptor,
            socket_path,
            listener: Some(listener),
            directory: Some(directory),
        })
    }

    /// Where the channel is listening
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The listening endpoint, readable once a peer has connected
    pub fn listener(&self) -> Option<&UnixListener> {
        self.listener.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }

    /// Send the descriptor to a peer that has already connected, then tear
    /// the channel down
    ///
    /// Returns `Ok(false)` and leaves the channel open when nobody is waiting
    /// yet. Once a peer is accepted the channel is closed whether or not the
    /// transfer succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandoffClosed`] if the channel was already used or
    /// closed.
    pub fn try_serve_file_descriptor(&mut self) -> Result<bool> {
        let listener = self.listener.as_ref().ok_or(Error::HandoffClosed)?;
        let client = match listener.accept() {
            Ok((client, _)) => client,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        // accepted sockets inherit O_NONBLOCK on some platforms
        let result = client
            .set_nonblocking(false)
            .map_err(Error::from)
            .and_then(|()| send_descriptor(&client, self.descriptor.as_fd()));
        drop(client);

        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to clean up handoff channel");
        }
        result?;

        info!(fd = self.descriptor.as_raw_fd(), "Handed listening socket to successor");
        Ok(true)
    }

    /// Wait for a peer to connect and serve it the descriptor
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandoffClosed`] if the channel was already used or
    /// closed.
    pub fn serve_file_descriptor(&mut self) -> Result<()> {
        loop {
            {
                let listener = self.listener.as_ref().ok_or(Error::HandoffClosed)?;
                let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if self.try_serve_file_descriptor()? {
                return Ok(());
            }
        }
    }

    /// Stop listening and remove the socket file and its directory.
    /// Closing an already closed channel is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.listener.take().is_none() {
            return Ok(());
        }
        match fs::remove_file(&self.socket_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        if let Some(directory) = self.directory.take() {
            directory.close()?;
        }
        debug!(path = %self.socket_path.display(), "Handoff channel closed");
        Ok(())
    }
}

impl Drop for HandoffChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Connect to a handoff channel and receive the descriptor it serves
pub fn receive_descriptor(path: &Path) -> Result<OwnedFd> {
    let stream = UnixStream::connect(path)?;
    recv_descriptor(&stream)
}

/// Send one descriptor as SCM_RIGHTS ancillary data
pub fn send_descriptor(socket: &UnixStream, fd: BorrowedFd<'_>) -> Result<()> {
    // At least one byte of real data must accompany the control message
    let payload = [0u8; 1];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];

    sendmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        &[ControlMessage::ScmRights(&fds)],
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}

/// Receive exactly one descriptor sent with [`send_descriptor`]
pub fn recv_descriptor(socket: &UnixStream) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 4]);

    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        recv_flags(),
    )?;

    let mut received: Vec<OwnedFd> = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            // SAFETY: the kernel just installed these descriptors in our table
            // and nothing else refers to them yet.
            received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if received.len() > 1 {
        warn!(count = received.len(), "Received extra descriptors on handoff channel, closing them");
    }
    received
        .into_iter()
        .next()
        .ok_or_else(|| Error::HandoffFailed("peer closed the channel without sending a descriptor".into()))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}
