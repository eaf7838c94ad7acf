//! Listening sockets and accepted connections
//!
//! [`Listener`] wraps whatever [`crate::binder::Binder`] produced, optionally
//! layered with TLS. [`Connection`] is what request handlers read from and
//! write to; it hides whether the bytes travel over TCP, a UNIX socket or TLS.

use crate::error::{Error, Result};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use tracing::debug;

/// A listening socket
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    /// TCP listener whose connections are wrapped in TLS after admission
    Tls {
        listener: TcpListener,
        config: Arc<ServerConfig>,
    },
}

impl Listener {
    /// Accept one pending connection. The handshake (if any) is deferred to
    /// [`Accepted::establish`] so it never runs on the accepting thread.
    pub fn accept(&self) -> io::Result<Accepted> {
        let accepted = match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Accepted {
                    stream: RawStream::Tcp(stream),
                    peer: Some(addr),
                    tls: None,
                }
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Accepted {
                    stream: RawStream::Unix(stream),
                    peer: None,
                    tls: None,
                }
            }
            Self::Tls { listener, config } => {
                let (stream, addr) = listener.accept()?;
                Accepted {
                    stream: RawStream::Tcp(stream),
                    peer: Some(addr),
                    tls: Some(Arc::clone(config)),
                }
            }
        };
        // Some platforms let accepted sockets inherit O_NONBLOCK
        accepted.stream.set_nonblocking(false)?;
        Ok(accepted)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(listener) | Self::Tls { listener, .. } => listener.set_nonblocking(nonblocking),
            Self::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Local address of a TCP listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) | Self::Tls { listener, .. } => listener.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(listener) | Self::Tls { listener, .. } => listener.as_fd(),
            Self::Unix(listener) => listener.as_fd(),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(listener) => f.debug_tuple("Tcp").field(listener).finish(),
            Self::Unix(listener) => f.debug_tuple("Unix").field(listener).finish(),
            Self::Tls { listener, .. } => f.debug_struct("Tls").field("listener", listener).finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RawStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(nonblocking),
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

/// A connection fresh off the listener, not yet handed to a handler
#[derive(Debug)]
pub struct Accepted {
    stream: RawStream,
    peer: Option<SocketAddr>,
    tls: Option<Arc<ServerConfig>>,
}

impl Accepted {
    /// IP address of the peer, None for UNIX sockets
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer.map(|addr| addr.ip())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Close without ever handing the connection to a handler
    pub fn reject(self) {
        let _ = self.stream.shutdown();
    }

    /// Finish setting up the connection, performing the TLS handshake when
    /// the listener was wrapped with TLS
    ///
    /// # Errors
    ///
    /// A failed handshake closes the underlying socket and returns the error.
    pub fn establish(self) -> Result<Connection> {
        let peer = self.peer;
        match (self.stream, self.tls) {
            (RawStream::Tcp(stream), Some(config)) => {
                let mut tls = ServerConnection::new(config)?;
                let mut sock = stream;
                if let Err(e) = handshake(&mut tls, &mut sock) {
                    let _ = sock.shutdown(Shutdown::Both);
                    return Err(e);
                }
                debug!(peer = ?peer, version = ?tls.protocol_version(), "TLS handshake complete");
                Ok(Connection::Tls {
                    stream: Box::new(StreamOwned::new(tls, sock)),
                    peer,
                })
            }
            (RawStream::Tcp(stream), None) => Ok(Connection::Tcp { stream, peer }),
            (RawStream::Unix(stream), _) => Ok(Connection::Unix(stream)),
        }
    }
}

fn handshake(tls: &mut ServerConnection, sock: &mut TcpStream) -> Result<()> {
    while tls.is_handshaking() {
        let (read, written) = tls.complete_io(sock)?;
        if read == 0 && written == 0 && tls.is_handshaking() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection during the TLS handshake",
            )));
        }
    }
    Ok(())
}

/// An established client connection
#[derive(Debug)]
pub enum Connection {
    Tcp {
        stream: TcpStream,
        peer: Option<SocketAddr>,
    },
    Unix(UnixStream),
    Tls {
        stream: Box<StreamOwned<ServerConnection, TcpStream>>,
        peer: Option<SocketAddr>,
    },
}

impl Connection {
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp { peer, .. } | Self::Tls { peer, .. } => *peer,
            Self::Unix(_) => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Close the connection, sending a TLS close_notify first when encrypted.
    /// Errors are ignored: the peer may already be gone.
    pub fn close(mut self) {
        match &mut self {
            Self::Tcp { stream, .. } => {
                let _ = stream.flush();
                let _ = stream.shutdown(Shutdown::Both);
            }
            Self::Unix(stream) => {
                let _ = stream.flush();
                let _ = stream.shutdown(Shutdown::Both);
            }
            Self::Tls { stream, .. } => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
                let _ = stream.sock.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp { stream, .. } => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
            Self::Tls { stream, .. } => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp { stream, .. } => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
            Self::Tls { stream, .. } => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp { stream, .. } => stream.flush(),
            Self::Unix(stream) => stream.flush(),
            Self::Tls { stream, .. } => stream.flush(),
        }
    }
}
