//! Socket binder
//!
//! Turns a bind string such as `tcp://127.0.0.1:8080` or
//! `unix:///tmp/server.sock` into a listening socket. When the process was
//! started as a restart successor, [`HANDOFF_SOCKET_VAR`] names a handoff
//! channel and the socket is rebuilt from the descriptor received there
//! instead of being bound again.

use crate::connection::Listener;
use crate::error::{Error, Result};
use crate::handoff;
use nix::sys::socket::{getsockopt, sockopt, SockType};
use std::fmt;
use std::fs;
use std::io;
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable carrying the handoff channel path to a successor
pub const HANDOFF_SOCKET_VAR: &str = "SEAMLESS_HANDOFF_SOCKET";

/// A parsed bind address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// `unix:///path/to/socket`
    Unix { path: PathBuf },
    /// Any other well-formed scheme, rejected when binding
    Other { scheme: String, rest: String },
}

impl BindTarget {
    /// Parse a bind string
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the string is not `scheme://...`
    /// or a tcp/unix target is missing its host, port or path.
    pub fn parse(bind: &str) -> Result<Self> {
        let unparsable = || Error::config(format!("Couldn't parse the bind address: \"{bind}\""));

        let (scheme, rest) = bind.split_once("://").ok_or_else(unparsable)?;
        let valid_scheme = !scheme.is_empty()
            && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme || rest.chars().any(char::is_whitespace) {
            return Err(unparsable());
        }

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => {
                let (host, port) = split_host_port(rest).ok_or_else(unparsable)?;
                Ok(Self::Tcp { host, port })
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(unparsable());
                }
                Ok(Self::Unix { path: PathBuf::from(rest) })
            }
            other => Ok(Self::Other {
                scheme: other.to_string(),
                rest: rest.to_string(),
            }),
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Unix { .. } => "unix",
            Self::Other { scheme, .. } => scheme,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    fn unsupported(&self) -> Error {
        Error::config(format!(
            "Can only bind to TCP and UNIX sockets, got scheme \"{}\"",
            self.scheme()
        ))
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Other { scheme, rest } => write!(f, "{scheme}://{rest}"),
        }
    }
}

/// Split `host:port` or `[v6]:port`
fn split_host_port(authority: &str) -> Option<(String, u16)> {
    let authority = authority.strip_suffix('/').unwrap_or(authority);
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']')?;
        (host, after.strip_prefix(':')?)
    } else {
        let (host, port) = authority.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Produces the listening socket for a bind target
#[derive(Debug, Clone)]
pub struct Binder {
    bind_target: BindTarget,
    handoff_path: Option<PathBuf>,
}

impl Binder {
    /// Parse the bind string. No socket operation happens here.
    pub fn new(bind: &str) -> Result<Self> {
        Ok(Self {
            bind_target: BindTarget::parse(bind)?,
            handoff_path: None,
        })
    }

    /// Like [`Binder::new`], picking up a predecessor's handoff channel from
    /// [`HANDOFF_SOCKET_VAR`]
    pub fn from_env(bind: &str) -> Result<Self> {
        let handoff_path = std::env::var_os(HANDOFF_SOCKET_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Ok(Self::new(bind)?.with_handoff_path(handoff_path))
    }

    /// Receive the socket from this handoff channel instead of binding
    pub fn with_handoff_path(mut self, path: Option<PathBuf>) -> Self {
        self.handoff_path = path;
        self
    }

    pub fn bind_target(&self) -> &BindTarget {
        &self.bind_target
    }

    /// True when the socket will be taken over from a running predecessor
    pub fn is_successor(&self) -> bool {
        self.handoff_path.is_some()
    }

    /// Bind to (or take over) the socket for the configured target
    ///
    /// # Errors
    ///
    /// Unsupported schemes fail with a configuration error before any socket
    /// is touched. Bind and handoff failures surface as I/O or handoff errors.
    pub fn bind_to_socket(&self) -> Result<Listener> {
        match (&self.bind_target, &self.handoff_path) {
            (BindTarget::Other { .. }, _) => Err(self.bind_target.unsupported()),
            (target, Some(handoff_path)) => {
                let fd = handoff::receive_descriptor(handoff_path)?;
                check_stream_socket(&fd)?;
                info!(bind = %target, handoff = %handoff_path.display(), "Took over listening socket from predecessor");
                Ok(match target {
                    BindTarget::Tcp { .. } => Listener::Tcp(TcpListener::from(fd)),
                    _ => Listener::Unix(UnixListener::from(fd)),
                })
            }
            (BindTarget::Tcp { host, port }, None) => {
                let listener = TcpListener::bind((host.as_str(), *port))?;
                info!(bind = %self.bind_target, addr = ?listener.local_addr().ok(), "Bound TCP socket");
                Ok(Listener::Tcp(listener))
            }
            (BindTarget::Unix { path }, None) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                info!(path = %path.display(), "Bound UNIX socket");
                Ok(Listener::Unix(listener))
            }
        }
    }
}

/// A crashed predecessor may leave its socket file behind
fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn check_stream_socket(fd: &OwnedFd) -> Result<()> {
    match getsockopt(fd, sockopt::SockType)? {
        SockType::Stream => Ok(()),
        other => Err(Error::HandoffFailed(format!(
            "received descriptor is a {other:?} socket, expected a stream socket"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            BindTarget::parse("tcp://127.0.0.1:8080").unwrap(),
            BindTarget::Tcp { host: "127.0.0.1".into(), port: 8080 }
        );
        assert_eq!(
            BindTarget::parse("tcp://[::1]:9000").unwrap(),
            BindTarget::Tcp { host: "::1".into(), port: 9000 }
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            BindTarget::parse("unix:///tmp/server.sock").unwrap(),
            BindTarget::Unix { path: PathBuf::from("/tmp/server.sock") }
        );
    }

    #[test]
    fn test_parse_other_scheme_is_deferred() {
        let target = BindTarget::parse("https://google.com").unwrap();
        assert_eq!(target.scheme(), "https");
        assert!(!target.is_tcp());
    }

    #[test]
    fn test_parse_rejects_nonsense() {
        for bind in [
            "nonsense uri",
            "",
            "://host:1",
            "tcp://127.0.0.1",
            "tcp://:8080",
            "tcp://127.0.0.1:99999",
            "tcp://::1:80",
            "unix://",
            "1tcp://host:1",
        ] {
            let err = BindTarget::parse(bind).unwrap_err();
            assert!(err.is_configuration(), "{bind:?} should be a configuration error");
        }
    }

    #[test]
    fn test_display_round_trips_text() {
        for bind in ["tcp://127.0.0.1:8080", "tcp://[::1]:80", "unix:///tmp/x.sock"] {
            assert_eq!(BindTarget::parse(bind).unwrap().to_string(), bind);
        }
    }

    #[test]
    fn test_unsupported_scheme_fails_before_handoff() {
        let binder = Binder::new("https://google.com")
            .unwrap()
            .with_handoff_path(Some(PathBuf::from("/nonexistent/handoff.sock")));
        let err = binder.bind_to_socket().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("https"));
    }

    #[test]
    fn test_successor_detection() {
        let binder = Binder::new("tcp://127.0.0.1:0").unwrap();
        assert!(!binder.is_successor());
        let binder = binder.with_handoff_path(Some(PathBuf::from("/tmp/x.sock")));
        assert!(binder.is_successor());
    }
}
