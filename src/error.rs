//! Error types for the restart/shutdown runtime
//!
//! Configuration errors are fatal at startup. Everything else is caught and
//! logged at the boundary closest to where it happens.

use std::io;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the binder, handoff channel, TLS layer and runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration, raised before any socket is opened
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error from a socket, file or poll call
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS context construction failed
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Serving a descriptor after the handoff channel was torn down
    #[error("file descriptor server has been closed")]
    HandoffClosed,

    /// The peer on a handoff channel broke the protocol
    #[error("descriptor handoff failed: {0}")]
    HandoffFailed(String),

    /// The successor process could not be started
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Shorthand for [`Error::Configuration`]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True for errors that must abort startup
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<nix::Error> for Error {
    fn from(errno: nix::Error) -> Self {
        Self::Io(io::Error::from(errno))
    }
}
