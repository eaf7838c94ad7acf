//! Zero-downtime restarts and graceful shutdown for socket servers
//!
//! A [`Server`] owns a listening socket and dispatches each accepted
//! connection to a [`RequestHandler`] on its own thread. SIGTERM drains the
//! server; SIGUSR1 starts a successor process, hands it the listening socket
//! over a UNIX socket, then drains. Clients never see a refused connection.
//!
//! ```no_run
//! use seamless::{Configuration, Connection, Server};
//! use std::io::Write;
//!
//! let configuration = Configuration::new()
//!     .with_bind("tcp://127.0.0.1:8080")
//!     .with_start_command(std::env::args());
//! let server = Server::new(configuration, |conn: &mut Connection| -> anyhow::Result<()> {
//!     conn.write_all(b"hello\n")?;
//!     Ok(())
//! })?;
//! std::process::exit(server.run()?);
//! # Ok::<(), seamless::Error>(())
//! ```

pub mod admission;
pub mod binder;
pub mod config;
pub mod connection;
pub mod error;
pub mod handoff;
pub mod logging;
pub mod server;
pub mod signal;
pub mod tls;

pub use admission::{IpNetwork, NetworkRestrictions};
pub use binder::{BindTarget, Binder, HANDOFF_SOCKET_VAR};
pub use config::Configuration;
pub use connection::{Accepted, Connection, Listener};
pub use error::{Error, Result};
pub use handoff::HandoffChannel;
pub use server::{ActiveConnections, ConnectionGuard, RequestHandler, Server, ServerState};
pub use signal::ControlMessage;
pub use tls::TlsServerFactory;
