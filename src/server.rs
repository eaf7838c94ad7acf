//! Server runtime
//!
//! One control task owns the listening socket, the signal channel and, while
//! a hot restart is in progress, the handoff channel. It multiplexes them
//! with `poll(2)` and services at most one ready source per iteration.
//! Every accepted connection runs on its own thread.
//!
//! States: `Starting -> Running -> Draining -> Stopped`.
//!
//! - First termination request: close the listener and start draining.
//! - Second termination request: exit with status 1 immediately.
//! - Restart request: spawn the start command with the handoff channel path
//!   in its environment, hand it the listening socket, then drain.
//!
//! The loop returns the process exit status; the binary passes it to
//! `std::process::exit`.

use crate::admission::NetworkRestrictions;
use crate::binder::{Binder, HANDOFF_SOCKET_VAR};
use crate::config::Configuration;
use crate::connection::{Accepted, Connection, Listener};
use crate::error::{Error, Result};
use crate::handoff::HandoffChannel;
use crate::signal::{self, ControlMessage, SignalChannel};
use crate::tls::TlsServerFactory;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::getppid;
use std::any::Any;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::panic::{self, AssertUnwindSafe};
use std::process::{self, Child, Command};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Application logic invoked once per admitted connection
///
/// Called concurrently from many connection threads. The connection is
/// closed by the runtime after this returns, whether it succeeded, failed
/// or panicked.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle_request(&self, connection: &mut Connection) -> anyhow::Result<()>;
}

impl<F> RequestHandler for F
where
    F: Fn(&mut Connection) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle_request(&self, connection: &mut Connection) -> anyhow::Result<()> {
        self(connection)
    }
}

/// Lifecycle of a server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Number of connections currently being handled
#[derive(Debug, Clone, Default)]
pub struct ActiveConnections {
    count: Arc<Mutex<usize>>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more connection until the returned guard is dropped
    pub fn admit(&self) -> ConnectionGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        ConnectionGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrements the active connection count when dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    count: Arc<Mutex<usize>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
    }
}

/// A restart waiting for its successor to collect the socket
#[derive(Debug)]
struct PendingHandoff {
    channel: HandoffChannel,
    child: Child,
    deadline: Instant,
}

/// What one loop iteration should service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ready {
    Signal,
    Handoff,
    Accept,
    Idle,
}

/// A restartable socket server
pub struct Server {
    configuration: Configuration,
    handler: Arc<dyn RequestHandler>,
    restrictions: Arc<NetworkRestrictions>,
    tls: Option<TlsServerFactory>,
    listener: Option<Listener>,
    state: ServerState,
    shutdown_requested: bool,
    active: ActiveConnections,
    handoff: Option<PendingHandoff>,
    successor_pid: Option<i32>,
}

impl Server {
    /// Validate the configuration and prepare a server. No socket is opened.
    ///
    /// # Errors
    ///
    /// Every configuration problem (bind string, start command, allowed
    /// networks, TLS material) is reported here, before binding.
    pub fn new<H: RequestHandler>(configuration: Configuration, handler: H) -> Result<Self> {
        Binder::new(&configuration.bind()?)?;
        configuration.start_command()?;
        let restrictions = NetworkRestrictions::new(&configuration)?;
        let tls = match configuration.tls_version()? {
            Some(_) => Some(TlsServerFactory::new(&configuration)?),
            None => None,
        };

        Ok(Self {
            configuration,
            handler: Arc::new(handler),
            restrictions: Arc::new(restrictions),
            tls,
            listener: None,
            state: ServerState::Starting,
            shutdown_requested: false,
            active: ActiveConnections::new(),
            handoff: None,
            successor_pid: None,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn active_connections(&self) -> usize {
        self.active.count()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Address of the listening TCP socket, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(Listener::local_addr)
    }

    /// Start, serve until drained, and return the exit status
    pub fn run(mut self) -> Result<i32> {
        let (sender, mut signals) = signal::channel()?;
        let registration = signal::listen(sender)?;

        let status = self.start().and_then(|()| self.serve(&mut signals));
        registration.close();
        status
    }

    /// Bind (or take over) the listening socket using the process environment
    pub fn start(&mut self) -> Result<()> {
        let binder = Binder::from_env(&self.configuration.bind()?)?;
        self.start_with(binder)
    }

    /// Bind with an explicit binder and move to `Running`
    pub fn start_with(&mut self, binder: Binder) -> Result<()> {
        let listener = binder.bind_to_socket()?;

        if binder.is_successor() {
            notify_predecessor();
        }

        let listener = match &self.tls {
            Some(factory) => factory.wrap_with_tls(listener)?,
            None => listener,
        };
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);

        if let Some(path) = self.configuration.pidfile_path() {
            fs::write(&path, process::id().to_string())?;
            debug!(path = %path.display(), pid = process::id(), "Wrote pidfile");
        }

        self.state = ServerState::Running;
        info!(
            bind = %binder.bind_target(),
            pid = process::id(),
            tls = self.tls.is_some(),
            restricted = self.restrictions.is_restricted(),
            "Server running"
        );
        Ok(())
    }

    /// Run the control loop until the server has drained or is forced down
    ///
    /// Returns 0 once a requested shutdown has no connections left, 1 when a
    /// second termination request forces the exit.
    pub fn serve(&mut self, signals: &mut SignalChannel) -> Result<i32> {
        if self.listener.is_none() && !self.shutdown_requested {
            return Err(Error::config("Server must be started before serving"));
        }

        loop {
            self.check_pending_handoff();

            match self.wait(signals)? {
                Ready::Signal => {
                    if let Some(status) = self.handle_signal(signals)? {
                        self.state = ServerState::Stopped;
                        return Ok(status);
                    }
                }
                Ready::Handoff => self.complete_handoff(),
                Ready::Accept => self.accept_connection(),
                Ready::Idle => {}
            }

            if self.shutdown_requested && self.active.count() == 0 {
                self.state = ServerState::Stopped;
                info!("All connections finished, exiting");
                return Ok(0);
            }
        }
    }

    /// Block until a source is ready or the poll interval passes. Sources are
    /// ranked signal, handoff, accept.
    fn wait(&self, signals: &SignalChannel) -> Result<Ready> {
        let readable = PollFlags::POLLIN;
        let mut fds = vec![PollFd::new(signals.as_fd(), readable)];
        let handoff = self
            .handoff
            .as_ref()
            .and_then(|pending| pending.channel.listener());
        let handoff_index = handoff.map(|listener| {
            fds.push(PollFd::new(listener.as_fd(), readable));
            fds.len() - 1
        });
        let listener_index = self.listener.as_ref().map(|listener| {
            fds.push(PollFd::new(listener.as_fd(), readable));
            fds.len() - 1
        });

        match poll(&mut fds, poll_timeout(self.configuration.poll_interval())) {
            Ok(0) => return Ok(Ready::Idle),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Ready::Idle),
            Err(e) => return Err(e.into()),
        }

        let is_ready = |index: usize| {
            fds[index].revents().is_some_and(|events| {
                events.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
            })
        };

        if is_ready(0) {
            Ok(Ready::Signal)
        } else if handoff_index.is_some_and(is_ready) {
            Ok(Ready::Handoff)
        } else if listener_index.is_some_and(is_ready) {
            Ok(Ready::Accept)
        } else {
            Ok(Ready::Idle)
        }
    }

    fn handle_signal(&mut self, signals: &mut SignalChannel) -> Result<Option<i32>> {
        match signals.recv()? {
            Some(ControlMessage::Terminate { sender }) => Ok(self.on_terminate(sender)),
            Some(ControlMessage::Restart) => {
                self.on_restart();
                Ok(None)
            }
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "signal channel closed",
            ))),
        }
    }

    fn on_terminate(&mut self, sender: Option<i32>) -> Option<i32> {
        if sender.is_some() && sender == self.successor_pid {
            info!(successor = ?sender, "Successor has taken over the listening socket");
            if !self.shutdown_requested {
                self.begin_shutdown();
            }
            return None;
        }

        if self.shutdown_requested {
            warn!(
                active_connections = self.active.count(),
                "Second termination request, exiting without waiting for connections"
            );
            return Some(1);
        }

        info!(sender = ?sender, "Termination requested");
        self.begin_shutdown();
        None
    }

    /// Stop accepting new connections and wait for the active ones
    fn begin_shutdown(&mut self) {
        if self.handoff.is_some() {
            self.abandon_handoff("server is shutting down");
        }
        self.listener = None;
        self.shutdown_requested = true;
        self.state = ServerState::Draining;
        info!(active_connections = self.active.count(), "Listening socket closed, draining");
    }

    fn on_restart(&mut self) {
        if self.state != ServerState::Running || self.handoff.is_some() {
            info!(state = ?self.state, pending = self.handoff.is_some(), "Ignoring restart request");
            return;
        }

        match self.spawn_successor() {
            Ok(pending) => {
                info!(
                    successor = pending.child.id(),
                    handoff = %pending.channel.socket_path().display(),
                    "Restarting, waiting for successor to collect the listening socket"
                );
                self.successor_pid = i32::try_from(pending.child.id()).ok();
                self.handoff = Some(pending);
            }
            Err(e) => error!(error = %e, "Restart failed, continuing to serve"),
        }
    }

    fn spawn_successor(&self) -> Result<PendingHandoff> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::HandoffFailed("no listening socket to hand off".into()))?;
        let argv = self.configuration.start_command()?;
        let channel = HandoffChannel::new(listener.as_fd())?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env(HANDOFF_SOCKET_VAR, channel.socket_path());
        if let Some(root) = self.configuration.app_root() {
            command.current_dir(root);
        }

        let child = command.spawn().map_err(|source| Error::Spawn {
            command: argv.join(" "),
            source,
        })?;

        Ok(PendingHandoff {
            channel,
            child,
            deadline: Instant::now() + self.configuration.handoff_timeout(),
        })
    }

    /// Give up on a restart whose successor died or never connected
    fn check_pending_handoff(&mut self) {
        let Some(pending) = self.handoff.as_mut() else {
            return;
        };
        let reason = match pending.child.try_wait() {
            Ok(Some(status)) => format!("successor exited with {status} before taking over"),
            Ok(None) if Instant::now() >= pending.deadline => {
                "successor did not collect the listening socket in time".to_string()
            }
            Ok(None) => return,
            Err(e) => format!("could not check on successor: {e}"),
        };
        self.abandon_handoff(&reason);
    }

    fn abandon_handoff(&mut self, reason: &str) {
        let Some(mut pending) = self.handoff.take() else {
            return;
        };
        error!(reason, successor = pending.child.id(), "Abandoning restart");
        if let Err(e) = pending.channel.close() {
            warn!(error = %e, "Failed to clean up handoff channel");
        }
        if matches!(pending.child.try_wait(), Ok(None)) {
            let _ = pending.child.kill();
        }
        let _ = pending.child.wait();
        self.successor_pid = None;
    }

    /// The successor connected: hand over the socket and start draining
    fn complete_handoff(&mut self) {
        let Some(mut pending) = self.handoff.take() else {
            return;
        };
        match pending.channel.try_serve_file_descriptor() {
            Ok(true) => {
                info!(successor = pending.child.id(), "Listening socket handed off");
                self.begin_shutdown();
            }
            Ok(false) => {
                debug!("Handoff channel readable but no successor waiting");
                self.handoff = Some(pending);
            }
            Err(e) => {
                error!(error = %e, "Handoff to successor failed");
                self.handoff = Some(pending);
                self.abandon_handoff("descriptor transfer failed");
            }
        }
    }

    fn accept_connection(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        match listener.accept() {
            Ok(accepted) => self.dispatch(accepted),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => warn!(error = %e, "Failed to accept connection"),
        }
    }

    fn dispatch(&self, accepted: Accepted) {
        let guard = self.active.admit();
        let handler = Arc::clone(&self.handler);
        let restrictions = Arc::clone(&self.restrictions);
        let peer = accepted.peer_addr();

        let spawned = thread::Builder::new()
            .name("connection".into())
            .spawn(move || handle_connection(accepted, guard, &restrictions, handler.as_ref()));
        if let Err(e) = spawned {
            warn!(error = %e, peer = ?peer, "Failed to start connection thread, dropping connection");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.handoff.is_some() {
            self.abandon_handoff("server dropped");
        }
    }
}

fn handle_connection(
    accepted: Accepted,
    _guard: ConnectionGuard,
    restrictions: &NetworkRestrictions,
    handler: &dyn RequestHandler,
) {
    let peer = accepted.peer_addr();
    let span = info_span!("connection", peer = ?peer);
    let _entered = span.enter();

    if !restrictions.connection_allowed_from(accepted.peer_ip()) {
        info!("Rejected connection from disallowed address");
        accepted.reject();
        return;
    }

    let mut connection = match accepted.establish() {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "Failed to establish connection");
            return;
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_request(&mut connection))) {
        Ok(Ok(())) => debug!("Request handled"),
        Ok(Err(e)) => warn!(error = %e, "Request handler failed"),
        Err(payload) => warn!(panic = panic_message(payload.as_ref()), "Request handler panicked"),
    }
    connection.close();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// The process that spawned a successor is its parent
fn notify_predecessor() {
    let parent = getppid();
    if parent.as_raw() <= 1 {
        warn!(parent = parent.as_raw(), "Predecessor is gone, not signalling it");
        return;
    }
    match kill(parent, Signal::SIGTERM) {
        Ok(()) => info!(predecessor = parent.as_raw(), "Asked predecessor to drain"),
        Err(e) => warn!(predecessor = parent.as_raw(), error = %e, "Failed to signal predecessor"),
    }
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    let millis = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(millis)
}
