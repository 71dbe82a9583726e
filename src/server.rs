//! TCP dispatcher for echo connections.
//!
//! Owns the listening socket, admits connections up to the configured
//! ceiling, and spawns one handler task per accepted connection. Handler
//! tasks are tracked in a `JoinSet`, so panics are caught and logged at
//! the task boundary and shutdown can drain them.

use crate::admission::{Admission, ConnectionSlot, Reservation};
use crate::config::Config;
use crate::connection::{CloseReason, ConnectionId, IdAllocator};
use crate::handler::{serve_connection, HandlerSettings};
use crate::log_sink::LogSink;
use crate::shutdown::ShutdownHandle;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Pause after an accept failure caused by resource exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Fatal errors raised before the server starts serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to resolve listen address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("Bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Listen on {addr} failed: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to register listener with the runtime: {0}")]
    Register(#[source] io::Error),
}

/// Dispatcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Listening = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Idle,
            1 => Phase::Listening,
            2 => Phase::ShuttingDown,
            _ => Phase::Stopped,
        }
    }
}

/// Read-only view of a running server, usable after `run` took ownership.
#[derive(Debug, Clone)]
pub struct ServerMonitor {
    admission: Admission,
    phase: Arc<AtomicU8>,
}

impl ServerMonitor {
    /// Connections currently being served.
    pub fn live_connections(&self) -> usize {
        self.admission.live()
    }

    pub fn max_clients(&self) -> usize {
        self.admission.max()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }
}

/// Summary returned once the dispatcher has stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerReport {
    /// Connections accepted and handed to a handler.
    pub accepted: u64,
    /// Handlers that ran to completion.
    pub completed: u64,
    /// Handlers that panicked.
    pub panicked: u64,
    /// Handlers still running after the grace period and aborted.
    pub aborted: u64,
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    admission: Admission,
    ids: IdAllocator,
    settings: HandlerSettings,
    shutdown_grace: Duration,
    shutdown: ShutdownHandle,
    phase: Arc<AtomicU8>,
    sink: LogSink,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a Tokio runtime. Any failure here is
    /// fatal: the caller should exit without serving.
    pub fn start(config: &Config, sink: LogSink) -> Result<Self, StartupError> {
        let phase = Arc::new(AtomicU8::new(Phase::Idle as u8));

        let addr = resolve(&config.listen_addr())?;
        let std_listener = bind_listener(addr, config.backlog)?;
        let listener = TcpListener::from_std(std_listener).map_err(StartupError::Register)?;
        let local_addr = listener.local_addr().map_err(StartupError::Register)?;

        phase.store(Phase::Listening as u8, Ordering::SeqCst);
        info!(address = %local_addr, max_clients = config.max_clients, "Server listening");

        Ok(Server {
            listener,
            local_addr,
            admission: Admission::new(config.max_clients),
            ids: IdAllocator::new(),
            settings: HandlerSettings {
                io_timeout: config.io_timeout,
                buffer_size: config.buffer_size,
            },
            shutdown_grace: config.shutdown_grace,
            shutdown: ShutdownHandle::new(),
            phase,
            sink,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops the accept loop when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn monitor(&self) -> ServerMonitor {
        ServerMonitor {
            admission: self.admission.clone(),
            phase: Arc::clone(&self.phase),
        }
    }

    /// Accept connections until shutdown is requested, then drain handlers.
    pub async fn run(self) -> ServerReport {
        let Server {
            listener,
            local_addr,
            admission,
            ids,
            settings,
            shutdown_grace,
            shutdown,
            phase,
            sink,
        } = self;

        let mut tasks = HandlerTasks::new(sink.clone(), admission.clone());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.requested() => break,

                Some(done) = tasks.set.join_next_with_id() => tasks.reap(done),

                next = next_connection(&admission, &listener) => {
                    let (reservation, stream, peer) = match next {
                        Ok(accepted) => accepted,
                        Err(AcceptFailure::Closed) => break,
                        Err(AcceptFailure::Io(e)) => {
                            warn!(error = %e, "Failed to accept connection");
                            if is_resource_exhaustion(&e) {
                                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                            }
                            continue;
                        }
                    };

                    let id = ids.next_id();
                    let (slot, live) = reservation.admit();

                    let Some((stream, slot)) =
                        prepare_connection(stream, id, slot, &sink, configure_stream)
                    else {
                        continue;
                    };

                    sink.append(format!(
                        "Server: Client {id} connected from {peer} (Total clients: {live})"
                    ));
                    let handle = tasks
                        .set
                        .spawn(serve_connection(stream, id, slot, settings, sink.clone()));
                    tasks.clients.insert(handle.id(), id);
                    tasks.report.accepted += 1;
                }
            }
        }

        phase.store(Phase::ShuttingDown as u8, Ordering::SeqCst);
        drop(listener);
        info!(
            address = %local_addr,
            in_flight = tasks.set.len(),
            "Stopped accepting connections"
        );

        let report = tasks.drain(shutdown_grace).await;

        phase.store(Phase::Stopped as u8, Ordering::SeqCst);
        info!(
            accepted = report.accepted,
            completed = report.completed,
            panicked = report.panicked,
            aborted = report.aborted,
            "Server stopped"
        );
        report
    }
}

/// In-flight handler tasks keyed to the connection they serve.
struct HandlerTasks {
    set: JoinSet<CloseReason>,
    clients: HashMap<task::Id, ConnectionId>,
    report: ServerReport,
    sink: LogSink,
    admission: Admission,
}

impl HandlerTasks {
    fn new(sink: LogSink, admission: Admission) -> Self {
        Self {
            set: JoinSet::new(),
            clients: HashMap::new(),
            report: ServerReport::default(),
            sink,
            admission,
        }
    }

    fn reap(&mut self, done: Result<(task::Id, CloseReason), JoinError>) {
        match done {
            Ok((task_id, reason)) => {
                let id = self.clients.remove(&task_id);
                debug!(client = ?id.map(|id| id.get()), ?reason, "Handler finished");
                self.report.completed += 1;
            }
            Err(e) => {
                let id = self.clients.remove(&e.id());
                let client = id.map_or_else(|| "?".to_string(), |id| id.to_string());
                if e.is_panic() {
                    // The slot was dropped while the task unwound.
                    let cause = panic_message(e.into_panic());
                    let remaining = self.admission.live();
                    self.sink.append(format!(
                        "Server: Client {client} handler failed: {cause}; connection closed (Remaining clients: {remaining})"
                    ));
                    self.report.panicked += 1;
                } else {
                    self.report.aborted += 1;
                }
            }
        }
    }

    /// Wait for live handlers up to `grace`, then abort the rest.
    async fn drain(mut self, grace: Duration) -> ServerReport {
        let waited = tokio::time::timeout(grace, async {
            while let Some(done) = self.set.join_next_with_id().await {
                self.reap(done);
            }
        })
        .await;

        if waited.is_err() {
            let remaining = self.set.len();
            warn!(remaining, "Grace period elapsed, aborting connection handlers");
            self.set.abort_all();
            while let Some(done) = self.set.join_next_with_id().await {
                self.reap(done);
            }
        }

        self.report
    }
}

/// Socket options applied to every accepted connection.
fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Run per-connection setup. On failure the stream is closed and the
/// admission count rolled back before anything is spawned.
fn prepare_connection<F>(
    stream: TcpStream,
    id: ConnectionId,
    slot: ConnectionSlot,
    sink: &LogSink,
    setup: F,
) -> Option<(TcpStream, ConnectionSlot)>
where
    F: FnOnce(&TcpStream) -> io::Result<()>,
{
    match setup(&stream) {
        Ok(()) => Some((stream, slot)),
        Err(e) => {
            drop(stream);
            let remaining = slot.release();
            sink.append(format!(
                "Server: Failed to start handler for client {id}: {e} (Remaining clients: {remaining})"
            ));
            None
        }
    }
}

enum AcceptFailure {
    /// Admission was closed; no more connections can be served.
    Closed,
    Io(io::Error),
}

async fn next_connection(
    admission: &Admission,
    listener: &TcpListener,
) -> Result<(Reservation, TcpStream, SocketAddr), AcceptFailure> {
    // Wait for a connection slot before taking anything off the backlog
    let reservation = admission
        .acquire()
        .await
        .map_err(|_| AcceptFailure::Closed)?;
    let (stream, peer) = listener.accept().await.map_err(AcceptFailure::Io)?;
    Ok((reservation, stream, peer))
}

fn resolve(addr: &str) -> Result<SocketAddr, StartupError> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()
        .and_then(|mut addrs| {
            addrs
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
        })
        .map_err(|source| StartupError::Resolve {
            addr: addr.to_string(),
            source,
        })
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, StartupError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(StartupError::Socket)?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "Failed to set SO_REUSEADDR");
    }
    socket
        .bind(&addr.into())
        .map_err(|source| StartupError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| StartupError::Listen { addr, source })?;
    socket.set_nonblocking(true).map_err(StartupError::Socket)?;

    Ok(socket.into())
}

#[cfg(unix)]
fn is_resource_exhaustion(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_error: &io::Error) -> bool {
    false
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
