//! Connection identity, lifecycle state and message classification.
//!
//! One `recv` is one message: there is no delimiter scanning and no
//! reassembly across reads. Under real network fragmentation a logical
//! message may arrive split or merged; the echo protocol keeps the
//! read-boundary framing regardless.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Literal message asking the server to close the connection.
pub const QUIT_COMMAND: &[u8] = b"quit";

/// Process-unique connection identifier, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out monotonically increasing connection ids starting at 1.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a connection left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its write side (read returned zero bytes).
    PeerClosed,
    /// Peer sent the `quit` sentinel.
    Quit,
    /// No data within the receive/send deadline.
    Timeout,
    /// Peer reset the connection.
    ConnectionReset,
    /// Any other receive failure.
    RecvError,
    /// The response could not be sent.
    SendError,
    /// Server aborted the handler during shutdown.
    Aborted,
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Receiving and answering messages.
    Active,
    /// A terminal condition was hit; the endpoint is still held.
    Closing(CloseReason),
    /// Endpoint released.
    Closed(CloseReason),
}

/// Lifecycle bookkeeping for one accepted connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    state: ConnState,
}

impl Connection {
    /// Create a new connection in the active state.
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: ConnState::Active,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ConnState::Active)
    }

    /// Move to `Closing`. The first reason recorded wins.
    pub fn close(&mut self, reason: CloseReason) {
        if let ConnState::Active = self.state {
            self.state = ConnState::Closing(reason);
        }
    }

    /// Mark the endpoint as released.
    ///
    /// Returns the close reason, or `None` if the connection was never closed.
    pub fn release(&mut self) -> Option<CloseReason> {
        match self.state {
            ConnState::Closing(reason) => {
                self.state = ConnState::Closed(reason);
                Some(reason)
            }
            ConnState::Closed(reason) => Some(reason),
            ConnState::Active => None,
        }
    }
}

/// One received read, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    /// Empty or only spaces, tabs, CR and LF; discarded without reply.
    Blank,
    /// The `quit` sentinel (exact, case-sensitive).
    Quit,
    /// Anything else; echoed back.
    Text(&'a [u8]),
}

impl<'a> Message<'a> {
    pub fn classify(data: &'a [u8]) -> Self {
        if data.iter().all(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r')) {
            Message::Blank
        } else if data == QUIT_COMMAND {
            Message::Quit
        } else {
            Message::Text(data)
        }
    }
}

/// Build `Echo from server to client #<id>: <message>`.
pub fn echo_response(id: ConnectionId, message: &[u8]) -> BytesMut {
    let prefix = format!("Echo from server to client {id}: ");
    let mut response = BytesMut::with_capacity(prefix.len() + message.len());
    response.put_slice(prefix.as_bytes());
    response.put_slice(message);
    response
}
