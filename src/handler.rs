//! Per-connection echo handler.
//!
//! Protocol: unframed text, one read is one message.
//! - Blank message: logged and discarded, no reply
//! - `quit`: connection closed, no reply
//! - Anything else: `Echo from server to client #<id>: <message>`
//!
//! Every read and write is bounded by the configured I/O deadline. A
//! response is written with a single write call; a short write is logged
//! and the remainder dropped.

use crate::admission::ConnectionSlot;
use crate::connection::{echo_response, CloseReason, Connection, ConnectionId, Message};
use crate::log_sink::LogSink;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

/// Per-connection knobs taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// Deadline for each receive and each send.
    pub io_timeout: Duration,
    /// Maximum bytes taken by one read.
    pub buffer_size: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            buffer_size: 1024,
        }
    }
}

/// Serve one connection to completion.
///
/// The stream is dropped and the slot released before this returns; the
/// termination line carries the remaining live count.
pub async fn serve_connection<S>(
    mut stream: S,
    id: ConnectionId,
    slot: ConnectionSlot,
    settings: HandlerSettings,
    sink: LogSink,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(id);
    let mut buffer = BytesMut::with_capacity(settings.buffer_size);

    while conn.is_active() {
        buffer.clear();
        let receive = read_message(&mut stream, &mut buffer, settings.buffer_size);
        let read = match timeout(settings.io_timeout, receive).await {
            Ok(result) => result,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        };

        match read {
            Ok(0) => {
                sink.append(format!("Server: Client {id} closed connection gracefully"));
                conn.close(CloseReason::PeerClosed);
            }
            Ok(_) => handle_message(&mut stream, &mut conn, &buffer, settings, &sink).await,
            Err(e) => {
                let reason = classify_recv_error(&e);
                match reason {
                    CloseReason::Timeout => {
                        sink.append(format!("Server: Client {id} connection timed out"));
                    }
                    CloseReason::ConnectionReset => {
                        sink.append(format!("Server: Client {id} connection reset by peer"));
                    }
                    _ => sink.append(format!("Server: Client {id} receive error: {e}")),
                }
                conn.close(reason);
            }
        }
    }

    drop(stream);
    let reason = conn.release().unwrap_or(CloseReason::Aborted);
    let remaining = slot.release();
    sink.append(format!(
        "Server: Client {id} handler terminated (Remaining clients: {remaining})"
    ));
    reason
}

async fn read_message<S>(stream: &mut S, buffer: &mut BytesMut, limit: usize) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut limited = (&mut *stream).take(limit as u64);
    limited.read_buf(buffer).await
}

async fn handle_message<S>(
    stream: &mut S,
    conn: &mut Connection,
    data: &[u8],
    settings: HandlerSettings,
    sink: &LogSink,
) where
    S: AsyncWrite + Unpin,
{
    let id = conn.id;
    let message = match Message::classify(data) {
        Message::Blank => {
            sink.append(format!("Server: Client {id} sent empty or invalid message"));
            return;
        }
        Message::Quit => {
            sink.append(format!("Server: Client {id} sent: quit"));
            sink.append(format!("Server: Client {id} requested disconnect"));
            conn.close(CloseReason::Quit);
            return;
        }
        Message::Text(message) => message,
    };

    sink.append(format!(
        "Server: Client {id} sent: {}",
        String::from_utf8_lossy(message)
    ));

    let response = echo_response(id, message);
    let written = match timeout(settings.io_timeout, stream.write(&response)).await {
        Ok(result) => result,
        Err(_) => Err(io::ErrorKind::TimedOut.into()),
    };

    match written {
        Ok(n) if n < response.len() => {
            sink.append(format!(
                "Server: Client {id} partial send ({n}/{} bytes)",
                response.len()
            ));
        }
        Ok(n) => trace!(client = %id, bytes = n, "Response sent"),
        Err(e) => {
            sink.append(format!("Server: Client {id} send error: {e}"));
            let reason = if e.kind() == io::ErrorKind::TimedOut {
                CloseReason::Timeout
            } else {
                CloseReason::SendError
            };
            conn.close(reason);
        }
    }
}

/// Map a receive failure to the reason logged for it.
pub fn classify_recv_error(error: &io::Error) -> CloseReason {
    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CloseReason::Timeout,
        io::ErrorKind::ConnectionReset => CloseReason::ConnectionReset,
        _ => CloseReason::RecvError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::log_sink::CapturedLines;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    async fn counted(admission: &Admission) -> ConnectionSlot {
        admission.acquire().await.unwrap().admit().0
    }

    fn settings() -> HandlerSettings {
        HandlerSettings::default()
    }

    fn sink() -> (LogSink, CapturedLines) {
        LogSink::in_memory()
    }

    #[tokio::test]
    async fn test_echo_then_peer_close() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        let stream = Builder::new()
            .read(b"hello")
            .write(b"Echo from server to client #1: hello")
            .build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(1), slot, settings(), sink).await;

        assert_eq!(reason, CloseReason::PeerClosed);
        assert_eq!(admission.live(), 0);
        assert!(lines.contains("Server: Client #1 sent: hello"));
        assert!(lines.contains("Server: Client #1 closed connection gracefully"));
        assert!(lines.contains("Server: Client #1 handler terminated (Remaining clients: 0)"));
    }

    #[tokio::test]
    async fn test_same_message_twice() {
        let admission = Admission::new(100);
        let (sink, _) = sink();
        let stream = Builder::new()
            .read(b"ping")
            .write(b"Echo from server to client #9: ping")
            .read(b"ping")
            .write(b"Echo from server to client #9: ping")
            .build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(9), slot, settings(), sink).await;
        assert_eq!(reason, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_blank_message_is_discarded() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        // No write is scripted: any reply would fail the mock.
        let stream = Builder::new()
            .read(b"   ")
            .read(b"next")
            .write(b"Echo from server to client #2: next")
            .build();

        let slot = counted(&admission).await;
        serve_connection(stream, ConnectionId::new(2), slot, settings(), sink).await;
        assert!(lines.contains("Server: Client #2 sent empty or invalid message"));
    }

    #[tokio::test]
    async fn test_quit_closes_without_reply() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        let stream = Builder::new().read(b"quit").build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(3), slot, settings(), sink).await;

        assert_eq!(reason, CloseReason::Quit);
        assert_eq!(admission.live(), 0);
        assert!(lines.contains("Server: Client #3 requested disconnect"));
        assert!(!lines.contains("closed connection gracefully"));
    }

    #[tokio::test]
    async fn test_quit_is_case_sensitive() {
        let admission = Admission::new(100);
        let (sink, _) = sink();
        let stream = Builder::new()
            .read(b"QUIT")
            .write(b"Echo from server to client #4: QUIT")
            .build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(4), slot, settings(), sink).await;
        assert_eq!(reason, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_connection_reset() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        let stream = Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(5), slot, settings(), sink).await;

        assert_eq!(reason, CloseReason::ConnectionReset);
        assert_eq!(admission.live(), 0);
        assert!(lines.contains("Server: Client #5 connection reset by peer"));
    }

    #[tokio::test]
    async fn test_other_receive_error() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        let stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::Other, "boom"))
            .build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(6), slot, settings(), sink).await;

        assert_eq!(reason, CloseReason::RecvError);
        assert!(lines.contains("Server: Client #6 receive error: boom"));
    }

    #[tokio::test]
    async fn test_partial_send_is_logged_not_retried() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        // The mock accepts only the prefix, so the single write comes up short.
        let stream = Builder::new()
            .read(b"hello")
            .write(b"Echo from server to client #7: ")
            .build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(7), slot, settings(), sink).await;

        assert_eq!(reason, CloseReason::PeerClosed);
        assert!(lines.contains("Server: Client #7 partial send (31/36 bytes)"));
    }

    #[tokio::test]
    async fn test_send_failure_closes() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        let stream = Builder::new()
            .read(b"hello")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();

        let slot = counted(&admission).await;
        let reason = serve_connection(stream, ConnectionId::new(8), slot, settings(), sink).await;

        assert_eq!(reason, CloseReason::SendError);
        assert_eq!(admission.live(), 0);
        assert!(lines.contains("Server: Client #8 send error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let admission = Admission::new(100);
        let (sink, lines) = sink();
        let (server_side, _client_side) = duplex(1024);

        let slot = counted(&admission).await;
        assert_eq!(admission.live(), 1);
        let reason =
            serve_connection(server_side, ConnectionId::new(10), slot, settings(), sink).await;

        assert_eq!(reason, CloseReason::Timeout);
        assert_eq!(admission.live(), 0);
        assert!(lines.contains("Server: Client #10 connection timed out"));
        assert!(lines.contains("Remaining clients: 0"));
    }

    #[tokio::test]
    async fn test_read_is_bounded_by_buffer_size() {
        let admission = Admission::new(100);
        let (sink, _) = sink();
        let stream = Builder::new()
            .read(b"abcdef")
            .write(b"Echo from server to client #11: abcd")
            .write(b"Echo from server to client #11: ef")
            .build();

        let settings = HandlerSettings {
            buffer_size: 4,
            ..HandlerSettings::default()
        };
        let slot = counted(&admission).await;
        serve_connection(stream, ConnectionId::new(11), slot, settings, sink).await;
    }

    #[test]
    fn test_classify_recv_error() {
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let other = io::Error::from(io::ErrorKind::InvalidData);

        assert_eq!(classify_recv_error(&timed_out), CloseReason::Timeout);
        assert_eq!(classify_recv_error(&would_block), CloseReason::Timeout);
        assert_eq!(classify_recv_error(&reset), CloseReason::ConnectionReset);
        assert_eq!(classify_recv_error(&other), CloseReason::RecvError);
    }
}
