//! Interactive line-oriented client.
//!
//! Reads one line of local input at a time, sends it unframed, and waits
//! for exactly one response read. `quit` is sent and the client exits
//! without waiting for a reply.
//!
//! Lines that are empty or hold only spaces and tabs are never sent, not
//! just empty ones. The server drops such messages without a reply, so
//! sending them would leave the client blocked on the response read until
//! the server's deadline closes the connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tokio::net::TcpStream;

/// Largest response taken by one read.
pub const RESPONSE_BUFFER_SIZE: usize = 1024;

const QUIT: &str = "quit";

/// Client failures surfaced to the user.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to {addr} failed. Is the server running? ({source})")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How an interactive session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user typed `quit`.
    Quit,
    /// The server closed the connection or the response read failed.
    ServerDisconnected,
    /// Local input reached end of file.
    InputClosed,
}

/// A connected client session.
pub struct Client<S> {
    stream: S,
    response_timeout: Option<Duration>,
}

impl Client<TcpStream> {
    /// Connect to the echo server.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        Ok(Self::new(stream))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            response_timeout: None,
        }
    }

    /// Give up on a response after `timeout` and treat it as a disconnect.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Run the prompt loop until quit, disconnect, or end of input.
    pub async fn run<R, W>(
        &mut self,
        input: R,
        mut output: W,
    ) -> Result<SessionEnd, ClientError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut response = vec![0u8; RESPONSE_BUFFER_SIZE];

        output
            .write_all(b"Type messages to send (type 'quit' to exit):\n")
            .await?;

        loop {
            output.write_all(b"> ").await?;
            output.flush().await?;

            let Some(line) = lines.next_line().await? else {
                return Ok(SessionEnd::InputClosed);
            };
            let line = line.strip_suffix('\r').unwrap_or(&line);

            // The server never answers blank messages, so don't send them.
            if line.trim_matches([' ', '\t']).is_empty() {
                continue;
            }

            if let Err(e) = self.stream.write_all(line.as_bytes()).await {
                output
                    .write_all(format!("Client: Send failed: {e}\n").as_bytes())
                    .await?;
                return Ok(SessionEnd::ServerDisconnected);
            }

            if line == QUIT {
                output.write_all(b"Client: Disconnecting...\n").await?;
                output.flush().await?;
                return Ok(SessionEnd::Quit);
            }

            match self.read_response(&mut response).await {
                Some(n) => {
                    let text = String::from_utf8_lossy(&response[..n]);
                    output.write_all(format!("Client: {text}\n").as_bytes()).await?;
                }
                None => {
                    output.write_all(b"Client: Server disconnected\n").await?;
                    output.flush().await?;
                    return Ok(SessionEnd::ServerDisconnected);
                }
            }
        }
    }

    /// One read of the response; `None` on zero bytes, error, or timeout.
    async fn read_response(&mut self, buf: &mut [u8]) -> Option<usize> {
        let read = self.stream.read(buf);
        let result = match self.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read).await.ok()?,
            None => read.await,
        };
        match result {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        }
    }
}
