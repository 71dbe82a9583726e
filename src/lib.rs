//! echo-relay: a multi-client TCP echo service
//!
//! Components:
//! - `server`: listener, admission control and handler dispatch
//! - `handler`: one task per connection (receive, validate, respond)
//! - `log_sink`: serialized diagnostic output shared by all handlers
//! - `client`: interactive line-oriented client
//!
//! Wire protocol: unframed text, one read is one message. The server
//! replies `Echo from server to client #<id>: <message>`, ignores blank
//! messages, and closes the connection on `quit`.

pub mod admission;
pub mod client;
pub mod config;
pub mod connection;
pub mod handler;
pub mod log_sink;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use log_sink::LogSink;
pub use server::{Server, ServerReport, StartupError};
pub use shutdown::ShutdownHandle;
