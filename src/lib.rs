//! linesock
//!
//! A minimal line-oriented TCP connection abstraction and a companion
//! listening server.
//!
//! [`Connection`] wraps one established stream: a background task reads
//! newline-terminated UTF-8 lines into an ordered queue, writes are
//! serialized and flushed immediately, and closure converges on a single
//! closed state whether requested explicitly or detected from the peer.
//! [`LineServer`] accepts connections, registers them, purges dead entries
//! on a configurable cadence, and notifies the owner of connect and
//! disconnect events on fire-and-forget tasks.
//!
//! Out of scope by design: framing beyond newline-delimited text, stream
//! multiplexing, authentication, and write back-pressure.

pub mod config;
pub mod connection;
pub mod server;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionError, ConnectionHooks};
pub use server::{LineServer, ServerEventHandler};

/// Common result type for the crate
pub type Result<T> = anyhow::Result<T>;
