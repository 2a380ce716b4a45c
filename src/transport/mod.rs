//! Transport layer
//!
//! Provides:
//! - `Socket`: a TCP endpoint driven by its own task, with thread-safe
//!   write/open/close and hook-based delivery
//! - `ConnectorSocket`: outbound connections with optional SOCKS5 prelude
//! - `ServerListener`: inbound connections handed out as fresh sockets

mod connector;
mod hooks;
mod listener;
mod socket;

pub use connector::ConnectorSocket;
pub use listener::ServerListener;
pub use socket::Socket;

use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address resolution failed: {0}")]
    Resolve(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Socks5(#[from] crate::proxy::ProxyError),

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,
}

/// Capability seam between the session layer and a concrete endpoint.
///
/// All three operations enqueue work and return promptly; they are safe to
/// call from any thread. `Socket` and `ConnectorSocket` implement this, and
/// tests substitute in-memory fakes.
pub trait Transport: Send {
    /// Begin reading and delivering messages.
    fn open(&self);

    /// Tear the connection down. Idempotent.
    fn close(&self);

    /// Queue one complete message for transmission.
    fn send(&self, msg: &[u8]);
}
