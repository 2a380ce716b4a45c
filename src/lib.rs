//! # Netplay
//!
//! Networking substrate for a multiplayer game client/server.
//!
//! ## Features
//!
//! - **Length-prefixed framing** that reassembles messages out of arbitrary
//!   TCP chunks, including header/body splits across chunk boundaries
//! - **WebSocket fallback** on the same port, chosen per connection by
//!   sniffing the first bytes
//! - **SOCKS5 outbound** that transparently interposes before the first
//!   byte of application traffic
//! - **Typed packet dispatch** keyed by a one-byte tag, plus lifecycle
//!   system messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                    │
//! │          (game packets, typed handlers)              │
//! ├─────────────────────────────────────────────────────┤
//! │                 Session Layer                        │
//! │     (packet dispatch, system messages, crypt key)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Codec Layer                          │
//! │    (frame reassembly, protocol sniff, WebSocket)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                      │
//! │   (socket driver, connector, listener, SOCKS5)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod address;
pub mod codec;
pub mod config;
pub mod proxy;
pub mod session;
pub mod transport;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Address error: {0}")]
    Address(#[from] address::AddressError),

    #[error("Configuration error: {0}")]
    Config(String),
}
