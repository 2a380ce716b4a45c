//! Proxy support
//!
//! Provides the outbound SOCKS5 prelude used by the connector.

mod socks5;

pub use socks5::{connection_request, greeting, Socks5Event, Socks5Handshake, Socks5Step};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("SOCKS5 request failed at step: {step}")]
    Rejected { step: Socks5Step },

    #[error("SOCKS5 target host too long: {0} bytes")]
    HostTooLong(usize),
}
