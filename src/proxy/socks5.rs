//! SOCKS5 client handshake (RFC 1928, no-auth subset)
//!
//! The connector interposes this two-step exchange before the first byte
//! of application traffic:
//!
//! ```text
//! -> [0x05, 0x01, 0x00]                      greeting: 1 method, no-auth
//! <- [0x05, 0x00]                            method accepted
//! -> [0x05, 0x01, 0x00, 0x03, len, host, port_be]  CONNECT, domain form
//! <- [0x05, 0x00, ...]                       second byte 0x00 = success
//! ```
//!
//! Only the no-auth method and domain-name addressing are spoken; the
//! target host always travels as a domain, never as an address literal.

use super::ProxyError;

/// SOCKS protocol version
const SOCKS_VERSION: u8 = 0x05;

/// No-authentication method id
const METHOD_NO_AUTH: u8 = 0x00;

/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

/// Domain-name address type
const ATYP_DOMAIN: u8 = 0x03;

/// Success reply code
const REPLY_SUCCEEDED: u8 = 0x00;

/// Handshake steps, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5Step {
    Greeting = 1,
    ConnectionRequest = 2,
}

impl std::fmt::Display for Socks5Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// What the driver should do after feeding proxy bytes to the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum Socks5Event {
    /// Reply incomplete, keep reading.
    NeedMoreData,
    /// Greeting accepted; transmit this connection request.
    SendConnectionRequest(Vec<u8>),
    /// Tunnel established; application traffic may flow.
    Established,
}

/// Build the client greeting: one offered method, no authentication.
pub fn greeting() -> [u8; 3] {
    [SOCKS_VERSION, 0x01, METHOD_NO_AUTH]
}

/// Build a CONNECT request for `host:port` in domain-name form.
pub fn connection_request(host: &str, port: u16) -> Result<Vec<u8>, ProxyError> {
    if host.len() > u8::MAX as usize {
        return Err(ProxyError::HostTooLong(host.len()));
    }
    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8]);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}

/// Two-step SOCKS5 client state machine.
///
/// Steps advance monotonically `Greeting -> ConnectionRequest -> done`;
/// an unexpected reply at either step is terminal. Replies are tiny (at
/// most 10 bytes for the forms we accept), so each step consumes whatever
/// has accumulated once the 2 decisive bytes are in; a reply split across
/// reads is tolerated by accumulation.
pub struct Socks5Handshake {
    step: Socks5Step,
    request: Vec<u8>,
    reply: Vec<u8>,
}

impl Socks5Handshake {
    /// Prepare a handshake that will request a tunnel to `host:port`.
    pub fn new(host: &str, port: u16) -> Result<Self, ProxyError> {
        Ok(Self {
            step: Socks5Step::Greeting,
            request: connection_request(host, port)?,
            reply: Vec::new(),
        })
    }

    /// Current step, for diagnostics.
    pub fn step(&self) -> Socks5Step {
        self.step
    }

    /// Feed proxy reply bytes and advance the machine.
    pub fn advance(&mut self, data: &[u8]) -> Result<Socks5Event, ProxyError> {
        self.reply.extend_from_slice(data);
        if self.reply.len() < 2 {
            return Ok(Socks5Event::NeedMoreData);
        }

        match self.step {
            Socks5Step::Greeting => {
                if self.reply[0] != SOCKS_VERSION || self.reply[1] != METHOD_NO_AUTH {
                    return Err(ProxyError::Rejected { step: self.step });
                }
                self.reply.clear();
                self.step = Socks5Step::ConnectionRequest;
                Ok(Socks5Event::SendConnectionRequest(self.request.clone()))
            }
            Socks5Step::ConnectionRequest => {
                if self.reply[1] != REPLY_SUCCEEDED {
                    return Err(ProxyError::Rejected { step: self.step });
                }
                self.reply.clear();
                Ok(Socks5Event::Established)
            }
        }
    }
}
