//! Session layer - typed packet dispatch over a transport
//!
//! Provides:
//! - The `Packet` trait: a one-byte tag plus self-describing payload,
//!   encoded and decoded with the connection's crypt key
//! - `Connection`: per-tag handler registration and dispatch, lifecycle
//!   system messages, crypt key storage

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::transport::Transport;

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("packet truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("packet decode failed: {0}")]
    Decode(String),
}

/// An application message the session layer can route.
///
/// `TAG` must be unique across every packet variant registered on a
/// connection. `encode` produces the payload without the tag; the
/// connection prepends it, so tag and handler can never disagree. Both
/// directions receive the connection's current crypt key (empty when the
/// session is unencrypted); how a packet uses it is its own business.
pub trait Packet: Sized {
    /// One-byte discriminator, unique per packet variant.
    const TAG: u8;

    /// Serialize the payload with the given crypt key.
    fn encode(&self, key: &str) -> Vec<u8>;

    /// Deserialize from a payload (tag already stripped).
    fn decode(payload: &[u8], key: &str) -> Result<Self, SessionError>;
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    Open,
    Close,
    /// The peer's session has terminated.
    Terminated,
    /// End of data, flush buffered packets.
    Eod,
}

const SYSTEM_MESSAGE_COUNT: usize = 4;

type PacketThunk = Box<dyn FnMut(&[u8], &str) + Send>;
type SystemHandler = Box<dyn FnMut() + Send>;

/// Typed packet dispatcher bound to a transport.
///
/// Inbound messages route by their first byte to the matching registered
/// handler; messages with no handler are dropped. Outbound packets are
/// encoded with the current crypt key and handed to the transport.
pub struct Connection<T: Transport> {
    transport: T,
    handlers: HashMap<u8, PacketThunk>,
    system_handlers: [Option<SystemHandler>; SYSTEM_MESSAGE_COUNT],
    crypt_key: String,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            handlers: HashMap::new(),
            system_handlers: [None, None, None, None],
            crypt_key: String::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register `h` for packets tagged `M::TAG`. The handler receives the
    /// decoded packet; payloads that fail to decode are dropped with a
    /// warning. Registering a second handler for the same tag replaces the
    /// first.
    pub fn register_handler<M, F>(&mut self, mut h: F)
    where
        M: Packet + 'static,
        F: FnMut(M) + Send + 'static,
    {
        let thunk: PacketThunk = Box::new(move |payload, key| match M::decode(payload, key) {
            Ok(packet) => h(packet),
            Err(e) => warn!("dropping undecodable packet with tag {}: {e}", M::TAG),
        });
        if self.handlers.insert(M::TAG, thunk).is_some() {
            debug!("replacing handler for packet tag {}", M::TAG);
        }
    }

    /// Register `h` for one lifecycle message.
    pub fn register_system_handler(&mut self, m: SystemMessage, h: impl FnMut() + Send + 'static) {
        self.system_handlers[m as usize] = Some(Box::new(h));
    }

    /// Encode `p` with the current crypt key and queue it for
    /// transmission.
    pub fn send_packet<M: Packet>(&self, p: &M) {
        let payload = p.encode(&self.crypt_key);
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(M::TAG);
        buf.extend_from_slice(&payload);
        self.transport.send(&buf);
    }

    /// Route one inbound message by its tag. Unknown tags drop silently.
    pub fn dispatch(&mut self, data: &[u8]) {
        let Some((&tag, payload)) = data.split_first() else {
            trace!("dropping empty message");
            return;
        };
        match self.handlers.get_mut(&tag) {
            Some(thunk) => thunk(payload, &self.crypt_key),
            None => trace!("dropping packet with unregistered tag {tag}"),
        }
    }

    /// Invoke the handler for `m`, if one is registered.
    pub fn dispatch_system(&mut self, m: SystemMessage) {
        if let Some(handler) = &mut self.system_handlers[m as usize] {
            handler();
        }
    }

    pub fn open(&self) {
        self.transport.open();
    }

    pub fn close(&self) {
        self.transport.close();
    }

    /// Handlers registered after this call decode with the new key.
    pub fn set_crypt_key(&mut self, key: String) {
        self.crypt_key = key;
    }

    pub fn crypt_key(&self) -> &str {
        &self.crypt_key
    }

    pub fn encrypted(&self) -> bool {
        !self.crypt_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        opened: Arc<Mutex<usize>>,
        closed: Arc<Mutex<usize>>,
    }

    impl Transport for FakeTransport {
        fn open(&self) {
            *self.opened.lock().unwrap() += 1;
        }
        fn close(&self) {
            *self.closed.lock().unwrap() += 1;
        }
        fn send(&self, msg: &[u8]) {
            self.sent.lock().unwrap().push(msg.to_vec());
        }
    }

    #[derive(Debug, PartialEq)]
    struct Hello {
        name: String,
    }

    impl Packet for Hello {
        const TAG: u8 = 0x01;

        fn encode(&self, _key: &str) -> Vec<u8> {
            self.name.as_bytes().to_vec()
        }

        fn decode(payload: &[u8], _key: &str) -> Result<Self, SessionError> {
            Ok(Self {
                name: String::from_utf8_lossy(payload).into_owned(),
            })
        }
    }

    struct Keyed {
        key_seen: String,
    }

    impl Packet for Keyed {
        const TAG: u8 = 0x02;

        fn encode(&self, key: &str) -> Vec<u8> {
            key.as_bytes().to_vec()
        }

        fn decode(_payload: &[u8], key: &str) -> Result<Self, SessionError> {
            Ok(Self {
                key_seen: key.to_string(),
            })
        }
    }

    struct Broken;

    impl Packet for Broken {
        const TAG: u8 = 0x03;

        fn encode(&self, _key: &str) -> Vec<u8> {
            Vec::new()
        }

        fn decode(_payload: &[u8], _key: &str) -> Result<Self, SessionError> {
            Err(SessionError::Decode("always fails".to_string()))
        }
    }

    #[test]
    fn test_send_packet_prepends_tag() {
        let transport = FakeTransport::default();
        let sent = transport.sent.clone();
        let conn = Connection::new(transport);

        conn.send_packet(&Hello {
            name: "ada".to_string(),
        });

        assert_eq!(sent.lock().unwrap()[0], b"\x01ada");
    }

    #[test]
    fn test_dispatch_routes_by_tag() {
        let mut conn = Connection::new(FakeTransport::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        conn.register_handler::<Hello, _>(move |p| {
            r.lock().unwrap().push(p.name);
        });

        conn.dispatch(b"\x01grace");
        conn.dispatch(b"\x7fignored");
        conn.dispatch(b"");

        assert_eq!(*received.lock().unwrap(), vec!["grace".to_string()]);
    }

    #[test]
    fn test_last_registration_wins() {
        let mut conn = Connection::new(FakeTransport::default());
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h = hits.clone();
        conn.register_handler::<Hello, _>(move |_| h.lock().unwrap().push("first"));
        let h = hits.clone();
        conn.register_handler::<Hello, _>(move |_| h.lock().unwrap().push("second"));

        conn.dispatch(b"\x01x");
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn test_handlers_see_current_crypt_key() {
        let mut conn = Connection::new(FakeTransport::default());
        let seen = Arc::new(Mutex::new(String::new()));
        let s = seen.clone();
        conn.register_handler::<Keyed, _>(move |p| {
            *s.lock().unwrap() = p.key_seen;
        });

        assert!(!conn.encrypted());
        conn.set_crypt_key("sesame".to_string());
        assert!(conn.encrypted());

        conn.dispatch(b"\x02");
        assert_eq!(*seen.lock().unwrap(), "sesame");
    }

    #[test]
    fn test_undecodable_packet_dropped() {
        let mut conn = Connection::new(FakeTransport::default());
        let hits = Arc::new(Mutex::new(0usize));
        let h = hits.clone();
        conn.register_handler::<Broken, _>(move |_| {
            *h.lock().unwrap() += 1;
        });

        conn.dispatch(b"\x03payload");
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_system_handlers() {
        let mut conn = Connection::new(FakeTransport::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        conn.register_system_handler(SystemMessage::Open, move || {
            l.lock().unwrap().push("open");
        });
        let l = log.clone();
        conn.register_system_handler(SystemMessage::Eod, move || {
            l.lock().unwrap().push("eod");
        });

        conn.dispatch_system(SystemMessage::Open);
        conn.dispatch_system(SystemMessage::Close); // unregistered, no-op
        conn.dispatch_system(SystemMessage::Eod);

        assert_eq!(*log.lock().unwrap(), vec!["open", "eod"]);
    }
}
