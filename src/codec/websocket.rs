//! WebSocket adapter seam
//!
//! The protocol sniff can divert a connection to WebSocket, but the
//! protocol internals themselves live outside this crate. What the codec
//! layer needs is an object with the same shape as the frame codec: an
//! incremental feed entry point plus the write / deliver / close / warn
//! surface of [`StreamSink`]. Anything with that shape plugs in via
//! [`crate::transport::Socket::set_websocket_adapter`].

use tracing::warn;

use super::StreamSink;

/// Incremental WebSocket endpoint.
///
/// `feed` receives raw connection bytes verbatim, starting with the HTTP
/// upgrade request that triggered the sniff. Implementations push handshake
/// responses and encoded frames through `sink.write_raw`, deliver decoded
/// message payloads through `sink.message`, and use `sink.close` /
/// `sink.warning` for termination and diagnostics.
pub trait WebSocketAdapter: Send {
    /// Consume raw inbound bytes.
    fn feed(&mut self, bytes: &[u8], sink: &mut dyn StreamSink);

    /// Encode and queue one outbound message.
    fn send(&mut self, msg: &[u8], sink: &mut dyn StreamSink);

    /// Begin an orderly close of the WebSocket stream.
    fn close(&mut self, sink: &mut dyn StreamSink);
}

/// Default adapter for endpoints built without WebSocket support.
///
/// Declines the connection: the first fed bytes produce a warning and a
/// close request.
#[derive(Debug, Default)]
pub struct DeclinedWebSocket {
    warned: bool,
}

impl WebSocketAdapter for DeclinedWebSocket {
    fn feed(&mut self, _bytes: &[u8], sink: &mut dyn StreamSink) {
        if !self.warned {
            self.warned = true;
            warn!("rejecting WebSocket client: no adapter installed");
            sink.warning("WebSocket connection declined: no adapter installed");
        }
        sink.close();
    }

    fn send(&mut self, _msg: &[u8], sink: &mut dyn StreamSink) {
        sink.warning("dropping outbound message: WebSocket connection declined");
    }

    fn close(&mut self, sink: &mut dyn StreamSink) {
        sink.close();
    }
}
