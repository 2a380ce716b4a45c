//! Codec layer - message reassembly over a byte stream
//!
//! Provides:
//! - Length-prefixed frame encoding/decoding with carry-over across chunks
//! - One-shot protocol sniff (length-prefixed framing vs WebSocket)
//! - The `StreamSink` interface connecting codecs to the transport

mod framing;
mod websocket;

pub use framing::{encode_frame, DataHandler, FrameDecoder};
pub use websocket::{DeclinedWebSocket, WebSocketAdapter};

use thiserror::Error;

/// Upper bound on a single read chunk and on the carry-over buffer.
pub const BUFFER_SIZE: usize = 4096;

/// Size of the length prefix on the wire.
pub const HEAD_SIZE: usize = 2;

/// Maximum payload of a single frame.
pub const MAX_FRAME_PAYLOAD: usize = BUFFER_SIZE - HEAD_SIZE;

/// Codec layer errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes exceeds the {} byte limit", MAX_FRAME_PAYLOAD)]
    FrameTooLarge(usize),
}

/// Where codec output goes.
///
/// A codec pushes raw bytes toward the wire, delivers complete messages
/// upward, and can request a close or surface a warning. The transport
/// driver implements this; tests substitute recording sinks.
pub trait StreamSink {
    /// Queue already-encoded bytes for transmission.
    fn write_raw(&mut self, data: &[u8]);

    /// Deliver one complete inbound message.
    ///
    /// The slice is only valid for the duration of the call; implementations
    /// must copy if they retain.
    fn message(&mut self, data: &[u8]);

    /// Request that the connection be closed.
    fn close(&mut self);

    /// Surface a non-fatal protocol warning.
    fn warning(&mut self, text: &str);
}
