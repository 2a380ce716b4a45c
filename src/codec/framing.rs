//! Length-prefixed framing and the per-connection data handler
//!
//! Frame format:
//! ```text
//! +----------------+----------------------+
//! | Length (2B LE) |  Payload (Length B)  |
//! +----------------+----------------------+
//! ```
//!
//! The length prefix is little-endian and covers the payload only. Frames
//! with a declared length of zero are dropped. Frames whose declared length
//! exceeds [`MAX_FRAME_PAYLOAD`](super::MAX_FRAME_PAYLOAD) are a protocol
//! error and the connection is expected to close.

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, StreamSink, WebSocketAdapter, BUFFER_SIZE, HEAD_SIZE, MAX_FRAME_PAYLOAD};

/// Encode one message as a length-prefixed frame.
pub fn encode_frame(data: &[u8]) -> Result<Bytes, CodecError> {
    if data.len() > MAX_FRAME_PAYLOAD {
        return Err(CodecError::FrameTooLarge(data.len()));
    }
    let mut buf = BytesMut::with_capacity(HEAD_SIZE + data.len());
    buf.put_u16_le(data.len() as u16);
    buf.extend_from_slice(data);
    Ok(buf.freeze())
}

/// Stateful parser reassembling frames out of arbitrary stream chunks.
///
/// Chunks may split the length prefix or the payload at any byte boundary;
/// partial state is carried in an internal buffer between chunks. Complete
/// payloads are delivered in place whenever the chunk allows it.
pub struct FrameDecoder {
    got_head: bool,
    data_size: u16,
    carry: [u8; BUFFER_SIZE],
    carry_used: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            got_head: false,
            data_size: 0,
            carry: [0u8; BUFFER_SIZE],
            carry_used: 0,
        }
    }

    /// Consume one chunk, delivering every frame completed by it.
    ///
    /// Errors when a header declares a payload larger than
    /// [`MAX_FRAME_PAYLOAD`](super::MAX_FRAME_PAYLOAD); the stream is
    /// unrecoverable after that.
    pub fn feed(&mut self, chunk: &[u8], sink: &mut dyn StreamSink) -> Result<(), CodecError> {
        let mut begin = 0usize;
        while begin < chunk.len() {
            let chunk_remaining = chunk.len() - begin;
            if self.carry_used > 0 {
                if self.got_head {
                    // Completing a payload started in a previous chunk.
                    let data_remaining = self.data_size as usize - self.carry_used;
                    if data_remaining <= chunk_remaining {
                        self.carry[self.carry_used..self.data_size as usize]
                            .copy_from_slice(&chunk[begin..begin + data_remaining]);
                        sink.message(&self.carry[..self.data_size as usize]);
                        begin += data_remaining;
                        self.got_head = false;
                        self.data_size = 0;
                        self.carry_used = 0;
                    } else {
                        self.carry[self.carry_used..self.carry_used + chunk_remaining]
                            .copy_from_slice(&chunk[begin..]);
                        self.carry_used += chunk_remaining;
                        break;
                    }
                } else {
                    // Completing the 2-byte header; one byte is carried.
                    self.carry[self.carry_used] = chunk[begin];
                    begin += 1;
                    self.start_frame(u16::from_le_bytes([self.carry[0], self.carry[1]]))?;
                    self.carry_used = 0;
                }
            } else if !self.got_head && chunk_remaining >= HEAD_SIZE {
                self.start_frame(u16::from_le_bytes([chunk[begin], chunk[begin + 1]]))?;
                begin += HEAD_SIZE;
            } else if self.got_head && chunk_remaining >= self.data_size as usize {
                // Whole payload available, deliver in place.
                sink.message(&chunk[begin..begin + self.data_size as usize]);
                begin += self.data_size as usize;
                self.got_head = false;
                self.data_size = 0;
            } else {
                // Partial header or partial payload, stash and wait.
                self.carry[..chunk_remaining].copy_from_slice(&chunk[begin..]);
                self.carry_used = chunk_remaining;
                break;
            }
            // Empty frames carry no payload to wait for.
            if self.got_head && self.data_size == 0 {
                self.got_head = false;
            }
        }
        Ok(())
    }

    fn start_frame(&mut self, size: u16) -> Result<(), CodecError> {
        if size as usize > MAX_FRAME_PAYLOAD {
            return Err(CodecError::FrameTooLarge(size as usize));
        }
        self.data_size = size;
        self.got_head = true;
        Ok(())
    }
}

/// Per-connection inbound/outbound multiplexer.
///
/// On the very first chunk the handler decides between the length-prefixed
/// frame protocol and WebSocket: a chunk starting with the ASCII bytes
/// `GET` selects WebSocket, and the decision latches for the rest of the
/// connection. Outbound sends are length-prefixed on the frame path and
/// delegated to the adapter on the WebSocket path.
pub struct DataHandler {
    protocol_confirmed: bool,
    is_websocket: bool,
    decoder: FrameDecoder,
    websocket: Box<dyn WebSocketAdapter>,
}

impl DataHandler {
    pub fn new(websocket: Box<dyn WebSocketAdapter>) -> Self {
        Self {
            protocol_confirmed: false,
            is_websocket: false,
            decoder: FrameDecoder::new(),
            websocket,
        }
    }

    /// Whether the first-bytes probe selected WebSocket.
    pub fn is_websocket(&self) -> bool {
        self.is_websocket
    }

    /// Consume one inbound chunk.
    pub fn feed(&mut self, chunk: &[u8], sink: &mut dyn StreamSink) -> Result<(), CodecError> {
        if !self.protocol_confirmed {
            if chunk.len() >= 3 && &chunk[..3] == b"GET" {
                self.is_websocket = true;
            }
            self.protocol_confirmed = true;
        }

        if self.is_websocket {
            self.websocket.feed(chunk, sink);
            return Ok(());
        }
        self.decoder.feed(chunk, sink)
    }

    /// Queue one outbound message on the active protocol path.
    pub fn send(&mut self, msg: &[u8], sink: &mut dyn StreamSink) -> Result<(), CodecError> {
        if self.is_websocket {
            self.websocket.send(msg, sink);
            return Ok(());
        }
        sink.write_raw(&encode_frame(msg)?);
        Ok(())
    }

    /// Close the active protocol path.
    pub fn close(&mut self, sink: &mut dyn StreamSink) {
        if self.is_websocket {
            self.websocket.close(sink);
        } else {
            sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectSink {
        raw: Vec<Vec<u8>>,
        messages: Vec<Vec<u8>>,
        closed: bool,
        warnings: Vec<String>,
    }

    impl StreamSink for CollectSink {
        fn write_raw(&mut self, data: &[u8]) {
            self.raw.push(data.to_vec());
        }
        fn message(&mut self, data: &[u8]) {
            self.messages.push(data.to_vec());
        }
        fn close(&mut self) {
            self.closed = true;
        }
        fn warning(&mut self, text: &str) {
            self.warnings.push(text.to_string());
        }
    }

    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingAdapter {
        fed: Arc<Mutex<Vec<u8>>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingAdapter {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>, Arc<Mutex<Vec<Vec<u8>>>>) {
            let adapter = Self::default();
            let fed = adapter.fed.clone();
            let sent = adapter.sent.clone();
            (adapter, fed, sent)
        }
    }

    impl WebSocketAdapter for RecordingAdapter {
        fn feed(&mut self, bytes: &[u8], _sink: &mut dyn StreamSink) {
            self.fed.lock().unwrap().extend_from_slice(bytes);
        }
        fn send(&mut self, msg: &[u8], _sink: &mut dyn StreamSink) {
            self.sent.lock().unwrap().push(msg.to_vec());
        }
        fn close(&mut self, sink: &mut dyn StreamSink) {
            sink.close();
        }
    }

    fn feed_all(decoder: &mut FrameDecoder, chunks: &[&[u8]]) -> CollectSink {
        let mut sink = CollectSink::default();
        for chunk in chunks {
            decoder.feed(chunk, &mut sink).unwrap();
        }
        sink
    }

    #[test]
    fn test_single_short_frame() {
        let mut decoder = FrameDecoder::new();
        let sink = feed_all(&mut decoder, &[&[0x03, 0x00, 0x41, 0x42, 0x43]]);
        assert_eq!(sink.messages, vec![b"ABC".to_vec()]);
    }

    #[test]
    fn test_split_header() {
        let mut decoder = FrameDecoder::new();
        let sink = feed_all(&mut decoder, &[&[0x03], &[0x00, 0x41, 0x42, 0x43]]);
        assert_eq!(sink.messages, vec![b"ABC".to_vec()]);
    }

    #[test]
    fn test_split_payload() {
        let mut decoder = FrameDecoder::new();
        let sink = feed_all(
            &mut decoder,
            &[&[0x05, 0x00, 0x41, 0x42], &[0x43, 0x44, 0x45]],
        );
        assert_eq!(sink.messages, vec![b"ABCDE".to_vec()]);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let sink = feed_all(&mut decoder, &[&[0x01, 0x00, 0x58, 0x02, 0x00, 0x59, 0x5A]]);
        assert_eq!(sink.messages, vec![b"X".to_vec(), b"YZ".to_vec()]);
    }

    #[test]
    fn test_empty_payload_dropped() {
        let mut decoder = FrameDecoder::new();
        let sink = feed_all(&mut decoder, &[&[0x00, 0x00]]);
        assert!(sink.messages.is_empty());

        // Parser is ready for a new header afterwards.
        let sink = feed_all(&mut decoder, &[&[0x01, 0x00, 0x58]]);
        assert_eq!(sink.messages, vec![b"X".to_vec()]);
    }

    #[test]
    fn test_empty_frame_between_frames() {
        let mut decoder = FrameDecoder::new();
        let sink = feed_all(
            &mut decoder,
            &[&[0x01, 0x00, 0x58, 0x00, 0x00, 0x02, 0x00, 0x59, 0x5A]],
        );
        assert_eq!(sink.messages, vec![b"X".to_vec(), b"YZ".to_vec()]);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut sink = CollectSink::default();
        // 4095 > MAX_FRAME_PAYLOAD
        let header = (MAX_FRAME_PAYLOAD as u16 + 1).to_le_bytes();
        let err = decoder.feed(&header, &mut sink).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(4095)));
    }

    #[test]
    fn test_max_size_frame_accepted() {
        let payload = vec![0xA5u8; MAX_FRAME_PAYLOAD];
        let frame = encode_frame(&payload).unwrap();
        let mut decoder = FrameDecoder::new();
        let sink = feed_all(&mut decoder, &[&frame]);
        assert_eq!(sink.messages, vec![payload]);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let frame = encode_frame(&[0u8; 0x0201]).unwrap();
        assert_eq!(&frame[..HEAD_SIZE], &[0x01, 0x02]);
    }

    #[test]
    fn test_round_trip_every_split_boundary() {
        let messages: Vec<Vec<u8>> = vec![
            b"A".to_vec(),
            b"BB".to_vec(),
            (0..=255u8).collect(),
            b"hello world".to_vec(),
            vec![0x00; 300],
        ];
        let mut wire = Vec::new();
        for m in &messages {
            wire.extend_from_slice(&encode_frame(m).unwrap());
        }

        for split in 1..wire.len() {
            let mut decoder = FrameDecoder::new();
            let sink = feed_all(&mut decoder, &[&wire[..split], &wire[split..]]);
            assert_eq!(sink.messages, messages, "split at byte {split}");
        }
    }

    #[test]
    fn test_round_trip_byte_at_a_time() {
        let messages: Vec<Vec<u8>> = vec![b"xyz".to_vec(), vec![0x7F; 1000], b"q".to_vec()];
        let mut wire = Vec::new();
        for m in &messages {
            wire.extend_from_slice(&encode_frame(m).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let mut sink = CollectSink::default();
        for byte in &wire {
            decoder.feed(std::slice::from_ref(byte), &mut sink).unwrap();
        }
        assert_eq!(sink.messages, messages);
    }

    #[test]
    fn test_websocket_sniff_forwards_verbatim() {
        let (adapter, fed, _) = RecordingAdapter::new();
        let mut handler = DataHandler::new(Box::new(adapter));
        let mut sink = CollectSink::default();

        handler.feed(b"GET / HTTP/1.1\r\n", &mut sink).unwrap();
        handler
            .feed(&[0x03, 0x00, 0x41, 0x42, 0x43], &mut sink)
            .unwrap();

        assert!(handler.is_websocket());
        assert!(sink.messages.is_empty());
        let mut expected = b"GET / HTTP/1.1\r\n".to_vec();
        expected.extend_from_slice(&[0x03, 0x00, 0x41, 0x42, 0x43]);
        assert_eq!(*fed.lock().unwrap(), expected);
    }

    #[test]
    fn test_sniff_latches_on_frame_protocol() {
        let (adapter, fed, _) = RecordingAdapter::new();
        let mut handler = DataHandler::new(Box::new(adapter));
        let mut sink = CollectSink::default();

        // A two-byte first chunk is not "GET", so the frame path latches.
        handler.feed(&[0x47, 0x45], &mut sink).unwrap();
        // "T\x00" would complete "GET" if the probe re-ran; it must not.
        handler.feed(&[0x54, 0x00], &mut sink).unwrap();
        assert!(!handler.is_websocket());
        assert!(fed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_on_frame_path_prefixes_length() {
        let (adapter, _, _) = RecordingAdapter::new();
        let mut handler = DataHandler::new(Box::new(adapter));
        let mut sink = CollectSink::default();
        handler.send(b"ABC", &mut sink).unwrap();
        assert_eq!(sink.raw, vec![vec![0x03, 0x00, 0x41, 0x42, 0x43]]);
    }

    #[test]
    fn test_send_on_websocket_path_delegates() {
        let (adapter, _, sent) = RecordingAdapter::new();
        let mut handler = DataHandler::new(Box::new(adapter));
        let mut sink = CollectSink::default();
        handler.feed(b"GET /game HTTP/1.1\r\n", &mut sink).unwrap();
        handler.send(b"reply", &mut sink).unwrap();
        // Nothing on the raw path; the adapter owns WebSocket encoding.
        assert!(sink.raw.is_empty());
        assert_eq!(*sent.lock().unwrap(), vec![b"reply".to_vec()]);
    }
}
