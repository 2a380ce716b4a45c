//! TCP socket driven by its own task
//!
//! A `Socket` is a cheap handle onto a driver task that exclusively owns
//! the TCP stream. `write`, `send`, `open` and `close` enqueue commands on
//! an unbounded FIFO and return promptly, so they are safe from any
//! thread; hooks fire from the driver task. The driver keeps the socket
//! alive until its close sequence completes, so an accepted socket whose
//! handle is dropped keeps running until the connection ends.
//!
//! Lifecycle: `initialized -> open -> closing -> closed`. Writes queued
//! before `open` are held and flushed once the socket opens; writes queued
//! after close are dropped. Exactly one close hook fires, no matter how
//! many close requests race.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::codec::{DataHandler, DeclinedWebSocket, StreamSink, WebSocketAdapter, BUFFER_SIZE};

use super::hooks::SharedHooks;
use super::Transport;

enum Command {
    Write(Bytes),
    Send(Bytes),
    Open,
    Shutdown,
    Close,
}

/// Handle onto a connection's driver task.
pub struct Socket {
    cmd_tx: mpsc::UnboundedSender<Command>,
    hooks: SharedHooks,
    write_queue_len: Arc<AtomicUsize>,
    peer: Option<SocketAddr>,
}

impl Clone for Socket {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            hooks: self.hooks.clone(),
            write_queue_len: self.write_queue_len.clone(),
            peer: self.peer,
        }
    }
}

impl Socket {
    /// Wrap a connected stream. Must be called within a Tokio runtime; the
    /// driver task spawns immediately but stays idle until [`open`](Self::open).
    pub fn from_stream(stream: TcpStream) -> Self {
        Self::spawn(stream, SharedHooks::default())
    }

    pub(crate) fn spawn(stream: TcpStream, hooks: SharedHooks) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let write_queue_len = Arc::new(AtomicUsize::new(0));
        let peer = stream.peer_addr().ok();

        let driver = Driver {
            stream,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            hooks: hooks.clone(),
            write_queue_len: write_queue_len.clone(),
            peer,
        };
        tokio::spawn(driver.run());

        Self {
            cmd_tx,
            hooks,
            write_queue_len,
            peer,
        }
    }

    /// Deliver raw inbound bytes to `f` instead of the data handler.
    pub fn on_data(&self, f: impl FnMut(&[u8]) + Send + 'static) {
        self.hooks.set_data(Box::new(f));
    }

    /// Restore normal message parsing after [`on_data`](Self::on_data).
    pub fn clear_on_data(&self) {
        self.hooks.clear_data();
    }

    /// Called with each complete inbound message.
    pub fn on_message(&self, f: impl FnMut(&[u8]) + Send + 'static) {
        self.hooks.set_message(Box::new(f));
    }

    /// Called once the socket starts reading.
    pub fn on_open(&self, f: impl FnMut() + Send + 'static) {
        self.hooks.set_open(Box::new(f));
    }

    /// Called exactly once when the connection has fully closed.
    pub fn on_close(&self, f: impl FnMut() + Send + 'static) {
        self.hooks.set_close(Box::new(f));
    }

    pub fn on_info(&self, f: impl FnMut(&str) + Send + 'static) {
        self.hooks.set_info(Box::new(f));
    }

    pub fn on_warning(&self, f: impl FnMut(&str) + Send + 'static) {
        self.hooks.set_warning(Box::new(f));
    }

    /// Close the connection after this much read inactivity. Must be set
    /// before [`open`](Self::open); `None` disables the timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.hooks.set_read_timeout(timeout);
    }

    /// Install the WebSocket endpoint used when the protocol sniff selects
    /// WebSocket. Must be set before [`open`](Self::open).
    pub fn set_websocket_adapter(&self, adapter: Box<dyn WebSocketAdapter>) {
        self.hooks.set_websocket(adapter);
    }

    /// Queue raw bytes, bypassing message framing.
    pub fn write(&self, data: &[u8]) {
        let _ = self.cmd_tx.send(Command::Write(Bytes::copy_from_slice(data)));
    }

    /// Queue one message on the connection's protocol path.
    pub fn send(&self, msg: &[u8]) {
        let _ = self.cmd_tx.send(Command::Send(Bytes::copy_from_slice(msg)));
    }

    /// Start reading. Hooks registered before this call are guaranteed to
    /// observe every message.
    pub fn open(&self) {
        let _ = self.cmd_tx.send(Command::Open);
    }

    /// Close the protocol stream politely: a WebSocket connection gets
    /// its close exchange, the frame path tears down directly.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Request teardown. Idempotent and safe from any thread; queued
    /// writes that have not reached the wire are dropped.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Buffers accepted but not yet written. Callers wanting backpressure
    /// watch this and self-throttle.
    pub fn write_queue_len(&self) -> usize {
        self.write_queue_len.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Transport for Socket {
    fn open(&self) {
        Socket::open(self);
    }
    fn close(&self) {
        Socket::close(self);
    }
    fn send(&self, msg: &[u8]) {
        Socket::send(self, msg);
    }
}

fn peer_text(peer: Option<SocketAddr>) -> String {
    match peer {
        Some(addr) => format!("{} {}", addr.ip(), addr.port()),
        None => "unknown".to_string(),
    }
}

/// Everything the connection owns, moved into its task.
struct Driver {
    stream: TcpStream,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    // Held so internal failure paths can request close through the same
    // FIFO the handles use. Also pins the channel open for the lifetime of
    // the connection.
    cmd_tx: mpsc::UnboundedSender<Command>,
    hooks: SharedHooks,
    write_queue_len: Arc<AtomicUsize>,
    peer: Option<SocketAddr>,
}

impl Driver {
    async fn run(mut self) {
        // Initialized but not reading: hold outbound traffic until open.
        let mut deferred: Vec<Command> = Vec::new();
        loop {
            match self.cmd_rx.recv().await {
                Some(Command::Open) => break,
                Some(Command::Shutdown) | Some(Command::Close) | None => {
                    self.hooks.close();
                    return;
                }
                Some(cmd) => deferred.push(cmd),
            }
        }
        self.open_loop(deferred).await;
    }

    async fn open_loop(self, deferred: Vec<Command>) {
        let Driver {
            stream,
            mut cmd_rx,
            cmd_tx,
            hooks,
            write_queue_len,
            peer,
        } = self;

        let read_timeout = hooks.read_timeout();
        let adapter = hooks
            .take_websocket()
            .unwrap_or_else(|| Box::new(DeclinedWebSocket::default()));
        let mut handler = DataHandler::new(adapter);

        let (mut rd, wr) = stream.into_split();
        let (wire_tx, wire_rx) = mpsc::unbounded_channel::<Bytes>();
        let (stop_tx, stop_rx) = watch::channel(false);
        let writer = tokio::spawn(write_loop(
            wr,
            wire_rx,
            stop_rx,
            write_queue_len.clone(),
            cmd_tx.clone(),
        ));

        let info = format!("Created a connection from: {}", peer_text(peer));
        debug!("{info}");
        hooks.info(&info);
        hooks.open();

        let mut close_now = false;
        for cmd in deferred {
            if handle_outbound(cmd, &mut handler, &hooks, &wire_tx, &write_queue_len) {
                close_now = true;
                break;
            }
        }

        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut last_read = Instant::now();
        while !close_now {
            let deadline = read_timeout.map(|t| last_read + t);
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Open) => {} // spurious reopen, ignore
                    Some(Command::Close) | None => break,
                    Some(cmd) => {
                        if handle_outbound(cmd, &mut handler, &hooks, &wire_tx, &write_queue_len) {
                            break;
                        }
                    }
                },
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        debug!("connection closed by peer: {}", peer_text(peer));
                        break;
                    }
                    Ok(n) => {
                        last_read = Instant::now();
                        if deliver(&buf[..n], &mut handler, &hooks, &wire_tx, &write_queue_len) {
                            break;
                        }
                    }
                    Err(e) => {
                        let text = format!("Read failed: {e}");
                        warn!("{text}");
                        hooks.warning(&text);
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let text = "Read timed out".to_string();
                    warn!("{text}");
                    hooks.warning(&text);
                    break;
                }
            }
        }

        // Closing: stop the writer, drop whatever it had not written yet.
        let _ = stop_tx.send(true);
        drop(wire_tx);
        let _ = writer.await;
        write_queue_len.store(0, Ordering::SeqCst);

        let info = format!("Closing connection: {}", peer_text(peer));
        debug!("{info}");
        hooks.info(&info);
        hooks.close();
        // Dropping the driver releases the stream halves; nothing outlives
        // the close hook.
    }
}

/// Returns true when the connection should close.
fn handle_outbound(
    cmd: Command,
    handler: &mut DataHandler,
    hooks: &SharedHooks,
    wire_tx: &mpsc::UnboundedSender<Bytes>,
    write_queue_len: &AtomicUsize,
) -> bool {
    let mut sink = DriverSink {
        hooks,
        wire_tx,
        write_queue_len,
        close_requested: false,
    };
    match cmd {
        Command::Write(data) => {
            sink.push(data);
            false
        }
        Command::Send(msg) => {
            if let Err(e) = handler.send(&msg, &mut sink) {
                let text = e.to_string();
                warn!("dropping outbound message: {text}");
                hooks.warning(&text);
            }
            sink.close_requested
        }
        Command::Shutdown => {
            handler.close(&mut sink);
            sink.close_requested
        }
        Command::Open | Command::Close => false,
    }
}

/// Returns true when the connection should close.
fn deliver(
    chunk: &[u8],
    handler: &mut DataHandler,
    hooks: &SharedHooks,
    wire_tx: &mpsc::UnboundedSender<Bytes>,
    write_queue_len: &AtomicUsize,
) -> bool {
    if hooks.has_data_hook() {
        hooks.data(chunk);
        return false;
    }

    let mut sink = DriverSink {
        hooks,
        wire_tx,
        write_queue_len,
        close_requested: false,
    };
    match handler.feed(chunk, &mut sink) {
        Ok(()) => sink.close_requested,
        Err(e) => {
            let text = e.to_string();
            warn!("{text}");
            hooks.warning(&text);
            true
        }
    }
}

struct DriverSink<'a> {
    hooks: &'a SharedHooks,
    wire_tx: &'a mpsc::UnboundedSender<Bytes>,
    write_queue_len: &'a AtomicUsize,
    close_requested: bool,
}

impl DriverSink<'_> {
    fn push(&mut self, data: Bytes) {
        self.write_queue_len.fetch_add(1, Ordering::SeqCst);
        let _ = self.wire_tx.send(data);
    }
}

impl StreamSink for DriverSink<'_> {
    fn write_raw(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    fn message(&mut self, data: &[u8]) {
        self.hooks.message(data);
    }

    fn close(&mut self) {
        self.close_requested = true;
    }

    fn warning(&mut self, text: &str) {
        warn!("{text}");
        self.hooks.warning(text);
    }
}

/// One write in flight at a time, buffers transmitted in queue order.
async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut wire_rx: mpsc::UnboundedReceiver<Bytes>,
    mut stop_rx: watch::Receiver<bool>,
    write_queue_len: Arc<AtomicUsize>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            item = wire_rx.recv() => match item {
                Some(data) => {
                    if let Err(e) = wr.write_all(&data).await {
                        debug!("write failed: {e}");
                        let _ = cmd_tx.send(Command::Close);
                        break;
                    }
                    write_queue_len.fetch_sub(1, Ordering::SeqCst);
                }
                None => break,
            }
        }
    }
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_framed_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(&[0x03, 0x00, b'A', b'B', b'C']).await.unwrap();
            let mut buf = [0u8; 64];
            let n = peer.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let socket = Socket::from_stream(stream);
        let (tx, mut rx) = mpsc::unbounded_channel();
        socket.on_message(move |m| {
            let _ = tx.send(m.to_vec());
        });
        socket.open();

        assert_eq!(rx.recv().await.unwrap(), b"ABC");

        socket.send(b"hi");
        assert_eq!(server.await.unwrap(), vec![0x02, 0x00, b'h', b'i']);
        socket.close();
    }

    #[tokio::test]
    async fn test_writes_before_open_flush_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut collected = Vec::new();
            let mut buf = [0u8; 64];
            while collected.len() < 6 {
                let n = peer.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            collected
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let socket = Socket::from_stream(stream);
        socket.write(b"one");
        socket.write(b"two");
        socket.open();

        assert_eq!(server.await.unwrap(), b"onetwo");
        socket.close();
    }

    #[tokio::test]
    async fn test_close_hook_fires_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(peer);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let socket = Socket::from_stream(stream);
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        socket.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        socket.open();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let s = socket.clone();
            tasks.push(tokio::spawn(async move { s.close() }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_frame_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(peer);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let socket = Socket::from_stream(stream);
        let (tx, mut rx) = mpsc::unbounded_channel();
        socket.on_close(move || {
            let _ = tx.send(());
        });
        socket.open();
        socket.shutdown();

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("shutdown should close promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            // Say nothing, hold the connection open.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(peer);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let socket = Socket::from_stream(stream);
        let (tx, mut rx) = mpsc::unbounded_channel();
        socket.on_close(move || {
            let _ = tx.send(());
        });
        socket.set_read_timeout(Some(Duration::from_millis(100)));
        socket.open();

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("close should arrive well before the server gives up")
            .unwrap();
    }

    #[tokio::test]
    async fn test_raw_data_hook_bypasses_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(&[0x03, 0x00, b'A']).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let socket = Socket::from_stream(stream);
        let (tx, mut rx) = mpsc::unbounded_channel();
        socket.on_data(move |raw| {
            let _ = tx.send(raw.to_vec());
        });
        socket.open();

        // The incomplete frame arrives raw instead of waiting for more.
        assert_eq!(rx.recv().await.unwrap(), vec![0x03, 0x00, b'A']);
        socket.close();
    }
}
