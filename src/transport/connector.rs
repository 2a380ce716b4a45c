//! Outbound connections
//!
//! `ConnectorSocket` resolves a remote address, dials it (optionally
//! through a SOCKS5 proxy), and surfaces the connection as a [`Socket`].
//! The SOCKS5 prelude runs on the raw stream before the socket opens, so
//! the connected event only fires once application traffic may flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::proxy::{greeting, Socks5Event, Socks5Handshake};

use super::hooks::{EventHook, SharedHooks};
use super::socket::Socket;
use super::{Transport, TransportError};

/// Default time allowed for the TCP dial.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct ConnectorEvents {
    on_connect: Option<EventHook>,
    on_disconnect: Option<EventHook>,
    on_fail: Option<EventHook>,
}

#[derive(Clone, Default)]
struct SharedEvents {
    inner: Arc<Mutex<ConnectorEvents>>,
}

impl SharedEvents {
    fn lock(&self) -> MutexGuard<'_, ConnectorEvents> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self, pick: fn(&mut ConnectorEvents) -> &mut Option<EventHook>) {
        let taken = pick(&mut self.lock()).take();
        if let Some(mut hook) = taken {
            hook();
            let mut guard = self.lock();
            let slot = pick(&mut guard);
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn connect(&self) {
        self.call(|e| &mut e.on_connect);
    }
    fn disconnect(&self) {
        self.call(|e| &mut e.on_disconnect);
    }
    fn fail(&self) {
        self.call(|e| &mut e.on_fail);
    }
}

#[derive(Default)]
struct Flags {
    is_connect: AtomicBool,
    is_failed: AtomicBool,
    manually_closed: AtomicBool,
}

/// Outbound TCP endpoint with optional SOCKS5 prelude.
pub struct ConnectorSocket {
    addr_host: String,
    addr_port: u16,
    // Final application target when dialing through a proxy.
    socks5_req_addr: Option<(String, u16)>,
    connect_timeout: Duration,
    hooks: SharedHooks,
    events: SharedEvents,
    flags: Arc<Flags>,
    socket: Arc<Mutex<Option<Socket>>>,
}

impl Default for ConnectorSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorSocket {
    pub fn new() -> Self {
        Self {
            addr_host: String::new(),
            addr_port: 0,
            socks5_req_addr: None,
            connect_timeout: CONNECT_TIMEOUT,
            hooks: SharedHooks::default(),
            events: SharedEvents::default(),
            flags: Arc::new(Flags::default()),
            socket: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the remote endpoint to dial.
    pub fn set_remote_address(&mut self, host: &str, port: u16) {
        self.addr_host = host.to_string();
        self.addr_port = port;
    }

    /// Route the connection through a SOCKS5 proxy at `host:port`.
    ///
    /// Must be called after [`set_remote_address`](Self::set_remote_address):
    /// the previously configured remote becomes the proxied target and the
    /// proxy becomes the TCP endpoint. An empty host leaves the connector
    /// untouched.
    pub fn config_socks5(&mut self, host: &str, port: u16) {
        if host.is_empty() {
            return;
        }
        let real_host = std::mem::replace(&mut self.addr_host, host.to_string());
        self.socks5_req_addr = Some((real_host, self.addr_port));
        self.addr_port = port;
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// Close the connection after this much read inactivity.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.hooks.set_read_timeout(timeout);
    }

    /// Called with each complete inbound message.
    pub fn on_message(&self, f: impl FnMut(&[u8]) + Send + 'static) {
        self.hooks.set_message(Box::new(f));
    }

    pub fn on_info(&self, f: impl FnMut(&str) + Send + 'static) {
        self.hooks.set_info(Box::new(f));
    }

    pub fn on_warning(&self, f: impl FnMut(&str) + Send + 'static) {
        self.hooks.set_warning(Box::new(f));
    }

    /// Called once the connection is ready for application traffic. With a
    /// SOCKS5 proxy configured this fires only after the proxy handshake
    /// succeeds.
    pub fn on_connect(&self, f: impl FnMut() + Send + 'static) {
        self.events.lock().on_connect = Some(Box::new(f));
    }

    /// Called when an established connection ends for any reason other
    /// than [`disconnect`](Self::disconnect) or a failure.
    pub fn on_disconnect(&self, f: impl FnMut() + Send + 'static) {
        self.events.lock().on_disconnect = Some(Box::new(f));
    }

    /// Called when resolution, dialing or the SOCKS5 prelude fails.
    pub fn on_fail(&self, f: impl FnMut() + Send + 'static) {
        self.events.lock().on_fail = Some(Box::new(f));
    }

    /// Queue one message for transmission.
    pub fn send(&self, msg: &[u8]) {
        let guard = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = guard.as_ref() {
            socket.send(msg);
        } else {
            debug!("dropping message: connector has no live connection");
        }
    }

    /// Queue raw bytes for transmission.
    pub fn write(&self, data: &[u8]) {
        let guard = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = guard.as_ref() {
            socket.write(data);
        }
    }

    pub fn write_queue_len(&self) -> usize {
        let guard = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map_or(0, |s| s.write_queue_len())
    }

    pub fn is_connected(&self) -> bool {
        self.flags.is_connect.load(Ordering::SeqCst)
    }

    /// Dial the configured remote. Spawns the connection driver and
    /// returns immediately; progress is reported through the hooks. A
    /// second call while a connection is live is ignored.
    pub fn connect(&self) {
        if self.flags.is_connect.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flags.is_failed.store(false, Ordering::SeqCst);
        self.flags.manually_closed.store(false, Ordering::SeqCst);

        let host = self.addr_host.clone();
        let port = self.addr_port;
        let socks5_target = self.socks5_req_addr.clone();
        let connect_timeout = self.connect_timeout;
        let hooks = self.hooks.clone();
        let events = self.events.clone();
        let flags = self.flags.clone();
        let socket_slot = self.socket.clone();

        tokio::spawn(async move {
            let stream = match dial(&host, port, connect_timeout, socks5_target.as_ref()).await {
                Ok(stream) => stream,
                Err(e) => {
                    let text = e.to_string();
                    warn!("{text}");
                    hooks.warning(&text);
                    flags.is_failed.store(true, Ordering::SeqCst);
                    flags.is_connect.store(false, Ordering::SeqCst);
                    if !flags.manually_closed.load(Ordering::SeqCst) {
                        events.fail();
                    }
                    return;
                }
            };

            if flags.manually_closed.load(Ordering::SeqCst) {
                flags.is_connect.store(false, Ordering::SeqCst);
                return;
            }

            // The connected event rides the socket's open hook; teardown
            // routes through its close hook.
            {
                let events = events.clone();
                hooks.set_open(Box::new(move || events.connect()));
            }
            {
                let events = events.clone();
                let flags = flags.clone();
                let socket_slot = socket_slot.clone();
                hooks.set_close(Box::new(move || {
                    flags.is_connect.store(false, Ordering::SeqCst);
                    socket_slot
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if !flags.manually_closed.load(Ordering::SeqCst) {
                        if flags.is_failed.load(Ordering::SeqCst) {
                            events.fail();
                        } else {
                            events.disconnect();
                        }
                    }
                }));
            }

            let socket = Socket::spawn(stream, hooks.clone());
            *socket_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket.clone());
            socket.open();
        });
    }

    /// Tear the connection down without firing the disconnect or fail
    /// events.
    pub fn disconnect(&self) {
        self.flags.manually_closed.store(true, Ordering::SeqCst);
        let guard = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = guard.as_ref() {
            socket.close();
        }
    }
}

impl Transport for ConnectorSocket {
    fn open(&self) {
        self.connect();
    }
    fn close(&self) {
        self.disconnect();
    }
    fn send(&self, msg: &[u8]) {
        ConnectorSocket::send(self, msg);
    }
}

/// Resolve, dial and run the optional SOCKS5 prelude.
async fn dial(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    socks5_target: Option<&(String, u16)>,
) -> Result<TcpStream, TransportError> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Resolve(format!("{host}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{host}: no addresses")))?;

    debug!("connecting to {addr}");
    let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Err(_) => return Err(TransportError::Timeout),
        Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
        Ok(Ok(stream)) => stream,
    };
    stream.set_nodelay(true).ok();

    if let Some((target_host, target_port)) = socks5_target {
        run_socks5(&mut stream, target_host, *target_port).await?;
        info!("SOCKS5 request successful: {target_host}:{target_port}");
    }

    Ok(stream)
}

/// Drive the two-step SOCKS5 exchange to completion on the raw stream.
async fn run_socks5(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), TransportError> {
    let mut handshake = Socks5Handshake::new(host, port)?;
    stream.write_all(&greeting()).await?;

    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::ConnectionFailed(
                "proxy closed during SOCKS5 handshake".to_string(),
            ));
        }
        match handshake.advance(&buf[..n])? {
            Socks5Event::NeedMoreData => {}
            Socks5Event::SendConnectionRequest(request) => {
                stream.write_all(&request).await?;
            }
            Socks5Event::Established => return Ok(()),
        }
    }
}
