//! Inbound connections
//!
//! `ServerListener` binds its address, listens, and hands every accepted
//! connection to the consumer as a fresh unopened [`Socket`]. The consumer
//! registers hooks on the socket and opens it; the socket then lives until
//! its own close sequence completes, whether or not the consumer keeps the
//! handle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::hooks::TextHook;
use super::socket::Socket;
use super::TransportError;

/// Pending-connection backlog for the listening socket.
const LISTEN_BACKLOG: u32 = 4096;

type ConnectionHook = Box<dyn FnMut(Socket) + Send>;

#[derive(Default)]
struct ListenerHooks {
    on_connection: Option<ConnectionHook>,
    on_info: Option<TextHook>,
    on_warning: Option<TextHook>,
}

#[derive(Clone, Default)]
struct SharedListenerHooks {
    inner: Arc<Mutex<ListenerHooks>>,
}

impl SharedListenerHooks {
    fn lock(&self) -> MutexGuard<'_, ListenerHooks> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the socket to the consumer; closes it when nobody listens.
    fn connection(&self, socket: Socket) {
        let taken = self.lock().on_connection.take();
        match taken {
            Some(mut hook) => {
                hook(socket);
                let mut guard = self.lock();
                if guard.on_connection.is_none() {
                    guard.on_connection = Some(hook);
                }
            }
            None => {
                warn!("no connection consumer registered, dropping accepted socket");
                socket.close();
            }
        }
    }

    fn info(&self, text: &str) {
        let taken = self.lock().on_info.take();
        if let Some(mut hook) = taken {
            hook(text);
            let mut guard = self.lock();
            if guard.on_info.is_none() {
                guard.on_info = Some(hook);
            }
        }
    }

    fn warning(&self, text: &str) {
        let taken = self.lock().on_warning.take();
        if let Some(mut hook) = taken {
            hook(text);
            let mut guard = self.lock();
            if guard.on_warning.is_none() {
                guard.on_warning = Some(hook);
            }
        }
    }
}

/// Listening TCP endpoint.
pub struct ServerListener {
    addr_host: String,
    addr_port: u16,
    running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    hooks: SharedListenerHooks,
}

impl ServerListener {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr_host: host.to_string(),
            addr_port: port,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
            hooks: SharedListenerHooks::default(),
        }
    }

    /// Called with each accepted connection, as an unopened [`Socket`].
    pub fn on_connection(&self, f: impl FnMut(Socket) + Send + 'static) {
        self.hooks.lock().on_connection = Some(Box::new(f));
    }

    pub fn on_info(&self, f: impl FnMut(&str) + Send + 'static) {
        self.hooks.lock().on_info = Some(Box::new(f));
    }

    pub fn on_warning(&self, f: impl FnMut(&str) + Send + 'static) {
        self.hooks.lock().on_warning = Some(Box::new(f));
    }

    /// Bind, listen and start accepting on a background task. A second
    /// call while running is ignored.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.bind_and_accept().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let text = e.to_string();
                warn!("{text}");
                self.hooks.warning(&text);
                Err(e)
            }
        }
    }

    /// Start and then block until the listener stops.
    pub async fn run(&self) -> Result<(), TransportError> {
        self.start().await?;
        self.join().await;
        Ok(())
    }

    async fn bind_and_accept(&self) -> Result<(), TransportError> {
        let mut addrs = lookup_host((self.addr_host.as_str(), self.addr_port))
            .await
            .map_err(|e| TransportError::Resolve(format!("{}: {e}", self.addr_host)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{}: no addresses", self.addr_host)))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        let local = listener.local_addr()?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local);

        let text = format!("Listening on: {} {}", local.ip(), local.port());
        info!("{text}");
        self.hooks.info(&text);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        let hooks = self.hooks.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("accepted connection from {peer}");
                            stream.set_nodelay(true).ok();
                            hooks.connection(Socket::from_stream(stream));
                        }
                        Err(e) => {
                            let text = format!("Accept failed: {e}");
                            warn!("{text}");
                            hooks.warning(&text);
                        }
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Signal the accept loop to exit. Sockets already handed out are
    /// unaffected.
    pub fn stop(&self) {
        let guard = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(true);
        }
    }

    /// Wait for the accept loop to exit.
    pub async fn join(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Actual bound address, once started. Useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
