//! Netplay demo server
//!
//! Listens for game clients and echoes chat packets back to their sender.
//! Exercises the listener, per-connection sockets and the packet
//! dispatcher.

use anyhow::{anyhow, Result};
use clap::Parser;
use netplay::address::parse_address;
use netplay::config::{Config, ServerConfig};
use netplay::session::{Connection, Packet, SessionError, SystemMessage};
use netplay::transport::{ServerListener, Socket};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Netplay demo server
#[derive(Parser, Debug)]
#[command(name = "netplay-server")]
#[command(about = "Netplay demo server - echoes chat packets")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, host:port (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

/// Demo chat packet: tag byte followed by UTF-8 text.
struct Chat {
    text: String,
}

impl Packet for Chat {
    const TAG: u8 = 0x01;

    fn encode(&self, _key: &str) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }

    fn decode(payload: &[u8], _key: &str) -> Result<Self, SessionError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| SessionError::Decode(e.to_string()))?
            .to_string();
        Ok(Self { text })
    }
}

fn handle_client(socket: Socket, read_timeout_ms: u64) {
    let peer = socket.peer_addr();
    info!("client connected: {peer:?}");

    if read_timeout_ms > 0 {
        socket.set_read_timeout(Some(Duration::from_millis(read_timeout_ms)));
    }

    let conn = Arc::new(Mutex::new(Connection::new(socket.clone())));
    {
        let mut guard = conn.lock().unwrap();

        let responder = Connection::new(socket.clone());
        guard.register_handler::<Chat, _>(move |p| {
            info!("chat from {peer:?}: {}", p.text);
            responder.send_packet(&Chat { text: p.text });
        });

        guard.register_system_handler(SystemMessage::Close, move || {
            info!("client disconnected: {peer:?}");
        });
    }

    let c = conn.clone();
    socket.on_message(move |m| c.lock().unwrap().dispatch(m));
    let c = conn.clone();
    socket.on_open(move || c.lock().unwrap().dispatch_system(SystemMessage::Open));
    let c = conn;
    socket.on_close(move || c.lock().unwrap().dispatch_system(SystemMessage::Close));

    socket.open();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let server_config = match &args.config {
        Some(path) => Config::load(path)
            .map_err(|e| anyhow!("{e}"))?
            .server
            .unwrap_or_default(),
        None => ServerConfig::default(),
    };
    let listen = args.listen.unwrap_or(server_config.listen);
    let (host, port) = parse_address(&listen).map_err(|e| anyhow!("{e}"))?;

    let listener = ServerListener::new(&host, port);
    let read_timeout_ms = server_config.read_timeout_ms;
    listener.on_connection(move |socket| handle_client(socket, read_timeout_ms));

    listener.start().await.map_err(|e| anyhow!("{e}"))?;
    info!("netplay-server {} ready", netplay::VERSION);

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    listener.stop();
    listener.join().await;
    Ok(())
}
