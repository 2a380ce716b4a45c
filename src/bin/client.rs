//! Netplay demo client
//!
//! Connects to a demo server (optionally through a SOCKS5 proxy), sends
//! one chat packet and prints the echoed reply.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use netplay::address::parse_address;
use netplay::config::{ClientConfig, Config};
use netplay::session::{Connection, Packet, SessionError};
use netplay::transport::ConnectorSocket;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Netplay demo client
#[derive(Parser, Debug)]
#[command(name = "netplay-client")]
#[command(about = "Netplay demo client - sends a chat packet and prints the echo")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Server address, host:port (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// SOCKS5 proxy address, host:port (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Message to send
    #[arg(short, long, default_value = "hello from netplay")]
    message: String,

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

enum Outcome {
    Reply(String),
    Failed,
    Disconnected,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let client_config = match &args.config {
        Some(path) => Config::load(path)
            .map_err(|e| anyhow!("{e}"))?
            .client
            .unwrap_or_default(),
        None => ClientConfig::default(),
    };
    let server = args.server.unwrap_or(client_config.server);
    let socks5 = args.socks5.or(client_config.socks5_proxy);

    let (host, port) = parse_address(&server).map_err(|e| anyhow!("{e}"))?;
    let mut connector = ConnectorSocket::new();
    connector.set_remote_address(&host, port);
    if let Some(proxy) = &socks5 {
        let (proxy_host, proxy_port) = parse_address(proxy).map_err(|e| anyhow!("{e}"))?;
        connector.config_socks5(&proxy_host, proxy_port);
        info!("dialing {host}:{port} via SOCKS5 proxy {proxy_host}:{proxy_port}");
    } else {
        info!("dialing {host}:{port}");
    }
    if client_config.read_timeout_ms > 0 {
        connector.set_read_timeout(Some(Duration::from_millis(client_config.read_timeout_ms)));
    }

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Mutex::new(Connection::new(connector)));
    {
        let guard = conn.lock().unwrap();

        let tx = outcome_tx.clone();
        guard.transport().on_fail(move || {
            let _ = tx.send(Outcome::Failed);
        });
        let tx = outcome_tx.clone();
        guard.transport().on_disconnect(move || {
            let _ = tx.send(Outcome::Disconnected);
        });

        let c = conn.clone();
        guard.transport().on_message(move |m| {
            c.lock().unwrap().dispatch(m);
        });

        let c = conn.clone();
        let message = args.message.clone();
        guard.transport().on_connect(move || {
            info!("connected, sending chat");
            c.lock().unwrap().send_packet(&Chat {
                text: message.clone(),
            });
        });
    }
    {
        let mut guard = conn.lock().unwrap();
        let tx = outcome_tx;
        guard.register_handler::<Chat, _>(move |p| {
            let _ = tx.send(Outcome::Reply(p.text));
        });
    }

    conn.lock().unwrap().open();

    let outcome = tokio::time::timeout(Duration::from_secs(60), outcome_rx.recv())
        .await
        .map_err(|_| anyhow!("timed out waiting for a reply"))?;

    match outcome {
        Some(Outcome::Reply(text)) => {
            println!("{text}");
            conn.lock().unwrap().close();
            Ok(())
        }
        Some(Outcome::Failed) => bail!("connection failed"),
        Some(Outcome::Disconnected) | None => bail!("disconnected before a reply arrived"),
    }
}
