//! Relay broker: pairs one registered frontend with one incoming agent.
//!
//! The relay speaks exactly eight bytes of protocol, a space-padded ASCII
//! header, and from then on is a pure byte pump. It never sees plaintext:
//! the secure-channel handshake runs end to end between the paired peers,
//! and the relay just copies ciphertext.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Registration header a frontend sends (exactly 8 bytes).
pub const REGISTER_HEADER: &[u8; 8] = b"REGISTER";

/// Header an agent sends (exactly 8 bytes, space-padded).
pub const AGENT_HEADER: &[u8; 8] = b"AGENT   ";

/// FIFO of registered frontend connections awaiting an agent.
type Registry = Arc<parking_lot::Mutex<VecDeque<TcpStream>>>;

/// Relay role instance.
pub struct Relay {
    listener: TcpListener,
    registry: Registry,
}

impl Relay {
    /// Bind the relay listener on all interfaces.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self {
            listener,
            registry: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
        })
    }

    /// Actual listen address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and dispatch connections forever.
    pub async fn run(self) -> Result<()> {
        tracing::info!("relay listening on {}", self.listener.local_addr()?);
        loop {
            match self.listener.accept().await {
                Ok((conn, peer)) => {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        handle_conn(conn, peer, registry).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("relay accept error: {e}");
                }
            }
        }
    }
}

async fn handle_conn(mut conn: TcpStream, peer: SocketAddr, registry: Registry) {
    let mut header = [0u8; 8];
    if let Err(e) = conn.read_exact(&mut header).await {
        tracing::error!("relay header read from {peer} failed: {e}");
        return;
    }

    match trim_header(&header) {
        "REGISTER" => {
            registry.lock().push_back(conn);
            tracing::info!("proxy registered to relay from {peer}");
        }
        "AGENT" => pair(conn, peer, registry).await,
        other => {
            tracing::error!("unknown relay header {other:?} from {peer}");
        }
    }
}

/// Pop the oldest registration and byte-pump between it and the agent
/// until either side closes. Consumed registrations never return to the
/// registry; the frontend registers again on its own.
async fn pair(mut agent: TcpStream, peer: SocketAddr, registry: Registry) {
    let Some(mut proxy) = registry.lock().pop_front() else {
        tracing::error!("no registered proxies available for agent {peer}");
        return;
    };

    tracing::info!("pairing agent {peer} with registered proxy");
    match tokio::io::copy_bidirectional(&mut agent, &mut proxy).await {
        Ok((up, down)) => {
            tracing::debug!("relay pair done: {up} bytes agent→proxy, {down} bytes proxy→agent")
        }
        Err(e) => tracing::debug!("relay pair ended: {e}"),
    }
}

/// Decode the 8-byte header as ASCII with padding trimmed.
fn trim_header(header: &[u8; 8]) -> &str {
    std::str::from_utf8(header).unwrap_or("").trim()
}
