//! Frontend role: SOCKS5 listener plus tunnel terminator.
//!
//! Two listeners run concurrently. The tunnel side holds at most one
//! active tunnel; a newly accepted (or newly registered) tunnel
//! supersedes and closes the previous one. Each SOCKS client becomes a
//! session: a random 32-bit id, an init frame carrying the target string,
//! then one data frame per client read. The single tunnel reader demuxes
//! return payloads straight onto the matching client sockets.

pub mod socks;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::relay::REGISTER_HEADER;
use crate::secure::{self, SecureReader, SecureWriter, TunnelKey};
use crate::tunnel::{self, Frame, SessionId, TunnelHandle};
use crate::{IO_CHUNK, RECONNECT_DELAY_SECS};

/// Write side of one SOCKS client. Only the tunnel reader writes through
/// the inner lock; the table lock is held for mutations only.
type ClientSink = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// How the frontend obtains its tunnel.
enum TunnelSource {
    /// Direct mode: listen for the agent's inbound dial.
    Listen(TcpListener),
    /// Relay mode: dial the relay and register, repeatedly.
    Register { relay_addr: String },
}

/// The currently attached tunnel and the tasks that serve it.
struct ActiveTunnel {
    handle: TunnelHandle,
    tasks: Vec<JoinHandle<()>>,
}

/// Shared frontend state.
struct State {
    /// Active tunnel slot. Rotated whole; never held across `.await`.
    tunnel: parking_lot::Mutex<Option<ActiveTunnel>>,
    /// sessID → SOCKS client write half. Locked for mutations only; the
    /// demux clones the sink out before writing.
    sessions: parking_lot::Mutex<HashMap<SessionId, ClientSink>>,
}

impl State {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tunnel: parking_lot::Mutex::new(None),
            sessions: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Install a new tunnel, tearing down whatever was attached before.
    fn install(&self, next: ActiveTunnel) {
        let previous = self.tunnel.lock().replace(next);
        Self::teardown(previous);
    }

    /// Detach and close the current tunnel, if any.
    fn detach(&self) {
        let previous = self.tunnel.lock().take();
        Self::teardown(previous);
    }

    fn teardown(previous: Option<ActiveTunnel>) {
        if let Some(old) = previous {
            tracing::info!("closing previous tunnel connection");
            for task in old.tasks {
                task.abort();
            }
        }
    }

    /// Clone the active tunnel's sender, if one is attached.
    fn handle(&self) -> Option<TunnelHandle> {
        self.tunnel.lock().as_ref().map(|t| t.handle.clone())
    }
}

/// Frontend role instance. Bind first (so tests and callers learn the
/// actual addresses), then [`run`](Frontend::run).
pub struct Frontend {
    socks_listener: TcpListener,
    source: TunnelSource,
    key: TunnelKey,
    state: Arc<State>,
}

impl Frontend {
    /// Direct mode: bind the SOCKS listener and the tunnel listener.
    pub async fn bind(socks_addr: &str, tunnel_port: u16, secret: &str) -> Result<Self> {
        let socks_listener = TcpListener::bind(socks_addr).await?;
        let tunnel_listener = TcpListener::bind(("0.0.0.0", tunnel_port)).await?;
        tracing::info!(
            "listening for tunnel on port {}",
            tunnel_listener.local_addr()?.port()
        );
        Ok(Self {
            socks_listener,
            source: TunnelSource::Listen(tunnel_listener),
            key: TunnelKey::derive(secret),
            state: State::new(),
        })
    }

    /// Relay mode: bind the SOCKS listener only; the tunnel arrives by
    /// registering with the relay at `relay_addr`.
    pub async fn bind_with_relay(socks_addr: &str, relay_addr: &str, secret: &str) -> Result<Self> {
        let socks_listener = TcpListener::bind(socks_addr).await?;
        Ok(Self {
            socks_listener,
            source: TunnelSource::Register {
                relay_addr: relay_addr.to_string(),
            },
            key: TunnelKey::derive(secret),
            state: State::new(),
        })
    }

    /// Actual SOCKS listen address.
    pub fn socks_addr(&self) -> Result<SocketAddr> {
        Ok(self.socks_listener.local_addr()?)
    }

    /// Actual tunnel listen address (direct mode only).
    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        match &self.source {
            TunnelSource::Listen(listener) => listener.local_addr().ok(),
            TunnelSource::Register { .. } => None,
        }
    }

    /// Serve both listeners until one fails fatally.
    pub async fn run(self) -> Result<()> {
        let Self {
            socks_listener,
            source,
            key,
            state,
        } = self;

        let tunnel_state = Arc::clone(&state);
        let mut tunnel_task: JoinHandle<Result<()>> = match source {
            TunnelSource::Listen(listener) => {
                tokio::spawn(accept_tunnels(listener, key, tunnel_state))
            }
            TunnelSource::Register { relay_addr } => {
                tokio::spawn(register_loop(relay_addr, key, tunnel_state))
            }
        };

        tracing::info!(
            "SOCKS5 proxy listening on {}",
            socks_listener.local_addr()?
        );
        let socks_loop = async {
            loop {
                match socks_listener.accept().await {
                    Ok((client, peer)) => {
                        tracing::debug!("SOCKS connection from {peer}");
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_socks_client(client, state).await {
                                tracing::debug!("SOCKS client error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("SOCKS accept error: {e}");
                    }
                }
            }
        };

        tokio::select! {
            res = &mut tunnel_task => match res {
                Ok(inner) => inner,
                Err(_) => Err(Error::TunnelClosed),
            },
            _ = socks_loop => unreachable!("SOCKS accept loop never returns"),
        }
    }
}

/// Direct mode: accept tunnels forever; each successful handshake becomes
/// the active tunnel. Handshake failures close the socket and keep
/// accepting.
async fn accept_tunnels(
    listener: TcpListener,
    key: TunnelKey,
    state: Arc<State>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        // A new tunnel supersedes the prior one as soon as it is accepted,
        // before it has authenticated.
        state.detach();
        if let Err(e) = secure::tune_tunnel_socket(&stream) {
            tracing::warn!("tunnel socket options failed: {e}");
        }
        match secure::server_handshake(stream, &key).await {
            Ok((reader, writer)) => {
                tracing::info!("tunnel connected from {peer}");
                attach_tunnel(&state, reader, writer);
            }
            Err(e) => {
                tracing::warn!("tunnel handshake from {peer} failed: {e}");
            }
        }
    }
}

/// Relay mode: dial the relay, register, and serve the paired tunnel; when
/// it dies, back off and register again. The registry consumes one
/// registration per pairing, so this loop is what keeps the frontend
/// reachable.
async fn register_loop(relay_addr: String, key: TunnelKey, state: Arc<State>) -> Result<()> {
    loop {
        match register_once(&relay_addr, &key, &state).await {
            Ok(()) => tracing::info!("relayed tunnel closed, re-registering"),
            Err(e) => tracing::warn!("relay registration failed: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

async fn register_once(relay_addr: &str, key: &TunnelKey, state: &Arc<State>) -> Result<()> {
    let mut stream = TcpStream::connect(relay_addr).await?;
    secure::tune_tunnel_socket(&stream)?;
    stream.write_all(REGISTER_HEADER).await?;
    tracing::info!("registered with relay {relay_addr}");

    // The handshake read blocks until the relay pairs us with an agent;
    // the agent dials second, so we are the accepting side.
    let (mut reader, writer) = secure::server_handshake(stream, key).await?;
    tracing::info!("tunnel established via relay");

    let (handle, writer_task) = tunnel::spawn_writer(writer);
    state.install(ActiveTunnel {
        handle,
        tasks: vec![writer_task],
    });

    // Demux inline so this loop notices the tunnel dying.
    tunnel_read_loop(&mut reader, state).await;
    Ok(())
}

/// Wire a handshaked tunnel into the state and spawn its serving tasks.
fn attach_tunnel(state: &Arc<State>, mut reader: SecureReader, writer: SecureWriter) {
    let (handle, writer_task) = tunnel::spawn_writer(writer);
    let demux_state = Arc::clone(state);
    let reader_task = tokio::spawn(async move {
        tunnel_read_loop(&mut reader, &demux_state).await;
    });
    state.install(ActiveTunnel {
        handle,
        tasks: vec![reader_task, writer_task],
    });
}

/// The single tunnel reader: demux frames onto SOCKS client sockets.
/// Frames for sessions this end already tore down are consumed and logged.
async fn tunnel_read_loop(reader: &mut SecureReader, state: &Arc<State>) {
    loop {
        let frame = match tunnel::read_frame(reader).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::info!("tunnel read error: {e}");
                return;
            }
        };

        let sink = state.sessions.lock().get(&frame.session).cloned();
        match sink {
            Some(sink) => {
                if let Err(e) = sink.lock().await.write_all(&frame.payload).await {
                    tracing::error!(
                        "session {:08x} write to SOCKS client failed: {e}",
                        frame.session
                    );
                    state.sessions.lock().remove(&frame.session);
                }
            }
            None => {
                tracing::error!(
                    "data for unknown or closed session {:08x} ({} bytes dropped)",
                    frame.session,
                    frame.payload.len()
                );
            }
        }
    }
}

/// One SOCKS client: terminate SOCKS5, allocate a session, emit the init
/// frame, then pump client bytes into data frames until EOF.
async fn handle_socks_client(mut client: TcpStream, state: Arc<State>) -> Result<()> {
    let target = socks::terminate(&mut client).await?;
    tracing::info!("request to {target}");

    let session: SessionId = rand::random();
    let Some(tunnel) = state.handle() else {
        tracing::error!("no tunnel attached, refusing session for {target}");
        return Err(Error::NoTunnel);
    };

    let (mut client_reader, client_writer) = client.into_split();

    // Register before queuing the init frame so return payloads always find
    // the session; queue init before the pump starts so it precedes data.
    state
        .sessions
        .lock()
        .insert(session, Arc::new(tokio::sync::Mutex::new(client_writer)));
    if tunnel.send(Frame::init(session, &target)).await.is_err() {
        state.sessions.lock().remove(&session);
        return Err(Error::TunnelClosed);
    }

    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        match client_reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("session {session:08x} closed by client");
                break;
            }
            Ok(n) => {
                if tunnel.send(Frame::data(session, &buf[..n])).await.is_err() {
                    tracing::debug!("session {session:08x} lost its tunnel");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("session {session:08x} client read error: {e}");
                break;
            }
        }
    }

    // Close only the SOCKS client; the tunnel is shared.
    state.sessions.lock().remove(&session);
    Ok(())
}
