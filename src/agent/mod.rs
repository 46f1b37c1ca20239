//! Agent role: the NAT-side end of the tunnel.
//!
//! The agent dials outward, straight to the frontend or to a relay with
//! an `"AGENT   "` header first, authenticates as the handshake client,
//! and then serves frames: the first frame for an unknown session carries a
//! `host:port` target to dial; every later frame is payload for that
//! target. Per-session errors never tear the tunnel; tunnel errors trigger
//! a fixed-delay redial.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::relay::AGENT_HEADER;
use crate::secure::{self, SecureReader, SecureWriter, TunnelKey};
use crate::tunnel::{self, Frame, SessionId, TunnelHandle};
use crate::{IO_CHUNK, READY_WAIT_SECS, RECONNECT_DELAY_SECS, SESSION_QUEUE};

/// One tunneled session on the agent side.
#[derive(Clone)]
struct Session {
    /// Bounded inbound payload queue; a full queue blocks the tunnel
    /// reader, which is the backpressure path.
    incoming: mpsc::Sender<Vec<u8>>,
    /// Flips to true once the target dial has completed.
    ready: watch::Receiver<bool>,
}

type SessionTable = Arc<parking_lot::Mutex<HashMap<SessionId, Session>>>;

/// How this agent reaches its frontend.
enum Dial {
    /// Dial the frontend's tunnel listener directly.
    Direct(String),
    /// Dial a relay and ask it for a registered frontend.
    ViaRelay(String),
}

/// Run the agent against a frontend listening at `tunnel_addr`.
pub async fn run_direct(tunnel_addr: &str, secret: &str, max_retries: i32) -> Result<()> {
    run_loop(Dial::Direct(tunnel_addr.to_string()), secret, max_retries).await
}

/// Run the agent through the relay at `relay_addr`.
pub async fn run_via_relay(relay_addr: &str, secret: &str, max_retries: i32) -> Result<()> {
    run_loop(Dial::ViaRelay(relay_addr.to_string()), secret, max_retries).await
}

/// Redial loop: fixed 5-second backoff; `max_retries` caps *consecutive*
/// failures (a tunnel that connected and later died resets the count);
/// zero or negative means retry forever.
async fn run_loop(dial: Dial, secret: &str, max_retries: i32) -> Result<()> {
    let key = TunnelKey::derive(secret);
    let mut failures = 0i32;
    loop {
        match connect_and_serve(&dial, &key).await {
            Ok(()) => {
                failures = 0;
                tracing::info!("agent disconnected, retrying in {RECONNECT_DELAY_SECS}s");
            }
            Err(e) => {
                failures += 1;
                tracing::error!("agent connection failed: {e}");
                if max_retries > 0 && failures >= max_retries {
                    tracing::error!("giving up after {failures} consecutive failures");
                    return Err(e);
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

/// Dial, handshake, and serve one tunnel to completion. `Ok(())` means the
/// tunnel was established and has since closed.
async fn connect_and_serve(dial: &Dial, key: &TunnelKey) -> Result<()> {
    let addr = match dial {
        Dial::Direct(addr) | Dial::ViaRelay(addr) => addr,
    };
    let mut stream = TcpStream::connect(addr).await?;
    secure::tune_tunnel_socket(&stream)?;

    if let Dial::ViaRelay(_) = dial {
        stream.write_all(AGENT_HEADER).await?;
    }

    let (reader, writer) = secure::client_handshake(stream, key).await?;
    tracing::info!("agent connected to {addr}");

    serve_tunnel(reader, writer).await;
    Ok(())
}

/// The tunnel reader: dispatch frames by session-table membership until
/// the tunnel errors, then tear every session down.
async fn serve_tunnel(mut reader: SecureReader, writer: SecureWriter) {
    let (tunnel, writer_task) = tunnel::spawn_writer(writer);
    let sessions: SessionTable = Arc::new(parking_lot::Mutex::new(HashMap::new()));

    loop {
        let frame = match tunnel::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::info!("tunnel read error: {e}");
                break;
            }
        };

        let existing = sessions.lock().get(&frame.session).cloned();
        match existing {
            None => open_session(frame, &tunnel, &sessions),
            Some(session) => deliver(frame, session, &sessions).await,
        }
    }

    // Closing the write half (via abort) and dropping the queue senders
    // unwinds every session task; the tunnel itself is already gone.
    sessions.lock().clear();
    writer_task.abort();
}

/// Init frame: the payload is the target string. The session record goes
/// into the table immediately, still unready, so the dial never blocks the
/// tunnel reader; a failed dial removes it again, and later frames for the
/// id start over as init frames.
fn open_session(frame: Frame, tunnel: &TunnelHandle, sessions: &SessionTable) {
    let session = frame.session;
    let target = String::from_utf8_lossy(&frame.payload).into_owned();
    tracing::info!("session {session:08x} connecting to {target}");

    let (ready_tx, ready_rx) = watch::channel(false);
    let (incoming_tx, incoming_rx) = mpsc::channel(SESSION_QUEUE);
    sessions.lock().insert(
        session,
        Session {
            incoming: incoming_tx,
            ready: ready_rx,
        },
    );

    let tunnel = tunnel.clone();
    let sessions = Arc::clone(sessions);
    tokio::spawn(run_session(
        session,
        target,
        incoming_rx,
        ready_tx,
        tunnel,
        sessions,
    ));
}

/// Data frame: gate on readiness (bounded, so one slow dial cannot stall
/// the whole tunnel), then queue the payload for the drain task.
async fn deliver(frame: Frame, session: Session, sessions: &SessionTable) {
    let mut ready = session.ready;
    let is_ready = *ready.borrow()
        || tokio::time::timeout(
            Duration::from_secs(READY_WAIT_SECS),
            ready.wait_for(|r| *r),
        )
        .await
        .map(|res| res.is_ok())
        .unwrap_or(false);

    if !is_ready {
        tracing::warn!(
            "session {:08x} not ready, dropping {} bytes",
            frame.session,
            frame.payload.len()
        );
        return;
    }

    if session.incoming.send(frame.payload).await.is_err() {
        // Session task already gone; forget the table entry.
        sessions.lock().remove(&frame.session);
    }
}

/// One session: dial the target, signal readiness, then pump both ways
/// until the target closes or the tunnel goes away.
async fn run_session(
    session: SessionId,
    target: String,
    mut incoming: mpsc::Receiver<Vec<u8>>,
    ready: watch::Sender<bool>,
    tunnel: TunnelHandle,
    sessions: SessionTable,
) {
    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("session {session:08x} dial {target} failed: {e}");
            sessions.lock().remove(&session);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let _ = ready.send(true);
    tracing::debug!("session {session:08x} connected to {target}");

    let (mut target_reader, mut target_writer) = stream.into_split();

    // Target → tunnel: one data frame per read.
    let mut pump = tokio::spawn(async move {
        let mut buf = vec![0u8; IO_CHUNK];
        loop {
            match target_reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("session {session:08x} closed by target");
                    break;
                }
                Ok(n) => {
                    if tunnel.send(Frame::data(session, &buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("session {session:08x} target read error: {e}");
                    break;
                }
            }
        }
    });

    // Tunnel → target: drain the inbound queue.
    let drain = async {
        while let Some(chunk) = incoming.recv().await {
            if let Err(e) = target_writer.write_all(&chunk).await {
                tracing::error!("session {session:08x} write to target failed: {e}");
                break;
            }
        }
    };

    // Either direction finishing destroys the session; the shared tunnel
    // stays untouched.
    tokio::select! {
        _ = &mut pump => {}
        _ = drain => {}
    }
    pump.abort();
    sessions.lock().remove(&session);
}
