//! Tunnel multiplexer: frame codec plus the single-writer discipline.
//!
//! Exactly one task owns the encrypted write half and drains a FIFO frame
//! channel, so a frame's header and payload are never interleaved with
//! another session's bytes. Producers hold a cloneable [`TunnelHandle`].
//! Because the channel is FIFO, a session that queues its init frame before
//! starting its pump gets init-before-data ordering for free.

mod frame;

pub use frame::{decode_header, split_data, Frame, SessionId, HEADER_SIZE, MAX_PAYLOAD};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::secure::{SecureReader, SecureWriter};

/// Queued frames between producers and the writer task.
const WRITE_QUEUE: usize = 256;

/// Cloneable sending side of the active tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    tx: mpsc::Sender<Frame>,
}

impl TunnelHandle {
    /// Queue a frame for the writer task. Fails with
    /// [`Error::TunnelClosed`] once the writer has exited.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| Error::TunnelClosed)
    }
}

/// Spawn the writer task owning `writer`. The task exits when every handle
/// is dropped or the first write fails; either way the write half closes.
pub fn spawn_writer(writer: SecureWriter) -> (TunnelHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(WRITE_QUEUE);
    let task = tokio::spawn(write_loop(writer, rx));
    (TunnelHandle { tx }, task)
}

async fn write_loop(mut writer: SecureWriter, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame.encode()).await {
            tracing::debug!("tunnel write failed: {e}");
            break;
        }
    }
}

/// Read one whole frame (header, then exactly `length` payload bytes) from
/// the secure channel.
pub async fn read_frame(reader: &mut SecureReader) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (session, length) = decode_header(&header);

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::new(session, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::{client_handshake, server_handshake, TunnelKey};
    use tokio::net::{TcpListener, TcpStream};

    async fn secure_pair() -> (
        (SecureReader, SecureWriter),
        (SecureReader, SecureWriter),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = TunnelKey::derive("s");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let key = TunnelKey::derive("s");
            server_handshake(stream, &key).await.unwrap()
        });
        let client = client_handshake(TcpStream::connect(addr).await.unwrap(), &key)
            .await
            .unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_frames_survive_the_channel() {
        let ((_, client_writer), (mut server_reader, _server_writer)) = secure_pair().await;

        let (handle, _task) = spawn_writer(client_writer);
        handle.send(Frame::init(1, "example.com:80")).await.unwrap();
        handle.send(Frame::data(1, b"GET / HTTP/1.0\r\n")).await.unwrap();
        handle.send(Frame::data(2, b"other session")).await.unwrap();

        let init = read_frame(&mut server_reader).await.unwrap();
        assert_eq!(init.session, 1);
        assert_eq!(init.payload, b"example.com:80");

        let data = read_frame(&mut server_reader).await.unwrap();
        assert_eq!(data.session, 1);
        assert_eq!(data.payload, b"GET / HTTP/1.0\r\n");

        let other = read_frame(&mut server_reader).await.unwrap();
        assert_eq!(other.session, 2);
        assert_eq!(other.payload, b"other session");
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_interleave() {
        let ((_, client_writer), (mut server_reader, _server_writer)) = secure_pair().await;
        let (handle, _task) = spawn_writer(client_writer);

        // Eight sessions race 50 frames each through one tunnel; every
        // decoded frame must come back intact and attributable.
        let mut producers = Vec::new();
        for session in 0u32..8 {
            let handle = handle.clone();
            producers.push(tokio::spawn(async move {
                for seq in 0u32..50 {
                    let mut payload = session.to_be_bytes().to_vec();
                    payload.extend_from_slice(&seq.to_be_bytes());
                    payload.resize(8 + (seq as usize * 7) % 600, session as u8);
                    handle.send(Frame::new(session, payload)).await.unwrap();
                }
            }));
        }

        let mut per_session = std::collections::HashMap::new();
        for _ in 0..8 * 50 {
            let frame = read_frame(&mut server_reader).await.unwrap();
            let marker = u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
            let seq = u32::from_be_bytes(frame.payload[4..8].try_into().unwrap());
            assert_eq!(marker, frame.session);
            assert!(frame.payload[8..].iter().all(|&b| b == frame.session as u8));
            // Per-session order is preserved even though sessions interleave.
            let next = per_session.entry(frame.session).or_insert(0u32);
            assert_eq!(seq, *next);
            *next += 1;
        }
        for p in producers {
            p.await.unwrap();
        }
    }
}
