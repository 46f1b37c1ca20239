//! Tunnel frame codec.
//!
//! Every frame is a 6-byte header followed by up to 65535 payload bytes:
//!
//! ```text
//! offset 0..3   sessID   u32, big-endian
//! offset 4..5   length   u16, big-endian
//! offset 6..    payload  opaque bytes
//! ```
//!
//! There is no type field. The receiver infers semantics from its session
//! table: the first frame seen for a session carries the ASCII
//! `host:port` target string; every later frame is payload.

/// Session identifier carried in every frame header.
pub type SessionId = u32;

/// Frame header size on the wire.
pub const HEADER_SIZE: usize = 6;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// One multiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub session: SessionId,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame. `payload` must fit the length field.
    pub fn new(session: SessionId, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self { session, payload }
    }

    /// The session-establishing first frame: payload is the target string.
    pub fn init(session: SessionId, target: &str) -> Self {
        Self::new(session, target.as_bytes().to_vec())
    }

    /// A payload frame for an established session.
    pub fn data(session: SessionId, data: &[u8]) -> Self {
        Self::new(session, data.to_vec())
    }

    /// Encode header and payload into one contiguous buffer so a single
    /// write keeps the frame atomic on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.session.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Decode a frame header into `(sessID, payload length)`.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> (SessionId, u16) {
    let session = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]);
    (session, length)
}

/// Split an application write larger than one frame into several data
/// frames, preserving byte order.
pub fn split_data(session: SessionId, data: &[u8]) -> Vec<Frame> {
    data.chunks(MAX_PAYLOAD)
        .map(|chunk| Frame::data(session, chunk))
        .collect()
}
