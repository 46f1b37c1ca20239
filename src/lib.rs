//! # burrow
//!
//! A reverse SOCKS5 proxy tunnel. A *frontend* on a trusted host exposes a
//! local SOCKS5 service; the TCP connections it brokers are physically
//! originated by an *agent* running behind NAT, which dials outward to the
//! frontend. One long-lived, authenticated, symmetrically-encrypted TCP
//! tunnel carries every concurrent SOCKS session, multiplexed with a small
//! length-prefixed frame header. An optional *relay* pairs a registered
//! frontend with an incoming agent so that both ends can sit behind NAT.
//!
//! ## Architecture Overview
//!
//! ```text
//! SOCKS client ──► Frontend ──► tunnel framer ──[encrypted TCP]──► Agent ──► target
//!                  (SOCKS5        sessID ‖ len ‖ payload           (dials
//!                   terminator)                                     outward)
//! ```
//!
//! The reverse direction is symmetric over the same tunnel. The first frame
//! of a session carries the target address as text; every later frame for
//! that session is opaque payload.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod agent;
pub mod config;
pub mod error;
pub mod frontend;
pub mod relay;
pub mod secure;
pub mod tunnel;

pub use config::{Config, Role};
pub use error::{Error, Result};

/// Per-read buffer size for session pumps. Each read becomes one tunnel
/// frame, so this also bounds frame payloads in practice.
pub const IO_CHUNK: usize = 4096;

/// Capacity of a session's inbound payload queue. A full queue blocks the
/// tunnel reader, which is the backpressure path.
pub const SESSION_QUEUE: usize = 10;

/// Fixed delay between agent redial attempts.
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// How long a data frame waits for its session's target dial to finish
/// before being dropped.
pub const READY_WAIT_SECS: u64 = 2;

/// TCP keep-alive period applied to tunnel sockets.
pub const KEEPALIVE_SECS: u64 = 30;
