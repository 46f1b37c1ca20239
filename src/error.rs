//! Error types for the tunnel.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a tunnel role.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer failed the shared-secret handshake
    #[error("authentication failed")]
    AuthFailed,

    /// Handshake protocol error other than a bad MAC
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Malformed SOCKS5, relay header, or tunnel frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A SOCKS client arrived while no tunnel was attached
    #[error("no tunnel attached")]
    NoTunnel,

    /// The shared tunnel went away mid-session
    #[error("tunnel closed")]
    TunnelClosed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether the agent redial loop should treat this as retryable.
    /// Configuration errors are not: redialing cannot fix them.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Config(_))
    }
}
