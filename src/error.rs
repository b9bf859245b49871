use std::net::SocketAddr;
use thiserror::Error;

/// Crate-wide error type. Every layer propagates one of these kinds;
/// a failure on a single peer connection is terminal for that peer but
/// never for the server.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("no connected peer at {0}")]
    PeerGone(SocketAddr),
}
