//! Errors surfaced to callers of the cache client.
//!
//! Every request resolves with either a response or one [`CacheError`].
//! Construction-time problems (bad addresses, invalid options) are reported
//! through `anyhow` instead, since they never reach the request path.

use std::io;

use thiserror::Error;

/// Message carried by every timeout, connect or response.
pub const CONNECTION_TIMEOUT: &str = "Connection timeout";

/// Why a transport-level failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Refused,
    Timeout,
    Reset,
    /// The peer closed the socket while a reply was expected.
    Closed,
    Other,
}

/// Coarse classification used by callers that only care about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ServerNotAvailable,
    Protocol,
    Server,
    InvalidKey,
    ClientClosed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("{message}")]
    Transport {
        kind: TransportKind,
        message: String,
    },

    #[error("Server not available")]
    ServerNotAvailable,

    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// `ERROR`, `CLIENT_ERROR` or `SERVER_ERROR` reply from a healthy node.
    #[error("server error: {message}")]
    Server { message: String },

    #[error("invalid key: {message}")]
    InvalidKey { message: String },

    #[error("Client closed")]
    ClientClosed,
}

impl CacheError {
    pub fn timeout() -> Self {
        CacheError::Transport {
            kind: TransportKind::Timeout,
            message: CONNECTION_TIMEOUT.to_string(),
        }
    }

    /// Maps a failed `connect` to the `connect ECONNREFUSED <addr>` style messages.
    pub fn connect(addr: &str, err: &io::Error) -> Self {
        let (kind, code) = match err.kind() {
            io::ErrorKind::ConnectionRefused => (TransportKind::Refused, "ECONNREFUSED"),
            io::ErrorKind::ConnectionReset => (TransportKind::Reset, "ECONNRESET"),
            io::ErrorKind::TimedOut => return CacheError::timeout(),
            _ => {
                return CacheError::Transport {
                    kind: TransportKind::Other,
                    message: format!("connect {addr}: {err}"),
                };
            }
        };
        CacheError::Transport {
            kind,
            message: format!("connect {code} {addr}"),
        }
    }

    /// Maps an I/O failure on an established socket.
    pub fn io(addr: &str, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => TransportKind::Reset,
            io::ErrorKind::UnexpectedEof => TransportKind::Closed,
            io::ErrorKind::TimedOut => return CacheError::timeout(),
            _ => TransportKind::Other,
        };
        CacheError::Transport {
            kind,
            message: format!("{addr}: {err}"),
        }
    }

    pub fn closed_by_peer(addr: &str) -> Self {
        CacheError::Transport {
            kind: TransportKind::Closed,
            message: format!("{addr}: connection closed by server"),
        }
    }

    /// The connection task stopped before answering.
    pub fn connection_lost(addr: &str) -> Self {
        CacheError::Transport {
            kind: TransportKind::Other,
            message: format!("{addr}: connection task stopped"),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        CacheError::Protocol {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Transport { .. } => ErrorKind::Transport,
            CacheError::ServerNotAvailable => ErrorKind::ServerNotAvailable,
            CacheError::Protocol { .. } => ErrorKind::Protocol,
            CacheError::Server { .. } => ErrorKind::Server,
            CacheError::InvalidKey { .. } => ErrorKind::InvalidKey,
            CacheError::ClientClosed => ErrorKind::ClientClosed,
        }
    }

    /// Whether this failure counts against the node's health.
    ///
    /// Malformed replies are treated like transport failures: the socket is
    /// no longer trustworthy once framing is lost.
    pub fn is_health_failure(&self) -> bool {
        matches!(
            self,
            CacheError::Transport { .. } | CacheError::Protocol { .. }
        )
    }
}
