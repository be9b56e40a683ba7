//! Error types for overseer-core.

use thiserror::Error;

/// Result type alias using overseer-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for watcher operations
#[derive(Error, Debug)]
pub enum Error {
    // Request-time validation errors (surfaced to the requester)
    #[error("All observers are busy")]
    CapacityExceeded,

    #[error("Game kind not supported: {0}")]
    UnsupportedGameKind(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Match {0} is already watched in another stream")]
    DuplicateMatch(String),

    #[error("Invalid stream handle: {0:?}")]
    InvalidHandle(String),

    #[error("Stream not found: {handle}/{game_kind}")]
    SessionNotFound { handle: String, game_kind: String },

    #[error("Stream is already being watched: {0}")]
    AlreadyRunning(String),

    // Peer errors
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("Peer {peer} answered {status}: {body}")]
    PeerRejected {
        peer: String,
        status: u16,
        body: String,
    },

    // Local watch errors (never surfaced to the requester)
    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Failed to spawn capture process: {0}")]
    ProcessSpawn(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a not-found error for a stream key
    pub fn not_found(handle: impl Into<String>, game_kind: impl Into<String>) -> Self {
        Self::SessionNotFound {
            handle: handle.into(),
            game_kind: game_kind.into(),
        }
    }

    /// Create an unreachable-peer error
    pub fn peer_unreachable(peer: impl Into<String>, reason: impl ToString) -> Self {
        Self::PeerUnreachable {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }

    /// HTTP status code this error maps to at the node boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::CapacityExceeded => 507,
            Error::UnsupportedGameKind(_) | Error::DuplicateMatch(_) | Error::InvalidHandle(_) => {
                400
            }
            Error::Conflict(_) | Error::AlreadyRunning(_) => 409,
            Error::SessionNotFound { .. } => 404,
            Error::PeerUnreachable { .. } => 502,
            // relay the child's verdict unchanged
            Error::PeerRejected { status, .. } => *status,
            _ => 500,
        }
    }
}
