//! Error types for the daemon core.

use thiserror::Error;

/// Errors produced by the daemon core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket or filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or oversized meta-protocol input.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Handshake or identity verification failure.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Failure inside a cryptographic collaborator (seal, open, digest).
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another daemon already holds the PID lock for this net.
    #[error("{0}")]
    AlreadyRunning(String),

    /// A peer missed its liveness or handshake deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A name or resource that must be unique was claimed twice.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Peer speaks a newer meta-protocol than we do.
    #[error("Incompatible protocol version {peer} (ours is {ours})")]
    IncompatibleVersion { peer: u32, ours: u32 },

    /// Unrecoverable process-level failure (fork, exhaustion).
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether this error terminates only the connection it occurred on.
    ///
    /// Per-connection errors close that meta-connection and leave the
    /// daemon running; everything else escalates to the startup/shutdown
    /// paths.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Protocol(_)
                | Error::Auth(_)
                | Error::Crypto(_)
                | Error::Timeout(_)
                | Error::Duplicate(_)
                | Error::IncompatibleVersion { .. }
        )
    }
}

/// Result type alias for daemon-core operations.
pub type Result<T> = std::result::Result<T, Error>;
