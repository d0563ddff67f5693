//! Error types for pglogstream.
//!
//! All errors in this crate are represented by [`ReplicationError`], which
//! covers the failure classes of a replication session:
//! - Configuration errors (malformed options, bad LSN strings)
//! - Connection and I/O errors
//! - Session-invariant violations (`integer_datetimes` off, version checks)
//! - Identity mismatches (systemid / timeline / dbname disagree with server)
//! - Protocol errors (unexpected frames, malformed messages)
//! - Server error responses
//! - Authentication and TLS failures
//! - Errors raised by the consumer callback

use thiserror::Error;

/// Boxed error type accepted from consumer callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for all pglogstream operations.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Invalid caller-supplied configuration. Surfaced at construction,
    /// before any connection is attempted.
    #[error("configuration error: {0}")]
    Config(String),

    /// The driver could not establish or keep a usable replication-mode
    /// connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (network, file system).
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// A session-setup invariant failed (e.g. `integer_datetimes` is not
    /// `on`, or clearing `search_path` did not succeed).
    #[error("session error: {0}")]
    Session(String),

    /// The caller-specified cluster identity disagrees with the server.
    ///
    /// The message names both sides, e.g.
    /// `identity mismatch: Specified timeline: 2, Server timeline: 1`.
    #[error("identity mismatch: Specified {field}: {specified}, Server {field}: {reported}")]
    IdentityMismatch {
        field: &'static str,
        specified: String,
        reported: String,
    },

    /// Protocol error - malformed message or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server error - PostgreSQL returned an error response.
    ///
    /// The message typically includes the SQLSTATE code.
    #[error("server error: {0}")]
    Server(String),

    /// Authentication error - wrong credentials or unsupported method.
    #[error("authentication error: {0}")]
    Auth(String),

    /// TLS error - handshake failure, certificate validation, etc.
    #[error("tls error: {0}")]
    Tls(String),

    /// The consumer callback returned an error; the stream loop was aborted
    /// and cleanup ran before this surfaced.
    #[error("consumer error: {0}")]
    Consumer(#[source] BoxError),
}

impl ReplicationError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, ReplicationError::Io(_))
    }

    /// Returns `true` if this is a server error.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, ReplicationError::Server(_))
    }

    /// Returns `true` if this is an identity mismatch.
    #[inline]
    pub fn is_identity_mismatch(&self) -> bool {
        matches!(self, ReplicationError::IdentityMismatch { .. })
    }

    /// Returns `true` if this error originated in the consumer callback.
    #[inline]
    pub fn is_consumer(&self) -> bool {
        matches!(self, ReplicationError::Consumer(_))
    }

    /// Returns `true` if this error is likely transient and retryable with a
    /// fresh [`crate::Replicator`]. Non-transient errors (config, auth,
    /// identity, protocol) typically require caller changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::Io(_) | ReplicationError::Connection(_)
        )
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Io(err.to_string())
    }
}

impl From<crate::lsn::ParseLsnError> for ReplicationError {
    fn from(err: crate::lsn::ParseLsnError) -> Self {
        ReplicationError::Config(err.to_string())
    }
}

/// Result type alias for pglogstream operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
