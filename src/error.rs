//! Error types and result handling for pg-deltastream.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_deltastream::{Error, Result};
//!
//! fn read_page() -> Result<()> {
//!     Err(Error::SnapshotUnavailable)
//! }
//!
//! match read_page() {
//!     Ok(()) => println!("read"),
//!     Err(Error::SnapshotUnavailable) => eprintln!("call init first"),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-deltastream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error on the regular (non-replication) connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding events or decoding acknowledgments.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on a socket or transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failure not covered by a more specific variant.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// ErrorResponse from the server on the replication connection.
    #[error("Server error {code}: {message}")]
    Server {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Unexpected or malformed message on the replication protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected the slot creation request, or its reply was unusable.
    #[error("Replication slot creation failed: {message}")]
    SlotCreation {
        /// Description of the failure
        message: String,
    },

    /// The exported snapshot can no longer be imported into a transaction.
    #[error("Snapshot '{snapshot_id}' is no longer valid: {message}")]
    SnapshotExpired {
        /// The snapshot identifier that was rejected
        snapshot_id: String,
        /// Server message
        message: String,
    },

    /// No slot/snapshot has been initialized for the session yet.
    #[error("Snapshot not available: initialize a session first")]
    SnapshotUnavailable,

    /// Caller input was rejected before any database work happened.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Which field was wrong and why
        message: String,
    },

    /// A replication message could not be decoded.
    ///
    /// This is fatal to the stream: the log position cannot be recovered
    /// without the original bytes.
    #[error("Stream decode error: {message}")]
    StreamDecode {
        /// Description of what was invalid
        message: String,
    },

    /// Failure on the consumer-facing transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session was cancelled.
    ///
    /// Not really an error; it uses the error mechanism to unwind the
    /// streaming loops.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Error::StreamDecode {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest {
            message: message.into(),
        }
    }
}

/// A convenient Result type alias for pg-deltastream operations.
///
/// This is equivalent to `std::result::Result<T, pg_deltastream::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
