//! # Error Handling
//!
//! Error types for every stage of the storage pipeline.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Input Errors (100)                                                │
//! │  │   ├── InvalidInput          - Caller passed an unusable argument    │
//! │  │   ├── Decode                - Malformed envelope or layout          │
//! │  │   ├── Serialization         - Encoding failure                      │
//! │  │   └── Config                - Unreadable node configuration         │
//! │  │                                                                      │
//! │  ├── Cipher Errors (200)                                               │
//! │  │   ├── Cipher                - Bad key, short body, failed tag       │
//! │  │   └── KeyNotFound           - No custody record for a chunk         │
//! │  │                                                                      │
//! │  ├── Transfer Errors (300)                                             │
//! │  │   ├── Transfer              - Bulk data pull failed                 │
//! │  │   ├── Timeout               - Deadline elapsed                      │
//! │  │   └── Cancelled             - Context was cancelled                 │
//! │  │                                                                      │
//! │  ├── Storage Errors (400)                                              │
//! │  │   ├── Io                    - Filesystem failure                    │
//! │  │   ├── Database              - SQLite failure                        │
//! │  │   ├── ObjectStore           - Content-addressed backend failure     │
//! │  │   └── NotFound              - Unknown file or object                │
//! │  │                                                                      │
//! │  └── Network Errors (500)                                              │
//! │      ├── NoEligiblePeer        - No trusted peer accepted the work     │
//! │      ├── Protocol              - Request/response failure              │
//! │      └── Transport             - Swarm could not be built or driven    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage pipeline
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Input Errors (100-199)
    // ========================================================================

    /// An argument was rejected before any work started
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An envelope, layout or record could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A value could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The node configuration is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Cipher Errors (200-299)
    // ========================================================================

    /// Sealing or opening a chunk failed
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// No key record exists for the requested chunk
    #[error("No key found for file {file_id} at offset {offset} (size {size})")]
    KeyNotFound {
        /// File the chunk belongs to
        file_id: String,
        /// Ciphertext offset of the chunk
        offset: u64,
        /// Ciphertext size of the chunk
        size: u64,
    },

    // ========================================================================
    // Transfer Errors (300-399)
    // ========================================================================

    /// A bulk data transfer failed
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// A deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled through its context
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Database failure
    #[error("Database error: {0}")]
    Database(String),

    /// The content-addressed backend failed
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// The requested item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    // ========================================================================
    // Network Errors (500-599)
    // ========================================================================

    /// Every candidate peer declined or failed the request
    #[error("No eligible peer: {0}")]
    NoEligiblePeer(String),

    /// A request/response exchange failed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The libp2p transport could not be set up
    #[error("Transport error: {0}")]
    Transport(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    pub fn code(&self) -> i32 {
        match self {
            // Input (100-199)
            Error::InvalidInput(_) => 100,
            Error::Decode(_) => 101,
            Error::Serialization(_) => 102,
            Error::Config(_) => 103,

            // Cipher (200-299)
            Error::Cipher(_) => 200,
            Error::KeyNotFound { .. } => 201,

            // Transfer (300-399)
            Error::Transfer(_) => 300,
            Error::Timeout(_) => 301,
            Error::Cancelled => 302,

            // Storage (400-499)
            Error::Io(_) => 400,
            Error::Database(_) => 401,
            Error::ObjectStore(_) => 402,
            Error::NotFound(_) => 403,

            // Network (500-599)
            Error::NoEligiblePeer(_) => 500,
            Error::Protocol(_) => 501,
            Error::Transport(_) => 502,

            // Internal (900-999)
            Error::Internal(_) => 900,
        }
    }

    /// Check if another peer might succeed where this attempt failed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound { .. }
                | Error::Timeout(_)
                | Error::Transfer(_)
                | Error::Protocol(_)
        )
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transfer(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
