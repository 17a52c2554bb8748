use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Media access failed: {0}")]
    MediaAccess(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    ConnectionTimeout { operation: String, timeout_ms: u64 },

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    #[error("Persistence write conflict: {0}")]
    WriteConflict(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session full: capacity {capacity} reached")]
    SessionFull { capacity: u32 },

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Invalid state for {operation}: session is {status}")]
    InvalidState { operation: String, status: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether this error is a transient uniqueness violation on upsert
    ///
    /// The persistence store retries these exactly once before surfacing
    /// them as a `WriteConflict`.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            SessionError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, SessionError>;
