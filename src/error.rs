//! Error taxonomy shared by the ETL worker and the backend.
//!
//! Every variant is caught at the iteration boundary of the loop that owns
//! it, logged, and aborts only that iteration. None of them is fatal to the
//! process: the next scheduled tick is the retry mechanism.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connectivity or authentication failure against the Sierra database.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Transport failure or non-success response from the backend.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Malformed or schema-violating batch payload.
    #[error("payload decode error: {0}")]
    PayloadDecode(String),

    #[error("payload encode error: {0}")]
    PayloadEncode(String),

    /// Backend store failure. The surrounding transaction is rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A single queued record could not be pushed to the Sierra REST API.
    #[error("write-back failed for item {item_record_id}: {reason}")]
    Writeback { item_record_id: i64, reason: String },

    /// The changes cursor lags further behind than allowed and the
    /// configured policy refuses to serve it.
    #[error("changes cursor is {lag_minutes} minutes behind (max {max_minutes})")]
    StaleCursor { lag_minutes: i64, max_minutes: i64 },
}

impl SyncError {
    /// Short machine-readable code used in logs and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::BackendUnavailable(_) => "backend_unavailable",
            SyncError::PayloadDecode(_) => "payload_decode",
            SyncError::PayloadEncode(_) => "payload_encode",
            SyncError::Storage(_) => "storage",
            SyncError::Writeback { .. } => "writeback",
            SyncError::StaleCursor { .. } => "stale_cursor",
        }
    }
}
