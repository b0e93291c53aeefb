//! Core data models shared by the ETL worker and the backend.
//!
//! Rows flow `SourceItemRecord` (Sierra DNA) → `SyncBatch` (gzip TSV on the
//! wire) → `BackendItemRecord` (backend store). `SyncJobParameters` travel
//! the other way and tell the worker which window to read next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two synchronization strategies the backend can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    /// Walk the whole item table by ascending record id.
    SyncFull,
    /// Read items whose record changed after a timestamp.
    SyncChanges,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::SyncFull => "SYNC_FULL",
            SyncMode::SyncChanges => "SYNC_CHANGES",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNC_FULL" => Ok(SyncMode::SyncFull),
            "SYNC_CHANGES" => Ok(SyncMode::SyncChanges),
            other => Err(format!("unknown sync mode: {}", other)),
        }
    }
}

/// Cursor of one job run. Serialized with the mode as tag:
/// `{"sync_mode": "SYNC_FULL", "last_synced_id": 0, "batch_size": 80000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sync_mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncCursor {
    SyncFull { last_synced_id: i64, batch_size: i64 },
    SyncChanges { timestamp: DateTime<Utc> },
}

/// Parameters of one ETL job run, produced by `GET /sync/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobParameters {
    #[serde(flatten)]
    pub cursor: SyncCursor,
    pub source_timezone: String,
}

impl SyncCursor {
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncCursor::SyncFull { .. } => SyncMode::SyncFull,
            SyncCursor::SyncChanges { .. } => SyncMode::SyncChanges,
        }
    }
}

impl SyncJobParameters {
    pub fn mode(&self) -> SyncMode {
        self.cursor.mode()
    }
}

/// One item row read from Sierra. Field order is the batch column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItemRecord {
    pub item_record_id: i64,
    pub item_number: Option<String>,
    pub barcode: Option<String>,
    pub bib_record_id: Option<i64>,
    pub bib_number: Option<String>,
    pub best_author: Option<String>,
    pub best_title: Option<String>,
    pub itype_code_num: Option<i16>,
    pub item_type_name: Option<String>,
    pub material_code: Option<String>,
    pub material_name: Option<String>,
    pub classification: Option<String>,
    /// MARC 100/110/111/130/245 subfields of the linked bib as a JSON array.
    pub main_entry_json: Option<String>,
    /// Latest of the item's and the bib's last-update time.
    pub record_last_updated: DateTime<Utc>,
}

/// Encoded batch ready for upload.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    /// Gzip-compressed tab-separated rows with a header line.
    pub payload: Vec<u8>,
    /// Source database clock at query start; the next changes cursor.
    pub as_of: DateTime<Utc>,
    pub row_count: usize,
    /// Cursor the rows were read for.
    pub read_for: SyncCursor,
}

/// An item as persisted in the backend store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendItemRecord {
    pub item_record_id: i64,
    pub item_number: Option<String>,
    pub barcode: Option<String>,
    pub bib_record_id: Option<i64>,
    pub bib_number: Option<String>,
    pub best_author: Option<String>,
    pub best_title: Option<String>,
    pub itype_code_num: Option<i16>,
    pub item_type_name: Option<String>,
    pub material_code: Option<String>,
    pub material_name: Option<String>,
    pub classification: Option<String>,
    pub main_entry_json: Option<String>,
    pub shelfmark: String,
    pub record_last_updated: DateTime<Utc>,
    /// As-of time of the batch that last wrote this row.
    pub synced_at: DateTime<Utc>,
    pub in_update_queue: bool,
}

/// Persisted singleton sync state (the watermark).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub sync_mode: SyncMode,
    pub last_synced_id: i64,
    pub sync_changes_since: Option<DateTime<Utc>>,
    pub initialized_at: DateTime<Utc>,
    pub full_sync_completed_at: Option<DateTime<Utc>>,
    pub last_sync_run_completed_at: Option<DateTime<Utc>>,
}
