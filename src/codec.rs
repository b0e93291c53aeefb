//! Batch wire format: gzip-compressed, tab-separated rows with a header.
//!
//! The column order is fixed by [`COLUMNS`]; decoding rejects any payload
//! whose header differs, and any row that does not fit
//! [`SourceItemRecord`]. An empty row set encodes to a header-only payload.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::SyncError;
use crate::models::SourceItemRecord;

pub const COLUMNS: [&str; 14] = [
    "item_record_id",
    "item_number",
    "barcode",
    "bib_record_id",
    "bib_number",
    "best_author",
    "best_title",
    "itype_code_num",
    "item_type_name",
    "material_code",
    "material_name",
    "classification",
    "main_entry_json",
    "record_last_updated",
];

pub const CONTENT_TYPE: &str = "application/gzip";
pub const FILE_NAME: &str = "data.tsv.gz";

pub fn encode(rows: &[SourceItemRecord]) -> Result<Vec<u8>, SyncError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(encoder);

    // Written explicitly so an empty batch still carries its header.
    writer
        .write_record(COLUMNS)
        .map_err(|e| SyncError::PayloadEncode(e.to_string()))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| SyncError::PayloadEncode(format!("item {}: {}", row.item_record_id, e)))?;
    }

    let encoder = writer
        .into_inner()
        .map_err(|e| SyncError::PayloadEncode(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SyncError::PayloadEncode(e.to_string()))
}

pub fn decode(payload: &[u8]) -> Result<Vec<SourceItemRecord>, SyncError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(GzDecoder::new(payload));

    let headers = reader
        .headers()
        .map_err(|e| SyncError::PayloadDecode(e.to_string()))?
        .clone();
    if headers.is_empty() {
        return Ok(Vec::new());
    }
    if headers.iter().ne(COLUMNS.iter().copied()) {
        return Err(SyncError::PayloadDecode(format!(
            "unexpected columns: {}",
            headers.iter().collect::<Vec<_>>().join(",")
        )));
    }

    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<SourceItemRecord>().enumerate() {
        let row = result
            .map_err(|e| SyncError::PayloadDecode(format!("row {}: {}", index + 1, e)))?;
        rows.push(row);
    }
    Ok(rows)
}
