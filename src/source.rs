//! Source reader: item rows out of the Sierra DNA database.
//!
//! [`SierraSource`] is the seam to the upstream database. [`read`] wraps
//! any source and enforces the read contract the rest of the pipeline
//! relies on: rows strictly newer than the cursor, in ascending cursor
//! order, one row per item, with the source clock captured at query start
//! as the next cursor candidate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::SyncError;
use crate::models::{SourceItemRecord, SyncCursor, SyncJobParameters};

/// A window to read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceQuery {
    /// Items with `item_record_id > last_synced_id`, at most `limit` rows.
    AfterId { last_synced_id: i64, limit: i64 },
    /// Items whose item or bib record changed after `timestamp`.
    ChangedSince { timestamp: DateTime<Utc> },
}

impl SourceQuery {
    pub fn from_parameters(params: &SyncJobParameters) -> Self {
        match params.cursor {
            SyncCursor::SyncFull {
                last_synced_id,
                batch_size,
            } => SourceQuery::AfterId {
                last_synced_id,
                limit: batch_size,
            },
            SyncCursor::SyncChanges { timestamp } => SourceQuery::ChangedSince { timestamp },
        }
    }
}

/// Rows of one query plus the source clock read in the same snapshot.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub as_of: DateTime<Utc>,
    pub rows: Vec<SourceItemRecord>,
}

/// Upstream item source.
///
/// Implementations must read `as_of` from the source's own clock in the
/// same snapshot as the rows, before the rows are selected. Connectivity or
/// authentication failures surface as [`SyncError::SourceUnavailable`] and
/// are not retried here.
#[async_trait]
pub trait SierraSource: Send + Sync {
    async fn snapshot(
        &self,
        query: &SourceQuery,
        timezone: &str,
    ) -> Result<SourceSnapshot, SyncError>;
}

/// Reads the window described by `params`.
///
/// Returns the rows and the next cursor candidate (the source's as-of time).
pub async fn read(
    source: &dyn SierraSource,
    params: &SyncJobParameters,
) -> Result<SourceSnapshot, SyncError> {
    let query = SourceQuery::from_parameters(params);
    let snapshot = source.snapshot(&query, &params.source_timezone).await?;
    let fetched = snapshot.rows.len();
    let rows = normalize(&query, snapshot.rows);

    if rows.len() != fetched {
        tracing::debug!(
            fetched,
            kept = rows.len(),
            "dropped rows outside the window or duplicated by bib links"
        );
    }

    Ok(SourceSnapshot {
        as_of: snapshot.as_of,
        rows,
    })
}

/// Keeps rows strictly past the cursor, one per item, in cursor order.
fn normalize(query: &SourceQuery, rows: Vec<SourceItemRecord>) -> Vec<SourceItemRecord> {
    // Later rows win: an item linked to an updated bib can appear twice.
    let mut by_id: HashMap<i64, SourceItemRecord> = HashMap::with_capacity(rows.len());
    for row in rows {
        let keep = match query {
            SourceQuery::AfterId { last_synced_id, .. } => row.item_record_id > *last_synced_id,
            SourceQuery::ChangedSince { timestamp } => row.record_last_updated > *timestamp,
        };
        if keep {
            by_id.insert(row.item_record_id, row);
        }
    }

    let mut rows: Vec<SourceItemRecord> = by_id.into_values().collect();
    match query {
        SourceQuery::AfterId { limit, .. } => {
            rows.sort_by_key(|r| r.item_record_id);
            if *limit > 0 {
                rows.truncate(*limit as usize);
            }
        }
        SourceQuery::ChangedSince { .. } => {
            rows.sort_by_key(|r| (r.record_last_updated, r.item_record_id));
        }
    }
    rows
}

// ============ PostgreSQL (Sierra DNA) ============

const ITEM_COLUMNS: &str = r#"
    item.record_id::bigint AS item_record_id,
    concat('i', item_meta.record_num, item_meta.agency_code_num) AS item_number,
    item_prop.barcode::text AS barcode,
    link.bib_record_id::bigint AS bib_record_id,
    CASE WHEN bib_meta.id IS NULL THEN NULL
         ELSE concat('b', bib_meta.record_num, bib_meta.agency_code_num) END AS bib_number,
    bib_prop.best_author::text AS best_author,
    bib_prop.best_title::text AS best_title,
    item.itype_code_num::smallint AS itype_code_num,
    itype.name::text AS item_type_name,
    bib_prop.material_code::text AS material_code,
    material.name::text AS material_name,
    classification.classification AS classification,
    main_entry.main_entry_json AS main_entry_json,
    GREATEST(item_meta.record_last_updated_gmt, bib_meta.record_last_updated_gmt)::timestamptz AS record_last_updated
"#;

const ITEM_JOINS: &str = r#"
    JOIN sierra_view.record_metadata item_meta ON item_meta.id = item.record_id
    LEFT JOIN sierra_view.item_record_property item_prop ON item_prop.item_record_id = item.record_id
    LEFT JOIN sierra_view.itype_property_myuser itype ON itype.code = item.itype_code_num
    LEFT JOIN sierra_view.bib_record_item_record_link link ON link.item_record_id = item.record_id
    LEFT JOIN sierra_view.record_metadata bib_meta ON bib_meta.id = link.bib_record_id
    LEFT JOIN sierra_view.bib_record_property bib_prop ON bib_prop.bib_record_id = link.bib_record_id
    LEFT JOIN sierra_view.material_property_myuser material ON material.code = bib_prop.material_code
    LEFT JOIN LATERAL (
        SELECT MAX(sf.content)::text AS classification
        FROM sierra_view.subfield sf
        WHERE sf.record_id = link.bib_record_id AND sf.marc_tag = '097'
    ) classification ON TRUE
    LEFT JOIN LATERAL (
        SELECT json_agg(json_build_object(
            'marc_tag', sf.marc_tag,
            'marc_ind1', sf.marc_ind1,
            'marc_ind2', sf.marc_ind2,
            'field_type_code', sf.field_type_code,
            'tag', sf.tag,
            'content', sf.content
        ))::text AS main_entry_json
        FROM sierra_view.subfield sf
        WHERE sf.record_id = link.bib_record_id
          AND sf.marc_tag IN ('100', '110', '111', '130', '245')
    ) main_entry ON TRUE
"#;

fn after_id_sql() -> String {
    format!(
        r#"
        WITH item AS (
            SELECT record_id, itype_code_num
            FROM sierra_view.item_record
            WHERE record_id > $1
            ORDER BY record_id
            LIMIT $2
        )
        SELECT {columns}
        FROM item
        {joins}
        ORDER BY item_record_id
        "#,
        columns = ITEM_COLUMNS,
        joins = ITEM_JOINS
    )
}

fn changed_since_sql() -> String {
    format!(
        r#"
        WITH updated AS (
            SELECT id, record_type_code
            FROM sierra_view.record_metadata
            WHERE record_last_updated_gmt > $1
              AND record_type_code IN ('i', 'b')
        ),
        touched AS (
            SELECT id AS item_record_id FROM updated WHERE record_type_code = 'i'
            UNION
            SELECT l.item_record_id
            FROM sierra_view.bib_record_item_record_link l
            JOIN updated u ON u.record_type_code = 'b' AND u.id = l.bib_record_id
        ),
        item AS (
            SELECT ir.record_id, ir.itype_code_num
            FROM sierra_view.item_record ir
            JOIN touched t ON t.item_record_id = ir.record_id
        )
        SELECT {columns}
        FROM item
        {joins}
        ORDER BY record_last_updated, item_record_id
        "#,
        columns = ITEM_COLUMNS,
        joins = ITEM_JOINS
    )
}

fn source_error(context: &str, e: sqlx::Error) -> SyncError {
    SyncError::SourceUnavailable(format!("{}: {}", context, e))
}

fn item_from_row(row: &PgRow) -> Result<SourceItemRecord, SyncError> {
    let get_err = |e: sqlx::Error| source_error("unexpected row shape", e);
    Ok(SourceItemRecord {
        item_record_id: row.try_get("item_record_id").map_err(get_err)?,
        item_number: row.try_get("item_number").map_err(get_err)?,
        barcode: row.try_get("barcode").map_err(get_err)?,
        bib_record_id: row.try_get("bib_record_id").map_err(get_err)?,
        bib_number: row.try_get("bib_number").map_err(get_err)?,
        best_author: row.try_get("best_author").map_err(get_err)?,
        best_title: row.try_get("best_title").map_err(get_err)?,
        itype_code_num: row.try_get("itype_code_num").map_err(get_err)?,
        item_type_name: row.try_get("item_type_name").map_err(get_err)?,
        material_code: row.try_get("material_code").map_err(get_err)?,
        material_name: row.try_get("material_name").map_err(get_err)?,
        classification: row.try_get("classification").map_err(get_err)?,
        main_entry_json: row.try_get("main_entry_json").map_err(get_err)?,
        record_last_updated: row.try_get("record_last_updated").map_err(get_err)?,
    })
}

/// Sierra DNA over PostgreSQL.
///
/// Each snapshot runs in one read-only REPEATABLE READ transaction, so
/// `now()` (the transaction start time) is the as-of time of every row the
/// query sees.
pub struct PgSierraSource {
    pool: PgPool,
}

impl PgSierraSource {
    /// Builds a lazily connecting pool; nothing touches the network until
    /// the first snapshot.
    pub fn new(config: &SourceConfig) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(&config.url)
            .map_err(|e| source_error("invalid source url", e))?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SierraSource for PgSierraSource {
    async fn snapshot(
        &self,
        query: &SourceQuery,
        timezone: &str,
    ) -> Result<SourceSnapshot, SyncError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| source_error("connect", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| source_error("begin snapshot", e))?;
        sqlx::query("SELECT set_config('TimeZone', $1, true)")
            .bind(timezone)
            .execute(&mut *tx)
            .await
            .map_err(|e| source_error("set timezone", e))?;

        let as_of: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| source_error("read source clock", e))?;

        let rows = match query {
            SourceQuery::AfterId {
                last_synced_id,
                limit,
            } => sqlx::query(&after_id_sql())
                .bind(*last_synced_id)
                .bind(*limit)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| source_error("full sync query", e))?,
            SourceQuery::ChangedSince { timestamp } => sqlx::query(&changed_since_sql())
                .bind(*timestamp)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| source_error("changes query", e))?,
        };

        let rows = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        tx.rollback()
            .await
            .map_err(|e| source_error("end snapshot", e))?;

        Ok(SourceSnapshot { as_of, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(id: i64, minute: u32) -> SourceItemRecord {
        SourceItemRecord {
            item_record_id: id,
            item_number: None,
            barcode: None,
            bib_record_id: None,
            bib_number: None,
            best_author: None,
            best_title: None,
            itype_code_num: None,
            item_type_name: None,
            material_code: None,
            material_name: None,
            classification: None,
            main_entry_json: None,
            record_last_updated: Utc.with_ymd_and_hms(2025, 7, 28, 10, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_after_id_keeps_strictly_greater_ascending() {
        let query = SourceQuery::AfterId {
            last_synced_id: 1000,
            limit: 10,
        };
        let rows = normalize(&query, vec![row(1005, 0), row(1000, 0), row(1001, 0)]);
        let ids: Vec<i64> = rows.iter().map(|r| r.item_record_id).collect();
        assert_eq!(ids, vec![1001, 1005]);
    }

    #[test]
    fn test_after_id_respects_limit() {
        let query = SourceQuery::AfterId {
            last_synced_id: 0,
            limit: 2,
        };
        let rows = normalize(&query, vec![row(3, 0), row(1, 0), row(2, 0)]);
        let ids: Vec<i64> = rows.iter().map(|r| r.item_record_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_changed_since_excludes_cursor_timestamp() {
        let cursor = Utc.with_ymd_and_hms(2025, 7, 28, 10, 5, 0).unwrap();
        let query = SourceQuery::ChangedSince { timestamp: cursor };
        let rows = normalize(&query, vec![row(1, 10), row(2, 5), row(3, 4), row(4, 6)]);
        let ids: Vec<i64> = rows.iter().map(|r| r.item_record_id).collect();
        assert_eq!(ids, vec![4, 1]);
        assert!(rows.iter().all(|r| r.record_last_updated > cursor));
    }

    #[test]
    fn test_changed_since_deduplicates_items() {
        let cursor = Utc.with_ymd_and_hms(2025, 7, 28, 10, 0, 0).unwrap();
        let query = SourceQuery::ChangedSince { timestamp: cursor };
        let rows = normalize(&query, vec![row(7, 3), row(7, 3), row(8, 1)]);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_query_from_parameters() {
        let params = SyncJobParameters {
            cursor: SyncCursor::SyncFull {
                last_synced_id: 42,
                batch_size: 100,
            },
            source_timezone: "UTC".to_string(),
        };
        assert_eq!(
            SourceQuery::from_parameters(&params),
            SourceQuery::AfterId {
                last_synced_id: 42,
                limit: 100
            }
        );
    }
}
