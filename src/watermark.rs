//! Persisted synchronization cursor.
//!
//! The backend owns a single `sync_state` row holding the current mode, the
//! full-sync id cursor and the changes timestamp cursor. Job parameters are
//! derived from it on every `GET /sync/`, and it only moves inside the same
//! transaction that upserts a batch (see [`crate::merge`]).

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::{Executor, Row, Sqlite, SqliteConnection, SqlitePool};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{SyncCursor, SyncJobParameters, SyncMode, SyncState};

/// What to do when the changes cursor lags further behind than
/// `sync.max_sync_delta_minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Fall back to SYNC_FULL from id 0 and reseed the changes cursor.
    #[default]
    FullResync,
    /// Move the window start to `now - max delta`. Changes older than that
    /// are not re-read.
    Clamp,
    /// Refuse to hand out parameters until an operator intervenes.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Exceeded { lag: Duration, max: Duration },
}

pub fn check_staleness(
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    max_delta_minutes: Option<i64>,
) -> Staleness {
    let Some(minutes) = max_delta_minutes else {
        return Staleness::Fresh;
    };
    let max = Duration::minutes(minutes);
    let lag = now - since;
    if lag > max {
        Staleness::Exceeded { lag, max }
    } else {
        Staleness::Fresh
    }
}

/// Best guess of the source clock at backend time `now`.
///
/// The last accepted as-of time is a source clock reading taken shortly
/// before `last_run_completed` on the backend clock, so adding the backend
/// time elapsed since then cancels any skew between the two clocks. Without
/// a completed run the backend clock is all there is.
pub fn estimate_source_now(
    since: DateTime<Utc>,
    last_run_completed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match last_run_completed {
        Some(done) => since + (now - done).max(Duration::zero()),
        None => now,
    }
}

/// The cursor a batch was read for, sent back with the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Full { last_synced_id: i64 },
    Changes,
}

impl BatchOrigin {
    pub fn mode(&self) -> SyncMode {
        match self {
            BatchOrigin::Full { .. } => SyncMode::SyncFull,
            BatchOrigin::Changes => SyncMode::SyncChanges,
        }
    }

    /// Whether the state still expects this batch. A changes batch only
    /// needs the mode to match: the served window start may be clamped.
    fn matches(&self, state: &SyncState) -> bool {
        match self {
            BatchOrigin::Full { last_synced_id } => {
                state.sync_mode == SyncMode::SyncFull && state.last_synced_id == *last_synced_id
            }
            BatchOrigin::Changes => state.sync_mode == SyncMode::SyncChanges,
        }
    }
}

/// Summary of a decoded batch, enough to move the cursor.
#[derive(Debug, Clone, Copy)]
pub struct BatchSummary {
    pub origin: BatchOrigin,
    pub row_count: usize,
    pub max_item_record_id: Option<i64>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WatermarkAdvance {
    pub before: SyncState,
    pub after: SyncState,
    /// False when the batch was read for a cursor the state has moved past.
    pub applied: bool,
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(value: i64) -> Result<DateTime<Utc>, SyncError> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| {
        SyncError::Storage(sqlx::Error::Decode(
            format!("timestamp out of range: {}", value).into(),
        ))
    })
}

fn opt_from_micros(value: Option<i64>) -> Result<Option<DateTime<Utc>>, SyncError> {
    value.map(from_micros).transpose()
}

pub async fn load_state<'e, E>(executor: E) -> Result<SyncState, SyncError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT sync_mode, last_synced_id, sync_changes_since, initialized_at,
               full_sync_completed_at, last_sync_run_completed_at
        FROM sync_state WHERE id = 1
        "#,
    )
    .fetch_one(executor)
    .await?;

    let mode: String = row.try_get("sync_mode")?;
    let sync_mode = mode
        .parse::<SyncMode>()
        .map_err(|e| SyncError::Storage(sqlx::Error::Decode(e.into())))?;

    Ok(SyncState {
        sync_mode,
        last_synced_id: row.try_get("last_synced_id")?,
        sync_changes_since: opt_from_micros(row.try_get("sync_changes_since")?)?,
        initialized_at: from_micros(row.try_get("initialized_at")?)?,
        full_sync_completed_at: opt_from_micros(row.try_get("full_sync_completed_at")?)?,
        last_sync_run_completed_at: opt_from_micros(row.try_get("last_sync_run_completed_at")?)?,
    })
}

async fn store_state(conn: &mut SqliteConnection, state: &SyncState) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        UPDATE sync_state SET
            sync_mode = ?,
            last_synced_id = ?,
            sync_changes_since = ?,
            full_sync_completed_at = ?,
            last_sync_run_completed_at = ?
        WHERE id = 1
        "#,
    )
    .bind(state.sync_mode.as_str())
    .bind(state.last_synced_id)
    .bind(state.sync_changes_since.map(to_micros))
    .bind(state.full_sync_completed_at.map(to_micros))
    .bind(state.last_sync_run_completed_at.map(to_micros))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn force_full_resync(conn: &mut SqliteConnection) -> Result<(), SyncError> {
    sqlx::query(
        "UPDATE sync_state SET sync_mode = ?, last_synced_id = 0, sync_changes_since = NULL WHERE id = 1",
    )
    .bind(SyncMode::SyncFull.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Produces the parameters for the next ETL run, applying the staleness
/// guard to the changes cursor.
pub async fn job_parameters(
    pool: &SqlitePool,
    sync: &SyncConfig,
    now: DateTime<Utc>,
) -> Result<SyncJobParameters, SyncError> {
    let mut tx = pool.begin().await?;
    let state = load_state(&mut *tx).await?;
    let restart = SyncCursor::SyncFull {
        last_synced_id: 0,
        batch_size: sync.full_sync_batch_size,
    };

    let cursor = match (state.sync_mode, state.sync_changes_since) {
        (SyncMode::SyncFull, _) => SyncCursor::SyncFull {
            last_synced_id: state.last_synced_id,
            batch_size: sync.full_sync_batch_size,
        },
        (SyncMode::SyncChanges, None) => {
            tracing::warn!("SYNC_CHANGES without a changes cursor, restarting full sync");
            force_full_resync(&mut tx).await?;
            restart
        }
        (SyncMode::SyncChanges, Some(since)) => {
            let source_now = estimate_source_now(since, state.last_sync_run_completed_at, now);
            match check_staleness(since, source_now, sync.max_sync_delta_minutes) {
                Staleness::Fresh => SyncCursor::SyncChanges { timestamp: since },
                Staleness::Exceeded { lag, max } => match sync.staleness_policy {
                    StalenessPolicy::FullResync => {
                        tracing::warn!(
                            since = %since,
                            lag_minutes = lag.num_minutes(),
                            max_minutes = max.num_minutes(),
                            "changes cursor too stale, forcing full resync"
                        );
                        force_full_resync(&mut tx).await?;
                        restart
                    }
                    StalenessPolicy::Clamp => {
                        let start = source_now - max;
                        tracing::warn!(
                            since = %since,
                            clamped_to = %start,
                            "changes cursor too stale, clamping window; changes in between are not re-read"
                        );
                        SyncCursor::SyncChanges { timestamp: start }
                    }
                    StalenessPolicy::Reject => {
                        tracing::error!(
                            since = %since,
                            lag_minutes = lag.num_minutes(),
                            "changes cursor too stale, refusing to serve job parameters"
                        );
                        return Err(SyncError::StaleCursor {
                            lag_minutes: lag.num_minutes(),
                            max_minutes: max.num_minutes(),
                        });
                    }
                },
            }
        }
    };

    tx.commit().await?;

    Ok(SyncJobParameters {
        cursor,
        source_timezone: sync.source_timezone.clone(),
    })
}

/// Moves the cursor for an accepted batch. Must run inside the transaction
/// that upserted the batch rows.
///
/// The id cursor never decreases and the changes cursor never moves back,
/// so re-delivering an old batch leaves the state untouched apart from
/// `last_sync_run_completed_at`.
///
/// A batch read for another mode or another full-sync cursor than the
/// current one (a late or re-delivered upload racing a forced resync) does
/// not move the state at all.
pub async fn advance(
    conn: &mut SqliteConnection,
    batch: &BatchSummary,
    sync: &SyncConfig,
    now: DateTime<Utc>,
) -> Result<WatermarkAdvance, SyncError> {
    let before = load_state(&mut *conn).await?;
    if !batch.origin.matches(&before) {
        tracing::warn!(
            batch_mode = %batch.origin.mode(),
            state_mode = %before.sync_mode,
            state_last_synced_id = before.last_synced_id,
            "batch was read for an outdated cursor, watermark left unchanged"
        );
        return Ok(WatermarkAdvance {
            after: before.clone(),
            before,
            applied: false,
        });
    }
    let mut after = before.clone();

    match before.sync_mode {
        SyncMode::SyncFull => {
            if let Some(max_id) = batch.max_item_record_id {
                after.last_synced_id = before.last_synced_id.max(max_id);
            }
            // The first full batch seeds the changes cursor, so edits made
            // while the full sync runs are picked up afterwards.
            if after.sync_changes_since.is_none() {
                after.sync_changes_since = Some(batch.as_of);
            }
            if (batch.row_count as i64) < sync.full_sync_batch_size {
                after.sync_mode = SyncMode::SyncChanges;
                after.full_sync_completed_at = Some(now);
            }
        }
        SyncMode::SyncChanges => {
            after.sync_changes_since = match before.sync_changes_since {
                Some(since) if since >= batch.as_of => Some(since),
                _ => Some(batch.as_of),
            };
        }
    }
    after.last_sync_run_completed_at = Some(now);

    store_state(conn, &after).await?;
    Ok(WatermarkAdvance {
        before,
        after,
        applied: true,
    })
}
