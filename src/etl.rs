//! ETL worker: one iteration fetches job parameters, reads the source
//! window, encodes it and uploads it.
//!
//! ```text
//! FETCH_PARAMS → QUERY_SOURCE → ENCODE → UPLOAD → accepted
//!       └──────────────┴───────────┴───────┴──→ aborted (cursor unchanged)
//! ```
//!
//! The worker holds no cursor of its own. The backend advances the
//! watermark only when it has stored a batch, so an aborted iteration
//! simply leaves the next tick to re-read the same window.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;

use crate::clock;
use crate::codec;
use crate::config::Config;
use crate::error::SyncError;
use crate::models::{SyncBatch, SyncJobParameters, SyncMode};
use crate::source::{self, PgSierraSource, SierraSource};
use crate::transport::{BackendClient, UploadReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchParams,
    QuerySource,
    Encode,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FetchParams => "fetch_params",
            Stage::QuerySource => "query_source",
            Stage::Encode => "encode",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// Why an iteration stopped before the backend accepted its batch.
#[derive(Debug)]
pub struct IterationAborted {
    pub stage: Stage,
    pub error: SyncError,
}

impl fmt::Display for IterationAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync iteration aborted at {}: {}", self.stage, self.error)
    }
}

impl std::error::Error for IterationAborted {}

/// An iteration whose batch the backend accepted.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub params: SyncJobParameters,
    pub batch_rows: usize,
    pub receipt: UploadReceipt,
}

fn at(stage: Stage) -> impl FnOnce(SyncError) -> IterationAborted {
    move |error| IterationAborted { stage, error }
}

pub async fn run_iteration(
    backend: &BackendClient,
    source: &dyn SierraSource,
) -> Result<IterationReport, IterationAborted> {
    let params = backend
        .fetch_parameters()
        .await
        .map_err(at(Stage::FetchParams))?;
    tracing::debug!(?params, "fetched job parameters");

    let snapshot = source::read(source, &params)
        .await
        .map_err(at(Stage::QuerySource))?;

    let payload = codec::encode(&snapshot.rows).map_err(at(Stage::Encode))?;
    let batch = SyncBatch {
        payload,
        as_of: snapshot.as_of,
        row_count: snapshot.rows.len(),
        read_for: params.cursor.clone(),
    };

    let receipt = backend.upload(&batch).await.map_err(at(Stage::Upload))?;

    Ok(IterationReport {
        params,
        batch_rows: batch.row_count,
        receipt,
    })
}

/// Runs one iteration and logs its outcome. Never fails: the next tick is
/// the retry.
pub async fn run_logged_iteration(backend: &BackendClient, source: &dyn SierraSource) -> bool {
    match run_iteration(backend, source).await {
        Ok(report) => {
            let mode_changed = report.params.mode() != report.receipt.sync_mode;
            tracing::info!(
                mode = %report.params.mode(),
                rows = report.batch_rows,
                upserted = report.receipt.upserted,
                next_mode = %report.receipt.sync_mode,
                "sync batch accepted"
            );
            if !report.receipt.watermark_advanced {
                tracing::warn!("backend moved past this batch's cursor, watermark not advanced");
            }
            if mode_changed && report.receipt.sync_mode == SyncMode::SyncChanges {
                tracing::info!("full sync completed, switching to incremental sync");
            }
            true
        }
        Err(aborted) => {
            tracing::error!(
                stage = %aborted.stage,
                code = aborted.error.code(),
                error = %aborted.error,
                "sync iteration aborted, cursor unchanged"
            );
            false
        }
    }
}

/// `sierra-sync etl`: runs iterations on the configured schedule until
/// Ctrl-C, or exactly one when `once` is set.
pub async fn run_worker(config: &Config, once: bool) -> Result<()> {
    let etl = config.etl()?;
    let backend = Arc::new(BackendClient::new(etl)?);
    let pg = Arc::new(PgSierraSource::new(config.source()?)?);

    if once {
        let ok = run_logged_iteration(&backend, pg.as_ref()).await;
        pg.close().await;
        if !ok {
            anyhow::bail!("sync iteration aborted");
        }
        return Ok(());
    }

    let job_source = pg.clone();
    let handle = clock::spawn_periodic("sync_pull", etl.schedule(), move || {
        let backend = backend.clone();
        let source = job_source.clone();
        async move {
            run_logged_iteration(&backend, source.as_ref()).await;
        }
    });
    tracing::info!(
        interval_secs = etl.interval_secs,
        backend = %etl.backend_url,
        "ETL worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down ETL worker");
    handle.stop().await;
    pg.close().await;
    Ok(())
}
