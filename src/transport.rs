//! HTTP client the ETL worker uses to talk to the backend.

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

use crate::codec;
use crate::config::EtlConfig;
use crate::error::SyncError;
use crate::models::{SyncBatch, SyncCursor, SyncJobParameters, SyncMode};

/// Backend answer to an accepted batch.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    pub upserted: usize,
    pub sync_mode: SyncMode,
    /// False when the backend stored the rows but had already moved past
    /// the cursor they were read for.
    #[serde(default = "default_true")]
    pub watermark_advanced: bool,
}

fn default_true() -> bool {
    true
}

pub struct BackendClient {
    http: reqwest::Client,
    sync_url: String,
    params_timeout: Duration,
    upload_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &EtlConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sierra-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::BackendUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            sync_url: format!("{}/sync/", config.backend_url.trim_end_matches('/')),
            params_timeout: Duration::from_secs(config.params_timeout_secs),
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
        })
    }

    /// `GET /sync/`: parameters for the next run.
    pub async fn fetch_parameters(&self) -> Result<SyncJobParameters, SyncError> {
        let resp = self
            .http
            .get(&self.sync_url)
            .timeout(self.params_timeout)
            .send()
            .await
            .map_err(|e| SyncError::BackendUnavailable(format!("GET /sync/: {}", e)))?;

        let resp = check_status("GET /sync/", resp).await?;
        resp.json::<SyncJobParameters>()
            .await
            .map_err(|e| SyncError::BackendUnavailable(format!("GET /sync/ body: {}", e)))
    }

    /// `POST /sync/`: multipart upload of one batch, with the cursor it
    /// was read for.
    ///
    /// Only a 2xx answer counts as acceptance. Timeouts and every other
    /// status are errors, and the caller must not assume anything was
    /// stored.
    pub async fn upload(&self, batch: &SyncBatch) -> Result<UploadReceipt, SyncError> {
        let file = Part::bytes(batch.payload.clone())
            .file_name(codec::FILE_NAME)
            .mime_str(codec::CONTENT_TYPE)
            .map_err(|e| SyncError::BackendUnavailable(format!("multipart: {}", e)))?;
        let mut form = Form::new()
            .text("timestamp", batch.as_of.to_rfc3339())
            .text("sync_mode", batch.read_for.mode().as_str());
        if let SyncCursor::SyncFull { last_synced_id, .. } = batch.read_for {
            form = form.text("last_synced_id", last_synced_id.to_string());
        }
        let form = form.part("file", file);

        let resp = self
            .http
            .post(&self.sync_url)
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SyncError::BackendUnavailable(format!("POST /sync/: {}", e)))?;

        let resp = check_status("POST /sync/", resp).await?;
        resp.json::<UploadReceipt>()
            .await
            .map_err(|e| SyncError::BackendUnavailable(format!("POST /sync/ body: {}", e)))
    }
}

async fn check_status(
    call: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::BackendUnavailable(format!(
        "{} returned {}: {}",
        call, status, body
    )))
}
