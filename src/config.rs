use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::{JobSchedule, MisfirePolicy};
use crate::watermark::StalenessPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub etl: Option<EtlConfig>,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub sierra: Option<SierraConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    256 * 1024 * 1024
}

/// Backend-side sync policy: how job parameters are produced and how the
/// watermark reacts to merged batches.
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_full_sync_batch_size")]
    pub full_sync_batch_size: i64,
    /// Maximum allowed lag of the changes cursor. `None` disables the guard.
    #[serde(default)]
    pub max_sync_delta_minutes: Option<i64>,
    #[serde(default)]
    pub staleness_policy: StalenessPolicy,
    #[serde(default = "default_source_timezone")]
    pub source_timezone: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_sync_batch_size: default_full_sync_batch_size(),
            max_sync_delta_minutes: None,
            staleness_policy: StalenessPolicy::default(),
            source_timezone: default_source_timezone(),
        }
    }
}

fn default_full_sync_batch_size() -> i64 {
    80_000
}
fn default_source_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EtlConfig {
    pub backend_url: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default = "default_params_timeout_secs")]
    pub params_timeout_secs: u64,
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

impl EtlConfig {
    pub fn schedule(&self) -> JobSchedule {
        JobSchedule {
            interval: Duration::from_secs(self.interval_secs),
            misfire_grace: Duration::from_secs(self.misfire_grace_secs),
            misfire_policy: self.misfire_policy,
        }
    }
}

fn default_interval_secs() -> u64 {
    30
}
fn default_misfire_grace_secs() -> u64 {
    10
}
fn default_params_timeout_secs() -> u64 {
    4
}
fn default_upload_timeout_secs() -> u64 {
    60
}

/// Connection to the Sierra DNA PostgreSQL database.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_source_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_source_max_connections() -> u32 {
    2
}
fn default_acquire_timeout_secs() -> u64 {
    30
}

/// Sierra REST API used by the write-back scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct SierraConfig {
    pub endpoint: String,
    pub client_key: String,
    pub client_secret: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_sierra_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_interval_secs")]
    pub update_interval_secs: u64,
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    /// Queued records pushed per tick. Zero means no limit.
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: i64,
    #[serde(default = "default_true")]
    pub set_iuse3: bool,
    #[serde(default = "default_true")]
    pub set_inventory_date: bool,
}

impl SierraConfig {
    pub fn schedule(&self) -> JobSchedule {
        JobSchedule {
            interval: Duration::from_secs(self.update_interval_secs),
            misfire_grace: Duration::from_secs(self.misfire_grace_secs),
            misfire_policy: self.misfire_policy,
        }
    }
}

fn default_pool_size() -> usize {
    4
}
fn default_sierra_timeout_secs() -> u64 {
    10
}
fn default_retries() -> u32 {
    3
}
fn default_batch_size_limit() -> i64 {
    20
}
fn default_true() -> bool {
    true
}

impl Config {
    pub fn etl(&self) -> Result<&EtlConfig> {
        self.etl
            .as_ref()
            .context("[etl] section is required for this command")
    }

    pub fn source(&self) -> Result<&SourceConfig> {
        self.source
            .as_ref()
            .context("[source] section is required for this command")
    }

    pub fn sierra(&self) -> Result<&SierraConfig> {
        self.sierra
            .as_ref()
            .context("[sierra] section is required for this command")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.sync.full_sync_batch_size < 1 {
        anyhow::bail!("sync.full_sync_batch_size must be >= 1");
    }
    if let Some(delta) = config.sync.max_sync_delta_minutes {
        if delta < 1 {
            anyhow::bail!("sync.max_sync_delta_minutes must be >= 1 when set");
        }
    }
    if config.sync.source_timezone.trim().is_empty() {
        anyhow::bail!("sync.source_timezone must not be empty");
    }

    if let Some(etl) = &config.etl {
        if etl.interval_secs == 0 {
            anyhow::bail!("etl.interval_secs must be > 0");
        }
        if !etl.backend_url.starts_with("http://") && !etl.backend_url.starts_with("https://") {
            anyhow::bail!("etl.backend_url must be an http(s) URL");
        }
    }

    if let Some(source) = &config.source {
        if source.max_connections == 0 {
            anyhow::bail!("source.max_connections must be > 0");
        }
    }

    if let Some(sierra) = &config.sierra {
        if sierra.update_interval_secs == 0 {
            anyhow::bail!("sierra.update_interval_secs must be > 0");
        }
        if sierra.batch_size_limit < 0 {
            anyhow::bail!("sierra.batch_size_limit must be >= 0");
        }
        if sierra.pool_size == 0 {
            anyhow::bail!("sierra.pool_size must be > 0");
        }
    }

    Ok(())
}
