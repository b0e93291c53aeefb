//! # Sierra Sync CLI (`sierra-sync`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sierra-sync init` | Create the backend store and the sync state row |
//! | `sierra-sync serve` | Run the backend API and the write-back scheduler |
//! | `sierra-sync etl` | Run the ETL worker loop (`--once` for one iteration) |
//! | `sierra-sync writeback --once` | Push the write-back queue once |
//! | `sierra-sync status` | Print the sync state |
//!
//! ```bash
//! sierra-sync --config ./config/sierra-sync.toml init
//! sierra-sync --config ./config/sierra-sync.toml serve
//! sierra-sync --config ./config/sierra-sync.toml etl
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sierra_sync::config::{load_config, Config};
use sierra_sync::{db, etl, merge, migrate, server, watermark, writeback};

#[derive(Parser)]
#[command(
    name = "sierra-sync",
    about = "Sierra LMS item synchronisation: ETL worker, merge backend and write-back scheduler",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sierra-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the backend store. Safe to run repeatedly.
    Init,

    /// Run the backend HTTP API and, with `[sierra]` configured, the
    /// write-back scheduler.
    Serve,

    /// Run the ETL worker against the Sierra database and the backend.
    Etl {
        /// Run a single iteration and exit non-zero if it aborted.
        #[arg(long)]
        once: bool,
    },

    /// Push queued item updates to the Sierra REST API.
    Writeback {
        /// Run a single tick. Required; the scheduler loop runs under `serve`.
        #[arg(long)]
        once: bool,
    },

    /// Print the persisted sync state and write-back queue size.
    Status,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Initialized backend store at {}", config.db.path.display());
        }
        Commands::Serve => {
            server::run_server(&config).await?;
        }
        Commands::Etl { once } => {
            etl::run_worker(&config, once).await?;
        }
        Commands::Writeback { once } => {
            if !once {
                anyhow::bail!("the write-back loop runs under `serve`; use `writeback --once`");
            }
            let sierra = config.sierra()?;
            let pool = db::connect(&config.db).await?;
            migrate::run_migrations(&pool).await?;
            let client = writeback::SierraApiClient::new(sierra)?;
            let report = writeback::run_tick(&pool, &client, sierra).await?;
            pool.close().await;
            println!(
                "attempted: {}, updated: {}, failed: {}",
                report.attempted, report.updated, report.failed
            );
        }
        Commands::Status => {
            let pool = db::connect(&config.db).await?;
            migrate::run_migrations(&pool).await?;
            let state = watermark::load_state(&pool).await?;
            let items = merge::item_count(&pool).await?;
            let queued = writeback::queued_count(&pool).await?;
            pool.close().await;

            let fmt_ts = |ts: Option<chrono::DateTime<chrono::Utc>>| {
                ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
            };
            println!("sync_mode:                  {}", state.sync_mode);
            println!("last_synced_id:             {}", state.last_synced_id);
            println!("sync_changes_since:         {}", fmt_ts(state.sync_changes_since));
            println!("initialized_at:             {}", state.initialized_at.to_rfc3339());
            println!("full_sync_completed_at:     {}", fmt_ts(state.full_sync_completed_at));
            println!("last_sync_run_completed_at: {}", fmt_ts(state.last_sync_run_completed_at));
            println!("items:                      {}", items);
            println!("queued_for_writeback:       {}", queued);
        }
    }

    Ok(())
}
