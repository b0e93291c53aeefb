//! # Sierra Sync
//!
//! Periodic synchronization of Sierra LMS item records into a backend store,
//! and write-back of circulation-side updates to Sierra.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  GET /sync/   ┌──────────────┐        ┌──────────┐
//! │ ETL worker │──────────────▶│   Backend    │───────▶│  SQLite  │
//! │ (etl)      │  POST /sync/  │   (serve)    │  merge │  store   │
//! └─────┬──────┘──────────────▶└──────┬───────┘        └────┬─────┘
//!       │ SQL                         │ write-back          │ queue
//!       ▼                             ▼                     │
//! ┌────────────┐               ┌──────────────┐             │
//! │ Sierra DNA │               │ Sierra REST  │◀────────────┘
//! │ (Postgres) │               │     API      │
//! └────────────┘               └──────────────┘
//! ```
//!
//! The worker is stateless: the backend owns the watermark and hands out
//! job parameters, and the watermark moves only together with the rows of
//! an accepted batch.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`watermark`] | Persisted sync cursor and job parameters |
//! | [`source`] | Sierra DNA reader |
//! | [`codec`] | Gzip TSV batch format |
//! | [`transport`] | ETL → backend HTTP client |
//! | [`etl`] | ETL iteration and worker loop |
//! | [`merge`] | Batch ingest into the backend store |
//! | [`shelfmark`] | Shelf mark derivation |
//! | [`writeback`] | Sierra REST write-back scheduler |
//! | [`clock`] | Periodic job runner |
//! | [`server`] | Backend HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod clock;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod etl;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod server;
pub mod shelfmark;
pub mod source;
pub mod transport;
pub mod watermark;
pub mod writeback;
