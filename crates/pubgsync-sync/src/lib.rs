//! Incremental sync of upstream player, match and stats resources into the relational store.

pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod planner;
pub mod reconciler;
pub mod store;

pub use config::SyncConfig;
pub use context::RunContext;
pub use error::SyncError;
pub use fetcher::{FetchKey, FetchOutcome, FetchSettings, Fetcher};
pub use pipeline::{
    build_api_client, run_sync_once_from_env, StageReport, SyncPipeline, SyncRunSummary,
    SUMMARY_FILE_NAME,
};
pub use planner::PlanningError;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use store::{MemoryState, MemoryStore, PgStore, StatsKind, StoreError, SyncStore};

pub const CRATE_NAME: &str = "pubgsync-sync";
