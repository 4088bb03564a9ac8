//! Destination store contract.
//!
//! Every write runs in its own transaction. Entity and stats writes overwrite on key
//! conflict; association writes ignore an existing row. Writes that reference a missing
//! parent fail rather than creating it.

mod memory;
mod postgres;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pubgsync_core::{
    Match, Player, PlayerLifetimeStats, PlayerMatch, PlayerMatchStats, PlayerRankedSeasonStats,
    PlayerSeasonKey, PlayerSeasonStats, Season, SeasonMatch,
};
use thiserror::Error;

pub use memory::{MemoryState, MemoryStore};
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{table} row {key} references missing {missing}")]
    MissingReference {
        table: &'static str,
        key: String,
        missing: String,
    },
    #[error("stored value for {key} is unreadable: {message}")]
    Corrupt { key: String, message: String },
    #[error("store rejected write for {key}: {message}")]
    Rejected { key: String, message: String },
}

/// The per-season stats endpoints whose captures are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatsKind {
    Season,
    Ranked,
}

impl StatsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Season => "season",
            Self::Ranked => "ranked",
        }
    }
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Persist `at` unless a later watermark is already stored.
    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn tracked_player_names(&self, shard: &str) -> Result<Vec<String>, StoreError>;

    /// Returns `false` when the name was already tracked.
    async fn add_tracked_player(&self, name: &str, shard: &str) -> Result<bool, StoreError>;

    async fn existing_match_ids(&self, match_ids: &[String]) -> Result<HashSet<String>, StoreError>;

    async fn match_created_at(
        &self,
        match_ids: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>, StoreError>;

    async fn existing_player_match_stats(
        &self,
        player_ids: &[String],
    ) -> Result<HashSet<PlayerMatch>, StoreError>;

    /// (player, season) pairs whose `kind` document has been stored in full at least once,
    /// including documents that carried no game modes.
    async fn captured_stat_keys(
        &self,
        kind: StatsKind,
        player_ids: &[String],
    ) -> Result<HashSet<PlayerSeasonKey>, StoreError>;

    async fn mark_stats_captured(&self, kind: StatsKind, key: &PlayerSeasonKey) -> Result<(), StoreError>;

    async fn upsert_player(&self, player: &Player) -> Result<(), StoreError>;
    async fn upsert_season(&self, season: &Season) -> Result<(), StoreError>;
    async fn upsert_match(&self, record: &Match) -> Result<(), StoreError>;
    async fn insert_player_match(&self, row: &PlayerMatch) -> Result<(), StoreError>;
    async fn insert_season_match(&self, row: &SeasonMatch) -> Result<(), StoreError>;
    async fn upsert_player_match_stats(&self, row: &PlayerMatchStats) -> Result<(), StoreError>;
    async fn upsert_season_stats(&self, row: &PlayerSeasonStats) -> Result<(), StoreError>;
    async fn upsert_ranked_stats(&self, row: &PlayerRankedSeasonStats) -> Result<(), StoreError>;
    async fn upsert_lifetime_stats(&self, row: &PlayerLifetimeStats) -> Result<(), StoreError>;
}

/// Log and failure-injection keys for each row kind.
pub mod keys {
    use super::*;

    pub fn player_match(row: &PlayerMatch) -> String {
        format!("{}/{}", row.player_id, row.match_id)
    }

    pub fn season_match(row: &SeasonMatch) -> String {
        format!("{}/{}", row.season_id, row.match_id)
    }

    pub fn player_match_stats(row: &PlayerMatchStats) -> String {
        format!("{}/{}", row.player_id, row.match_id)
    }

    pub fn season_stats(row: &PlayerSeasonStats) -> String {
        format!("{}/{}/{}", row.player_id, row.season_id, row.game_mode)
    }

    pub fn ranked_stats(row: &PlayerRankedSeasonStats) -> String {
        format!("{}/{}/{}", row.player_id, row.season_id, row.game_mode)
    }

    pub fn stats_capture(kind: StatsKind, key: &PlayerSeasonKey) -> String {
        format!("{}/{}", kind.as_str(), key)
    }

    pub fn lifetime_stats(row: &PlayerLifetimeStats) -> String {
        format!("{}/{}", row.player_id, row.game_mode)
    }
}
