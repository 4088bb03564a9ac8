use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pubgsync_core::{
    Match, Player, PlayerLifetimeStats, PlayerMatch, PlayerMatchStats, PlayerRankedSeasonStats,
    PlayerSeasonKey, PlayerSeasonStats, Season, SeasonMatch,
};
use tokio::sync::Mutex;

use super::{keys, StatsKind, StoreError, SyncStore};

/// Contents of a [`MemoryStore`], keyed the way the relational schema keys its tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub watermark: Option<DateTime<Utc>>,
    /// (shard, player name)
    pub tracked: BTreeSet<(String, String)>,
    pub players: BTreeMap<String, Player>,
    pub seasons: BTreeMap<String, Season>,
    pub matches: BTreeMap<String, Match>,
    pub player_matches: BTreeSet<PlayerMatch>,
    pub season_matches: BTreeSet<SeasonMatch>,
    pub player_match_stats: BTreeMap<(String, String), PlayerMatchStats>,
    pub season_stats: BTreeMap<(String, String, String), PlayerSeasonStats>,
    pub ranked_stats: BTreeMap<(String, String, String), PlayerRankedSeasonStats>,
    pub lifetime_stats: BTreeMap<(String, String), PlayerLifetimeStats>,
    /// (kind, player, season) of fully stored season and ranked documents.
    pub stat_captures: BTreeSet<(StatsKind, String, String)>,
    /// Number of writes that changed or attempted to change a row.
    pub writes: usize,
}

/// Store used by tests and dry runs. Enforces the same parent references as the schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MemoryState) -> Self {
        Self {
            state: Mutex::new(state),
            failing_keys: Mutex::default(),
        }
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Make every subsequent write for `key` fail.
    pub async fn fail_writes_for(&self, key: impl Into<String>) {
        self.failing_keys.lock().await.insert(key.into());
    }

    async fn check_injected(&self, key: &str) -> Result<(), StoreError> {
        if self.failing_keys.lock().await.contains(key) {
            return Err(StoreError::Rejected {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn require(
    present: bool,
    table: &'static str,
    key: &str,
    missing: impl Into<String>,
) -> Result<(), StoreError> {
    if present {
        return Ok(());
    }
    Err(StoreError::MissingReference {
        table,
        key: key.to_string(),
        missing: missing.into(),
    })
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state.lock().await.watermark)
    }

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_injected(pubgsync_core::WATERMARK_KEY).await?;
        let mut state = self.state.lock().await;
        if state.watermark.map_or(true, |current| current < at) {
            state.watermark = Some(at);
        }
        state.writes += 1;
        Ok(())
    }

    async fn tracked_player_names(&self, shard: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tracked
            .iter()
            .filter(|(s, _)| s == shard)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn add_tracked_player(&self, name: &str, shard: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.tracked.insert((shard.to_string(), name.to_string())))
    }

    async fn existing_match_ids(&self, match_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(match_ids
            .iter()
            .filter(|id| state.matches.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn match_created_at(
        &self,
        match_ids: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        Ok(match_ids
            .iter()
            .filter_map(|id| state.matches.get(id).map(|m| (id.clone(), m.created_at)))
            .collect())
    }

    async fn existing_player_match_stats(
        &self,
        player_ids: &[String],
    ) -> Result<HashSet<PlayerMatch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .player_match_stats
            .keys()
            .filter(|(player, _)| player_ids.contains(player))
            .map(|(player_id, match_id)| PlayerMatch {
                player_id: player_id.clone(),
                match_id: match_id.clone(),
            })
            .collect())
    }

    async fn captured_stat_keys(
        &self,
        kind: StatsKind,
        player_ids: &[String],
    ) -> Result<HashSet<PlayerSeasonKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .stat_captures
            .iter()
            .filter(|(k, player, _)| *k == kind && player_ids.contains(player))
            .map(|(_, player, season)| PlayerSeasonKey::new(player, season))
            .collect())
    }

    async fn mark_stats_captured(&self, kind: StatsKind, key: &PlayerSeasonKey) -> Result<(), StoreError> {
        let injected = keys::stats_capture(kind, key);
        self.check_injected(&injected).await?;
        let mut state = self.state.lock().await;
        require(state.players.contains_key(&key.player_id), "player_season_captures", &injected, &key.player_id)?;
        require(state.seasons.contains_key(&key.season_id), "player_season_captures", &injected, &key.season_id)?;
        state
            .stat_captures
            .insert((kind, key.player_id.clone(), key.season_id.clone()));
        state.writes += 1;
        Ok(())
    }

    async fn upsert_player(&self, player: &Player) -> Result<(), StoreError> {
        self.check_injected(&player.player_id).await?;
        let mut state = self.state.lock().await;
        state.players.insert(player.player_id.clone(), player.clone());
        state.writes += 1;
        Ok(())
    }

    async fn upsert_season(&self, season: &Season) -> Result<(), StoreError> {
        self.check_injected(&season.season_id).await?;
        let mut state = self.state.lock().await;
        state.seasons.insert(season.season_id.clone(), season.clone());
        state.writes += 1;
        Ok(())
    }

    async fn upsert_match(&self, record: &Match) -> Result<(), StoreError> {
        self.check_injected(&record.match_id).await?;
        let mut state = self.state.lock().await;
        state.matches.insert(record.match_id.clone(), record.clone());
        state.writes += 1;
        Ok(())
    }

    async fn insert_player_match(&self, row: &PlayerMatch) -> Result<(), StoreError> {
        let key = keys::player_match(row);
        self.check_injected(&key).await?;
        let mut state = self.state.lock().await;
        require(state.players.contains_key(&row.player_id), "player_matches", &key, &row.player_id)?;
        require(state.matches.contains_key(&row.match_id), "player_matches", &key, &row.match_id)?;
        state.player_matches.insert(row.clone());
        state.writes += 1;
        Ok(())
    }

    async fn insert_season_match(&self, row: &SeasonMatch) -> Result<(), StoreError> {
        let key = keys::season_match(row);
        self.check_injected(&key).await?;
        let mut state = self.state.lock().await;
        require(state.seasons.contains_key(&row.season_id), "season_matches", &key, &row.season_id)?;
        require(state.matches.contains_key(&row.match_id), "season_matches", &key, &row.match_id)?;
        state.season_matches.insert(row.clone());
        state.writes += 1;
        Ok(())
    }

    async fn upsert_player_match_stats(&self, row: &PlayerMatchStats) -> Result<(), StoreError> {
        let key = keys::player_match_stats(row);
        self.check_injected(&key).await?;
        let mut state = self.state.lock().await;
        require(state.players.contains_key(&row.player_id), "player_match_stats", &key, &row.player_id)?;
        require(state.matches.contains_key(&row.match_id), "player_match_stats", &key, &row.match_id)?;
        state
            .player_match_stats
            .insert((row.player_id.clone(), row.match_id.clone()), row.clone());
        state.writes += 1;
        Ok(())
    }

    async fn upsert_season_stats(&self, row: &PlayerSeasonStats) -> Result<(), StoreError> {
        let key = keys::season_stats(row);
        self.check_injected(&key).await?;
        let mut state = self.state.lock().await;
        require(state.players.contains_key(&row.player_id), "player_season_stats", &key, &row.player_id)?;
        require(state.seasons.contains_key(&row.season_id), "player_season_stats", &key, &row.season_id)?;
        state.season_stats.insert(
            (row.player_id.clone(), row.season_id.clone(), row.game_mode.clone()),
            row.clone(),
        );
        state.writes += 1;
        Ok(())
    }

    async fn upsert_ranked_stats(&self, row: &PlayerRankedSeasonStats) -> Result<(), StoreError> {
        let key = keys::ranked_stats(row);
        self.check_injected(&key).await?;
        let mut state = self.state.lock().await;
        require(
            state.players.contains_key(&row.player_id),
            "player_ranked_season_stats",
            &key,
            &row.player_id,
        )?;
        require(
            state.seasons.contains_key(&row.season_id),
            "player_ranked_season_stats",
            &key,
            &row.season_id,
        )?;
        state.ranked_stats.insert(
            (row.player_id.clone(), row.season_id.clone(), row.game_mode.clone()),
            row.clone(),
        );
        state.writes += 1;
        Ok(())
    }

    async fn upsert_lifetime_stats(&self, row: &PlayerLifetimeStats) -> Result<(), StoreError> {
        let key = keys::lifetime_stats(row);
        self.check_injected(&key).await?;
        let mut state = self.state.lock().await;
        require(state.players.contains_key(&row.player_id), "player_lifetime_stats", &key, &row.player_id)?;
        state
            .lifetime_stats
            .insert((row.player_id.clone(), row.game_mode.clone()), row.clone());
        state.writes += 1;
        Ok(())
    }
}
