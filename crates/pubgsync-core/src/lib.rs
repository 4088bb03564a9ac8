//! Core relational rows and shared constants for pubgsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pubgsync-core";

/// Key of the singleton watermark row in `system_information`.
pub const WATERMARK_KEY: &str = "last_sync";

/// Pseudo season id the upstream uses for lifetime statistics.
pub const LIFETIME_SEASON_ID: &str = "lifetime";

/// Upstream `seasonState` of a match played while its season was running.
pub const SEASON_STATE_IN_PROGRESS: &str = "progress";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub player_id: String,
    pub name: String,
    pub shard: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Season {
    pub season_id: String,
    pub is_current: bool,
    pub is_off_season: bool,
}

/// A concluded match. Its attributes never change once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub match_id: String,
    pub created_at: DateTime<Utc>,
    pub duration: i32,
    pub mode: String,
    pub map: String,
    pub is_custom: bool,
    pub season_state: String,
    pub shard: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerMatch {
    pub player_id: String,
    pub match_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeasonMatch {
    pub season_id: String,
    pub match_id: String,
}

/// Per-match performance of one participant, as reported inside a match document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStats {
    #[serde(rename = "DBNOs")]
    pub dbnos: i32,
    pub assists: i32,
    pub boosts: i32,
    pub damage_dealt: f64,
    pub death_type: String,
    pub headshot_kills: i32,
    pub heals: i32,
    pub kill_place: i32,
    pub kills: i32,
    pub longest_kill: f64,
    pub revives: i32,
    pub ride_distance: f64,
    pub road_kills: i32,
    pub swim_distance: f64,
    pub team_kills: i32,
    pub time_survived: f64,
    pub vehicle_destroys: i32,
    pub walk_distance: f64,
    pub weapons_acquired: i32,
    pub win_place: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMatchStats {
    pub player_id: String,
    pub match_id: String,
    pub stats: MatchStats,
}

/// Aggregated statistics for one game mode, shared by season and lifetime documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameModeStats {
    pub assists: i32,
    pub boosts: i32,
    #[serde(rename = "dBNOs")]
    pub dbnos: i32,
    pub daily_kills: i32,
    pub daily_wins: i32,
    pub damage_dealt: f64,
    pub days: i32,
    pub headshot_kills: i32,
    pub heals: i32,
    pub kills: i32,
    pub longest_kill: f64,
    pub longest_time_survived: f64,
    pub losses: i32,
    pub max_kill_streaks: i32,
    pub most_survival_time: f64,
    pub revives: i32,
    pub ride_distance: f64,
    pub road_kills: i32,
    pub round_most_kills: i32,
    pub rounds_played: i32,
    pub suicides: i32,
    pub swim_distance: f64,
    pub team_kills: i32,
    pub time_survived: f64,
    pub top10s: i32,
    pub vehicle_destroys: i32,
    pub walk_distance: f64,
    pub weapons_acquired: i32,
    pub weekly_kills: i32,
    pub weekly_wins: i32,
    pub wins: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankTier {
    pub tier: String,
    pub sub_tier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedGameModeStats {
    pub current_tier: RankTier,
    pub current_rank_point: i32,
    pub best_tier: RankTier,
    pub best_rank_point: i32,
    pub rounds_played: i32,
    pub avg_rank: f64,
    pub top10_ratio: f64,
    pub win_ratio: f64,
    pub assists: i32,
    pub wins: i32,
    pub kda: f64,
    pub kills: i32,
    pub deaths: i32,
    pub damage_dealt: f64,
    #[serde(rename = "dBNOs")]
    pub dbnos: i32,
}

/// One row per (player, season, game mode). Mutable while the season is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSeasonStats {
    pub player_id: String,
    pub season_id: String,
    pub game_mode: String,
    pub stats: GameModeStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRankedSeasonStats {
    pub player_id: String,
    pub season_id: String,
    pub game_mode: String,
    pub stats: RankedGameModeStats,
}

/// One row per (player, game mode), overwritten whenever the player has new matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLifetimeStats {
    pub player_id: String,
    pub game_mode: String,
    pub stats: GameModeStats,
}

/// A (player, season) pair addressed by the season and ranked stat endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerSeasonKey {
    pub player_id: String,
    pub season_id: String,
}

impl PlayerSeasonKey {
    pub fn new(player_id: impl Into<String>, season_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            season_id: season_id.into(),
        }
    }
}

impl std::fmt::Display for PlayerSeasonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.player_id, self.season_id)
    }
}
