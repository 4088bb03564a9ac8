//! Change-set planning: decides which upstream resources a run fetches, from the tracked
//! players' match references, the season list, the watermark and what is already stored.
//!
//! Planning is pure. Store lookups happen in the orchestrator and are passed in.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use pubgsync_adapters::PlayerDocument;
use pubgsync_core::{PlayerMatch, PlayerSeasonKey, Season};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanningError {
    #[error("no current season among {seasons} upstream seasons")]
    NoCurrentSeason { seasons: usize },
    #[error("{} seasons are flagged current: {}", .season_ids.len(), .season_ids.join(", "))]
    MultipleCurrentSeasons { season_ids: Vec<String> },
}

/// The single season the upstream marks as current.
pub fn current_season(seasons: &[Season]) -> Result<&Season, PlanningError> {
    let current: Vec<&Season> = seasons.iter().filter(|s| s.is_current).collect();
    match current.as_slice() {
        [only] => Ok(*only),
        [] => Err(PlanningError::NoCurrentSeason {
            seasons: seasons.len(),
        }),
        many => Err(PlanningError::MultipleCurrentSeasons {
            season_ids: many.iter().map(|s| s.season_id.clone()).collect(),
        }),
    }
}

/// Every match id referenced by the tracked players, deduplicated.
pub fn referenced_match_ids(players: &[PlayerDocument]) -> BTreeSet<String> {
    players
        .iter()
        .flat_map(|p| p.match_ids.iter().cloned())
        .collect()
}

/// Referenced matches that are not yet stored, plus stored ones still lacking per-match
/// stats for a tracked player who references them.
///
/// Per-match stats only arrive inside the match document, so a missing row can only be
/// filled by fetching the match again.
pub fn plan_matches(
    players: &[PlayerDocument],
    stored: &HashSet<String>,
    stored_match_stats: &HashSet<PlayerMatch>,
) -> BTreeSet<String> {
    players
        .iter()
        .flat_map(|p| {
            p.match_ids.iter().filter(move |id| {
                !stored.contains(*id)
                    || !stored_match_stats.contains(&PlayerMatch {
                        player_id: p.player.player_id.clone(),
                        match_id: (*id).clone(),
                    })
            })
        })
        .cloned()
        .collect()
}

/// (player, season) combinations to fetch: every season whose document was never fully
/// captured for the player, plus the current season, which is refreshed on every run.
pub fn plan_season_combos(
    player_ids: &[String],
    seasons: &[Season],
    current_season_id: &str,
    captured: &HashSet<PlayerSeasonKey>,
) -> BTreeSet<PlayerSeasonKey> {
    let mut combos = BTreeSet::new();
    for player_id in player_ids {
        for season in seasons {
            let key = PlayerSeasonKey::new(player_id, &season.season_id);
            if season.season_id == current_season_id || !captured.contains(&key) {
                combos.insert(key);
            }
        }
    }
    combos
}

/// Players with at least one referenced match created strictly after `watermark`.
///
/// Matches missing from `created_at` (not stored) do not count.
pub fn plan_lifetime(
    players: &[PlayerDocument],
    created_at: &HashMap<String, DateTime<Utc>>,
    watermark: DateTime<Utc>,
) -> BTreeSet<String> {
    players
        .iter()
        .filter(|p| {
            p.match_ids
                .iter()
                .filter_map(|id| created_at.get(id))
                .any(|at| *at > watermark)
        })
        .map(|p| p.player.player_id.clone())
        .collect()
}

pub struct StatsPlanInput<'a> {
    pub players: &'a [PlayerDocument],
    pub seasons: &'a [Season],
    pub current_season_id: &'a str,
    pub captured_season_stats: &'a HashSet<PlayerSeasonKey>,
    pub captured_ranked_stats: &'a HashSet<PlayerSeasonKey>,
    pub match_created_at: &'a HashMap<String, DateTime<Utc>>,
    pub watermark: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsPlan {
    pub season_stats: BTreeSet<PlayerSeasonKey>,
    pub ranked_stats: BTreeSet<PlayerSeasonKey>,
    pub lifetime_players: BTreeSet<String>,
}

pub fn plan_stats(input: &StatsPlanInput<'_>) -> StatsPlan {
    let player_ids: Vec<String> = input
        .players
        .iter()
        .map(|p| p.player.player_id.clone())
        .collect();
    StatsPlan {
        season_stats: plan_season_combos(
            &player_ids,
            input.seasons,
            input.current_season_id,
            input.captured_season_stats,
        ),
        ranked_stats: plan_season_combos(
            &player_ids,
            input.seasons,
            input.current_season_id,
            input.captured_ranked_stats,
        ),
        lifetime_players: plan_lifetime(input.players, input.match_created_at, input.watermark),
    }
}
