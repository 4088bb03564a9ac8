//! Maps fetched documents onto store rows and writes them one transaction per row.
//!
//! A failed row is logged with its key and counted; it never stops the rest of the batch.

use std::collections::{BTreeSet, HashSet};

use pubgsync_adapters::{
    LifetimeStatsDocument, MatchDocument, PlayerDocument, RankedStatsDocument, SeasonStatsDocument,
};
use pubgsync_core::{
    PlayerLifetimeStats, PlayerMatch, PlayerMatchStats, PlayerRankedSeasonStats, PlayerSeasonKey,
    PlayerSeasonStats, Season, SeasonMatch, SEASON_STATE_IN_PROGRESS,
};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::RunContext;
use crate::store::{keys, StatsKind, StoreError, SyncStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub reconciled: usize,
    pub failed: usize,
}

impl ReconcileOutcome {
    pub fn merge(self, other: Self) -> Self {
        Self {
            reconciled: self.reconciled + other.reconciled,
            failed: self.failed + other.failed,
        }
    }
}

/// Fan a season stats document out into one row per game mode.
pub fn expand_season_stats(doc: &SeasonStatsDocument) -> Vec<PlayerSeasonStats> {
    doc.game_modes
        .iter()
        .map(|(mode, stats)| PlayerSeasonStats {
            player_id: doc.player_id.clone(),
            season_id: doc.season_id.clone(),
            game_mode: mode.clone(),
            stats: stats.clone(),
        })
        .collect()
}

pub fn expand_ranked_stats(doc: &RankedStatsDocument) -> Vec<PlayerRankedSeasonStats> {
    doc.game_modes
        .iter()
        .map(|(mode, stats)| PlayerRankedSeasonStats {
            player_id: doc.player_id.clone(),
            season_id: doc.season_id.clone(),
            game_mode: mode.clone(),
            stats: stats.clone(),
        })
        .collect()
}

pub fn expand_lifetime_stats(doc: &LifetimeStatsDocument) -> Vec<PlayerLifetimeStats> {
    doc.game_modes
        .iter()
        .map(|(mode, stats)| PlayerLifetimeStats {
            player_id: doc.player_id.clone(),
            game_mode: mode.clone(),
            stats: stats.clone(),
        })
        .collect()
}

/// Links between tracked players and the stored matches they reference.
pub fn player_match_rows(players: &[PlayerDocument], stored_matches: &HashSet<String>) -> BTreeSet<PlayerMatch> {
    players
        .iter()
        .flat_map(|p| {
            p.match_ids
                .iter()
                .filter(|id| stored_matches.contains(*id))
                .map(|id| PlayerMatch {
                    player_id: p.player.player_id.clone(),
                    match_id: id.clone(),
                })
        })
        .collect()
}

/// Matches first stored this run that were played while their season was running belong
/// to the current season. Matches fetched again for missing stats are left alone, since
/// their season may have closed since.
pub fn season_matches_for_new_matches(
    docs: &[MatchDocument],
    new_matches: &BTreeSet<String>,
    current_season_id: &str,
) -> BTreeSet<SeasonMatch> {
    docs.iter()
        .filter(|doc| new_matches.contains(&doc.record.match_id))
        .filter(|doc| doc.record.season_state == SEASON_STATE_IN_PROGRESS)
        .map(|doc| SeasonMatch {
            season_id: current_season_id.to_string(),
            match_id: doc.record.match_id.clone(),
        })
        .collect()
}

/// Season links listed inside season stats documents, limited to stored matches.
pub fn season_matches_from_stats(
    docs: &[SeasonStatsDocument],
    stored_matches: &HashSet<String>,
) -> BTreeSet<SeasonMatch> {
    docs.iter()
        .flat_map(|doc| {
            doc.match_ids
                .iter()
                .filter(|id| stored_matches.contains(*id))
                .map(|id| SeasonMatch {
                    season_id: doc.season_id.clone(),
                    match_id: id.clone(),
                })
        })
        .collect()
}

pub struct Reconciler<'a> {
    store: &'a dyn SyncStore,
    run_id: Uuid,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn SyncStore, ctx: &RunContext) -> Self {
        Self {
            store,
            run_id: ctx.run_id,
        }
    }

    fn tally(&self, outcome: &mut ReconcileOutcome, entity: &str, key: &str, result: Result<(), StoreError>) -> bool {
        match result {
            Ok(()) => {
                outcome.reconciled += 1;
                true
            }
            Err(err) => {
                warn!(run_id = %self.run_id, entity, key, error = %err, "row write failed");
                outcome.failed += 1;
                false
            }
        }
    }

    /// Returns the outcome and the ids of players now stored.
    pub async fn players(&self, docs: &[PlayerDocument]) -> (ReconcileOutcome, HashSet<String>) {
        let mut outcome = ReconcileOutcome::default();
        let mut stored = HashSet::new();
        for doc in docs {
            let id = &doc.player.player_id;
            let result = self.store.upsert_player(&doc.player).await;
            if self.tally(&mut outcome, "player", id, result) {
                stored.insert(id.clone());
            }
        }
        (outcome, stored)
    }

    pub async fn seasons(&self, seasons: &[Season]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for season in seasons {
            let result = self.store.upsert_season(season).await;
            self.tally(&mut outcome, "season", &season.season_id, result);
        }
        outcome
    }

    /// Returns the outcome and the ids of matches written by this call.
    pub async fn matches(&self, docs: &[MatchDocument]) -> (ReconcileOutcome, BTreeSet<String>) {
        let mut outcome = ReconcileOutcome::default();
        let mut upserted = BTreeSet::new();
        for doc in docs {
            let id = &doc.record.match_id;
            let result = self.store.upsert_match(&doc.record).await;
            if self.tally(&mut outcome, "match", id, result) {
                upserted.insert(id.clone());
            }
        }
        (outcome, upserted)
    }

    pub async fn player_matches(&self, rows: &BTreeSet<PlayerMatch>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for row in rows {
            let result = self.store.insert_player_match(row).await;
            self.tally(&mut outcome, "player_match", &keys::player_match(row), result);
        }
        outcome
    }

    pub async fn season_matches(&self, rows: &BTreeSet<SeasonMatch>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for row in rows {
            let result = self.store.insert_season_match(row).await;
            self.tally(&mut outcome, "season_match", &keys::season_match(row), result);
        }
        outcome
    }

    /// Per-match stats for tracked players, limited to fetched matches present in the store.
    pub async fn match_stats(
        &self,
        docs: &[MatchDocument],
        stored_matches: &HashSet<String>,
        tracked_players: &HashSet<String>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for doc in docs.iter().filter(|d| stored_matches.contains(&d.record.match_id)) {
            for participant in doc
                .participants
                .iter()
                .filter(|p| tracked_players.contains(&p.player_id))
            {
                let row = PlayerMatchStats {
                    player_id: participant.player_id.clone(),
                    match_id: doc.record.match_id.clone(),
                    stats: participant.stats.clone(),
                };
                let result = self.store.upsert_player_match_stats(&row).await;
                self.tally(&mut outcome, "player_match_stats", &keys::player_match_stats(&row), result);
            }
        }
        outcome
    }

    /// Record that every row of `key`'s document is stored, so closed seasons are not
    /// planned again. Documents with no game modes are captured too.
    async fn capture(&self, kind: StatsKind, key: PlayerSeasonKey, complete: bool) {
        if !complete {
            return;
        }
        if let Err(err) = self.store.mark_stats_captured(kind, &key).await {
            warn!(run_id = %self.run_id, kind = kind.as_str(), key = %key, error = %err, "capture marker write failed");
        }
    }

    pub async fn season_stats(&self, docs: &[SeasonStatsDocument]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for doc in docs {
            let mut complete = true;
            for row in expand_season_stats(doc) {
                let result = self.store.upsert_season_stats(&row).await;
                complete &= self.tally(&mut outcome, "player_season_stats", &keys::season_stats(&row), result);
            }
            let key = PlayerSeasonKey::new(&doc.player_id, &doc.season_id);
            self.capture(StatsKind::Season, key, complete).await;
        }
        debug!(rows = outcome.reconciled, failed = outcome.failed, "season stats reconciled");
        outcome
    }

    pub async fn ranked_stats(&self, docs: &[RankedStatsDocument]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for doc in docs {
            let mut complete = true;
            for row in expand_ranked_stats(doc) {
                let result = self.store.upsert_ranked_stats(&row).await;
                complete &= self.tally(&mut outcome, "player_ranked_season_stats", &keys::ranked_stats(&row), result);
            }
            let key = PlayerSeasonKey::new(&doc.player_id, &doc.season_id);
            self.capture(StatsKind::Ranked, key, complete).await;
        }
        outcome
    }

    pub async fn lifetime_stats(&self, docs: &[LifetimeStatsDocument]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for doc in docs {
            for row in expand_lifetime_stats(doc) {
                let result = self.store.upsert_lifetime_stats(&row).await;
                self.tally(&mut outcome, "player_lifetime_stats", &keys::lifetime_stats(&row), result);
            }
        }
        outcome
    }
}
