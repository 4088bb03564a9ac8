#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pubgsync_adapters::documents::{
    parse_lifetime_stats, parse_match, parse_players, parse_ranked_stats, parse_season_stats,
    parse_seasons,
};
use pubgsync_adapters::{
    ApiResponse, DocumentError, LifetimeStatsDocument, MatchDocument, PlayerDocument,
    RankedStatsDocument, SeasonStatsDocument, UpstreamApi, UpstreamError,
};
use pubgsync_core::Season;
use pubgsync_storage::QuotaSnapshot;
use pubgsync_sync::config::{ConfigFile, SyncConfig};
use tokio::time::Instant;

pub const CURRENT_SEASON: &str = "division.bro.official.pc-2018-31";
pub const ALPHA: &str = "account.alpha";
pub const BRAVO: &str = "account.bravo";

pub fn fixture(name: &str) -> Vec<u8> {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

pub fn ts(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, month, day, 12, 0, 0)
        .single()
        .expect("ts")
}

/// Config for tests: token and players set, everything else default unless overridden.
pub fn test_config(overrides: &[(&str, &str)]) -> SyncConfig {
    let mut env: BTreeMap<String, String> = BTreeMap::from([
        ("PUBG_API_KEY".to_string(), "test-key".to_string()),
        ("PUBGSYNC_PLAYERS".to_string(), "Alpha,Bravo".to_string()),
        ("PUBGSYNC_BULK_CONCURRENCY".to_string(), "2".to_string()),
    ]);
    for (key, value) in overrides {
        env.insert(key.to_string(), value.to_string());
    }
    SyncConfig::resolve(ConfigFile::default(), |name| env.get(name).cloned()).expect("test config")
}

pub fn exhausted_quota(reset_in: Duration) -> QuotaSnapshot {
    QuotaSnapshot {
        limit: Some(10),
        remaining: 0,
        reset_at: Utc::now() + chrono::Duration::from_std(reset_in).expect("duration"),
    }
}

/// A 429 snapshot whose reset has already passed, so it asks for no wait of its own.
pub fn stale_quota(reset_ago: Duration) -> QuotaSnapshot {
    QuotaSnapshot {
        limit: Some(10),
        remaining: 0,
        reset_at: Utc::now() - chrono::Duration::from_std(reset_ago).expect("duration"),
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub resource: String,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<Call>,
    malformed: HashSet<String>,
    failing: HashSet<String>,
    rate_limited: VecDeque<Option<QuotaSnapshot>>,
    next_quota: Option<QuotaSnapshot>,
    delay: Option<Duration>,
}

/// In-process upstream serving the JSON fixtures. Resource names match the HTTP client's.
pub struct FakeUpstream {
    pub players: Vec<PlayerDocument>,
    pub seasons: Vec<Season>,
    pub matches: BTreeMap<String, MatchDocument>,
    season_template: SeasonStatsDocument,
    ranked_template: RankedStatsDocument,
    lifetime_template: LifetimeStatsDocument,
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeUpstream {
    pub fn from_fixtures() -> Self {
        let first = parse_match(&fixture("match.json")).expect("match fixture");
        let mut matches = BTreeMap::new();
        for (id, day, state) in [("match-2", 21, "progress"), ("match-3", 22, "closed")] {
            let mut doc = first.clone();
            doc.record.match_id = id.to_string();
            doc.record.created_at = ts(2, day);
            doc.record.season_state = state.to_string();
            matches.insert(id.to_string(), doc);
        }
        matches.insert(first.record.match_id.clone(), first);

        Self {
            players: parse_players(&fixture("players.json")).expect("players fixture"),
            seasons: parse_seasons(&fixture("seasons.json")).expect("seasons fixture"),
            matches,
            season_template: parse_season_stats(&fixture("season_stats.json")).expect("season stats"),
            ranked_template: parse_ranked_stats(&fixture("ranked_stats.json")).expect("ranked stats"),
            lifetime_template: parse_lifetime_stats(&fixture("lifetime_stats.json")).expect("lifetime"),
            state: Mutex::new(FakeState::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Add a copy of `match-1` under `match_id`.
    pub fn add_match(&mut self, match_id: &str, created_at: DateTime<Utc>) {
        let mut doc = self.matches["match-1"].clone();
        doc.record.match_id = match_id.to_string();
        doc.record.created_at = created_at;
        self.matches.insert(match_id.to_string(), doc);
    }

    pub fn add_season(&mut self, season_id: &str) {
        self.seasons.push(Season {
            season_id: season_id.to_string(),
            is_current: false,
            is_off_season: false,
        });
    }

    /// Serve ranked documents that list no game modes.
    pub fn empty_ranked_documents(&mut self) {
        self.ranked_template.game_modes.clear();
    }

    pub fn rate_limit_next(&self, times: usize, quota: Option<QuotaSnapshot>) {
        let mut state = self.state.lock().expect("state");
        state.rate_limited.extend(std::iter::repeat(quota).take(times));
    }

    /// Attach `quota` to the next successful quota-bound response.
    pub fn report_quota_next(&self, quota: QuotaSnapshot) {
        self.state.lock().expect("state").next_quota = Some(quota);
    }

    pub fn malformed(&self, resource: &str) {
        self.state.lock().expect("state").malformed.insert(resource.to_string());
    }

    pub fn fail_with_server_error(&self, resource: &str) {
        self.state.lock().expect("state").failing.insert(resource.to_string());
    }

    pub fn delay_every_call(&self, delay: Duration) {
        self.state.lock().expect("state").delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().expect("state").calls.clone()
    }

    pub fn calls_to(&self, resource: &str) -> usize {
        self.calls().iter().filter(|c| c.resource == resource).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn respond<T>(
        &self,
        resource: String,
        quota_bound: bool,
        body: Option<T>,
    ) -> Result<ApiResponse<T>, UpstreamError> {
        let delay = {
            let mut state = self.state.lock().expect("state");
            state.calls.push(Call {
                resource: resource.clone(),
                at: Instant::now(),
            });
            state.delay
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock().expect("state");
        if state.failing.contains(&resource) {
            return Err(UpstreamError::Status { resource, status: 500 });
        }
        if quota_bound {
            if let Some(quota) = state.rate_limited.pop_front() {
                return Err(UpstreamError::QuotaExceeded { resource, quota });
            }
        }
        if state.malformed.contains(&resource) {
            return Err(UpstreamError::Malformed {
                resource,
                source: DocumentError::Invalid("document truncated".to_string()),
            });
        }
        let Some(body) = body else {
            return Err(UpstreamError::Status { resource, status: 404 });
        };
        let quota = if quota_bound { state.next_quota.take() } else { None };
        Ok(ApiResponse { body, quota })
    }

    fn knows(&self, player_id: &str, season_id: &str) -> bool {
        self.players.iter().any(|p| p.player.player_id == player_id)
            && self.seasons.iter().any(|s| s.season_id == season_id)
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn players_by_name(
        &self,
        names: &[String],
    ) -> Result<ApiResponse<Vec<PlayerDocument>>, UpstreamError> {
        let found: Vec<PlayerDocument> = self
            .players
            .iter()
            .filter(|p| names.contains(&p.player.name))
            .cloned()
            .collect();
        let body = (!found.is_empty()).then_some(found);
        self.respond("/players".to_string(), true, body).await
    }

    async fn seasons(&self) -> Result<ApiResponse<Vec<Season>>, UpstreamError> {
        self.respond("/seasons".to_string(), true, Some(self.seasons.clone()))
            .await
    }

    async fn match_by_id(&self, match_id: &str) -> Result<ApiResponse<MatchDocument>, UpstreamError> {
        let body = self.matches.get(match_id).cloned();
        self.respond(format!("/matches/{match_id}"), false, body).await
    }

    async fn season_stats(
        &self,
        player_id: &str,
        season_id: &str,
    ) -> Result<ApiResponse<SeasonStatsDocument>, UpstreamError> {
        let body = self.knows(player_id, season_id).then(|| {
            let mut doc = self.season_template.clone();
            doc.player_id = player_id.to_string();
            doc.season_id = season_id.to_string();
            if season_id != CURRENT_SEASON {
                doc.match_ids.clear();
            }
            doc
        });
        self.respond(format!("/players/{player_id}/seasons/{season_id}"), true, body)
            .await
    }

    async fn ranked_season_stats(
        &self,
        player_id: &str,
        season_id: &str,
    ) -> Result<ApiResponse<RankedStatsDocument>, UpstreamError> {
        let body = self.knows(player_id, season_id).then(|| {
            let mut doc = self.ranked_template.clone();
            doc.player_id = player_id.to_string();
            doc.season_id = season_id.to_string();
            doc
        });
        self.respond(
            format!("/players/{player_id}/seasons/{season_id}/ranked"),
            true,
            body,
        )
        .await
    }

    async fn lifetime_stats(
        &self,
        player_id: &str,
    ) -> Result<ApiResponse<LifetimeStatsDocument>, UpstreamError> {
        let body = self
            .players
            .iter()
            .any(|p| p.player.player_id == player_id)
            .then(|| {
                let mut doc = self.lifetime_template.clone();
                doc.player_id = player_id.to_string();
                doc
            });
        self.respond(format!("/players/{player_id}/seasons/lifetime"), true, body)
            .await
    }
}
