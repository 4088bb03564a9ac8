//! Upstream retrieval. Quota-bound resources go through [`QuotaLimiter`] one request at a
//! time with bounded retries; match documents are fetched concurrently.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pubgsync_adapters::{
    player_name_batches, ApiResponse, LifetimeStatsDocument, MatchDocument, PlayerDocument,
    RankedStatsDocument, SeasonStatsDocument, UpstreamApi, UpstreamError,
};
use pubgsync_core::{PlayerSeasonKey, Season};
use pubgsync_storage::{BackoffPolicy, QuotaLimiter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::context::RunContext;
use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub bulk_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Longest a single quota-bound key may spend waiting and retrying.
    pub quota_deadline: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            bulk_concurrency: config.bulk_concurrency,
            backoff: config.backoff(),
            quota_deadline: config.quota_deadline(),
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            bulk_concurrency: 4,
            backoff: BackoffPolicy::default(),
            quota_deadline: Duration::from_secs(600),
        }
    }
}

/// Identifies one upstream request in logs and failure reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchKey {
    Players(Vec<String>),
    Seasons,
    Match(String),
    SeasonStats(PlayerSeasonKey),
    RankedStats(PlayerSeasonKey),
    LifetimeStats(String),
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Players(names) => write!(f, "players[{}]", names.join(",")),
            Self::Seasons => f.write_str("seasons"),
            Self::Match(id) => write!(f, "match/{id}"),
            Self::SeasonStats(key) => write!(f, "season_stats/{key}"),
            Self::RankedStats(key) => write!(f, "ranked_stats/{key}"),
            Self::LifetimeStats(player_id) => write!(f, "lifetime_stats/{player_id}"),
        }
    }
}

/// Documents that arrived plus one error per key that did not.
#[derive(Debug)]
pub struct FetchOutcome<T> {
    pub documents: Vec<T>,
    pub failures: Vec<SyncError>,
}

impl<T> Default for FetchOutcome<T> {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> FetchOutcome<T> {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, key: &FetchKey, result: Result<T, SyncError>) {
        match result {
            Ok(document) => self.documents.push(document),
            Err(err) => {
                warn!(key = %key, error = %err, "fetch failed, skipping key");
                self.failures.push(err);
            }
        }
    }
}

pub struct Fetcher {
    api: Arc<dyn UpstreamApi>,
    limiter: Arc<QuotaLimiter>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(api: Arc<dyn UpstreamApi>, limiter: Arc<QuotaLimiter>, settings: FetchSettings) -> Self {
        Self {
            api,
            limiter,
            settings,
        }
    }

    pub fn limiter(&self) -> &QuotaLimiter {
        &self.limiter
    }

    /// Issue `call` once the limiter permits it, retrying quota-exceeded answers until
    /// the retry budget or the key's deadline runs out.
    async fn quota_bound<T, F, Fut>(
        &self,
        ctx: &RunContext,
        key: &FetchKey,
        call: F,
    ) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<ApiResponse<T>, UpstreamError>>,
    {
        let deadline = ctx.deadline_within(self.settings.quota_deadline);
        let backoff = self.settings.backoff;
        let mut attempt = 0usize;

        loop {
            self.limiter
                .acquire(Some(deadline))
                .await
                .map_err(|err| SyncError::TransientUpstream {
                    key: key.to_string(),
                    message: err.to_string(),
                })?;

            let err = match call().await {
                Ok(resp) => {
                    if let Some(quota) = resp.quota {
                        self.limiter.observe(quota).await;
                    }
                    return Ok(resp.body);
                }
                Err(err) => err,
            };

            let UpstreamError::QuotaExceeded { quota, .. } = &err else {
                return Err(SyncError::from_upstream(key.to_string(), err));
            };
            if attempt >= backoff.max_retries {
                warn!(key = %key, attempts = attempt + 1, "quota retries exhausted");
                return Err(SyncError::from_upstream(key.to_string(), err));
            }

            // Every retry waits at least the backoff step, longer when the answer reports
            // a reset further out. A reset already in the past yields no extra wait.
            let mut delay = backoff.delay_for_attempt(attempt);
            if let Some(quota) = quota {
                self.limiter.observe(*quota).await;
                delay = delay.max(quota.wait_duration(Utc::now(), self.limiter.margin()));
            }
            if Instant::now() + delay > deadline {
                return Err(SyncError::TransientUpstream {
                    key: key.to_string(),
                    message: format!("retry delay {delay:?} would pass the deadline"),
                });
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
            info!(key = %key, attempt, "quota exceeded, retrying");
        }
    }

    pub async fn fetch_players(&self, ctx: &RunContext, names: &[String]) -> FetchOutcome<PlayerDocument> {
        let mut outcome = FetchOutcome::default();
        for batch in player_name_batches(names) {
            let key = FetchKey::Players(batch.clone());
            let result = self
                .quota_bound(ctx, &key, || self.api.players_by_name(&batch))
                .await;
            match result {
                Ok(documents) => {
                    for name in &batch {
                        if !documents.iter().any(|d| &d.player.name == name) {
                            warn!(player_name = %name, "upstream returned no player for tracked name");
                        }
                    }
                    outcome.documents.extend(documents);
                }
                Err(err) => outcome.record(&key, Err(err)),
            }
        }
        debug!(players = outcome.documents.len(), failed = outcome.failed(), "players fetched");
        outcome
    }

    pub async fn fetch_seasons(&self, ctx: &RunContext) -> FetchOutcome<Season> {
        let mut outcome = FetchOutcome::default();
        let key = FetchKey::Seasons;
        match self.quota_bound(ctx, &key, || self.api.seasons()).await {
            Ok(seasons) => outcome.documents = seasons,
            Err(err) => outcome.record(&key, Err(err)),
        }
        outcome
    }

    /// Fetch match documents concurrently, bounded by `bulk_concurrency` in-flight requests.
    pub async fn fetch_matches(
        &self,
        ctx: &RunContext,
        match_ids: &BTreeSet<String>,
    ) -> FetchOutcome<MatchDocument> {
        let mut outcome = FetchOutcome::default();
        let semaphore = Arc::new(Semaphore::new(self.settings.bulk_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for match_id in match_ids {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let api = Arc::clone(&self.api);
            let match_id = match_id.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = api.match_by_id(&match_id).await;
                (match_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((match_id, result)) => {
                    let key = FetchKey::Match(match_id);
                    let result = result
                        .map(|resp| resp.body)
                        .map_err(|err| SyncError::from_upstream(key.to_string(), err));
                    outcome.record(&key, result);
                }
                Err(err) => {
                    warn!(run_id = %ctx.run_id, error = %err, "match fetch task aborted");
                    outcome.failures.push(SyncError::TransientUpstream {
                        key: "match".to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        outcome
            .documents
            .sort_by(|a, b| a.record.match_id.cmp(&b.record.match_id));
        debug!(
            planned = match_ids.len(),
            fetched = outcome.documents.len(),
            failed = outcome.failed(),
            "matches fetched"
        );
        outcome
    }

    pub async fn fetch_season_stats(
        &self,
        ctx: &RunContext,
        keys: &BTreeSet<PlayerSeasonKey>,
    ) -> FetchOutcome<SeasonStatsDocument> {
        let mut outcome = FetchOutcome::default();
        for combo in keys {
            let key = FetchKey::SeasonStats(combo.clone());
            let result = self
                .quota_bound(ctx, &key, || {
                    self.api.season_stats(&combo.player_id, &combo.season_id)
                })
                .await;
            outcome.record(&key, result);
        }
        outcome
    }

    pub async fn fetch_ranked_stats(
        &self,
        ctx: &RunContext,
        keys: &BTreeSet<PlayerSeasonKey>,
    ) -> FetchOutcome<RankedStatsDocument> {
        let mut outcome = FetchOutcome::default();
        for combo in keys {
            let key = FetchKey::RankedStats(combo.clone());
            let result = self
                .quota_bound(ctx, &key, || {
                    self.api.ranked_season_stats(&combo.player_id, &combo.season_id)
                })
                .await;
            outcome.record(&key, result);
        }
        outcome
    }

    pub async fn fetch_lifetime_stats(
        &self,
        ctx: &RunContext,
        player_ids: &BTreeSet<String>,
    ) -> FetchOutcome<LifetimeStatsDocument> {
        let mut outcome = FetchOutcome::default();
        for player_id in player_ids {
            let key = FetchKey::LifetimeStats(player_id.clone());
            let result = self
                .quota_bound(ctx, &key, || self.api.lifetime_stats(player_id))
                .await;
            outcome.record(&key, result);
        }
        outcome
    }
}
