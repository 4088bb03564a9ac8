use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pubgsync_adapters::{PubgApiClient, UpstreamApi, JSON_API_MEDIA_TYPE};
use pubgsync_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, QuotaLimiter};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::context::RunContext;
use crate::error::SyncError;
use crate::fetcher::{FetchSettings, Fetcher};
use crate::planner::{self, StatsPlanInput};
use crate::reconciler::{self, ReconcileOutcome, Reconciler};
use crate::store::{PgStore, StatsKind, SyncStore};

pub const SUMMARY_FILE_NAME: &str = "sync_summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    /// Entities the stage set out to store: players, seasons, matches or stat combos.
    pub planned: usize,
    /// `None` for stages derived from already-fetched documents.
    pub fetched: Option<usize>,
    pub reconciled: usize,
    pub failed: usize,
}

impl StageReport {
    fn new(stage: &str, planned: usize, fetched: Option<usize>, outcome: ReconcileOutcome, fetch_failed: usize) -> Self {
        Self {
            stage: stage.to_string(),
            planned,
            fetched,
            reconciled: outcome.reconciled,
            failed: outcome.failed + fetch_failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark_before: DateTime<Utc>,
    pub watermark_after: DateTime<Utc>,
    pub current_season_id: String,
    pub stages: Vec<StageReport>,
}

impl SyncRunSummary {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn total_failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }
}

/// Runs the staged sync: players and seasons, matches and their links, per-season and
/// ranked stats, lifetime stats, then the watermark.
pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn SyncStore>,
    fetcher: Fetcher,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn SyncStore>, api: Arc<dyn UpstreamApi>) -> Self {
        let limiter = Arc::new(QuotaLimiter::new(config.quota_margin()));
        let fetcher = Fetcher::new(api, limiter, FetchSettings::from_config(&config));
        Self {
            config,
            store,
            fetcher,
            run_lock: Mutex::new(()),
        }
    }

    /// Wire the HTTP client and Postgres store described by `config`.
    pub async fn connect(config: SyncConfig, echo_sql: bool) -> Result<Self> {
        let store = PgStore::connect(&config.database_url, config.db_max_connections, echo_sql).await?;
        store.migrate().await?;
        let api = build_api_client(&config)?;
        Ok(Self::new(config, Arc::new(store), Arc::new(api)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Run one sync, waiting for any run already in progress to finish first.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let _guard = self.run_lock.lock().await;
        self.run_locked().await
    }

    /// Run one sync unless another is in progress, in which case `None` is returned.
    pub async fn try_run_once(&self) -> Option<Result<SyncRunSummary, SyncError>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous sync run still in progress, skipping");
            return None;
        };
        Some(self.run_locked().await)
    }

    async fn run_locked(&self) -> Result<SyncRunSummary, SyncError> {
        let deadline = self.config.run_deadline();
        let ctx = RunContext::begin(self.store.as_ref(), deadline).await?;
        let span = tracing::info_span!("sync_run", run_id = %ctx.run_id);

        let summary = match tokio::time::timeout(deadline, self.run_stages(&ctx))
            .instrument(span)
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                error!(run_id = %ctx.run_id, ?deadline, "sync run hit its deadline, watermark left unchanged");
                return Err(SyncError::DeadlineExceeded(deadline));
            }
        };

        if let Err(err) = self.write_summary(&summary).await {
            warn!(run_id = %summary.run_id, error = %err, "failed to write sync summary");
        }
        info!(
            run_id = %summary.run_id,
            failed = summary.total_failed(),
            watermark = %summary.watermark_after,
            "sync run complete"
        );
        Ok(summary)
    }

    async fn tracked_player_names(&self) -> Vec<String> {
        let mut names = self.config.player_names.clone();
        match self.store.tracked_player_names(&self.config.shard).await {
            Ok(stored) => names.extend(stored),
            Err(err) => warn!(error = %err, "could not read tracked players, using configured names only"),
        }
        names
    }

    async fn run_stages(&self, ctx: &RunContext) -> Result<SyncRunSummary, SyncError> {
        let store = self.store.as_ref();
        let reconciler = Reconciler::new(store, ctx);
        let mut stages = Vec::new();

        // Both lists are read before anything is written so a missing current season
        // aborts the run with the store untouched.
        let names = self.tracked_player_names().await;
        let players = self.fetcher.fetch_players(ctx, &names).await;
        let mut seasons = self.fetcher.fetch_seasons(ctx).await;
        if seasons.documents.is_empty() {
            if let Some(err) = seasons.failures.pop() {
                error!(run_id = %ctx.run_id, error = %err, "season list unavailable, nothing written");
                return Err(err);
            }
        }
        let current_season_id = planner::current_season(&seasons.documents)?.season_id.clone();
        info!(
            players = players.documents.len(),
            seasons = seasons.documents.len(),
            current_season = %current_season_id,
            "upstream lists fetched"
        );

        let (outcome, stored_players) = reconciler.players(&players.documents).await;
        stages.push(StageReport::new(
            "players",
            names.len(),
            Some(players.documents.len()),
            outcome,
            players.failed(),
        ));
        let players: Vec<_> = players
            .documents
            .into_iter()
            .filter(|p| stored_players.contains(&p.player.player_id))
            .collect();

        let outcome = reconciler.seasons(&seasons.documents).await;
        stages.push(StageReport::new(
            "seasons",
            seasons.documents.len(),
            Some(seasons.documents.len()),
            outcome,
            seasons.failed(),
        ));

        // Matches
        let referenced: Vec<String> = planner::referenced_match_ids(&players).into_iter().collect();
        let cached = store
            .existing_match_ids(&referenced)
            .await
            .map_err(SyncError::persistence("matches"))?;
        let player_ids: Vec<String> = players.iter().map(|p| p.player.player_id.clone()).collect();
        let stored_match_stats = store
            .existing_player_match_stats(&player_ids)
            .await
            .map_err(SyncError::persistence("player_match_stats"))?;
        let to_fetch = planner::plan_matches(&players, &cached, &stored_match_stats);
        let matches = self.fetcher.fetch_matches(ctx, &to_fetch).await;
        let (outcome, upserted_matches) = reconciler.matches(&matches.documents).await;
        stages.push(StageReport::new(
            "matches",
            to_fetch.len(),
            Some(matches.documents.len()),
            outcome,
            matches.failed(),
        ));

        // Associations only after every match write above has completed.
        let stored_matches = store
            .existing_match_ids(&referenced)
            .await
            .map_err(SyncError::persistence("matches"))?;
        let rows = reconciler::player_match_rows(&players, &stored_matches);
        let outcome = reconciler.player_matches(&rows).await;
        stages.push(StageReport::new("player_matches", rows.len(), None, outcome, 0));

        let new_matches: BTreeSet<String> = upserted_matches
            .iter()
            .filter(|id| !cached.contains(*id))
            .cloned()
            .collect();
        let rows = reconciler::season_matches_for_new_matches(
            &matches.documents,
            &new_matches,
            &current_season_id,
        );
        let outcome = reconciler.season_matches(&rows).await;
        stages.push(StageReport::new("season_matches", rows.len(), None, outcome, 0));

        let tracked: HashSet<String> = stored_players;
        let outcome = reconciler
            .match_stats(&matches.documents, &stored_matches, &tracked)
            .await;
        stages.push(StageReport::new(
            "player_match_stats",
            outcome.reconciled + outcome.failed,
            None,
            outcome,
            0,
        ));

        // Stats
        let captured_season_stats = store
            .captured_stat_keys(StatsKind::Season, &player_ids)
            .await
            .map_err(SyncError::persistence("player_season_captures"))?;
        let captured_ranked_stats = store
            .captured_stat_keys(StatsKind::Ranked, &player_ids)
            .await
            .map_err(SyncError::persistence("player_season_captures"))?;
        let created_at = store
            .match_created_at(&referenced)
            .await
            .map_err(SyncError::persistence("matches"))?;
        let plan = planner::plan_stats(&StatsPlanInput {
            players: &players,
            seasons: &seasons.documents,
            current_season_id: &current_season_id,
            captured_season_stats: &captured_season_stats,
            captured_ranked_stats: &captured_ranked_stats,
            match_created_at: &created_at,
            watermark: ctx.watermark,
        });
        info!(
            season_stats = plan.season_stats.len(),
            ranked_stats = plan.ranked_stats.len(),
            lifetime = plan.lifetime_players.len(),
            "stats planned"
        );

        let season_docs = self.fetcher.fetch_season_stats(ctx, &plan.season_stats).await;
        let outcome = reconciler.season_stats(&season_docs.documents).await;
        stages.push(StageReport::new(
            "player_season_stats",
            plan.season_stats.len(),
            Some(season_docs.documents.len()),
            outcome,
            season_docs.failed(),
        ));

        let linked: Vec<String> = season_docs
            .documents
            .iter()
            .flat_map(|d| d.match_ids.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let linkable = store
            .existing_match_ids(&linked)
            .await
            .map_err(SyncError::persistence("matches"))?;
        let rows = reconciler::season_matches_from_stats(&season_docs.documents, &linkable);
        let outcome = reconciler.season_matches(&rows).await;
        stages.push(StageReport::new("season_stat_matches", rows.len(), None, outcome, 0));

        let ranked_docs = self.fetcher.fetch_ranked_stats(ctx, &plan.ranked_stats).await;
        let outcome = reconciler.ranked_stats(&ranked_docs.documents).await;
        stages.push(StageReport::new(
            "player_ranked_season_stats",
            plan.ranked_stats.len(),
            Some(ranked_docs.documents.len()),
            outcome,
            ranked_docs.failed(),
        ));

        let lifetime_docs = self
            .fetcher
            .fetch_lifetime_stats(ctx, &plan.lifetime_players)
            .await;
        let outcome = reconciler.lifetime_stats(&lifetime_docs.documents).await;
        stages.push(StageReport::new(
            "player_lifetime_stats",
            plan.lifetime_players.len(),
            Some(lifetime_docs.documents.len()),
            outcome,
            lifetime_docs.failed(),
        ));

        let watermark_after = ctx.next_watermark();
        store
            .save_watermark(watermark_after)
            .await
            .map_err(SyncError::persistence(pubgsync_core::WATERMARK_KEY))?;

        Ok(SyncRunSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            watermark_before: ctx.watermark,
            watermark_after,
            current_season_id,
            stages,
        })
    }

    async fn write_summary(&self, summary: &SyncRunSummary) -> Result<Option<PathBuf>> {
        let Some(reports_root) = &self.config.reports_dir else {
            return Ok(None);
        };
        let dir = reports_root.join(summary.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(SUMMARY_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(Some(path))
    }

    /// Cron-driven runs. Ticks that fire while a run is still going are skipped.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.scheduler_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.try_run_once().await {
                    Some(Ok(summary)) => info!(
                        run_id = %summary.run_id,
                        failed = summary.total_failed(),
                        "scheduled sync finished"
                    ),
                    Some(Err(err)) => error!(error = %err, "scheduled sync failed"),
                    None => {}
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

pub fn build_api_client(config: &SyncConfig) -> Result<PubgApiClient> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        bearer_token: Some(config.api_token.clone()),
        accept: Some(JSON_API_MEDIA_TYPE.to_string()),
        global_concurrency: config.bulk_concurrency.max(1),
    })?;
    let mut client = PubgApiClient::new(http, &config.api_base_url, &config.shard);
    if let Some(dir) = &config.archive_dir {
        client = client.with_archive(ArtifactStore::new(dir.clone()));
    }
    Ok(client)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::connect(config, false).await?;
    Ok(pipeline.run_once().await?)
}
