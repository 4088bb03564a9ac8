mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, FakeUpstream, ALPHA, BRAVO, CURRENT_SEASON};
use pubgsync_sync::{
    MemoryStore, PlanningError, StatsKind, SyncError, SyncPipeline, SyncRunSummary, SyncStore,
    SUMMARY_FILE_NAME,
};

fn pipeline(fake: FakeUpstream, store: Arc<MemoryStore>, overrides: &[(&str, &str)]) -> SyncPipeline {
    SyncPipeline::new(test_config(overrides), store, Arc::new(fake))
}

fn stage<'a>(summary: &'a SyncRunSummary, name: &str) -> &'a pubgsync_sync::StageReport {
    summary
        .stage(name)
        .unwrap_or_else(|| panic!("stage {name} missing from summary"))
}

#[tokio::test]
async fn first_run_populates_every_table() {
    let store = Arc::new(MemoryStore::new());
    let summary = pipeline(FakeUpstream::from_fixtures(), Arc::clone(&store), &[])
        .run_once()
        .await
        .expect("run");

    let state = store.snapshot().await;
    assert_eq!(state.players.len(), 2);
    assert_eq!(state.seasons.len(), 3);
    assert_eq!(state.matches.len(), 3);
    assert_eq!(state.player_matches.len(), 3);
    // match-3 was played after its season closed
    assert_eq!(state.season_matches.len(), 2);
    assert_eq!(state.player_match_stats.len(), 3);
    assert_eq!(state.season_stats.len(), 2 * 3 * 6);
    assert_eq!(state.ranked_stats.len(), 2 * 3 * 2);
    // bravo has no matches, so only alpha gets lifetime rows
    assert_eq!(state.lifetime_stats.len(), 6);
    assert!(state.lifetime_stats.keys().all(|(player, _)| player == ALPHA));

    assert_eq!(summary.current_season_id, CURRENT_SEASON);
    assert_eq!(summary.watermark_before.timestamp(), 0);
    assert_eq!(state.watermark, Some(summary.watermark_after));
    assert_eq!(summary.total_failed(), 0);
    assert_eq!(stage(&summary, "seasons").planned, 3);
    assert_eq!(stage(&summary, "matches").planned, 3);
}

#[tokio::test]
async fn second_run_refreshes_only_the_current_season() {
    let store = Arc::new(MemoryStore::new());
    let first = pipeline(FakeUpstream::from_fixtures(), Arc::clone(&store), &[])
        .run_once()
        .await
        .expect("first run");
    let after_first = store.snapshot().await;

    let fake = Arc::new(FakeUpstream::from_fixtures());
    let second = SyncPipeline::new(test_config(&[]), Arc::clone(&store) as Arc<dyn SyncStore>, Arc::clone(&fake) as _)
        .run_once()
        .await
        .expect("second run");
    let after_second = store.snapshot().await;

    assert_eq!(after_second.matches.len(), after_first.matches.len());
    assert_eq!(after_second.player_matches, after_first.player_matches);
    assert_eq!(after_second.season_matches, after_first.season_matches);
    assert_eq!(after_second.season_stats.len(), after_first.season_stats.len());
    assert_eq!(after_second.ranked_stats.len(), after_first.ranked_stats.len());

    assert_eq!(stage(&second, "matches").planned, 0);
    assert_eq!(stage(&second, "player_season_stats").planned, 2);
    assert_eq!(stage(&second, "player_ranked_season_stats").planned, 2);
    // no match is newer than the first run's start
    assert_eq!(stage(&second, "player_lifetime_stats").planned, 0);
    assert_eq!(fake.calls().iter().filter(|c| c.resource.starts_with("/matches/")).count(), 0);
    assert!(fake
        .calls()
        .iter()
        .filter(|c| c.resource.contains("/seasons/division"))
        .all(|c| c.resource.contains(CURRENT_SEASON)));

    assert_eq!(second.watermark_before, first.watermark_after);
    assert!(second.watermark_after >= first.watermark_after);
}

#[tokio::test]
async fn malformed_season_document_is_isolated() {
    let mut fake = FakeUpstream::from_fixtures();
    fake.add_season("division.bro.official.pc-2018-27");
    fake.add_season("division.bro.official.pc-2018-28");
    fake.malformed(&format!("/players/{ALPHA}/seasons/division.bro.official.pc-2018-29"));
    let store = Arc::new(MemoryStore::new());

    let summary = pipeline(fake, Arc::clone(&store), &[("PUBGSYNC_PLAYERS", "Alpha")])
        .run_once()
        .await
        .expect("run");

    let season_stage = stage(&summary, "player_season_stats");
    assert_eq!(season_stage.planned, 5);
    assert_eq!(season_stage.fetched, Some(4));
    assert_eq!(season_stage.reconciled, 4 * 6);
    assert_eq!(season_stage.failed, 1);

    let lifetime = stage(&summary, "player_lifetime_stats");
    assert_eq!(lifetime.reconciled, 6);
    assert!(store.snapshot().await.watermark.is_some());
}

#[tokio::test]
async fn no_current_season_aborts_before_any_write() {
    let mut fake = FakeUpstream::from_fixtures();
    for season in &mut fake.seasons {
        season.is_current = false;
    }
    let store = Arc::new(MemoryStore::new());

    let err = pipeline(fake, Arc::clone(&store), &[])
        .run_once()
        .await
        .expect_err("planning must fail");

    assert!(matches!(
        err,
        SyncError::PlanningInvariantViolation(PlanningError::NoCurrentSeason { seasons: 3 })
    ));
    let state = store.snapshot().await;
    assert_eq!(state.writes, 0);
    assert!(state.watermark.is_none());
}

#[tokio::test]
async fn failed_season_list_aborts_with_the_fetch_error() {
    let fake = FakeUpstream::from_fixtures();
    fake.fail_with_server_error("/seasons");
    let store = Arc::new(MemoryStore::new());

    let err = pipeline(fake, Arc::clone(&store), &[])
        .run_once()
        .await
        .expect_err("season list is required");

    assert!(matches!(err, SyncError::UpstreamRequest { ref key, .. } if key == "seasons"));
    let state = store.snapshot().await;
    assert_eq!(state.writes, 0);
    assert!(state.watermark.is_none());
}

#[tokio::test]
async fn match_stats_rejected_once_are_stored_on_the_next_run() {
    let store = Arc::new(MemoryStore::new());
    store.fail_writes_for(format!("{ALPHA}/match-1")).await;
    pipeline(FakeUpstream::from_fixtures(), Arc::clone(&store), &[])
        .run_once()
        .await
        .expect("first run");
    let after_first = store.snapshot().await;
    let row = (ALPHA.to_string(), "match-1".to_string());
    assert!(after_first.matches.contains_key("match-1"));
    assert!(!after_first.player_match_stats.contains_key(&row));

    let store = Arc::new(MemoryStore::with_state(after_first.clone()));
    let fake = Arc::new(FakeUpstream::from_fixtures());
    let second = SyncPipeline::new(test_config(&[]), Arc::clone(&store) as Arc<dyn SyncStore>, Arc::clone(&fake) as _)
        .run_once()
        .await
        .expect("second run");
    let after_second = store.snapshot().await;

    assert_eq!(stage(&second, "matches").planned, 1);
    assert_eq!(fake.calls_to("/matches/match-1"), 1);
    assert!(after_second.player_match_stats.contains_key(&row));
    assert_eq!(after_second.player_match_stats.len(), 3);
    // a refetched match keeps the season links it already had
    assert_eq!(after_second.season_matches, after_first.season_matches);
}

#[tokio::test]
async fn empty_ranked_documents_are_not_refetched_for_closed_seasons() {
    let mut fake = FakeUpstream::from_fixtures();
    fake.empty_ranked_documents();
    let store = Arc::new(MemoryStore::new());
    pipeline(fake, Arc::clone(&store), &[])
        .run_once()
        .await
        .expect("first run");
    let after_first = store.snapshot().await;
    assert!(after_first.ranked_stats.is_empty());
    let ranked_captures = after_first
        .stat_captures
        .iter()
        .filter(|(kind, _, _)| *kind == StatsKind::Ranked)
        .count();
    assert_eq!(ranked_captures, 2 * 3);

    let mut fake = FakeUpstream::from_fixtures();
    fake.empty_ranked_documents();
    let fake = Arc::new(fake);
    let second = SyncPipeline::new(test_config(&[]), Arc::clone(&store) as Arc<dyn SyncStore>, Arc::clone(&fake) as _)
        .run_once()
        .await
        .expect("second run");

    assert_eq!(stage(&second, "player_ranked_season_stats").planned, 2);
    assert!(fake
        .calls()
        .iter()
        .filter(|c| c.resource.ends_with("/ranked"))
        .all(|c| c.resource.contains(CURRENT_SEASON)));
}

#[tokio::test]
async fn failed_rows_do_not_hold_back_the_watermark() {
    let store = Arc::new(MemoryStore::new());
    store.fail_writes_for(format!("{ALPHA}/squad-fpp")).await;

    let summary = pipeline(FakeUpstream::from_fixtures(), Arc::clone(&store), &[])
        .run_once()
        .await
        .expect("run");

    let lifetime = stage(&summary, "player_lifetime_stats");
    assert_eq!(lifetime.reconciled, 5);
    assert_eq!(lifetime.failed, 1);
    assert_eq!(store.snapshot().await.watermark, Some(summary.watermark_after));
}

#[tokio::test]
async fn failed_player_write_skips_everything_that_depends_on_it() {
    let store = Arc::new(MemoryStore::new());
    store.fail_writes_for(ALPHA).await;

    let summary = pipeline(FakeUpstream::from_fixtures(), Arc::clone(&store), &[])
        .run_once()
        .await
        .expect("run");

    let state = store.snapshot().await;
    assert_eq!(stage(&summary, "players").failed, 1);
    assert!(state.players.contains_key(BRAVO));
    assert!(state.matches.is_empty());
    assert!(state.player_matches.is_empty());
    assert!(state.season_stats.keys().all(|(player, _, _)| player == BRAVO));
}

#[tokio::test]
async fn players_tracked_in_the_store_are_synced() {
    let store = Arc::new(MemoryStore::new());
    store.add_tracked_player("Bravo", "steam").await.expect("track");

    pipeline(FakeUpstream::from_fixtures(), Arc::clone(&store), &[("PUBGSYNC_PLAYERS", "Alpha")])
        .run_once()
        .await
        .expect("run");

    let state = store.snapshot().await;
    assert!(state.players.contains_key(ALPHA));
    assert!(state.players.contains_key(BRAVO));
}

#[tokio::test]
async fn summary_is_written_under_the_run_id() {
    let reports = tempfile::tempdir().expect("tempdir");
    let reports_dir = reports.path().display().to_string();
    let store = Arc::new(MemoryStore::new());

    let summary = pipeline(
        FakeUpstream::from_fixtures(),
        store,
        &[("PUBGSYNC_REPORTS_DIR", reports_dir.as_str())],
    )
    .run_once()
    .await
    .expect("run");

    let path = reports
        .path()
        .join(summary.run_id.to_string())
        .join(SUMMARY_FILE_NAME);
    let written: SyncRunSummary =
        serde_json::from_slice(&std::fs::read(&path).expect("summary file")).expect("summary json");
    assert_eq!(written.run_id, summary.run_id);
    assert_eq!(written.stages, summary.stages);
}

#[tokio::test(start_paused = true)]
async fn run_deadline_leaves_the_watermark_untouched() {
    let fake = FakeUpstream::from_fixtures();
    fake.delay_every_call(Duration::from_secs(10));
    let store = Arc::new(MemoryStore::new());

    let err = pipeline(fake, Arc::clone(&store), &[("PUBGSYNC_RUN_DEADLINE_SECS", "5")])
        .run_once()
        .await
        .expect_err("deadline");

    assert!(matches!(err, SyncError::DeadlineExceeded(d) if d == Duration::from_secs(5)));
    assert!(store.snapshot().await.watermark.is_none());
}

#[tokio::test(start_paused = true)]
async fn overlapping_scheduled_runs_are_skipped() {
    let fake = FakeUpstream::from_fixtures();
    fake.delay_every_call(Duration::from_secs(1));
    let pipeline = Arc::new(pipeline(fake, Arc::new(MemoryStore::new()), &[]));

    let running = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run_once().await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(pipeline.try_run_once().await.is_none());
    running.await.expect("join").expect("run");
    assert!(pipeline.try_run_once().await.is_some());
}

#[tokio::test]
async fn invalid_cron_expressions_are_rejected() {
    let pipeline = Arc::new(pipeline(
        FakeUpstream::from_fixtures(),
        Arc::new(MemoryStore::new()),
        &[("PUBGSYNC_SYNC_CRON", "every now and then")],
    ));
    assert!(pipeline.build_scheduler().await.is_err());
}
