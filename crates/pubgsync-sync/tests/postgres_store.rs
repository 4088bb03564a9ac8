mod common;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use common::{test_config, FakeUpstream};
use pubgsync_sync::{PgStore, SyncPipeline, SyncStore};

const TABLES: &str = "player_season_captures, player_lifetime_stats, player_ranked_season_stats, \
                      player_season_stats, player_match_stats, season_matches, player_matches, matches, \
                      seasons, players, sync_players, system_information";

async fn fresh_store() -> Result<PgStore> {
    let url = std::env::var("TEST_DATABASE_URL").context("TEST_DATABASE_URL is not set")?;
    let store = PgStore::connect(&url, 2, false).await?;
    store.migrate().await?;
    sqlx::query(&format!("TRUNCATE {TABLES}"))
        .execute(store.pool())
        .await
        .context("truncating tables")?;
    Ok(store)
}

async fn count(store: &PgStore, table: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(store.pool())
        .await?)
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL pointing at a disposable database"]
async fn pipeline_runs_are_idempotent_against_postgres() -> Result<()> {
    let store = Arc::new(fresh_store().await?);
    let pipeline = SyncPipeline::new(
        test_config(&[]),
        Arc::clone(&store) as Arc<dyn SyncStore>,
        Arc::new(FakeUpstream::from_fixtures()),
    );

    pipeline.run_once().await?;
    let first = [
        count(&store, "matches").await?,
        count(&store, "player_matches").await?,
        count(&store, "season_matches").await?,
        count(&store, "player_season_stats").await?,
        count(&store, "player_lifetime_stats").await?,
        count(&store, "player_season_captures").await?,
    ];
    assert_eq!(first, [3, 3, 2, 36, 6, 12]);

    let second = pipeline.run_once().await?;
    let again = [
        count(&store, "matches").await?,
        count(&store, "player_matches").await?,
        count(&store, "season_matches").await?,
        count(&store, "player_season_stats").await?,
        count(&store, "player_lifetime_stats").await?,
        count(&store, "player_season_captures").await?,
    ];
    assert_eq!(first, again);

    let stored = store.load_watermark().await?.context("watermark missing")?;
    assert_eq!(stored.timestamp_micros(), second.watermark_after.timestamp_micros());
    Ok(())
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL pointing at a disposable database"]
async fn postgres_watermark_never_moves_backwards() -> Result<()> {
    let store = fresh_store().await?;
    let later = chrono::Utc::now();
    store.save_watermark(later).await?;
    store.save_watermark(later - ChronoDuration::days(1)).await?;

    let stored = store.load_watermark().await?.context("watermark missing")?;
    assert_eq!(stored.timestamp_micros(), later.timestamp_micros());
    Ok(())
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL pointing at a disposable database"]
async fn postgres_rejects_links_to_missing_parents() -> Result<()> {
    let store = fresh_store().await?;
    let row = pubgsync_core::PlayerMatch {
        player_id: "account.nobody".to_string(),
        match_id: "match-none".to_string(),
    };
    assert!(store.insert_player_match(&row).await.is_err());
    assert!(store.add_tracked_player("Alpha", "steam").await?);
    assert!(!store.add_tracked_player("Alpha", "steam").await?);
    Ok(())
}
