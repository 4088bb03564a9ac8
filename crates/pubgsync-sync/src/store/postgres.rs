use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pubgsync_core::{
    GameModeStats, Match, Player, PlayerLifetimeStats, PlayerMatch, PlayerMatchStats,
    PlayerRankedSeasonStats, PlayerSeasonKey, PlayerSeasonStats, Season, SeasonMatch,
    WATERMARK_KEY,
};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{ConnectOptions, Postgres};
use tracing::info;

use super::{StatsKind, StoreError, SyncStore};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

const GAME_MODE_STAT_COLUMNS: &[&str] = &[
    "assists",
    "boosts",
    "dbnos",
    "daily_kills",
    "daily_wins",
    "damage_dealt",
    "days",
    "headshot_kills",
    "heals",
    "kills",
    "longest_kill",
    "longest_time_survived",
    "losses",
    "max_kill_streaks",
    "most_survival_time",
    "revives",
    "ride_distance",
    "road_kills",
    "round_most_kills",
    "rounds_played",
    "suicides",
    "swim_distance",
    "team_kills",
    "time_survived",
    "top10s",
    "vehicle_destroys",
    "walk_distance",
    "weapons_acquired",
    "weekly_kills",
    "weekly_wins",
    "wins",
];

const MATCH_STAT_COLUMNS: &[&str] = &[
    "dbnos",
    "assists",
    "boosts",
    "damage_dealt",
    "death_type",
    "headshot_kills",
    "heals",
    "kill_place",
    "kills",
    "longest_kill",
    "revives",
    "ride_distance",
    "road_kills",
    "swim_distance",
    "team_kills",
    "time_survived",
    "vehicle_destroys",
    "walk_distance",
    "weapons_acquired",
    "win_place",
];

const RANKED_STAT_COLUMNS: &[&str] = &[
    "current_tier",
    "current_sub_tier",
    "current_rank_point",
    "best_tier",
    "best_sub_tier",
    "best_rank_point",
    "rounds_played",
    "avg_rank",
    "top10_ratio",
    "win_ratio",
    "assists",
    "wins",
    "kda",
    "kills",
    "deaths",
    "damage_dealt",
    "dbnos",
];

static MATCH_STATS_UPSERT: OnceLock<String> = OnceLock::new();
static SEASON_STATS_UPSERT: OnceLock<String> = OnceLock::new();
static RANKED_STATS_UPSERT: OnceLock<String> = OnceLock::new();
static LIFETIME_STATS_UPSERT: OnceLock<String> = OnceLock::new();

/// `INSERT .. ON CONFLICT (keys) DO UPDATE` over `keys` followed by `columns`, with
/// placeholders numbered in that order.
fn upsert_sql(table: &str, keys: &[&str], columns: &[&str]) -> String {
    let all: Vec<&str> = keys.iter().chain(columns).copied().collect();
    let placeholders = (1..=all.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT ({}) DO UPDATE SET {updates}",
        all.join(", "),
        keys.join(", ")
    )
}

fn cached(
    cell: &'static OnceLock<String>,
    table: &str,
    keys: &[&str],
    columns: &[&str],
) -> &'static str {
    cell.get_or_init(|| upsert_sql(table, keys, columns)).as_str()
}

fn bind_game_mode_stats<'q>(query: PgQuery<'q>, s: &'q GameModeStats) -> PgQuery<'q> {
    query
        .bind(s.assists)
        .bind(s.boosts)
        .bind(s.dbnos)
        .bind(s.daily_kills)
        .bind(s.daily_wins)
        .bind(s.damage_dealt)
        .bind(s.days)
        .bind(s.headshot_kills)
        .bind(s.heals)
        .bind(s.kills)
        .bind(s.longest_kill)
        .bind(s.longest_time_survived)
        .bind(s.losses)
        .bind(s.max_kill_streaks)
        .bind(s.most_survival_time)
        .bind(s.revives)
        .bind(s.ride_distance)
        .bind(s.road_kills)
        .bind(s.round_most_kills)
        .bind(s.rounds_played)
        .bind(s.suicides)
        .bind(s.swim_distance)
        .bind(s.team_kills)
        .bind(s.time_survived)
        .bind(s.top10s)
        .bind(s.vehicle_destroys)
        .bind(s.walk_distance)
        .bind(s.weapons_acquired)
        .bind(s.weekly_kills)
        .bind(s.weekly_wins)
        .bind(s.wins)
}

/// Postgres-backed destination store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32, echo_sql: bool) -> Result<Self> {
        let mut options: PgConnectOptions = database_url
            .parse()
            .context("parsing database url")?;
        if !echo_sql {
            options = options.disable_statement_logging();
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn write(&self, query: PgQuery<'_>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let done = query.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_information WHERE key = $1")
                .bind(WATERMARK_KEY)
                .fetch_optional(&self.pool)
                .await?;
        value
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|err| StoreError::Corrupt {
                        key: WATERMARK_KEY.to_string(),
                        message: format!("{raw:?}: {err}"),
                    })
            })
            .transpose()
    }

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let value = at.to_rfc3339_opts(SecondsFormat::Micros, true);
        self.write(
            sqlx::query(
                "INSERT INTO system_information (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value \
                 WHERE system_information.value::timestamptz < EXCLUDED.value::timestamptz",
            )
            .bind(WATERMARK_KEY)
            .bind(value),
        )
        .await?;
        Ok(())
    }

    async fn tracked_player_names(&self, shard: &str) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT player_name FROM sync_players WHERE shard = $1 ORDER BY player_name",
        )
        .bind(shard)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn add_tracked_player(&self, name: &str, shard: &str) -> Result<bool, StoreError> {
        let inserted = self
            .write(
                sqlx::query(
                    "INSERT INTO sync_players (player_name, shard) VALUES ($1, $2) \
                     ON CONFLICT (player_name, shard) DO NOTHING",
                )
                .bind(name)
                .bind(shard),
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn existing_match_ids(&self, match_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT match_id FROM matches WHERE match_id = ANY($1)")
            .bind(match_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn match_created_at(
        &self,
        match_ids: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT match_id, created_at FROM matches WHERE match_id = ANY($1)")
                .bind(match_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_player_match_stats(
        &self,
        player_ids: &[String],
    ) -> Result<HashSet<PlayerMatch>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT player_id, match_id FROM player_match_stats WHERE player_id = ANY($1)",
        )
        .bind(player_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(player_id, match_id)| PlayerMatch { player_id, match_id })
            .collect())
    }

    async fn captured_stat_keys(
        &self,
        kind: StatsKind,
        player_ids: &[String],
    ) -> Result<HashSet<PlayerSeasonKey>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT player_id, season_id FROM player_season_captures \
             WHERE kind = $1 AND player_id = ANY($2)",
        )
        .bind(kind.as_str())
        .bind(player_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(player, season)| PlayerSeasonKey::new(player, season))
            .collect())
    }

    async fn mark_stats_captured(&self, kind: StatsKind, key: &PlayerSeasonKey) -> Result<(), StoreError> {
        self.write(
            sqlx::query(
                "INSERT INTO player_season_captures (player_id, season_id, kind) VALUES ($1, $2, $3) \
                 ON CONFLICT (player_id, season_id, kind) DO UPDATE SET captured_at = now()",
            )
            .bind(&key.player_id)
            .bind(&key.season_id)
            .bind(kind.as_str()),
        )
        .await?;
        Ok(())
    }

    async fn upsert_player(&self, player: &Player) -> Result<(), StoreError> {
        self.write(
            sqlx::query(
                "INSERT INTO players (player_id, name, shard) VALUES ($1, $2, $3) \
                 ON CONFLICT (player_id) DO UPDATE SET name = EXCLUDED.name, shard = EXCLUDED.shard",
            )
            .bind(&player.player_id)
            .bind(&player.name)
            .bind(&player.shard),
        )
        .await?;
        Ok(())
    }

    async fn upsert_season(&self, season: &Season) -> Result<(), StoreError> {
        self.write(
            sqlx::query(
                "INSERT INTO seasons (season_id, is_current, is_off_season) VALUES ($1, $2, $3) \
                 ON CONFLICT (season_id) DO UPDATE SET is_current = EXCLUDED.is_current, \
                 is_off_season = EXCLUDED.is_off_season",
            )
            .bind(&season.season_id)
            .bind(season.is_current)
            .bind(season.is_off_season),
        )
        .await?;
        Ok(())
    }

    async fn upsert_match(&self, record: &Match) -> Result<(), StoreError> {
        self.write(
            sqlx::query(
                "INSERT INTO matches \
                 (match_id, created_at, duration, mode, map, is_custom, season_state, shard) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (match_id) DO UPDATE SET created_at = EXCLUDED.created_at, \
                 duration = EXCLUDED.duration, mode = EXCLUDED.mode, map = EXCLUDED.map, \
                 is_custom = EXCLUDED.is_custom, season_state = EXCLUDED.season_state, \
                 shard = EXCLUDED.shard",
            )
            .bind(&record.match_id)
            .bind(record.created_at)
            .bind(record.duration)
            .bind(&record.mode)
            .bind(&record.map)
            .bind(record.is_custom)
            .bind(&record.season_state)
            .bind(&record.shard),
        )
        .await?;
        Ok(())
    }

    async fn insert_player_match(&self, row: &PlayerMatch) -> Result<(), StoreError> {
        self.write(
            sqlx::query(
                "INSERT INTO player_matches (player_id, match_id) VALUES ($1, $2) \
                 ON CONFLICT (player_id, match_id) DO NOTHING",
            )
            .bind(&row.player_id)
            .bind(&row.match_id),
        )
        .await?;
        Ok(())
    }

    async fn insert_season_match(&self, row: &SeasonMatch) -> Result<(), StoreError> {
        self.write(
            sqlx::query(
                "INSERT INTO season_matches (season_id, match_id) VALUES ($1, $2) \
                 ON CONFLICT (season_id, match_id) DO NOTHING",
            )
            .bind(&row.season_id)
            .bind(&row.match_id),
        )
        .await?;
        Ok(())
    }

    async fn upsert_player_match_stats(&self, row: &PlayerMatchStats) -> Result<(), StoreError> {
        let sql = cached(
            &MATCH_STATS_UPSERT,
            "player_match_stats",
            &["player_id", "match_id"],
            MATCH_STAT_COLUMNS,
        );
        let s = &row.stats;
        let query = sqlx::query(sql)
            .bind(&row.player_id)
            .bind(&row.match_id)
            .bind(s.dbnos)
            .bind(s.assists)
            .bind(s.boosts)
            .bind(s.damage_dealt)
            .bind(&s.death_type)
            .bind(s.headshot_kills)
            .bind(s.heals)
            .bind(s.kill_place)
            .bind(s.kills)
            .bind(s.longest_kill)
            .bind(s.revives)
            .bind(s.ride_distance)
            .bind(s.road_kills)
            .bind(s.swim_distance)
            .bind(s.team_kills)
            .bind(s.time_survived)
            .bind(s.vehicle_destroys)
            .bind(s.walk_distance)
            .bind(s.weapons_acquired)
            .bind(s.win_place);
        self.write(query).await?;
        Ok(())
    }

    async fn upsert_season_stats(&self, row: &PlayerSeasonStats) -> Result<(), StoreError> {
        let sql = cached(
            &SEASON_STATS_UPSERT,
            "player_season_stats",
            &["player_id", "season_id", "game_mode"],
            GAME_MODE_STAT_COLUMNS,
        );
        let query = sqlx::query(sql)
            .bind(&row.player_id)
            .bind(&row.season_id)
            .bind(&row.game_mode);
        self.write(bind_game_mode_stats(query, &row.stats)).await?;
        Ok(())
    }

    async fn upsert_ranked_stats(&self, row: &PlayerRankedSeasonStats) -> Result<(), StoreError> {
        let sql = cached(
            &RANKED_STATS_UPSERT,
            "player_ranked_season_stats",
            &["player_id", "season_id", "game_mode"],
            RANKED_STAT_COLUMNS,
        );
        let s = &row.stats;
        let query = sqlx::query(sql)
            .bind(&row.player_id)
            .bind(&row.season_id)
            .bind(&row.game_mode)
            .bind(&s.current_tier.tier)
            .bind(&s.current_tier.sub_tier)
            .bind(s.current_rank_point)
            .bind(&s.best_tier.tier)
            .bind(&s.best_tier.sub_tier)
            .bind(s.best_rank_point)
            .bind(s.rounds_played)
            .bind(s.avg_rank)
            .bind(s.top10_ratio)
            .bind(s.win_ratio)
            .bind(s.assists)
            .bind(s.wins)
            .bind(s.kda)
            .bind(s.kills)
            .bind(s.deaths)
            .bind(s.damage_dealt)
            .bind(s.dbnos);
        self.write(query).await?;
        Ok(())
    }

    async fn upsert_lifetime_stats(&self, row: &PlayerLifetimeStats) -> Result<(), StoreError> {
        let sql = cached(
            &LIFETIME_STATS_UPSERT,
            "player_lifetime_stats",
            &["player_id", "game_mode"],
            GAME_MODE_STAT_COLUMNS,
        );
        let query = sqlx::query(sql).bind(&row.player_id).bind(&row.game_mode);
        self.write(bind_game_mode_stats(query, &row.stats)).await?;
        Ok(())
    }
}
