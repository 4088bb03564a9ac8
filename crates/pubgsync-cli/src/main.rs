use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use pubgsync_sync::{PgStore, SyncConfig, SyncPipeline, SyncRunSummary, SyncStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pubgsync", version)]
#[command(about = "Incremental sync of PUBG API player, match and stats data into Postgres")]
struct Cli {
    /// YAML config file; environment variables override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log every SQL statement
    #[arg(long, global = true)]
    echo_sql: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now
    Sync,
    /// Apply database migrations
    Migrate,
    /// Run syncs on the configured cron schedule until interrupted
    Schedule,
    /// Manage the tracked player list
    Players {
        #[command(subcommand)]
        command: PlayerCommands,
    },
}

#[derive(Debug, Subcommand)]
enum PlayerCommands {
    Add { names: Vec<String> },
    List,
}

fn init_tracing(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let sql = if cli.echo_sql { "sqlx::query=debug" } else { "sqlx=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},{sql}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} season={} watermark={}",
        summary.run_id, summary.current_season_id, summary.watermark_after
    );
    for stage in &summary.stages {
        let fetched = stage
            .fetched
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<28} planned={:<5} fetched={:<5} reconciled={:<6} failed={}",
            stage.stage, stage.planned, fetched, stage.reconciled, stage.failed
        );
    }
}

async fn connect_store(config: &SyncConfig, echo_sql: bool) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url, config.db_max_connections, echo_sql).await?;
    store.migrate().await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = SyncConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::connect(config, cli.echo_sql).await?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            connect_store(&config, cli.echo_sql).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::connect(config, cli.echo_sql).await?);
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().scheduler_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Players { command } => {
            let store = connect_store(&config, cli.echo_sql).await?;
            match command {
                PlayerCommands::Add { names } => {
                    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
                        if store.add_tracked_player(name, &config.shard).await? {
                            println!("tracking {name} on {}", config.shard);
                        } else {
                            println!("{name} already tracked on {}", config.shard);
                        }
                    }
                }
                PlayerCommands::List => {
                    for name in store.tracked_player_names(&config.shard).await? {
                        println!("{name}");
                    }
                }
            }
        }
    }

    Ok(())
}
