use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use rollcall_core::RollcallConfig;
use tracing::info;

mod app;
mod cli;
mod cycle;

use cli::{Cli, Command};

/// Far enough ahead that `pending` lists everything still waiting.
const PENDING_HORIZON_DAYS: i64 = 36_500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rollcall=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = RollcallConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Sync => sync_once(config).await,
        Command::Pending => list_pending(&config),
        Command::DeadLetters { limit } => list_dead_letters(&config, limit),
    }
}

async fn run(config: RollcallConfig) -> anyhow::Result<()> {
    config.require_upstream()?;
    let stores = app::Stores::open(&config)?;
    let engine = app::build_engine(&config, &stores);
    let interval = Duration::from_secs(config.schedule.sync_interval_secs.max(1));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, finishing current work");
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    info!("rollcall stopped");
    Ok(())
}

async fn sync_once(config: RollcallConfig) -> anyhow::Result<()> {
    config.require_upstream()?;
    let stores = app::Stores::open(&config)?;
    let engine = app::build_engine(&config, &stores);
    let report = engine.run_cycle().await;
    // one-shot: timers armed by this cycle are not kept
    engine.scheduler.shutdown().await;
    println!(
        "inserted: {}  due: {}  processed: {}",
        report
            .inserted
            .map_or_else(|| "sync failed".to_string(), |n| n.to_string()),
        report.due,
        report.processed
    );
    Ok(())
}

fn list_pending(config: &RollcallConfig) -> anyhow::Result<()> {
    let stores = app::Stores::open(config)?;
    let counts = stores.events.count_by_status()?;
    let pending = stores
        .events
        .list_pending(Utc::now() + chrono::Duration::days(PENDING_HORIZON_DAYS))?;
    for event in &pending {
        let trigger = event.trigger_at(config.schedule.lead_minutes);
        println!(
            "{}  {}  (trigger {})  {}",
            event.start_date.to_rfc3339(),
            event.id,
            trigger.to_rfc3339(),
            event.name
        );
    }
    println!("{} pending, {} processed", counts.pending, counts.processed);
    Ok(())
}

fn list_dead_letters(config: &RollcallConfig, limit: usize) -> anyhow::Result<()> {
    let stores = app::Stores::open(config)?;
    let entries = stores.dead_letters.recent(limit)?;
    if entries.is_empty() {
        println!("no dead-letter entries");
    }
    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}
