use std::sync::Once;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use shiftsync_core::{DateRange, TriggerKind};
use shiftsync_sync::{
    MappingWrite, PgStore, SyncConfig, SyncOutcome, SyncOutcomeStatus, SyncRequest, SyncRuntime,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shiftsync")]
#[command(about = "Spreadsheet schedule sync and identity reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one target.
    Sync {
        #[arg(long)]
        target: String,
        /// Ignore the freshness policy and bypass cached sheets.
        #[arg(long)]
        force: bool,
        #[arg(long, default_value = "interactive")]
        trigger: TriggerKind,
        #[arg(long)]
        by: Option<String>,
    },
    /// Sync every enabled target, each under its own freshness decision.
    SyncAll {
        #[arg(long, default_value = "auto")]
        trigger: TriggerKind,
    },
    Status {
        #[arg(long)]
        target: Option<String>,
    },
    /// Cached schedule rows of one entity.
    Rows {
        #[arg(long)]
        target: String,
        #[arg(long)]
        entity: String,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    History {
        #[arg(long)]
        target: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Register an explicit identity mapping.
    Map {
        #[arg(long)]
        target: String,
        #[arg(long)]
        external: String,
        #[arg(long)]
        entity: String,
    },
    Migrate,
    /// Run the periodic scheduler until interrupted.
    Watch,
}

static LOG_INIT: Once = Once::new();

fn init_logging() {
    LOG_INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("SHIFTSYNC_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    });
}

fn print_outcome(outcome: &SyncOutcome) {
    let status = match &outcome.status {
        SyncOutcomeStatus::Skipped(reason) => format!("skipped ({reason:?})"),
        SyncOutcomeStatus::Succeeded => "succeeded".to_string(),
        SyncOutcomeStatus::Degraded => "degraded".to_string(),
        SyncOutcomeStatus::Failed => "failed".to_string(),
    };
    println!(
        "{}: {} rows_affected={} entities_synced={} unmatched={}",
        outcome.target_id,
        status,
        outcome.rows_affected,
        outcome.entities_synced,
        outcome.entities_unmatched
    );
    for err in &outcome.sheet_errors {
        println!(
            "  sheet {} ({:?}{}): {}",
            err.role,
            err.kind,
            if err.critical { ", critical" } else { "" },
            err.message
        );
    }
    for report in &outcome.unmatched {
        if let Some(owner) = &report.claimed_by {
            println!("  unmatched entity {} (row taken by {owner})", report.entity_id);
            continue;
        }
        let hints: Vec<&str> = report.suggestions.iter().map(|(id, _)| id.as_str()).collect();
        println!("  unmatched entity {} (closest: {:?})", report.entity_id, hints);
    }
    if let Some(error) = &outcome.error {
        println!("  error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    let command = cli.command.unwrap_or(Commands::SyncAll {
        trigger: TriggerKind::Auto,
    });
    if let Commands::Migrate = command {
        let Some(url) = &config.database_url else {
            bail!("DATABASE_URL is required for migrate");
        };
        let store = PgStore::connect(url).await?;
        store.migrate().await?;
        store.close().await;
        println!("migrations applied");
        return Ok(());
    }

    let mut runtime = SyncRuntime::start(config).await?;
    let engine = runtime.engine().clone();
    match command {
        Commands::Sync {
            target,
            force,
            trigger,
            by,
        } => {
            let mut request = SyncRequest::new(trigger);
            request.force = force;
            request.triggered_by = by;
            let outcome = engine.trigger_sync(&target, request).await?;
            print_outcome(&outcome);
        }
        Commands::SyncAll { trigger } => {
            for (target_id, outcome) in engine.sync_all(trigger).await {
                match outcome {
                    Ok(outcome) => print_outcome(&outcome),
                    Err(err) => println!("{target_id}: error {err:#}"),
                }
            }
        }
        Commands::Status { target } => {
            let targets: Vec<String> = match target {
                Some(target) => vec![target],
                None => engine
                    .registry()
                    .targets
                    .iter()
                    .map(|t| t.target_id.clone())
                    .collect(),
            };
            for target_id in targets {
                let view = engine.get_sync_status(&target_id).await?;
                println!(
                    "{}: last_synced_at={} status={} rows_synced={} entities_synced={}{}",
                    view.target_id,
                    view.last_synced_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    view.status.map(|s| s.as_str()).unwrap_or("none"),
                    view.rows_synced,
                    view.entities_synced,
                    if view.in_progress { " (in progress)" } else { "" }
                );
            }
        }
        Commands::Rows {
            target,
            entity,
            from,
            to,
        } => {
            let range = from.zip(to).map(|(from, to)| DateRange::new(from, to));
            for row in engine.get_cached_rows(&entity, &target, range).await? {
                println!("{} {:<6} {}", row.date, row.category, row.value);
            }
        }
        Commands::History { target, limit } => {
            for record in engine.list_sync_records(&target, limit).await? {
                println!(
                    "{} {} {} trigger={} rows={} entities={} unmatched={} duration_ms={}",
                    record.started_at.to_rfc3339(),
                    record.record_id,
                    record.status.as_str(),
                    record.trigger,
                    record.rows_affected,
                    record.entities_synced,
                    record.entities_unmatched,
                    record.duration_ms.unwrap_or_default()
                );
            }
        }
        Commands::Map {
            target,
            external,
            entity,
        } => match engine.register_mapping(&target, &external, &entity).await? {
            MappingWrite::Inserted => println!("mapping created"),
            MappingWrite::Refreshed => println!("mapping already present"),
            MappingWrite::Conflict { existing } => println!(
                "conflict: {} is mapped to entity {} ({})",
                existing.external_id,
                existing.entity_id,
                existing.source.as_str()
            ),
        },
        Commands::Watch => {
            if runtime.start_scheduler().await? {
                info!("watching; press ctrl-c to stop");
                tokio::signal::ctrl_c().await?;
            } else {
                warn!("scheduler disabled; set SHIFTSYNC_SCHEDULER_ENABLED=true");
            }
        }
        Commands::Migrate => {}
    }

    runtime.shutdown().await
}
