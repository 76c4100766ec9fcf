use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use newsdesk_core::{RunTrigger, ScrapeSession};
use newsdesk_storage::PgStore;
use newsdesk_sync::{
    open_store, Orchestrator, RunOutcome, SourceRegistry, SourceTrigger, SyncConfig, SyncPipeline,
};
use newsdesk_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "newsdesk")]
#[command(about = "News and profile ingestion with duplicate detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scheduler plus API until interrupted.
    Run,
    /// Run sources once and print their sessions.
    Scrape {
        source: Option<String>,
        /// Lookup key for on-demand sources.
        #[arg(long)]
        query: Option<String>,
        #[arg(long, conflicts_with = "source")]
        all: bool,
    },
    Migrate,
    Serve {
        #[arg(long)]
        with_scheduler: bool,
    },
    /// List configured sources and their schedules.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsdesk=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => serve(&config, true).await?,
        Commands::Serve { with_scheduler } => serve(&config, with_scheduler).await?,
        Commands::Scrape { source, query, all } => scrape(&config, source, query, all).await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            PgStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.sources_path)?;
            for source in &registry.sources {
                let schedule = match source.trigger {
                    SourceTrigger::OnDemand => "on demand".to_string(),
                    SourceTrigger::Poll => match config.fast_interval_minutes() {
                        Some(minutes) => format!("every {minutes}m (fast)"),
                        None => format!("every {}m", source.interval_minutes),
                    },
                };
                let secondary = source
                    .secondary
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<12} enabled={:<5} {:<18} primary={} secondary={}",
                    source.name, source.enabled, schedule, source.primary, secondary
                );
            }
        }
    }

    Ok(())
}

async fn build_pipeline(config: &SyncConfig) -> Result<(Arc<SyncPipeline>, AppState)> {
    let registry = SourceRegistry::load(&config.sources_path)?;
    let handles = open_store(config).await?;
    info!(backend = handles.backend, sources = registry.sources.len(), "store ready");
    let pipeline = Arc::new(SyncPipeline::from_registry(&registry, handles.store, config)?);
    let state = AppState::new(handles.queries).with_pipeline(pipeline.clone());
    Ok((pipeline, state))
}

async fn serve(config: &SyncConfig, with_scheduler: bool) -> Result<()> {
    let (pipeline, state) = build_pipeline(config).await?;

    let mut orchestrator = if with_scheduler {
        let mut orchestrator = Orchestrator::new(pipeline, config).await?;
        orchestrator.start().await?;
        Some(orchestrator)
    } else {
        None
    };

    newsdesk_web::serve(state, config.web_port, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
        }
    })
    .await?;

    if let Some(orchestrator) = orchestrator.as_mut() {
        orchestrator.shutdown().await?;
    }
    Ok(())
}

async fn scrape(
    config: &SyncConfig,
    source: Option<String>,
    query: Option<String>,
    all: bool,
) -> Result<()> {
    let (pipeline, _) = build_pipeline(config).await?;

    let sessions = match (source, all) {
        (_, true) => pipeline.run_all_once(RunTrigger::Manual).await,
        (Some(name), false) => {
            match pipeline.run_on_demand(&name, query.as_deref()).await? {
                RunOutcome::Completed(session) => vec![session],
                RunOutcome::AlreadyRunning => Vec::new(),
            }
        }
        (None, false) => bail!("name a source or pass --all"),
    };

    for session in &sessions {
        print_session(session);
    }
    if sessions.iter().any(|s| !s.success) {
        bail!("one or more sources failed");
    }
    Ok(())
}

fn print_session(session: &ScrapeSession) {
    let method = session
        .method_used
        .map(|m| m.to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{} [{}] method={} found={} new={} updated={} duplicate={} flagged={} invalid={} {}ms",
        session.source,
        if session.success { "ok" } else { "failed" },
        method,
        session.items_found,
        session.items_new,
        session.items_updated,
        session.items_duplicate,
        session.items_flagged,
        session.items_invalid,
        session.duration_ms,
    );
    if let Some(message) = &session.error_message {
        println!("  error: {message}");
    }
}
