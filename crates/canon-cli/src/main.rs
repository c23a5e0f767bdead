use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use canon_core::WorkKind;
use canon_storage::{HttpFetcher, PgSearchIndex, PgStore};
use canon_sync::{CanonConfig, Pipeline, PluginRegistry, WorkerReport};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "canon")]
#[command(about = "Entity resolution and stub synthesis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match entities and assign them to stubs.
    Evaluate(WorkArgs),
    /// Synthesize stubs from their mapping sets.
    Generate(WorkArgs),
    /// Refresh search documents and reference counts.
    Reindex(WorkArgs),
    /// Fetch documents into the entity store.
    #[command(subcommand)]
    Ingest(IngestCommand),
    /// Print tracker, store and index counts as JSON.
    Status,
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Args)]
struct WorkArgs {
    /// Process these ids directly instead of polling the tracker.
    ids: Vec<Uuid>,
    /// Mark every item dirty before running.
    #[arg(long)]
    all: bool,
    /// Mark every item dirty and exit without processing.
    #[arg(long, conflicts_with = "all")]
    reset: bool,
    /// Keep polling after the tracker is empty.
    #[arg(long)]
    continuous: bool,
}

#[derive(Debug, Subcommand)]
enum IngestCommand {
    /// Fetch one document and store the entity it describes.
    Fetch {
        uri: String,
        /// Identifier to record as the entity's primary IRI.
        canonical: Option<String>,
    },
    /// Drain the scheduled ingest queue.
    Run {
        #[arg(long)]
        continuous: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(config: &CanonConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url, 8)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    Ok(store.with_retry_policy(config.retry_policy()))
}

async fn pipeline(config: CanonConfig) -> Result<Pipeline> {
    let registry = PluginRegistry::load(&config.registry_path)
        .await
        .with_context(|| format!("loading {}", config.registry_path.display()))?;
    let store = connect(&config).await?;
    let index = PgSearchIndex::new(store.pool().clone());
    let fetcher = HttpFetcher::new(config.http_client()).context("building http client")?;
    Pipeline::new(
        config,
        &registry,
        Arc::new(store),
        Arc::new(index),
        Arc::new(fetcher),
    )
}

async fn run_work(pipeline: &Pipeline, kind: WorkKind, args: WorkArgs) -> Result<WorkerReport> {
    if !args.ids.is_empty() {
        let mut report = WorkerReport::default();
        for id in args.ids {
            match pipeline.process(kind, id).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    error!(%id, %kind, error = %err, "processing failed");
                    report.failed += 1;
                }
            }
        }
        if kind == WorkKind::Index {
            pipeline.indexer.commit().await.context("committing index")?;
        }
        return Ok(report);
    }
    if args.reset {
        pipeline.reset(kind).await?;
        return Ok(WorkerReport::default());
    }
    if args.all {
        pipeline.reset(kind).await?;
    }
    pipeline
        .run_worker(kind, pipeline.options(kind, args.continuous))
        .await
}

async fn run(cli: Cli) -> Result<bool> {
    let config = CanonConfig::from_env();
    let report = match cli.command {
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
            return Ok(true);
        }
        Commands::Status => {
            let pipeline = pipeline(config).await?;
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(true);
        }
        Commands::Evaluate(args) => run_work(&pipeline(config).await?, WorkKind::Entity, args).await?,
        Commands::Generate(args) => run_work(&pipeline(config).await?, WorkKind::Stub, args).await?,
        Commands::Reindex(args) => run_work(&pipeline(config).await?, WorkKind::Index, args).await?,
        Commands::Ingest(IngestCommand::Fetch { uri, canonical }) => {
            let pipeline = pipeline(config).await?;
            let entity = pipeline
                .ingestor
                .ingest_uri(&uri, canonical.as_deref())
                .await
                .with_context(|| format!("ingesting {uri}"))?;
            println!("{}", entity.id);
            return Ok(true);
        }
        Commands::Ingest(IngestCommand::Run { continuous }) => {
            pipeline(config).await?.run_ingest_queue(continuous).await?
        }
    };
    info!(
        processed = report.processed,
        failed = report.failed,
        stalled = report.stalled,
        "run complete"
    );
    Ok(report.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_work_flags_and_ids() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["canon", "generate", &id.to_string(), "--continuous"])
            .expect("parse");
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.ids, vec![id]);
        assert!(args.continuous);
        assert!(!args.all);
    }

    #[test]
    fn parses_ingest_subcommands() {
        let cli = Cli::try_parse_from([
            "canon",
            "ingest",
            "fetch",
            "http://a.example/x",
            "http://b.example/y",
        ])
        .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Ingest(IngestCommand::Fetch { canonical: Some(_), .. })
        ));
        let cli = Cli::try_parse_from(["canon", "ingest", "run", "--continuous"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Ingest(IngestCommand::Run { continuous: true })
        ));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(Cli::try_parse_from(["canon", "evaluate", "not-a-uuid"]).is_err());
        assert!(Cli::try_parse_from(["canon", "reindex", "--all", "--reset"]).is_err());
    }
}
