use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use price_ingest::{
    config::IngestConfig,
    logging::init_tracing,
    orchestrator::Ingestor,
    store::{CatalogStore, MemoryCatalogStore, PgCatalogStore},
    util::{
        db::Db,
        env::{db_url, env_opt, env_parse, init_env, preflight_check},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "config/stores.json";

#[derive(Parser, Debug)]
#[command(name = "ingest", version, about = "Retail price ingestion CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // `ingest --only spar` runs without the explicit `run` subcommand.
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every configured store (default when no command supplied)
    Run(RunArgs),
    /// List configured stores and their source kinds
    Stores(ConfigArg),
    /// Apply pending SQL migrations
    Migrate,
}

#[derive(Debug, Default, Args)]
struct ConfigArg {
    /// Store definitions (JSON). Falls back to INGEST_CONFIG, then config/stores.json
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArg,
    /// Restrict the run to these stores (comma-separated, case-insensitive)
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    /// Dry run against an in-memory catalog; nothing is written to Postgres
    #[arg(long, action = ArgAction::SetTrue)]
    memory: bool,
    /// Pool size; defaults to DB_MAX_CONNECTIONS or 5
    #[arg(long)]
    max_connections: Option<u32>,
}

fn config_path(arg: &ConfigArg) -> PathBuf {
    arg.config
        .clone()
        .or_else(|| env_opt("INGEST_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn load_config(arg: &ConfigArg) -> Result<IngestConfig> {
    let path = config_path(arg);
    IngestConfig::from_path(&path).with_context(|| format!("loading {}", path.display()))
}

async fn connect(max_connections: Option<u32>) -> Result<Db> {
    preflight_check("ingest", &[], &["DATABASE_URL", "DB_HOST", "DB_DATABASE"])?;
    let url = db_url()?;
    let max = max_connections.unwrap_or_else(|| env_parse("DB_MAX_CONNECTIONS", 5u32));
    Db::connect(&url, max).await
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let stores = config.select(&args.only);
    if stores.is_empty() {
        warn!(only = ?args.only, "no configured store matches the filter");
        return Ok(());
    }

    let catalog: Arc<dyn CatalogStore> = if args.memory {
        info!("dry run: using the in-memory catalog");
        Arc::new(MemoryCatalogStore::new())
    } else {
        Arc::new(PgCatalogStore::new(connect(args.max_connections).await?))
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; finishing the current page");
            on_signal.cancel();
        }
    });

    let reports = Ingestor::with_http(catalog).run_all(stores, cancel).await;
    println!("{}", serde_json::to_string_pretty(&reports)?);

    let fatal: Vec<&str> = reports
        .iter()
        .filter(|r| r.is_fatal())
        .map(|r| r.store.as_str())
        .collect();
    if !fatal.is_empty() {
        error!(stores = ?fatal, "store runs aborted");
        anyhow::bail!("{} store run(s) aborted: {}", fatal.len(), fatal.join(", "));
    }
    Ok(())
}

fn list_stores(arg: &ConfigArg) -> Result<()> {
    let config = load_config(arg)?;
    for store in &config.stores {
        println!("{}\t{}", store.name, store.source.kind());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing("info,sqlx=warn")?;

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Run(args)) => run(args).await,
        Some(Command::Stores(arg)) => list_stores(&arg),
        Some(Command::Migrate) => {
            let db = Db::connect_no_migrate(&db_url()?, 1).await?;
            db.run_migrations().await
        }
        None => run(cli.run).await,
    }
}
