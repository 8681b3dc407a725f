//! netdbd: standalone network-state mirror daemon.
//!
//! Connects one replay source per `--source NAME=CAPTURE` argument,
//! mirrors everything into a SQLite store and serves until interrupted.

mod replay;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netdb::{Config, NetDb, Schema, SourceSpec, Target};
use netdb_sqlite::SqliteStore;

use crate::replay::ReplayProvider;

#[derive(Debug, Parser)]
#[command(name = "netdbd", about = "Continuous network-state mirror daemon")]
struct Args {
    /// Store location; ":memory:" keeps the mirror private to the process.
    #[arg(long, default_value = ":memory:")]
    db: String,

    /// Source to mirror, as NAME=CAPTURE.json; may repeat.
    #[arg(long = "source", value_name = "NAME=FILE")]
    sources: Vec<String>,

    /// Seconds between dead-reference sweeps.
    #[arg(long, default_value_t = 60)]
    gc_interval: u64,

    /// Log every envelope each source enqueues.
    #[arg(long)]
    event_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    match run(args).await {
        Ok(()) => {
            info!("netdbd: exiting normally");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "netdbd: exiting with error");
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

async fn run(args: Args) -> Result<()> {
    let store: Arc<dyn Schema> = if args.db == ":memory:" {
        Arc::new(SqliteStore::in_memory()?)
    } else {
        Arc::new(SqliteStore::open(&args.db)?)
    };

    let mut initial = Vec::with_capacity(args.sources.len());
    for entry in &args.sources {
        let (target, spec) = parse_source(entry, args.event_log)?;
        initial.push((target, spec));
    }

    let config = Config {
        gc_interval: Duration::from_secs(args.gc_interval),
        ..Config::default()
    };

    info!(db = %args.db, sources = initial.len(), "netdbd: starting mirror");
    let db = NetDb::new(store, initial, config)
        .await
        .context("starting the mirror engine")?;

    signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("netdbd: interrupt received, shutting down");

    db.close().await.context("shutting the mirror down")?;
    Ok(())
}

fn parse_source(entry: &str, event_log: bool) -> Result<(Target, SourceSpec)> {
    let Some((name, path)) = entry.split_once('=') else {
        bail!("malformed --source {entry:?}, expected NAME=FILE");
    };
    let provider = ReplayProvider::from_file(path)?;
    let spec = SourceSpec::handle(Box::new(provider)).event_log(event_log);
    Ok((Target::new(name), spec))
}
