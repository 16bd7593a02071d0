use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use campus_allocator::config;
use campus_allocator::domain::datastore::Datastore;
use campus_allocator::logger;

/// Dumps the metric table to CSV for the external analysis pipeline.
#[derive(Parser, Debug)]
#[command(name = "metrics-export")]
struct Args {
    /// SQLite database on the shared mount.
    #[arg(long, default_value = "classroom.db")]
    db: PathBuf,

    /// Output CSV path.
    #[arg(long, default_value = "metrics.csv")]
    out: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init("metrics-export");

    let store = Datastore::open(&args.db, config::DEFAULT_SEMESTER).context("opening the shared datastore")?;
    let file = File::create(&args.out).with_context(|| format!("creating {}", args.out.display()))?;
    let exported = store.export_metrics_csv(file)?;

    log::info!("Exported {} metric rows to {}", exported, args.out.display());
    Ok(())
}
