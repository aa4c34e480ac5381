//! ---
//! bms_section: "05-networking-external-interfaces"
//! bms_subsection: "binary"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Inspection CLI for R-BMS binary data logs."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use r_bms_persistence::{LogReader, ReadStrategy, ValueStore};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod report;

use report::{LogStats, RecordView};

#[derive(Debug, Parser)]
#[command(author, version, about = "R-BMS data log inspection utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Print every record as one JSON object per line")]
    Dump {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = Strategy::SlidingWindow)]
        strategy: Strategy,
        #[arg(long, help = "Print the full replayed state instead of the changes")]
        full: bool,
    },
    #[command(about = "Summarise record counts and time span")]
    Stats {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = Strategy::SlidingWindow)]
        strategy: Strategy,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    Rewind,
    SlidingWindow,
}

impl From<Strategy> for ReadStrategy {
    fn from(value: Strategy) -> Self {
        match value {
            Strategy::Rewind => ReadStrategy::Rewind,
            Strategy::SlidingWindow => ReadStrategy::SlidingWindow,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("R_BMS_LOG"))
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Dump {
            file,
            strategy,
            full,
        } => dump(&file, strategy.into(), full),
        Commands::Stats { file, strategy } => {
            let stats = stats(&file, strategy.into())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn open(file: &Path, strategy: ReadStrategy) -> Result<LogReader<fs::File>> {
    LogReader::open(file, strategy).with_context(|| format!("unable to open {}", file.display()))
}

fn dump(file: &Path, strategy: ReadStrategy, full: bool) -> Result<()> {
    let mut reader = open(file, strategy)?;
    let mut store = ValueStore::new();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for record in reader.by_ref() {
        let record = record.with_context(|| format!("failed to read {}", file.display()))?;
        let view = if full {
            let snapshot = store.apply(&record);
            RecordView::full(record.time, record.category, &snapshot)
        } else {
            RecordView::changes(&record)
        };
        serde_json::to_writer(&mut out, &view)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    debug!(offset = reader.offset(), "end of log");
    Ok(())
}

fn stats(file: &Path, strategy: ReadStrategy) -> Result<LogStats> {
    let mut reader = open(file, strategy)?;
    let mut stats = LogStats::default();
    for record in reader.by_ref() {
        stats.add(&record.with_context(|| format!("failed to read {}", file.display()))?);
    }
    stats.bytes = reader.offset();
    Ok(stats)
}
