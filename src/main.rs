use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;

use bookmill::indexer::{
    CancelFlag, DEFAULT_GAMES_PER_BATCH, DEFAULT_STORE_BATCH_SIZE, IndexerConfig,
    default_worker_count, index_file,
};
use bookmill::openings::Openings;
use bookmill::pgn::GameFilter;
use bookmill::query::{DEFAULT_QUERY_LIMIT, Explorer, QueryOptions};
use bookmill::replay::DEFAULT_MAX_PLIES;
use bookmill::store::compact::{CompactOptions, compact};
use bookmill::store::log::{LogStore, LogStoreOptions};
use bookmill::store::mapped::MappedStore;
use bookmill::store::{ReadStore, StoreError, WriteStore};
use bookmill::util::{Res, human_bytes};

const EXIT_IO: u8 = 1;
const EXIT_INVALID: u8 = 2;
const EXIT_CANCELLED: u8 = 3;

#[derive(Parser)]
#[command(name = "bookmill", version, about = "Build and query offline opening-explorer databases from PGN archives")]
struct Cli {
    /// Run as if started in this directory.
    #[arg(long, global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a PGN archive into a write store.
    Index {
        /// PGN file to ingest.
        pgn: PathBuf,
        /// Write store directory.
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        /// Skip games below this average rating.
        #[arg(long)]
        min_rating: Option<u32>,
        /// Skip games before this year.
        #[arg(long)]
        min_year: Option<u16>,
        /// Allowed TimeControl header values; repeatable.
        #[arg(long = "time-control")]
        time_controls: Vec<String>,
        /// Replay at most this many plies per game.
        #[arg(long, default_value_t = DEFAULT_MAX_PLIES)]
        max_plies: usize,
        /// Worker threads; 0 processes batches on the coordinator thread.
        #[arg(long, default_value_t = default_worker_count())]
        workers: usize,
        #[arg(long, default_value_t = DEFAULT_GAMES_PER_BATCH)]
        games_per_batch: usize,
        #[arg(long, default_value_t = DEFAULT_STORE_BATCH_SIZE)]
        store_batch: usize,
    },
    /// Compact a write store into a read store.
    Compact {
        /// Write store directory to read.
        #[arg(long = "in", value_name = "DIR")]
        input: PathBuf,
        /// Read store directory to create.
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        /// Verify every n-th entry after copying (0 = skip verification).
        #[arg(long, default_value_t = 0)]
        verify: u64,
    },
    /// Print counts and approximate size of a read store.
    Stats {
        /// Read store directory.
        store: PathBuf,
        /// Also recompute the body checksum.
        #[arg(long)]
        verify: bool,
    },
    /// Query a read store for a position and print the JSON reply.
    Query {
        /// Read store directory.
        store: PathBuf,
        /// FEN (or EPD) of the position.
        fen: String,
        #[arg(long, default_value_t = DEFAULT_QUERY_LIMIT)]
        limit: usize,
        /// Opening names TSV (eco, name, epd).
        #[arg(long, value_name = "FILE")]
        openings: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::new().filter_or("BOOKMILL_LOG", "info").write_style("BOOKMILL_LOG_STYLE"),
    )
    .format_timestamp(None)
    .format_module_path(false)
    .format_target(false)
    .init();

    let cli = Cli::parse();
    if let Some(dir) = &cli.cwd {
        if let Err(err) = std::env::set_current_dir(dir) {
            eprintln!("{} cannot enter {}: {err}", "error:".red().bold(), dir.display());
            return ExitCode::from(EXIT_IO);
        }
    }
    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(classify(&err))
        }
    }
}

/// 1 for I/O faults, 2 for invalid input (malformed archives, corrupt or
/// foreign store directories, bad flags).
fn classify(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            return match store_err {
                StoreError::Io(_) => EXIT_IO,
                StoreError::Corrupt(_) => EXIT_INVALID,
            };
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return EXIT_IO;
        }
    }
    EXIT_INVALID
}

fn run(command: Command) -> Res<ExitCode> {
    match command {
        Command::Index {
            pgn,
            out,
            min_rating,
            min_year,
            time_controls,
            max_plies,
            workers,
            games_per_batch,
            store_batch,
        } => {
            let config = IndexerConfig {
                filter: GameFilter {
                    min_rating,
                    min_year,
                    time_controls: (!time_controls.is_empty()).then_some(time_controls),
                },
                max_plies_per_game: max_plies,
                worker_count: workers,
                games_per_batch,
                store_batch_size: store_batch,
                ..IndexerConfig::default()
            };
            let mut store = LogStore::open(&out, LogStoreOptions::default())
                .with_context(|| format!("opening write store {}", out.display()))?;
            let cancel = CancelFlag::new();
            let stats = index_file(&pgn, &mut store, &config, &cancel, |progress| {
                log::info!(
                    "indexed {} games ({} skipped), {} position updates",
                    progress.games_processed,
                    progress.games_skipped,
                    progress.positions_indexed,
                );
            })?;
            store.close().with_context(|| format!("closing write store {}", out.display()))?;
            println!(
                "{} games in {:.1}s ({:.0} games/s, {} workers), {} skipped, {} position updates",
                stats.games_processed,
                stats.elapsed_ms as f64 / 1000.0,
                stats.games_per_second,
                stats.workers_used,
                stats.games_skipped,
                stats.positions_indexed,
            );
            if stats.cancelled {
                println!("cancelled; partial results were flushed");
                return Ok(ExitCode::from(EXIT_CANCELLED));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Compact { input, out, verify } => {
            let store = LogStore::open(&input, LogStoreOptions::default())
                .with_context(|| format!("opening write store {}", input.display()))?;
            let report = compact(&store, &out, CompactOptions { verify_sample: verify })?;
            println!(
                "{} positions, {} moves in {:.1?} ({} verified, {} mismatches)",
                report.positions_written,
                report.moves_written,
                report.elapsed,
                report.samples_checked,
                report.mismatches,
            );
            if report.mismatches > 0 {
                anyhow::bail!("compaction verification found {} mismatches", report.mismatches);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats { store, verify } => {
            let mapped = MappedStore::open(&store)
                .with_context(|| format!("opening read store {}", store.display()))?;
            let summary = mapped.stats()?;
            println!(
                "{} positions, {} moves, {}",
                summary.position_count,
                summary.move_count,
                human_bytes(summary.size_bytes),
            );
            if verify {
                mapped.verify_checksum()?;
                println!("checksum ok");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Query { store, fen, limit, openings } => {
            let mapped = MappedStore::open(&store)
                .with_context(|| format!("opening read store {}", store.display()))?;
            let openings = openings.map(Openings::load_tsv).transpose()?;
            let mut explorer = Explorer::new(&mapped);
            if let Some(openings) = &openings {
                explorer = explorer.with_openings(openings);
            }
            let reply = explorer.query(&fen, &QueryOptions { limit })?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
