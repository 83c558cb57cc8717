use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::available_parallelism;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, bounded};
use threadpool::ThreadPool;

use crate::model::PositionUpdate;
use crate::pgn::{DEFAULT_PROGRESS_EVERY, GameFilter, ParsedGame, PgnStream};
use crate::replay::{DEFAULT_MAX_PLIES, replay};
use crate::store::WriteStore;
use crate::util::Res;

pub const DEFAULT_GAMES_PER_BATCH: usize = 500;
pub const DEFAULT_STORE_BATCH_SIZE: usize = 10_000;

/// One fewer than the machine so the coordinator keeps a core for parsing
/// and store writes.
#[must_use]
pub fn default_worker_count() -> usize {
    available_parallelism().map_or(1, |n| n.get().saturating_sub(1).max(1))
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub filter: GameFilter,
    pub max_plies_per_game: usize,
    /// 0 runs batches inline on the coordinator thread.
    pub worker_count: usize,
    pub games_per_batch: usize,
    pub store_batch_size: usize,
    /// How often the PGN streamer reports running counts.
    pub progress_every: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            filter: GameFilter::default(),
            max_plies_per_game: DEFAULT_MAX_PLIES,
            worker_count: default_worker_count(),
            games_per_batch: DEFAULT_GAMES_PER_BATCH,
            store_batch_size: DEFAULT_STORE_BATCH_SIZE,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

/// Shared cancellation signal. Setting it makes the coordinator stop pulling
/// games, await in-flight batches, persist what was collected, and return
/// partial stats.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Snapshot handed to the progress callback on every store write.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexingProgress {
    pub games_processed: u64,
    pub games_skipped: u64,
    pub positions_indexed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct IndexingStats {
    pub games_processed: u64,
    pub games_skipped: u64,
    /// Position updates applied; the compactor reports distinct key counts.
    pub positions_indexed: u64,
    pub elapsed_ms: u64,
    pub games_per_second: f64,
    pub workers_used: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    updates: Vec<PositionUpdate>,
    processed: u64,
    skipped: u64,
}

/// Replays every game of a batch. A game that produces no updates (zero
/// legal moves, or an immediately illegal one) counts as skipped and never
/// stops the batch.
fn process_batch(batch: &[ParsedGame], max_plies: usize) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for game in batch {
        let updates = replay(game, max_plies);
        if updates.is_empty() {
            outcome.skipped += 1;
        } else {
            outcome.processed += 1;
            outcome.updates.extend(updates);
        }
    }
    outcome
}

/// Fixed pool of stateless workers. `submit` hands a batch to a free worker
/// and returns a handle resolving to the batch outcome; handles may resolve
/// out of submission order. With no pool (`worker_count == 0`, or when
/// worker threads are unavailable) batches run inline with byte-identical
/// results.
pub struct WorkerPool {
    pool: Option<ThreadPool>,
    workers: usize,
    max_plies: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(worker_count: usize, max_plies: usize) -> WorkerPool {
        let pool = (worker_count > 0).then(|| ThreadPool::new(worker_count));
        WorkerPool { pool, workers: worker_count.max(1), max_plies }
    }

    /// Effective parallelism, 1 in inline mode.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn submit(&self, batch: Vec<ParsedGame>) -> BatchHandle {
        let games = batch.len() as u64;
        let (tx, rx) = bounded(1);
        match &self.pool {
            Some(pool) => {
                let max_plies = self.max_plies;
                pool.execute(move || {
                    let _ = tx.send(process_batch(&batch, max_plies));
                });
            }
            None => {
                let _ = tx.send(process_batch(&batch, self.max_plies));
            }
        }
        BatchHandle { rx, games }
    }
}

/// Pending result of one submitted batch.
pub struct BatchHandle {
    rx: Receiver<BatchOutcome>,
    games: u64,
}

impl BatchHandle {
    /// Blocks until the batch is done. If the worker died, the batch is
    /// lost; its game count is reported so the caller can account for it.
    fn wait(self) -> Result<BatchOutcome, u64> {
        self.rx.recv().map_err(|_| self.games)
    }
}

/// Streams `pgn_path` through the worker pool into `store`, per the
/// configured batch sizes. The coordinator is the only thread touching the
/// store; outstanding batches are bounded at twice the worker count so
/// neither side can run away from the other.
pub fn index_file(
    pgn_path: impl AsRef<Path>,
    store: &mut impl WriteStore,
    config: &IndexerConfig,
    cancel: &CancelFlag,
    mut on_progress: impl FnMut(&IndexingProgress),
) -> Res<IndexingStats> {
    let started = Instant::now();
    let mut stream = PgnStream::open(&pgn_path, config.filter.clone())?
        .with_progress(config.progress_every, |parsed, skipped| {
            log::info!("streamed {parsed} games ({skipped} skipped)");
        });
    let pool = WorkerPool::new(config.worker_count, config.max_plies_per_game);
    let max_outstanding = 2 * pool.workers();

    let mut stats = IndexingStats { workers_used: pool.workers(), ..IndexingStats::default() };
    let mut pending: VecDeque<BatchHandle> = VecDeque::with_capacity(max_outstanding);
    let mut game_buffer: Vec<ParsedGame> = Vec::with_capacity(config.games_per_batch);
    let mut update_buffer: Vec<PositionUpdate> = Vec::with_capacity(config.store_batch_size);

    let mut drain_one = |pending: &mut VecDeque<BatchHandle>,
                         stats: &mut IndexingStats,
                         update_buffer: &mut Vec<PositionUpdate>| {
        let Some(handle) = pending.pop_front() else {
            return;
        };
        match handle.wait() {
            Ok(outcome) => {
                stats.games_processed += outcome.processed;
                stats.games_skipped += outcome.skipped;
                stats.positions_indexed += outcome.updates.len() as u64;
                update_buffer.extend(outcome.updates);
            }
            Err(lost_games) => {
                log::error!("worker lost; dropping a batch of {lost_games} games");
                stats.games_skipped += lost_games;
            }
        }
    };

    let mut write_updates = |store: &mut dyn WriteStore,
                             stats: &IndexingStats,
                             update_buffer: &mut Vec<PositionUpdate>,
                             on_progress: &mut dyn FnMut(&IndexingProgress)|
     -> Res<()> {
        if update_buffer.is_empty() {
            return Ok(());
        }
        if let Err(err) = store.batch_write(update_buffer) {
            // Keep what already made it to disk.
            let _ = store.flush();
            return Err(anyhow!(err).context("writing update batch"));
        }
        update_buffer.clear();
        on_progress(&IndexingProgress {
            games_processed: stats.games_processed,
            games_skipped: stats.games_skipped,
            positions_indexed: stats.positions_indexed,
            elapsed: started.elapsed(),
        });
        Ok(())
    };

    loop {
        if cancel.is_cancelled() {
            stats.cancelled = true;
            break;
        }
        match stream.next_game() {
            Some(Ok(game)) => {
                game_buffer.push(game);
                if game_buffer.len() >= config.games_per_batch {
                    pending.push_back(pool.submit(std::mem::take(&mut game_buffer)));
                    if pending.len() >= max_outstanding {
                        drain_one(&mut pending, &mut stats, &mut update_buffer);
                    }
                    if update_buffer.len() >= config.store_batch_size {
                        write_updates(store, &stats, &mut update_buffer, &mut on_progress)?;
                    }
                }
            }
            Some(Err(err)) => {
                let _ = store.flush();
                return Err(err.context("reading PGN stream"));
            }
            None => break,
        }
    }

    // End of input (or cancellation): ship the tail batch, await everything
    // in flight, persist the remainder.
    if !game_buffer.is_empty() && !stats.cancelled {
        pending.push_back(pool.submit(std::mem::take(&mut game_buffer)));
    }
    while !pending.is_empty() {
        drain_one(&mut pending, &mut stats, &mut update_buffer);
    }
    write_updates(store, &stats, &mut update_buffer, &mut on_progress)?;
    store.flush().map_err(|err| anyhow!(err).context("final store flush"))?;

    let (_, stream_skipped) = stream.counts();
    stats.games_skipped += stream_skipped;
    let elapsed = started.elapsed();
    stats.elapsed_ms = elapsed.as_millis() as u64;
    stats.games_per_second = if elapsed.as_secs_f64() > 0.0 {
        stats.games_processed as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    Ok(stats)
}
