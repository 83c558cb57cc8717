//! [`bookmill`](crate) builds offline opening-explorer databases from PGN archives.
//! It streams games from disk, replays them into 64-bit position hashes, aggregates
//! win/draw/loss and per-move statistics in a write-optimized log-structured store,
//! compacts that store into a memory-mapped read-only tree, and answers position
//! queries in the Lichess opening-explorer response shape.
//!
//! Chess rules (SAN resolution, legal-move application, FEN parsing) are delegated
//! to `shakmaty`; this crate never generates moves itself.

/// Ingestion pipeline: worker pool and coordinator.
pub mod indexer;
/// Stats records, update tuples, and the on-disk key/value codecs.
pub mod model;
/// Opening-name table keyed by EPD.
pub mod openings;
/// Streaming PGN parser with filters and a progress hook.
pub mod pgn;
/// Point queries against a compacted store.
pub mod query;
/// SAN replay producing position updates.
pub mod replay;
/// Storage backends: write-optimized log store, read-optimized mapped store, compactor.
pub mod store;
/// Small helpers shared across modules.
pub mod util;
/// The position hash.
pub mod zobrist;
