use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};

use thiserror::Error;

use crate::model::{
    GameOutcome, MoveStats, PositionStats, PositionUpdate, move_key, move_key_range,
    parse_move_key, position_key,
};
use crate::zobrist::PosHash;

pub mod compact;
pub mod log;
pub mod mapped;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability of the ingestion-side store: absorb updates, answer reads that
/// see pending-but-unflushed writes, persist on demand. The implementor is
/// mutated by exactly one thread.
pub trait WriteStore {
    /// Applies a batch atomically: after return the whole batch is visible
    /// to reads, and durable after a subsequent [`WriteStore::flush`].
    fn batch_write(&mut self, updates: &[PositionUpdate]) -> StoreResult<()>;

    fn increment_position(&mut self, hash: PosHash, outcome: GameOutcome) -> StoreResult<()>;

    fn increment_move(
        &mut self,
        hash: PosHash,
        uci: &str,
        outcome: GameOutcome,
        rating: Option<u32>,
    ) -> StoreResult<()>;

    fn get_position(&mut self, hash: PosHash) -> StoreResult<Option<PositionStats>>;

    /// All moves recorded for a position, sorted by total games descending.
    fn get_moves(&mut self, hash: PosHash) -> StoreResult<Vec<MoveStats>>;

    fn flush(&mut self) -> StoreResult<()>;

    /// Flush and release; the store must not be used afterwards.
    fn close(&mut self) -> StoreResult<()> {
        self.flush()
    }
}

/// Capability of the serving-side store: immutable, shareable reads.
pub trait ReadStore {
    fn get_position(&self, hash: PosHash) -> StoreResult<Option<PositionStats>>;

    /// All moves recorded for a position, sorted by total games descending.
    fn get_moves(&self, hash: PosHash) -> StoreResult<Vec<MoveStats>>;

    fn has_position(&self, hash: PosHash) -> StoreResult<bool> {
        Ok(self.get_position(hash)?.is_some())
    }

    fn stats(&self) -> StoreResult<StoreSummary>;
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct StoreSummary {
    pub position_count: u64,
    pub move_count: u64,
    pub size_bytes: u64,
}

/// A decoded store value; which variant applies is determined by the key
/// prefix. Values are partial aggregates: merging is plain addition, so any
/// subset of sources can be summed in any order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Value {
    Position(PositionStats),
    Move(MoveStats),
}

impl Value {
    pub fn merge(&mut self, other: &Value) {
        match (self, other) {
            (Value::Position(a), Value::Position(b)) => a.merge(b),
            (Value::Move(a), Value::Move(b)) => a.merge(b),
            // Key prefixes make this unreachable; merging across kinds would
            // mean the key codec is broken.
            (a, b) => unreachable!("mismatched value kinds for one key: {a:?} vs {b:?}"),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Position(stats) => stats.encode().to_vec(),
            Value::Move(stats) => stats.encode().to_vec(),
        }
    }

    /// Decodes value bytes according to the key they are stored under.
    pub fn decode(key: &[u8], bytes: &[u8]) -> StoreResult<Value> {
        if key.starts_with(b"p:") {
            PositionStats::decode(bytes).map(Value::Position)
        } else {
            parse_move_key(key).and_then(|(_, uci)| MoveStats::decode(uci, bytes).map(Value::Move))
        }
        .ok_or_else(|| StoreError::Corrupt(format!("undecodable entry for key {key:02x?}")))
    }
}

pub(crate) type Memtable = BTreeMap<Vec<u8>, Value>;

/// Makes a rename inside `dir` durable.
pub(crate) fn sync_dir(dir: &std::path::Path) -> StoreResult<()> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

/// Folds one replay observation into both of its entries: the position
/// counter and the per-move counter.
pub(crate) fn apply_update(map: &mut Memtable, update: &PositionUpdate) {
    let pos_key = position_key(update.hash).to_vec();
    match map.entry(pos_key).or_insert_with(|| Value::Position(PositionStats::default())) {
        Value::Position(stats) => stats.record(update.outcome),
        Value::Move(_) => unreachable!("position key holds a move value"),
    }
    let mv_key = move_key(update.hash, &update.uci).to_vec();
    match map.entry(mv_key).or_insert_with(|| Value::Move(MoveStats::new(update.uci))) {
        Value::Move(stats) => stats.record(update.outcome, update.rating),
        Value::Position(_) => unreachable!("move key holds a position value"),
    }
}

pub(crate) fn sort_moves_descending(moves: &mut Vec<MoveStats>) {
    moves.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.uci.cmp(&b.uci)));
}

/// Purely in-memory store implementing both capabilities. The test double
/// for pipeline and query tests, and the reference the on-disk backends are
/// checked against.
#[derive(Debug, Default)]
pub struct MemStore {
    map: Memtable,
}

impl MemStore {
    #[must_use]
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.map.iter().map(|(key, value)| (key.as_slice(), value))
    }

    fn position(&self, hash: PosHash) -> Option<PositionStats> {
        match self.map.get(position_key(hash).as_slice()) {
            Some(Value::Position(stats)) => Some(*stats),
            _ => None,
        }
    }

    fn moves(&self, hash: PosHash) -> Vec<MoveStats> {
        let (start, end) = move_key_range(hash);
        let mut moves: Vec<MoveStats> = self
            .map
            .range::<[u8], _>((Included(start.as_slice()), Excluded(end.as_slice())))
            .filter_map(|(_, value)| match value {
                Value::Move(stats) => Some(stats.clone()),
                Value::Position(_) => None,
            })
            .collect();
        sort_moves_descending(&mut moves);
        moves
    }
}

impl WriteStore for MemStore {
    fn batch_write(&mut self, updates: &[PositionUpdate]) -> StoreResult<()> {
        for update in updates {
            apply_update(&mut self.map, update);
        }
        Ok(())
    }

    fn increment_position(&mut self, hash: PosHash, outcome: GameOutcome) -> StoreResult<()> {
        let key = position_key(hash).to_vec();
        match self.map.entry(key).or_insert_with(|| Value::Position(PositionStats::default())) {
            Value::Position(stats) => stats.record(outcome),
            Value::Move(_) => unreachable!("position key holds a move value"),
        }
        Ok(())
    }

    fn increment_move(
        &mut self,
        hash: PosHash,
        uci: &str,
        outcome: GameOutcome,
        rating: Option<u32>,
    ) -> StoreResult<()> {
        let uci = crate::model::UciString::from(uci)
            .map_err(|_| StoreError::Corrupt(format!("UCI move too long: {uci}")))?;
        let key = move_key(hash, &uci).to_vec();
        match self.map.entry(key).or_insert_with(|| Value::Move(MoveStats::new(uci))) {
            Value::Move(stats) => stats.record(outcome, rating),
            Value::Position(_) => unreachable!("move key holds a position value"),
        }
        Ok(())
    }

    fn get_position(&mut self, hash: PosHash) -> StoreResult<Option<PositionStats>> {
        Ok(self.position(hash))
    }

    fn get_moves(&mut self, hash: PosHash) -> StoreResult<Vec<MoveStats>> {
        Ok(self.moves(hash))
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

impl ReadStore for MemStore {
    fn get_position(&self, hash: PosHash) -> StoreResult<Option<PositionStats>> {
        Ok(self.position(hash))
    }

    fn get_moves(&self, hash: PosHash) -> StoreResult<Vec<MoveStats>> {
        Ok(self.moves(hash))
    }

    fn stats(&self) -> StoreResult<StoreSummary> {
        let mut summary = StoreSummary::default();
        for (key, value) in &self.map {
            match value {
                Value::Position(_) => summary.position_count += 1,
                Value::Move(_) => summary.move_count += 1,
            }
            summary.size_bytes += (key.len() + value.encode().len()) as u64;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UciString;

    fn update(hash: u64, uci: &str, outcome: GameOutcome, rating: Option<u32>) -> PositionUpdate {
        PositionUpdate {
            hash: PosHash(hash),
            uci: UciString::from(uci).unwrap(),
            outcome,
            rating,
        }
    }

    #[test]
    fn batch_write_aggregates_positions_and_moves() {
        let mut store = MemStore::new();
        store
            .batch_write(&[
                update(1, "e2e4", GameOutcome::WhiteWins, Some(2000)),
                update(1, "e2e4", GameOutcome::Draw, None),
                update(1, "d2d4", GameOutcome::BlackWins, Some(1800)),
                update(2, "g8f6", GameOutcome::WhiteWins, None),
            ])
            .unwrap();
        let pos = WriteStore::get_position(&mut store, PosHash(1)).unwrap().unwrap();
        assert_eq!((pos.white, pos.draws, pos.black), (1, 1, 1));
        let moves = WriteStore::get_moves(&mut store, PosHash(1)).unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].uci.as_str(), "e2e4");
        assert_eq!(moves[0].games, 2);
        assert_eq!(moves[0].rating_sum, 2000);
        assert_eq!(moves[1].uci.as_str(), "d2d4");
        assert!(ReadStore::has_position(&store, PosHash(2)).unwrap());
        assert!(!ReadStore::has_position(&store, PosHash(3)).unwrap());
    }

    #[test]
    fn per_position_game_counts_balance() {
        let mut store = MemStore::new();
        let updates: Vec<_> = (0..10)
            .map(|i| {
                update(
                    7,
                    if i % 2 == 0 { "e2e4" } else { "d2d4" },
                    if i % 3 == 0 { GameOutcome::Draw } else { GameOutcome::WhiteWins },
                    None,
                )
            })
            .collect();
        store.batch_write(&updates).unwrap();
        let pos = ReadStore::get_position(&store, PosHash(7)).unwrap().unwrap();
        let move_games: u64 =
            ReadStore::get_moves(&store, PosHash(7)).unwrap().iter().map(|m| u64::from(m.games)).sum();
        assert_eq!(pos.total(), move_games);
    }

    #[test]
    fn increments_match_batch_semantics() {
        let mut via_batch = MemStore::new();
        via_batch.batch_write(&[update(5, "e2e4", GameOutcome::Draw, Some(1500))]).unwrap();
        let mut via_increments = MemStore::new();
        via_increments.increment_position(PosHash(5), GameOutcome::Draw).unwrap();
        via_increments
            .increment_move(PosHash(5), "e2e4", GameOutcome::Draw, Some(1500))
            .unwrap();
        assert_eq!(
            ReadStore::get_position(&via_batch, PosHash(5)).unwrap(),
            ReadStore::get_position(&via_increments, PosHash(5)).unwrap()
        );
        assert_eq!(
            ReadStore::get_moves(&via_batch, PosHash(5)).unwrap(),
            ReadStore::get_moves(&via_increments, PosHash(5)).unwrap()
        );
    }

    #[test]
    fn stats_counts_entries() {
        let mut store = MemStore::new();
        store
            .batch_write(&[
                update(1, "e2e4", GameOutcome::WhiteWins, None),
                update(2, "d2d4", GameOutcome::Draw, None),
            ])
            .unwrap();
        let summary = store.stats().unwrap();
        assert_eq!(summary.position_count, 2);
        assert_eq!(summary.move_count, 2);
        assert!(summary.size_bytes > 0);
    }
}
