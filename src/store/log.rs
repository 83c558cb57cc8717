use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::model::{
    GameOutcome, MoveStats, PositionStats, PositionUpdate, UciString, move_key, move_key_range,
    position_key,
};
use crate::store::{
    Memtable, StoreError, StoreResult, Value, WriteStore, apply_update, sort_moves_descending,
    sync_dir,
};
use crate::zobrist::PosHash;

const RUN_MAGIC: u64 = 0x424b_4d4c_5255_4e31;
const RUN_HEADER_LEN: u64 = 16;
/// Every n-th record key is kept in memory so point reads seek close to
/// their target and scan at most n records.
const INDEX_EVERY: u64 = 64;

pub const DEFAULT_MEMTABLE_LIMIT: usize = 1 << 20;
pub const DEFAULT_MAX_RUNS: usize = 8;

#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    /// Memtable entries accumulated before spilling a run to disk.
    pub memtable_limit: usize,
    /// Run count above which all runs are merge-compacted into one.
    pub max_runs: usize,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        LogStoreOptions { memtable_limit: DEFAULT_MEMTABLE_LIMIT, max_runs: DEFAULT_MAX_RUNS }
    }
}

/// Write-optimized store: an in-memory memtable in front of sorted on-disk
/// runs, all holding *partial* aggregates. A read sums every source that
/// knows the key, so pending-but-unflushed writes are always visible and
/// read-modify-write never touches disk on the write path.
///
/// Single-writer by construction (`&mut self` everywhere); the directory
/// layout survives restarts.
#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    options: LogStoreOptions,
    memtable: Memtable,
    runs: Vec<Run>,
    next_run_id: u64,
}

impl LogStore {
    pub fn open(dir: impl AsRef<Path>, options: LogStoreOptions) -> StoreResult<LogStore> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut runs = vec![];
        let mut next_run_id = 1;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                // A leftover temp file means a flush died mid-write; the
                // memtable it mirrored was never dropped, so it is garbage.
                Some("tmp") => fs::remove_file(&path)?,
                Some("run") => {
                    let run = Run::open(path)?;
                    next_run_id = next_run_id.max(run.id + 1);
                    runs.push(run);
                }
                _ => {}
            }
        }
        runs.sort_by_key(|run| run.id);
        Ok(LogStore { dir, options, memtable: Memtable::new(), runs, next_run_id })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Aggregated key-ordered view over the memtable and every run. The
    /// compactor consumes this; tests compare it against the in-memory
    /// reference store.
    pub fn scan(&self) -> StoreResult<MergeIter<'_>> {
        let mut sources: Vec<EntrySource<'_>> = Vec::with_capacity(self.runs.len() + 1);
        for run in &self.runs {
            sources.push(Box::new(run.cursor()?));
        }
        sources
            .push(Box::new(self.memtable.iter().map(|(key, value)| Ok((key.clone(), value.encode())))));
        MergeIter::new(sources)
    }

    fn flush_memtable(&mut self) -> StoreResult<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        let id = self.next_run_id;
        let entries = self.memtable.iter().map(|(key, value)| Ok((key.clone(), value.encode())));
        let run = write_run(&self.dir, id, entries)?;
        self.next_run_id += 1;
        self.runs.push(run);
        self.memtable.clear();
        if self.runs.len() > self.options.max_runs {
            self.merge_runs()?;
        }
        Ok(())
    }

    /// Merge-compacts every run into a single summed run. Old files are
    /// removed only after the replacement is durable.
    fn merge_runs(&mut self) -> StoreResult<()> {
        let id = self.next_run_id;
        let merged = {
            let mut sources: Vec<EntrySource<'_>> = Vec::with_capacity(self.runs.len());
            for run in &self.runs {
                sources.push(Box::new(run.cursor()?));
            }
            write_run(&self.dir, id, MergeIter::new(sources)?)?
        };
        self.next_run_id += 1;
        for run in self.runs.drain(..) {
            fs::remove_file(&run.path)?;
        }
        self.runs.push(merged);
        Ok(())
    }

    fn lookup_position(&self, hash: PosHash) -> StoreResult<Option<PositionStats>> {
        let key = position_key(hash);
        let mut acc: Option<PositionStats> = None;
        let mut add = |stats: &PositionStats| match &mut acc {
            Some(total) => total.merge(stats),
            None => acc = Some(*stats),
        };
        if let Some(Value::Position(stats)) = self.memtable.get(key.as_slice()) {
            add(stats);
        }
        for run in &self.runs {
            if let Some(Value::Position(stats)) = run.get(&key)? {
                add(&stats);
            }
        }
        Ok(acc)
    }

    fn lookup_moves(&self, hash: PosHash) -> StoreResult<Vec<MoveStats>> {
        let (start, end) = move_key_range(hash);
        let mut merged: Memtable = Memtable::new();
        let mut add = |key: &[u8], value: Value| match merged.get_mut(key) {
            Some(total) => total.merge(&value),
            None => {
                let _ = merged.insert(key.to_vec(), value);
            }
        };
        for (key, value) in self
            .memtable
            .range::<[u8], _>((
                std::ops::Bound::Included(start.as_slice()),
                std::ops::Bound::Excluded(end.as_slice()),
            ))
        {
            add(key, value.clone());
        }
        for run in &self.runs {
            for (key, value) in run.range(&start, &end)? {
                add(&key, value);
            }
        }
        let mut moves: Vec<MoveStats> = merged
            .into_values()
            .filter_map(|value| match value {
                Value::Move(stats) => Some(stats),
                Value::Position(_) => None,
            })
            .collect();
        sort_moves_descending(&mut moves);
        Ok(moves)
    }
}

impl WriteStore for LogStore {
    fn batch_write(&mut self, updates: &[PositionUpdate]) -> StoreResult<()> {
        // The whole batch lands in the memtable before any spill, so readers
        // never observe a partially applied batch.
        for update in updates {
            apply_update(&mut self.memtable, update);
        }
        if self.memtable.len() >= self.options.memtable_limit {
            self.flush_memtable()?;
        }
        Ok(())
    }

    fn increment_position(&mut self, hash: PosHash, outcome: GameOutcome) -> StoreResult<()> {
        let key = position_key(hash).to_vec();
        match self.memtable.entry(key).or_insert_with(|| Value::Position(PositionStats::default()))
        {
            Value::Position(stats) => stats.record(outcome),
            Value::Move(_) => unreachable!("position key holds a move value"),
        }
        if self.memtable.len() >= self.options.memtable_limit {
            self.flush_memtable()?;
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
        let uci = UciString::from(uci)
            .map_err(|_| StoreError::Corrupt(format!("UCI move too long: {uci}")))?;
        let key = move_key(hash, &uci).to_vec();
        match self.memtable.entry(key).or_insert_with(|| Value::Move(MoveStats::new(uci))) {
            Value::Move(stats) => stats.record(outcome, rating),
            Value::Position(_) => unreachable!("move key holds a position value"),
        }
        if self.memtable.len() >= self.options.memtable_limit {
            self.flush_memtable()?;
        }
        Ok(())
    }

    fn get_position(&mut self, hash: PosHash) -> StoreResult<Option<PositionStats>> {
        self.lookup_position(hash)
    }

    fn get_moves(&mut self, hash: PosHash) -> StoreResult<Vec<MoveStats>> {
        self.lookup_moves(hash)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.flush_memtable()
    }
}

#[derive(Debug)]
struct Run {
    id: u64,
    path: PathBuf,
    entry_count: u64,
    /// `(key, file offset)` of every [`INDEX_EVERY`]-th record.
    index: Vec<(Vec<u8>, u64)>,
}

impl Run {
    fn open(path: PathBuf) -> StoreResult<Run> {
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix("run-"))
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| StoreError::Corrupt(format!("unexpected run name {}", path.display())))?;
        let mut reader = BufReader::new(File::open(&path)?);
        if reader.read_u64::<LittleEndian>()? != RUN_MAGIC {
            return Err(StoreError::Corrupt(format!("bad run magic in {}", path.display())));
        }
        let entry_count = reader.read_u64::<LittleEndian>()?;
        let mut index = vec![];
        let mut offset = RUN_HEADER_LEN;
        let mut last_key: Option<Vec<u8>> = None;
        for i in 0..entry_count {
            let (key, value) = read_record(&mut reader)?
                .ok_or_else(|| StoreError::Corrupt(format!("truncated run {}", path.display())))?;
            if last_key.as_ref().is_some_and(|last| last.as_slice() >= key.as_slice()) {
                return Err(StoreError::Corrupt(format!("unsorted run {}", path.display())));
            }
            if i % INDEX_EVERY == 0 {
                index.push((key.clone(), offset));
            }
            offset += record_len(&key, &value);
            last_key = Some(key);
        }
        Ok(Run { id, path, entry_count, index })
    }

    fn cursor(&self) -> StoreResult<RunCursor> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let _ = reader.seek(SeekFrom::Start(RUN_HEADER_LEN))?;
        Ok(RunCursor {
            reader,
            remaining: self.entry_count,
            last_key: None,
            path: self.path.clone(),
        })
    }

    fn cursor_at(&self, slot: usize) -> StoreResult<RunCursor> {
        let (_, offset) = self.index[slot];
        let mut reader = BufReader::new(File::open(&self.path)?);
        let _ = reader.seek(SeekFrom::Start(offset))?;
        Ok(RunCursor {
            reader,
            remaining: self.entry_count - slot as u64 * INDEX_EVERY,
            last_key: None,
            path: self.path.clone(),
        })
    }

    /// Greatest index slot whose key is at or before `key`, if any.
    fn seek_slot(&self, key: &[u8]) -> Option<usize> {
        self.index.partition_point(|(indexed, _)| indexed.as_slice() <= key).checked_sub(1)
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Value>> {
        let Some(slot) = self.seek_slot(key) else {
            return Ok(None);
        };
        let cursor = self.cursor_at(slot)?;
        // The next indexed key is greater than the target, so it lies within
        // the next INDEX_EVERY records or not in this run at all.
        for entry in cursor.take(INDEX_EVERY as usize) {
            let (candidate, value) = entry?;
            match candidate.as_slice().cmp(key) {
                Ordering::Less => continue,
                Ordering::Equal => return Value::decode(key, &value).map(Some),
                Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Entries with `start <= key < end`.
    fn range(&self, start: &[u8], end: &[u8]) -> StoreResult<Vec<(Vec<u8>, Value)>> {
        if self.index.is_empty() {
            return Ok(vec![]);
        }
        let slot = self.seek_slot(start).unwrap_or(0);
        let mut out = vec![];
        for entry in self.cursor_at(slot)? {
            let (key, value) = entry?;
            if key.as_slice() < start {
                continue;
            }
            if key.as_slice() >= end {
                break;
            }
            let value = Value::decode(&key, &value)?;
            out.push((key, value));
        }
        Ok(out)
    }
}

struct RunCursor {
    reader: BufReader<File>,
    remaining: u64,
    last_key: Option<Vec<u8>>,
    path: PathBuf,
}

impl Iterator for RunCursor {
    type Item = StoreResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match read_record(&mut self.reader) {
            Ok(Some((key, value))) => {
                if self.last_key.as_ref().is_some_and(|last| last.as_slice() >= key.as_slice()) {
                    self.remaining = 0;
                    return Some(Err(StoreError::Corrupt(format!(
                        "key order violation in {}",
                        self.path.display()
                    ))));
                }
                self.last_key = Some(key.clone());
                Some(Ok((key, value)))
            }
            Ok(None) => {
                self.remaining = 0;
                Some(Err(StoreError::Corrupt(format!("truncated run {}", self.path.display()))))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

fn record_len(key: &[u8], value: &[u8]) -> u64 {
    2 + key.len() as u64 + 2 + value.len() as u64
}

fn read_record(reader: &mut impl Read) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
    let key_len = match reader.read_u16::<LittleEndian>() {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut key = vec![0; usize::from(key_len)];
    reader.read_exact(&mut key)?;
    let value_len = reader.read_u16::<LittleEndian>()?;
    let mut value = vec![0; usize::from(value_len)];
    reader.read_exact(&mut value)?;
    Ok(Some((key, value)))
}

/// Writes a sorted entry stream as a run file: temp file, fsync, rename,
/// directory fsync. A failure leaves no partially visible run behind.
fn write_run(
    dir: &Path,
    id: u64,
    entries: impl Iterator<Item = StoreResult<(Vec<u8>, Vec<u8>)>>,
) -> StoreResult<Run> {
    let final_path = dir.join(format!("run-{id:06}.run"));
    let tmp_path = dir.join(format!("run-{id:06}.tmp"));
    let result = write_run_inner(dir, id, &final_path, &tmp_path, entries);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_run_inner(
    dir: &Path,
    id: u64,
    final_path: &Path,
    tmp_path: &Path,
    entries: impl Iterator<Item = StoreResult<(Vec<u8>, Vec<u8>)>>,
) -> StoreResult<Run> {
    let mut writer = BufWriter::new(File::create(tmp_path)?);
    writer.write_u64::<LittleEndian>(RUN_MAGIC)?;
    writer.write_u64::<LittleEndian>(0)?;
    let mut index = vec![];
    let mut entry_count: u64 = 0;
    let mut offset = RUN_HEADER_LEN;
    for entry in entries {
        let (key, value) = entry?;
        if entry_count % INDEX_EVERY == 0 {
            index.push((key.clone(), offset));
        }
        writer.write_u16::<LittleEndian>(key.len() as u16)?;
        writer.write_all(&key)?;
        writer.write_u16::<LittleEndian>(value.len() as u16)?;
        writer.write_all(&value)?;
        offset += record_len(&key, &value);
        entry_count += 1;
    }
    let mut file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    let _ = file.seek(SeekFrom::Start(8))?;
    file.write_u64::<LittleEndian>(entry_count)?;
    file.sync_all()?;
    fs::rename(tmp_path, final_path)?;
    sync_dir(dir)?;
    Ok(Run { id, path: final_path.to_path_buf(), entry_count, index })
}

type EntrySource<'a> = Box<dyn Iterator<Item = StoreResult<(Vec<u8>, Vec<u8>)>> + 'a>;

/// K-way merge over sorted entry sources, summing values that share a key.
/// Each source must be strictly ascending; the output is too.
pub struct MergeIter<'a> {
    sources: Vec<EntrySource<'a>>,
    heads: Vec<Option<(Vec<u8>, Vec<u8>)>>,
    done: bool,
}

impl<'a> MergeIter<'a> {
    fn new(sources: Vec<EntrySource<'a>>) -> StoreResult<MergeIter<'a>> {
        let mut merge = MergeIter { heads: vec![None; sources.len()], sources, done: false };
        for i in 0..merge.sources.len() {
            merge.advance(i)?;
        }
        Ok(merge)
    }

    fn advance(&mut self, i: usize) -> StoreResult<()> {
        self.heads[i] = self.sources[i].next().transpose()?;
        Ok(())
    }

    fn next_merged(&mut self) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(min_key) = self.heads.iter().flatten().map(|(key, _)| key).min().cloned() else {
            return Ok(None);
        };
        let mut acc: Option<Value> = None;
        for i in 0..self.heads.len() {
            if self.heads[i].as_ref().is_some_and(|(key, _)| *key == min_key) {
                let (key, value) = self.heads[i].take().unwrap_or_default();
                let value = Value::decode(&key, &value)?;
                match &mut acc {
                    Some(total) => total.merge(&value),
                    None => acc = Some(value),
                }
                self.advance(i)?;
            }
        }
        let acc = acc.ok_or_else(|| StoreError::Corrupt("empty merge head".to_owned()))?;
        Ok(Some((min_key, acc.encode())))
    }
}

impl Iterator for MergeIter<'_> {
    type Item = StoreResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_merged() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
