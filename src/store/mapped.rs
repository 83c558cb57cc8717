use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::model::{
    MAX_MOVE_KEY_LEN, MOVE_VALUE_LEN, MoveStats, PositionStats, move_key_range, parse_move_key,
    position_key,
};
use crate::store::{ReadStore, StoreError, StoreResult, StoreSummary, sort_moves_descending, sync_dir};
use crate::util::{FNV1A64_INIT, fnv1a64_update};
use crate::zobrist::PosHash;

pub const STORE_FILE: &str = "index.btree";

const MAGIC: u64 = 0x424b_4d4c_4d41_5031;
const VERSION: u32 = 1;
const PAGE_SIZE: usize = 4096;
const HEADER_LEN: usize = 56;

// Fixed-width slots: keys padded to 16 bytes, values to 24, so lookups are
// binary searches over the mapping with no per-query allocation. Leaves are
// written back to back, so a range scan continues on the next page; no
// sibling pointers are stored.
const LEAF_HEADER: usize = 2;
const LEAF_SLOT: usize = 1 + MAX_MOVE_KEY_LEN + 1 + MOVE_VALUE_LEN;
const LEAF_CAP: usize = (PAGE_SIZE - LEAF_HEADER) / LEAF_SLOT;
const INNER_HEADER: usize = 2;
const INNER_SLOT: usize = 4 + 1 + MAX_MOVE_KEY_LEN;
const INNER_CAP: usize = (PAGE_SIZE - INNER_HEADER) / INNER_SLOT;

#[derive(Debug, Clone, Copy, Default)]
struct Header {
    total_pages: u32,
    root_page: u32,
    leaf_first: u32,
    leaf_count: u32,
    position_count: u64,
    move_count: u64,
    checksum: u64,
}

impl Header {
    fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], VERSION);
        LittleEndian::write_u32(&mut buf[12..16], PAGE_SIZE as u32);
        LittleEndian::write_u32(&mut buf[16..20], self.total_pages);
        LittleEndian::write_u32(&mut buf[20..24], self.root_page);
        LittleEndian::write_u32(&mut buf[24..28], self.leaf_first);
        LittleEndian::write_u32(&mut buf[28..32], self.leaf_count);
        LittleEndian::write_u64(&mut buf[32..40], self.position_count);
        LittleEndian::write_u64(&mut buf[40..48], self.move_count);
        LittleEndian::write_u64(&mut buf[48..56], self.checksum);
    }

    fn read(buf: &[u8], path: &Path) -> StoreResult<Header> {
        if buf.len() < HEADER_LEN || LittleEndian::read_u64(&buf[0..8]) != MAGIC {
            return Err(StoreError::Corrupt(format!("{} is not a mapped store", path.display())));
        }
        if LittleEndian::read_u32(&buf[8..12]) != VERSION
            || LittleEndian::read_u32(&buf[12..16]) != PAGE_SIZE as u32
        {
            return Err(StoreError::Corrupt(format!(
                "unsupported mapped store version in {}",
                path.display()
            )));
        }
        Ok(Header {
            total_pages: LittleEndian::read_u32(&buf[16..20]),
            root_page: LittleEndian::read_u32(&buf[20..24]),
            leaf_first: LittleEndian::read_u32(&buf[24..28]),
            leaf_count: LittleEndian::read_u32(&buf[28..32]),
            position_count: LittleEndian::read_u64(&buf[32..40]),
            move_count: LittleEndian::read_u64(&buf[40..48]),
            checksum: LittleEndian::read_u64(&buf[48..56]),
        })
    }
}

/// Read-only page tree over a memory mapping. Any number of threads may
/// query concurrently; there is no interior mutability and no lock. Opened
/// only on stores produced by [`MappedStoreBuilder`], which no writer
/// touches afterwards.
pub struct MappedStore {
    mmap: Mmap,
    header: Header,
    path: PathBuf,
}

impl MappedStore {
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<MappedStore> {
        let path = dir.as_ref().join(STORE_FILE);
        let file = File::open(&path)?;
        // SAFETY: the mapping is private and read-only, and the store file is
        // created once by the compactor and never modified while served.
        let mmap = unsafe { Mmap::map(&file)? };
        let header = Header::read(&mmap, &path)?;
        if mmap.len() < header.total_pages as usize * PAGE_SIZE {
            return Err(StoreError::Corrupt(format!("{} is truncated", path.display())));
        }
        Ok(MappedStore { mmap, header, path })
    }

    fn page(&self, page_no: u32) -> StoreResult<&[u8]> {
        if page_no == 0 || page_no >= self.header.total_pages {
            return Err(StoreError::Corrupt(format!(
                "page {page_no} out of bounds in {}",
                self.path.display()
            )));
        }
        let start = page_no as usize * PAGE_SIZE;
        Ok(&self.mmap[start..start + PAGE_SIZE])
    }

    fn is_leaf(&self, page_no: u32) -> bool {
        page_no >= self.header.leaf_first
            && page_no < self.header.leaf_first + self.header.leaf_count
    }

    fn leaf_key(page: &[u8], slot: usize) -> &[u8] {
        let base = LEAF_HEADER + slot * LEAF_SLOT;
        let key_len = usize::from(page[base]);
        &page[base + 1..base + 1 + key_len.min(MAX_MOVE_KEY_LEN)]
    }

    fn leaf_value(page: &[u8], slot: usize) -> &[u8] {
        let base = LEAF_HEADER + slot * LEAF_SLOT + 1 + MAX_MOVE_KEY_LEN;
        let value_len = usize::from(page[base]);
        &page[base + 1..base + 1 + value_len.min(MOVE_VALUE_LEN)]
    }

    fn inner_key(page: &[u8], slot: usize) -> &[u8] {
        let base = INNER_HEADER + slot * INNER_SLOT;
        let key_len = usize::from(page[base + 4]);
        &page[base + 5..base + 5 + key_len.min(MAX_MOVE_KEY_LEN)]
    }

    fn inner_child(page: &[u8], slot: usize) -> u32 {
        let base = INNER_HEADER + slot * INNER_SLOT;
        LittleEndian::read_u32(&page[base..base + 4])
    }

    /// Descends to the leaf that would contain `key`. `None` on an empty
    /// store.
    fn find_leaf(&self, key: &[u8]) -> StoreResult<Option<u32>> {
        let mut page_no = self.header.root_page;
        if page_no == 0 {
            return Ok(None);
        }
        for _ in 0..32 {
            if self.is_leaf(page_no) {
                return Ok(Some(page_no));
            }
            let page = self.page(page_no)?;
            let count = usize::from(LittleEndian::read_u16(&page[0..2]));
            if count == 0 || count > INNER_CAP {
                return Err(StoreError::Corrupt(format!(
                    "bad inner node {page_no} in {}",
                    self.path.display()
                )));
            }
            // Greatest child whose first key is <= the target; keys below the
            // tree minimum descend to the leftmost child and miss in the leaf.
            let slot = partition(count, |i| Self::inner_key(page, i) <= key).saturating_sub(1);
            page_no = Self::inner_child(page, slot);
        }
        Err(StoreError::Corrupt(format!("cyclic page tree in {}", self.path.display())))
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<&[u8]>> {
        let Some(leaf_no) = self.find_leaf(key)? else {
            return Ok(None);
        };
        let page = self.page(leaf_no)?;
        let count = usize::from(LittleEndian::read_u16(&page[0..2]));
        if count > LEAF_CAP {
            return Err(StoreError::Corrupt(format!(
                "bad leaf {leaf_no} in {}",
                self.path.display()
            )));
        }
        let slot = partition(count, |i| Self::leaf_key(page, i) < key);
        if slot < count && Self::leaf_key(page, slot) == key {
            Ok(Some(Self::leaf_value(page, slot)))
        } else {
            Ok(None)
        }
    }

    /// Walks entries in `[start, end)` across chained leaves.
    fn scan_range(
        &self,
        start: &[u8],
        end: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let Some(mut leaf_no) = self.find_leaf(start)? else {
            return Ok(());
        };
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            let page = self.page(leaf_no)?;
            let count = usize::from(LittleEndian::read_u16(&page[0..2]));
            if count > LEAF_CAP {
                return Err(StoreError::Corrupt(format!(
                    "bad leaf {leaf_no} in {}",
                    self.path.display()
                )));
            }
            let first = partition(count, |i| Self::leaf_key(page, i) < start);
            for slot in first..count {
                let key = Self::leaf_key(page, slot);
                if key >= end {
                    return Ok(());
                }
                if last_key.as_deref().is_some_and(|last| last >= key) {
                    return Err(StoreError::Corrupt(format!(
                        "key order violation in {}",
                        self.path.display()
                    )));
                }
                last_key = Some(key.to_vec());
                visit(key, Self::leaf_value(page, slot))?;
            }
            leaf_no += 1;
            if !self.is_leaf(leaf_no) {
                return Ok(());
            }
        }
    }

    /// Recomputes the body checksum. O(file size); run by `stats` tooling
    /// and the compaction verification pass, not on open.
    pub fn verify_checksum(&self) -> StoreResult<()> {
        let body = &self.mmap[PAGE_SIZE..self.header.total_pages as usize * PAGE_SIZE];
        let actual = fnv1a64_update(FNV1A64_INIT, body);
        if actual != self.header.checksum {
            return Err(StoreError::Corrupt(format!(
                "checksum mismatch in {} (stored {:016x}, computed {actual:016x})",
                self.path.display(),
                self.header.checksum,
            )));
        }
        Ok(())
    }

    /// Raw value bytes for a key, used by the compaction verification pass.
    pub fn get_raw(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(<[u8]>::to_vec))
    }
}

/// `partition_point` over slot indices.
fn partition(count: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, count);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(mid) { lo = mid + 1 } else { hi = mid }
    }
    lo
}

impl ReadStore for MappedStore {
    fn get_position(&self, hash: PosHash) -> StoreResult<Option<PositionStats>> {
        let key = position_key(hash);
        match self.get(&key)? {
            None => Ok(None),
            Some(bytes) => {
                let stats = PositionStats::decode(bytes).ok_or_else(|| {
                    StoreError::Corrupt(format!("bad position record in {}", self.path.display()))
                })?;
                Ok(Some(stats))
            }
        }
    }

    fn get_moves(&self, hash: PosHash) -> StoreResult<Vec<MoveStats>> {
        let (start, end) = move_key_range(hash);
        let mut moves = vec![];
        self.scan_range(&start, &end, |key, value| {
            let stats = parse_move_key(key)
                .and_then(|(_, uci)| MoveStats::decode(uci, value))
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("bad move record in {}", self.path.display()))
                })?;
            moves.push(stats);
            Ok(())
        })?;
        sort_moves_descending(&mut moves);
        Ok(moves)
    }

    fn stats(&self) -> StoreResult<StoreSummary> {
        Ok(StoreSummary {
            position_count: self.header.position_count,
            move_count: self.header.move_count,
            size_bytes: self.mmap.len() as u64,
        })
    }
}

/// Bulk loader: feed strictly ascending `(key, value)` pairs, then
/// [`finish`](MappedStoreBuilder::finish). Leaves stream straight to disk;
/// only one `(first key, page)` pair per page stays in memory for the
/// internal levels.
pub struct MappedStoreBuilder {
    dir: PathBuf,
    tmp_path: PathBuf,
    file: File,
    page_buf: Vec<u8>,
    entries_in_page: usize,
    first_key_in_page: Vec<u8>,
    last_key: Option<Vec<u8>>,
    children: Vec<(Vec<u8>, u32)>,
    next_page: u32,
    checksum: u64,
    position_count: u64,
    move_count: u64,
}

impl MappedStoreBuilder {
    pub fn create(dir: impl AsRef<Path>) -> StoreResult<MappedStoreBuilder> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let tmp_path = dir.join(format!("{STORE_FILE}.tmp"));
        let mut file = File::create(&tmp_path)?;
        // Header placeholder; the real header is written by finish().
        file.write_all(&[0; PAGE_SIZE])?;
        Ok(MappedStoreBuilder {
            dir,
            tmp_path,
            file,
            page_buf: vec![0; PAGE_SIZE],
            entries_in_page: 0,
            first_key_in_page: vec![],
            last_key: None,
            children: vec![],
            next_page: 1,
            checksum: FNV1A64_INIT,
            position_count: 0,
            move_count: 0,
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        if key.len() > MAX_MOVE_KEY_LEN || value.len() > MOVE_VALUE_LEN {
            return Err(StoreError::Corrupt(format!("oversized entry for key {key:02x?}")));
        }
        if self.last_key.as_deref().is_some_and(|last| last >= key) {
            return Err(StoreError::Corrupt(format!("entries out of order at key {key:02x?}")));
        }
        self.last_key = Some(key.to_vec());
        if self.entries_in_page == 0 {
            self.first_key_in_page = key.to_vec();
        }
        let base = LEAF_HEADER + self.entries_in_page * LEAF_SLOT;
        let slot = &mut self.page_buf[base..base + LEAF_SLOT];
        slot.fill(0);
        slot[0] = key.len() as u8;
        slot[1..1 + key.len()].copy_from_slice(key);
        slot[1 + MAX_MOVE_KEY_LEN] = value.len() as u8;
        slot[2 + MAX_MOVE_KEY_LEN..2 + MAX_MOVE_KEY_LEN + value.len()].copy_from_slice(value);
        self.entries_in_page += 1;
        if key.starts_with(b"p:") {
            self.position_count += 1;
        } else {
            self.move_count += 1;
        }
        if self.entries_in_page == LEAF_CAP {
            self.flush_leaf()?;
        }
        Ok(())
    }

    fn flush_leaf(&mut self) -> StoreResult<()> {
        if self.entries_in_page == 0 {
            return Ok(());
        }
        LittleEndian::write_u16(&mut self.page_buf[0..2], self.entries_in_page as u16);
        self.write_page()?;
        let first_key = std::mem::take(&mut self.first_key_in_page);
        self.children.push((first_key, self.next_page - 1));
        self.entries_in_page = 0;
        self.page_buf.fill(0);
        Ok(())
    }

    fn write_page(&mut self) -> StoreResult<()> {
        self.checksum = fnv1a64_update(self.checksum, &self.page_buf);
        self.file.write_all(&self.page_buf)?;
        self.next_page += 1;
        Ok(())
    }

    /// Builds internal levels bottom-up until one node remains.
    fn build_inner_levels(&mut self) -> StoreResult<u32> {
        let leaf_count = self.children.len() as u32;
        debug_assert_eq!(self.next_page, 1 + leaf_count);
        while self.children.len() > 1 {
            let level = std::mem::take(&mut self.children);
            for group in level.chunks(INNER_CAP) {
                self.page_buf.fill(0);
                LittleEndian::write_u16(&mut self.page_buf[0..2], group.len() as u16);
                for (slot, (key, child)) in group.iter().enumerate() {
                    let base = INNER_HEADER + slot * INNER_SLOT;
                    LittleEndian::write_u32(&mut self.page_buf[base..base + 4], *child);
                    self.page_buf[base + 4] = key.len() as u8;
                    self.page_buf[base + 5..base + 5 + key.len()].copy_from_slice(key);
                }
                let first_key = group[0].0.clone();
                self.write_page()?;
                self.children.push((first_key, self.next_page - 1));
            }
        }
        Ok(self.children.first().map_or(0, |(_, page)| *page))
    }

    pub fn finish(mut self) -> StoreResult<MappedStore> {
        self.flush_leaf()?;
        let leaf_count = self.children.len() as u32;
        let root_page = self.build_inner_levels()?;
        let header = Header {
            total_pages: self.next_page,
            root_page,
            leaf_first: 1,
            leaf_count,
            position_count: self.position_count,
            move_count: self.move_count,
            checksum: self.checksum,
        };
        let mut header_page = vec![0; PAGE_SIZE];
        header.write(&mut header_page[..HEADER_LEN]);
        let mut file = self.file;
        let _ = file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_page)?;
        file.sync_all()?;
        drop(file);
        let final_path = self.dir.join(STORE_FILE);
        fs::rename(&self.tmp_path, &final_path)?;
        sync_dir(&self.dir)?;
        MappedStore::open(&self.dir)
    }
}
