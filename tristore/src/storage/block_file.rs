//! Fixed-size block file.
//!
//! Every read goes through a small LRU cache; every write goes straight to
//! disk. Freed blocks are chained into an on-disk free list and handed out
//! again before the file grows.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::Mutex;

use super::journal::Journal;
use super::{BlockId, BlockPayload, FileKind, FORMAT_VERSION, FRAME_OVERHEAD, MIN_BLOCK_SIZE, NULL_BLOCK};
use crate::errors::{EngineError, EngineResult};

const MAGIC: [u8; 4] = *b"TSBF";
const HEADER_LEN: usize = 44;
const HEADER_CRC_AT: usize = 40;

const STATE_FREE: u8 = 0;
const STATE_USED: u8 = 1;

/// In-memory copy of the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub kind: FileKind,
    pub block_size: u32,
    pub next_block: BlockId,
    pub free_head: BlockId,
    pub free_count: u64,
}

impl FileHeader {
    fn new(kind: FileKind, block_size: u32) -> Self {
        FileHeader {
            kind,
            block_size,
            next_block: 1,
            free_head: NULL_BLOCK,
            free_count: 0,
        }
    }

    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8] = self.kind as u8;
        buf[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_block.to_le_bytes());
        buf[24..32].copy_from_slice(&self.free_head.to_le_bytes());
        buf[32..40].copy_from_slice(&self.free_count.to_le_bytes());
        let crc = crc32fast::hash(&buf[..HEADER_CRC_AT]);
        buf[HEADER_CRC_AT..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8], file: &str) -> EngineResult<Self> {
        if bytes.len() < HEADER_LEN || bytes[0..4] != MAGIC {
            return Err(EngineError::Corrupted(format!("{}: not a block file", file)));
        }
        let version = read_u32(bytes, 4);
        if version != FORMAT_VERSION {
            return Err(EngineError::FormatVersionMismatch {
                file: file.to_string(),
                expected: FORMAT_VERSION,
                found: version,
            });
        }
        if read_u32(bytes, HEADER_CRC_AT) != crc32fast::hash(&bytes[..HEADER_CRC_AT]) {
            return Err(EngineError::Corrupted(format!("{}: header checksum mismatch", file)));
        }
        let kind = FileKind::from_u8(bytes[8]).ok_or_else(|| {
            EngineError::Corrupted(format!("{}: unknown file kind {}", file, bytes[8]))
        })?;

        Ok(FileHeader {
            kind,
            block_size: read_u32(bytes, 12),
            next_block: read_u64(bytes, 16),
            free_head: read_u64(bytes, 24),
            free_count: read_u64(bytes, 32),
        })
    }
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn encode_frame(state: u8, payload: &[u8], block_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block_size);
    buf.push(state);
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf.resize(block_size, 0);
    buf
}

/// I/O and cache counters of a block file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFileStats {
    /// Blocks in use, header excluded
    pub blocks: u64,
    pub free_blocks: u64,
    pub cached_blocks: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

/// Decoded contents of a whole block file, comparable with `==`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileImage<T> {
    pub next_block: BlockId,
    pub free_head: BlockId,
    pub free_count: u64,
    pub blocks: Vec<(BlockId, T)>,
}

/// A file of `block_size` byte blocks, each holding one `T`.
pub struct BlockFile<T: BlockPayload> {
    path: PathBuf,
    name: String,
    file: Mutex<File>,
    block_size: usize,
    header: FileHeader,
    cache: Mutex<LruCache<BlockId, T>>,
    journal: Option<Journal>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl<T: BlockPayload> BlockFile<T> {
    /// Creates a new, empty block file, replacing any file at `path`.
    pub fn create(path: &Path, block_size: usize, cache_blocks: usize) -> EngineResult<Self> {
        if block_size < MIN_BLOCK_SIZE || block_size > u32::MAX as usize {
            return Err(EngineError::InvalidConfig(format!(
                "block size {} is out of range",
                block_size
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let header = FileHeader::new(T::KIND, block_size as u32);
        let block_file = Self::from_parts(path, file, block_size, header, cache_blocks);

        let mut first = header.to_bytes().to_vec();
        first.resize(block_size, 0);
        block_file.write_raw(NULL_BLOCK, &first)?;

        info!("Created block file {:?} with {} byte blocks", path, block_size);
        Ok(block_file)
    }

    /// Opens an existing block file written with the same block size.
    pub fn open(path: &Path, block_size: usize, cache_blocks: usize) -> EngineResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let name = file_name(path);

        let len = file.metadata()?.len();
        if len < HEADER_LEN as u64 {
            return Err(EngineError::Corrupted(format!("{}: truncated header", name)));
        }
        let mut bytes = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;

        let header = FileHeader::from_bytes(&bytes, &name)?;
        if header.kind != T::KIND {
            return Err(EngineError::Corrupted(format!(
                "{}: holds {:?} blocks, expected {:?}",
                name,
                header.kind,
                T::KIND
            )));
        }
        if header.block_size as usize != block_size {
            return Err(EngineError::Corrupted(format!(
                "{}: block size {} does not match the layout's {}",
                name, header.block_size, block_size
            )));
        }

        debug!(
            "Opened block file {:?}: {} blocks, {} free",
            path,
            header.next_block.saturating_sub(1),
            header.free_count
        );
        Ok(Self::from_parts(path, file, block_size, header, cache_blocks))
    }

    fn from_parts(
        path: &Path,
        file: File,
        block_size: usize,
        header: FileHeader,
        cache_blocks: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_blocks).unwrap_or(NonZeroUsize::MIN);
        BlockFile {
            path: path.to_path_buf(),
            name: file_name(path),
            file: Mutex::new(file),
            block_size,
            header,
            cache: Mutex::new(LruCache::new(capacity)),
            journal: None,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Largest payload a single block can hold.
    pub fn payload_limit(&self) -> usize {
        self.block_size - FRAME_OVERHEAD
    }

    /// Number of blocks in use.
    pub fn len(&self) -> u64 {
        self.header
            .next_block
            .saturating_sub(1)
            .saturating_sub(self.header.free_count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_count(&self) -> u64 {
        self.header.free_count
    }

    /// Hands out a block id, reusing freed blocks first.
    ///
    /// The block holds no payload until it is written.
    pub fn allocate(&mut self) -> EngineResult<BlockId> {
        if self.header.free_head != NULL_BLOCK {
            let id = self.header.free_head;
            let next = self.read_free_link(id)?;

            self.header.free_head = next;
            self.header.free_count = self.header.free_count.saturating_sub(1);
            self.write_header()?;
            return Ok(id);
        }

        let id = self.header.next_block;
        self.header.next_block += 1;
        self.write_header()?;
        Ok(id)
    }

    /// Reads and decodes one block.
    pub fn read(&self, id: BlockId) -> EngineResult<T> {
        self.check_id(id)?;

        if let Some(value) = self.cache.lock().get(&id) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let bytes = self.read_raw(id)?;
        let (state, payload) = self.decode_frame(id, &bytes)?;
        if state != STATE_USED {
            return Err(EngineError::InvalidBlockId(id));
        }
        let (value, _): (T, usize) =
            bincode::serde::decode_from_slice(payload, bincode::config::legacy())
                .map_err(EngineError::serialization)?;

        self.cache.lock().put(id, value.clone());
        Ok(value)
    }

    /// Encodes and writes one block as a single unit.
    pub fn write(&mut self, id: BlockId, value: &T) -> EngineResult<()> {
        self.check_id(id)?;

        let payload = bincode::serde::encode_to_vec(value, bincode::config::legacy())
            .map_err(EngineError::serialization)?;
        let limit = self.payload_limit();
        if payload.len() > limit {
            return Err(EngineError::BlockOverflow {
                block: id,
                size: payload.len(),
                limit,
            });
        }

        self.capture(id, None)?;
        let frame = encode_frame(STATE_USED, &payload, self.block_size);
        self.write_raw(id, &frame)?;
        self.cache.lock().put(id, value.clone());
        Ok(())
    }

    /// Returns a block to the free list. Freeing the last block of the file
    /// instead cuts the file back over every free block at its end.
    pub fn free(&mut self, id: BlockId) -> EngineResult<()> {
        self.check_id(id)?;

        let bytes = self.read_raw(id)?;
        let (state, _) = self.decode_frame(id, &bytes)?;
        if state != STATE_USED {
            return Err(EngineError::InvalidBlockId(id));
        }
        self.capture(id, Some(bytes))?;

        let frame = encode_frame(STATE_FREE, &self.header.free_head.to_le_bytes(), self.block_size);
        self.write_raw(id, &frame)?;
        self.cache.lock().pop(&id);

        self.header.free_head = id;
        self.header.free_count += 1;
        if id + 1 == self.header.next_block {
            self.trim_tail()?;
        }
        self.write_header()
    }

    /// Free list entries in list order, each with its link.
    fn free_list(&self) -> EngineResult<Vec<(BlockId, BlockId)>> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut id = self.header.free_head;
        while id != NULL_BLOCK {
            if !seen.insert(id) {
                return Err(EngineError::Corrupted(format!(
                    "{}: free list loops at block {}",
                    self.name, id
                )));
            }
            let next = self.read_free_link(id)?;
            entries.push((id, next));
            id = next;
        }
        Ok(entries)
    }

    /// Drops the run of free blocks at the end of the file: they leave the
    /// free list and the file is truncated after the last block in use.
    fn trim_tail(&mut self) -> EngineResult<()> {
        let listed = self.free_list()?;
        let free: HashSet<BlockId> = listed.iter().map(|(id, _)| *id).collect();
        let mut end = self.header.next_block;
        while end > 1 && free.contains(&(end - 1)) {
            end -= 1;
        }
        let cut = self.header.next_block - end;
        if cut == 0 {
            return Ok(());
        }
        for id in end..self.header.next_block {
            self.capture(id, None)?;
        }

        let kept: Vec<(BlockId, BlockId)> = listed.into_iter().filter(|(id, _)| *id < end).collect();
        let links: Vec<BlockId> = kept
            .iter()
            .skip(1)
            .map(|(id, _)| *id)
            .chain(std::iter::once(NULL_BLOCK))
            .collect();
        for ((id, next), link) in kept.iter().zip(links) {
            if *next != link {
                self.capture(*id, None)?;
                let frame = encode_frame(STATE_FREE, &link.to_le_bytes(), self.block_size);
                self.write_raw(*id, &frame)?;
            }
        }

        self.header.free_head = kept.first().map_or(NULL_BLOCK, |(id, _)| *id);
        self.header.free_count = kept.len() as u64;
        self.header.next_block = end;
        {
            let mut cache = self.cache.lock();
            for id in end..end + cut {
                cache.pop(&id);
            }
        }
        self.file.lock().set_len(self.offset(end))?;
        debug!("{}: cut {} free blocks off the end of the file", self.name, cut);
        Ok(())
    }

    fn read_free_link(&self, id: BlockId) -> EngineResult<BlockId> {
        let bytes = self.read_raw(id)?;
        let (state, payload) = self.decode_frame(id, &bytes)?;
        if state != STATE_FREE || payload.len() != 8 {
            return Err(EngineError::Corrupted(format!(
                "{}: free list entry {} is not a free block",
                self.name, id
            )));
        }
        let next = read_u64(payload, 0);
        if next >= self.header.next_block {
            return Err(EngineError::Corrupted(format!(
                "{}: free list link {} -> {} points past the end of the file",
                self.name, id, next
            )));
        }
        Ok(next)
    }

    /// Ids of every block currently holding a payload, ascending.
    pub fn allocated_ids(&self) -> EngineResult<Vec<BlockId>> {
        let mut ids = Vec::new();
        for id in 1..self.header.next_block {
            let bytes = self.read_raw(id)?;
            let (state, _) = self.decode_frame(id, &bytes)?;
            if state == STATE_USED {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Decodes every block in use.
    pub fn image(&self) -> EngineResult<FileImage<T>> {
        let mut blocks = Vec::new();
        for id in self.allocated_ids()? {
            blocks.push((id, self.read(id)?));
        }
        Ok(FileImage {
            next_block: self.header.next_block,
            free_head: self.header.free_head,
            free_count: self.header.free_count,
            blocks,
        })
    }

    pub fn sync(&self) -> EngineResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    pub fn stats(&self) -> BlockFileStats {
        BlockFileStats {
            blocks: self.len(),
            free_blocks: self.header.free_count,
            cached_blocks: self.cache.lock().len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }

    /// Starts recording before-images of changed blocks. A journal that is
    /// already open stays in place.
    pub fn begin_journal(&mut self) -> EngineResult<()> {
        if self.journal.is_none() {
            let len = self.file.lock().metadata()?.len();
            self.journal = Some(Journal::new(self.header, len));
        }
        Ok(())
    }

    /// Forgets the before-images; the changes stay.
    pub fn commit_journal(&mut self) {
        if let Some(journal) = self.journal.take() {
            debug!("{}: committed {} rewritten blocks", self.name, journal.touched());
        }
    }

    /// Puts every block, the header and the file length back to the state
    /// they had when the journal was opened.
    pub fn rollback_journal(&mut self) -> EngineResult<()> {
        let journal = match self.journal.take() {
            Some(journal) => journal,
            None => return Ok(()),
        };

        self.cache.lock().clear();
        {
            let mut file = self.file.lock();
            for (id, bytes) in journal.images() {
                file.seek(SeekFrom::Start(self.offset(*id)))?;
                file.write_all(bytes)?;
            }
            file.set_len(journal.file_len())?;
        }
        self.header = *journal.header();
        self.write_header()?;

        debug!("{}: rolled back {} blocks", self.name, journal.touched());
        Ok(())
    }

    pub fn in_journal(&self) -> bool {
        self.journal.is_some()
    }

    fn check_id(&self, id: BlockId) -> EngineResult<()> {
        if id == NULL_BLOCK || id >= self.header.next_block {
            return Err(EngineError::InvalidBlockId(id));
        }
        Ok(())
    }

    fn offset(&self, id: BlockId) -> u64 {
        id * self.block_size as u64
    }

    fn capture(&mut self, id: BlockId, bytes: Option<Vec<u8>>) -> EngineResult<()> {
        let needed = self
            .journal
            .as_ref()
            .is_some_and(|journal| journal.needs_image(id));
        if !needed {
            return Ok(());
        }
        let bytes = match bytes {
            Some(bytes) => bytes,
            None => self.read_raw(id)?,
        };
        if let Some(journal) = self.journal.as_mut() {
            journal.record(id, bytes);
        }
        Ok(())
    }

    /// Reads one block verbatim. Blocks past the end of the file read as
    /// zeroes.
    fn read_raw(&self, id: BlockId) -> EngineResult<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        let offset = self.offset(id);
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset < len {
            let available = ((len - offset) as usize).min(self.block_size);
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf[..available])?;
        }
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    fn write_raw(&self, id: BlockId, bytes: &[u8]) -> EngineResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(id)))?;
        file.write_all(bytes)?;
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_header(&self) -> EngineResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.header.to_bytes())?;
        Ok(())
    }

    fn decode_frame<'a>(&self, id: BlockId, bytes: &'a [u8]) -> EngineResult<(u8, &'a [u8])> {
        let state = bytes[0];
        let crc = read_u32(bytes, 1);
        let len = read_u32(bytes, 5) as usize;
        if state > STATE_USED || len > self.payload_limit() {
            return Err(EngineError::Corrupted(format!(
                "{}: block {} has a malformed frame",
                self.name, id
            )));
        }
        let payload = &bytes[FRAME_OVERHEAD..FRAME_OVERHEAD + len];
        if crc32fast::hash(payload) != crc {
            return Err(EngineError::Corrupted(format!(
                "{}: checksum mismatch in block {}",
                self.name, id
            )));
        }
        Ok((state, payload))
    }
}

impl<T: BlockPayload> Drop for BlockFile<T> {
    fn drop(&mut self) {
        if self.journal.is_some() {
            warn!("{}: dropped during an unfinished change, rolling back", self.name);
            if let Err(err) = self.rollback_journal() {
                warn!("{}: rollback on drop failed: {}", self.name, err);
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
