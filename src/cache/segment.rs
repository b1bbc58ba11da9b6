//! Append-only segment files and the index log behind the disk tier.
//!
//! Layout under the disk path:
//!
//! ```text
//!   segment-0.dat   payload bytes, append-only
//!   segment-1.dat
//!   index.log       one JSON line per confirmed write or removal
//! ```
//!
//! Payloads are addressed by `(segment, offset, stored_len)` and verified
//! with an xxh3 checksum of the stored bytes on every read. The allocator
//! tracks live and allocated bytes per segment so the disk tier can find
//! mostly dead segments worth compacting.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::cache::entry::CacheKey;

const INDEX_FILE: &str = "index.log";
const INDEX_TMP_FILE: &str = "index.log.tmp";
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".dat";

/// Where a payload lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    pub segment: u64,
    pub offset: u64,
    /// Bytes on disk (after compression).
    pub stored_len: u64,
    /// Bytes handed back to callers.
    pub raw_len: u64,
    pub checksum: u64,
    pub compressed: bool,
}

/// One line of `index.log`. A missing location records a removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexLine {
    pub seq: u64,
    pub key: CacheKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<RecordLocation>,
}

/// Checksum of stored payload bytes.
pub fn checksum(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Hands out append-only regions in segment files and tracks live bytes
/// so that fully dead, sealed segments can be deleted.
#[derive(Debug)]
pub struct SegmentAllocator {
    segment_size: u64,
    active: u64,
    end: u64,
    live: HashMap<u64, u64>,
    /// Bytes allocated per segment, live or dead.
    sizes: HashMap<u64, u64>,
    pending_writes: HashMap<u64, u32>,
}

impl SegmentAllocator {
    pub fn new(segment_size: u64, first_segment: u64) -> Self {
        Self {
            segment_size: segment_size.max(1),
            active: first_segment,
            end: 0,
            live: HashMap::new(),
            sizes: HashMap::new(),
            pending_writes: HashMap::new(),
        }
    }

    /// Reserve `len` bytes. Returns `(segment, offset)` and, when the active
    /// segment was sealed by this call and is already dead, that segment.
    pub fn allocate(&mut self, len: u64) -> ((u64, u64), Option<u64>) {
        let mut sealed_dead = None;
        if self.end > 0 && self.end + len > self.segment_size {
            let sealed = self.active;
            self.active += 1;
            self.end = 0;
            if self.is_dead(sealed) {
                sealed_dead = Some(sealed);
            }
        }
        let slot = (self.active, self.end);
        self.end += len;
        self.sizes.insert(self.active, self.end);
        *self.live.entry(self.active).or_insert(0) += len;
        *self.pending_writes.entry(self.active).or_insert(0) += 1;
        (slot, sealed_dead)
    }

    /// Account for a record already on disk, used when reloading.
    pub fn restore(&mut self, location: &RecordLocation) {
        *self.live.entry(location.segment).or_insert(0) += location.stored_len;
        self.note_size(location.segment, location.offset + location.stored_len);
    }

    /// Raise the known size of a segment, e.g. to its file length.
    pub fn note_size(&mut self, segment: u64, len: u64) {
        let size = self.sizes.entry(segment).or_insert(0);
        *size = (*size).max(len);
    }

    /// Allocated bytes across all segments still on disk.
    pub fn footprint(&self) -> u64 {
        self.sizes.values().sum()
    }

    /// The sealed segment with the lowest live ratio below `min_live_ratio`,
    /// skipping segments with writes in flight.
    pub fn compaction_candidate(&self, min_live_ratio: f64) -> Option<u64> {
        self.sizes
            .iter()
            .filter(|(segment, size)| {
                **segment != self.active && **size > 0 && !self.pending_writes.contains_key(*segment)
            })
            .map(|(segment, size)| {
                let live = self.live.get(segment).copied().unwrap_or(0);
                (*segment, live as f64 / *size as f64)
            })
            .filter(|(_, ratio)| *ratio < min_live_ratio)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(segment, _)| segment)
    }

    /// A reserved write finished (successfully or not).
    pub fn finish_write(&mut self, segment: u64) -> Option<u64> {
        if let Some(count) = self.pending_writes.get_mut(&segment) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending_writes.remove(&segment);
            }
        }
        self.is_dead(segment).then_some(segment)
    }

    /// Bytes of a segment are no longer referenced. Returns the segment if
    /// it can now be deleted.
    pub fn release(&mut self, segment: u64, len: u64) -> Option<u64> {
        if let Some(live) = self.live.get_mut(&segment) {
            *live = live.saturating_sub(len);
        }
        self.is_dead(segment).then_some(segment)
    }

    fn is_dead(&mut self, segment: u64) -> bool {
        let dead = segment != self.active
            && self.live.get(&segment).copied().unwrap_or(0) == 0
            && !self.pending_writes.contains_key(&segment);
        if dead {
            self.live.remove(&segment);
            self.sizes.remove(&segment);
        }
        dead
    }
}

/// File I/O for segments and the index log.
pub struct SegmentStore {
    dir: PathBuf,
    persistence: bool,
    index: Mutex<Option<File>>,
    /// Lines in the index log, including superseded ones.
    index_lines: AtomicU64,
}

/// Exclusive hold on the index log. Appends wait until it is committed
/// or dropped.
pub struct IndexRewrite<'a> {
    store: &'a SegmentStore,
    file: MutexGuard<'a, Option<File>>,
}

impl IndexRewrite<'_> {
    /// Replace the index log with exactly `lines`.
    pub async fn commit(mut self, lines: &[IndexLine]) -> std::io::Result<()> {
        if !self.store.persistence {
            return Ok(());
        }
        let buf = encode_lines(lines)?;
        *self.file = None;
        let tmp = self.store.dir.join(INDEX_TMP_FILE);
        fs::write(&tmp, &buf).await?;
        fs::rename(&tmp, self.store.dir.join(INDEX_FILE)).await?;
        self.store.index_lines.store(lines.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl SegmentStore {
    /// Open the store. Without persistence, leftovers from a previous run
    /// are deleted and nothing is replayed.
    pub async fn open(dir: &Path, persistence: bool) -> std::io::Result<(Self, Vec<IndexLine>)> {
        fs::create_dir_all(dir).await?;

        let mut live = Vec::new();
        if persistence {
            live = replay_index(&dir.join(INDEX_FILE)).await?;
        } else {
            for segment in list_segments(dir).await? {
                fs::remove_file(segment_path(dir, segment)).await?;
            }
            let index = dir.join(INDEX_FILE);
            if fs::try_exists(&index).await? {
                fs::remove_file(&index).await?;
            }
        }

        let store = Self {
            dir: dir.to_path_buf(),
            persistence,
            index: Mutex::new(None),
            index_lines: AtomicU64::new(0),
        };
        Ok((store, live))
    }

    pub fn segment_path(&self, segment: u64) -> PathBuf {
        segment_path(&self.dir, segment)
    }

    /// Write payload bytes at a reserved location.
    pub async fn write_at(&self, location: &RecordLocation, data: &[u8]) -> std::io::Result<()> {
        let path = self.segment_path(location.segment);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(location.offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        debug!(
            segment = location.segment,
            offset = location.offset,
            size = data.len(),
            "Wrote payload to segment"
        );
        Ok(())
    }

    /// Read stored bytes and verify their checksum.
    pub async fn read_verified(&self, location: &RecordLocation) -> std::io::Result<Result<Vec<u8>, String>> {
        let path = self.segment_path(location.segment);
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(location.offset)).await?;

        let mut data = vec![0u8; location.stored_len as usize];
        if let Err(e) = file.read_exact(&mut data).await {
            return Ok(Err(format!("short read: {e}")));
        }
        let actual = checksum(&data);
        if actual != location.checksum {
            return Ok(Err(format!(
                "checksum mismatch: expected {:016x}, found {actual:016x}",
                location.checksum
            )));
        }
        Ok(Ok(data))
    }

    /// Append lines to the index log. No-op without persistence.
    pub async fn append_index(&self, lines: &[IndexLine]) -> std::io::Result<()> {
        if !self.persistence || lines.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(lines)?;

        let mut guard = self.index.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(INDEX_FILE))
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&buf).await?;
            file.flush().await?;
            self.index_lines.fetch_add(lines.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Replace the index log with exactly `lines`.
    pub async fn rewrite_index(&self, lines: &[IndexLine]) -> std::io::Result<()> {
        IndexRewrite {
            store: self,
            file: self.index.lock().await,
        }
        .commit(lines)
        .await
    }

    /// Start a rewrite unless the index log is busy.
    pub fn try_begin_rewrite(&self) -> Option<IndexRewrite<'_>> {
        let file = self.index.try_lock().ok()?;
        Some(IndexRewrite { store: self, file })
    }

    pub fn index_lines(&self) -> u64 {
        self.index_lines.load(Ordering::Relaxed)
    }

    pub async fn segment_len(&self, segment: u64) -> std::io::Result<u64> {
        Ok(fs::metadata(self.segment_path(segment)).await?.len())
    }

    pub async fn delete_segment(&self, segment: u64) {
        let path = self.segment_path(segment);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(segment, "Deleted dead segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(segment, error = %e, "Failed to delete dead segment"),
        }
    }

    pub async fn segments_on_disk(&self) -> std::io::Result<Vec<u64>> {
        list_segments(&self.dir).await
    }
}

fn encode_lines(lines: &[IndexLine]) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for line in lines {
        serde_json::to_writer(&mut buf, line)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{segment}{SEGMENT_SUFFIX}"))
}

async fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut segments = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|id| id.parse::<u64>().ok())
        {
            segments.push(id);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Replay the index log and return the live records in write order.
/// Lines that fail to parse (a torn tail after a crash) are skipped.
async fn replay_index(path: &Path) -> std::io::Result<Vec<IndexLine>> {
    if !fs::try_exists(path).await? {
        return Ok(Vec::new());
    }

    let mut lines = Vec::new();
    let mut reader = BufReader::new(File::open(path).await?).lines();
    while let Some(raw) = reader.next_line().await? {
        if raw.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexLine>(&raw) {
            Ok(line) => lines.push(line),
            Err(e) => warn!(error = %e, "Skipping unreadable index line"),
        }
    }
    lines.sort_by_key(|line| line.seq);

    let mut live: HashMap<CacheKey, IndexLine> = HashMap::new();
    for line in lines {
        if line.location.is_some() {
            live.insert(line.key.clone(), line);
        } else {
            live.remove(&line.key);
        }
    }

    let ordered: BTreeMap<u64, IndexLine> = live.into_values().map(|l| (l.seq, l)).collect();
    Ok(ordered.into_values().collect())
}
