//! Volume - One Append-Only Needle Container
//!
//! A volume is the unit of replication and compaction: one `.dat` file
//! (superblock followed by needle records in append order) plus one `.idx`
//! journal that makes the in-memory index recoverable.
//!
//! ## Concurrency Model
//!
//! - Appends are single-writer: the append state (`.idx` handle, append
//!   offset, garbage accounting) lives behind one mutex.
//! - Reads never take the append lock. The index is only updated *after*
//!   the record bytes are durable at a stable offset, so a reader that
//!   sees an index entry can `read_at` that offset without coordination.
//! - Compaction phase 1 runs concurrently with writes; only
//!   `commit_compact` briefly blocks the append path while it replays the
//!   tail and swaps files.
//!
//! ## Durability
//!
//! Appends are flushed according to a [`SyncPolicy`] (every write, on an
//! interval, or never), the same knob the write-ahead path of any log
//! wants. The `.idx` journal is appended after the `.dat` write; on crash
//! the journal can only be *behind* the data file, and open() repairs that
//! by scanning the data file forward from the last journaled offset.
//!
//! ## Compaction
//!
//! Two-phase. `compact()` walks the live index and copies every live
//! record into `<id>.cpd` / `<id>.cpx` scratch files with the compact
//! revision bumped in the scratch superblock; originals are untouched and
//! the scratch is safe to discard. `commit_compact()` replays whatever was
//! appended to the live `.dat` since the scan onto the scratch file, then
//! atomically renames both files into place.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use needlehouse_core::needle::{padded_size, NeedleId, VolumeId, NEEDLE_PADDING};
use needlehouse_core::{Needle, ReplicaPlacement, Ttl};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::{self, idx_record, IndexEntry, IndexKind, IndexStats, NeedleIndex};
use crate::superblock::{SuperBlock, SUPERBLOCK_SIZE};

/// When appends are fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Always,
    /// Sync at most once per interval (balanced)
    Interval(Duration),
    /// Never sync (fastest; for tests)
    Never,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Interval(Duration::from_millis(100))
    }
}

/// Options fixed at volume open/create time.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    pub index_kind: IndexKind,
    /// Maximum `.dat` size in bytes; 0 means unlimited.
    pub size_limit: u64,
    pub sync_policy: SyncPolicy,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            index_kind: IndexKind::Memory,
            size_limit: 0,
            sync_policy: SyncPolicy::default(),
        }
    }
}

struct Appender {
    idx_file: File,
    /// Next append position in the `.dat` file.
    append_offset: u64,
    /// Length of the `.idx` journal in bytes.
    idx_len: u64,
    stats: IndexStats,
    last_sync: Instant,
}

struct CompactScratch {
    dat_path: PathBuf,
    idx_path: PathBuf,
    /// Append offset at the moment the live-index scan started; everything
    /// after it is replayed at commit time.
    watermark: u64,
    /// Append offset in the scratch `.cpd` file.
    new_offset: u64,
}

pub struct Volume {
    id: VolumeId,
    collection: String,
    dir: PathBuf,
    options: VolumeOptions,
    super_block: RwLock<SuperBlock>,
    dat: RwLock<File>,
    index: RwLock<Box<dyn NeedleIndex>>,
    appender: Mutex<Appender>,
    read_only: AtomicBool,
    compacting: Mutex<Option<CompactScratch>>,
}

impl Volume {
    /// Create a brand-new empty volume in `dir`.
    pub fn create(
        dir: &Path,
        id: VolumeId,
        collection: &str,
        replica_placement: ReplicaPlacement,
        ttl: Ttl,
        options: VolumeOptions,
    ) -> Result<Self> {
        let dat_path = dat_file_name(dir, collection, id);
        if dat_path.exists() {
            return Err(Error::VolumeExists(id));
        }
        let super_block = SuperBlock::new(replica_placement, ttl);
        let dat = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&dat_path)?;
        dat.write_all_at(&super_block.to_bytes(), 0)?;
        dat.sync_all()?;
        let idx_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(idx_file_name(dir, collection, id))?;

        info!(volume = id, collection, "created volume");
        Ok(Self {
            id,
            collection: collection.to_string(),
            dir: dir.to_path_buf(),
            super_block: RwLock::new(super_block),
            dat: RwLock::new(dat),
            index: RwLock::new(index::load(options.index_kind, &[]).index),
            appender: Mutex::new(Appender {
                idx_file,
                append_offset: SUPERBLOCK_SIZE as u64,
                idx_len: 0,
                stats: IndexStats::default(),
                last_sync: Instant::now(),
            }),
            read_only: AtomicBool::new(false),
            options,
            compacting: Mutex::new(None),
        })
    }

    /// Open an existing volume, repairing the index from the data file if
    /// the journal is behind (crash recovery).
    pub fn open(dir: &Path, id: VolumeId, collection: &str, options: VolumeOptions) -> Result<Self> {
        let dat_path = dat_file_name(dir, collection, id);
        let dat = OpenOptions::new().read(true).write(true).open(&dat_path)?;
        let dat_len = dat.metadata()?.len();
        let mut header = [0u8; SUPERBLOCK_SIZE];
        dat.read_exact_at(&mut header, 0)?;
        let super_block = SuperBlock::parse(&header)?;

        let idx_path = idx_file_name(dir, collection, id);
        let mut journal = Vec::new();
        let mut idx_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&idx_path)?;
        idx_file.read_to_end(&mut journal)?;

        let loaded = index::load(options.index_kind, &journal);
        let mut index = loaded.index;
        let mut stats = loaded.stats;
        let mut idx_len = journal.len() as u64;

        // The journal never covers less than the superblock.
        let mut scan_from = loaded.dat_covered.max(SUPERBLOCK_SIZE as u64);
        let mut recovered = 0u64;
        while scan_from < dat_len {
            let (needle, disk) = match read_record_at(&dat, scan_from, dat_len, super_block.version)
            {
                Ok(found) => found,
                Err(err) => {
                    warn!(
                        volume = id,
                        offset = scan_from,
                        error = %err,
                        "stopping recovery scan at undecodable record"
                    );
                    break;
                }
            };
            let entry = IndexEntry::new(
                (scan_from / NEEDLE_PADDING as u64) as u32,
                needle.encoded_len(),
            );
            if needle.is_tombstone() {
                if let Some(old) = index.delete(needle.id) {
                    stats.delete_count += 1;
                    stats.deleted_bytes += old.size as u64;
                    idx_file.write_all(&idx_record(
                        needle.id,
                        IndexEntry::new(0, index::TOMBSTONE_SIZE),
                    ))?;
                    idx_len += index::IDX_RECORD_SIZE as u64;
                }
            } else {
                if let Some(old) = index.put(needle.id, entry) {
                    stats.delete_count += 1;
                    stats.deleted_bytes += old.size as u64;
                }
                idx_file.write_all(&idx_record(needle.id, entry))?;
                idx_len += index::IDX_RECORD_SIZE as u64;
            }
            scan_from += disk as u64;
            recovered += 1;
        }
        if recovered > 0 {
            idx_file.sync_all()?;
            info!(volume = id, recovered, "recovered index entries from data file");
        }

        debug!(
            volume = id,
            collection,
            size = scan_from,
            entries = index.len(),
            compact_revision = super_block.compact_revision,
            "opened volume"
        );
        Ok(Self {
            id,
            collection: collection.to_string(),
            dir: dir.to_path_buf(),
            super_block: RwLock::new(super_block),
            dat: RwLock::new(dat),
            index: RwLock::new(index),
            appender: Mutex::new(Appender {
                idx_file,
                append_offset: scan_from,
                idx_len,
                stats,
                last_sync: Instant::now(),
            }),
            read_only: AtomicBool::new(false),
            options,
            compacting: Mutex::new(None),
        })
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn replica_placement(&self) -> ReplicaPlacement {
        self.super_block.read().replica_placement
    }

    pub fn ttl(&self) -> Ttl {
        self.super_block.read().ttl
    }

    pub fn version(&self) -> u8 {
        self.super_block.read().version
    }

    pub fn compact_revision(&self) -> u16 {
        self.super_block.read().compact_revision
    }

    /// Current `.dat` length in bytes.
    pub fn size(&self) -> u64 {
        self.appender.lock().append_offset
    }

    /// Current `.idx` journal length in bytes.
    pub fn idx_file_size(&self) -> u64 {
        self.appender.lock().idx_len
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    pub fn live_count(&self) -> u64 {
        self.index.read().len() as u64
    }

    pub fn stats(&self) -> IndexStats {
        self.appender.lock().stats
    }

    /// Fraction of the data file occupied by garbage.
    pub fn garbage_ratio(&self) -> f64 {
        let appender = self.appender.lock();
        let payload = appender.append_offset.saturating_sub(SUPERBLOCK_SIZE as u64);
        if payload == 0 {
            return 0.0;
        }
        appender.stats.deleted_bytes as f64 / payload as f64
    }

    /// Append one needle, publish it in the index, return its byte offset.
    pub fn write(&self, needle: &Needle) -> Result<u64> {
        if self.is_read_only() {
            return Err(needlehouse_core::Error::VolumeReadOnly(self.id).into());
        }
        let encoded = needle.encode().map_err(Error::Core)?;

        let mut appender = self.appender.lock();
        if self.options.size_limit > 0
            && appender.append_offset + encoded.len() as u64 > self.options.size_limit
        {
            return Err(needlehouse_core::Error::VolumeFull(self.id).into());
        }
        let offset = appender.append_offset;
        let entry = IndexEntry::new(
            (offset / NEEDLE_PADDING as u64) as u32,
            needle.encoded_len(),
        );
        {
            let dat = self.dat.read();
            dat.write_all_at(&encoded, offset)?;
            self.maybe_sync(&dat, &mut appender)?;
        }
        appender.idx_file.write_all(&idx_record(needle.id, entry))?;
        appender.idx_len += index::IDX_RECORD_SIZE as u64;
        appender.append_offset += encoded.len() as u64;

        // Publish only after the bytes are at a stable offset.
        if let Some(old) = self.index.write().put(needle.id, entry) {
            appender.stats.delete_count += 1;
            appender.stats.deleted_bytes += old.size as u64;
        }
        Ok(offset)
    }

    /// Read one needle, verifying the request cookie.
    pub fn read(&self, id: NeedleId, cookie: u32) -> Result<Needle> {
        let entry = match self.index.read().get(id) {
            Some(entry) if !entry.is_tombstone() => entry,
            _ => return Err(needlehouse_core::Error::NotFound.into()),
        };
        let mut buf = vec![0u8; padded_size(entry.size) as usize];
        self.dat.read().read_exact_at(&mut buf, entry.byte_offset())?;
        let needle = Needle::decode(&buf, self.version()).map_err(Error::Core)?;
        if needle.id != id {
            return Err(needlehouse_core::Error::Corrupt(format!(
                "index points id {} at a record holding id {}",
                id, needle.id
            ))
            .into());
        }
        if needle.cookie != cookie {
            warn!(volume = self.id, needle = id, "cookie mismatch on read");
            return Err(needlehouse_core::Error::NotFound.into());
        }
        Ok(needle)
    }

    /// Logically delete a needle: append a tombstone record and drop the
    /// live index entry. Returns the bytes made reclaimable.
    pub fn delete(&self, id: NeedleId, cookie: u32) -> Result<u64> {
        if self.is_read_only() {
            return Err(needlehouse_core::Error::VolumeReadOnly(self.id).into());
        }
        match self.index.read().get(id) {
            Some(entry) if !entry.is_tombstone() => entry,
            _ => return Err(needlehouse_core::Error::NotFound.into()),
        };

        let tombstone = Needle::tombstone(id, cookie).encode().map_err(Error::Core)?;
        let mut appender = self.appender.lock();
        let offset = appender.append_offset;
        {
            let dat = self.dat.read();
            dat.write_all_at(&tombstone, offset)?;
            self.maybe_sync(&dat, &mut appender)?;
        }
        appender
            .idx_file
            .write_all(&idx_record(id, IndexEntry::new(0, index::TOMBSTONE_SIZE)))?;
        appender.idx_len += index::IDX_RECORD_SIZE as u64;
        appender.append_offset += tombstone.len() as u64;

        match self.index.write().delete(id) {
            Some(old) => {
                appender.stats.delete_count += 1;
                appender.stats.deleted_bytes += old.size as u64;
                Ok(old.size as u64)
            }
            // Lost a race with a concurrent delete; nothing newly reclaimable.
            None => Ok(0),
        }
    }

    /// Raw record bytes (padded) for the sync protocol.
    pub fn read_raw(&self, offset_units: u32, size: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; padded_size(size) as usize];
        self.dat
            .read()
            .read_exact_at(&mut buf, offset_units as u64 * NEEDLE_PADDING as u64)?;
        Ok(buf)
    }

    /// Append raw, already-encoded record bytes (sync protocol); the caller
    /// publishes the index entry afterwards via [`Volume::put_index_entry`].
    pub fn append_raw(&self, bytes: &[u8]) -> Result<u64> {
        debug_assert_eq!(bytes.len() % NEEDLE_PADDING as usize, 0);
        let mut appender = self.appender.lock();
        let offset = appender.append_offset;
        {
            let dat = self.dat.read();
            dat.write_all_at(bytes, offset)?;
            self.maybe_sync(&dat, &mut appender)?;
        }
        appender.append_offset += bytes.len() as u64;
        Ok(offset)
    }

    /// Publish an index mapping and journal it (sync protocol).
    pub fn put_index_entry(&self, id: NeedleId, entry: IndexEntry) -> Result<()> {
        let mut appender = self.appender.lock();
        appender.idx_file.write_all(&idx_record(id, entry))?;
        appender.idx_len += index::IDX_RECORD_SIZE as u64;
        if let Some(old) = self.index.write().put(id, entry) {
            appender.stats.delete_count += 1;
            appender.stats.deleted_bytes += old.size as u64;
        }
        Ok(())
    }

    /// Snapshot of the live index entries.
    pub fn index_snapshot(&self) -> Vec<(NeedleId, IndexEntry)> {
        let mut entries = Vec::with_capacity(self.index.read().len());
        let _ = self.index.read().visit(&mut |id, entry| {
            entries.push((id, entry));
            Ok(())
        });
        entries
    }

    pub fn get_index_entry(&self, id: NeedleId) -> Option<IndexEntry> {
        self.index.read().get(id)
    }

    /// Flush outstanding appends to disk.
    pub fn flush(&self) -> Result<()> {
        let appender = self.appender.lock();
        self.dat.read().sync_data()?;
        appender.idx_file.sync_data()?;
        Ok(())
    }

    fn maybe_sync(&self, dat: &File, appender: &mut Appender) -> Result<()> {
        match self.options.sync_policy {
            SyncPolicy::Always => {
                dat.sync_data()?;
                appender.last_sync = Instant::now();
            }
            SyncPolicy::Interval(interval) => {
                if appender.last_sync.elapsed() >= interval {
                    dat.sync_data()?;
                    appender.last_sync = Instant::now();
                }
            }
            SyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Compaction phase 1: copy the live set into scratch files.
    ///
    /// Runs concurrently with writes; anything appended after the watermark
    /// is replayed by [`Volume::commit_compact`].
    pub fn compact(&self) -> Result<()> {
        let mut compacting = self.compacting.lock();
        if compacting.is_some() {
            return Err(Error::Compacting(self.id));
        }

        let watermark = self.appender.lock().append_offset;
        let mut scratch_sb = *self.super_block.read();
        scratch_sb.compact_revision += 1;

        let dat_path = scratch_path(&self.dir, &self.collection, self.id, "cpd");
        let idx_path = scratch_path(&self.dir, &self.collection, self.id, "cpx");
        let mut dat_out = BufWriter::new(File::create(&dat_path)?);
        let mut idx_out = BufWriter::new(File::create(&idx_path)?);
        dat_out.write_all(&scratch_sb.to_bytes())?;
        let mut new_offset = SUPERBLOCK_SIZE as u64;

        // Tree-backed indexes visit in key order, so the rewritten file is
        // key-ordered; the compact map yields its own stable order.
        let entries = self.index_snapshot();
        for (id, entry) in entries {
            let bytes = self.read_raw(entry.offset, entry.size)?;
            dat_out.write_all(&bytes)?;
            idx_out.write_all(&idx_record(
                id,
                IndexEntry::new((new_offset / NEEDLE_PADDING as u64) as u32, entry.size),
            ))?;
            new_offset += bytes.len() as u64;
        }
        dat_out.flush()?;
        dat_out.get_ref().sync_all()?;
        idx_out.flush()?;
        idx_out.get_ref().sync_all()?;

        info!(
            volume = self.id,
            watermark,
            new_size = new_offset,
            "compaction scan complete"
        );
        *compacting = Some(CompactScratch {
            dat_path,
            idx_path,
            watermark,
            new_offset,
        });
        Ok(())
    }

    /// Compaction phase 2: replay the tail written since phase 1, swap the
    /// scratch files into place, reload the index. Returns reclaimed bytes.
    pub fn commit_compact(&self) -> Result<u64> {
        let mut compacting = self.compacting.lock();
        let scratch = compacting.take().ok_or(Error::NotCompacting(self.id))?;

        // Block appends for the tail replay and the swap.
        let mut appender = self.appender.lock();
        let old_size = appender.append_offset;
        let version = self.super_block.read().version;

        let mut dat_out = OpenOptions::new().append(true).open(&scratch.dat_path)?;
        let mut idx_out = OpenOptions::new().append(true).open(&scratch.idx_path)?;
        let mut new_offset = scratch.new_offset;
        {
            let dat = self.dat.read();
            let mut tail = scratch.watermark;
            while tail < old_size {
                let (needle, disk) = read_record_at(&dat, tail, old_size, version)?;
                let bytes = {
                    let mut buf = vec![0u8; disk as usize];
                    dat.read_exact_at(&mut buf, tail)?;
                    buf
                };
                dat_out.write_all(&bytes)?;
                let record = if needle.is_tombstone() {
                    idx_record(needle.id, IndexEntry::new(0, index::TOMBSTONE_SIZE))
                } else {
                    idx_record(
                        needle.id,
                        IndexEntry::new(
                            (new_offset / NEEDLE_PADDING as u64) as u32,
                            needle.encoded_len(),
                        ),
                    )
                };
                idx_out.write_all(&record)?;
                new_offset += disk as u64;
                tail += disk as u64;
            }
        }
        dat_out.sync_all()?;
        idx_out.sync_all()?;

        let dat_path = dat_file_name(&self.dir, &self.collection, self.id);
        let idx_path = idx_file_name(&self.dir, &self.collection, self.id);
        std::fs::rename(&scratch.dat_path, &dat_path)?;
        std::fs::rename(&scratch.idx_path, &idx_path)?;

        // Reopen and reload from the swapped files.
        let dat = OpenOptions::new().read(true).write(true).open(&dat_path)?;
        let mut journal = Vec::new();
        let mut idx_file = OpenOptions::new().read(true).append(true).open(&idx_path)?;
        idx_file.read_to_end(&mut journal)?;
        let loaded = index::load(self.options.index_kind, &journal);

        *self.dat.write() = dat;
        *self.index.write() = loaded.index;
        appender.idx_file = idx_file;
        appender.idx_len = journal.len() as u64;
        appender.append_offset = new_offset;
        appender.stats = loaded.stats;
        self.super_block.write().compact_revision += 1;

        let reclaimed = old_size.saturating_sub(new_offset);
        info!(
            volume = self.id,
            reclaimed,
            compact_revision = self.super_block.read().compact_revision,
            "compaction committed"
        );
        Ok(reclaimed)
    }

    /// Discard phase-1 scratch files without committing.
    pub fn abort_compact(&self) -> Result<()> {
        if let Some(scratch) = self.compacting.lock().take() {
            let _ = std::fs::remove_file(&scratch.dat_path);
            let _ = std::fs::remove_file(&scratch.idx_path);
            debug!(volume = self.id, "compaction aborted");
        }
        Ok(())
    }

    /// Delete the volume's files. The volume must not be used afterwards.
    pub fn destroy(&self) -> Result<()> {
        let _ = self.abort_compact();
        std::fs::remove_file(dat_file_name(&self.dir, &self.collection, self.id))?;
        std::fs::remove_file(idx_file_name(&self.dir, &self.collection, self.id))?;
        Ok(())
    }
}

/// `<dir>/[<collection>_]<id>.dat`
pub fn dat_file_name(dir: &Path, collection: &str, id: VolumeId) -> PathBuf {
    dir.join(format!("{}.dat", base_name(collection, id)))
}

/// `<dir>/[<collection>_]<id>.idx`
pub fn idx_file_name(dir: &Path, collection: &str, id: VolumeId) -> PathBuf {
    dir.join(format!("{}.idx", base_name(collection, id)))
}

fn scratch_path(dir: &Path, collection: &str, id: VolumeId, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", base_name(collection, id), ext))
}

fn base_name(collection: &str, id: VolumeId) -> String {
    if collection.is_empty() {
        id.to_string()
    } else {
        format!("{}_{}", collection, id)
    }
}

/// Decode the record starting at `offset`, returning it with its padded
/// on-disk length. Reads the 16-byte header first to size the second read;
/// the window leaves room for the largest possible metadata section.
fn read_record_at(
    dat: &File,
    offset: u64,
    file_len: u64,
    version: u8,
) -> std::result::Result<(Needle, u32), needlehouse_core::Error> {
    const MAX_META: u64 = 1 + (1 + 255) + (1 + 255) + 5 + 2 + 4;
    if offset + 16 > file_len {
        return Err(needlehouse_core::Error::Corrupt(
            "record header past end of file".into(),
        ));
    }
    let mut header = [0u8; 16];
    dat.read_exact_at(&mut header, offset)?;
    let data_size = u32::from_be_bytes(header[12..16].try_into().unwrap()) as u64;
    if offset + 16 + data_size > file_len {
        return Err(needlehouse_core::Error::Corrupt(
            "declared data size exceeds file".into(),
        ));
    }
    let window = (16 + data_size + MAX_META).min(file_len - offset);
    let mut buf = vec![0u8; window as usize];
    dat.read_exact_at(&mut buf, offset)?;
    let needle = Needle::decode(&buf, version)?;
    let disk = padded_size(needle.encoded_len());
    if offset + disk as u64 > file_len {
        return Err(needlehouse_core::Error::Corrupt(
            "record padding truncated".into(),
        ));
    }
    Ok((needle, disk))
}
