use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::StorageResult;
use crate::message::Entry;
use crate::storage::manifest::{Manifest, RaftMeta};
use crate::storage::memlog::MemoryLog;
use crate::storage::table::{Header, Table};

const MANIFEST_NAME: &str = "manifest";
const LOG_SUFFIX: &str = "floyd.log";
/// Rotate the active segment once it grows past this many bytes.
const SEGMENT_SPLIT_SIZE: u64 = 1024 * 1024;

fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:010}.{}", number, LOG_SUFFIX))
}

fn parse_log_number(name: &str) -> Option<u64> {
    name.strip_suffix(&format!(".{}", LOG_SUFFIX))?.parse().ok()
}

struct Inner {
    memory_log: MemoryLog,
    manifest: Manifest,
    table: Table,
}

/// Durable, segmented log: the active segment [`Table`], the [`Manifest`]
/// and the in-memory [`MemoryLog`] mirror, kept mutually consistent.
///
/// Readers take the shared guard (`last_log_index`, `get_entry`) and
/// tolerate concurrent tail growth; every mutation holds the exclusive
/// guard.
pub struct FileLog {
    path: PathBuf,
    inner: RwLock<Inner>,
    current_sync: Mutex<LogSync>,
}

impl FileLog {
    /// Open the log directory and recover term, vote and entries from it.
    ///
    /// A missing manifest means first boot: segment #1 is created and an
    /// initial manifest written. Otherwise every segment file is replayed
    /// in name order against the manifest's persisted entry range; stale
    /// segments are deleted, unparseable tails are dropped with a warning
    /// and the surviving prefix is used.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<FileLog> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let manifest_path = dir.join(MANIFEST_NAME);
        let inner = if !manifest_path.exists() {
            let mut manifest = Manifest::open(&manifest_path)?;
            manifest.log_number += 1;
            let table = Table::open(log_file_name(&dir, manifest.log_number))?;
            manifest.save()?;
            info!(path = ?dir, "initialized fresh log directory");
            Inner {
                memory_log: MemoryLog::new(),
                manifest,
                table,
            }
        } else {
            let mut manifest = Manifest::open(&manifest_path)?;
            if !manifest.recover() {
                warn!(path = ?manifest_path, "manifest unreadable, falling back to defaults");
                manifest.clear();
            }

            let mut names: Vec<String> = fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| name.ends_with(LOG_SUFFIX))
                .collect();
            // Zero-padded ten digit numbers: lexicographic order is numeric
            // order.
            names.sort();

            let mut memory_log = MemoryLog::new();
            let mut active: Option<Table> = None;
            let mut expected_next = manifest.data.entries_start.max(1);

            for name in names {
                let path = dir.join(&name);
                match Self::recover_from_file(
                    &path,
                    manifest.data.entries_start,
                    manifest.data.entries_end,
                    &mut memory_log,
                    &mut expected_next,
                ) {
                    Ok(Some(table)) => {
                        if let Some(number) = parse_log_number(&name) {
                            manifest.log_number = number;
                        }
                        active = Some(table);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(path = ?path, "segment skipped during recovery: {}", err);
                    }
                }
            }

            let table = match active {
                Some(table) => table,
                None => {
                    manifest.log_number += 1;
                    Table::open(log_file_name(&dir, manifest.log_number))?
                }
            };

            manifest.update(memory_log.start_log_index(), memory_log.last_log_index())?;
            info!(
                last_log_index = memory_log.last_log_index(),
                log_number = manifest.log_number,
                term = manifest.data.raft.current_term,
                "recovered log directory"
            );
            Inner {
                memory_log,
                manifest,
                table,
            }
        };

        let current_sync = LogSync {
            last_index: inner.memory_log.last_log_index(),
            table_file: inner.table.file_handle(),
            manifest_file: inner.manifest.file_handle(),
        };
        Ok(FileLog {
            path: dir,
            inner: RwLock::new(inner),
            current_sync: Mutex::new(current_sync),
        })
    }

    /// Replay one segment file. A segment whose header range lies entirely
    /// outside the manifest's `[entries_start, entries_end]` is stale and
    /// deleted. Otherwise records with ids inside the range are admitted in
    /// order; anything after the first unparseable or non-contiguous record
    /// is a lost tail and gets trimmed off the segment.
    fn recover_from_file(
        path: &Path,
        entries_start: u64,
        entries_end: u64,
        memory_log: &mut MemoryLog,
        expected_next: &mut u64,
    ) -> StorageResult<Option<Table>> {
        let mut table = Table::open(path)?;

        if table.header().entry_start > entries_end || table.header().entry_end < entries_start {
            drop(table);
            fs::remove_file(path)?;
            info!(path = ?path, "deleted stale segment");
            return Ok(None);
        }

        let mut admitted_end = crate::storage::table::HEADER_LEN;
        let mut admitted_any = false;
        {
            let mut cursor = table.cursor();
            let mut step = cursor.seek_to_first();
            loop {
                if let Err(err) = step {
                    warn!(path = ?path, "segment replay stopped: {}", err);
                    break;
                }
                let Some(rec) = cursor.record() else { break };
                if rec.entry_id < entries_start || rec.entry_id > entries_end {
                    step = cursor.next();
                    continue;
                }
                if rec.entry_id != *expected_next {
                    warn!(
                        path = ?path,
                        entry_id = rec.entry_id,
                        expected = *expected_next,
                        "segment replay stopped at non-contiguous record"
                    );
                    break;
                }
                match rec.entry() {
                    Ok(entry) => {
                        admitted_end = rec.start
                            + (crate::storage::table::ID_LEN
                                + 2 * crate::storage::table::OFFSET_LEN
                                + rec.length as usize) as u64;
                        admitted_any = true;
                        memory_log.append(vec![entry]);
                        *expected_next += 1;
                    }
                    Err(err) => {
                        warn!(path = ?path, "segment replay stopped: {}", err);
                        break;
                    }
                }
                step = cursor.next();
            }
        }

        // Trim whatever the replay did not admit so the header matches the
        // surviving prefix again.
        if table.header().filesize > admitted_end {
            let entry_end = if admitted_any {
                *expected_next - 1
            } else {
                table.header().entry_start.saturating_sub(1)
            };
            warn!(
                path = ?path,
                filesize = table.header().filesize,
                admitted_end,
                "dropping lost segment tail"
            );
            table.shrink_to(admitted_end, entry_end)?;
        }

        Ok(Some(table))
    }

    /// Append entries to the in-memory index and the active segment, then
    /// persist the manifest's range and raft metadata. Returns the inclusive
    /// range of appended indices. On an I/O failure the in-memory index is
    /// rolled back to the durable tail before the error is surfaced.
    pub fn append(&self, entries: Vec<Entry>) -> StorageResult<(u64, u64)> {
        let mut inner = self.inner.write();

        let (first, last) = inner.memory_log.append(entries);
        for index in first..=last {
            let entry = inner.memory_log.get_entry(index).clone();
            if let Err(err) = inner.table.append_entry(index, &entry) {
                error!(index, "append to segment failed: {}", err);
                // Roll back to the durable tail so memlog, manifest and
                // segment agree again.
                inner.memory_log.truncate_suffix(index - 1);
                let (start, end) = (
                    inner.memory_log.start_log_index(),
                    inner.memory_log.last_log_index(),
                );
                if let Err(err) = inner.manifest.update(start, end) {
                    warn!("manifest rollback failed: {}", err);
                }
                return Err(err);
            }
        }

        let (start, end) = (
            inner.memory_log.start_log_index(),
            inner.memory_log.last_log_index(),
        );
        inner.manifest.update(start, end)?;
        self.split_locked(&mut inner)?;
        Ok((first, last))
    }

    /// Rotate the active segment once it exceeds the split threshold.
    pub fn split_if_needed(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        self.split_locked(&mut inner)
    }

    fn split_locked(&self, inner: &mut Inner) -> StorageResult<()> {
        if inner.table.header().filesize <= SEGMENT_SPLIT_SIZE {
            return Ok(());
        }

        let next = inner.table.header().entry_end + 1;
        inner.table.sync()?;

        inner.manifest.log_number += 1;
        let mut table = Table::open(log_file_name(&self.path, inner.manifest.log_number))?;
        table.set_range(next, next)?;
        debug!(
            log_number = inner.manifest.log_number,
            entry_start = next,
            "rotated to new segment"
        );
        inner.table = table;

        // The pending durability handle must cover the new active segment;
        // the old one was synced above.
        *self.current_sync.lock() = LogSync {
            last_index: inner.memory_log.last_log_index(),
            table_file: inner.table.file_handle(),
            manifest_file: inner.manifest.file_handle(),
        };
        Ok(())
    }

    /// Drop every entry with index greater than `last_kept`: the in-memory
    /// index first, then the manifest, then the segment files walked
    /// backward. Whole segments above the cut are deleted (always keeping
    /// one open segment); the boundary segment is trimmed frame by frame
    /// through the reverse cursor.
    pub fn truncate_suffix(&self, last_kept: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();

        let mut current_index = inner.memory_log.last_log_index();
        if last_kept >= current_index {
            return Ok(());
        }

        inner.memory_log.truncate_suffix(last_kept);
        let (start, end) = (
            inner.memory_log.start_log_index(),
            inner.memory_log.last_log_index(),
        );
        inner.manifest.update(start, end)?;

        while current_index > last_kept {
            if inner.table.header().entry_start >= last_kept + 1 {
                let number = inner.manifest.log_number;
                let path = log_file_name(&self.path, number);
                fs::remove_file(&path)?;
                info!(path = ?path, "deleted truncated segment");

                if number == 1 {
                    // Never step below segment #1; reopen it empty.
                    inner.table = Table::open(&path)?;
                    break;
                }
                inner.manifest.log_number = number - 1;
                let table = Table::open(log_file_name(&self.path, number - 1))?;
                current_index = table.header().entry_end;
                inner.table = table;
            } else {
                loop {
                    let mut cursor = inner.table.cursor();
                    cursor.seek_to_last()?;
                    match cursor.record() {
                        None => break,
                        Some(rec) if rec.entry_id <= last_kept => break,
                        Some(_) => cursor.truncate_entry()?,
                    }
                }
                current_index = inner.table.header().entry_end;
            }
        }

        inner.manifest.save()?;
        inner.table.sync()?;
        Ok(())
    }

    /// Swap out the pending durability handle. After `wait()` returns on the
    /// swapped-out handle, every entry appended before this call is durable.
    pub fn take_sync(&self) -> LogSync {
        let inner = self.inner.read();
        let fresh = LogSync {
            last_index: inner.memory_log.last_log_index(),
            table_file: inner.table.file_handle(),
            manifest_file: inner.manifest.file_handle(),
        };
        std::mem::replace(&mut *self.current_sync.lock(), fresh)
    }

    /// Replace the manifest's raft metadata and persist it, so term and vote
    /// survive a restart.
    pub fn set_raft_meta(&self, meta: RaftMeta) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.manifest.data.raft = meta;
        inner.manifest.save()
    }

    pub fn raft_meta(&self) -> RaftMeta {
        self.inner.read().manifest.data.raft.clone()
    }

    /// Persist the current in-memory range together with the raft metadata.
    pub fn update_metadata(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let (start, end) = (
            inner.memory_log.start_log_index(),
            inner.memory_log.last_log_index(),
        );
        inner.manifest.update(start, end)
    }

    pub fn get_entry(&self, index: u64) -> Entry {
        self.inner.read().memory_log.get_entry(index).clone()
    }

    pub fn last_log_index(&self) -> u64 {
        self.inner.read().memory_log.last_log_index()
    }

    pub fn start_log_index(&self) -> u64 {
        self.inner.read().memory_log.start_log_index()
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.read().memory_log.size_bytes()
    }

    pub fn log_number(&self) -> u64 {
        self.inner.read().manifest.log_number
    }

    /// Persisted `[entries_start, entries_end]` as of the last manifest save.
    pub fn persisted_range(&self) -> (u64, u64) {
        let inner = self.inner.read();
        (
            inner.manifest.data.entries_start,
            inner.manifest.data.entries_end,
        )
    }

    /// Header of the active segment.
    pub fn active_segment_header(&self) -> Header {
        *self.inner.read().table.header()
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        let mut inner = self.inner.write();
        let (start, end) = (
            inner.memory_log.start_log_index(),
            inner.memory_log.last_log_index(),
        );
        if let Err(err) = inner.manifest.update(start, end) {
            warn!("manifest update on shutdown failed: {}", err);
        }
        if let Err(err) = inner.table.sync() {
            warn!("segment sync on shutdown failed: {}", err);
        }
    }
}

/// Durability handle returned by [`FileLog::take_sync`].
pub struct LogSync {
    last_index: u64,
    table_file: Arc<File>,
    manifest_file: Arc<File>,
}

impl LogSync {
    /// Highest index covered by this handle.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Block until everything appended before the handle was taken is on
    /// durable storage.
    pub fn wait(&self) -> StorageResult<()> {
        self.table_file.sync_data()?;
        self.manifest_file.sync_data()?;
        Ok(())
    }
}
