use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::message::Entry;

pub const ID_LEN: usize = 8;
pub const OFFSET_LEN: usize = 4;
/// entry_start + entry_end + filesize, little-endian.
pub const HEADER_LEN: u64 = 24;
/// Frames at most this large are serialized through a stack scratch buffer;
/// larger ones take a transient heap allocation.
const SCRATCH_LEN: usize = 4096;

/// Segment header, kept in memory and rewritten on every successful append.
/// `filesize` is the total valid byte length including the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub entry_start: u64,
    pub entry_end: u64,
    pub filesize: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(&self.entry_start.to_le_bytes());
        buf[8..16].copy_from_slice(&self.entry_end.to_le_bytes());
        buf[16..24].copy_from_slice(&self.filesize.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Self {
        Self {
            entry_start: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            entry_end: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            filesize: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// One framed record as seen by a cursor.
///
/// On-disk frame layout:
/// `[ id: u64 ][ length: u32 ][ payload: length bytes ][ back_offset: u32 ]`
/// where `back_offset == ID_LEN + OFFSET_LEN + length`, so a reverse cursor
/// can step back by reading the trailing four bytes.
#[derive(Debug, Clone)]
pub struct Record {
    pub entry_id: u64,
    pub length: u32,
    pub payload: Vec<u8>,
    /// File offset of the frame's first byte.
    pub start: u64,
}

impl Record {
    fn frame_len(&self) -> u64 {
        (ID_LEN + OFFSET_LEN + self.length as usize + OFFSET_LEN) as u64
    }

    pub fn entry(&self) -> StorageResult<Entry> {
        let (entry, _) = bincode::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| {
                StorageError::Corruption(format!(
                    "record {} payload does not parse: {}",
                    self.entry_id, e
                ))
            })?;
        Ok(entry)
    }
}

/// Random-access segment file holding a fixed header and a sequence of
/// framed entry records. Appends are O(1) at the tail; the frame is
/// self-delimiting in both directions.
pub struct Table {
    path: PathBuf,
    file: Arc<File>,
    header: Header,
}

impl Table {
    /// Open a segment file. An existing file has its header read back; a
    /// missing or empty file gets a freshly initialized header. A short or
    /// unreadable header on an existing file is corruption, never silently
    /// zeroed.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Table> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let header = if len == 0 {
            let header = Header {
                entry_start: 0,
                entry_end: 0,
                filesize: HEADER_LEN,
            };
            file.write_all_at(&header.encode(), 0)?;
            header
        } else {
            if len < HEADER_LEN {
                return Err(StorageError::Corruption(format!(
                    "segment {:?} is {} bytes, shorter than its header",
                    path, len
                )));
            }
            let mut buf = [0u8; HEADER_LEN as usize];
            file.read_exact_at(&mut buf, 0)?;
            Header::decode(&buf)
        };

        Ok(Table {
            path,
            file: Arc::new(file),
            header,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file_handle(&self) -> Arc<File> {
        self.file.clone()
    }

    /// A segment with no live records. `entry_start`/`entry_end` may still
    /// carry the range preset by rotation.
    pub fn is_empty(&self) -> bool {
        self.header.filesize == HEADER_LEN
    }

    /// Preset the index range of a fresh segment created by rotation.
    pub fn set_range(&mut self, start: u64, end: u64) -> StorageResult<()> {
        let header = Header {
            entry_start: start,
            entry_end: end,
            filesize: self.header.filesize,
        };
        self.write_header(header)
    }

    /// Append one entry under the given index. The payload is written past
    /// `filesize` first; only a successful header rewrite makes it visible,
    /// so a partial append never advances `entry_end`. Returns total bytes
    /// written.
    pub fn append_entry(&mut self, index: u64, entry: &Entry) -> StorageResult<u64> {
        if self.is_empty() {
            if self.header.entry_start != 0 && index != self.header.entry_start {
                return Err(StorageError::InvalidArgument(format!(
                    "append index {} into empty segment expecting {}",
                    index, self.header.entry_start
                )));
            }
        } else if index != self.header.entry_end + 1 {
            return Err(StorageError::InvalidArgument(format!(
                "append index {} does not follow entry_end {}",
                index, self.header.entry_end
            )));
        }

        let payload = bincode::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StorageError::Corruption(format!("entry {} encode: {}", index, e)))?;
        let length = payload.len();
        let frame_len = ID_LEN + OFFSET_LEN + length + OFFSET_LEN;

        let mut heap;
        let mut stack = [0u8; SCRATCH_LEN];
        let frame: &mut [u8] = if frame_len <= SCRATCH_LEN {
            &mut stack[..frame_len]
        } else {
            heap = vec![0u8; frame_len];
            &mut heap
        };

        let back_offset = (ID_LEN + OFFSET_LEN + length) as u32;
        frame[0..8].copy_from_slice(&index.to_le_bytes());
        frame[8..12].copy_from_slice(&(length as u32).to_le_bytes());
        frame[12..12 + length].copy_from_slice(&payload);
        frame[12 + length..].copy_from_slice(&back_offset.to_le_bytes());

        self.file.write_all_at(frame, self.header.filesize)?;

        let header = Header {
            entry_start: if self.header.entry_start == 0 {
                index
            } else {
                self.header.entry_start
            },
            entry_end: index,
            filesize: self.header.filesize + frame_len as u64,
        };
        self.write_header(header)?;

        debug!(
            index,
            length, filesize = self.header.filesize, "appended entry to segment"
        );
        Ok(frame_len as u64)
    }

    /// Rewrite the header so only the surviving prefix is visible; used by
    /// recovery to drop a lost tail.
    pub(crate) fn shrink_to(&mut self, filesize: u64, entry_end: u64) -> StorageResult<()> {
        let header = Header {
            entry_start: self.header.entry_start,
            entry_end,
            filesize,
        };
        self.write_header(header)
    }

    /// Flush the underlying file to durable storage.
    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn cursor(&mut self) -> TableCursor<'_> {
        TableCursor {
            table: self,
            rec: None,
        }
    }

    fn write_header(&mut self, header: Header) -> StorageResult<()> {
        self.file.write_all_at(&header.encode(), 0)?;
        self.header = header;
        Ok(())
    }

    /// Read and validate the frame starting at `start`.
    fn read_record(&self, start: u64) -> StorageResult<Record> {
        let fixed = (ID_LEN + OFFSET_LEN) as u64;
        if start < HEADER_LEN || start + fixed > self.header.filesize {
            return Err(StorageError::Corruption(format!(
                "record offset {} outside segment bounds ({}..{})",
                start, HEADER_LEN, self.header.filesize
            )));
        }

        let mut head = [0u8; ID_LEN + OFFSET_LEN];
        self.file.read_exact_at(&mut head, start)?;
        let entry_id = u64::from_le_bytes(head[0..8].try_into().unwrap());
        let length = u32::from_le_bytes(head[8..12].try_into().unwrap());

        let frame_len = fixed + length as u64 + OFFSET_LEN as u64;
        if start + frame_len > self.header.filesize {
            return Err(StorageError::Corruption(format!(
                "record {} at offset {} runs past filesize {}",
                entry_id, start, self.header.filesize
            )));
        }

        let mut rest = vec![0u8; length as usize + OFFSET_LEN];
        self.file.read_exact_at(&mut rest, start + fixed)?;
        let back_offset =
            u32::from_le_bytes(rest[length as usize..].try_into().unwrap());
        if back_offset as u64 != fixed + length as u64 {
            return Err(StorageError::Corruption(format!(
                "record {} back pointer {} does not match frame length {}",
                entry_id,
                back_offset,
                fixed + length as u64
            )));
        }
        rest.truncate(length as usize);

        Ok(Record {
            entry_id,
            length,
            payload: rest,
            start,
        })
    }

    /// Locate the last record by its trailing back pointer.
    fn read_last_record(&self) -> StorageResult<Option<Record>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut buf = [0u8; OFFSET_LEN];
        self.file
            .read_exact_at(&mut buf, self.header.filesize - OFFSET_LEN as u64)?;
        let back_offset = u32::from_le_bytes(buf) as u64;
        let frame_len = back_offset + OFFSET_LEN as u64;
        if frame_len + HEADER_LEN > self.header.filesize {
            return Err(StorageError::Corruption(format!(
                "trailing back pointer {} reaches before the segment header",
                back_offset
            )));
        }
        let start = self.header.filesize - frame_len;
        Ok(Some(self.read_record(start)?))
    }
}

/// Forward and reverse cursor over a segment's framed records.
pub struct TableCursor<'a> {
    table: &'a mut Table,
    rec: Option<Record>,
}

impl TableCursor<'_> {
    pub fn record(&self) -> Option<&Record> {
        self.rec.as_ref()
    }

    pub fn seek_to_first(&mut self) -> StorageResult<()> {
        self.rec = if self.table.is_empty() {
            None
        } else {
            Some(self.table.read_record(HEADER_LEN)?)
        };
        Ok(())
    }

    pub fn seek_to_last(&mut self) -> StorageResult<()> {
        self.rec = self.table.read_last_record()?;
        Ok(())
    }

    /// Advance past the current record; positions at `None` after the tail.
    pub fn next(&mut self) -> StorageResult<()> {
        let Some(rec) = self.rec.take() else {
            return Ok(());
        };
        let end = rec.start + rec.frame_len();
        if end < self.table.header.filesize {
            self.rec = Some(self.table.read_record(end)?);
        }
        Ok(())
    }

    /// Step back via the previous record's trailing back pointer.
    pub fn prev(&mut self) -> StorageResult<()> {
        let Some(rec) = self.rec.take() else {
            return Ok(());
        };
        if rec.start <= HEADER_LEN {
            return Ok(());
        }
        let mut buf = [0u8; OFFSET_LEN];
        self.table
            .file
            .read_exact_at(&mut buf, rec.start - OFFSET_LEN as u64)?;
        let back_offset = u32::from_le_bytes(buf) as u64;
        let frame_len = back_offset + OFFSET_LEN as u64;
        if frame_len + HEADER_LEN > rec.start {
            return Err(StorageError::Corruption(format!(
                "back pointer {} before offset {} reaches outside the segment",
                back_offset, rec.start
            )));
        }
        self.rec = Some(self.table.read_record(rec.start - frame_len)?);
        Ok(())
    }

    /// Drop the current record off the tail: lower `filesize` to the
    /// record's first byte and step `entry_end` back. The cursor is left
    /// unpositioned; callers re-seek.
    pub fn truncate_entry(&mut self) -> StorageResult<()> {
        let Some(rec) = self.rec.take() else {
            return Err(StorageError::InvalidArgument(
                "truncate_entry on an unpositioned cursor".to_string(),
            ));
        };
        let header = Header {
            entry_start: self.table.header.entry_start,
            entry_end: self.table.header.entry_end - 1,
            filesize: rec.start,
        };
        self.table.write_header(header)
    }
}
