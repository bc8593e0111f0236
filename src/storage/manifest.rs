use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StorageResult;

const HEAD_LEN: usize = 8 + 4;
/// Sanity bound while recovering; the record is a handful of small fields.
const MAX_RECORD_LEN: u32 = 1024 * 1024;

/// Durable Raft metadata carried inside the manifest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RaftMeta {
    pub current_term: u64,
    pub voted_for_ip: String,
    pub voted_for_port: u32,
}

impl RaftMeta {
    pub fn voted_for(&self) -> Option<(&str, u32)> {
        if self.voted_for_ip.is_empty() {
            None
        } else {
            Some((&self.voted_for_ip, self.voted_for_port))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ManifestData {
    pub raft: RaftMeta,
    pub entries_start: u64,
    pub entries_end: u64,
}

/// The single metadata file of the log directory. One record at offset 0,
/// rewritten in place on every update:
/// `[ log_number: u64 ][ length: u32 ][ serialized_metadata: length bytes ]`.
pub struct Manifest {
    path: PathBuf,
    file: Arc<File>,
    pub log_number: u64,
    pub data: ManifestData,
}

impl Manifest {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Manifest> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Manifest {
            path,
            file: Arc::new(file),
            log_number: 0,
            data: ManifestData {
                raft: RaftMeta {
                    current_term: 1,
                    voted_for_ip: String::new(),
                    voted_for_port: 0,
                },
                entries_start: 0,
                entries_end: 0,
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file_handle(&self) -> Arc<File> {
        self.file.clone()
    }

    /// Reset the metadata to its initial state. The segment number is left
    /// alone; it only ever moves through rotation and truncation.
    pub fn clear(&mut self) {
        self.data = ManifestData {
            raft: RaftMeta {
                current_term: 1,
                voted_for_ip: String::new(),
                voted_for_port: 0,
            },
            entries_start: 0,
            entries_end: 0,
        };
    }

    /// Read the record back. Returns false when the record is short or does
    /// not parse; the caller falls back to [`Manifest::clear`], so a torn
    /// in-place rewrite costs the metadata, never the startup.
    pub fn recover(&mut self) -> bool {
        let mut head = [0u8; HEAD_LEN];
        if self.file.read_exact_at(&mut head, 0).is_err() {
            return false;
        }
        let log_number = u64::from_le_bytes(head[0..8].try_into().unwrap());
        let length = u32::from_le_bytes(head[8..12].try_into().unwrap());
        if length == 0 || length > MAX_RECORD_LEN {
            return false;
        }

        let mut payload = vec![0u8; length as usize];
        if self
            .file
            .read_exact_at(&mut payload, HEAD_LEN as u64)
            .is_err()
        {
            return false;
        }

        match bincode::decode_from_slice(&payload, bincode::config::standard()) {
            Ok((data, _)) => {
                self.log_number = log_number;
                self.data = data;
                true
            }
            Err(err) => {
                warn!("manifest record does not parse: {}", err);
                false
            }
        }
    }

    /// Set the persisted entry range and save.
    pub fn update(&mut self, entries_start: u64, entries_end: u64) -> StorageResult<()> {
        self.data.entries_start = entries_start;
        self.data.entries_end = entries_end;
        self.save()
    }

    /// Rewrite the whole record at offset 0, then flush.
    pub fn save(&mut self) -> StorageResult<()> {
        let payload = bincode::encode_to_vec(&self.data, bincode::config::standard())
            .map_err(|e| crate::error::StorageError::Corruption(format!("manifest encode: {}", e)))?;

        let mut buf = Vec::with_capacity(HEAD_LEN + payload.len());
        buf.extend_from_slice(&self.log_number.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        self.file.write_all_at(&buf, 0)?;
        self.file.sync_data()?;
        Ok(())
    }
}
