//! Durable log storage.
//!
//! The log lives in one directory: a `manifest` file naming the active
//! segment and carrying the persisted entry range plus raft metadata, and
//! one or more append-only segment files holding framed entries.
//!
//! - `table`: one segment file with header, framing and cursors
//! - `manifest`: the single metadata record
//! - `memlog`: the in-memory mirror of the durable tail
//! - `file_log`: recovery, append, rotation and truncation over all three

mod file_log;
mod manifest;
mod memlog;
mod table;

pub use file_log::{FileLog, LogSync};
pub use manifest::{Manifest, ManifestData, RaftMeta};
pub use memlog::MemoryLog;
pub use table::{Header, Record, Table, TableCursor, HEADER_LEN};
