use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Payload classification of a replicated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum EntryKind {
    Data,
    Noop,
    Config,
}

/// One replicated record. The index is implicit from the entry's position
/// in the log; indices are 1-based, dense and strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Entry {
    pub term: u64,
    pub kind: EntryKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn data(term: u64, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            kind: EntryKind::Data,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn noop(term: u64) -> Self {
        Self {
            term,
            kind: EntryKind::Noop,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Serialized length of this entry on the wire and on disk.
    pub fn encoded_len(&self) -> usize {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|buf| buf.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct RequestVoteRequest {
    pub ip: String,
    pub port: u32,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct AppendEntriesRequest {
    pub ip: String,
    pub port: u32,
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct AppendEntriesResponse {
    pub term: u64,
    /// true = accepted (log prefix matched; entries appended or already
    /// present), false = rejected (prev mismatch).
    pub status: bool,
}

/// Tagged request union carried by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub enum Request {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

/// Tagged response union mirroring [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub enum Response {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}
