use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime options consumed by the context and the durable log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Directory holding the manifest and the log segments.
    pub path: PathBuf,
    /// Leader heartbeat period, in microseconds.
    pub heartbeat_us: u64,
    /// Soft cap on the serialized size of one AppendEntries request.
    /// At least one entry is always sent regardless of this cap.
    pub append_entries_size_once: u64,
    /// Randomized election timeout range in milliseconds, consumed by the
    /// election coordinator.
    pub elect_timeout_ms: (u64, u64),
    /// Address this node announces in outgoing requests.
    pub local_ip: String,
    pub local_port: u32,
    /// Remote peer addresses, `ip:port`. Quorum is computed over
    /// `peers.len() + 1` (self included).
    pub peers: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/log"),
            heartbeat_us: 100_000,
            append_entries_size_once: 1024 * 1024,
            elect_timeout_ms: (1000, 2000),
            local_ip: "127.0.0.1".to_string(),
            local_port: 8901,
            peers: Vec::new(),
        }
    }
}
