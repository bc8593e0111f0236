//! Consensus core of a small replicated-log service.
//!
//! Two tightly coupled halves: a Raft-style per-peer replication runtime
//! (leader election, heartbeat, log replication, term reconciliation) and a
//! durable segmented log that lets a node recover its term, vote and
//! entries after a crash.
//!
//! The RPC transport and the primary coordinator are consumed through the
//! [`Transport`] and [`Primary`] traits; the [`Context`] carries the
//! process-wide role/term/commit state every worker shares.

pub mod context;
pub mod error;
pub mod message;
pub mod options;
pub mod peer;
pub mod primary;
pub mod storage;
pub mod transport;

pub use context::{Context, Role};
pub use error::{RaftError, RpcError, StorageError, StorageResult};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Entry, EntryKind, Request, RequestVoteRequest,
    RequestVoteResponse, Response,
};
pub use options::Options;
pub use peer::{Peer, PeerEnv, PeerTask};
pub use primary::{Primary, PrimaryTask};
pub use storage::{FileLog, LogSync, RaftMeta};
pub use transport::Transport;
