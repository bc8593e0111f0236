use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::error::StorageResult;
use crate::options::Options;
use crate::storage::{FileLog, RaftMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct ContextInner {
    role: Role,
    current_term: u64,
    voted_for: Option<(String, u32)>,
    commit_index: u64,
    votes_granted: u64,
}

/// Process-wide mutable consensus state: role, current term, vote and commit
/// bookkeeping. Every method takes the internal guard and returns an owned
/// snapshot, so readers observe a consistent view within a single call; any
/// observer acting on a snapshot after a suspension point must re-check.
///
/// Term and vote changes are persisted through the log's manifest before the
/// method returns, which keeps `current_term` monotonic across restarts.
pub struct Context {
    options: Options,
    log: Arc<FileLog>,
    inner: Mutex<ContextInner>,
}

impl Context {
    pub fn new(options: Options, log: Arc<FileLog>) -> Context {
        let meta = log.raft_meta();
        let voted_for = meta
            .voted_for()
            .map(|(ip, port)| (ip.to_string(), port));
        Context {
            options,
            log,
            inner: Mutex::new(ContextInner {
                role: Role::Follower,
                current_term: meta.current_term,
                voted_for,
                commit_index: 0,
                votes_granted: 0,
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.lock().commit_index
    }

    pub fn voted_for(&self) -> Option<(String, u32)> {
        self.inner.lock().voted_for.clone()
    }

    pub fn local_ip(&self) -> &str {
        &self.options.local_ip
    }

    pub fn local_port(&self) -> u32 {
        self.options.local_port
    }

    pub fn heartbeat_us(&self) -> u64 {
        self.options.heartbeat_us
    }

    pub fn append_entries_size_once(&self) -> u64 {
        self.options.append_entries_size_once
    }

    /// Majority of the cluster, self included.
    pub fn quorum(&self) -> u64 {
        (self.options.peers.len() as u64 + 1) / 2 + 1
    }

    /// Count one granted vote. Returns true exactly when the count first
    /// reaches quorum, so promotion is enqueued once per election.
    pub fn vote_and_check(&self, res_term: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.role != Role::Candidate || res_term != inner.current_term {
            return false;
        }
        inner.votes_granted += 1;
        inner.votes_granted == self.quorum()
    }

    /// Enter a new election: bump the term, vote for self, count that vote.
    pub fn become_candidate(&self) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        inner.current_term += 1;
        inner.role = Role::Candidate;
        inner.voted_for = Some((self.options.local_ip.clone(), self.options.local_port));
        inner.votes_granted = 1;
        let term = inner.current_term;
        self.persist(&inner)?;
        info!(term, "became candidate");
        Ok(term)
    }

    /// Adopt a higher term and demote. The term never decreases; a stale
    /// `term` argument still forces the role to follower.
    pub fn become_follower(&self, term: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if term > inner.current_term {
            inner.current_term = term;
            inner.voted_for = None;
        }
        inner.role = Role::Follower;
        inner.votes_granted = 0;
        let current_term = inner.current_term;
        self.persist(&inner)?;
        info!(term = current_term, "became follower");
        Ok(())
    }

    pub fn become_leader(&self) {
        let mut inner = self.inner.lock();
        inner.role = Role::Leader;
        info!(term = inner.current_term, "became leader");
    }

    /// Monotonic advance; a lower value is ignored.
    pub fn set_commit_index(&self, index: u64) {
        let mut inner = self.inner.lock();
        if index > inner.commit_index {
            inner.commit_index = index;
        }
    }

    fn persist(&self, inner: &ContextInner) -> StorageResult<()> {
        let (voted_for_ip, voted_for_port) = inner
            .voted_for
            .clone()
            .unwrap_or_else(|| (String::new(), 0));
        self.log.set_raft_meta(RaftMeta {
            current_term: inner.current_term,
            voted_for_ip,
            voted_for_port,
        })
    }
}
