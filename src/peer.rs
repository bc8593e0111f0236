use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::{Context, Role};
use crate::error::{RaftError, RpcError};
use crate::message::{AppendEntriesRequest, Request, RequestVoteRequest, Response};
use crate::primary::{Primary, PrimaryTask};
use crate::storage::FileLog;
use crate::transport::Transport;

/// Tasks executed sequentially by one peer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTask {
    RequestVote,
    AppendEntries,
    HeartBeat,
    BecomeLeader,
    Shutdown,
}

/// Everything one peer worker runs against: the remote address and handles
/// to the shared context, log, coordinator and transport.
#[derive(Clone)]
pub struct PeerEnv {
    pub server: String,
    pub context: Arc<Context>,
    pub log: Arc<FileLog>,
    pub primary: Arc<dyn Primary>,
    pub pool: Arc<dyn Transport>,
}

/// Leader-side bookkeeping for one follower. Mutated only by this peer's
/// worker; the coordinator reads `match_index` under the same guard while
/// advancing the commit index.
#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: u64,
    match_index: u64,
}

/// Per-remote replication worker: a single-consumer task queue driving
/// vote solicitation, append/heartbeat rounds and the probe walk-back.
/// Tasks for the same peer never overlap.
pub struct Peer {
    env: PeerEnv,
    progress: Mutex<Progress>,
    task_tx: mpsc::UnboundedSender<PeerTask>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Spawn the worker loop and hand back the shared handle.
    pub fn start(env: PeerEnv) -> Arc<Peer> {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer {
            env,
            progress: Mutex::new(Progress {
                next_index: 1,
                match_index: 0,
            }),
            task_tx,
            worker: Mutex::new(None),
        });
        let runner = peer.clone();
        let handle = tokio::spawn(async move { runner.run(task_rx).await });
        *peer.worker.lock() = Some(handle);
        peer
    }

    pub fn server(&self) -> &str {
        &self.env.server
    }

    pub fn add_request_vote_task(&self) {
        self.schedule(PeerTask::RequestVote);
    }

    pub fn add_append_entries_task(&self) {
        self.schedule(PeerTask::AppendEntries);
    }

    pub fn add_become_leader_task(&self) {
        self.schedule(PeerTask::BecomeLeader);
    }

    /// Delayed schedule: one heartbeat, `heartbeat_us` from now.
    pub fn add_heart_beat_task(&self) {
        let task_tx = self.task_tx.clone();
        let delay = Duration::from_micros(self.env.context.heartbeat_us());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = task_tx.send(PeerTask::HeartBeat);
        });
    }

    /// Stop accepting leader work and join the worker once in-flight tasks
    /// have drained.
    pub async fn shutdown(&self) {
        let _ = self.task_tx.send(PeerTask::Shutdown);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn match_index(&self) -> u64 {
        self.progress.lock().match_index
    }

    pub fn next_index(&self) -> u64 {
        self.progress.lock().next_index
    }

    pub fn set_next_index(&self, next_index: u64) {
        self.progress.lock().next_index = next_index;
    }

    async fn run(self: Arc<Self>, mut task_rx: mpsc::UnboundedReceiver<PeerTask>) {
        while let Some(task) = task_rx.recv().await {
            match task {
                PeerTask::RequestVote => {
                    let result = self.request_vote().await;
                    self.log_outcome("request vote", result);
                }
                PeerTask::AppendEntries => {
                    let result = self.append_entries(false).await;
                    self.log_outcome("append entries", result);
                }
                PeerTask::HeartBeat => {
                    let result = self.append_entries(true).await;
                    self.log_outcome("heartbeat", result);
                    // Rescheduled unconditionally, demotion included; the
                    // role check at the top of the next round short-circuits.
                    self.add_heart_beat_task();
                }
                PeerTask::BecomeLeader => self.become_leader(),
                PeerTask::Shutdown => break,
            }
        }
        debug!(server = %self.env.server, "peer worker stopped");
    }

    fn log_outcome(&self, what: &str, result: Result<(), RaftError>) {
        match result {
            Ok(()) => {}
            Err(RaftError::Storage(err)) => {
                error!(server = %self.env.server, "{} failed: {}", what, err)
            }
            Err(err) => debug!(server = %self.env.server, "{} failed: {}", what, err),
        }
    }

    /// Leader transition for this peer's view: optimistic `next_index` at
    /// the local tail, `match_index` unknown, probe immediately.
    pub fn become_leader(&self) {
        {
            let mut progress = self.progress.lock();
            progress.next_index = self.env.log.last_log_index() + 1;
            progress.match_index = 0;
        }
        debug!(
            server = %self.env.server,
            next_index = self.next_index(),
            "peer reset for leadership"
        );
        self.schedule(PeerTask::HeartBeat);
    }

    /// Solicit this peer's vote. A no-op unless the local role is still
    /// candidate, both before sending and when the reply arrives.
    pub async fn request_vote(&self) -> Result<(), RaftError> {
        if self.env.context.role() != Role::Candidate {
            return Ok(());
        }

        let current_term = self.env.context.current_term();
        let last_log_index = self.env.log.last_log_index();
        let last_log_term = if last_log_index == 0 {
            0
        } else {
            self.env.log.get_entry(last_log_index).term
        };

        let request = Request::RequestVote(RequestVoteRequest {
            ip: self.env.context.local_ip().to_string(),
            port: self.env.context.local_port(),
            term: current_term,
            last_log_index,
            last_log_term,
        });
        debug!(server = %self.env.server, term = current_term, "sending vote request");

        let response = self.env.pool.send_and_recv(&self.env.server, request).await?;
        let Response::RequestVote(res) = response else {
            return Err(
                RpcError::Protocol("vote reply carries the wrong variant".to_string()).into(),
            );
        };

        if self.env.context.role() != Role::Candidate {
            return Ok(());
        }
        if res.granted {
            if self.env.context.vote_and_check(res.term) {
                self.env.primary.add_task(PrimaryTask::BecomeLeader);
            }
        } else if res.term > current_term {
            debug!(
                server = %self.env.server,
                res_term = res.term,
                current_term,
                "vote denied by a higher term"
            );
            // Adopt the term before the timer reset so a prompt heartbeat
            // from the new leader is accepted.
            let demoted = self.env.context.become_follower(res.term);
            self.env.primary.reset_elect_leader_timer();
            demoted?;
        }
        Ok(())
    }

    /// One append round toward this peer. A heartbeat carries no entries;
    /// otherwise entries from `next_index` on are batched greedily under the
    /// configured size cap, always at least one.
    pub async fn append_entries(&self, heartbeat: bool) -> Result<(), RaftError> {
        if self.env.context.role() != Role::Leader {
            return Ok(());
        }

        let next_index = self.progress.lock().next_index;
        let last_log_index = self.env.log.last_log_index();
        let prev_log_index = next_index - 1;
        if prev_log_index > last_log_index {
            return Err(RaftError::InvalidArgument(format!(
                "prev_log_index {} > last_log_index {}",
                prev_log_index, last_log_index
            )));
        }

        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.env.log.get_entry(prev_log_index).term
        };

        let mut entries = Vec::new();
        if !heartbeat {
            let size_once = self.env.context.append_entries_size_once();
            let mut request_size = 0u64;
            for index in next_index..=last_log_index {
                let entry = self.env.log.get_entry(index);
                request_size += entry.encoded_len() as u64;
                // The first entry always goes out, cap or no cap.
                if entries.is_empty() || request_size < size_once {
                    entries.push(entry);
                } else {
                    break;
                }
            }
        }
        let num_entries = entries.len() as u64;
        // Never advertise a commit above what the recipient will hold after
        // accepting this request.
        let commit_index = self
            .env
            .context
            .commit_index()
            .min(prev_log_index + num_entries);

        let request = Request::AppendEntries(AppendEntriesRequest {
            ip: self.env.context.local_ip().to_string(),
            port: self.env.context.local_port(),
            term: self.env.context.current_term(),
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
        });
        debug!(
            server = %self.env.server,
            heartbeat,
            num_entries,
            prev_log_index,
            "sending append entries"
        );

        let response = self.env.pool.send_and_recv(&self.env.server, request).await?;
        let Response::AppendEntries(res) = response else {
            return Err(
                RpcError::Protocol("append reply carries the wrong variant".to_string()).into(),
            );
        };

        if res.term > self.env.context.current_term() {
            let demoted = self.env.context.become_follower(res.term);
            self.env.primary.reset_elect_leader_timer();
            demoted?;
            return Ok(());
        }

        if self.env.context.role() == Role::Leader {
            if res.status {
                let match_index = prev_log_index + num_entries;
                self.progress.lock().match_index = match_index;
                self.env.primary.advance_commit_index();
                self.progress.lock().next_index = match_index + 1;
            } else {
                // Classic walk-back probe; the next heartbeat re-probes one
                // entry earlier.
                let mut progress = self.progress.lock();
                if progress.next_index > 1 {
                    progress.next_index -= 1;
                }
            }
        }
        Ok(())
    }

    fn schedule(&self, task: PeerTask) {
        if self.task_tx.send(task).is_err() {
            warn!(server = %self.env.server, "peer worker is gone, task dropped");
        }
    }
}
