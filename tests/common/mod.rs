//! Test doubles shared by the integration tests: a transport driven by a
//! scripted reply queue and a primary coordinator that records what the
//! workers ask of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use quorlog::{Primary, PrimaryTask, Request, Response, RpcError, Transport};

/// Replies come from a scripted queue, in order; running dry surfaces a
/// network error, which the worker treats like any transport failure.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<Response, RpcError>>>,
    requests: Mutex<Vec<(String, Request)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_reply(&self, reply: Result<Response, RpcError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_request(&self) -> Option<(String, Request)> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_and_recv(&self, peer: &str, request: Request) -> Result<Response, RpcError> {
        self.requests.lock().push((peer.to_string(), request));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(RpcError::Network("scripted replies exhausted".to_string())))
    }
}

/// Records every capability call a worker makes on the coordinator.
#[derive(Default)]
pub struct RecordingPrimary {
    tasks: Mutex<Vec<PrimaryTask>>,
    reset_timer: AtomicUsize,
    advance_commit: AtomicUsize,
}

impl RecordingPrimary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn become_leader_requested(&self) -> bool {
        self.tasks.lock().contains(&PrimaryTask::BecomeLeader)
    }

    pub fn reset_timer_count(&self) -> usize {
        self.reset_timer.load(Ordering::SeqCst)
    }

    pub fn advance_commit_count(&self) -> usize {
        self.advance_commit.load(Ordering::SeqCst)
    }
}

impl Primary for RecordingPrimary {
    fn add_task(&self, task: PrimaryTask) {
        self.tasks.lock().push(task);
    }

    fn reset_elect_leader_timer(&self) {
        self.reset_timer.fetch_add(1, Ordering::SeqCst);
    }

    fn advance_commit_index(&self) {
        self.advance_commit.fetch_add(1, Ordering::SeqCst);
    }
}
