/// Tasks the core may enqueue on the primary coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryTask {
    BecomeLeader,
}

/// Narrow capability a peer worker holds back to the primary coordinator.
/// The primary exclusively owns the peer workers; workers hold this
/// non-owning handle, which breaks the reference cycle between the two.
pub trait Primary: Send + Sync {
    /// Request promotion processing on the primary thread.
    fn add_task(&self, task: PrimaryTask);

    /// Restart the randomized election timeout.
    fn reset_elect_leader_timer(&self);

    /// Recompute the commit index from the peers' sorted match indices and
    /// apply newly committed entries.
    fn advance_commit_index(&self);
}
