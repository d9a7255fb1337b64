//! The metrics stream published by a running `Node`, mirroring the
//! teacher's `RaftMetrics`/`LeaderMetrics`/`Wait` trio.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::raft_types::Configuration;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::replication::ReplicationMetrics;
use crate::NodeRole;

/// A point-in-time snapshot of a node's state, published to `watch::Receiver<RaftMetrics>`
/// on every role transition, term change, and commit/apply advance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: NodeRole,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership_config: Configuration,
    /// The log id up to (and including) which the current snapshot covers.
    pub snapshot: LogId,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    /// The metrics payload for a node which has not yet run its main loop.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: NodeRole::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: Configuration::new_initial(id),
            snapshot: LogId::none(),
            leader_metrics: None,
        }
    }
}

/// Metrics specific to the leader role: per-follower replication progress.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaderMetrics {
    pub replication: HashMap<NodeId, ReplicationMetrics>,
}

/// A handle for awaiting a condition on the metrics stream, returned by
/// `Raft::wait`/`Node::wait`.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for condition")]
    Timeout(Duration),

    #[error("the metrics channel has closed, the node has shut down")]
    MetricsChanged,
}

impl Wait {
    async fn poll<T, F>(&mut self, msg: &str, mut matches: F) -> Result<RaftMetrics, WaitError>
    where F: FnMut(&RaftMetrics) -> Option<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let latest = self.rx.borrow().clone();
            if matches(&latest).is_some() {
                return Ok(latest);
            }
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout(self.timeout));
            }
            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::MetricsChanged);
                    }
                }
                _ = sleep(Duration::from_millis(20)) => {
                    tracing::trace!("wait: {} still polling", msg);
                }
            }
        }
    }

    /// Wait for `last_log_index` to reach at least `index`.
    pub async fn log(&mut self, index: u64) -> Result<RaftMetrics, WaitError> {
        self.poll("log", |m| if m.last_log_index >= index { Some(()) } else { None }).await
    }

    /// Wait for `last_applied` to reach at least `index`.
    pub async fn applied_index(&mut self, index: u64) -> Result<RaftMetrics, WaitError> {
        self.poll("applied_index", |m| if m.last_applied >= index { Some(()) } else { None }).await
    }

    /// Wait for the node to report the given role.
    pub async fn state(&mut self, state: NodeRole) -> Result<RaftMetrics, WaitError> {
        self.poll("state", |m| if m.state == state { Some(()) } else { None }).await
    }

    /// Wait for `current_leader` to equal the given node id.
    pub async fn current_leader(&mut self, leader_id: NodeId) -> Result<RaftMetrics, WaitError> {
        self.poll("current_leader", |m| if m.current_leader == Some(leader_id) { Some(()) } else { None }).await
    }

    /// Wait for an arbitrary predicate over the metrics payload.
    pub async fn metrics<F>(&mut self, mut f: F) -> Result<RaftMetrics, WaitError>
    where F: FnMut(&RaftMetrics) -> bool {
        self.poll("metrics", |m| if f(m) { Some(()) } else { None }).await
    }
}
