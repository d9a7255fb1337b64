//! Error taxonomy for the consensus core (spec.md §7).
//!
//! Inside the core, errors carry a `(code, message)` pair via `thiserror`
//! variants; at the `ClientService` boundary they are flattened into the
//! `ErrorResponse` envelope defined in `raft.rs`.

use thiserror::Error;

use crate::raft_types::NodeId;
use crate::raft_types::SnapshotSegmentId;

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors which are fatal to the running node, or otherwise core-internal.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The storage layer reported a failure. Per spec.md §7 this is always
    /// treated as a safety violation for writes; the node transitions to
    /// its error state and refuses further applies and reads.
    #[error("raft storage error: {0}")]
    RaftStorage(anyhow::Error),

    /// The abstract transport reported a failure sending an RPC.
    #[error("raft network error: {0}")]
    RaftNetwork(anyhow::Error),

    /// An invariant the protocol depends on for safety was violated (e.g.
    /// `last < pendingIndex + queue.size()` in `BallotBox::commit_at`, or
    /// an index regression). Unrecoverable.
    #[error("safety violation: {0}")]
    SafetyViolation(String),

    /// A received `InstallSnapshot` chunk did not match the segment the
    /// receiver expected.
    #[error("snapshot mismatch, expected: {expect:?}, got: {got:?}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },

    /// The node is in the process of shutting down and can no longer
    /// accept new work.
    #[error("the raft node is shutting down")]
    ShuttingDown,
}

/// Errors returned when proposing or reacting to a membership change.
#[derive(Debug, Error)]
pub enum ChangeConfigError {
    /// This node is not the cluster leader; redirect the caller if a
    /// leader is known.
    #[error("node is not the cluster leader, current leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),

    /// The proposed configuration would leave the cluster with zero
    /// members, or otherwise inoperable.
    #[error("proposed configuration is inoperable")]
    InoperableConfig,

    /// A configuration change is already underway (joint consensus, or a
    /// learner is still being synced).
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    /// The requested change is a no-op (peer is already a member / learner
    /// / absent, as appropriate).
    #[error("requested configuration change is a no-op")]
    Noop,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Errors returned from `Node::read_index`/`client_read`.
#[derive(Debug, Error)]
pub enum ClientReadError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    /// This node is not the leader; the caller should retry against the
    /// indicated leader, if known.
    #[error("forward read to leader: {0:?}")]
    ForwardToLeader(Option<NodeId>),

    /// The read-only pipeline's ring buffer was full (spec.md §4.5).
    #[error("read-only service is busy, request was not enqueued")]
    Busy,

    /// The waiter's lag bound (`maxReadIndexLag`) was exceeded before the
    /// state machine could catch up.
    #[error("read index {index} exceeds max read-index lag over applied index {applied}")]
    LagExceeded { applied: u64, index: u64 },
}

/// Errors returned from `Node::apply`/`client_write`.
#[derive(Debug, Error)]
pub enum ClientWriteError<D> {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    /// This node is not the leader; the caller should resubmit `data` to
    /// the indicated leader.
    #[error("forward write to leader: {1:?}")]
    ForwardToLeader(D, Option<NodeId>),
}

/// Errors returned from `Node::initialize`.
#[derive(Debug, Error)]
pub enum InitializeError {
    /// The node already has log entries or a non-zero term; it is not
    /// pristine and initialization is refused.
    #[error("initialization is only allowed on a pristine node")]
    NotAllowed,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// The error type carried on the internal `ResponseTx` used for admin
/// operations (`addPeer`/`removePeer`/snapshot/etc), unifying the above.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),
}

/// Errors returned from `Node::readCommittedUserLog` (spec.md §6).
#[derive(Debug, Error)]
pub enum ReadLogError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    /// `index` is beyond `lastCommittedIndex`: the entry may exist locally
    /// but hasn't been confirmed by a quorum yet, so its content must not
    /// be treated as durable.
    #[error("log entry at index {0} is not committed yet")]
    NotCommitted(u64),

    /// The entry at `index` was already reclaimed by a prefix-truncate
    /// (snapshot); its content is only available via the snapshot itself.
    #[error("log entry at index {0} has been purged by a snapshot")]
    Purged(u64),

    /// The entry at `index` exists but carries no user payload (a blank
    /// anchor, a configuration change, or a purged-prefix marker).
    #[error("log entry at index {0} carries no user data")]
    NotUserData(u64),
}

/// Errors surfaced by the concrete `LogStorage` (spec.md §4.1 failure
/// semantics: writes fail the operation and log the cause; reads return
/// `None`/log and must not abort the process).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("underlying storage engine error: {0}")]
    Engine(#[from] rocksdb::Error),

    #[error("failed to encode/decode a log entry: {0}")]
    Codec(String),

    #[error("operation was interrupted")]
    Interrupted,
}
