//! Public `Raft` facade and the RPC/log-entry wire types (spec.md §4.7, §6).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::client_service::ClientService;
use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ReadLogError;
use crate::error::ResponseError;
use crate::fsm_caller::StateMachine;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::raft_types::Configuration;
use crate::raft_types::LogId;
use crate::raft_types::SnapshotId;
use crate::storage::LogStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;

struct RaftInner<D: AppData, R: AppDataResponse> {
    config: Arc<Config>,
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The handle an embedder holds onto a running node. Cheap to clone; every
/// method sends a message across an internal channel to the single task
/// that owns the node's state (`core::RaftCore`) and awaits the reply.
///
/// If any call returns `RaftError::ShuttingDown`, the node has begun an
/// unrequested shutdown (most often a fatal storage error); callers should
/// invoke `shutdown()` to await its exit.
pub struct Raft<D: AppData, R: AppDataResponse> {
    inner: Arc<RaftInner<D, R>>,
}

impl<D: AppData, R: AppDataResponse> Raft<D, R> {
    /// Spawn a new node, returning its handle immediately; the node's main
    /// loop runs on its own `tokio` task.
    #[tracing::instrument(level = "trace", skip(config, client_service, log_storage, state_machine), fields(cluster=%config.cluster_name))]
    pub fn spawn<N, S>(
        id: NodeId,
        config: Arc<Config>,
        client_service: Arc<N>,
        log_storage: Arc<S>,
        state_machine: Arc<dyn StateMachine<D, R>>,
    ) -> Self
    where
        N: ClientService<D>,
        S: LogStorage<D>,
    {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config.clone(), client_service, log_storage, state_machine, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            config,
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Self { inner: Arc::new(inner) }
    }

    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::AppendEntries { rpc, tx })?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::RequestVote { rpc, tx })?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot = %rpc.meta.id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::InstallSnapshot { rpc, tx })?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Inbound side of the ReadIndex protocol: a follower that received a
    /// client read forwards it here to its local leader-relay path, or a
    /// peer forwards its own forwarded read to the true leader.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn read_index(&self, rpc: ReadIndexRequest) -> Result<ReadIndexResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ReadIndex { rpc, tx })?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Ask this node to immediately start an election, used by a leader
    /// transferring leadership to a caught-up follower.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn timeout_now(&self, rpc: TimeoutNowRequest) -> Result<TimeoutNowResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::TimeoutNow { rpc, tx })?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Obtain a linearizable read guarantee: on success, the caller may
    /// read local state once `last_applied` reaches the returned index
    /// without risking a stale read (spec.md §4.5/§4.6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<u64, ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ClientReadRequest { tx }).map_err(ClientReadError::RaftError)?;
        rx.await.map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Propose a write. Appends `rpc` to the log, replicates it to a
    /// quorum, applies it to the state machine, and returns the apply's
    /// response (spec.md §4.4).
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.inner.tx_api.send((RaftMsg::ClientWriteRequest { rpc, tx }, Span::current())) {
            tracing::error!(error = %e, "client_write: tx_api closed");
            return Err(ClientWriteError::RaftError(RaftError::ShuttingDown));
        }
        rx.await.map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Initialize a pristine node (index 0, term 0) with the given initial
    /// membership and begin an election. Safe to call on every member of a
    /// to-be-formed cluster: only the first to win an election will have
    /// its config survive.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::Initialize { members, tx }).map_err(InitializeError::RaftError)?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Add `id` as a learner: it receives the replicated log but never
    /// counts toward a quorum, until promoted by a later
    /// `change_membership` call.
    #[tracing::instrument(level = "debug", skip(self), fields(target = id))]
    pub async fn add_learner(&self, id: NodeId) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::AddLearner { id, tx })?;
        rx.await.map_err(|_| ResponseError::RaftError(RaftError::ShuttingDown)).and_then(|res| res).map(|_| ())
    }

    /// Propose a new voting membership, entering joint consensus until the
    /// transition commits (spec.md §3/§4.8).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ChangeMembership { members, tx })?;
        rx.await.map_err(|_| ResponseError::RaftError(RaftError::ShuttingDown)).and_then(|res| res).map(|_| ())
    }

    /// Remove `id` from the learner set without otherwise touching voting
    /// membership. The counterpart to `add_learner` (spec.md §6
    /// `removeLearners`).
    #[tracing::instrument(level = "debug", skip(self), fields(target = id))]
    pub async fn remove_learner(&self, id: NodeId) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::RemoveLearner { id, tx })?;
        rx.await.map_err(|_| ResponseError::RaftError(RaftError::ShuttingDown)).and_then(|res| res).map(|_| ())
    }

    /// Unsafe admin escape (spec.md §4.6/§6 `resetPeers`): rewrites this
    /// node's membership locally, without proposing or replicating an
    /// entry. Only safe when a majority of the current configuration is
    /// permanently lost and no quorum can ever again be reached through
    /// the ordinary `change_membership` path.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reset_peers(&self, members: BTreeSet<NodeId>) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ResetPeers { members, tx })?;
        rx.await.map_err(|_| ResponseError::RaftError(RaftError::ShuttingDown)).and_then(|res| res).map(|_| ())
    }

    /// Ask this leader to hand leadership to `target` (spec.md §4.6/§6
    /// `transferLeadershipTo`): confirm `target` is caught up, send it a
    /// `TimeoutNow`, then step down so the new election can proceed
    /// uncontested.
    #[tracing::instrument(level = "debug", skip(self), fields(target = target))]
    pub async fn transfer_leadership_to(&self, target: NodeId) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::TransferLeadership { target, tx })?;
        rx.await.map_err(|_| ResponseError::RaftError(RaftError::ShuttingDown)).and_then(|res| res).map(|_| ())
    }

    /// Override the current election timer with a one-shot deadline `ms`
    /// milliseconds out (spec.md §6 `resetElectionTimeoutMs`), without
    /// touching the configured `[election_timeout_min, election_timeout_max)`
    /// bounds future timers are drawn from.
    pub async fn reset_election_timeout_ms(&self, ms: u64) {
        let (tx, rx) = oneshot::channel();
        if self.send(RaftMsg::ResetElectionTimeout { ms, tx }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Force an immediate snapshot regardless of `snapshot_policy`'s own
    /// threshold (spec.md §6 `snapshot(done)`).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn snapshot(&self) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::Snapshot { tx })?;
        rx.await.map_err(|_| ResponseError::RaftError(RaftError::ShuttingDown)).and_then(|res| res).map(|_| ())
    }

    /// Fetch the user-supplied payload of a committed log entry (spec.md
    /// §6 `readCommittedUserLog`). Fails if `index` isn't yet committed,
    /// was already purged by a snapshot, or names an internal (blank /
    /// configuration) entry rather than application data.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn read_committed_user_log(&self, index: u64) -> Result<UserLog<D>, ReadLogError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ReadCommittedUserLog { index, tx }).map_err(ReadLogError::RaftError)?;
        rx.await.map_err(|_| ReadLogError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// All voting members of the current configuration (spec.md §6
    /// `listPeers`), both halves of a joint configuration included.
    pub fn list_peers(&self) -> BTreeSet<NodeId> {
        self.metrics().borrow().membership_config.all_voters()
    }

    /// All learners of the current configuration (spec.md §6 `listLearners`).
    pub fn list_learners(&self) -> BTreeSet<NodeId> {
        self.metrics().borrow().membership_config.learners.clone()
    }

    /// Voting peers this node (while leader) considers caught up: their
    /// replicator's matched index is within `replication_lag_threshold` of
    /// this node's own log tail (spec.md §6 `listAlivePeers`). Empty when
    /// this node isn't the leader, since only a leader tracks replication
    /// progress for its followers.
    pub fn list_alive_peers(&self) -> BTreeSet<NodeId> {
        let metrics = self.metrics().borrow().clone();
        self.alive_nodes(&metrics, &metrics.membership_config.all_voters())
    }

    /// Learners this node (while leader) considers caught up, by the same
    /// lag criterion as `list_alive_peers` (spec.md §6 `listAliveLearners`).
    pub fn list_alive_learners(&self) -> BTreeSet<NodeId> {
        let metrics = self.metrics().borrow().clone();
        self.alive_nodes(&metrics, &metrics.membership_config.learners)
    }

    fn alive_nodes(&self, metrics: &RaftMetrics, candidates: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        let leader_metrics = match &metrics.leader_metrics {
            Some(m) => m,
            None => return BTreeSet::new(),
        };
        let threshold = self.inner.config.replication_lag_threshold;
        candidates
            .iter()
            .filter(|id| match leader_metrics.replication.get(id) {
                Some(r) => metrics.last_log_index.saturating_sub(r.matched.index) <= threshold,
                None => false,
            })
            .copied()
            .collect()
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }

    /// Block until this node's main loop has exited, without requesting
    /// shutdown first (spec.md §6 `join()`). Typically called after
    /// `shutdown()`, or from a caller that only wants to observe a node
    /// die on its own (e.g. a fatal storage error).
    pub async fn join(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }

    fn send(&self, msg: RaftMsg<D, R>) -> Result<(), RaftError> {
        self.inner.tx_api.send((msg, Span::current())).map_err(|_| RaftError::ShuttingDown)
    }
}

impl<D: AppData, R: AppDataResponse> Clone for Raft<D, R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError<D>>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<u64, ClientReadError>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;
pub(crate) type ReadLogResponseTx<D> = oneshot::Sender<Result<UserLog<D>, ReadLogError>>;

/// The user-supplied payload of a committed log entry, as returned by
/// `Raft::read_committed_user_log` (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserLog<D: AppData> {
    pub log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub data: D,
}

pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    ReadIndex {
        rpc: ReadIndexRequest,
        tx: oneshot::Sender<Result<ReadIndexResponse, RaftError>>,
    },
    TimeoutNow {
        rpc: TimeoutNowRequest,
        tx: oneshot::Sender<Result<TimeoutNowResponse, RaftError>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    },
    ClientReadRequest {
        tx: ClientReadResponseTx,
    },
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddLearner {
        id: NodeId,
        tx: ResponseTx,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: ResponseTx,
    },
    RemoveLearner {
        id: NodeId,
        tx: ResponseTx,
    },
    ResetPeers {
        members: BTreeSet<NodeId>,
        tx: ResponseTx,
    },
    TransferLeadership {
        target: NodeId,
        tx: ResponseTx,
    },
    ResetElectionTimeout {
        ms: u64,
        tx: oneshot::Sender<()>,
    },
    Snapshot {
        tx: ResponseTx,
    },
    ReadCommittedUserLog {
        index: u64,
        tx: ReadLogResponseTx<D>,
    },
}

// -- RPC message types --------------------------------------------------

/// Sent by the leader to replicate entries (§5.3) and as a heartbeat (§5.2)
/// when `entries` is empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} prev={} commit={} n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Present only when `success` is `false`: the log-matching
    /// optimization from §5.3, letting the leader skip straight to the
    /// follower's last non-conflicting entry instead of backing off by one.
    pub conflict_opt: Option<ConflictOpt>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    pub log_id: LogId,
}

/// One entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    pub fn new_purged_marker(log_id: LogId) -> Self {
        Entry { log_id, payload: EntryPayload::PurgedMarker }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        self.iter().map(|e| format!("{}:{}", e.log_id, e.payload.summary())).collect::<Vec<_>>().join(",")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty entry committed by a new leader to anchor its term.
    Blank,
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    ConfigChange(EntryConfigChange),
    /// Marks that every entry before this index has been purged by a
    /// completed snapshot (spec.md §4.9).
    PurgedMarker,
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".into(),
            EntryPayload::Normal(_) => "normal".into(),
            EntryPayload::ConfigChange(c) => format!("config-change: {:?}", c.membership),
            EntryPayload::PurgedMarker => "purged-marker".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    #[serde(bound = "D: AppData")]
    pub data: D,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    pub membership: Configuration,
}

/// Sent by candidates to gather votes (§5.2, §5.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_id: LogId,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_id: LogId) -> Self {
        Self { term, candidate_id, last_log_id }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Sent by the leader to stream a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} meta={:?} offset={} len={} done={}",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Metadata describing a completed snapshot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    pub last_log_id: LogId,
    pub membership: Configuration,
}

/// Sent by a follower forwarding a linearizable read to its leader, or by a
/// leader confirming a quorum-heartbeat round for ReadIndex (spec.md §4.5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadIndexRequest {
    pub term: u64,
    pub requester_id: NodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadIndexResponse {
    pub term: u64,
    /// The index the requester must wait for `last_applied` to reach
    /// before serving the read.
    pub read_index: u64,
}

/// Sent by an outgoing leader to a fully caught-up follower, asking it to
/// skip its election timeout and start a campaign immediately (leadership
/// transfer, spec.md §4.10).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub term: u64,
}

/// A transport-level liveness probe, independent of the Raft protocol.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PingRequest {}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PingResponse {}

/// An application-specific write to append to the log and apply once
/// committed (§5.1).
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

impl<D: AppData> ClientWriteRequest<D> {
    pub fn new(entry: D) -> Self {
        Self::new_base(EntryPayload::Normal(EntryNormal { data: entry }))
    }

    pub(crate) fn new_base(entry: EntryPayload<D>) -> Self {
        Self { entry }
    }

    pub(crate) fn new_config(membership: Configuration) -> Self {
        Self::new_base(EntryPayload::ConfigChange(EntryConfigChange { membership }))
    }

    pub(crate) fn new_blank_payload() -> Self {
        Self::new_base(EntryPayload::Blank)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub index: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}
