//! `RaftCore`: the single task owning a node's mutable consensus state.
//!
//! Every other type in this crate (`BallotBox`, `FSMCaller`, `ReadOnlyService`,
//! `ReplicationStream`) is safe to share across tasks; `RaftCore` itself is
//! not meant to be. It owns `current_term`/`voted_for`/`role`/the log tail/
//! the membership, and mutates them from a single `tokio::task` driven by
//! `main()`, so none of the classic "two RPCs racing on term" bugs can occur
//! here — every term/role observation and mutation happens from the same
//! `&mut self` call, in the order messages are drained off `rx_api`.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Span;

pub(crate) use client::PendingCompletion;

use crate::ballot_box::BallotBox;
use crate::client_service::ClientService;
use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::fsm_caller::FSMCaller;
use crate::fsm_caller::StateMachine;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::raft::RaftMsg;
use crate::raft_types::Configuration;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::read_only_service::ReadOnlyService;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::LogStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeRole;

pub(crate) use admin::ConfigTransition;

/// Published on every role/term/leader/membership change; lets
/// `ReadOnlyService`'s confirmation closure run a quorum heartbeat without
/// reaching back into `RaftCore`'s private state.
#[derive(Clone)]
pub(crate) struct ReadContext {
    pub role: NodeRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub voters: BTreeSet<NodeId>,
}

pub struct RaftCore<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: ClientService<D>,
    S: LogStorage<D>,
{
    id: NodeId,
    config: Arc<Config>,
    client_service: Arc<N>,
    log_storage: Arc<S>,
    fsm: Arc<FSMCaller<D, R>>,
    ballot_box: Arc<BallotBox>,
    read_only_service: Arc<ReadOnlyService<D, R>>,

    role: NodeRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    current_leader: Option<NodeId>,
    last_log_id: LogId,
    commit_index: Arc<AtomicU64>,
    last_committed_seen: u64,
    membership: Configuration,
    last_snapshot_log_id: LogId,

    election_deadline: Instant,

    replicators: BTreeMap<NodeId, ReplicationStream>,
    pending_writes: BTreeMap<u64, PendingCompletion<D, R>>,
    config_transition: ConfigTransition,

    read_ctx_tx: watch::Sender<ReadContext>,

    tx_metrics: watch::Sender<RaftMetrics>,
    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D, R, N, S> RaftCore<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: ClientService<D>,
    S: LogStorage<D>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        client_service: Arc<N>,
        log_storage: Arc<S>,
        state_machine: Arc<dyn StateMachine<D, R>>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        tokio::spawn(async move {
            let core = Self::new(id, config, client_service, log_storage, state_machine, rx_api, tx_metrics, rx_shutdown).await?;
            core.main().await
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn new(
        id: NodeId,
        config: Arc<Config>,
        client_service: Arc<N>,
        log_storage: Arc<S>,
        state_machine: Arc<dyn StateMachine<D, R>>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> RaftResult<Self> {
        let initial = log_storage.get_initial_state().await.map_err(|e| RaftError::RaftStorage(e.into()))?;
        let applied = state_machine.last_applied_log().await.map_err(RaftError::RaftStorage)?;

        // The read-only service's consumer channel is built before the FSM
        // caller so an `AppliedListener` feeding it can be registered with
        // `FSMCaller::spawn` up front: every applied-index advance then
        // drains read-index waiters directly, instead of only on the next
        // unrelated read request to arrive (spec.md §4.5).
        let (read_tx, read_rx) = ReadOnlyService::channel(&config);
        let fsm = FSMCaller::spawn(state_machine, applied, vec![ReadOnlyService::applied_listener(read_tx.clone())]);
        let ballot_box = Arc::new(BallotBox::new());
        let commit_index = Arc::new(AtomicU64::new(ballot_box.last_committed_index()));

        let (read_ctx_tx, read_ctx_rx) = watch::channel(ReadContext {
            role: NodeRole::Follower,
            term: initial.hard_state.current_term,
            leader_id: None,
            voters: initial.membership.all_voters(),
        });

        let read_only_service = ReadOnlyService::spawn(
            read_tx,
            read_rx,
            config.clone(),
            fsm.clone(),
            Self::build_confirm(id, config.clone(), client_service.clone(), ballot_box.clone(), read_ctx_rx),
        );

        let mut core = Self {
            id,
            config,
            client_service,
            log_storage,
            fsm,
            ballot_box,
            read_only_service,

            role: NodeRole::Follower,
            current_term: initial.hard_state.current_term,
            voted_for: initial.hard_state.voted_for,
            current_leader: None,
            last_log_id: initial.last_log_id,
            commit_index,
            last_committed_seen: 0,
            membership: initial.membership,
            last_snapshot_log_id: LogId::none(),

            election_deadline: Instant::now() + Duration::from_millis(config.new_rand_election_timeout()),

            replicators: BTreeMap::new(),
            pending_writes: BTreeMap::new(),
            config_transition: ConfigTransition::Idle,

            read_ctx_tx,

            tx_metrics,
            rx_api,
            rx_shutdown,
        };
        core.reset_election_timeout();
        core.publish_read_ctx();
        core.publish_metrics();
        Ok(core)
    }

    async fn main(mut self) -> RaftResult<()> {
        let mut commit_poll = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval.max(5) / 2 + 1));

        loop {
            tokio::select! {
                biased;

                _ = &mut self.rx_shutdown => {
                    tracing::info!(id = self.id, "shutting down on request");
                    self.role = NodeRole::Shutdown;
                    self.publish_metrics();
                    return Ok(());
                }

                maybe_msg = self.rx_api.recv() => {
                    match maybe_msg {
                        Some((msg, span)) => {
                            let _enter = span.enter();
                            self.handle_msg(msg).await?;
                        }
                        None => return Ok(()),
                    }
                }

                _ = tokio::time::sleep_until(self.election_deadline) => {
                    self.handle_election_timeout().await?;
                }

                _ = commit_poll.tick() => {
                    let committed = self.ballot_box.last_committed_index();
                    if committed > self.last_committed_seen {
                        self.drive_commits(committed).await?;
                    }
                    if self.role.is_leader() {
                        self.maybe_trigger_snapshot(false).await?;
                    }
                    // Replicator acks fold straight into `BallotBox` without
                    // routing back through this loop, so `leader_metrics`
                    // would otherwise only refresh on the next local append;
                    // this tick is what keeps it live between writes.
                    self.publish_metrics();
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let resp = self.handle_append_entries_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let resp = self.handle_vote_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let resp = self.handle_install_snapshot_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
            RaftMsg::ReadIndex { rpc, tx } => {
                let resp = self.handle_read_index_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
            RaftMsg::TimeoutNow { rpc, tx } => {
                let resp = self.handle_timeout_now_request(rpc).await?;
                let _ = tx.send(Ok(resp));
            }
            RaftMsg::ClientWriteRequest { rpc, tx } => {
                self.handle_client_write_request(rpc, tx).await;
            }
            RaftMsg::ClientReadRequest { tx } => {
                let read_only_service = self.read_only_service.clone();
                tokio::spawn(async move {
                    let res = read_only_service.add_request().await;
                    let _ = tx.send(res);
                });
            }
            RaftMsg::Initialize { members, tx } => {
                let res = self.handle_initialize(members).await;
                let _ = tx.send(res);
            }
            RaftMsg::AddLearner { id, tx } => {
                self.handle_add_learner(id, tx).await;
            }
            RaftMsg::ChangeMembership { members, tx } => {
                self.handle_change_membership(members, tx).await;
            }
            RaftMsg::RemoveLearner { id, tx } => {
                self.handle_remove_learner(id, tx).await;
            }
            RaftMsg::ResetPeers { members, tx } => {
                self.handle_reset_peers(members, tx);
            }
            RaftMsg::TransferLeadership { target, tx } => {
                self.handle_transfer_leadership(target, tx).await;
            }
            RaftMsg::ResetElectionTimeout { ms, tx } => {
                self.handle_reset_election_timeout(ms);
                let _ = tx.send(());
            }
            RaftMsg::Snapshot { tx } => {
                let res = self.maybe_trigger_snapshot(true).await;
                let _ = tx.send(res.map(|_| self.fsm.last_applied().index).map_err(ResponseError::RaftError));
            }
            RaftMsg::ReadCommittedUserLog { index, tx } => {
                let res = self.handle_read_committed_user_log(index).await;
                let _ = tx.send(res);
            }
        }
        Ok(())
    }

    // -- shared helpers --------------------------------------------------

    fn build_confirm(
        id: NodeId,
        config: Arc<Config>,
        client_service: Arc<N>,
        ballot_box: Arc<BallotBox>,
        read_ctx_rx: watch::Receiver<ReadContext>,
    ) -> Arc<dyn crate::read_only_service::ConfirmLeadership> {
        let confirm = move || {
            let config = config.clone();
            let client_service = client_service.clone();
            let ballot_box = ballot_box.clone();
            let ctx = read_ctx_rx.borrow().clone();
            Box::pin(async move { client::confirm_leadership(id, config, client_service, ballot_box, ctx).await })
                as std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, crate::error::ClientReadError>> + Send>>
        };
        Arc::new(confirm)
    }

    fn publish_read_ctx(&self) {
        let _ = self.read_ctx_tx.send(ReadContext {
            role: self.role,
            term: self.current_term,
            leader_id: self.current_leader,
            voters: self.membership.all_voters(),
        });
    }

    fn publish_metrics(&self) {
        let leader_metrics = if self.role.is_leader() {
            let replication = self
                .replicators
                .iter()
                .map(|(id, stream)| (*id, ReplicationMetrics { matched: *stream.matched_rx.borrow() }))
                .collect();
            Some(LeaderMetrics { replication })
        } else {
            None
        };
        let metrics = RaftMetrics {
            id: self.id,
            state: self.role,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.fsm.last_applied().index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            snapshot: self.last_snapshot_log_id,
            leader_metrics,
        };
        let _ = self.tx_metrics.send(metrics);
    }

    /// Persist a new term/vote pair and adopt it locally. Passing `None`
    /// for `leader_id` does not clear `current_leader` on its own; callers
    /// update that separately via `set_current_leader`.
    async fn save_hard_state(&mut self, term: u64, voted_for: Option<NodeId>) -> RaftResult<()> {
        self.current_term = term;
        self.voted_for = voted_for;
        self.log_storage
            .save_hard_state(&crate::storage::log_storage::HardState {
                current_term: term,
                voted_for,
            })
            .await
            .map_err(|e| RaftError::RaftStorage(e.into()))?;
        Ok(())
    }

    fn set_current_leader(&mut self, leader_id: Option<NodeId>) {
        self.current_leader = leader_id;
        self.publish_read_ctx();
    }

    /// Observe a higher term from an RPC: step down to follower, update
    /// hard state, and forget any stale vote/leader (spec.md §5.1 "All
    /// Servers" rule 2).
    async fn observe_term(&mut self, term: u64) -> RaftResult<bool> {
        if term > self.current_term {
            self.become_follower(term, None).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn become_follower(&mut self, term: u64, leader_id: Option<NodeId>) -> RaftResult<()> {
        let was_leader = self.role.is_leader();
        self.save_hard_state(term, None).await?;
        self.role = NodeRole::Follower;
        self.current_leader = leader_id;
        if was_leader {
            self.step_down_replicators();
        }
        self.reset_election_timeout();
        self.publish_read_ctx();
        self.publish_metrics();
        Ok(())
    }

    fn step_down_replicators(&mut self) {
        for (_, stream) in self.replicators.drain() {
            stream.terminate();
        }
        if let Some((first, last)) = self.ballot_box.clear_pending_tasks() {
            for idx in first..last {
                if let Some(pending) = self.pending_writes.remove(&idx) {
                    pending.fail_not_leader(self.current_leader);
                }
            }
        }
        self.config_transition = ConfigTransition::Idle;
    }

    fn reset_election_timeout(&mut self) {
        self.election_deadline = match self.role {
            NodeRole::Follower | NodeRole::Candidate if self.membership.is_voter(&self.id) => {
                Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout())
            }
            _ => Instant::now() + Duration::from_secs(3600 * 24),
        };
    }

    async fn handle_election_timeout(&mut self) -> RaftResult<()> {
        match self.role {
            NodeRole::Follower | NodeRole::Candidate => {
                if self.membership.is_voter(&self.id) {
                    self.start_election().await?;
                } else {
                    self.reset_election_timeout();
                }
            }
            _ => self.reset_election_timeout(),
        }
        Ok(())
    }
}
