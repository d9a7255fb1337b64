//! Log append, commit-drive, and apply dispatch (spec.md §4.3/§4.4).
//!
//! Membership entries take effect at *append* time, not at commit time:
//! `append_entry` updates `self.membership` (and, for a leader, its
//! replicator set) *before* allocating the entry's own ballot, so a
//! config-change entry's ballot already requires the new (or, for a joint
//! entry, both halves of the new) quorum rather than only the quorum it is
//! superseding. This mirrors the teacher's own `append_membership_log`,
//! which sets `members_after_consensus` before appending the joint log
//! entry, just generalized off the old `LeaderState` split.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::ballot_box::BallotBox;
use crate::client_service::ClientService;
use crate::config::Config;
use crate::core::ConfigTransition;
use crate::core::RaftCore;
use crate::core::ReadContext;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::PingRequest;
use crate::raft::ResponseTx;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::storage::LogStorage;
use crate::AppData;
use crate::AppDataResponse;

/// What a pending log index unblocks once it commits: either the client's
/// own oneshot (a normal write) or an internal admin caller's (a config
/// change or add-learner request). A blank anchor entry has no completion
/// registered against it at all.
pub(crate) enum PendingCompletion<D: AppData, R: AppDataResponse> {
    Client { tx: ClientWriteResponseTx<D, R>, data: D },
    Internal { tx: Option<ResponseTx> },
}

impl<D: AppData, R: AppDataResponse> PendingCompletion<D, R> {
    /// Fail a still-pending write because this node stepped down before it
    /// committed. The caller should retry against whatever leader is known.
    pub(crate) fn fail_not_leader(self, leader: Option<NodeId>) {
        match self {
            PendingCompletion::Client { tx, data } => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(data, leader)));
            }
            PendingCompletion::Internal { tx } => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(ResponseError::ChangeConfig(crate::error::ChangeConfigError::NodeNotLeader(leader))));
                }
            }
        }
    }
}

impl<D, R, N, S> RaftCore<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: ClientService<D>,
    S: LogStorage<D>,
{
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        let data = match &rpc.entry {
            EntryPayload::Normal(n) => n.data.clone(),
            _ => {
                let _ = tx.send(Err(ClientWriteError::RaftError(RaftError::SafetyViolation(
                    "client write carried a non-Normal payload".into(),
                ))));
                return;
            }
        };

        if !self.role.is_leader() {
            let _ = tx.send(Err(ClientWriteError::ForwardToLeader(data, self.current_leader)));
            return;
        }

        match self.append_entry(rpc.entry).await {
            Ok(index) => {
                self.pending_writes.insert(index, PendingCompletion::Client { tx, data });
            }
            Err(e) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(e)));
            }
        }
    }

    /// Append `payload` to the local log at the current term, register its
    /// ballot, replicate it to every follower, and — if it's a membership
    /// change — adopt the new configuration immediately.
    pub(super) async fn append_entry(&mut self, payload: EntryPayload<D>) -> RaftResult<u64> {
        let index = self.last_log_id.index + 1;
        let log_id = LogId::new(self.current_term, index);

        let new_membership = match &payload {
            EntryPayload::ConfigChange(c) => Some(c.membership.clone()),
            _ => None,
        };

        let entry = Entry { log_id, payload };
        self.log_storage.append_entry(entry).await.map_err(|e| RaftError::RaftStorage(e.into()))?;
        self.last_log_id = log_id;

        // A config-change entry's own ballot must already require both
        // halves of a joint configuration, so the membership cutover has to
        // happen before the ballot is allocated, not after: otherwise the
        // joint entry would commit on the old quorum alone.
        let is_config_change = new_membership.is_some();
        if let Some(conf) = new_membership {
            self.config_transition = if conf.is_joint() { ConfigTransition::InProgress } else { ConfigTransition::Idle };
            self.membership = conf;
        }

        self.ballot_box.append_pending_task(&self.membership)?;

        // Self-grant: the leader counts its own copy of the entry toward
        // quorum the moment it's durable locally, without waiting on its
        // own round trip.
        if self.membership.is_voter(&self.id) {
            if let Some(new_commit) = self.ballot_box.commit_at(index, index, self.id)? {
                self.commit_index.fetch_max(new_commit, Ordering::AcqRel);
            }
        }

        if is_config_change {
            if self.role.is_leader() {
                self.sync_replicators();
            }
            self.publish_read_ctx();
        }

        for stream in self.replicators.values() {
            stream.replicate(log_id);
        }
        self.publish_metrics();
        Ok(index)
    }

    /// Bring the leader's replicator set in line with the current
    /// membership: terminate streams for peers no longer in the
    /// configuration, spawn new ones for peers just added.
    pub(super) fn sync_replicators(&mut self) {
        let wanted = self.membership.all_nodes();

        let stale: Vec<NodeId> = self.replicators.keys().filter(|id| !wanted.contains(id)).copied().collect();
        for id in stale {
            if let Some(stream) = self.replicators.remove(&id) {
                stream.terminate();
            }
        }

        for peer in wanted {
            if peer == self.id || self.replicators.contains_key(&peer) {
                continue;
            }
            let is_learner = self.membership.is_learner(&peer);
            let stream = crate::replication::ReplicationStream::spawn(
                self.id,
                peer,
                self.current_term,
                self.config.clone(),
                self.last_log_id,
                self.commit_index.clone(),
                self.client_service.clone(),
                self.log_storage.clone(),
                self.ballot_box.clone(),
                is_learner,
            );
            self.replicators.insert(peer, stream);
        }
    }

    /// Dispatch every newly committed entry, in order, to the state
    /// machine (or straight to `advance` for payloads that carry none).
    pub(super) async fn drive_commits(&mut self, committed: u64) -> RaftResult<()> {
        let mut idx = self.last_committed_seen + 1;
        while idx <= committed {
            if let Some(entry) = self.log_storage.get_entry(idx).await.map_err(|e| RaftError::RaftStorage(e.into()))? {
                self.apply_committed_entry(entry).await;
            }
            // A missing entry means a snapshot already purged it; its
            // effects were already folded into the snapshot that was
            // installed, so there's nothing further to apply here.
            idx += 1;
        }
        self.last_committed_seen = committed;
        Ok(())
    }

    async fn apply_committed_entry(&mut self, entry: Entry<D>) {
        let log_id = entry.log_id;
        let pending = self.pending_writes.remove(&log_id.index);

        match entry.payload {
            EntryPayload::Blank | EntryPayload::PurgedMarker | EntryPayload::ConfigChange(_) => {
                self.fsm.advance(log_id);
                if let Some(pending) = pending {
                    Self::complete_internal(pending, log_id.index, self.current_leader);
                }
            }
            EntryPayload::Normal(normal) => match pending {
                Some(PendingCompletion::Client { tx, .. }) => {
                    let (apply_tx, apply_rx) = tokio::sync::oneshot::channel();
                    self.fsm.apply(log_id, normal.data, Some(apply_tx));
                    tokio::spawn(async move {
                        let result = match apply_rx.await {
                            Ok(Ok(data)) => Ok(ClientWriteResponse { index: log_id.index, data }),
                            Ok(Err(err)) => Err(ClientWriteError::RaftError(RaftError::RaftStorage(err))),
                            Err(_) => Err(ClientWriteError::RaftError(RaftError::ShuttingDown)),
                        };
                        let _ = tx.send(result);
                    });
                }
                Some(other) => {
                    // Only a safety bug elsewhere could register a non-client
                    // completion against a Normal entry's index.
                    other.fail_not_leader(self.current_leader);
                    self.fsm.apply(log_id, normal.data, None);
                }
                None => {
                    self.fsm.apply(log_id, normal.data, None);
                }
            },
        }
    }

    fn complete_internal(pending: PendingCompletion<D, R>, index: u64, leader: Option<NodeId>) {
        match pending {
            PendingCompletion::Internal { tx: Some(tx) } => {
                let _ = tx.send(Ok(index));
            }
            PendingCompletion::Internal { tx: None } => {}
            client @ PendingCompletion::Client { .. } => {
                // A client write's entry is always `Normal`; reaching here
                // would mean the index was misassigned elsewhere.
                client.fail_not_leader(leader);
            }
        }
    }
}

/// The leader-side half of the ReadIndex protocol (spec.md §4.5/§4.6):
/// confirm this node is still backed by a live quorum, then return the
/// commit index recorded at the moment of that confirmation. Free function
/// (not a method) so `ReadOnlyService`'s confirmation closure can call it
/// without holding a `&RaftCore`.
pub(crate) async fn confirm_leadership<D, N>(
    id: NodeId,
    config: Arc<Config>,
    client_service: Arc<N>,
    ballot_box: Arc<BallotBox>,
    ctx: ReadContext,
) -> Result<u64, ClientReadError>
where
    D: AppData,
    N: ClientService<D>,
{
    if !ctx.role.is_leader() {
        return Err(ClientReadError::ForwardToLeader(ctx.leader_id));
    }

    let index = ballot_box.last_committed_index();
    let needed = crate::quorum::majority_of(ctx.voters.len());
    let mut confirmed = 1usize; // the leader's own vote
    if confirmed >= needed {
        return Ok(index);
    }

    let timeout_dur = Duration::from_millis(config.rpc_default_timeout);
    let mut pending = FuturesUnordered::new();
    for peer in ctx.voters.iter().filter(|p| **p != id) {
        let target = *peer;
        let client_service = client_service.clone();
        pending.push(async move {
            match tokio::time::timeout(timeout_dur, client_service.ping(target, PingRequest {})).await {
                Ok(Ok(_)) => Ok(target),
                Ok(Err(err)) => Err((target, err)),
                Err(_) => Err((target, anyhow::anyhow!("leadership confirmation to {target} timed out"))),
            }
        });
    }

    while let Some(res) = pending.next().await {
        match res {
            Ok(_) => {
                confirmed += 1;
                if confirmed >= needed {
                    return Ok(index);
                }
            }
            Err((target, err)) => {
                tracing::warn!(target, error = %err, "leadership confirmation heartbeat failed");
            }
        }
    }

    Err(ClientReadError::RaftError(RaftError::RaftNetwork(anyhow::anyhow!(
        "could not confirm leadership over a quorum of {}",
        ctx.voters.len()
    ))))
}
