//! Cluster bootstrap, learner/voter membership changes, and the
//! log-compaction trigger (spec.md §3, §4.2, §4.9).

use std::collections::BTreeSet;

use crate::client_service::ClientService;
use crate::config::SnapshotPolicy;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::raft::EntryConfigChange;
use crate::raft::EntryPayload;
use crate::raft::ResponseTx;
use crate::raft_types::Configuration;
use crate::raft_types::NodeId;
use crate::storage::LogStorage;
use crate::AppData;
use crate::AppDataResponse;

/// Whether a membership change is currently mid-flight. Joint consensus in
/// this core is a single two-entry sequence (the joint config, then the
/// final config) appended back to back rather than gated on the joint
/// entry's commit — matching the teacher's own `append_membership_log`
/// pairing — so this flag only needs two states, not a richer state
/// machine tracking "awaiting joint commit" separately.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ConfigTransition {
    Idle,
    InProgress,
}

impl<D, R, N, S> RaftCore<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: ClientService<D>,
    S: LogStorage<D>,
{
    /// Bootstrap a pristine node (no log entries, term 0) with its initial
    /// voting membership and immediately contest an election. Safe to call
    /// on every founding member: whichever wins first has its configuration
    /// survive, the rest simply lose the race and fall back to following.
    pub(super) async fn handle_initialize(&mut self, mut members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        if !self.last_log_id.is_none() || self.current_term != 0 {
            return Err(InitializeError::NotAllowed);
        }

        members.insert(self.id);
        self.membership = Configuration {
            members,
            members_after_consensus: None,
            learners: BTreeSet::new(),
        };
        self.publish_read_ctx();
        self.start_election().await.map_err(InitializeError::RaftError)?;
        Ok(())
    }

    pub(super) async fn handle_add_learner(&mut self, id: NodeId, tx: ResponseTx) {
        if !self.role.is_leader() {
            let _ = tx.send(Err(ResponseError::ChangeConfig(ChangeConfigError::NodeNotLeader(self.current_leader))));
            return;
        }
        if self.membership.contains(&id) {
            let _ = tx.send(Err(ResponseError::ChangeConfig(ChangeConfigError::Noop)));
            return;
        }

        let mut next = self.membership.clone();
        next.learners.insert(id);
        let payload = EntryPayload::ConfigChange(EntryConfigChange { membership: next });

        match self.append_entry(payload).await {
            Ok(index) => {
                self.pending_writes.insert(index, crate::core::PendingCompletion::Internal { tx: Some(tx) });
            }
            Err(e) => {
                let _ = tx.send(Err(ResponseError::RaftError(e)));
            }
        }
    }

    /// Enter joint consensus for `members`, then immediately propose the
    /// final, uniform configuration. Both entries are appended back to back
    /// rather than waiting for the joint entry to commit first: every entry
    /// proposed while `members_after_consensus` is set still requires
    /// quorum in both halves (spec.md §3), so this is safe, just more
    /// conservative than the minimal protocol.
    pub(super) async fn handle_change_membership(&mut self, members: BTreeSet<NodeId>, tx: ResponseTx) {
        if !self.role.is_leader() {
            let _ = tx.send(Err(ResponseError::ChangeConfig(ChangeConfigError::NodeNotLeader(self.current_leader))));
            return;
        }
        if members.is_empty() {
            let _ = tx.send(Err(ResponseError::ChangeConfig(ChangeConfigError::InoperableConfig)));
            return;
        }
        if self.config_transition == ConfigTransition::InProgress {
            let _ = tx.send(Err(ResponseError::ChangeConfig(ChangeConfigError::ConfigChangeInProgress)));
            return;
        }
        if members == self.membership.members && self.membership.members_after_consensus.is_none() {
            let _ = tx.send(Err(ResponseError::ChangeConfig(ChangeConfigError::Noop)));
            return;
        }

        let joint = Configuration {
            members: self.membership.members.clone(),
            members_after_consensus: Some(members.clone()),
            learners: self.membership.learners.clone(),
        };
        if let Err(e) = self.append_entry(EntryPayload::ConfigChange(EntryConfigChange { membership: joint })).await {
            let _ = tx.send(Err(ResponseError::RaftError(e)));
            return;
        }

        let learners = self.membership.learners.iter().copied().filter(|l| !members.contains(l)).collect();
        let final_conf = Configuration {
            members,
            members_after_consensus: None,
            learners,
        };

        match self.append_entry(EntryPayload::ConfigChange(EntryConfigChange { membership: final_conf })).await {
            Ok(index) => {
                self.pending_writes.insert(index, crate::core::PendingCompletion::Internal { tx: Some(tx) });
            }
            Err(e) => {
                let _ = tx.send(Err(ResponseError::RaftError(e)));
            }
        }
    }

    /// Re-evaluate the configured snapshot policy; if it's time (or
    /// `force` bypasses the threshold check entirely, per spec.md §6
    /// `snapshot(done)`), ask the state machine to serialize itself and
    /// compact the log up to that point (spec.md §4.9).
    pub(super) async fn maybe_trigger_snapshot(&mut self, force: bool) -> RaftResult<()> {
        let applied = self.fsm.last_applied();
        if !force {
            let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
            let threshold = *threshold;
            if applied.index <= self.last_snapshot_log_id.index {
                return Ok(());
            }
            if applied.index - self.last_snapshot_log_id.index < threshold {
                return Ok(());
            }
        } else if applied.index <= self.last_snapshot_log_id.index {
            return Ok(());
        }

        let (meta, _data) = self
            .fsm
            .state_machine()
            .build_snapshot()
            .await
            .map_err(RaftError::RaftStorage)?;

        self.log_storage
            .truncate_prefix(meta.last_log_id.index + 1)
            .await
            .map_err(|e| RaftError::RaftStorage(e.into()))?;
        self.last_snapshot_log_id = meta.last_log_id;
        self.publish_metrics();
        Ok(())
    }
}
