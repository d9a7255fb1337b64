//! Follower-side `InstallSnapshot` handling (spec.md §4.9, §7).
//!
//! `ReplicationCore::install_snapshot` (the leader side, `replication/mod.rs`)
//! always sends the whole snapshot in a single chunk with `data` empty — it
//! only relocates the log's purged-prefix anchor, it does not actually ship
//! state-machine bytes over the wire. This handler mirrors that: true
//! chunked/resumable transfer of real snapshot bytes is not implemented end
//! to end in this core (see DESIGN.md), so the `offset`/multi-round-trip
//! plumbing the RPC shape otherwise supports goes unused here.

use crate::client_service::ClientService;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::storage::LogStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeRole;

impl<D, R, N, S> RaftCore<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: ClientService<D>,
    S: LogStorage<D>,
{
    pub(super) async fn handle_install_snapshot_request(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }
        self.observe_term(req.term).await?;
        if self.current_leader != Some(req.leader_id) {
            self.set_current_leader(Some(req.leader_id));
        }
        if !matches!(self.role, NodeRole::Learner) {
            self.role = NodeRole::Follower;
        }
        self.reset_election_timeout();

        if req.done {
            self.fsm
                .state_machine()
                .install_snapshot(&req.meta, req.data.clone())
                .await
                .map_err(RaftError::RaftStorage)?;

            self.log_storage
                .reset(req.meta.last_log_id.index + 1)
                .await
                .map_err(|e| RaftError::RaftStorage(e.into()))?;

            self.membership = req.meta.membership.clone();
            self.last_log_id = req.meta.last_log_id;
            self.last_snapshot_log_id = req.meta.last_log_id;
            self.last_committed_seen = req.meta.last_log_id.index;
            self.fsm.advance(req.meta.last_log_id);
            self.ballot_box.set_last_committed_index(req.meta.last_log_id.index);

            self.publish_read_ctx();
            self.publish_metrics();
        }

        Ok(InstallSnapshotResponse { term: self.current_term })
    }
}
