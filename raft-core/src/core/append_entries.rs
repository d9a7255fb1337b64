//! Follower-side `AppendEntries` handling (spec.md §5.2/§5.3).

use crate::client_service::ClientService;
use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
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
    pub(super) async fn handle_append_entries_request(&mut self, req: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        self.observe_term(req.term).await?;
        if !matches!(self.role, NodeRole::Learner) {
            self.role = NodeRole::Follower;
        }
        if self.current_leader != Some(req.leader_id) {
            self.set_current_leader(Some(req.leader_id));
        }
        self.reset_election_timeout();

        if !req.prev_log_id.is_none() {
            let local_term = self.log_storage.get_term(req.prev_log_id.index).await.map_err(|e| crate::error::RaftError::RaftStorage(e.into()))?;
            if local_term != req.prev_log_id.term {
                let conflict_opt = if req.prev_log_id.index > self.last_log_id.index {
                    Some(ConflictOpt { log_id: self.last_log_id })
                } else {
                    None
                };
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt,
                });
            }
        }

        if !req.entries.is_empty() {
            let mut entries = req.entries;
            let mut keep = 0usize;
            while keep < entries.len() {
                let candidate_index = entries[keep].log_id.index;
                if candidate_index > self.last_log_id.index {
                    break;
                }
                let local_term = self.log_storage.get_term(candidate_index).await.map_err(|e| crate::error::RaftError::RaftStorage(e.into()))?;
                if local_term == entries[keep].log_id.term {
                    keep += 1;
                } else {
                    break;
                }
            }

            if keep < entries.len() {
                let first_new = entries[keep].log_id.index;
                if first_new <= self.last_log_id.index {
                    self.log_storage
                        .truncate_suffix(first_new - 1)
                        .await
                        .map_err(|e| crate::error::RaftError::RaftStorage(e.into()))?;
                    // A truncated-away range may have carried a membership
                    // entry; `self.membership` only ever moves forward when
                    // appending one, so without this it would keep a stale
                    // configuration the log itself no longer has. Roll it
                    // back to whatever the (now truncated) `conf` CF history
                    // says is in force.
                    if let Some(rolled_back) = self.log_storage.configuration_manager().last_configuration() {
                        self.membership = rolled_back;
                        self.publish_read_ctx();
                    }
                }

                let to_append = entries.split_off(keep);
                for entry in &to_append {
                    if let crate::raft::EntryPayload::ConfigChange(c) = &entry.payload {
                        self.membership = c.membership.clone();
                        self.publish_read_ctx();
                    }
                }
                let last_id = to_append.last().map(|e| e.log_id);
                self.log_storage.append_entries(to_append).await.map_err(|e| crate::error::RaftError::RaftStorage(e.into()))?;
                if let Some(last_id) = last_id {
                    self.last_log_id = last_id;
                }
            }
        }

        let commit_upper_bound = self.last_log_id.index;
        self.ballot_box.set_last_committed_index(req.leader_commit.min(commit_upper_bound));

        self.publish_metrics();
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }
}

