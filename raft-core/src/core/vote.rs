//! Candidate campaigns, vote granting, and the leader-transfer RPC
//! (spec.md §5.2/§5.4, §4.10).

use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::client_service::ClientService;
use crate::core::ReadContext;
use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::raft::EntryPayload;
use crate::raft::ReadIndexRequest;
use crate::raft::ReadIndexResponse;
use crate::raft::TimeoutNowRequest;
use crate::raft::TimeoutNowResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
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
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }
        self.observe_term(req.term).await?;

        let already_voted_other = matches!(self.voted_for, Some(v) if v != req.candidate_id);
        let candidate_log_ok = req.last_log_id >= self.last_log_id;

        if !already_voted_other && candidate_log_ok {
            self.save_hard_state(self.current_term, Some(req.candidate_id)).await?;
            self.reset_election_timeout();
            Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            })
        } else {
            Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            })
        }
    }

    pub(super) async fn handle_timeout_now_request(&mut self, req: TimeoutNowRequest) -> RaftResult<TimeoutNowResponse> {
        if req.term < self.current_term {
            return Ok(TimeoutNowResponse { term: self.current_term });
        }
        self.observe_term(req.term).await?;
        if self.role.is_follower() && self.membership.is_voter(&self.id) {
            self.start_election().await?;
        }
        Ok(TimeoutNowResponse { term: self.current_term })
    }

    /// The leader-relay half of the ReadIndex protocol: a peer (usually a
    /// follower forwarding a client's read) asks this node — believed to be
    /// the leader — to confirm it still holds a live quorum and report the
    /// index the requester should wait for locally. Returning `read_index:
    /// 0` signals "not applicable" (stale term or not actually the leader)
    /// rather than failing the RPC outright, since a routine "not leader"
    /// reply must never abort this node's own main loop.
    pub(super) async fn handle_read_index_request(&mut self, req: ReadIndexRequest) -> RaftResult<ReadIndexResponse> {
        if req.term < self.current_term {
            return Ok(ReadIndexResponse {
                term: self.current_term,
                read_index: 0,
            });
        }
        self.observe_term(req.term).await?;
        if !self.role.is_leader() {
            return Ok(ReadIndexResponse {
                term: self.current_term,
                read_index: 0,
            });
        }

        let ctx = ReadContext {
            role: self.role,
            term: self.current_term,
            leader_id: self.current_leader,
            voters: self.membership.all_voters(),
        };
        let read_index = match super::client::confirm_leadership(self.id, self.config.clone(), self.client_service.clone(), self.ballot_box.clone(), ctx).await
        {
            Ok(index) => index,
            Err(_) => 0,
        };
        Ok(ReadIndexResponse {
            term: self.current_term,
            read_index,
        })
    }

    /// Contest an election: bump the term, vote for self, and fan out
    /// `RequestVote` RPCs to every other voter. A single-node cluster wins
    /// immediately without sending anything (spec.md §5.2 "no election
    /// needed" case, generalized from the old teacher's special-case into
    /// the ordinary quorum check below).
    pub(super) async fn start_election(&mut self) -> RaftResult<()> {
        self.role = NodeRole::Candidate;
        let new_term = self.current_term + 1;
        self.save_hard_state(new_term, Some(self.id)).await?;
        self.current_leader = None;
        self.reset_election_timeout();
        self.publish_read_ctx();
        self.publish_metrics();

        let voters = self.membership.all_voters();
        let needed = crate::quorum::majority_of(voters.len());
        let mut granted = 1usize; // self-vote
        if granted >= needed {
            return self.become_leader().await;
        }

        let rpc = VoteRequest::new(new_term, self.id, self.last_log_id);
        let timeout_dur = Duration::from_millis(self.config.election_timeout_min);
        let mut pending = FuturesUnordered::new();
        for peer in voters.iter().filter(|p| **p != self.id) {
            let target = *peer;
            let client_service = self.client_service.clone();
            let rpc = rpc.clone();
            pending.push(async move {
                match tokio::time::timeout(timeout_dur, client_service.vote(target, rpc)).await {
                    Ok(Ok(resp)) => Ok((target, resp)),
                    Ok(Err(err)) => Err((target, err)),
                    Err(_) => Err((target, anyhow::anyhow!("vote request to {target} timed out"))),
                }
            });
        }

        while let Some(res) = pending.next().await {
            if !self.role.is_candidate() || self.current_term != new_term {
                return Ok(());
            }
            match res {
                Ok((_, resp)) if resp.term > self.current_term => {
                    self.become_follower(resp.term, None).await?;
                    return Ok(());
                }
                Ok((_, resp)) if resp.vote_granted => {
                    granted += 1;
                    if granted >= needed {
                        return self.become_leader().await;
                    }
                }
                Ok(_) => {}
                Err((target, err)) => tracing::warn!(target, error = %err, "vote request failed"),
            }
        }
        Ok(())
    }

    pub(super) async fn become_leader(&mut self) -> RaftResult<()> {
        self.role = NodeRole::Leader;
        self.current_leader = Some(self.id);
        self.ballot_box.reset_pending_index(self.last_log_id.index + 1)?;

        self.sync_replicators();
        self.reset_election_timeout();
        self.publish_read_ctx();
        self.publish_metrics();

        // Commit a blank entry to anchor the new term (spec.md §5.4 "no
        // log entries from previous terms are committed by count alone").
        self.append_entry(EntryPayload::Blank).await?;
        Ok(())
    }
}
