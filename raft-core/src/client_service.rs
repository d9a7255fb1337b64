//! `ClientService`: the abstract RPC transport a `Node` sends outbound
//! requests through (spec.md §4.7), generalizing the teacher's
//! `RaftNetwork` trait to the richer message set (append entries, vote,
//! install snapshot, read index, timeout-now, ping).

use async_trait::async_trait;

use crate::error::RaftError;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::PingRequest;
use crate::raft::PingResponse;
use crate::raft::ReadIndexRequest;
use crate::raft::ReadIndexResponse;
use crate::raft::TimeoutNowRequest;
use crate::raft::TimeoutNowResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A pluggable transport for sending Raft RPCs to other members of the
/// cluster. Implementations are free to use gRPC, raw TCP framing, an
/// in-process router (as the test-harness `memstore` crate does), or
/// anything else: the core never constructs a connection itself, it only
/// calls through this trait.
///
/// Every method takes the target's [`NodeId`] rather than an address: the
/// implementation is responsible for keeping its own address book in sync
/// with the committed [`crate::Configuration`] (surfaced via
/// `Raft::metrics()`).
#[async_trait]
pub trait ClientService<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an `AppendEntries` RPC to `target`.
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> anyhow::Result<AppendEntriesResponse>;

    /// Send an `InstallSnapshot` RPC to `target`.
    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> anyhow::Result<InstallSnapshotResponse>;

    /// Send a `Vote` RPC to `target`.
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;

    /// Send a `ReadIndex` RPC to `target`, used by a follower forwarding a
    /// linearizable read to the leader.
    async fn read_index(&self, target: NodeId, rpc: ReadIndexRequest) -> anyhow::Result<ReadIndexResponse> {
        let _ = (target, rpc);
        Err(RaftError::RaftNetwork(anyhow::anyhow!("read_index is not supported by this transport")).into())
    }

    /// Ask `target` to immediately start an election, bypassing its
    /// election timeout (used to hand off leadership cleanly).
    async fn timeout_now(&self, target: NodeId, rpc: TimeoutNowRequest) -> anyhow::Result<TimeoutNowResponse> {
        let _ = (target, rpc);
        Err(RaftError::RaftNetwork(anyhow::anyhow!("timeout_now is not supported by this transport")).into())
    }

    /// A liveness probe independent of the Raft heartbeat, used by
    /// `check_connection`/leader-lease bookkeeping.
    async fn ping(&self, target: NodeId, rpc: PingRequest) -> anyhow::Result<PingResponse> {
        let _ = rpc;
        self.check_connection(target).await?;
        Ok(PingResponse {})
    }

    /// Proactively (re)establish a connection to `target`, if the
    /// transport maintains persistent connections. The default is a no-op,
    /// suitable for a connect-per-call transport.
    async fn connect(&self, target: NodeId) -> anyhow::Result<()> {
        let _ = target;
        Ok(())
    }

    /// Tear down any connection state held for `target` (e.g. on its
    /// removal from the configuration).
    async fn disconnect(&self, target: NodeId) -> anyhow::Result<()> {
        let _ = target;
        Ok(())
    }

    /// Returns `Ok(())` if `target` is currently considered reachable.
    async fn check_connection(&self, target: NodeId) -> anyhow::Result<()> {
        let _ = target;
        Ok(())
    }
}
