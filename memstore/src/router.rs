//! [`RaftRouter`]: an in-process [`ClientService`] that multiplexes RPCs to
//! a table of locally spawned nodes, plus the test-cluster bookkeeping
//! (`wait_for_*`, `isolate`, `leader`) that `raft-core`'s integration
//! tests are built against.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use async_trait::async_trait;
use raft_core::error::ClientReadError;
use raft_core::error::ClientWriteError;
use raft_core::error::ResponseError;
use raft_core::raft::AppendEntriesRequest;
use raft_core::raft::AppendEntriesResponse;
use raft_core::raft::ClientWriteRequest;
use raft_core::raft::InstallSnapshotRequest;
use raft_core::raft::InstallSnapshotResponse;
use raft_core::raft::PingRequest;
use raft_core::raft::PingResponse;
use raft_core::raft::ReadIndexRequest;
use raft_core::raft::ReadIndexResponse;
use raft_core::raft::TimeoutNowRequest;
use raft_core::raft::TimeoutNowResponse;
use raft_core::raft::VoteRequest;
use raft_core::raft::VoteResponse;
use raft_core::storage::RocksLogStorage;
use raft_core::Config;
use raft_core::NodeId;
use raft_core::NodeRole;
use raft_core::Raft;
use raft_core::RaftMetrics;
use raft_core::Wait;
use tempfile::TempDir;
use tokio::sync::RwLock;

use crate::state_machine::ClientRequest;
use crate::state_machine::ClientResponse;
use crate::MemStore;

/// A concrete `Raft` type used throughout the test suite.
pub type MemRaft = Raft<ClientRequest, ClientResponse>;

struct RegisteredNode {
    raft: MemRaft,
    store: Arc<MemStore>,
    /// Kept alive only so the backing directory isn't removed out from
    /// under the open `RocksLogStorage`; never read directly.
    _log_dir: TempDir,
}

/// An in-process stand-in for a real RPC transport: every node in a test
/// cluster shares one `RaftRouter`, which looks the target up in its
/// routing table and calls straight into its `Raft` handle.
pub struct RaftRouter {
    config: Arc<Config>,
    nodes: RwLock<BTreeMap<NodeId, RegisteredNode>>,
    isolated: RwLock<HashSet<NodeId>>,
    send_delay_ms: u64,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            nodes: Default::default(),
            isolated: Default::default(),
            send_delay_ms: 0,
        }
    }

    /// Emulate network jitter: every RPC sleeps a random duration in
    /// `[0, send_delay_ms)` before being delivered.
    pub fn with_send_delay(mut self, ms: u64) -> Self {
        self.send_delay_ms = ms;
        self
    }

    async fn rand_delay(&self) {
        if self.send_delay_ms == 0 {
            return;
        }
        let jitter = rand::random::<u64>() % self.send_delay_ms;
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }

    /// Spawn and register a new node bearing `id`, backed by a fresh
    /// temp-directory-rooted `RocksLogStorage` and an empty `MemStore`.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) -> anyhow::Result<()> {
        let log_dir = tempfile::tempdir().context("creating temp dir for node log storage")?;
        let log_storage = Arc::new(RocksLogStorage::open(
            log_dir.path(),
            self.config.raft_log_storage.clone(),
            self.config.sync,
        )?);
        let store = Arc::new(MemStore::new(id));
        let raft = Raft::spawn(id, self.config.clone(), self.clone(), log_storage, store.clone());
        self.nodes.write().await.insert(id, RegisteredNode { raft, store, _log_dir: log_dir });
        Ok(())
    }

    /// Remove `id` from the routing table (and from isolation, if
    /// present), returning its handle without shutting it down.
    pub async fn remove_node(&self, id: NodeId) -> Option<MemRaft> {
        let node = self.nodes.write().await.remove(&id);
        self.isolated.write().await.remove(&id);
        node.map(|n| n.raft)
    }

    /// Stop receiving and sending RPCs for `id`: both frames addressed to
    /// it and frames it originates are dropped.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    pub async fn restore_node(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    fn raft_of<'a>(nodes: &'a BTreeMap<NodeId, RegisteredNode>, id: NodeId) -> anyhow::Result<&'a MemRaft> {
        nodes.get(&id).map(|n| &n.raft).ok_or_else(|| anyhow!("node {} not found in routing table", id))
    }

    /// Bootstrap a cluster from every node currently registered, won by
    /// whichever of them is asked to `initialize` first.
    pub async fn initialize_from_single_node(&self, node: NodeId) -> anyhow::Result<()> {
        let nodes = self.nodes.read().await;
        let members = nodes.keys().copied().collect();
        Self::raft_of(&nodes, node)?.initialize(members).await?;
        Ok(())
    }

    pub async fn add_learner(&self, leader: NodeId, target: NodeId) -> Result<(), ResponseError> {
        let nodes = self.nodes.read().await;
        Self::raft_of(&nodes, leader).map_err(|e| ResponseError::RaftError(raft_core::RaftError::RaftNetwork(e)))?
            .add_learner(target)
            .await
    }

    pub async fn change_membership(&self, leader: NodeId, members: std::collections::BTreeSet<NodeId>) -> Result<(), ResponseError> {
        let nodes = self.nodes.read().await;
        Self::raft_of(&nodes, leader).map_err(|e| ResponseError::RaftError(raft_core::RaftError::RaftNetwork(e)))?
            .change_membership(members)
            .await
    }

    /// Propose `req` against `target`, panicking the test on failure.
    pub async fn client_write(&self, target: NodeId, req: ClientRequest) -> ClientResponse {
        match self.try_client_write(target, req).await {
            Ok(resp) => resp,
            Err(err) => panic!("client_write to node {} failed: {:?}", target, err),
        }
    }

    pub async fn try_client_write(&self, target: NodeId, req: ClientRequest) -> Result<ClientResponse, ClientWriteError<ClientRequest>> {
        let nodes = self.nodes.read().await;
        let raft = Self::raft_of(&nodes, target).map_err(|e| ClientWriteError::RaftError(raft_core::RaftError::RaftNetwork(e)))?;
        raft.client_write(ClientWriteRequest::new(req)).await.map(|r| r.data)
    }

    /// Issue `count` sequential writes from `client_id`, against `target`.
    pub async fn client_write_many(&self, target: NodeId, client_id: &str, count: u64) {
        for serial in 0..count {
            self.client_write(target, ClientRequest::new(client_id, serial, format!("request-{}", serial))).await;
        }
    }

    pub async fn client_read(&self, target: NodeId) -> Result<u64, ClientReadError> {
        let nodes = self.nodes.read().await;
        Self::raft_of(&nodes, target).map_err(|e| ClientReadError::RaftError(raft_core::RaftError::RaftNetwork(e)))?
            .client_read()
            .await
    }

    pub async fn current_leader(&self, target: NodeId) -> Option<NodeId> {
        let nodes = self.nodes.read().await;
        Self::raft_of(&nodes, target).ok()?.current_leader().await
    }

    pub async fn get_state_machine(&self, id: NodeId) -> Arc<MemStore> {
        self.nodes.read().await.get(&id).unwrap_or_else(|| panic!("node {} not registered", id)).store.clone()
    }

    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let nodes = self.nodes.read().await;
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes.values() {
            out.push(node.raft.metrics().borrow().clone());
        }
        out
    }

    /// The id of the non-isolated node which believes itself leader of
    /// itself, or `None` if the cluster has no settled leader right now.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated.read().await;
        self.latest_metrics()
            .await
            .into_iter()
            .find(|m| m.current_leader == Some(m.id) && !isolated.contains(&m.id))
            .map(|m| m.id)
    }

    pub async fn wait(&self, id: NodeId, timeout: Option<Duration>) -> anyhow::Result<Wait> {
        let nodes = self.nodes.read().await;
        Ok(Self::raft_of(&nodes, id)?.wait(timeout))
    }

    pub async fn wait_for_log(&self, ids: &[NodeId], index: u64, timeout: Option<Duration>) -> anyhow::Result<()> {
        for id in ids {
            self.wait(*id, timeout).await?.log(index).await?;
        }
        Ok(())
    }

    pub async fn wait_for_applied(&self, ids: &[NodeId], index: u64, timeout: Option<Duration>) -> anyhow::Result<()> {
        for id in ids {
            self.wait(*id, timeout).await?.applied_index(index).await?;
        }
        Ok(())
    }

    pub async fn wait_for_state(&self, ids: &[NodeId], state: NodeRole, timeout: Option<Duration>) -> anyhow::Result<()> {
        for id in ids {
            self.wait(*id, timeout).await?.state(state).await?;
        }
        Ok(())
    }

    fn check_reachable(isolated: &HashSet<NodeId>, target: NodeId, origin: NodeId) -> anyhow::Result<()> {
        if isolated.contains(&target) || isolated.contains(&origin) {
            return Err(anyhow!("node {} or {} is isolated", target, origin));
        }
        Ok(())
    }
}

#[async_trait]
impl raft_core::ClientService<ClientRequest> for RaftRouter {
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<ClientRequest>) -> anyhow::Result<AppendEntriesResponse> {
        self.rand_delay().await;
        let isolated = self.isolated.read().await;
        Self::check_reachable(&isolated, target, rpc.leader_id)?;
        drop(isolated);
        let nodes = self.nodes.read().await;
        let resp = Self::raft_of(&nodes, target)?.append_entries(rpc).await?;
        tracing::debug!(target, ?resp, "append_entries delivered");
        Ok(resp)
    }

    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> anyhow::Result<InstallSnapshotResponse> {
        self.rand_delay().await;
        let isolated = self.isolated.read().await;
        Self::check_reachable(&isolated, target, rpc.leader_id)?;
        drop(isolated);
        let nodes = self.nodes.read().await;
        Ok(Self::raft_of(&nodes, target)?.install_snapshot(rpc).await?)
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse> {
        self.rand_delay().await;
        let isolated = self.isolated.read().await;
        Self::check_reachable(&isolated, target, rpc.candidate_id)?;
        drop(isolated);
        let nodes = self.nodes.read().await;
        Ok(Self::raft_of(&nodes, target)?.vote(rpc).await?)
    }

    async fn read_index(&self, target: NodeId, rpc: ReadIndexRequest) -> anyhow::Result<ReadIndexResponse> {
        self.rand_delay().await;
        let isolated = self.isolated.read().await;
        Self::check_reachable(&isolated, target, rpc.requester_id)?;
        drop(isolated);
        let nodes = self.nodes.read().await;
        Ok(Self::raft_of(&nodes, target)?.read_index(rpc).await?)
    }

    async fn timeout_now(&self, target: NodeId, rpc: TimeoutNowRequest) -> anyhow::Result<TimeoutNowResponse> {
        self.rand_delay().await;
        if self.isolated.read().await.contains(&target) {
            return Err(anyhow!("node {} is isolated", target));
        }
        let nodes = self.nodes.read().await;
        Ok(Self::raft_of(&nodes, target)?.timeout_now(rpc).await?)
    }

    async fn ping(&self, target: NodeId, _rpc: PingRequest) -> anyhow::Result<PingResponse> {
        self.check_connection(target).await?;
        Ok(PingResponse {})
    }

    async fn check_connection(&self, target: NodeId) -> anyhow::Result<()> {
        if self.isolated.read().await.contains(&target) {
            return Err(anyhow!("node {} is isolated", target));
        }
        if !self.nodes.read().await.contains_key(&target) {
            return Err(anyhow!("node {} not found in routing table", target));
        }
        Ok(())
    }
}
