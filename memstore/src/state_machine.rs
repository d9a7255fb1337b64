//! [`MemStore`]: a trivial key-value [`StateMachine`] storing the last
//! status string written by each client, with per-client serial dedup so a
//! retried write is never applied twice.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use raft_core::raft::SnapshotMeta;
use raft_core::raft_types::Configuration;
use raft_core::raft_types::LogId;
use raft_core::raft_types::NodeId;
use raft_core::StateMachine;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// A client write: `client` identifies the proposer, `serial` is a
/// monotonic per-client request number used to detect retries, and
/// `status` is the value recorded for that client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRequest {
    pub client: String,
    pub serial: u64,
    pub status: String,
}

impl ClientRequest {
    pub fn new(client: impl Into<String>, serial: u64, status: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            serial,
            status: status.into(),
        }
    }
}

/// The value previously recorded for a client, returned by `apply` so the
/// caller can see what it's overwriting.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientResponse {
    pub previous: Option<String>,
}

/// The serializable contents of a [`MemStore`], exchanged whole as a
/// snapshot (spec.md §4.4 "snapshot install").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStoreSnapshot {
    pub last_applied_log: LogId,
    pub data: BTreeMap<String, String>,
    /// `client -> (last serial applied, response returned for it)`, so a
    /// snapshot receiver can still reject/dedup a replayed write for a
    /// serial it never saw committed locally.
    pub client_serial: HashMap<String, (u64, ClientResponse)>,
}

struct Inner {
    snapshot: MemStoreSnapshot,
}

/// An in-memory state machine keyed by client id. Every apply is O(1); the
/// whole store is small enough that `build_snapshot` just serializes it in
/// full, matching the teacher's own in-memory `MemStore` semantics.
pub struct MemStore {
    id: NodeId,
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            inner: RwLock::new(Inner { snapshot: MemStoreSnapshot::default() }),
        }
    }

    /// The value currently recorded for `client`, if any. Used by tests to
    /// assert on applied state without going through a `ClientService`.
    pub async fn get(&self, client: &str) -> Option<String> {
        self.inner.read().await.snapshot.data.get(client).cloned()
    }

    pub async fn last_applied_log_id(&self) -> LogId {
        self.inner.read().await.snapshot.last_applied_log
    }
}

#[async_trait]
impl StateMachine<ClientRequest, ClientResponse> for MemStore {
    async fn apply(&self, log_id: LogId, data: &ClientRequest) -> anyhow::Result<ClientResponse> {
        let mut inner = self.inner.write().await;
        inner.snapshot.last_applied_log = log_id;

        if let Some((serial, resp)) = inner.snapshot.client_serial.get(&data.client) {
            if *serial == data.serial {
                return Ok(resp.clone());
            }
        }

        let previous = inner.snapshot.data.insert(data.client.clone(), data.status.clone());
        let resp = ClientResponse { previous };
        inner.snapshot.client_serial.insert(data.client.clone(), (data.serial, resp.clone()));
        Ok(resp)
    }

    async fn last_applied_log(&self) -> anyhow::Result<LogId> {
        Ok(self.inner.read().await.snapshot.last_applied_log)
    }

    async fn build_snapshot(&self) -> anyhow::Result<(SnapshotMeta, Vec<u8>)> {
        let inner = self.inner.read().await;
        let bytes = serde_json::to_vec(&inner.snapshot)?;
        let meta = SnapshotMeta {
            id: format!("mem-snap-{}-{}", inner.snapshot.last_applied_log.term, inner.snapshot.last_applied_log.index),
            last_log_id: inner.snapshot.last_applied_log,
            membership: Configuration::new_initial(self.id),
        };
        Ok((meta, bytes))
    }

    async fn install_snapshot(&self, meta: &SnapshotMeta, data: Vec<u8>) -> anyhow::Result<()> {
        let snapshot = if data.is_empty() {
            MemStoreSnapshot {
                last_applied_log: meta.last_log_id,
                ..Default::default()
            }
        } else {
            serde_json::from_slice(&data)?
        };
        self.inner.write().await.snapshot = snapshot;
        Ok(())
    }
}
