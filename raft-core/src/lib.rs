//! A Raft consensus core for a replicated key-value platform.
//!
//! This crate implements the replicated log, leader election, membership
//! reconfiguration (including joint consensus and learners), linearizable
//! ReadIndex reads, and snapshot installation that a storage node builds its
//! state machine on top of. It does not implement a state machine, a query
//! planner, or a wire protocol of its own: those are supplied by the
//! embedder through the [`StateMachine`] and [`ClientService`] traits.

#![allow(clippy::type_complexity)]

pub mod ballot;
pub mod ballot_box;
pub mod client_service;
pub mod config;
pub mod core;
pub mod error;
pub mod fsm_caller;
pub mod metrics;
pub mod quorum;
pub mod raft;
pub mod raft_types;
pub mod read_only_service;
pub mod replication;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use client_service::ClientService;
pub use config::Config;
pub use config::ConfigError;
pub use error::ChangeConfigError;
pub use error::ClientReadError;
pub use error::ClientWriteError;
pub use error::InitializeError;
pub use error::RaftError;
pub use error::RaftResult;
pub use fsm_caller::StateMachine;
pub use metrics::RaftMetrics;
pub use metrics::Wait;
pub use raft::Raft;
pub use raft_types::Configuration;
pub use raft_types::LogId;
pub use raft_types::NodeId;
pub use raft_types::PeerId;
pub use read_only_service::ReadOnlyService;
pub use storage::LogStorage;

/// Marker trait for the application-defined payload carried by a normal log
/// entry (the write a client proposes). Blanket-implemented for any type
/// meeting the bounds the core needs to move it across `tokio` channels and
/// serialize it to the log and to the wire.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Marker trait for the response an [`AppData`] write produces once applied
/// to the state machine.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The role a node currently believes it occupies. Renamed from the
/// teacher's `State` to match this protocol's FOLLOWER/CANDIDATE/LEADER/
/// LEARNER terminology; `Learner` is a voting-less sink role occupied both
/// by nodes still catching up before being promoted to voter and by
/// permanent non-voting observers.
#[derive(Clone, Copy, Debug, Serialize, serde::Deserialize, Eq, PartialEq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
    Learner,
    Shutdown,
}

impl NodeRole {
    pub fn is_follower(&self) -> bool {
        matches!(self, NodeRole::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeRole::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, NodeRole::Leader)
    }

    pub fn is_learner(&self) -> bool {
        matches!(self, NodeRole::Learner)
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, NodeRole::Shutdown)
    }
}

/// A terse, single-line rendering used in `tracing` fields for types which
/// are otherwise too large to log in full (log entries, RPC payloads).
/// Every concrete RPC/entry type in this crate implements it so that trace
/// spans stay readable under load.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
