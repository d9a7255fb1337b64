//! Core identifiers shared across the consensus engine: log positions, peer
//! addresses and cluster configurations.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A Raft node identifier.
///
/// Teacher's `async-raft` used a bare `u64` for `NodeId`; this core keeps
/// that as the hashable key used everywhere a peer is looked up, while
/// `PeerId` (below) carries the full addressable identity of that peer.
pub type NodeId = u64;

/// `(term, index)` pair identifying a position in the replicated log.
///
/// `PartialOrd`/`Ord` are derived from field order, so two log ids compare
/// by `term` first and `index` second. This matches every comparison this
/// core actually performs on a `LogId` (conflict detection always checks
/// term equality before index), so the derived order is never a surprise:
/// a higher-term id always outranks one from an earlier term regardless of
/// index. `(0, 0)` denotes "no entry".
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// The sentinel "no entry" id.
    pub const fn none() -> Self {
        Self { term: 0, index: 0 }
    }

    pub fn is_none(&self) -> bool {
        self.index == 0 && self.term == 0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A peer's addressable identity: `(host, port, priority, idx)`.
///
/// Two peers are equal iff all four fields match; `idx` disambiguates
/// multiple logical peer roles bound to the same network endpoint (e.g. a
/// learner and a voter colocated for testing).
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    pub host: String,
    pub port: u16,
    pub priority: i32,
    pub idx: u32,
}

impl PeerId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority: 0,
            idx: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idx(mut self, idx: u32) -> Self {
        self.idx = idx;
        self
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.idx == 0 {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}#{}", self.host, self.port, self.idx)
        }
    }
}

/// A unique identifier for a snapshot, used to detect a restarted
/// `InstallSnapshot` stream vs. an out-of-order chunk of the current one.
pub type SnapshotId = String;

/// Identifies one chunk of an in-flight snapshot transfer, for diagnostics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

/// The cluster's membership configuration.
///
/// A *joint* configuration carries both `members` (the configuration
/// currently in force) and, while a reconfiguration is underway,
/// `members_after_consensus` (the configuration being transitioned to). A
/// commit during joint state requires quorum in **both** sets (spec.md §3).
/// `learners` receive the log but are never counted toward any quorum.
#[derive(Clone, Default, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Configuration {
    pub members: BTreeSet<NodeId>,
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
    pub learners: BTreeSet<NodeId>,
}

impl Configuration {
    /// Construct the initial single-member configuration used when a
    /// pristine node has not yet observed any configuration entry.
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            members,
            members_after_consensus: None,
            learners: BTreeSet::new(),
        }
    }

    /// All voting node ids across both halves of a joint configuration.
    pub fn all_voters(&self) -> BTreeSet<NodeId> {
        let mut all = self.members.clone();
        if let Some(new) = &self.members_after_consensus {
            all.extend(new);
        }
        all
    }

    /// All node ids this configuration knows about, voters and learners alike.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.all_voters();
        all.extend(self.learners.iter().copied());
        all
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.members.contains(id) || self.members_after_consensus.as_ref().map(|m| m.contains(id)).unwrap_or(false)
    }

    pub fn is_learner(&self, id: &NodeId) -> bool {
        self.learners.contains(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.is_voter(id) || self.is_learner(id)
    }

    pub fn is_joint(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// Collapse a joint configuration down to its "new" half. A no-op on a
    /// uniform configuration.
    pub fn to_final_config(&self) -> Self {
        match &self.members_after_consensus {
            None => self.clone(),
            Some(new_members) => Configuration {
                members: new_members.clone(),
                members_after_consensus: None,
                learners: self.learners.clone(),
            },
        }
    }
}
