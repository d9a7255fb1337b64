//! `Ballot`: the per-log-index quorum tally described in spec.md §3.

use crate::raft_types::Configuration;
use crate::raft_types::NodeId;

/// An opaque cursor accelerating repeated grants by the same peer across
/// adjacent indices (spec.md §3). A `Replicator` typically acks a
/// contiguous run of indices for one peer in a single `commit_at` call;
/// caching the peer's position in the current/old member lists avoids a
/// linear scan per index in that run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PosHint {
    pos: i64,
    old_pos: i64,
}

impl PosHint {
    pub fn new() -> Self {
        Self { pos: -1, old_pos: -1 }
    }
}

/// A quorum tally for one pending log index.
///
/// Tracks two counters, `quorum` (current configuration) and `old_quorum`
/// (the "old" half of a joint configuration, if any), along with a bitmap
/// of which peers have already granted. A ballot is granted once both
/// counters have reached zero (or just `quorum`, for a simple/non-joint
/// configuration).
#[derive(Clone, Debug)]
pub struct Ballot {
    peers: Vec<NodeId>,
    granted: Vec<bool>,
    quorum: i64,

    old_peers: Vec<NodeId>,
    old_granted: Vec<bool>,
    old_quorum: i64,
}

impl Ballot {
    /// Build a ballot requiring a majority of `conf`'s voters (both halves
    /// of a joint configuration, if present). Learners never participate:
    /// they are not added to either peer list.
    pub fn new(conf: &Configuration) -> Self {
        let peers: Vec<NodeId> = conf.members.iter().copied().collect();
        let quorum = crate::quorum::majority_of(peers.len()) as i64;
        let granted = vec![false; peers.len()];

        let (old_peers, old_granted, old_quorum) = match &conf.members_after_consensus {
            Some(old) => {
                let old_peers: Vec<NodeId> = old.iter().copied().collect();
                let old_quorum = crate::quorum::majority_of(old_peers.len()) as i64;
                let old_granted = vec![false; old_peers.len()];
                (old_peers, old_granted, old_quorum)
            }
            None => (Vec::new(), Vec::new(), 0),
        };

        Self {
            peers,
            granted,
            quorum,
            old_peers,
            old_granted,
            old_quorum,
        }
    }

    fn find(peers: &[NodeId], hint: i64, peer: NodeId) -> Option<usize> {
        if hint >= 0 {
            let hint = hint as usize;
            if hint < peers.len() && peers[hint] == peer {
                return Some(hint);
            }
        }
        peers.iter().position(|&p| p == peer)
    }

    /// Record a grant from `peer`. Returns `true` if this grant caused the
    /// ballot to become fully granted (both/either counter reaching zero).
    /// Re-grants from a peer which already granted are idempotent no-ops.
    pub fn grant(&mut self, peer: NodeId, hint: &mut PosHint) -> bool {
        let mut newly_granted_current = false;
        if let Some(idx) = Self::find(&self.peers, hint.pos, peer) {
            hint.pos = idx as i64;
            if !self.granted[idx] {
                self.granted[idx] = true;
                self.quorum -= 1;
                newly_granted_current = true;
            }
        }

        if newly_granted_current && !self.old_peers.is_empty() {
            if let Some(idx) = Self::find(&self.old_peers, hint.old_pos, peer) {
                hint.old_pos = idx as i64;
                if !self.old_granted[idx] {
                    self.old_granted[idx] = true;
                    self.old_quorum -= 1;
                }
            }
        } else if let Some(idx) = Self::find(&self.old_peers, hint.old_pos, peer) {
            // Peer may be a member only of the old group.
            hint.old_pos = idx as i64;
            if !self.old_granted[idx] {
                self.old_granted[idx] = true;
                self.old_quorum -= 1;
            }
        }

        self.is_granted()
    }

    pub fn is_granted(&self) -> bool {
        self.quorum <= 0 && self.old_quorum <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn conf(members: &[NodeId]) -> Configuration {
        Configuration {
            members: members.iter().copied().collect(),
            members_after_consensus: None,
            learners: BTreeSet::new(),
        }
    }

    #[test]
    fn simple_majority_grants() {
        let c = conf(&[1, 2, 3]);
        let mut b = Ballot::new(&c);
        let mut hint = PosHint::new();
        assert!(!b.grant(1, &mut hint));
        assert!(b.grant(2, &mut hint));
        // Re-granting an already-granted peer stays granted, doesn't toggle off.
        assert!(b.grant(1, &mut hint));
    }

    #[test]
    fn joint_requires_both_quorums() {
        let c = Configuration {
            members: [1, 2, 3].iter().copied().collect(),
            members_after_consensus: Some([3, 4, 5].iter().copied().collect()),
            learners: BTreeSet::new(),
        };
        let mut b = Ballot::new(&c);
        let mut hint = PosHint::new();
        assert!(!b.grant(1, &mut hint));
        assert!(!b.grant(2, &mut hint)); // current quorum (2/3) reached, old still needs 2
        assert!(!b.grant(3, &mut hint)); // 3 is in both groups, contributes to old too
        assert!(b.grant(4, &mut hint)); // old quorum now reached
    }

    #[test]
    fn unknown_peer_does_not_grant() {
        let c = conf(&[1, 2, 3]);
        let mut b = Ballot::new(&c);
        let mut hint = PosHint::new();
        assert!(!b.grant(42, &mut hint));
        assert!(!b.is_granted());
    }
}
