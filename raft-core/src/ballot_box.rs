//! `BallotBox`: lock-free-read quorum tally over a run of pending log
//! indices (spec.md §4.2).
//!
//! Only a leader's `BallotBox` is "active" (has a non-zero `pending_index`
//! and a non-empty ballot queue). Followers call `set_last_committed_index`
//! directly whenever a heartbeat/append carries a newer leader commit index.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::ballot::Ballot;
use crate::ballot::PosHint;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft_types::Configuration;
use crate::raft_types::NodeId;

/// A `u64` published under a sequence-counter discipline: writers bump the
/// counter to odd before mutating the value and back to even after: readers
/// retry on an odd/torn observation instead of blocking. This gives
/// `last_committed_index()` a genuinely lock-free fast path, matching the
/// "optimistic read, fall back to a shared lock only on validation failure"
/// requirement, without needing `unsafe` since the payload is itself a
/// single, tear-free atomic word.
struct SeqCell {
    seq: AtomicU64,
    value: AtomicU64,
}

impl SeqCell {
    fn new(initial: u64) -> Self {
        Self {
            seq: AtomicU64::new(0),
            value: AtomicU64::new(initial),
        }
    }

    /// Must be called with the `BallotBox` write lock held.
    fn store(&self, value: u64) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.value.store(value, Ordering::Release);
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    fn load(&self) -> u64 {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let v = self.value.load(Ordering::Acquire);
            let s2 = self.seq.load(Ordering::Acquire);
            if s1 == s2 {
                return v;
            }
            std::hint::spin_loop();
        }
    }
}

struct Inner {
    /// Index of the oldest ballot in `queue`; `0` while inactive.
    pending_index: u64,
    queue: VecDeque<Ballot>,
    pos_hints: HashMap<NodeId, PosHint>,
}

/// Tracks, for every log index the current leader term has proposed but not
/// yet committed, which voters have acknowledged it. Appends are made in
/// strict index order by `append_pending_task`; `commit_at` is called once
/// per `AppendEntries` response and may grant a contiguous run of indices in
/// one pass.
pub struct BallotBox {
    committed: SeqCell,
    inner: Mutex<Inner>,
}

impl BallotBox {
    pub fn new() -> Self {
        Self {
            committed: SeqCell::new(0),
            inner: Mutex::new(Inner {
                pending_index: 0,
                queue: VecDeque::new(),
                pos_hints: HashMap::new(),
            }),
        }
    }

    /// Lock-free read of the last committed index.
    pub fn last_committed_index(&self) -> u64 {
        self.committed.load()
    }

    /// Called when a node becomes leader: activates the box starting at
    /// `new_pending_index` (typically `last_log_index + 1`). Requires the
    /// box to currently be inactive (`pending_index == 0` and an empty
    /// queue — a leader only ever does this once, right after a step-down
    /// cleared it) and `new_pending_index > last_committed_index`; either
    /// precondition failing means a double-activation bug upstream, which
    /// is surfaced as a safety violation rather than silently clearing
    /// whatever was pending (spec.md §4.2, §7).
    pub fn reset_pending_index(&self, new_pending_index: u64) -> RaftResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_index != 0 || !inner.queue.is_empty() {
            return Err(RaftError::SafetyViolation(format!(
                "reset_pending_index({new_pending_index}) called on an already-active BallotBox (pending_index={}, {} queued ballots)",
                inner.pending_index,
                inner.queue.len()
            )));
        }
        let committed = self.committed.load();
        if new_pending_index <= committed {
            return Err(RaftError::SafetyViolation(format!(
                "reset_pending_index({new_pending_index}) must exceed last_committed_index ({committed})"
            )));
        }
        inner.pending_index = new_pending_index;
        inner.queue.clear();
        inner.pos_hints.clear();
        Ok(())
    }

    /// Append a ballot for the next pending index (`pending_index +
    /// queue.len()`), requiring a majority of `conf`. Returns the index the
    /// new ballot was assigned.
    pub fn append_pending_task(&self, conf: &Configuration) -> RaftResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_index == 0 {
            return Err(RaftError::SafetyViolation(
                "append_pending_task called on an inactive BallotBox".into(),
            ));
        }
        let index = inner.pending_index + inner.queue.len() as u64;
        inner.queue.push_back(Ballot::new(conf));
        Ok(index)
    }

    /// Record that `peer` has acknowledged every index in
    /// `[first_log_index, last_log_index]`. Returns `Some(new_index)` if the
    /// commit index advanced as a result.
    pub fn commit_at(&self, first_log_index: u64, last_log_index: u64, peer: NodeId) -> RaftResult<Option<u64>> {
        if last_log_index < first_log_index {
            return Ok(None);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_index == 0 {
            // Box isn't active (not leader, or stepped down mid-flight); ignore stale acks.
            return Ok(None);
        }

        let start = first_log_index.max(inner.pending_index);
        if start > last_log_index {
            return Ok(None);
        }

        let mut hint = inner.pos_hints.remove(&peer).unwrap_or_default();
        let base = inner.pending_index;

        for index in start..=last_log_index {
            let offset = (index - base) as usize;
            let ballot = match inner.queue.get_mut(offset) {
                Some(b) => b,
                None => break,
            };
            ballot.grant(peer, &mut hint);
        }
        inner.pos_hints.insert(peer, hint);

        // A ballot only counts toward advancing the commit index once every
        // ballot *before* it is also granted: the leader completeness
        // property requires committing in index order.
        let mut advanced_to = None;
        while let Some(front) = inner.queue.front() {
            if front.is_granted() {
                inner.queue.pop_front();
                inner.pending_index += 1;
                advanced_to = Some(inner.pending_index - 1);
            } else {
                break;
            }
        }

        if let Some(new_committed) = advanced_to {
            self.committed.store(new_committed);
            Ok(Some(new_committed))
        } else {
            Ok(None)
        }
    }

    /// Follower/learner path: directly publish a commit index observed from
    /// the leader, bypassing quorum tallying entirely.
    pub fn set_last_committed_index(&self, index: u64) {
        let inner = self.inner.lock().unwrap();
        // Only ever moves forward; a stale append carrying an older leader
        // commit index must not regress what's already been made visible.
        if index > self.committed.load() {
            self.committed.store(index);
        }
        drop(inner);
    }

    /// Deactivate the box (stepping down from leader), returning the
    /// `[pending_index, pending_index + queue.len())` range of indices whose
    /// ballots were discarded, so the caller can fail any client requests
    /// still waiting on them.
    pub fn clear_pending_tasks(&self) -> Option<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_index == 0 || inner.queue.is_empty() {
            inner.pending_index = 0;
            inner.queue.clear();
            inner.pos_hints.clear();
            return None;
        }
        let range = (inner.pending_index, inner.pending_index + inner.queue.len() as u64);
        inner.pending_index = 0;
        inner.queue.clear();
        inner.pos_hints.clear();
        Some(range)
    }
}

impl Default for BallotBox {
    fn default() -> Self {
        Self::new()
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
    fn simple_commit_advances_in_order() {
        let bb = BallotBox::new();
        bb.reset_pending_index(1).unwrap();
        let c = conf(&[1, 2, 3]);
        assert_eq!(bb.append_pending_task(&c).unwrap(), 1);
        assert_eq!(bb.append_pending_task(&c).unwrap(), 2);

        assert_eq!(bb.last_committed_index(), 0);
        // Self-vote (leader counts itself, id 1) plus peer 2 reaches majority.
        assert_eq!(bb.commit_at(1, 2, 1).unwrap(), None);
        assert_eq!(bb.commit_at(1, 2, 2).unwrap(), Some(2));
        assert_eq!(bb.last_committed_index(), 2);
    }

    #[test]
    fn commit_stalls_behind_ungranted_predecessor() {
        let bb = BallotBox::new();
        bb.reset_pending_index(1).unwrap();
        let c = conf(&[1, 2, 3]);
        bb.append_pending_task(&c).unwrap();
        bb.append_pending_task(&c).unwrap();

        // Peer 2 acks only index 2 (one of two grants needed); nothing may
        // commit yet even though ballot 2 is halfway to its own majority.
        assert_eq!(bb.commit_at(2, 2, 2).unwrap(), None);
        assert_eq!(bb.last_committed_index(), 0);

        // Peer 1 acks only index 1, also one of two grants needed there.
        assert_eq!(bb.commit_at(1, 1, 1).unwrap(), None);
        assert_eq!(bb.last_committed_index(), 0);

        // Peer 3 acks both: completes ballot 1's majority (1,3), which pops
        // the front and then finds ballot 2 already at majority (2,3) too,
        // cascading the commit index straight to 2.
        assert_eq!(bb.commit_at(1, 2, 3).unwrap(), Some(2));
    }

    #[test]
    fn set_last_committed_index_never_regresses() {
        let bb = BallotBox::new();
        bb.set_last_committed_index(5);
        assert_eq!(bb.last_committed_index(), 5);
        bb.set_last_committed_index(3);
        assert_eq!(bb.last_committed_index(), 5);
        bb.set_last_committed_index(9);
        assert_eq!(bb.last_committed_index(), 9);
    }

    #[test]
    fn clear_pending_tasks_reports_discarded_range() {
        let bb = BallotBox::new();
        bb.reset_pending_index(10).unwrap();
        let c = conf(&[1, 2, 3]);
        bb.append_pending_task(&c).unwrap();
        bb.append_pending_task(&c).unwrap();
        bb.append_pending_task(&c).unwrap();
        assert_eq!(bb.clear_pending_tasks(), Some((10, 13)));
        assert_eq!(bb.clear_pending_tasks(), None);
    }

    #[test]
    fn append_pending_task_rejects_inactive_box() {
        let bb = BallotBox::new();
        let c = conf(&[1, 2, 3]);
        assert!(bb.append_pending_task(&c).is_err());
    }

    #[test]
    fn reset_pending_index_rejects_double_activation() {
        let bb = BallotBox::new();
        bb.reset_pending_index(1).unwrap();
        assert!(bb.reset_pending_index(5).is_err());
    }

    #[test]
    fn reset_pending_index_rejects_non_advancing_index() {
        let bb = BallotBox::new();
        bb.set_last_committed_index(10);
        assert!(bb.reset_pending_index(10).is_err());
        assert!(bb.reset_pending_index(5).is_err());
        bb.reset_pending_index(11).unwrap();
    }
}
