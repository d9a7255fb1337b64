//! In-memory, ordered history of observed configuration entries, kept in
//! lockstep with the `conf` column family (spec.md §4.2).

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::raft_types::Configuration;
use crate::raft_types::LogId;

/// Tracks every `(LogId, Configuration)` pair observed so far, in log-index
/// order. Rebuilt by replaying the `conf` CF at `LogStorage::init`, then
/// kept current as new configuration entries are appended, truncated, or
/// snapshotted away.
pub struct ConfigurationManager {
    inner: Mutex<BTreeMap<u64, (LogId, Configuration)>>,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self { inner: Mutex::new(BTreeMap::new()) }
    }

    /// Record a newly observed (or replayed) configuration entry.
    pub fn add(&self, log_id: LogId, config: Configuration) {
        self.inner.lock().unwrap().insert(log_id.index, (log_id, config));
    }

    /// Drop every entry below `index`, mirroring `LogStorage::truncate_prefix`.
    pub fn truncate_prefix(&self, index: u64) {
        let mut inner = self.inner.lock().unwrap();
        let tail = inner.split_off(&index);
        *inner = tail;
    }

    /// Drop every entry above `index`, mirroring `LogStorage::truncate_suffix`.
    pub fn truncate_suffix(&self, index: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|&k, _| k <= index);
    }

    /// The most recently observed configuration, or `None` if no
    /// configuration entry has ever been seen (a pristine node).
    pub fn last_configuration(&self) -> Option<Configuration> {
        self.inner.lock().unwrap().values().next_back().map(|(_, c)| c.clone())
    }

    pub fn last_configuration_log_id(&self) -> Option<LogId> {
        self.inner.lock().unwrap().values().next_back().map(|(id, _)| *id)
    }

    /// The configuration in force at or before `upto`, used when building a
    /// snapshot so its metadata records the membership as of that point.
    pub fn snapshot_configuration(&self, upto: u64) -> Option<Configuration> {
        self.inner
            .lock()
            .unwrap()
            .range(..=upto)
            .next_back()
            .map(|(_, (_, c))| c.clone())
    }
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn conf(id: u64) -> Configuration {
        Configuration {
            members: [id].iter().copied().collect(),
            members_after_consensus: None,
            learners: BTreeSet::new(),
        }
    }

    #[test]
    fn tracks_latest_and_truncates() {
        let cm = ConfigurationManager::new();
        cm.add(LogId::new(1, 1), conf(1));
        cm.add(LogId::new(1, 5), conf(2));
        cm.add(LogId::new(2, 9), conf(3));

        assert_eq!(cm.last_configuration(), Some(conf(3)));
        assert_eq!(cm.snapshot_configuration(5), Some(conf(2)));
        assert_eq!(cm.snapshot_configuration(0), None);

        cm.truncate_suffix(5);
        assert_eq!(cm.last_configuration(), Some(conf(2)));

        cm.truncate_prefix(5);
        assert_eq!(cm.last_configuration(), Some(conf(2)));
        cm.truncate_prefix(6);
        assert_eq!(cm.last_configuration(), None);
    }
}
