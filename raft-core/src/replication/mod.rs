//! Per-follower replication (spec.md §4.4 "Replicator", §5.3, §7).
//!
//! One `ReplicationStream` is spawned per voter or learner while this node
//! is leader. It owns no state shared with `core::RaftCore` beyond a
//! `BallotBox` handle: acknowledgements are folded into the commit index
//! directly via `BallotBox::commit_at`, rather than routed back through the
//! leader's main loop, so a slow follower can never head-of-line block
//! another's ack from advancing the commit point.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use crate::ballot_box::BallotBox;
use crate::client_service::ClientService;
use crate::config::Config;
use crate::raft::AppendEntriesRequest;
use crate::raft::ConflictOpt;
use crate::raft::InstallSnapshotRequest;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::storage::LogStorage;
use crate::AppData;
use crate::MessageSummary;

/// Snapshot of one replicator's progress, published for `RaftMetrics`.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// Messages the leader's main loop feeds into a replicator.
pub(crate) enum RaftEvent {
    /// A new entry was appended locally; replicate up through it.
    Replicate { log_id: LogId },
    /// The leader is stepping down or the stream's target was removed from
    /// the configuration; finish in-flight work and exit.
    Terminate,
}

/// Handle a leader holds on one follower's or learner's replication task.
pub struct ReplicationStream {
    repl_tx: mpsc::UnboundedSender<RaftEvent>,
    pub matched_rx: watch::Receiver<LogId>,
}

impl ReplicationStream {
    /// Spawn a replicator targeting `target`, starting from `last_log_id`
    /// (the leader's log tail at spawn time).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<D, N, S>(
        leader_id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log_id: LogId,
        commit_index: Arc<AtomicU64>,
        client_service: Arc<N>,
        log_storage: Arc<S>,
        ballot_box: Arc<BallotBox>,
        is_learner: bool,
    ) -> Self
    where
        D: AppData,
        N: ClientService<D>,
        S: LogStorage<D>,
    {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let (matched_tx, matched_rx) = watch::channel(LogId::none());

        let core = ReplicationCore {
            leader_id,
            target,
            term,
            config,
            commit_index,
            client_service,
            log_storage,
            ballot_box,
            is_learner,
            next_index: last_log_id.index + 1,
            matched: LogId::none(),
            matched_tx,
            repl_rx,
        };

        tokio::spawn(core.run().instrument(tracing::debug_span!("replicate", target = target, term = term)));

        Self { repl_tx, matched_rx }
    }

    pub fn replicate(&self, log_id: LogId) {
        let _ = self.repl_tx.send(RaftEvent::Replicate { log_id });
    }

    pub fn terminate(&self) {
        let _ = self.repl_tx.send(RaftEvent::Terminate);
    }
}

/// One follower's replication state machine: drives `AppendEntries` at
/// line rate when caught up, falls back to `InstallSnapshot` when the
/// follower's `next_index` has fallen behind the leader's purged prefix,
/// and otherwise backs off on conflict and retries (spec.md §5.3, §7).
struct ReplicationCore<D, N, S>
where
    D: AppData,
    N: ClientService<D>,
    S: LogStorage<D>,
{
    leader_id: NodeId,
    target: NodeId,
    term: u64,
    config: Arc<Config>,
    commit_index: Arc<AtomicU64>,
    client_service: Arc<N>,
    log_storage: Arc<S>,
    ballot_box: Arc<BallotBox>,
    is_learner: bool,

    /// Index of the next entry to send this follower.
    next_index: u64,
    /// Highest log id this follower is known to have durably appended.
    matched: LogId,
    matched_tx: watch::Sender<LogId>,
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,
}

impl<D, N, S> ReplicationCore<D, N, S>
where
    D: AppData,
    N: ClientService<D>,
    S: LogStorage<D>,
{
    async fn run(mut self) {
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval);
        let mut tick = tokio::time::interval(heartbeat);

        loop {
            tokio::select! {
                biased;

                event = self.repl_rx.recv() => {
                    match event {
                        Some(RaftEvent::Replicate { .. }) => {
                            if let Err(err) = self.drain_to_line_rate().await {
                                tracing::warn!(target = self.target, error = %err, "replication round failed");
                            }
                        }
                        Some(RaftEvent::Terminate) | None => return,
                    }
                }

                _ = tick.tick() => {
                    if let Err(err) = self.drain_to_line_rate().await {
                        tracing::warn!(target = self.target, error = %err, "heartbeat replication failed");
                    }
                }
            }
        }
    }

    /// Ship everything between `next_index` and the leader's current log
    /// tail, one `AppendEntries` payload at a time (or a heartbeat if
    /// already caught up), installing a snapshot first if the follower has
    /// fallen behind the purged prefix.
    async fn drain_to_line_rate(&mut self) -> anyhow::Result<()> {
        loop {
            let first_index = self.log_storage.first_log_index();
            if self.next_index != 0 && self.next_index < first_index {
                self.install_snapshot().await?;
                continue;
            }

            let last_index = self.log_storage.last_log_index();
            let prev_log_id = if self.next_index <= 1 {
                LogId::none()
            } else {
                self.log_storage.get_entry(self.next_index - 1).await?.map(|e| e.log_id).unwrap_or_else(LogId::none)
            };

            let entries = if self.next_index <= last_index {
                let batch_end = (self.next_index + self.config.max_payload_entries).min(last_index + 1);
                let mut buf = Vec::with_capacity((batch_end - self.next_index) as usize);
                for idx in self.next_index..batch_end {
                    if let Some(entry) = self.log_storage.get_entry(idx).await? {
                        buf.push(entry);
                    }
                }
                buf
            } else {
                Vec::new()
            };

            let sending_anything = !entries.is_empty();
            let last_sent = entries.last().map(|e| e.log_id);

            let rpc = AppendEntriesRequest {
                term: self.term,
                leader_id: self.leader_id,
                prev_log_id,
                entries,
                leader_commit: self.commit_index.load(Ordering::Acquire),
            };
            tracing::debug!(target = self.target, rpc = %rpc.summary(), "sending append_entries");

            let started = Instant::now();
            let resp = self.client_service.append_entries(self.target, rpc).await?;

            if resp.term > self.term {
                anyhow::bail!("observed higher term {} from {}, stepping down", resp.term, self.target);
            }

            if resp.success {
                if let Some(log_id) = last_sent {
                    self.advance_matched(log_id);
                }
                if !sending_anything {
                    return Ok(());
                }
            } else {
                self.back_off(resp.conflict_opt);
                if started.elapsed() > Duration::from_millis(self.config.heartbeat_interval) {
                    return Ok(());
                }
            }
        }
    }

    fn advance_matched(&mut self, log_id: LogId) {
        if log_id <= self.matched {
            return;
        }
        self.matched = log_id;
        self.next_index = log_id.index + 1;
        let _ = self.matched_tx.send(log_id);

        if self.is_learner {
            return;
        }
        match self.ballot_box.commit_at(0, log_id.index, self.target) {
            Ok(Some(new_commit)) => {
                self.commit_index.fetch_max(new_commit, Ordering::AcqRel);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(target = self.target, error = %err, "ballot grant rejected"),
        }
    }

    /// Back off `next_index` on a rejected `AppendEntries`: use the
    /// follower's reported conflict point when present (spec.md §5.3's
    /// log-matching fast path), otherwise retreat by one.
    fn back_off(&mut self, conflict: Option<ConflictOpt>) {
        self.next_index = match conflict {
            Some(ConflictOpt { log_id }) => log_id.index.max(1),
            None => self.next_index.saturating_sub(1).max(1),
        };
    }

    /// Stream the leader's latest snapshot to a follower that has fallen
    /// too far behind for log shipping to catch it up (spec.md §7). This
    /// transport assumes a snapshot small enough to send in one chunk; a
    /// larger state machine would extend this to loop with growing
    /// `offset`s until `done`.
    async fn install_snapshot(&mut self) -> anyhow::Result<()> {
        let first_index = self.log_storage.first_log_index();
        let anchor = self
            .log_storage
            .get_entry(first_index)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing purged-prefix anchor at index {first_index}"))?;

        let membership = self
            .log_storage
            .configuration_manager()
            .snapshot_configuration(anchor.log_id.index)
            .unwrap_or_else(|| crate::raft_types::Configuration::new_initial(self.leader_id));

        let meta = crate::raft::SnapshotMeta {
            id: format!("snap-{}-{}", anchor.log_id.term, anchor.log_id.index),
            last_log_id: anchor.log_id,
            membership,
        };

        tracing::info!(target = self.target, meta = ?meta, "installing snapshot on lagging follower");

        let rpc = InstallSnapshotRequest {
            term: self.term,
            leader_id: self.leader_id,
            meta: meta.clone(),
            offset: 0,
            data: Vec::new(),
            done: true,
        };
        let resp = self.client_service.install_snapshot(self.target, rpc).await?;
        if resp.term > self.term {
            anyhow::bail!("observed higher term {} from {} during snapshot install", resp.term, self.target);
        }

        self.next_index = meta.last_log_id.index + 1;
        self.advance_matched(meta.last_log_id);
        Ok(())
    }
}
