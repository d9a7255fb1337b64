//! `FSMCaller`: serializes every apply to the user's state machine onto a
//! single task, so `StateMachine` implementations never have to reason
//! about concurrent calls (spec.md §4.3).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::raft::SnapshotMeta;
use crate::raft_types::LogId;
use crate::AppData;
use crate::AppDataResponse;

/// The user-supplied replicated state machine. `apply` is always called
/// with entries in strict, gapless log-index order; a failure is treated
/// as fatal for the node (spec.md §4.3 "FSM error state").
#[async_trait]
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Apply one committed entry, returning the response handed back to
    /// the client that proposed it (if this node is the one that proposed
    /// it; otherwise the value is discarded).
    async fn apply(&self, log_id: LogId, data: &D) -> anyhow::Result<R>;

    /// The last log id this state machine has durably applied, used to
    /// resume after a restart without replaying already-applied entries.
    async fn last_applied_log(&self) -> anyhow::Result<LogId>;

    /// Serialize the current state for a follower too far behind to catch
    /// up via log shipping (spec.md §4.4 "snapshot install").
    async fn build_snapshot(&self) -> anyhow::Result<(SnapshotMeta, Vec<u8>)>;

    /// Replace the state machine's contents with a snapshot received from
    /// the leader.
    async fn install_snapshot(&self, meta: &SnapshotMeta, data: Vec<u8>) -> anyhow::Result<()>;
}

enum FsmMsg<D: AppData, R: AppDataResponse> {
    Apply {
        log_id: LogId,
        data: D,
        tx: Option<oneshot::Sender<anyhow::Result<R>>>,
    },
    /// Advance the applied cursor for an entry that carries no user
    /// payload (a blank leader anchor, a configuration change, or a
    /// purged-prefix marker): it never reaches `StateMachine::apply`, but
    /// still must advance `last_applied` and wake `ReadOnlyService`
    /// waiters in strict log order.
    Advance {
        log_id: LogId,
    },
    Shutdown,
}

/// A callback invoked every time `last_applied_log` advances, used by
/// `ReadOnlyService` to wake up read-index waiters without polling.
pub type AppliedListener = Box<dyn Fn(LogId) + Send + Sync>;

struct Inner<D: AppData, R: AppDataResponse> {
    sm: Arc<dyn StateMachine<D, R>>,
    listeners: Vec<AppliedListener>,
}

/// The serialized-apply actor. Entries are pushed in order via `apply`; a
/// background task drains them one at a time against the user's
/// `StateMachine`. Any apply error poisons the caller: all subsequent
/// `apply` calls fail immediately without being attempted.
pub struct FSMCaller<D: AppData, R: AppDataResponse> {
    tx: mpsc::UnboundedSender<FsmMsg<D, R>>,
    sm: Arc<dyn StateMachine<D, R>>,
    last_applied: Arc<AtomicU64>,
    last_applied_term: Arc<AtomicU64>,
    error: Arc<Mutex<Option<String>>>,
}

impl<D: AppData, R: AppDataResponse> FSMCaller<D, R> {
    pub fn spawn(sm: Arc<dyn StateMachine<D, R>>, initial: LogId, mut listeners: Vec<AppliedListener>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FsmMsg<D, R>>();
        let last_applied = Arc::new(AtomicU64::new(initial.index));
        let last_applied_term = Arc::new(AtomicU64::new(initial.term));
        let error = Arc::new(Mutex::new(None));

        let last_applied_c = last_applied.clone();
        let last_applied_term_c = last_applied_term.clone();
        let error_c = error.clone();

        let sm_handle = sm.clone();

        tokio::spawn(
            async move {
                let inner = Inner { sm, listeners: std::mem::take(&mut listeners) };
                while let Some(msg) = rx.recv().await {
                    match msg {
                        FsmMsg::Shutdown => break,
                        FsmMsg::Advance { log_id } => {
                            last_applied_c.store(log_id.index, Ordering::Release);
                            last_applied_term_c.store(log_id.term, Ordering::Release);
                            for listener in &inner.listeners {
                                listener(log_id);
                            }
                        }
                        FsmMsg::Apply { log_id, data, tx } => {
                            if error_c.lock().await.is_some() {
                                if let Some(tx) = tx {
                                    let _ = tx.send(Err(anyhow::anyhow!("state machine is in an error state")));
                                }
                                continue;
                            }
                            match inner.sm.apply(log_id, &data).await {
                                Ok(resp) => {
                                    last_applied_c.store(log_id.index, Ordering::Release);
                                    last_applied_term_c.store(log_id.term, Ordering::Release);
                                    for listener in &inner.listeners {
                                        listener(log_id);
                                    }
                                    if let Some(tx) = tx {
                                        let _ = tx.send(Ok(resp));
                                    }
                                }
                                Err(err) => {
                                    tracing::error!(error = %err, log_id = %log_id, "state machine apply failed, entering error state");
                                    *error_c.lock().await = Some(err.to_string());
                                    if let Some(tx) = tx {
                                        let _ = tx.send(Err(err));
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(tracing::debug_span!("fsm_caller")),
        );

        Arc::new(Self {
            tx,
            sm: sm_handle,
            last_applied,
            last_applied_term,
            error,
        })
    }

    /// Direct access to the user's state machine, bypassing the serialized
    /// apply queue. Used only for snapshot build/install, which run on their
    /// own schedule (driven by `RaftCore`, not by log-order applies) and
    /// would otherwise have no way to reach the `StateMachine` at all.
    pub fn state_machine(&self) -> &Arc<dyn StateMachine<D, R>> {
        &self.sm
    }

    /// Enqueue one committed entry for application. `tx`, if present, is
    /// fulfilled with the apply's result once it runs.
    pub fn apply(&self, log_id: LogId, data: D, tx: Option<oneshot::Sender<anyhow::Result<R>>>) {
        let _ = self.tx.send(FsmMsg::Apply { log_id, data, tx });
    }

    /// Advance the applied cursor for an entry with no user payload
    /// (blank/config-change/purged-marker), without calling the user's
    /// `StateMachine::apply`.
    pub fn advance(&self, log_id: LogId) {
        let _ = self.tx.send(FsmMsg::Advance { log_id });
    }

    pub fn last_applied(&self) -> LogId {
        LogId::new(self.last_applied_term.load(Ordering::Acquire), self.last_applied.load(Ordering::Acquire))
    }

    pub async fn error(&self) -> Option<String> {
        self.error.lock().await.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(FsmMsg::Shutdown);
    }
}
