//! Keyed execution of calculation blocks against an [`Evaluator`].
//!
//! Every execution carries a ticket drawn from a monotonic counter. The entry
//! for a block remembers the ticket of the call it is waiting on; a completion
//! whose ticket no longer matches (the block was edited, cancelled or removed
//! in the meantime) is dropped instead of being written back. Cancellation is
//! cooperative: the request itself keeps running, its answer is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use smol_str::SmolStr;
use tokio::sync::watch;

use crate::error::EvaluatorError;
use crate::evaluator::{CalculationRequest, CalculationResult, Evaluator};
use crate::identity::{BlockId, hash_source};

/// Lifecycle of one block's execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ExecutionState {
    /// Nothing has been requested for this block.
    #[default]
    Idle,
    /// A call is in flight.
    Pending,
    /// The evaluator answered. The result may still report `success: false`
    /// when the calculation code itself failed.
    Succeeded(Arc<CalculationResult>),
    /// No answer could be obtained (unreachable, bad status, malformed body, timeout).
    Failed(Arc<CalculationResult>),
}

impl ExecutionState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn result(&self) -> Option<&CalculationResult> {
        match self {
            Self::Succeeded(result) | Self::Failed(result) => Some(result),
            Self::Idle | Self::Pending => None,
        }
    }
}

#[derive(Debug)]
struct Execution {
    code_hash: u64,
    code: String,
    ticket: u64,
    state: ExecutionState,
}

struct SchedulerInner {
    evaluator: Arc<dyn Evaluator>,
    entries: DashMap<BlockId, Execution>,
    next_ticket: AtomicU64,
    timeout: Option<Duration>,
    /// Bumped on every state transition.
    revision: watch::Sender<u64>,
}

impl SchedulerInner {
    fn notify(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn complete(&self, id: &BlockId, ticket: u64, state: ExecutionState) {
        let committed = match self.entries.get_mut(id) {
            Some(mut entry) if entry.ticket == ticket => {
                entry.state = state;
                true
            }
            _ => false,
        };

        if committed {
            tracing::debug!(target: "engicalc::scheduler", %id, ticket, "execution settled");
            self.notify();
        } else {
            tracing::debug!(
                target: "engicalc::scheduler",
                %id,
                ticket,
                "discarding superseded execution result"
            );
        }
    }
}

/// Owns the block identity to execution state map and the in-flight calls.
///
/// Cloning is cheap and clones share state. Calls are spawned with
/// `n0_future::task::spawn`, so `ensure` must run inside an async runtime.
#[derive(Clone)]
pub struct ExecutionScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for ExecutionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScheduler")
            .field("entries", &self.inner.entries.len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl ExecutionScheduler {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(SchedulerInner {
                evaluator,
                entries: DashMap::new(),
                next_ticket: AtomicU64::new(1),
                timeout: None,
                revision,
            }),
        }
    }

    /// Bound every evaluator call by `timeout`.
    ///
    /// Must be called before the scheduler is cloned or used.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.timeout = timeout;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!(
                    target: "engicalc::scheduler",
                    "scheduler already shared, timeout not applied"
                );
                Self { inner }
            }
        }
    }

    /// Make sure an execution exists for `id` running exactly `code`.
    ///
    /// Starts a call when there is no entry for `id` or the entry ran
    /// different code; the replaced call, if still pending, is superseded.
    /// Otherwise does nothing, so repeated calls never duplicate work.
    pub fn ensure(&self, id: &BlockId, code: &str, language: &str) {
        let code_hash = hash_source(code);
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);

        match self.inner.entries.entry(id.clone()) {
            Entry::Occupied(entry)
                if entry.get().code_hash == code_hash && entry.get().code == code =>
            {
                return;
            }
            Entry::Occupied(mut entry) => {
                let previous = entry.get();
                if previous.state.is_pending() {
                    tracing::debug!(
                        target: "engicalc::scheduler",
                        %id,
                        superseded = previous.ticket,
                        "code changed while pending, superseding call"
                    );
                }
                entry.insert(Execution {
                    code_hash,
                    code: code.to_owned(),
                    ticket,
                    state: ExecutionState::Pending,
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Execution {
                    code_hash,
                    code: code.to_owned(),
                    ticket,
                    state: ExecutionState::Pending,
                });
            }
        }

        tracing::debug!(target: "engicalc::scheduler", %id, ticket, "starting execution");
        self.inner.notify();
        self.spawn_execution(id.clone(), ticket, code.to_owned(), SmolStr::new(language));
    }

    fn spawn_execution(&self, id: BlockId, ticket: u64, code: String, language: SmolStr) {
        let inner = self.inner.clone();
        n0_future::task::spawn(async move {
            let request = CalculationRequest::single(code, language);
            let outcome = match inner.timeout {
                Some(timeout) => n0_future::time::timeout(timeout, inner.evaluator.execute(request))
                    .await
                    .unwrap_or(Err(EvaluatorError::Timeout(timeout))),
                None => inner.evaluator.execute(request).await,
            };

            let state = match outcome {
                Ok(response) => match response.results.into_iter().next() {
                    Some(result) => ExecutionState::Succeeded(Arc::new(result)),
                    None => {
                        tracing::warn!(
                            target: "engicalc::scheduler",
                            %id,
                            "evaluator returned no results"
                        );
                        ExecutionState::Failed(Arc::new(CalculationResult::execution_failed()))
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        target: "engicalc::scheduler",
                        %id,
                        %error,
                        "calculation execution failed"
                    );
                    ExecutionState::Failed(Arc::new(CalculationResult::execution_failed()))
                }
            };

            inner.complete(&id, ticket, state);
        });
    }

    /// Stop honouring the pending call for `id`, if any.
    ///
    /// The block returns to [`ExecutionState::Idle`]; a later `ensure` starts afresh.
    pub fn cancel(&self, id: &BlockId) {
        let removed = self
            .inner
            .entries
            .remove_if(id, |_, execution| execution.state.is_pending());
        if let Some((_, execution)) = removed {
            tracing::debug!(
                target: "engicalc::scheduler",
                %id,
                ticket = execution.ticket,
                "cancelled pending execution"
            );
            self.inner.notify();
        }
    }

    /// Drop every entry whose identity is not in `live`, cancelling pending calls.
    pub fn retain(&self, live: &HashSet<BlockId>) {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|id, _| live.contains(id));
        let dropped = before.saturating_sub(self.inner.entries.len());
        if dropped > 0 {
            tracing::trace!(target: "engicalc::scheduler", dropped, "dropped stale executions");
            self.inner.notify();
        }
    }

    pub fn get(&self, id: &BlockId) -> ExecutionState {
        self.inner
            .entries
            .get(id)
            .map(|entry| entry.state.clone())
            .unwrap_or_default()
    }

    /// Snapshot of all known states.
    pub fn snapshot(&self) -> HashMap<BlockId, ExecutionState> {
        self.inner
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.value().state.is_pending())
            .count()
    }

    /// Receiver whose value changes on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Wait until no execution is pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            let _ = rx.borrow_and_update();
            if self.pending_count() == 0 {
                return;
            }
            // The sender lives in `inner`, which `self` keeps alive.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
