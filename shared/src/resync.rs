//! Replays queued reports against the backend.
//!
//! One pass at a time: a trigger that arrives while a pass is running is folded
//! into a follow-up pass run by the current holder of the pass lock.

use crate::cancel::CancellationToken;
use crate::capabilities::{HttpClient, KeyValueStore};
use crate::model::QueueEntryId;
use crate::queue::{QueueError, ReportQueue};
use crate::submission::{ReportSubmissionClient, SubmissionError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// When successfully resubmitted entries leave the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearPolicy {
    /// Drained entries are removed together, and only if no submission failed.
    /// A failed pass leaves the queue exactly as it was.
    #[default]
    AllOrNothing,
    /// Each entry is removed right after the backend accepts it.
    PerEntry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failure ends the pass. Later entries are not attempted.
    #[default]
    Stop,
    SkipAndContinue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncOptions {
    pub clear_policy: ClearPolicy,
    pub failure_policy: FailurePolicy,
    /// Send the queue entry id as `Idempotency-Key` on replays.
    pub send_idempotency_key: bool,
}

impl Default for ResyncOptions {
    fn default() -> Self {
        Self {
            clear_policy: ClearPolicy::default(),
            failure_policy: FailurePolicy::default(),
            send_idempotency_key: true,
        }
    }
}

/// Result of one pass over the queue. `remaining` counts entries of this pass still queued.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Empty,
    Completed {
        submitted: usize,
    },
    Aborted {
        submitted: usize,
        remaining: usize,
        error: SubmissionError,
    },
    PartiallyFailed {
        submitted: usize,
        failed: usize,
    },
    StorageFailed {
        error: QueueError,
    },
    Cancelled {
        submitted: usize,
        remaining: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResyncTrigger {
    /// This caller ran at least one pass; carries the last one.
    Ran(PassOutcome),
    /// Another caller's pass picked this trigger up.
    Coalesced,
}

#[derive(Debug, Default)]
pub struct ResyncMetrics {
    pub passes_started: AtomicU64,
    pub passes_completed: AtomicU64,
    pub passes_aborted: AtomicU64,
    pub passes_coalesced: AtomicU64,
    pub passes_cancelled: AtomicU64,
    pub reports_resubmitted: AtomicU64,
    pub resubmission_failures: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl ResyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            passes_started: self.passes_started.load(Ordering::Relaxed),
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            passes_aborted: self.passes_aborted.load(Ordering::Relaxed),
            passes_coalesced: self.passes_coalesced.load(Ordering::Relaxed),
            passes_cancelled: self.passes_cancelled.load(Ordering::Relaxed),
            reports_resubmitted: self.reports_resubmitted.load(Ordering::Relaxed),
            resubmission_failures: self.resubmission_failures.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub passes_started: u64,
    pub passes_completed: u64,
    pub passes_aborted: u64,
    pub passes_coalesced: u64,
    pub passes_cancelled: u64,
    pub reports_resubmitted: u64,
    pub resubmission_failures: u64,
    pub storage_errors: u64,
}

pub struct ResyncOrchestrator<S, H> {
    queue: Arc<ReportQueue<S>>,
    client: Arc<ReportSubmissionClient<H>>,
    options: ResyncOptions,
    pass_lock: Mutex<()>,
    rerun: AtomicBool,
    metrics: Arc<ResyncMetrics>,
}

impl<S: KeyValueStore, H: HttpClient> ResyncOrchestrator<S, H> {
    pub fn new(
        queue: Arc<ReportQueue<S>>,
        client: Arc<ReportSubmissionClient<H>>,
        options: ResyncOptions,
    ) -> Self {
        Self {
            queue,
            client,
            options,
            pass_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            metrics: Arc::new(ResyncMetrics::new()),
        }
    }

    pub fn options(&self) -> ResyncOptions {
        self.options
    }

    pub fn metrics(&self) -> Arc<ResyncMetrics> {
        self.metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// Runs a pass now, or hands the request to the pass already in progress.
    pub async fn request_resync(&self) -> ResyncTrigger {
        self.request_resync_until(&CancellationToken::new()).await
    }

    /// Like [`Self::request_resync`], but passes run by this caller stop at the
    /// next entry once `cancel` fires. The token only affects this caller's passes.
    pub async fn request_resync_until(&self, cancel: &CancellationToken) -> ResyncTrigger {
        self.rerun.store(true, Ordering::SeqCst);
        let mut last = None;

        loop {
            let Ok(guard) = self.pass_lock.try_lock() else {
                break;
            };

            while self.rerun.swap(false, Ordering::SeqCst) {
                last = Some(self.run_pass(cancel).await);
                if cancel.is_cancelled() {
                    // Triggers that arrived meanwhile stay flagged for the next caller.
                    break;
                }
            }
            drop(guard);

            // A trigger may have landed between the last check and the unlock.
            if cancel.is_cancelled() || !self.rerun.load(Ordering::SeqCst) {
                break;
            }
        }

        match last {
            Some(outcome) => ResyncTrigger::Ran(outcome),
            None => {
                ResyncMetrics::bump(&self.metrics.passes_coalesced);
                debug!("resync already in progress, trigger coalesced");
                ResyncTrigger::Coalesced
            }
        }
    }

    /// Caller must hold `pass_lock`.
    #[instrument(skip(self, cancel), fields(clear = ?self.options.clear_policy, on_failure = ?self.options.failure_policy))]
    async fn run_pass(&self, cancel: &CancellationToken) -> PassOutcome {
        ResyncMetrics::bump(&self.metrics.passes_started);

        let entries = match self.queue.drain_all().await {
            Ok(entries) => entries,
            Err(error) => return self.storage_failed(error, "failed to read queue"),
        };

        if entries.is_empty() {
            ResyncMetrics::bump(&self.metrics.passes_completed);
            debug!("nothing queued");
            return PassOutcome::Empty;
        }

        let total = entries.len();
        let per_entry = self.options.clear_policy == ClearPolicy::PerEntry;
        let still_queued = |submitted: usize| if per_entry { total - submitted } else { total };

        let mut submitted: Vec<QueueEntryId> = Vec::with_capacity(total);
        let mut failed = 0usize;

        for entry in &entries {
            if cancel.is_cancelled() {
                ResyncMetrics::bump(&self.metrics.passes_cancelled);
                warn!(
                    submitted = submitted.len(),
                    remaining = still_queued(submitted.len()),
                    "resync cancelled"
                );
                return PassOutcome::Cancelled {
                    submitted: submitted.len(),
                    remaining: still_queued(submitted.len()),
                };
            }

            let idempotency_key = self.options.send_idempotency_key.then_some(&entry.id);
            let result = self
                .client
                .submit(&entry.report, entry.submitted_by.as_ref(), idempotency_key)
                .await;

            match result {
                Ok(_) => {
                    ResyncMetrics::bump(&self.metrics.reports_resubmitted);
                    debug!(id = %entry.id, "queued report resubmitted");
                    if per_entry {
                        if let Err(error) = self.queue.remove(&entry.id).await {
                            return self.storage_failed(error, "failed to remove submitted report");
                        }
                    }
                    submitted.push(entry.id.clone());
                }
                Err(error) => {
                    ResyncMetrics::bump(&self.metrics.resubmission_failures);
                    error!(id = %entry.id, error = %error, "queued report resubmission failed");

                    match self.options.failure_policy {
                        FailurePolicy::Stop => {
                            ResyncMetrics::bump(&self.metrics.passes_aborted);
                            let remaining = still_queued(submitted.len());
                            info!(submitted = submitted.len(), remaining, "resync aborted");
                            return PassOutcome::Aborted {
                                submitted: submitted.len(),
                                remaining,
                                error,
                            };
                        }
                        FailurePolicy::SkipAndContinue => failed += 1,
                    }
                }
            }
        }

        if failed > 0 {
            ResyncMetrics::bump(&self.metrics.passes_aborted);
            info!(submitted = submitted.len(), failed, "resync finished with failures");
            return PassOutcome::PartiallyFailed {
                submitted: submitted.len(),
                failed,
            };
        }

        if !per_entry {
            // Only the drained ids; anything enqueued mid-pass stays.
            if let Err(error) = self.queue.remove_many(&submitted).await {
                return self.storage_failed(error, "failed to clear submitted reports");
            }
        }

        ResyncMetrics::bump(&self.metrics.passes_completed);
        info!(submitted = submitted.len(), "resync completed");
        PassOutcome::Completed {
            submitted: submitted.len(),
        }
    }

    fn storage_failed(&self, error: QueueError, context: &'static str) -> PassOutcome {
        ResyncMetrics::bump(&self.metrics.storage_errors);
        error!(error = %error, "{}", context);
        PassOutcome::StorageFailed { error }
    }
}
