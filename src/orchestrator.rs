//! Batch orchestration: one probe task per target, completion accounting and
//! two-phase stop.
//!
//! Lock order is batch -> registry. Completion handling runs entirely under the
//! batch lock (including the sink calls), so a concurrent `stop_all` either sees
//! a task's completion fully applied or not at all.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProbeError;
use crate::primitives::{PingerHandle, PortCheckerHandle};
use crate::registry::{StopKind, TaskHandle, TaskInfo, TaskRegistry, TaskStateCell};
use crate::targets::dedup_targets;
use crate::task::{ProbeTask, TaskReport};
use crate::types::{
    BatchStarted, BatchStatus, BatchSummary, ProbeEvent, ProbeOutcome, ProbeParameters, Target,
    TaskState,
};

/// Default wait for cooperative cancellation before a task is aborted.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Consumer of per-target outcomes and the batch-complete signal.
///
/// Called from task completion context with the orchestrator's batch lock held:
/// implementations must return quickly and must not call back into the
/// orchestrator synchronously.
pub trait ResultSink: Send + Sync {
    /// A new batch was accepted; sent before any of its outcomes.
    fn on_batch_started(&self, _started: &BatchStarted) {}
    fn on_outcome(&self, batch_id: u64, outcome: ProbeOutcome);
    fn on_batch_complete(&self, summary: BatchSummary);
}

impl ResultSink for mpsc::UnboundedSender<ProbeEvent> {
    fn on_batch_started(&self, started: &BatchStarted) {
        if self.send(ProbeEvent::BatchStarted(started.clone())).is_err() {
            debug!("result receiver dropped");
        }
    }

    fn on_outcome(&self, batch_id: u64, outcome: ProbeOutcome) {
        if self.send(ProbeEvent::Outcome { batch_id, outcome }).is_err() {
            debug!("result receiver dropped");
        }
    }

    fn on_batch_complete(&self, summary: BatchSummary) {
        if self.send(ProbeEvent::BatchComplete(summary)).is_err() {
            debug!("result receiver dropped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub grace_period: Duration,
    /// Optional cap on tasks probing at the same time. `None` runs every target at once.
    pub max_concurrency: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            max_concurrency: None,
        }
    }
}

/// Summary of a `stop_all` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: usize,
    pub forced: usize,
    /// Whether a batch was still pending when the stop arrived.
    pub had_batch: bool,
}

#[derive(Debug)]
struct Batch {
    id: u64,
    total: usize,
    pending: usize,
}

struct Shared {
    registry: TaskRegistry,
    batch: Mutex<Option<Batch>>,
    sink: Arc<dyn ResultSink>,
}

impl Shared {
    /// Per-task completion handler. Invoked exactly once by every task that ran
    /// to the end of its future.
    fn complete(
        &self,
        batch_id: u64,
        task_id: u64,
        target: Target,
        report: TaskReport,
        state: &TaskStateCell,
    ) {
        state.advance(match &report {
            TaskReport::Reported(ProbeOutcome::TaskError { .. }) => TaskState::TaskErrored,
            TaskReport::Reported(_) => TaskState::Completed,
            TaskReport::Silent => TaskState::Cancelled,
        });

        let mut guard = self.batch.lock();
        let batch = match guard.as_mut() {
            Some(b) if b.id == batch_id => b,
            _ => {
                // Batch was stopped or superseded; its handles are already gone.
                if let Some(h) = self.registry.remove_task(&target, task_id) {
                    h.release();
                }
                debug!(host = %target, batch_id, task_id, "completion for finished batch ignored");
                return;
            }
        };

        if let TaskReport::Reported(outcome) = report {
            if outcome.is_task_error() {
                warn!(host = %target, batch_id, task_id, "probe task failed");
            }
            self.sink.on_outcome(batch_id, outcome);
        }
        if let Some(h) = self.registry.remove_task(&target, task_id) {
            h.release();
        }

        batch.pending = batch.pending.saturating_sub(1);
        debug!(host = %target, batch_id, pending = batch.pending, "task finished");
        if batch.pending == 0 {
            let summary = BatchSummary {
                batch_id: batch.id,
                total: batch.total,
            };
            *guard = None;
            info!(batch_id = summary.batch_id, total = summary.total, "batch complete");
            self.sink.on_batch_complete(summary);
        }
    }
}

/// Owns the current batch and the task registry.
pub struct Orchestrator {
    shared: Arc<Shared>,
    // Serializes start/stop so a batch is never half set up while being torn down.
    control: tokio::sync::Mutex<()>,
    pinger: PingerHandle,
    checker: PortCheckerHandle,
    config: OrchestratorConfig,
    limiter: Option<Arc<Semaphore>>,
    next_batch_id: AtomicU64,
    next_task_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        pinger: PingerHandle,
        checker: PortCheckerHandle,
        sink: Arc<dyn ResultSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let limiter = config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.clamp(1, Semaphore::MAX_PERMITS))));
        Self {
            shared: Arc::new(Shared {
                registry: TaskRegistry::new(),
                batch: Mutex::new(None),
                sink,
            }),
            control: tokio::sync::Mutex::new(()),
            pinger,
            checker,
            config,
            limiter,
            next_batch_id: AtomicU64::new(1),
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Build an orchestrator whose sink is an unbounded event channel.
    pub fn with_channel(
        pinger: PingerHandle,
        checker: PortCheckerHandle,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProbeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(pinger, checker, Arc::new(tx), config), rx)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate, deduplicate and launch one task per target. Returns without
    /// waiting for any probe. A still-pending previous batch is stopped first and
    /// never reports completion.
    pub async fn start_batch<I, T>(
        &self,
        targets: I,
        params: ProbeParameters,
    ) -> Result<BatchStarted, ProbeError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Target>,
    {
        let targets = dedup_targets(targets);
        if targets.is_empty() {
            return Err(ProbeError::EmptyTargetSet);
        }
        params.validate()?;

        let _control = self.control.lock().await;

        let superseded = self.stop_all_locked().await;
        if superseded.had_batch || superseded.stopped > 0 {
            info!(stopped = superseded.stopped, "previous batch superseded");
        }

        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let total = targets.len();
        let started = BatchStarted {
            batch_id,
            total,
            targets,
            params,
        };
        {
            let mut batch = self.shared.batch.lock();
            *batch = Some(Batch {
                id: batch_id,
                total,
                pending: total,
            });
            self.shared.sink.on_batch_started(&started);
        }
        info!(
            batch_id,
            total,
            ping_count = started.params.ping_count,
            port = ?started.params.port,
            "batch started"
        );

        let params = Arc::new(started.params.clone());
        for target in &started.targets {
            self.launch(batch_id, target.clone(), params.clone()).await;
        }

        Ok(started)
    }

    async fn launch(&self, batch_id: u64, target: Target, params: Arc<ProbeParameters>) {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let handle = TaskHandle::new(task_id, batch_id, target.clone(), cancel.clone());
        let state = handle.state_cell();

        // start_batch drains the registry and dedups targets first, so nothing is
        // displaced on that path.
        if let Some(displaced) = self.shared.registry.register(handle) {
            let kind = displaced.stop(self.config.grace_period).await;
            debug!(host = %target, ?kind, "displaced task stopped");
        }

        let task = ProbeTask::new(
            target.clone(),
            params,
            cancel,
            self.pinger.clone(),
            self.checker.clone(),
        )
        .with_limiter(self.limiter.clone());

        let shared = self.shared.clone();
        let task_target = target.clone();
        let join = tokio::spawn(async move {
            state.advance(TaskState::Running);
            let report = task.run().await;
            shared.complete(batch_id, task_id, task_target, report, &state);
        });

        if let Err(join) = self.shared.registry.attach(&target, task_id, join) {
            // The entry is gone: either the task already finished and removed
            // itself, or a stop drained it first. Aborting a finished task is a no-op.
            join.abort();
        }
    }

    /// Cancel and evict every registered task, then reset the batch. Returns once
    /// every task has been stopped (cooperatively or by force). Never emits
    /// `BatchComplete`. Calling it with nothing running is a no-op.
    pub async fn stop_all(&self) -> StopReport {
        let _control = self.control.lock().await;
        let report = self.stop_all_locked().await;
        if report.had_batch || report.stopped > 0 {
            info!(stopped = report.stopped, forced = report.forced, "stopped all tasks");
        }
        report
    }

    async fn stop_all_locked(&self) -> StopReport {
        let (had_batch, handles) = {
            let mut batch = self.shared.batch.lock();
            let had_batch = batch.take().is_some();
            (had_batch, self.shared.registry.remove_all())
        };
        if handles.is_empty() {
            return StopReport {
                had_batch,
                ..Default::default()
            };
        }

        for h in &handles {
            h.cancel_token().cancel();
        }
        let grace = self.config.grace_period;
        let kinds = join_all(handles.into_iter().map(|h| h.stop(grace))).await;
        let forced = kinds.iter().filter(|k| **k == StopKind::Forced).count();
        if forced > 0 {
            warn!(forced, "tasks did not stop within grace period and were aborted");
        }
        StopReport {
            stopped: kinds.len(),
            forced,
            had_batch,
        }
    }

    /// Process-exit teardown. Same escalation as `stop_all`.
    pub async fn shutdown(&self) -> StopReport {
        info!("shutting down orchestrator");
        self.stop_all().await
    }

    pub fn status(&self) -> Option<BatchStatus> {
        self.shared.batch.lock().as_ref().map(|b| BatchStatus {
            batch_id: b.id,
            total: b.total,
            pending: b.pending,
            completed: b.total - b.pending,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.batch.lock().is_some()
    }

    pub fn registered(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn lookup(&self, target: &Target) -> Option<TaskInfo> {
        self.shared.registry.lookup(target)
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.shared.registry.snapshot()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shared.batch.lock().take();
        for h in self.shared.registry.remove_all() {
            h.abort();
        }
    }
}
