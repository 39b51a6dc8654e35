//! Target -> running task bookkeeping.
//!
//! Locking discipline: one `parking_lot::Mutex` guards the map and is only ever
//! held for map operations. Stopping a handle (cancel, grace wait, abort) always
//! happens on a handle that has already been taken out of the map, so no await
//! point is ever reached with the registry lock held.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{Target, TaskState};

/// Shared lifecycle cell; the running task and its handle both see it.
#[derive(Debug, Clone)]
pub struct TaskStateCell(Arc<Mutex<TaskState>>);

impl TaskStateCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TaskState::Idle)))
    }

    pub fn get(&self) -> TaskState {
        *self.0.lock()
    }

    /// Move forward along `Idle -> Running -> {Completed, Cancelled, TaskErrored} -> Removed`.
    /// Returns false (and leaves the state alone) for any backwards or repeated move.
    pub fn advance(&self, next: TaskState) -> bool {
        let mut cur = self.0.lock();
        let allowed = match (*cur, next) {
            (TaskState::Removed, _) => false,
            (_, TaskState::Removed) => true,
            (TaskState::Idle, TaskState::Running) => true,
            (TaskState::Idle | TaskState::Running, n) => n.is_terminal_run_state(),
            _ => false,
        };
        if allowed {
            *cur = next;
        }
        allowed
    }
}

impl Default for TaskStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-target runtime record.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: u64,
    batch_id: u64,
    target: Target,
    cancel: CancellationToken,
    state: TaskStateCell,
    join: Option<JoinHandle<()>>,
}

/// Read-only view of a registered handle.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: u64,
    pub batch_id: u64,
    pub target: Target,
    pub state: TaskState,
}

/// How a handle went away during a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// The task was not running any more, or ended within the grace period.
    Cooperative,
    /// The grace period ran out and the task was aborted.
    Forced,
}

impl TaskHandle {
    pub fn new(task_id: u64, batch_id: u64, target: Target, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            batch_id,
            target,
            cancel,
            state: TaskStateCell::new(),
            join: None,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn state_cell(&self) -> TaskStateCell {
        self.state.clone()
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            task_id: self.task_id,
            batch_id: self.batch_id,
            target: self.target.clone(),
            state: self.state.get(),
        }
    }

    /// Evict a task that reported on its own. The join handle is detached, not
    /// aborted: the caller may be running inside that very task.
    pub fn release(mut self) {
        self.join.take();
        self.state.advance(TaskState::Removed);
    }

    /// Cancel, wait up to `grace` for the task to notice, then abort it.
    /// On return the task's future has been dropped and the state is `Removed`.
    pub async fn stop(mut self, grace: Duration) -> StopKind {
        self.cancel.cancel();
        let mut kind = StopKind::Cooperative;
        if let Some(mut join) = self.join.take() {
            if time::timeout(grace, &mut join).await.is_err() {
                join.abort();
                // Resolves once the aborted future has been dropped.
                if let Err(e) = join.await {
                    debug!(host = %self.target, task_id = self.task_id, error = %e, "task aborted");
                }
                kind = StopKind::Forced;
            }
        }
        self.state.advance(TaskState::Cancelled);
        self.state.advance(TaskState::Removed);
        kind
    }

    /// Immediate, non-waiting teardown used when the owner is dropped.
    pub fn abort(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            join.abort();
        }
        self.state.advance(TaskState::Cancelled);
        self.state.advance(TaskState::Removed);
    }
}

/// Thread-safe map of target -> task handle. At most one handle per target.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    inner: Mutex<HashMap<Target, TaskHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle`. An existing handle for the same target is taken out and
    /// returned; the caller must `stop` it before starting the new task.
    #[must_use = "a displaced handle must be stopped"]
    pub fn register(&self, handle: TaskHandle) -> Option<TaskHandle> {
        let displaced = self.inner.lock().insert(handle.target.clone(), handle);
        if let Some(old) = &displaced {
            debug!(host = %old.target, task_id = old.task_id, "displacing registered task");
        }
        displaced
    }

    /// Store the join handle of a spawned task. Gives it back if the handle for
    /// `task_id` is no longer registered.
    pub fn attach(
        &self,
        target: &Target,
        task_id: u64,
        join: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut map = self.inner.lock();
        match map.get_mut(target) {
            Some(h) if h.task_id == task_id => {
                h.join = Some(join);
                Ok(())
            }
            _ => Err(join),
        }
    }

    pub fn lookup(&self, target: &Target) -> Option<TaskInfo> {
        self.inner.lock().get(target).map(TaskHandle::info)
    }

    pub fn remove(&self, target: &Target) -> Option<TaskHandle> {
        self.inner.lock().remove(target)
    }

    /// Remove the handle for `target` only if it is still the one for `task_id`.
    pub fn remove_task(&self, target: &Target, task_id: u64) -> Option<TaskHandle> {
        let mut map = self.inner.lock();
        if map.get(target).is_some_and(|h| h.task_id == task_id) {
            map.remove(target)
        } else {
            None
        }
    }

    /// Atomically drain every handle.
    pub fn remove_all(&self) -> Vec<TaskHandle> {
        self.inner.lock().drain().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<TaskInfo> {
        let mut out: Vec<TaskInfo> = self.inner.lock().values().map(TaskHandle::info).collect();
        out.sort_by_key(|i| i.task_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(task_id: u64, target: &str) -> TaskHandle {
        TaskHandle::new(task_id, 1, Target::from(target), CancellationToken::new())
    }

    #[test]
    fn state_only_moves_forward() {
        let s = TaskStateCell::new();
        assert!(s.advance(TaskState::Running));
        assert!(!s.advance(TaskState::Idle));
        assert!(s.advance(TaskState::Completed));
        assert!(!s.advance(TaskState::Cancelled));
        assert!(s.advance(TaskState::Removed));
        assert!(!s.advance(TaskState::Running));
        assert_eq!(s.get(), TaskState::Removed);
    }

    #[test]
    fn register_displaces_existing_handle() {
        let reg = TaskRegistry::new();
        assert!(reg.register(handle(1, "a")).is_none());
        let old = reg.register(handle(2, "a")).expect("displaced");
        assert_eq!(old.task_id(), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup(&"a".into()).unwrap().task_id, 2);
    }

    #[test]
    fn remove_task_ignores_stale_ids() {
        let reg = TaskRegistry::new();
        let _ = reg.register(handle(7, "a"));
        assert!(reg.remove_task(&"a".into(), 6).is_none());
        assert_eq!(reg.len(), 1);
        assert!(reg.remove_task(&"a".into(), 7).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_all_drains() {
        let reg = TaskRegistry::new();
        for (i, t) in ["a", "b", "c"].iter().enumerate() {
            let _ = reg.register(handle(i as u64, t));
        }
        let drained = reg.remove_all();
        assert_eq!(drained.len(), 3);
        assert!(reg.is_empty());
        assert!(reg.remove_all().is_empty());
    }

    #[test]
    fn release_marks_removed() {
        let h = handle(1, "a");
        let cell = h.state_cell();
        cell.advance(TaskState::Running);
        cell.advance(TaskState::Completed);
        h.release();
        assert_eq!(cell.get(), TaskState::Removed);
    }

    #[tokio::test]
    async fn attach_rejects_unknown_task() {
        let reg = TaskRegistry::new();
        let _ = reg.register(handle(1, "a"));
        let join = tokio::spawn(async {});
        let join = reg.attach(&"a".into(), 99, join).expect_err("stale id");
        join.await.unwrap();
    }

    #[tokio::test]
    async fn attach_rejects_task_that_already_removed_itself() {
        let reg = TaskRegistry::new();
        let _ = reg.register(handle(4, "a"));
        let finished = reg.remove_task(&"a".into(), 4).expect("own entry");
        finished.release();
        let join = tokio::spawn(async {});
        let join = reg.attach(&"a".into(), 4, join).expect_err("entry is gone");
        join.abort();
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn displaced_handle_is_stopped_without_touching_successor() {
        let reg = TaskRegistry::new();
        let old_cancel = CancellationToken::new();
        let old = TaskHandle::new(1, 1, "a".into(), old_cancel.clone());
        let old_cell = old.state_cell();
        let _ = reg.register(old);
        let join = tokio::spawn(async move { old_cancel.cancelled().await });
        reg.attach(&"a".into(), 1, join).unwrap();

        let new_cancel = CancellationToken::new();
        let displaced = reg
            .register(TaskHandle::new(2, 2, "a".into(), new_cancel.clone()))
            .expect("displaced");
        assert_eq!(displaced.stop(Duration::from_secs(1)).await, StopKind::Cooperative);
        assert_eq!(old_cell.get(), TaskState::Removed);
        assert!(!new_cancel.is_cancelled());
        assert_eq!(reg.lookup(&"a".into()).unwrap().task_id, 2);
    }

    #[tokio::test]
    async fn stop_is_cooperative_when_task_observes_cancel() {
        let reg = TaskRegistry::new();
        let cancel = CancellationToken::new();
        let h = TaskHandle::new(1, 1, "a".into(), cancel.clone());
        let cell = h.state_cell();
        let _ = reg.register(h);
        let join = tokio::spawn(async move { cancel.cancelled().await });
        reg.attach(&"a".into(), 1, join).unwrap();

        let h = reg.remove(&"a".into()).unwrap();
        assert_eq!(h.stop(Duration::from_secs(1)).await, StopKind::Cooperative);
        assert_eq!(cell.get(), TaskState::Removed);
    }

    #[tokio::test]
    async fn stop_forces_unresponsive_task() {
        struct DropFlag(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let mut h = handle(1, "a");
        h.join = Some(tokio::spawn(async move {
            let _flag = flag;
            time::sleep(Duration::from_secs(30)).await;
        }));

        let started = std::time::Instant::now();
        assert_eq!(h.stop(Duration::from_millis(50)).await, StopKind::Forced);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
