//! Cancellable delayed tasks for debounce timers.
//!
//! A [`ScheduledTask`] owns a tokio task that sleeps and then runs its
//! action. Dropping or cancelling the handle aborts the task. A
//! [`TaskSlot`] holds at most one pending task: scheduling into an
//! occupied slot supersedes (aborts) the previous one.
//!
//! A timer can fire and enqueue its command just before being
//! superseded. Every task therefore carries a unique [`TaskId`], and the
//! owner checks [`TaskSlot::fired`] before acting on a delivered command.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Unique id of a scheduled task.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a delayed action.
#[derive(Debug)]
pub struct ScheduledTask {
    id: TaskId,
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `action(id)` after `delay` unless cancelled first.
    pub fn after<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: FnOnce(TaskId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            action(id).await;
        });
        Self { id, deadline, handle }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True until the action has run or the task was aborted.
    pub fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn cancel(self) {
        // Drop aborts.
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Holder for the single pending task of one purpose (e.g. "save").
#[derive(Debug, Default)]
pub struct TaskSlot {
    task: Option<ScheduledTask>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `task`, aborting any previous one. Returns true if one was superseded.
    pub fn replace(&mut self, task: ScheduledTask) -> bool {
        let superseded = self.task.as_ref().is_some_and(ScheduledTask::is_pending);
        self.task = Some(task);
        superseded
    }

    /// Abort the pending task, if any. Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        self.task.take().is_some_and(|t| t.is_pending())
    }

    /// Accept a fired task's command only if it is still the current one.
    ///
    /// Clears the slot on success so the same id is never honored twice.
    pub fn fired(&mut self, id: TaskId) -> bool {
        if self.task.as_ref().is_some_and(|t| t.id == id) {
            self.task = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(ScheduledTask::is_pending)
    }

    pub fn current_id(&self) -> Option<TaskId> {
        self.task.as_ref().map(ScheduledTask::id)
    }
}
