//! Consolidated view of which tasks of a step have started and exited.
//!
//! Launch and exit reports arrive from many nodes in any order. Each report
//! sets bits in one of two bitmaps under a single mutex and wakes every
//! waiter on the condition variable. A task can be marked exited without
//! ever having been marked started; the two facts are tracked separately.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sattach_transport::{LaunchTasksResponse, TaskExitMsg};
use tracing::debug;

use crate::bitmap::TaskBitmap;

type LaunchCallback = Box<dyn Fn(&LaunchTasksResponse) + Send + Sync>;
type ExitCallback = Box<dyn Fn(&TaskExitMsg) + Send + Sync>;

/// Optional hooks run once per report, with the tracker lock held.
///
/// Callbacks must not call back into the tracker and should not block.
#[derive(Default)]
pub struct TaskCallbacks {
    pub on_task_started: Option<LaunchCallback>,
    pub on_task_exited: Option<ExitCallback>,
}

impl TaskCallbacks {
    pub fn on_started<F>(mut self, f: F) -> Self
    where
        F: Fn(&LaunchTasksResponse) + Send + Sync + 'static,
    {
        self.on_task_started = Some(Box::new(f));
        self
    }

    pub fn on_exited<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskExitMsg) + Send + Sync + 'static,
    {
        self.on_task_exited = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for TaskCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCallbacks")
            .field("on_task_started", &self.on_task_started.is_some())
            .field("on_task_exited", &self.on_task_exited.is_some())
            .finish()
    }
}

/// State guarded by the tracker lock, as seen by [`TaskStateTracker::wait_until`]
/// predicates.
#[derive(Debug, Clone)]
pub struct TaskState {
    started: TaskBitmap,
    exited: TaskBitmap,
    abort: bool,
    abort_action_taken: bool,
}

impl TaskState {
    fn new(requested: usize) -> Self {
        Self {
            started: TaskBitmap::new(requested),
            exited: TaskBitmap::new(requested),
            abort: false,
            abort_action_taken: false,
        }
    }

    pub fn requested(&self) -> usize {
        self.started.len()
    }

    pub fn started(&self) -> &TaskBitmap {
        &self.started
    }

    pub fn exited(&self) -> &TaskBitmap {
        &self.exited
    }

    pub fn all_started(&self) -> bool {
        self.started.is_full()
    }

    pub fn all_exited(&self) -> bool {
        self.exited.is_full()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort
    }

    /// Tasks known to have started and not yet reported an exit.
    pub fn live_tasks(&self) -> Vec<u32> {
        self.started
            .iter_ones()
            .filter(|&t| !self.exited.test(t))
            .map(|t| t as u32)
            .collect()
    }
}

pub struct TaskStateTracker {
    requested: usize,
    state: Mutex<TaskState>,
    cond: Condvar,
    callbacks: TaskCallbacks,
}

impl TaskStateTracker {
    pub fn new(requested: usize, callbacks: TaskCallbacks) -> Self {
        Self {
            requested,
            state: Mutex::new(TaskState::new(requested)),
            cond: Condvar::new(),
            callbacks,
        }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    /// True when every id is a valid task id for this step.
    pub fn accepts(&self, task_ids: &[u32]) -> bool {
        task_ids.iter().all(|&t| (t as usize) < self.requested)
    }

    /// Records a launch report.
    ///
    /// # Panics
    ///
    /// If any task id is not below [`requested`](Self::requested).
    pub fn mark_started(&self, resp: &LaunchTasksResponse) {
        self.check_range(&resp.task_ids);
        let mut state = self.lock();
        for &task in &resp.task_ids {
            state.started.set(task as usize);
        }
        if let Some(cb) = &self.callbacks.on_task_started {
            cb(resp);
        }
        self.cond.notify_all();
    }

    /// Records an exit report.
    ///
    /// # Panics
    ///
    /// If any task id is not below [`requested`](Self::requested).
    pub fn mark_exited(&self, msg: &TaskExitMsg) {
        self.check_range(&msg.task_ids);
        let mut state = self.lock();
        for &task in &msg.task_ids {
            debug!(task, rc = msg.return_code, "task exited");
            state.exited.set(task as usize);
        }
        if let Some(cb) = &self.callbacks.on_task_exited {
            cb(msg);
        }
        self.cond.notify_all();
    }

    /// Blocks until `pred` holds or `timeout` elapses. Returns whether the
    /// predicate held when the wait ended.
    pub fn wait_until<F>(&self, mut pred: F, timeout: Duration) -> bool
    where
        F: FnMut(&TaskState) -> bool,
    {
        let guard = self.lock();
        let (_guard, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |state| !pred(state))
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }

    /// Runs `f` against the current state under the lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&TaskState) -> R) -> R {
        f(&self.lock())
    }

    pub fn snapshot(&self) -> TaskState {
        self.lock().clone()
    }

    pub fn started_count(&self) -> usize {
        self.lock().started.count_ones()
    }

    pub fn exited_count(&self) -> usize {
        self.lock().exited.count_ones()
    }

    pub fn is_started(&self, task: u32) -> bool {
        self.lock().started.test(task as usize)
    }

    pub fn is_exited(&self, task: u32) -> bool {
        self.lock().exited.test(task as usize)
    }

    pub fn all_started(&self) -> bool {
        self.lock().all_started()
    }

    pub fn all_exited(&self) -> bool {
        self.lock().all_exited()
    }

    pub fn live_tasks(&self) -> Vec<u32> {
        self.lock().live_tasks()
    }

    /// Flags the attach as aborted and wakes every waiter.
    pub fn abort(&self) {
        self.lock().abort = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().abort
    }

    /// True exactly once after [`abort`](Self::abort), for whoever gets to
    /// act on it first.
    pub fn take_abort_action(&self) -> bool {
        let mut state = self.lock();
        if state.abort && !state.abort_action_taken {
            state.abort_action_taken = true;
            true
        } else {
            false
        }
    }

    fn check_range(&self, task_ids: &[u32]) {
        for &task in task_ids {
            assert!(
                (task as usize) < self.requested,
                "task id {} out of range for {} requested tasks",
                task,
                self.requested
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TaskStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStateTracker")
            .field("requested", &self.requested)
            .field("state", &*self.lock())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
