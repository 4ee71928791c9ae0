//! Tokio-backed sequence driver.
//!
//! [`TokioSequence`] implements [`TimerService`] and [`Clock`] on top of a
//! current-thread tokio runtime. Tasks are spawned with
//! [`tokio::task::spawn_local`], so every method must be called from inside a
//! [`tokio::task::LocalSet`]. The clock reads [`tokio::time::Instant`], which
//! honours paused test time.
//!
//! [`TokioSequence::spawn`] runs arbitrary futures under the same
//! bookkeeping, for watchers that wait on something other than time.
//!
//! Unlike [`ManualSequence`](crate::sequence::ManualSequence), tasks sharing
//! a deadline are not guaranteed to run in scheduling order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tracing::trace;

use crate::sequence::{Clock, Task, TimerId, TimerService};

#[derive(Debug, Default)]
struct DriverState {
    next_id: u64,
    tasks: HashMap<TimerId, AbortHandle>,
}

/// Timer service and clock for components hosted on a tokio `LocalSet`.
///
/// Cloning yields another handle to the same driver.
#[derive(Debug, Clone, Default)]
pub struct TokioSequence {
    state: Rc<RefCell<DriverState>>,
}

impl TokioSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks spawned and not yet run or cancelled.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    /// Abort every pending task.
    pub fn cancel_all(&self) {
        let handles: Vec<AbortHandle> = self
            .state
            .borrow_mut()
            .tasks
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    /// Run `future` on the local set. The returned id cancels it like any
    /// scheduled task.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> TimerId {
        let id = self.next_id();
        self.track(id, future);
        id
    }

    fn next_id(&self) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        id
    }

    fn track(&self, id: TimerId, future: impl Future<Output = ()> + 'static) {
        let state = Rc::clone(&self.state);
        // spawn_local does not poll before we yield, so the handle is
        // registered before the task can remove it.
        let join = tokio::task::spawn_local(async move {
            future.await;
            state.borrow_mut().tasks.remove(&id);
        });
        self.state
            .borrow_mut()
            .tasks
            .insert(id, join.abort_handle());
    }
}

impl TimerService for TokioSequence {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_id();
        let state = Rc::clone(&self.state);
        self.track(id, async move {
            tokio::time::sleep(delay).await;
            state.borrow_mut().tasks.remove(&id);
            trace!(task_id = id.0, "running task");
            task();
        });
        id
    }

    fn cancel(&self, id: TimerId) {
        let handle = self.state.borrow_mut().tasks.remove(&id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Clock for TokioSequence {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
