//! Single-sequence execution primitives.
//!
//! Every component in this crate lives on one cooperative task sequence and
//! defers work only through a [`TimerService`]. This module provides the
//! seams for that model:
//!
//! - [`SequenceChecker`]: debug assertion that calls stay on the owning sequence
//! - [`Clock`]: monotonic time source
//! - [`TimerService`]: delayed task posting with cancellation
//! - [`OneShotTimer`]: an exclusively owned, restartable one-shot timer
//! - [`ManualSequence`]: deterministic virtual-time runner implementing both
//!   `Clock` and `TimerService`
//!
//! ```text
//! external signal ──► component ──► TimerService::schedule ──┐
//!        ▲                                                    │
//!        └──────────────── task runs on the same sequence ◄───┘
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tracing::trace;

/// A unit of deferred work. Tasks never cross threads.
pub type Task = Box<dyn FnOnce() + 'static>;

// =============================================================================
// SequenceChecker
// =============================================================================

/// Asserts (in debug builds) that calls arrive on the owning sequence.
///
/// Binds to the thread that created it, or to the next thread that checks
/// after [`SequenceChecker::detach`].
#[derive(Debug)]
pub struct SequenceChecker {
    owner: Cell<Option<ThreadId>>,
}

impl Default for SequenceChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceChecker {
    /// Bind to the current thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: Cell::new(Some(std::thread::current().id())),
        }
    }

    /// Whether the caller is on the owning sequence. Binds if detached.
    #[must_use]
    pub fn called_on_valid_sequence(&self) -> bool {
        let current = std::thread::current().id();
        match self.owner.get() {
            Some(owner) => owner == current,
            None => {
                self.owner.set(Some(current));
                true
            }
        }
    }

    /// Debug-assert that the caller is on the owning sequence.
    #[track_caller]
    pub fn check(&self) {
        debug_assert!(
            self.called_on_valid_sequence(),
            "called off the owning sequence"
        );
    }

    /// Forget the owner; the next check rebinds.
    pub fn detach(&self) {
        self.owner.set(None);
    }
}

// =============================================================================
// Clock / TimerService
// =============================================================================

/// Monotonic time source.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Identifier of a scheduled task, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Posts tasks to run on the owning sequence after a delay.
pub trait TimerService {
    /// Run `task` after `delay`. Tasks with equal deadlines run in the order
    /// they were scheduled.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a pending task. Unknown or already-run ids are ignored.
    fn cancel(&self, id: TimerId);
}

// =============================================================================
// OneShotTimer
// =============================================================================

/// A restartable one-shot timer owned by a single component.
///
/// `start_once` always stops the pending task before arming, so at most one
/// task is outstanding. A generation counter guards against a task that was
/// already dequeued by the runner when it was cancelled.
pub struct OneShotTimer {
    service: Rc<dyn TimerService>,
    pending: Option<TimerId>,
    delay: Option<Duration>,
    generation: Rc<Cell<u64>>,
    armed: Rc<Cell<bool>>,
}

impl std::fmt::Debug for OneShotTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShotTimer")
            .field("pending", &self.pending)
            .field("delay", &self.delay)
            .field("armed", &self.armed.get())
            .finish()
    }
}

impl OneShotTimer {
    #[must_use]
    pub fn new(service: Rc<dyn TimerService>) -> Self {
        Self {
            service,
            pending: None,
            delay: None,
            generation: Rc::new(Cell::new(0)),
            armed: Rc::new(Cell::new(false)),
        }
    }

    /// Arm the timer, replacing any pending task.
    pub fn start_once(&mut self, delay: Duration, task: impl FnOnce() + 'static) {
        self.stop();
        let generation = self.generation.get();
        let current = Rc::clone(&self.generation);
        let armed = Rc::clone(&self.armed);
        armed.set(true);
        self.delay = Some(delay);
        self.pending = Some(self.service.schedule(
            delay,
            Box::new(move || {
                if current.get() != generation {
                    return;
                }
                armed.set(false);
                task();
            }),
        ));
    }

    /// Cancel the pending task, if any.
    pub fn stop(&mut self) {
        self.generation.set(self.generation.get().wrapping_add(1));
        self.armed.set(false);
        self.delay = None;
        if let Some(id) = self.pending.take() {
            self.service.cancel(id);
        }
    }

    /// Whether a task is armed and has not yet run.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.armed.get()
    }

    /// Delay the timer was last armed with, while it is running.
    #[must_use]
    pub fn current_delay(&self) -> Option<Duration> {
        if self.is_running() { self.delay } else { None }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// ManualSequence
// =============================================================================

struct PendingTask {
    id: TimerId,
    task: Task,
}

struct RunnerState {
    base: Instant,
    elapsed: Duration,
    next_order: u64,
    next_id: u64,
    queue: BTreeMap<(Duration, u64), PendingTask>,
    keys: HashMap<TimerId, (Duration, u64)>,
}

impl RunnerState {
    fn pop_due(&mut self, limit: Duration) -> Option<(Duration, PendingTask)> {
        let (&(deadline, _), _) = self.queue.first_key_value()?;
        if deadline > limit {
            return None;
        }
        let ((deadline, _), pending) = self.queue.pop_first()?;
        self.keys.remove(&pending.id);
        Some((deadline, pending))
    }
}

/// Deterministic virtual-time task runner.
///
/// Time only moves when [`advance`](Self::advance) is called. Cloning yields
/// another handle to the same runner.
#[derive(Clone)]
pub struct ManualSequence {
    state: Rc<RefCell<RunnerState>>,
}

impl std::fmt::Debug for ManualSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ManualSequence")
            .field("elapsed", &state.elapsed)
            .field("pending", &state.queue.len())
            .finish()
    }
}

impl Default for ManualSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualSequence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(RunnerState {
                base: Instant::now(),
                elapsed: Duration::ZERO,
                next_order: 0,
                next_id: 0,
                queue: BTreeMap::new(),
                keys: HashMap::new(),
            })),
        }
    }

    /// Virtual time elapsed since construction.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.state.borrow().elapsed
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Delay until the earliest pending task, if any.
    #[must_use]
    pub fn next_delay(&self) -> Option<Duration> {
        let state = self.state.borrow();
        state
            .queue
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline.saturating_sub(state.elapsed))
    }

    /// Post a task to run at the current virtual time.
    pub fn post_task(&self, task: impl FnOnce() + 'static) -> TimerId {
        self.schedule(Duration::ZERO, Box::new(task))
    }

    /// Run every task that is due now, including tasks they post for now.
    pub fn run_until_idle(&self) -> usize {
        let now = self.elapsed();
        self.run_due(now)
    }

    /// Move virtual time forward by `by`, running due tasks in deadline
    /// order. Each task observes the clock at its own deadline.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.elapsed().saturating_add(by);
        let ran = self.run_due(target);
        self.state.borrow_mut().elapsed = target;
        ran
    }

    /// Advance to the earliest pending deadline and run what is due there.
    pub fn fast_forward_to_next(&self) -> Option<Duration> {
        let delay = self.next_delay()?;
        self.advance(delay);
        Some(delay)
    }

    fn run_due(&self, limit: Duration) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the task runs: tasks schedule more work.
            let next = {
                let mut state = self.state.borrow_mut();
                let popped = state.pop_due(limit);
                if let Some((deadline, _)) = &popped {
                    state.elapsed = state.elapsed.max(*deadline);
                }
                popped
            };
            let Some((_, pending)) = next else {
                return ran;
            };
            trace!(task_id = pending.id.0, "running task");
            (pending.task)();
            ran += 1;
        }
    }
}

impl Clock for ManualSequence {
    fn now(&self) -> Instant {
        let state = self.state.borrow();
        state.base + state.elapsed
    }
}

impl TimerService for ManualSequence {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let key = (state.elapsed.saturating_add(delay), state.next_order);
        state.next_order += 1;
        state.queue.insert(key, PendingTask { id, task });
        state.keys.insert(id, key);
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(key) = state.keys.remove(&id) {
            // Dropping the task may drop captured values; keep it outside the borrow.
            let removed = state.queue.remove(&key);
            drop(state);
            drop(removed);
        }
    }
}
