//! Scoped pause coordinator.
//!
//! Holds a single pause handle (e.g. a paused window occlusion tracker) while
//! one or more compositor sources are still animating, plus an optional
//! trailing grace interval after the last source goes quiet.
//!
//! # States
//!
//! ```text
//!            pause                 last source drops, grace = 0
//!   Idle ───────────► Active ─────────────────────────────────► Idle
//!                      ▲  │ last source drops, grace > 0
//!               pause  │  ▼
//!                    Trailing ──── timer fires ───────────────► Idle
//! ```
//!
//! The handle is held exactly when the observation set is non-empty or the
//! release timer is pending. The recorded grace interval only grows during
//! an episode and is cleared when the release timer is armed.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sequence::{OneShotTimer, SequenceChecker, TimerService};

/// Identity of an animation source (a compositor).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Acquires the resource whose lifetime keeps the tracked activity paused.
pub trait PauseProvider {
    /// Dropping the handle resumes the activity.
    type Handle;

    fn acquire(&self) -> Self::Handle;
}

/// Subscription control over animation sources.
///
/// The embedder routes the sources' "last animation ended" and "shutting
/// down" edges to [`PauseCoordinator::on_last_animation_ended`] and
/// [`PauseCoordinator::on_shutting_down`] for every observed source.
pub trait SourceSignaller {
    fn observe(&self, source: SourceId);

    fn unobserve(&self, source: SourceId);

    /// Every source currently alive (one per root window).
    fn all_sources(&self) -> Vec<SourceId> {
        Vec::new()
    }
}

/// Coarse coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseState {
    /// No sources, no handle.
    Idle,
    /// At least one source observed, handle held.
    Active,
    /// No sources, handle held until the grace timer fires.
    Trailing,
}

impl std::fmt::Display for PauseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Trailing => write!(f, "trailing"),
        }
    }
}

struct Inner<P: PauseProvider> {
    signaller: Rc<dyn SourceSignaller>,
    observed: BTreeSet<SourceId>,
    handle: Option<P::Handle>,
    pending_grace: Duration,
    timer: OneShotTimer,
}

impl<P: PauseProvider> Inner<P> {
    fn state(&self) -> PauseState {
        if !self.observed.is_empty() {
            PauseState::Active
        } else if self.timer.is_running() {
            PauseState::Trailing
        } else {
            PauseState::Idle
        }
    }

    /// Drop the handle. Idempotent.
    fn release(&mut self) -> Option<P::Handle> {
        let handle = self.handle.take();
        if handle.is_some() {
            debug!("releasing pause");
        }
        handle
    }
}

/// Reference-counted pause over a shared resource, driven by source signals.
pub struct PauseCoordinator<P: PauseProvider + 'static> {
    provider: P,
    inner: Rc<RefCell<Inner<P>>>,
    sequence: SequenceChecker,
}

impl<P: PauseProvider + 'static> std::fmt::Debug for PauseCoordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("PauseCoordinator")
            .field("state", &inner.state())
            .field("observed", &inner.observed)
            .field("pending_grace", &inner.pending_grace)
            .finish()
    }
}

impl<P: PauseProvider + 'static> PauseCoordinator<P> {
    #[must_use]
    pub fn new(
        provider: P,
        signaller: Rc<dyn SourceSignaller>,
        timers: Rc<dyn TimerService>,
    ) -> Self {
        Self {
            provider,
            inner: Rc::new(RefCell::new(Inner {
                signaller,
                observed: BTreeSet::new(),
                handle: None,
                pending_grace: Duration::ZERO,
                timer: OneShotTimer::new(timers),
            })),
            sequence: SequenceChecker::new(),
        }
    }

    /// Pause until every source in `sources` has signalled, then keep the
    /// pause for at least `extra_grace` more.
    ///
    /// The provider and signaller are called with no borrow held, so either
    /// may call back into the coordinator.
    pub fn pause_until_quiescent(
        &self,
        sources: impl IntoIterator<Item = SourceId>,
        extra_grace: Duration,
    ) {
        self.sequence.check();
        let (added, signaller, needs_handle) = {
            let mut inner = self.inner.borrow_mut();
            let mut added = Vec::new();
            let mut any = false;
            for source in sources {
                any = true;
                inner.timer.stop();
                if inner.pending_grace < extra_grace {
                    inner.pending_grace = extra_grace;
                }
                if inner.observed.insert(source) {
                    added.push(source);
                }
            }
            (added, Rc::clone(&inner.signaller), any && inner.handle.is_none())
        };

        if needs_handle {
            debug!(sources = added.len(), "acquiring pause");
            let handle = self.provider.acquire();
            self.adopt_handle(handle);
        }
        for source in added {
            // A callback may already have finished this source.
            if self.inner.borrow().observed.contains(&source) {
                signaller.observe(source);
            }
        }
    }

    /// Store a freshly acquired handle unless a callback made it redundant.
    fn adopt_handle(&self, handle: P::Handle) {
        let surplus = {
            let mut inner = self.inner.borrow_mut();
            let wanted = !inner.observed.is_empty() || inner.timer.is_running();
            if wanted && inner.handle.is_none() {
                inner.handle = Some(handle);
                None
            } else {
                Some(handle)
            }
        };
        drop(surplus);
    }

    /// [`pause_until_quiescent`](Self::pause_until_quiescent) over every
    /// source the signaller knows about.
    pub fn pause_until_animations_end(&self, extra_grace: Duration) {
        self.sequence.check();
        let signaller = Rc::clone(&self.inner.borrow().signaller);
        self.pause_until_quiescent(signaller.all_sources(), extra_grace);
    }

    /// The source's last running animation ended.
    pub fn on_last_animation_ended(&self, source: SourceId) {
        self.sequence.check();
        self.on_finish(source);
    }

    /// The source is going away.
    pub fn on_shutting_down(&self, source: SourceId) {
        self.sequence.check();
        self.on_finish(source);
    }

    fn on_finish(&self, source: SourceId) {
        let (signaller, released) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.observed.remove(&source) {
                return;
            }
            let signaller = Rc::clone(&inner.signaller);

            let released = if !inner.observed.is_empty() {
                None
            } else if inner.pending_grace.is_zero() {
                inner.release()
            } else {
                let grace = std::mem::take(&mut inner.pending_grace);
                debug!(source_id = %source, grace = ?grace, "arming release timer");
                let weak: Weak<RefCell<Inner<P>>> = Rc::downgrade(&self.inner);
                inner.timer.start_once(grace, move || {
                    if let Some(inner) = weak.upgrade() {
                        let handle = inner.borrow_mut().release();
                        drop(handle);
                    }
                });
                None
            };
            (signaller, released)
        };
        // Both run outside the borrow.
        signaller.unobserve(source);
        drop(released);
    }

    #[must_use]
    pub fn state(&self) -> PauseState {
        self.sequence.check();
        self.inner.borrow().state()
    }

    /// Whether the pause handle is currently held.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.sequence.check();
        self.inner.borrow().handle.is_some()
    }

    #[must_use]
    pub fn observed_count(&self) -> usize {
        self.sequence.check();
        self.inner.borrow().observed.len()
    }

    #[must_use]
    pub fn is_observing(&self, source: SourceId) -> bool {
        self.sequence.check();
        self.inner.borrow().observed.contains(&source)
    }

    /// Grace interval that will be applied when the last source drops.
    #[must_use]
    pub fn pending_grace(&self) -> Duration {
        self.sequence.check();
        self.inner.borrow().pending_grace
    }
}

impl<P: PauseProvider + 'static> Drop for PauseCoordinator<P> {
    fn drop(&mut self) {
        self.sequence.check();
        let (handle, signaller, observed) = {
            let mut inner = self.inner.borrow_mut();
            inner.timer.stop();
            inner.pending_grace = Duration::ZERO;
            let observed = std::mem::take(&mut inner.observed);
            (inner.release(), Rc::clone(&inner.signaller), observed)
        };
        for source in observed {
            signaller.unobserve(source);
        }
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::ManualSequence;
    use std::cell::Cell;

    #[derive(Default)]
    struct Counters {
        acquired: Cell<u32>,
        released: Cell<u32>,
    }

    struct CountingProvider(Rc<Counters>);

    struct CountingHandle(Rc<Counters>);

    impl Drop for CountingHandle {
        fn drop(&mut self) {
            self.0.released.set(self.0.released.get() + 1);
        }
    }

    impl PauseProvider for CountingProvider {
        type Handle = CountingHandle;

        fn acquire(&self) -> CountingHandle {
            self.0.acquired.set(self.0.acquired.get() + 1);
            CountingHandle(Rc::clone(&self.0))
        }
    }

    #[derive(Default)]
    struct Signaller {
        observed: RefCell<BTreeSet<SourceId>>,
        roots: Vec<SourceId>,
    }

    impl SourceSignaller for Signaller {
        fn observe(&self, source: SourceId) {
            assert!(self.observed.borrow_mut().insert(source), "double observe");
        }

        fn unobserve(&self, source: SourceId) {
            assert!(self.observed.borrow_mut().remove(&source), "stray unobserve");
        }

        fn all_sources(&self) -> Vec<SourceId> {
            self.roots.clone()
        }
    }

    struct Fixture {
        seq: ManualSequence,
        counters: Rc<Counters>,
        signaller: Rc<Signaller>,
        pauser: PauseCoordinator<CountingProvider>,
    }

    fn fixture_with_roots(roots: Vec<SourceId>) -> Fixture {
        let seq = ManualSequence::new();
        let counters = Rc::new(Counters::default());
        let signaller = Rc::new(Signaller {
            roots,
            ..Signaller::default()
        });
        let pauser = PauseCoordinator::new(
            CountingProvider(Rc::clone(&counters)),
            signaller.clone(),
            Rc::new(seq.clone()),
        );
        Fixture {
            seq,
            counters,
            signaller,
            pauser,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_roots(Vec::new())
    }

    const S: SourceId = SourceId(1);
    const S2: SourceId = SourceId(2);

    #[test]
    fn starts_idle() {
        let f = fixture();
        assert_eq!(f.pauser.state(), PauseState::Idle);
        assert!(!f.pauser.is_paused());
    }

    #[test]
    fn zero_grace_releases_synchronously() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S], Duration::ZERO);
        assert_eq!(f.pauser.state(), PauseState::Active);
        assert!(f.signaller.observed.borrow().contains(&S));
        f.pauser.on_last_animation_ended(S);
        assert_eq!(f.pauser.state(), PauseState::Idle);
        assert_eq!(f.counters.released.get(), 1);
        assert!(f.signaller.observed.borrow().is_empty());
        assert_eq!(f.seq.pending_tasks(), 0);
    }

    #[test]
    fn grace_extension_uses_maximum() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S], Duration::from_millis(10));
        f.pauser.pause_until_quiescent([S], Duration::from_millis(50));
        assert_eq!(f.pauser.pending_grace(), Duration::from_millis(50));
        f.pauser.on_last_animation_ended(S);
        assert_eq!(f.pauser.state(), PauseState::Trailing);
        assert_eq!(f.pauser.pending_grace(), Duration::ZERO);

        f.seq.advance(Duration::from_millis(10));
        assert!(f.pauser.is_paused());
        f.seq.advance(Duration::from_millis(39));
        assert!(f.pauser.is_paused());
        f.seq.advance(Duration::from_millis(1));
        assert!(!f.pauser.is_paused());
        assert_eq!(f.pauser.state(), PauseState::Idle);
        assert_eq!(f.counters.acquired.get(), 1);
        assert_eq!(f.counters.released.get(), 1);
    }

    #[test]
    fn smaller_grace_does_not_shrink_recorded_value() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S], Duration::from_millis(50));
        f.pauser.pause_until_quiescent([S2], Duration::from_millis(10));
        assert_eq!(f.pauser.pending_grace(), Duration::from_millis(50));
    }

    #[test]
    fn multi_source_waits_for_last() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S, S2], Duration::ZERO);
        assert_eq!(f.pauser.observed_count(), 2);
        f.pauser.on_last_animation_ended(S);
        assert!(f.pauser.is_paused());
        f.pauser.on_shutting_down(S2);
        assert!(!f.pauser.is_paused());
        assert_eq!(f.counters.released.get(), 1);
    }

    #[test]
    fn stale_signal_is_ignored() {
        let f = fixture();
        f.pauser.on_last_animation_ended(S);
        assert_eq!(f.pauser.state(), PauseState::Idle);
        f.pauser.pause_until_quiescent([S], Duration::ZERO);
        f.pauser.on_shutting_down(S2);
        assert!(f.pauser.is_observing(S));
        assert!(f.pauser.is_paused());
    }

    #[test]
    fn new_pause_during_trailing_cancels_release() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S], Duration::from_millis(20));
        f.pauser.on_last_animation_ended(S);
        f.seq.advance(Duration::from_millis(15));
        assert_eq!(f.pauser.state(), PauseState::Trailing);

        f.pauser.pause_until_quiescent([S], Duration::ZERO);
        assert_eq!(f.pauser.state(), PauseState::Active);
        f.seq.advance(Duration::from_millis(100));
        assert!(f.pauser.is_paused());
        assert_eq!(f.counters.acquired.get(), 1);

        f.pauser.on_last_animation_ended(S);
        assert!(!f.pauser.is_paused());
        assert_eq!(f.counters.released.get(), 1);
    }

    #[test]
    fn duplicate_source_is_observed_once() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S, S], Duration::ZERO);
        f.pauser.pause_until_quiescent([S], Duration::ZERO);
        assert_eq!(f.pauser.observed_count(), 1);
        assert_eq!(f.counters.acquired.get(), 1);
    }

    #[test]
    fn animations_end_covers_all_roots() {
        let f = fixture_with_roots(vec![SourceId(7), SourceId(8)]);
        f.pauser.pause_until_animations_end(Duration::ZERO);
        assert!(f.pauser.is_observing(SourceId(7)));
        assert!(f.pauser.is_observing(SourceId(8)));
        assert_eq!(f.counters.acquired.get(), 1);
    }

    #[test]
    fn drop_releases_and_unobserves() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S, S2], Duration::from_secs(1));
        let Fixture {
            seq,
            counters,
            signaller,
            pauser,
        } = f;
        drop(pauser);
        assert_eq!(counters.released.get(), 1);
        assert!(signaller.observed.borrow().is_empty());
        seq.advance(Duration::from_secs(5));
        assert_eq!(counters.released.get(), 1);
    }

    #[test]
    fn drop_while_trailing_releases_once() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S], Duration::from_secs(1));
        f.pauser.on_last_animation_ended(S);
        let Fixture {
            seq,
            counters,
            pauser,
            ..
        } = f;
        drop(pauser);
        assert_eq!(counters.released.get(), 1);
        assert_eq!(seq.pending_tasks(), 0);
        seq.advance(Duration::from_secs(2));
        assert_eq!(counters.released.get(), 1);
    }

    #[test]
    fn unbounded_grace_holds_pause() {
        let f = fixture();
        f.pauser.pause_until_quiescent([S], Duration::MAX);
        f.pauser.on_last_animation_ended(S);
        assert_eq!(f.pauser.state(), PauseState::Trailing);
        f.seq.advance(Duration::from_secs(86_400));
        assert!(f.pauser.is_paused());
        assert_eq!(f.counters.released.get(), 0);
    }

    // -- Callbacks into the coordinator -----------------------------------------

    /// Signaller that talks back to the coordinator from inside `observe`.
    #[derive(Default)]
    struct EagerSignaller {
        pauser: RefCell<Weak<PauseCoordinator<CountingProvider>>>,
        finish_on_observe: bool,
        seen_observing: RefCell<Vec<bool>>,
        unobserved: RefCell<Vec<SourceId>>,
    }

    impl SourceSignaller for EagerSignaller {
        fn observe(&self, source: SourceId) {
            let pauser = self.pauser.borrow().upgrade();
            if let Some(pauser) = pauser {
                self.seen_observing
                    .borrow_mut()
                    .push(pauser.is_observing(source));
                if self.finish_on_observe {
                    pauser.on_shutting_down(source);
                }
            }
        }

        fn unobserve(&self, source: SourceId) {
            self.unobserved.borrow_mut().push(source);
        }
    }

    fn eager_fixture(
        finish_on_observe: bool,
    ) -> (
        ManualSequence,
        Rc<Counters>,
        Rc<EagerSignaller>,
        Rc<PauseCoordinator<CountingProvider>>,
    ) {
        let seq = ManualSequence::new();
        let counters = Rc::new(Counters::default());
        let signaller = Rc::new(EagerSignaller {
            finish_on_observe,
            ..EagerSignaller::default()
        });
        let pauser = Rc::new(PauseCoordinator::new(
            CountingProvider(Rc::clone(&counters)),
            signaller.clone(),
            Rc::new(seq.clone()),
        ));
        *signaller.pauser.borrow_mut() = Rc::downgrade(&pauser);
        (seq, counters, signaller, pauser)
    }

    #[test]
    fn signaller_may_query_during_observe() {
        let (_seq, counters, signaller, pauser) = eager_fixture(false);
        pauser.pause_until_quiescent([S, S2], Duration::ZERO);
        assert_eq!(*signaller.seen_observing.borrow(), vec![true, true]);
        assert_eq!(pauser.state(), PauseState::Active);
        assert_eq!(counters.acquired.get(), 1);
    }

    #[test]
    fn source_shutting_down_during_observe_releases() {
        let (_seq, counters, signaller, pauser) = eager_fixture(true);
        pauser.pause_until_quiescent([S], Duration::ZERO);
        assert_eq!(pauser.state(), PauseState::Idle);
        assert!(!pauser.is_paused());
        assert_eq!(counters.acquired.get(), 1);
        assert_eq!(counters.released.get(), 1);
        assert_eq!(*signaller.unobserved.borrow(), vec![S]);
    }

    #[test]
    fn source_shutting_down_during_observe_keeps_grace() {
        let (seq, counters, _signaller, pauser) = eager_fixture(true);
        pauser.pause_until_quiescent([S], Duration::from_millis(10));
        assert_eq!(pauser.state(), PauseState::Trailing);
        assert!(pauser.is_paused());
        seq.advance(Duration::from_millis(10));
        assert_eq!(pauser.state(), PauseState::Idle);
        assert_eq!(counters.released.get(), 1);
    }

    #[test]
    fn state_display() {
        assert_eq!(PauseState::Trailing.to_string(), "trailing");
    }
}
