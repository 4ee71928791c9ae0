//! Shared fakes for plumbkit-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{ScopeTree, CountingProvider, RecordingEndpoint};
//! ```

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Duration;

use plumbkit_core::dispatcher::{DisconnectHandler, ListenerEndpoint};
use plumbkit_core::incident_log::{ScopeId, ScopeResolver};
use plumbkit_core::pause::{PauseProvider, SourceId, SourceSignaller};
use plumbkit_core::sequence::ManualSequence;

// =============================================================================
// Scope trees
// =============================================================================

/// Mutable scope forest: scope -> parent, `None` for roots.
#[derive(Debug, Default)]
pub struct ScopeTree {
    parents: RefCell<HashMap<ScopeId, Option<ScopeId>>>,
}

impl ScopeTree {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn add_root(&self, scope: u64) {
        self.parents.borrow_mut().insert(ScopeId(scope), None);
    }

    pub fn add_child(&self, scope: u64, parent: u64) {
        self.parents
            .borrow_mut()
            .insert(ScopeId(scope), Some(ScopeId(parent)));
    }

    pub fn remove(&self, scope: u64) {
        self.parents.borrow_mut().remove(&ScopeId(scope));
    }
}

impl ScopeResolver for ScopeTree {
    fn root_of(&self, scope: ScopeId) -> Option<ScopeId> {
        let parents = self.parents.borrow();
        let mut current = scope;
        loop {
            match parents.get(&current)? {
                Some(parent) => current = *parent,
                None => return Some(current),
            }
        }
    }
}

pub fn scopes(ids: &[u64]) -> BTreeSet<ScopeId> {
    ids.iter().copied().map(ScopeId).collect()
}

// =============================================================================
// Pause provider and source signaller
// =============================================================================

#[derive(Debug, Default)]
pub struct PauseCounters {
    pub acquired: Cell<u32>,
    pub released: Cell<u32>,
}

impl PauseCounters {
    pub fn held(&self) -> bool {
        self.acquired.get() > self.released.get()
    }
}

#[derive(Debug)]
pub struct CountingProvider(pub Rc<PauseCounters>);

#[derive(Debug)]
pub struct CountingHandle(Rc<PauseCounters>);

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

/// Tracks which sources are observed and fails on unbalanced calls.
#[derive(Debug, Default)]
pub struct RecordingSignaller {
    pub observed: RefCell<BTreeSet<SourceId>>,
    pub roots: RefCell<Vec<SourceId>>,
}

impl RecordingSignaller {
    pub fn with_roots(roots: &[u64]) -> Rc<Self> {
        let signaller = Self::default();
        *signaller.roots.borrow_mut() = roots.iter().copied().map(SourceId).collect();
        Rc::new(signaller)
    }

    pub fn observed(&self) -> Vec<SourceId> {
        self.observed.borrow().iter().copied().collect()
    }
}

impl SourceSignaller for RecordingSignaller {
    fn observe(&self, source: SourceId) {
        assert!(
            self.observed.borrow_mut().insert(source),
            "source {source} observed twice"
        );
    }

    fn unobserve(&self, source: SourceId) {
        assert!(
            self.observed.borrow_mut().remove(&source),
            "source {source} was not observed"
        );
    }

    fn all_sources(&self) -> Vec<SourceId> {
        self.roots.borrow().clone()
    }
}

// =============================================================================
// Listener endpoints
// =============================================================================

/// Records the virtual time of every delivery.
pub struct RecordingEndpoint {
    clock: ManualSequence,
    deliveries: RefCell<Vec<Duration>>,
    handler: RefCell<Option<DisconnectHandler>>,
}

impl RecordingEndpoint {
    pub fn new(clock: &ManualSequence) -> Rc<Self> {
        Rc::new(Self {
            clock: clock.clone(),
            deliveries: RefCell::new(Vec::new()),
            handler: RefCell::new(None),
        })
    }

    pub fn deliveries(&self) -> Vec<Duration> {
        self.deliveries.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.deliveries.borrow().len()
    }

    /// Fire the installed disconnect handler, as a transport would.
    pub fn disconnect(&self) {
        let handler = self.handler.borrow_mut().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl ListenerEndpoint for RecordingEndpoint {
    fn notify(&self) {
        self.deliveries.borrow_mut().push(self.clock.elapsed());
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        *self.handler.borrow_mut() = Some(handler);
    }
}

pub fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
