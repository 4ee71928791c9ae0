//! Per-origin event dispatcher.
//!
//! Debounces a global "quota pressure" signal and fans it out to every live
//! listener of every origin. Each origin gets a random delay, drawn once when
//! its record is created, so arrival times cannot be used to correlate two
//! origins.
//!
//! ```text
//! maybe_dispatch_events()
//!   │ debounce: now - last >= interval ?
//!   ▼
//! for each origin ── schedule(random_delay) ──► fan-out ──► notify() x N
//! ```
//!
//! Listener endpoints report disconnects through a handler installed at
//! registration; the record is destroyed with its last listener.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::config::IntervalSource;
use crate::error::{Error, Result};
use crate::random::RandomSource;
use crate::sequence::{Clock, SequenceChecker, TimerId, TimerService};

// =============================================================================
// Origin
// =============================================================================

/// A security principal: scheme, host and port of a URL.
///
/// Only tuple origins are accepted; opaque origins (`data:`, `about:blank`)
/// are never equal to anything, not even themselves, so they cannot key a
/// listener registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(url::Origin);

impl Origin {
    /// Parse the origin of an absolute URL.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| Error::InvalidOrigin(format!("{input}: {e}")))?;
        Self::from_url(&url)
    }

    /// The origin of `url`.
    pub fn from_url(url: &Url) -> Result<Self> {
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(Error::InvalidOrigin(format!("{url}: opaque origin")));
        }
        Ok(Self(origin))
    }

    /// ASCII serialization, e.g. `https://example.com:8443`.
    #[must_use]
    pub fn serialization(&self) -> String {
        self.0.ascii_serialization()
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.ascii_serialization())
    }
}

impl std::str::FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Listener endpoints
// =============================================================================

/// Identifier of a registered endpoint, unique within one dispatcher.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EndpointId(pub u64);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invoked once, on the owning sequence, when an endpoint becomes unreachable.
pub type DisconnectHandler = Box<dyn FnOnce() + 'static>;

/// One-way outbound channel to a quota change consumer.
pub trait ListenerEndpoint {
    /// Deliver one event. Must not block; failures surface only as a later
    /// disconnect.
    fn notify(&self);

    /// Install the handler to run when the peer goes away. The handler must
    /// be run on the owning sequence, never from inside `notify`.
    fn on_disconnect(&self, handler: DisconnectHandler);
}

// =============================================================================
// Stats
// =============================================================================

/// Counters for dispatcher activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Calls to `maybe_dispatch_events` that scheduled fan-outs.
    pub dispatches: u64,
    /// Calls swallowed by the debounce window.
    pub suppressed: u64,
    /// Fan-outs that found their record and ran.
    pub fanouts: u64,
    /// Individual `notify()` calls.
    pub notifications: u64,
    /// Fan-outs that fired after their record was destroyed.
    pub dropped_fanouts: u64,
}

// =============================================================================
// Dispatcher
// =============================================================================

struct OriginRecord {
    random_delay: Duration,
    listeners: BTreeMap<EndpointId, Rc<dyn ListenerEndpoint>>,
}

struct Inner {
    timers: Rc<dyn TimerService>,
    clock: Rc<dyn Clock>,
    random: Box<dyn RandomSource>,
    config: Box<dyn IntervalSource>,
    interval: Option<Duration>,
    last_dispatched_at: Option<Instant>,
    records: HashMap<Origin, OriginRecord>,
    next_endpoint: u64,
    next_fanout: u64,
    in_flight: HashMap<u64, TimerId>,
    stats: DispatcherStats,
}

impl Inner {
    fn interval(&mut self) -> Duration {
        if let Some(interval) = self.interval {
            return interval;
        }
        let interval = self.config.dispatch_interval();
        debug!(interval = ?interval, "resolved dispatch interval");
        self.interval = Some(interval);
        interval
    }
}

/// Debounced, per-origin randomised fan-out of quota change events.
pub struct OriginEventDispatcher {
    inner: Rc<RefCell<Inner>>,
    sequence: SequenceChecker,
}

impl std::fmt::Debug for OriginEventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("OriginEventDispatcher")
            .field("origins", &inner.records.len())
            .field("interval", &inner.interval)
            .field("last_dispatched_at", &inner.last_dispatched_at)
            .field("stats", &inner.stats)
            .finish()
    }
}

impl OriginEventDispatcher {
    #[must_use]
    pub fn new(
        timers: Rc<dyn TimerService>,
        clock: Rc<dyn Clock>,
        random: Box<dyn RandomSource>,
        config: Box<dyn IntervalSource>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                timers,
                clock,
                random,
                config,
                interval: None,
                last_dispatched_at: None,
                records: HashMap::new(),
                next_endpoint: 0,
                next_fanout: 0,
                in_flight: HashMap::new(),
                stats: DispatcherStats::default(),
            })),
            sequence: SequenceChecker::new(),
        }
    }

    /// Register `endpoint` for `origin`, creating the origin's record (and
    /// drawing its delay) if needed.
    pub fn add_listener(&self, origin: Origin, endpoint: Rc<dyn ListenerEndpoint>) -> EndpointId {
        self.sequence.check();
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = EndpointId(inner.next_endpoint);
            inner.next_endpoint += 1;

            if !inner.records.contains_key(&origin) {
                let interval = inner.interval();
                let random_delay = inner.random.delay_within(interval);
                debug!(origin = %origin, delay = ?random_delay, "creating origin record");
                inner.records.insert(
                    origin.clone(),
                    OriginRecord {
                        random_delay,
                        listeners: BTreeMap::new(),
                    },
                );
            }
            if let Some(record) = inner.records.get_mut(&origin) {
                record.listeners.insert(id, Rc::clone(&endpoint));
            }
            id
        };

        let weak = Rc::downgrade(&self.inner);
        endpoint.on_disconnect(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                remove_listener(&inner, &origin, id);
            }
        }));
        id
    }

    /// Debounced broadcast. Returns `false` when the call landed inside the
    /// debounce window and nothing was scheduled.
    pub fn maybe_dispatch_events(&self) -> bool {
        self.sequence.check();
        let mut inner = self.inner.borrow_mut();
        let interval = inner.interval();
        let now = inner.clock.now();
        if let Some(last) = inner.last_dispatched_at {
            if now.saturating_duration_since(last) < interval {
                inner.stats.suppressed += 1;
                trace!("dispatch suppressed by debounce window");
                return false;
            }
        }
        inner.last_dispatched_at = Some(now);
        inner.stats.dispatches += 1;

        let targets: Vec<(Origin, Duration)> = inner
            .records
            .iter()
            .map(|(origin, record)| (origin.clone(), record.random_delay))
            .collect();
        debug!(origins = targets.len(), "dispatching quota change");

        for (origin, delay) in targets {
            let ticket = inner.next_fanout;
            inner.next_fanout += 1;
            let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
            let id = inner.timers.schedule(
                delay,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        fan_out(&inner, &origin, Some(ticket));
                    }
                }),
            );
            inner.in_flight.insert(ticket, id);
        }
        true
    }

    /// Notify every current listener of `origin` once, immediately. A missing
    /// record is a no-op.
    pub fn dispatch_events_for_origin(&self, origin: &Origin) {
        self.sequence.check();
        fan_out(&self.inner, origin, None);
    }

    /// Remove endpoint `id` from `origin`, destroying the record if it was
    /// the last listener. Unknown ids are ignored.
    pub fn on_listener_disconnect(&self, origin: &Origin, id: EndpointId) {
        self.sequence.check();
        remove_listener(&self.inner, origin, id);
    }

    #[must_use]
    pub fn origin_count(&self) -> usize {
        self.sequence.check();
        self.inner.borrow().records.len()
    }

    #[must_use]
    pub fn listener_count(&self, origin: &Origin) -> usize {
        self.sequence.check();
        self.inner
            .borrow()
            .records
            .get(origin)
            .map_or(0, |record| record.listeners.len())
    }

    /// The fixed delay of `origin`'s record, if it has one.
    #[must_use]
    pub fn random_delay(&self, origin: &Origin) -> Option<Duration> {
        self.sequence.check();
        self.inner
            .borrow()
            .records
            .get(origin)
            .map(|record| record.random_delay)
    }

    /// The debounce window, resolved from the config on first use.
    #[must_use]
    pub fn dispatch_interval(&self) -> Duration {
        self.sequence.check();
        self.inner.borrow_mut().interval()
    }

    /// Fan-outs scheduled but not yet run.
    #[must_use]
    pub fn pending_fanouts(&self) -> usize {
        self.sequence.check();
        self.inner.borrow().in_flight.len()
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.sequence.check();
        self.inner.borrow().stats.clone()
    }
}

impl Drop for OriginEventDispatcher {
    fn drop(&mut self) {
        self.sequence.check();
        let (records, timers, in_flight) = {
            let mut inner = self.inner.borrow_mut();
            let records = std::mem::take(&mut inner.records);
            let in_flight = std::mem::take(&mut inner.in_flight);
            (records, Rc::clone(&inner.timers), in_flight)
        };
        for id in in_flight.into_values() {
            timers.cancel(id);
        }
        debug!(origins = records.len(), "dropping dispatcher");
        // Endpoints drop here, outside any borrow.
        drop(records);
    }
}

fn fan_out(inner: &Rc<RefCell<Inner>>, origin: &Origin, ticket: Option<u64>) {
    let _span = crate::plumb_span!("fan_out", origin = %origin).entered();
    let ids: Vec<EndpointId> = {
        let mut state = inner.borrow_mut();
        if let Some(ticket) = ticket {
            state.in_flight.remove(&ticket);
        }
        let Some(ids) = state
            .records
            .get(origin)
            .map(|record| record.listeners.keys().copied().collect::<Vec<_>>())
        else {
            if ticket.is_some() {
                state.stats.dropped_fanouts += 1;
                debug!(origin = %origin, "record gone, dropping fan-out");
            }
            return;
        };
        state.stats.fanouts += 1;
        ids
    };

    for id in ids {
        // Re-check each listener: an earlier notify may have disconnected it.
        let endpoint = {
            let mut state = inner.borrow_mut();
            let Some(endpoint) = state
                .records
                .get(origin)
                .and_then(|record| record.listeners.get(&id))
                .map(Rc::clone)
            else {
                continue;
            };
            state.stats.notifications += 1;
            endpoint
        };
        trace!(origin = %origin, endpoint_id = %id, "notifying listener");
        endpoint.notify();
    }
}

fn remove_listener(inner: &Rc<RefCell<Inner>>, origin: &Origin, id: EndpointId) {
    let removed = {
        let mut state = inner.borrow_mut();
        let Some(record) = state.records.get_mut(origin) else {
            return;
        };
        let Some(endpoint) = record.listeners.remove(&id) else {
            return;
        };
        let record = if record.listeners.is_empty() {
            debug!(origin = %origin, "last listener gone, destroying record");
            state.records.remove(origin)
        } else {
            None
        };
        (endpoint, record)
    };
    trace!(origin = %origin, endpoint_id = %id, "listener disconnected");
    drop(removed);
}
