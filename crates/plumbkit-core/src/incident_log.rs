//! Bounded incident log keyed by scope.
//!
//! Incidents are noteworthy occurrences attributed to a scope (a node in a
//! tree of scopes, e.g. a frame in a page). Each tree owns one
//! [`IncidentLog`], created lazily by the [`IncidentStore`] on first record
//! and destroyed together with the tree's root.
//!
//! # Retention
//!
//! - The log holds at most `capacity` incidents; on overflow the oldest one
//!   is dropped. Callers must not rely on anything older than the last
//!   `capacity` records.
//! - When a non-root scope is deleted, its incidents are re-keyed to the
//!   root of the tree so they stay queryable.
//!
//! ```text
//! record(5, X) ──► [ (5,X) ]
//! record(1, Y) ──► [ (5,X) (1,Y) ]
//! scope 5 deleted, root_of(5) = 1
//!              ──► [ (1,X) (1,Y) ]
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::sequence::SequenceChecker;

/// Default per-tree capacity.
pub const DEFAULT_INCIDENT_CAPACITY: usize = 1000;

// =============================================================================
// Scopes
// =============================================================================

/// Identifier of a scope in a scope tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Answers tree-shape questions about scopes the log does not own.
pub trait ScopeResolver {
    /// Root of the tree containing `scope`, or `None` if the scope is unknown.
    /// A root resolves to itself.
    fn root_of(&self, scope: ScopeId) -> Option<ScopeId>;
}

// =============================================================================
// Incident payloads
// =============================================================================

/// Cookie rejected or warned about under SameSite rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieIncident {
    pub url: String,
    pub cookie_name: String,
    pub reason: String,
}

/// Insecure subresource loaded by a secure document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixedContentIncident {
    pub url: String,
    pub insecure_url: String,
    pub blocked: bool,
}

/// Response blocked by an embedder or resource policy header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedByResponseIncident {
    pub url: String,
    pub reason: String,
}

/// Ad frame unloaded for excessive resource use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeavyAdIncident {
    pub url: String,
    pub resolution: String,
    pub reason: String,
}

/// Content Security Policy violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CspIncident {
    pub url: String,
    pub violated_directive: String,
    pub report_only: bool,
}

/// The closed set of incident kinds the log carries by default.
///
/// Serializes as `{"code": "...", "details": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "details", rename_all = "camelCase")]
pub enum Incident {
    SameSiteCookie(CookieIncident),
    MixedContent(MixedContentIncident),
    BlockedByResponse(BlockedByResponseIncident),
    HeavyAd(HeavyAdIncident),
    ContentSecurityPolicy(CspIncident),
}

impl Incident {
    /// Stable code string, identical to the serialized `code` tag.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SameSiteCookie(_) => "sameSiteCookie",
            Self::MixedContent(_) => "mixedContent",
            Self::BlockedByResponse(_) => "blockedByResponse",
            Self::HeavyAd(_) => "heavyAd",
            Self::ContentSecurityPolicy(_) => "contentSecurityPolicy",
        }
    }

    /// URL of the document or resource the incident is about.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::SameSiteCookie(i) => &i.url,
            Self::MixedContent(i) => &i.url,
            Self::BlockedByResponse(i) => &i.url,
            Self::HeavyAd(i) => &i.url,
            Self::ContentSecurityPolicy(i) => &i.url,
        }
    }
}

// =============================================================================
// IncidentLog
// =============================================================================

#[derive(Debug, Clone)]
struct Entry<T> {
    scope: ScopeId,
    incident: T,
}

/// Fixed-capacity, insertion-ordered log of incidents for one scope tree.
#[derive(Debug)]
pub struct IncidentLog<T = Incident> {
    entries: VecDeque<Entry<T>>,
    capacity: usize,
    total_recorded: u64,
    total_evicted: u64,
    sequence: SequenceChecker,
}

impl<T> Default for IncidentLog<T> {
    fn default() -> Self {
        Self::new(DEFAULT_INCIDENT_CAPACITY)
    }
}

impl<T> IncidentLog<T> {
    /// Create an empty log. A capacity of zero discards every record.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_INCIDENT_CAPACITY)),
            capacity,
            total_recorded: 0,
            total_evicted: 0,
            sequence: SequenceChecker::new(),
        }
    }

    /// Append an incident, evicting the oldest one when full.
    pub fn record(&mut self, scope: ScopeId, incident: T) {
        self.sequence.check();
        self.total_recorded += 1;
        if self.capacity == 0 {
            self.total_evicted += 1;
            return;
        }
        debug_assert!(self.entries.len() <= self.capacity);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.total_evicted += 1;
        }
        self.entries.push_back(Entry { scope, incident });
    }

    /// Incidents whose scope is in `scopes`, oldest first.
    #[must_use]
    pub fn query(&self, scopes: &BTreeSet<ScopeId>) -> Vec<&T> {
        self.sequence.check();
        self.entries
            .iter()
            .filter(|entry| scopes.contains(&entry.scope))
            .map(|entry| &entry.incident)
            .collect()
    }

    /// React to deletion of `scope`.
    ///
    /// Unknown scopes and roots are ignored: a root's log is torn down by its
    /// owner. Otherwise the scope's incidents are re-keyed to the root.
    pub fn on_scope_deleted(&mut self, scope: ScopeId, resolver: &dyn ScopeResolver) {
        self.sequence.check();
        let Some(root) = resolver.root_of(scope) else {
            return;
        };
        if root == scope {
            return;
        }
        let moved = self.rekey(scope, root);
        trace!(scope_id = %scope, root_scope = %root, moved, "re-keyed incidents");
    }

    fn rekey(&mut self, from: ScopeId, to: ScopeId) -> usize {
        let mut moved = 0;
        for entry in self.entries.iter_mut().filter(|entry| entry.scope == from) {
            entry.scope = to;
            moved += 1;
        }
        moved
    }

    /// All retained incidents with their current scope, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (ScopeId, &T)> {
        self.sequence.check();
        self.entries.iter().map(|entry| (entry.scope, &entry.incident))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sequence.check();
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequence.check();
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.sequence.check();
        self.capacity
    }

    /// Records ever accepted, including ones since evicted or discarded.
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.sequence.check();
        self.total_recorded
    }

    #[must_use]
    pub fn total_evicted(&self) -> u64 {
        self.sequence.check();
        self.total_evicted
    }

    #[must_use]
    pub fn stats(&self) -> IncidentLogStats {
        self.sequence.check();
        IncidentLogStats {
            capacity: self.capacity,
            len: self.entries.len(),
            total_recorded: self.total_recorded,
            total_evicted: self.total_evicted,
        }
    }
}

/// Serializable statistics about an incident log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentLogStats {
    pub capacity: usize,
    pub len: usize,
    pub total_recorded: u64,
    pub total_evicted: u64,
}

// =============================================================================
// IncidentStore
// =============================================================================

/// Owns one [`IncidentLog`] per root scope.
pub struct IncidentStore<T = Incident> {
    resolver: Rc<dyn ScopeResolver>,
    capacity: usize,
    logs: HashMap<ScopeId, IncidentLog<T>>,
    sequence: SequenceChecker,
}

impl<T> std::fmt::Debug for IncidentStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncidentStore")
            .field("capacity", &self.capacity)
            .field("roots", &self.logs.len())
            .finish()
    }
}

impl<T> IncidentStore<T> {
    #[must_use]
    pub fn new(resolver: Rc<dyn ScopeResolver>, capacity: usize) -> Self {
        Self {
            resolver,
            capacity,
            logs: HashMap::new(),
            sequence: SequenceChecker::new(),
        }
    }

    /// Record against the tree containing `scope`. Unknown scopes are dropped.
    pub fn record(&mut self, scope: ScopeId, incident: T) {
        self.sequence.check();
        let Some(root) = self.resolver.root_of(scope) else {
            debug!(scope_id = %scope, "dropping incident for unknown scope");
            return;
        };
        let capacity = self.capacity;
        self.logs
            .entry(root)
            .or_insert_with(|| {
                debug!(root_scope = %root, capacity, "creating incident log");
                IncidentLog::new(capacity)
            })
            .record(scope, incident);
    }

    /// Filtered query against the log owned by `root`.
    #[must_use]
    pub fn query(&self, root: ScopeId, scopes: &BTreeSet<ScopeId>) -> Vec<&T> {
        self.sequence.check();
        self.logs
            .get(&root)
            .map(|log| log.query(scopes))
            .unwrap_or_default()
    }

    /// Route a scope deletion: a root takes its log with it, any other scope
    /// has its incidents re-keyed.
    pub fn on_scope_deleted(&mut self, scope: ScopeId) {
        self.sequence.check();
        let Some(root) = self.resolver.root_of(scope) else {
            return;
        };
        if root == scope {
            if let Some(log) = self.logs.remove(&root) {
                debug!(root_scope = %root, dropped = log.len(), "destroying incident log");
            }
            return;
        }
        if let Some(log) = self.logs.get_mut(&root) {
            log.on_scope_deleted(scope, self.resolver.as_ref());
        }
    }

    /// The log owned by `root`, if one has been created.
    #[must_use]
    pub fn log(&self, root: ScopeId) -> Option<&IncidentLog<T>> {
        self.sequence.check();
        self.logs.get(&root)
    }

    /// Number of roots that currently own a log.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.sequence.check();
        self.logs.len()
    }
}
