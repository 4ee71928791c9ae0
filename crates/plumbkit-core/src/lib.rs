//! plumbkit-core: notification and coordination plumbing
//!
//! Three small components that sit between external signals (UI, IPC,
//! compositor, storage backends) and the consumers of those signals:
//!
//! ```text
//! incidents ─────► IncidentLog / IncidentStore     (bounded, per root scope)
//! animations ────► PauseCoordinator ──► pause handle (held while busy + grace)
//! quota pressure ► OriginEventDispatcher ──► listeners (debounced, per origin)
//! ```
//!
//! Everything runs on one cooperative task sequence. Deferred work goes
//! through a [`sequence::TimerService`]: [`sequence::ManualSequence`] for
//! deterministic tests and simulations, [`tokio_driver::TokioSequence`] inside
//! a tokio `LocalSet`.
//!
//! # Modules
//!
//! - `incident_log`: bounded per-root incident log and its owning store
//! - `pause`: scoped pause coordinator over animation sources
//! - `dispatcher`: per-origin debounced event dispatcher
//! - `transport`: tokio channel listener endpoints
//! - `sequence`: sequence checker, clock and timer seams, virtual-time runner
//! - `tokio_driver`: tokio-backed timer service and clock
//! - `random`: random delay sources
//! - `config`: TOML configuration and environment overrides
//! - `logging`: tracing subscriber setup
//! - `error`: error types and remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod incident_log;
pub mod logging;
pub mod pause;
pub mod random;
pub mod sequence;
pub mod tokio_driver;
pub mod transport;

pub use config::{IntervalSource, PlumbingConfig};
pub use dispatcher::{
    DispatcherStats, EndpointId, ListenerEndpoint, Origin, OriginEventDispatcher,
};
pub use error::{Error, Result};
pub use incident_log::{Incident, IncidentLog, IncidentStore, ScopeId, ScopeResolver};
pub use pause::{PauseCoordinator, PauseProvider, PauseState, SourceId, SourceSignaller};
pub use sequence::{Clock, ManualSequence, TimerService};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
