//! Resource Classification Dispatcher
//!
//! Decides, for every resource the browser host is about to load, whether the
//! filter engine allows it, blocks it or has nothing to say, and tells
//! interested observers about the outcome.
//!
//! # Architecture
//!
//! The dispatcher lives on one control sequence. Cheap host-side context
//! (frame liveness, ancestor chain, site key) is resolved there; filter
//! evaluation is pushed to a bounded background pool and its outcome is
//! delivered back on the control sequence. Frame liveness is checked again
//! at completion: load callbacks always fire, observers only hear about
//! frames that are still alive.
//!
//! # Modules
//!
//! - `dispatcher`: the entry points and completion handling
//! - `observer`: observer trait, event payloads and the non-owning observer set
//! - `queue`: bounded background work queue
//! - `service`: tokio task owning a dispatcher, with an async handle
//! - `stats`: per-subscription session statistics observer
//! - `config`: dispatcher tunables
//! - `error`: error types

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observer;
mod queue;
pub mod service;
pub mod stats;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::DispatcherConfig;
pub use dispatcher::{ClassificationDispatcher, FilterMatchCallback, RewriteCallback};
pub use error::{ConfigError, DispatchError, JobError};
pub use observer::{AdMatched, ClassificationObserver, PageAllowed, PopupMatched};
pub use service::{DispatcherHandle, DispatcherService};
pub use stats::SessionStats;
