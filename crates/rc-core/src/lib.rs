//! Resource Classification Core Library
//!
//! Shared vocabulary for deciding whether a resource load may proceed: the
//! data model handed between the browser host, the dispatcher and the filter
//! engine, plus the capability traits the dispatcher consumes.
//!
//! # Architecture
//!
//! Nothing in this crate evaluates filters. The filter engine, frame lookup
//! and site-key storage live behind the traits in [`capability`] and
//! [`snapshot`]; this crate only fixes their contracts so the dispatcher and
//! its embedders agree on them.
//!
//! # Modules
//!
//! - `types`: content types, decisions, match results, frame handles
//! - `headers`: response header view used by response classification
//! - `snapshot`: subscription collections and per-request snapshots
//! - `capability`: frame, site-key and classifier capabilities

pub mod capability;
pub mod headers;
pub mod snapshot;
pub mod types;

// Re-export commonly used types
pub use capability::{FrameResolver, ResourceClassifier, SiteKeyResolver};
pub use headers::ResponseHeaders;
pub use snapshot::{SubscriptionCollection, SubscriptionSnapshot};
pub use types::{
    Classification, ContentType, Decision, FilterMatchResult, FrameId, LiveFrame, ParseFrameIdError,
    SiteKey, SpecialFilterKind,
};
pub use url::Url;
