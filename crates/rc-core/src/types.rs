//! Core type definitions
//!
//! These types cross every boundary of the dispatcher: host events carry
//! them in, the filter engine hands them back, observers receive them.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use url::Url;

// =============================================================================
// Content Types
// =============================================================================

/// Kind of resource being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentType {
    Other,
    Script,
    Image,
    Stylesheet,
    Object,
    /// iframe/frame
    Subdocument,
    /// main document
    Document,
    Websocket,
    Webrtc,
    Ping,
    Xmlhttprequest,
    Media,
    Font,
    Popup,
}

impl ContentType {
    /// Lowercase token used in logs and scenario files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Other => "other",
            Self::Script => "script",
            Self::Image => "image",
            Self::Stylesheet => "stylesheet",
            Self::Object => "object",
            Self::Subdocument => "subdocument",
            Self::Document => "document",
            Self::Websocket => "websocket",
            Self::Webrtc => "webrtc",
            Self::Ping => "ping",
            Self::Xmlhttprequest => "xmlhttprequest",
            Self::Media => "media",
            Self::Font => "font",
            Self::Popup => "popup",
        }
    }
}

impl FromStr for ContentType {
    type Err = Infallible;

    /// Parse from a browser resource type token. Unknown tokens are `Other`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "main_frame" | "document" => Self::Document,
            "sub_frame" | "subdocument" => Self::Subdocument,
            "stylesheet" | "css" => Self::Stylesheet,
            "script" | "js" => Self::Script,
            "image" | "img" => Self::Image,
            "font" => Self::Font,
            "object" => Self::Object,
            "xmlhttprequest" | "xhr" | "fetch" => Self::Xmlhttprequest,
            "ping" | "beacon" => Self::Ping,
            "media" => Self::Media,
            "websocket" | "ws" => Self::Websocket,
            "webrtc" => Self::Webrtc,
            "popup" => Self::Popup,
            _ => Self::Other,
        })
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Special Filters
// =============================================================================

/// Filters that switch off parts of blocking for a page rather than
/// matching individual resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialFilterKind {
    /// `$document` - the whole page is allowlisted
    Document,
    /// `$elemhide` - no element hiding on the page
    Elemhide,
    /// `$generichide` - no generic element hiding
    Generichide,
    /// `$genericblock` - no generic blocking filters
    Genericblock,
}

// =============================================================================
// Site Keys
// =============================================================================

/// Per-site token some filters require for matching. Empty when no key is
/// known for the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SiteKey(String);

impl SiteKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Opaque handle to a frame in the host. Background work only ever carries
/// this handle, never the frame itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId {
    /// Renderer process the frame lives in
    pub process_id: i32,
    /// Frame routing id within that process
    pub routing_id: i32,
}

impl FrameId {
    pub const fn new(process_id: i32, routing_id: i32) -> Self {
        Self {
            process_id,
            routing_id,
        }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process_id, self.routing_id)
    }
}

/// Error for frame handles written as `process:routing`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid frame id '{0}', expected <process>:<routing>")]
pub struct ParseFrameIdError(String);

impl FromStr for FrameId {
    type Err = ParseFrameIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (process, routing) = s
            .split_once(':')
            .ok_or_else(|| ParseFrameIdError(s.to_string()))?;
        let process_id = process
            .trim()
            .parse()
            .map_err(|_| ParseFrameIdError(s.to_string()))?;
        let routing_id = routing
            .trim()
            .parse()
            .map_err(|_| ParseFrameIdError(s.to_string()))?;
        Ok(Self::new(process_id, routing_id))
    }
}

/// A frame that resolved successfully on the control sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFrame {
    pub id: FrameId,
    /// URL currently committed in the frame
    pub url: Url,
}

// =============================================================================
// Classification
// =============================================================================

/// Engine-internal tri-state outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Allowed,
    Blocked,
    Ignored,
}

/// What the filter engine decided, together with the subscription that
/// decided it. `Ignored` never names a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ignored,
    Allowed { subscription: Url },
    Blocked { subscription: Url },
}

impl Classification {
    pub fn decision(&self) -> Decision {
        match self {
            Self::Ignored => Decision::Ignored,
            Self::Allowed { .. } => Decision::Allowed,
            Self::Blocked { .. } => Decision::Blocked,
        }
    }

    /// Subscription that produced a non-ignored decision.
    pub fn decisive_subscription(&self) -> Option<&Url> {
        match self {
            Self::Ignored => None,
            Self::Allowed { subscription } | Self::Blocked { subscription } => Some(subscription),
        }
    }

    pub fn match_result(&self) -> FilterMatchResult {
        FilterMatchResult::from(self.decision())
    }
}

// =============================================================================
// Match Result
// =============================================================================

/// Externally reported outcome for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMatchResult {
    /// No filter decided; the load proceeds and nobody is notified.
    NoRule,
    /// An allowing filter matched.
    AllowRule,
    /// A blocking filter matched; the load must not proceed.
    BlockRule,
}

impl FilterMatchResult {
    pub fn is_match(self) -> bool {
        self != Self::NoRule
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoRule => "no_rule",
            Self::AllowRule => "allow_rule",
            Self::BlockRule => "block_rule",
        }
    }
}

impl From<Decision> for FilterMatchResult {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Ignored => Self::NoRule,
            Decision::Allowed => Self::AllowRule,
            Decision::Blocked => Self::BlockRule,
        }
    }
}

impl From<&Classification> for FilterMatchResult {
    fn from(classification: &Classification) -> Self {
        classification.match_result()
    }
}

impl fmt::Display for FilterMatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
