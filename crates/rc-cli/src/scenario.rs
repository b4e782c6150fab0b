//! Scenario files and the table-driven capabilities they describe.
//!
//! A scenario lists frames, site keys, subscription collections and a
//! sequence of host events. Collections are plain tables: URL substrings that
//! block or allow, a rewrite table keyed by substring, and hosts whose
//! documents are allowlisted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use serde::Deserialize;

use rc_core::{
    Classification, ContentType, FrameId, FrameResolver, LiveFrame, ParseFrameIdError,
    ResourceClassifier, ResponseHeaders, SiteKey, SiteKeyResolver, SpecialFilterKind,
    SubscriptionCollection, SubscriptionSnapshot, Url,
};

/// Error type for scenario loading.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid scenario JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid URL '{url}': {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    FrameId(#[from] ParseFrameIdError),
    #[error("Frame {0} declared twice")]
    DuplicateFrame(FrameId),
}

// =============================================================================
// File format
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioFile {
    #[serde(default)]
    frames: Vec<FrameSpec>,
    #[serde(default)]
    site_keys: Vec<SiteKeySpec>,
    #[serde(default)]
    collections: Vec<CollectionSpec>,
    #[serde(default)]
    events: Vec<EventSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrameSpec {
    id: String,
    url: String,
    /// Nearest parent first
    #[serde(default)]
    ancestors: Vec<String>,
    #[serde(default)]
    dies_after_dispatch: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SiteKeySpec {
    page: String,
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CollectionSpec {
    subscription: String,
    #[serde(default)]
    block: Vec<String>,
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    rewrite: Vec<RewriteSpec>,
    #[serde(default)]
    document_allow_hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RewriteSpec {
    pattern: String,
    target: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum EventSpec {
    Request {
        url: String,
        content_type: String,
        frame: String,
    },
    Socket {
        url: String,
        frame: String,
    },
    Response {
        url: String,
        content_type: String,
        frame: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    Popup {
        url: String,
        frame: String,
    },
    Document {
        url: String,
        frame: String,
    },
    Rewrite {
        url: String,
        frame: String,
    },
}

// =============================================================================
// Parsed scenario
// =============================================================================

/// Host event to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Request {
        url: Url,
        content_type: ContentType,
        frame: FrameId,
    },
    Socket {
        url: Url,
        frame: FrameId,
    },
    Response {
        url: Url,
        content_type: ContentType,
        frame: FrameId,
        headers: ResponseHeaders,
    },
    Popup {
        url: Url,
        frame: FrameId,
    },
    Document {
        url: Url,
        frame: FrameId,
    },
    Rewrite {
        url: Url,
        frame: FrameId,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Socket { .. } => "socket",
            Self::Response { .. } => "response",
            Self::Popup { .. } => "popup",
            Self::Document { .. } => "document",
            Self::Rewrite { .. } => "rewrite",
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Request { url, .. }
            | Self::Socket { url, .. }
            | Self::Response { url, .. }
            | Self::Popup { url, .. }
            | Self::Document { url, .. }
            | Self::Rewrite { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone)]
struct FrameEntry {
    frame: LiveFrame,
    ancestors: Vec<Url>,
    dies_after_dispatch: bool,
    dispatched: bool,
}

#[derive(Debug)]
pub struct Scenario {
    frames: Vec<FrameEntry>,
    site_keys: Vec<(Url, SiteKey)>,
    collections: Vec<Arc<TableCollection>>,
    events: Vec<Event>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let text = fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ScenarioError> {
        let file: ScenarioFile = serde_json::from_str(text)?;

        let mut frames: Vec<FrameEntry> = Vec::with_capacity(file.frames.len());
        for spec in file.frames {
            let id: FrameId = spec.id.parse()?;
            if frames.iter().any(|f| f.frame.id == id) {
                return Err(ScenarioError::DuplicateFrame(id));
            }
            frames.push(FrameEntry {
                frame: LiveFrame {
                    id,
                    url: parse_url(&spec.url)?,
                },
                ancestors: parse_urls(&spec.ancestors)?,
                dies_after_dispatch: spec.dies_after_dispatch,
                dispatched: false,
            });
        }

        let site_keys = file
            .site_keys
            .iter()
            .map(|s| Ok((parse_url(&s.page)?, SiteKey::new(s.key.clone()))))
            .collect::<Result<Vec<_>, ScenarioError>>()?;

        let collections = file
            .collections
            .into_iter()
            .map(|c| TableCollection::from_spec(c).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let events = file
            .events
            .into_iter()
            .map(Event::from_spec)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "loaded scenario: {} frames, {} collections, {} events",
            frames.len(),
            collections.len(),
            events.len()
        );
        Ok(Self {
            frames,
            site_keys,
            collections,
            events,
        })
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn frames(&self) -> ScenarioFrames {
        ScenarioFrames::new(&self.frames)
    }

    pub fn site_keys(&self) -> ScenarioSiteKeys {
        ScenarioSiteKeys {
            keys: self.site_keys.clone(),
        }
    }

    pub fn classifier(&self) -> TableClassifier {
        TableClassifier {
            collections: self.collections.clone(),
        }
    }

    /// Snapshot over every collection, in declaration order.
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.collections
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn SubscriptionCollection>)
            .collect()
    }
}

impl Event {
    fn from_spec(spec: EventSpec) -> Result<Self, ScenarioError> {
        Ok(match spec {
            EventSpec::Request {
                url,
                content_type,
                frame,
            } => Self::Request {
                url: parse_url(&url)?,
                content_type: parse_content_type(&content_type),
                frame: frame.parse()?,
            },
            EventSpec::Socket { url, frame } => Self::Socket {
                url: parse_url(&url)?,
                frame: frame.parse()?,
            },
            EventSpec::Response {
                url,
                content_type,
                frame,
                headers,
            } => Self::Response {
                url: parse_url(&url)?,
                content_type: parse_content_type(&content_type),
                frame: frame.parse()?,
                headers: headers.into_iter().collect(),
            },
            EventSpec::Popup { url, frame } => Self::Popup {
                url: parse_url(&url)?,
                frame: frame.parse()?,
            },
            EventSpec::Document { url, frame } => Self::Document {
                url: parse_url(&url)?,
                frame: frame.parse()?,
            },
            EventSpec::Rewrite { url, frame } => Self::Rewrite {
                url: parse_url(&url)?,
                frame: frame.parse()?,
            },
        })
    }
}

fn parse_url(url: &str) -> Result<Url, ScenarioError> {
    Url::parse(url).map_err(|source| ScenarioError::Url {
        url: url.to_string(),
        source,
    })
}

fn parse_urls(urls: &[String]) -> Result<Vec<Url>, ScenarioError> {
    urls.iter().map(|u| parse_url(u)).collect()
}

fn parse_content_type(token: &str) -> ContentType {
    match token.parse() {
        Ok(content_type) => content_type,
        Err(never) => match never {},
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Frame table shared between the replay driver and the dispatcher.
///
/// A frame marked `dies_after_dispatch` survives its first lookup and is
/// gone for every later one, so it dies while its evaluation is running.
#[derive(Debug, Clone)]
pub struct ScenarioFrames {
    frames: Arc<Mutex<HashMap<FrameId, FrameEntry>>>,
}

impl ScenarioFrames {
    fn new(entries: &[FrameEntry]) -> Self {
        let frames = entries.iter().map(|e| (e.frame.id, e.clone())).collect();
        Self {
            frames: Arc::new(Mutex::new(frames)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FrameId, FrameEntry>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameResolver for ScenarioFrames {
    fn resolve(&self, id: FrameId) -> Option<LiveFrame> {
        let mut frames = self.lock();
        let entry = frames.get_mut(&id)?;
        if entry.dies_after_dispatch && entry.dispatched {
            debug!("frame {} destroyed", id);
            frames.remove(&id);
            return None;
        }
        entry.dispatched = true;
        Some(entry.frame.clone())
    }

    fn ancestor_chain(&self, frame: &LiveFrame) -> Vec<Url> {
        self.lock()
            .get(&frame.id)
            .map(|e| e.ancestors.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Site keys
// =============================================================================

#[derive(Debug, Clone)]
pub struct ScenarioSiteKeys {
    keys: Vec<(Url, SiteKey)>,
}

impl SiteKeyResolver for ScenarioSiteKeys {
    /// First URL in `urls` with a registered key.
    fn find_site_key(&self, urls: &[Url]) -> Option<(Url, SiteKey)> {
        urls.iter()
            .find_map(|u| self.keys.iter().find(|(page, _)| page == u).cloned())
    }
}

// =============================================================================
// Collections and classifier
// =============================================================================

#[derive(Debug)]
pub struct TableCollection {
    subscription: Url,
    block: Vec<String>,
    allow: Vec<String>,
    rewrite: Vec<(String, Url)>,
    document_allow_hosts: Vec<String>,
}

impl TableCollection {
    fn from_spec(spec: CollectionSpec) -> Result<Self, ScenarioError> {
        let rewrite = spec
            .rewrite
            .into_iter()
            .map(|r| Ok((r.pattern, parse_url(&r.target)?)))
            .collect::<Result<Vec<_>, ScenarioError>>()?;
        Ok(Self {
            subscription: parse_url(&spec.subscription)?,
            block: spec.block,
            allow: spec.allow,
            rewrite,
            document_allow_hosts: spec.document_allow_hosts,
        })
    }

    fn allows(&self, url: &Url) -> bool {
        self.allow.iter().any(|p| url.as_str().contains(p.as_str()))
    }

    fn blocks(&self, url: &Url) -> bool {
        self.block.iter().any(|p| url.as_str().contains(p.as_str()))
    }
}

impl SubscriptionCollection for TableCollection {
    fn rewrite_target(&self, url: &Url, _ancestors: &[Url]) -> Option<Url> {
        self.rewrite
            .iter()
            .find(|(pattern, _)| url.as_str().contains(pattern.as_str()))
            .map(|(_, target)| target.clone())
    }

    fn find_by_special_filter(
        &self,
        kind: SpecialFilterKind,
        url: &Url,
        _ancestors: &[Url],
        _site_key: &SiteKey,
    ) -> Option<Url> {
        if kind != SpecialFilterKind::Document {
            return None;
        }
        let host = url.host_str()?;
        self.document_allow_hosts
            .iter()
            .any(|h| host == h || host.ends_with(&format!(".{}", h)))
            .then(|| self.subscription.clone())
    }
}

/// Filter engine over the scenario's tables. Only collections present in the
/// request's snapshot take part; an allowing entry in any of them beats a
/// blocking one.
#[derive(Debug, Clone)]
pub struct TableClassifier {
    collections: Vec<Arc<TableCollection>>,
}

impl TableClassifier {
    fn classify(&self, snapshot: &SubscriptionSnapshot, url: &Url) -> Classification {
        let active: Vec<&TableCollection> = self
            .collections
            .iter()
            .map(|c| c.as_ref())
            .filter(|c| in_snapshot(snapshot, c))
            .collect();
        if let Some(c) = active.iter().find(|c| c.allows(url)) {
            return Classification::Allowed {
                subscription: c.subscription.clone(),
            };
        }
        if let Some(c) = active.iter().find(|c| c.blocks(url)) {
            return Classification::Blocked {
                subscription: c.subscription.clone(),
            };
        }
        Classification::Ignored
    }
}

fn in_snapshot(snapshot: &SubscriptionSnapshot, collection: &TableCollection) -> bool {
    snapshot.iter().any(|c| std::ptr::addr_eq(c, collection))
}

impl ResourceClassifier for TableClassifier {
    fn classify_request(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        _ancestors: &[Url],
        _content_type: ContentType,
        _site_key: &SiteKey,
    ) -> Classification {
        self.classify(&snapshot, url)
    }

    fn classify_response(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        _ancestors: &[Url],
        _content_type: ContentType,
        _headers: &ResponseHeaders,
    ) -> Classification {
        self.classify(&snapshot, url)
    }

    fn classify_popup(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        _ancestors: &[Url],
        _site_key: &SiteKey,
    ) -> Classification {
        self.classify(&snapshot, url)
    }
}
