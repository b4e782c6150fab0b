//! Test doubles for the dispatcher's capabilities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rc_core::{
    Classification, ContentType, FilterMatchResult, FrameId, FrameResolver, LiveFrame,
    ResourceClassifier, ResponseHeaders, SiteKey, SiteKeyResolver, SpecialFilterKind,
    SubscriptionCollection, SubscriptionSnapshot, Url,
};

use crate::observer::{AdMatched, ClassificationObserver, PageAllowed, PopupMatched};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub(crate) fn easylist() -> Url {
    url("https://easylist.com/list.txt")
}

// =============================================================================
// Frames
// =============================================================================

struct FrameEntry {
    frame: LiveFrame,
    ancestors: Vec<Url>,
}

/// Shared frame table; clones see the same frames, so a test can destroy a
/// frame after handing the resolver to the dispatcher.
#[derive(Clone, Default)]
pub(crate) struct FakeFrames {
    frames: Arc<Mutex<HashMap<FrameId, FrameEntry>>>,
    resolves: Arc<AtomicUsize>,
}

impl FakeFrames {
    pub fn with_frame(id: FrameId, frame_url: &str, ancestors: &[&str]) -> Self {
        let frames = Self::default();
        frames.insert(id, frame_url, ancestors);
        frames
    }

    pub fn insert(&self, id: FrameId, frame_url: &str, ancestors: &[&str]) {
        let entry = FrameEntry {
            frame: LiveFrame { id, url: url(frame_url) },
            ancestors: ancestors.iter().map(|a| url(a)).collect(),
        };
        self.frames.lock().unwrap().insert(id, entry);
    }

    pub fn destroy(&self, id: FrameId) {
        self.frames.lock().unwrap().remove(&id);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl FrameResolver for FakeFrames {
    fn resolve(&self, id: FrameId) -> Option<LiveFrame> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.frames.lock().unwrap().get(&id).map(|e| e.frame.clone())
    }

    fn ancestor_chain(&self, frame: &LiveFrame) -> Vec<Url> {
        self.frames
            .lock()
            .unwrap()
            .get(&frame.id)
            .map(|e| e.ancestors.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Site keys
// =============================================================================

#[derive(Default)]
pub(crate) struct FakeSiteKeys {
    key: Option<(Url, SiteKey)>,
    queries: Mutex<Vec<Vec<Url>>>,
}

impl FakeSiteKeys {
    pub fn none() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_key(page: &str, key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: Some((url(page), SiteKey::new(key))),
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn queries(&self) -> Vec<Vec<Url>> {
        self.queries.lock().unwrap().clone()
    }
}

impl SiteKeyResolver for FakeSiteKeys {
    fn find_site_key(&self, urls: &[Url]) -> Option<(Url, SiteKey)> {
        self.queries.lock().unwrap().push(urls.to_vec());
        self.key.clone()
    }
}

// =============================================================================
// Classifier
// =============================================================================

/// Arguments of one classifier call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClassifierCall {
    pub kind: &'static str,
    pub url: Url,
    pub ancestors: Vec<Url>,
    pub content_type: Option<ContentType>,
    pub site_key: Option<SiteKey>,
    pub headers: Option<ResponseHeaders>,
    pub collections: usize,
}

/// Answers every call with a fixed classification.
pub(crate) struct ScriptedClassifier {
    answer: Classification,
    panic: bool,
    calls: Mutex<Vec<ClassifierCall>>,
}

impl ScriptedClassifier {
    pub fn answering(answer: Classification) -> Arc<Self> {
        Arc::new(Self {
            answer,
            panic: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn blocking() -> Arc<Self> {
        Self::answering(Classification::Blocked {
            subscription: easylist(),
        })
    }

    pub fn allowing() -> Arc<Self> {
        Self::answering(Classification::Allowed {
            subscription: easylist(),
        })
    }

    pub fn ignoring() -> Arc<Self> {
        Self::answering(Classification::Ignored)
    }

    pub fn panicking() -> Arc<Self> {
        Arc::new(Self {
            answer: Classification::Ignored,
            panic: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<ClassifierCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: ClassifierCall) -> Classification {
        self.calls.lock().unwrap().push(call);
        if self.panic {
            panic!("classifier failure");
        }
        self.answer.clone()
    }
}

impl ResourceClassifier for ScriptedClassifier {
    fn classify_request(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        ancestors: &[Url],
        content_type: ContentType,
        site_key: &SiteKey,
    ) -> Classification {
        self.record(ClassifierCall {
            kind: "request",
            url: url.clone(),
            ancestors: ancestors.to_vec(),
            content_type: Some(content_type),
            site_key: Some(site_key.clone()),
            headers: None,
            collections: snapshot.len(),
        })
    }

    fn classify_response(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        ancestors: &[Url],
        content_type: ContentType,
        headers: &ResponseHeaders,
    ) -> Classification {
        self.record(ClassifierCall {
            kind: "response",
            url: url.clone(),
            ancestors: ancestors.to_vec(),
            content_type: Some(content_type),
            site_key: None,
            headers: Some(headers.clone()),
            collections: snapshot.len(),
        })
    }

    fn classify_popup(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        ancestors: &[Url],
        site_key: &SiteKey,
    ) -> Classification {
        self.record(ClassifierCall {
            kind: "popup",
            url: url.clone(),
            ancestors: ancestors.to_vec(),
            content_type: None,
            site_key: Some(site_key.clone()),
            headers: None,
            collections: snapshot.len(),
        })
    }
}

// =============================================================================
// Collections
// =============================================================================

/// Collection with fixed answers and per-query call counters.
#[derive(Default)]
pub(crate) struct CountingCollection {
    rewrite: Option<Url>,
    document: Option<Url>,
    rewrite_calls: AtomicUsize,
    special_calls: AtomicUsize,
}

impl CountingCollection {
    pub fn new(rewrite: Option<&str>, document: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            rewrite: rewrite.map(url),
            document: document.map(url),
            ..Self::default()
        })
    }

    pub fn rewrite_calls(&self) -> usize {
        self.rewrite_calls.load(Ordering::SeqCst)
    }

    pub fn special_calls(&self) -> usize {
        self.special_calls.load(Ordering::SeqCst)
    }
}

impl SubscriptionCollection for CountingCollection {
    fn rewrite_target(&self, _url: &Url, _ancestors: &[Url]) -> Option<Url> {
        self.rewrite_calls.fetch_add(1, Ordering::SeqCst);
        self.rewrite.clone()
    }

    fn find_by_special_filter(
        &self,
        kind: SpecialFilterKind,
        _url: &Url,
        _ancestors: &[Url],
        _site_key: &SiteKey,
    ) -> Option<Url> {
        self.special_calls.fetch_add(1, Ordering::SeqCst);
        match kind {
            SpecialFilterKind::Document => self.document.clone(),
            _ => None,
        }
    }
}

pub(crate) fn snapshot_of(collections: &[&Arc<CountingCollection>]) -> SubscriptionSnapshot {
    collections
        .iter()
        .map(|c| Arc::clone(*c) as Arc<dyn SubscriptionCollection>)
        .collect()
}

pub(crate) fn single_snapshot() -> SubscriptionSnapshot {
    snapshot_of(&[&CountingCollection::new(None, None)])
}

// =============================================================================
// Observer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    AdMatched {
        url: Url,
        result: FilterMatchResult,
        ancestors: Vec<Url>,
        content_type: ContentType,
        frame: FrameId,
        subscription: Url,
    },
    PageAllowed {
        url: Url,
        frame: FrameId,
        subscription: Url,
    },
    PopupMatched {
        url: Url,
        result: FilterMatchResult,
        opener: Option<Url>,
        frame: FrameId,
        subscription: Url,
    },
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }
}

impl ClassificationObserver for RecordingObserver {
    fn on_ad_matched(&self, event: &AdMatched<'_>) {
        self.events.lock().unwrap().push(Recorded::AdMatched {
            url: event.url.clone(),
            result: event.result,
            ancestors: event.ancestors.to_vec(),
            content_type: event.content_type,
            frame: event.frame.id,
            subscription: event.subscription.clone(),
        });
    }

    fn on_page_allowed(&self, event: &PageAllowed<'_>) {
        self.events.lock().unwrap().push(Recorded::PageAllowed {
            url: event.url.clone(),
            frame: event.frame.id,
            subscription: event.subscription.clone(),
        });
    }

    fn on_popup_matched(&self, event: &PopupMatched<'_>) {
        self.events.lock().unwrap().push(Recorded::PopupMatched {
            url: event.url.clone(),
            result: event.result,
            opener: event.opener.cloned(),
            frame: event.frame.id,
            subscription: event.subscription.clone(),
        });
    }
}

// =============================================================================
// Callbacks
// =============================================================================

/// Captures the value a one-shot callback was invoked with.
pub(crate) struct Probe<T> {
    slot: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Probe<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl FnOnce(T) + Send + 'static {
        let slot = Arc::clone(&self.slot);
        move |value| slot.lock().unwrap().push(value)
    }

    /// Every value received so far.
    pub fn values(&self) -> Vec<T> {
        self.slot.lock().unwrap().clone()
    }
}
