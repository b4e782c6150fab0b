//! Classification Dispatcher
//!
//! Bridges host events to the filter engine. Every entry point runs on the
//! control sequence: the frame, its ancestor chain and its site key are
//! resolved inline, the engine call is posted to the background queue, and
//! the outcome is delivered back on the control sequence when the owner
//! drains completions ([`ClassificationDispatcher::process_next`],
//! [`ClassificationDispatcher::process_ready`],
//! [`ClassificationDispatcher::run_until_idle`]).
//!
//! The load callback always fires, even when the frame died while the
//! engine was running; observers are only told about outcomes for frames
//! that are still alive. A frame that cannot be resolved at dispatch time
//! yields `NoRule` straight away, which is indistinguishable at the callback
//! from the engine ignoring the resource.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use tokio::runtime::Handle;

use rc_core::{
    Classification, ContentType, FilterMatchResult, FrameId, FrameResolver, LiveFrame,
    ResourceClassifier, ResponseHeaders, SiteKey, SiteKeyResolver, SubscriptionSnapshot, Url,
};

use crate::config::DispatcherConfig;
use crate::error::JobError;
use crate::observer::{AdMatched, ClassificationObserver, ObserverList, PageAllowed, PopupMatched};
use crate::queue::{Finished, JobId, WorkQueue};

/// Receives the load decision for a request or response.
pub type FilterMatchCallback = Box<dyn FnOnce(FilterMatchResult) + Send>;

/// Receives the rewrite target for a request, if any.
pub type RewriteCallback = Box<dyn FnOnce(Option<Url>) + Send>;

// =============================================================================
// In-flight bookkeeping
// =============================================================================

/// What a background job hands back.
#[derive(Debug)]
pub(crate) enum JobOutput {
    Classified(Classification),
    Allowlisted(Option<Url>),
    Rewritten(Option<Url>),
}

/// Control-sequence state kept for a job until it finishes. Callbacks never
/// leave the control sequence.
enum Pending {
    Resource {
        url: Url,
        ancestors: Vec<Url>,
        content_type: ContentType,
        frame: FrameId,
        callback: FilterMatchCallback,
    },
    DocumentAllowlist {
        url: Url,
        frame: FrameId,
    },
    Rewrite {
        url: Url,
        callback: RewriteCallback,
    },
}

impl Pending {
    fn url(&self) -> &Url {
        match self {
            Self::Resource { url, .. }
            | Self::DocumentAllowlist { url, .. }
            | Self::Rewrite { url, .. } => url,
        }
    }

    /// Report "could not determine" for a job without a usable output.
    fn abandon(self) {
        match self {
            Self::Resource { callback, .. } => callback(FilterMatchResult::NoRule),
            Self::DocumentAllowlist { .. } => {}
            Self::Rewrite { callback, .. } => callback(None),
        }
    }
}

/// Frame context a request is evaluated under.
struct FrameContext {
    frame: LiveFrame,
    ancestors: Vec<Url>,
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct ClassificationDispatcher {
    classifier: Arc<dyn ResourceClassifier>,
    frames: Box<dyn FrameResolver>,
    site_keys: Arc<dyn SiteKeyResolver>,
    observers: ObserverList,
    queue: WorkQueue<JobOutput>,
    pending: HashMap<JobId, Pending>,
}

impl ClassificationDispatcher {
    /// Create a dispatcher posting background work to the current tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(
        classifier: Arc<dyn ResourceClassifier>,
        frames: Box<dyn FrameResolver>,
        site_keys: Arc<dyn SiteKeyResolver>,
        config: &DispatcherConfig,
    ) -> Self {
        Self::with_runtime(classifier, frames, site_keys, config, Handle::current())
    }

    pub fn with_runtime(
        classifier: Arc<dyn ResourceClassifier>,
        frames: Box<dyn FrameResolver>,
        site_keys: Arc<dyn SiteKeyResolver>,
        config: &DispatcherConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            classifier,
            frames,
            site_keys,
            observers: ObserverList::new(),
            queue: WorkQueue::new(runtime, config.max_concurrent_evaluations),
            pending: HashMap::new(),
        }
    }

    /// Register `observer`. Only a weak reference is kept: the caller owns
    /// the observer, and once it is dropped it is no longer notified.
    pub fn add_observer(&self, observer: Arc<dyn ClassificationObserver>) {
        if !self.observers.add(&observer) {
            debug!("observer already registered");
        }
    }

    /// Unregister `observer`. Removing an observer that is not registered
    /// does nothing.
    pub fn remove_observer<O>(&self, observer: &Arc<O>)
    where
        O: ClassificationObserver + ?Sized,
    {
        self.observers.remove(observer);
    }

    /// Background evaluations that have not been completed yet.
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Classify a popup synchronously. The engine runs on the calling
    /// sequence and may block it for a while.
    pub fn evaluate_popup(
        &self,
        snapshot: SubscriptionSnapshot,
        popup_url: &Url,
        frame: FrameId,
    ) -> FilterMatchResult {
        let Some(context) = self.frame_context(frame) else {
            debug!("frame {} gone, not classifying popup {}", frame, popup_url);
            return FilterMatchResult::NoRule;
        };
        let site_key = self.site_key_for(&context.ancestors);

        let classification = self
            .classifier
            .classify_popup(snapshot, popup_url, &context.ancestors, &site_key);
        let result = classification.match_result();
        let Some(subscription) = classification.decisive_subscription() else {
            return result;
        };

        if result == FilterMatchResult::BlockRule {
            debug!("prevented loading of popup {}", popup_url);
        } else {
            debug!("popup allowed {}", popup_url);
        }

        let event = PopupMatched {
            url: popup_url,
            result,
            opener: context.ancestors.first(),
            frame: &context.frame,
            subscription,
        };
        self.observers.notify(|o| o.on_popup_matched(&event));
        result
    }

    /// Classify a network request. `callback` receives the decision on the
    /// control sequence; WebSocket upgrades go through
    /// [`Self::evaluate_request_for_socket_upgrade`].
    pub fn evaluate_request<F>(
        &mut self,
        snapshot: SubscriptionSnapshot,
        request_url: Url,
        content_type: ContentType,
        frame: FrameId,
        callback: F,
    ) where
        F: FnOnce(FilterMatchResult) + Send + 'static,
    {
        debug_assert!(
            content_type != ContentType::Websocket,
            "use evaluate_request_for_socket_upgrade"
        );
        debug_assert!(
            !is_websocket_url(&request_url),
            "use evaluate_request_for_socket_upgrade"
        );
        self.evaluate_request_impl(snapshot, request_url, content_type, frame, Box::new(callback));
    }

    /// Classify a WebSocket upgrade request (`ws://` or `wss://`).
    pub fn evaluate_request_for_socket_upgrade<F>(
        &mut self,
        snapshot: SubscriptionSnapshot,
        request_url: Url,
        frame: FrameId,
        callback: F,
    ) where
        F: FnOnce(FilterMatchResult) + Send + 'static,
    {
        debug_assert!(is_websocket_url(&request_url), "socket upgrade to {}", request_url);
        self.evaluate_request_impl(
            snapshot,
            request_url,
            ContentType::Websocket,
            frame,
            Box::new(callback),
        );
    }

    /// Classify a response once its headers are known.
    pub fn evaluate_response<F>(
        &mut self,
        snapshot: SubscriptionSnapshot,
        response_url: Url,
        content_type: ContentType,
        frame: FrameId,
        headers: ResponseHeaders,
        callback: F,
    ) where
        F: FnOnce(FilterMatchResult) + Send + 'static,
    {
        let Some(context) = self.frame_context(frame) else {
            debug!("frame {} gone, allowing response {}", frame, response_url);
            callback(FilterMatchResult::NoRule);
            return;
        };

        let classifier = Arc::clone(&self.classifier);
        let job_url = response_url.clone();
        let job_ancestors = context.ancestors.clone();
        let id = self.queue.post(move || {
            JobOutput::Classified(classifier.classify_response(
                snapshot,
                &job_url,
                &job_ancestors,
                content_type,
                &headers,
            ))
        });
        trace!("posted response job {} for {}", id, response_url);

        self.pending.insert(
            id,
            Pending::Resource {
                url: response_url,
                ancestors: context.ancestors,
                content_type,
                frame: context.frame.id,
                callback: Box::new(callback),
            },
        );
    }

    /// Look for a document allowlisting of a main-frame navigation. The
    /// navigation itself always proceeds; observers hear about the page only
    /// when every collection in `snapshot` allowlists it. The subscription
    /// reported is the one found in the last collection.
    pub fn check_main_document_allowed(
        &mut self,
        snapshot: SubscriptionSnapshot,
        request_url: Url,
        frame: FrameId,
    ) {
        debug!("main document, passing it through: {}", request_url);
        let job_url = request_url.clone();
        let id = self
            .queue
            .post(move || JobOutput::Allowlisted(snapshot.document_allowlisted_by(&job_url)));
        trace!("posted allowlist job {} for {}", id, request_url);

        self.pending.insert(id, Pending::DocumentAllowlist { url: request_url, frame });
    }

    /// Find a rewrite target for a request. The first collection with an
    /// answer wins. Observers are not notified.
    pub fn evaluate_rewrite<F>(
        &mut self,
        snapshot: SubscriptionSnapshot,
        request_url: Url,
        frame: FrameId,
        callback: F,
    ) where
        F: FnOnce(Option<Url>) + Send + 'static,
    {
        let Some(context) = self.frame_context(frame) else {
            debug!("frame {} gone, no rewrite for {}", frame, request_url);
            callback(None);
            return;
        };

        let job_url = request_url.clone();
        let ancestors = context.ancestors;
        let id = self.queue.post(move || {
            JobOutput::Rewritten(snapshot.first_rewrite_target(&job_url, &ancestors))
        });
        trace!("posted rewrite job {} for {}", id, request_url);

        self.pending.insert(
            id,
            Pending::Rewrite {
                url: request_url,
                callback: Box::new(callback),
            },
        );
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Wait for the next background job and deliver its outcome. Returns
    /// false when nothing is in flight.
    pub async fn process_next(&mut self) -> bool {
        match self.next_finished().await {
            Some(finished) => {
                self.complete(finished);
                true
            }
            None => false,
        }
    }

    /// Deliver every outcome that is already available without waiting.
    pub fn process_ready(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(finished) = self.queue.try_next() {
            self.complete(finished);
            delivered += 1;
        }
        delivered
    }

    /// Deliver outcomes until nothing is in flight.
    pub async fn run_until_idle(&mut self) {
        while self.process_next().await {}
    }

    pub(crate) async fn next_finished(&mut self) -> Option<Finished<JobOutput>> {
        self.queue.next().await
    }

    pub(crate) fn complete(&mut self, finished: Finished<JobOutput>) {
        let Finished { id, output } = finished;
        let Some(pending) = self.pending.remove(&id) else {
            warn!("finished job {} has no pending entry", id);
            return;
        };

        match (pending, output) {
            (
                Pending::Resource {
                    url,
                    ancestors,
                    content_type,
                    frame,
                    callback,
                },
                Ok(JobOutput::Classified(classification)),
            ) => self.on_resource_classified(
                url,
                ancestors,
                content_type,
                frame,
                callback,
                classification,
            ),
            (
                Pending::DocumentAllowlist { url, frame },
                Ok(JobOutput::Allowlisted(subscription)),
            ) => self.on_document_allowlist_checked(url, frame, subscription),
            (Pending::Rewrite { url, callback }, Ok(JobOutput::Rewritten(target))) => {
                if let Some(target) = &target {
                    debug!("rewriting {} to {}", url, target);
                }
                callback(target)
            }
            (pending, Ok(output)) => {
                error!("job {} for {} returned unexpected {:?}", id, pending.url(), output);
                pending.abandon();
            }
            (pending, Err(err)) => {
                report_job_error(id, pending.url(), &err);
                pending.abandon();
            }
        }
    }

    fn on_resource_classified(
        &self,
        url: Url,
        ancestors: Vec<Url>,
        content_type: ContentType,
        frame: FrameId,
        callback: FilterMatchCallback,
        classification: Classification,
    ) {
        let result = classification.match_result();
        match result {
            FilterMatchResult::AllowRule => debug!("{} allowed due to allowing filter", url),
            FilterMatchResult::BlockRule => debug!("{} blocked", url),
            FilterMatchResult::NoRule => trace!("no rule for {}", url),
        }

        // The network layer is waiting on this regardless of the frame.
        callback(result);

        let Some(subscription) = classification.decisive_subscription() else {
            return;
        };
        let Some(live) = self.frames.resolve(frame) else {
            debug!("frame {} gone before {} completed, not notifying", frame, url);
            return;
        };

        let event = AdMatched {
            url: &url,
            result,
            ancestors: &ancestors,
            content_type,
            frame: &live,
            subscription,
        };
        self.observers.notify(|o| o.on_ad_matched(&event));
    }

    fn on_document_allowlist_checked(&self, url: Url, frame: FrameId, subscription: Option<Url>) {
        let Some(subscription) = subscription else {
            return;
        };
        let Some(live) = self.frames.resolve(frame) else {
            debug!("frame {} gone before allowlisting of {} was confirmed", frame, url);
            return;
        };

        debug!("page allowed: {}", url);
        let event = PageAllowed {
            url: &url,
            frame: &live,
            subscription: &subscription,
        };
        self.observers.notify(|o| o.on_page_allowed(&event));
    }

    // -------------------------------------------------------------------------
    // Context resolution
    // -------------------------------------------------------------------------

    fn evaluate_request_impl(
        &mut self,
        snapshot: SubscriptionSnapshot,
        request_url: Url,
        content_type: ContentType,
        frame: FrameId,
        callback: FilterMatchCallback,
    ) {
        let Some(context) = self.frame_context(frame) else {
            // Without a frame hierarchy allowlisting cannot be established,
            // so the load is allowed.
            debug!(
                "unable to build frame hierarchy for {} (frame {}, {}): allowing load",
                request_url, frame, content_type
            );
            callback(FilterMatchResult::NoRule);
            return;
        };
        let site_key = self.site_key_for(&context.ancestors);

        let classifier = Arc::clone(&self.classifier);
        let job_url = request_url.clone();
        let job_ancestors = context.ancestors.clone();
        let id = self.queue.post(move || {
            JobOutput::Classified(classifier.classify_request(
                snapshot,
                &job_url,
                &job_ancestors,
                content_type,
                &site_key,
            ))
        });
        trace!("posted request job {} for {}", id, request_url);

        self.pending.insert(
            id,
            Pending::Resource {
                url: request_url,
                ancestors: context.ancestors,
                content_type,
                frame: context.frame.id,
                callback,
            },
        );
    }

    fn frame_context(&self, frame: FrameId) -> Option<FrameContext> {
        let frame = self.frames.resolve(frame)?;
        let ancestors = self.frames.ancestor_chain(&frame);
        trace!("got {} ancestors for frame {}", ancestors.len(), frame.id);
        Some(FrameContext { frame, ancestors })
    }

    fn site_key_for(&self, ancestors: &[Url]) -> SiteKey {
        match self.site_keys.find_site_key(ancestors) {
            Some((url, key)) => {
                debug!("found site key {} for {}", key, url);
                key
            }
            None => SiteKey::default(),
        }
    }
}

fn is_websocket_url(url: &Url) -> bool {
    matches!(url.scheme(), "ws" | "wss")
}

fn report_job_error(id: JobId, url: &Url, err: &JobError) {
    match err {
        JobError::Panicked(_) => error!("job {} for {} failed: {}", id, url, err),
        JobError::Cancelled => warn!("job {} for {} failed: {}", id, url, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::testing::{
        easylist, init_logging, single_snapshot, snapshot_of, url, CountingCollection, FakeFrames,
        FakeSiteKeys, Probe, Recorded, RecordingObserver, ScriptedClassifier,
    };

    const FRAME: FrameId = FrameId::new(7, 1);
    const PARENT: &str = "https://test.com/";

    struct Harness {
        dispatcher: ClassificationDispatcher,
        frames: FakeFrames,
        site_keys: Arc<FakeSiteKeys>,
        classifier: Arc<ScriptedClassifier>,
        observer: Arc<RecordingObserver>,
    }

    fn harness(classifier: Arc<ScriptedClassifier>) -> Harness {
        init_logging();
        let frames = FakeFrames::with_frame(FRAME, "https://test.com/frame.html", &[PARENT]);
        let site_keys = FakeSiteKeys::with_key(PARENT, "key");
        let dispatcher = ClassificationDispatcher::new(
            classifier.clone(),
            Box::new(frames.clone()),
            site_keys.clone(),
            &DispatcherConfig::default(),
        );
        let observer = RecordingObserver::new();
        dispatcher.add_observer(observer.clone());
        Harness {
            dispatcher,
            frames,
            site_keys,
            classifier,
            observer,
        }
    }

    fn ad_matched(target: &str, result: FilterMatchResult, content_type: ContentType) -> Recorded {
        Recorded::AdMatched {
            url: url(target),
            result,
            ancestors: vec![url(PARENT)],
            content_type,
            frame: FRAME,
            subscription: easylist(),
        }
    }

    #[tokio::test]
    async fn test_blocked_request_notifies_observer() {
        let mut h = harness(ScriptedClassifier::blocking());
        let probe = Probe::new();

        h.dispatcher.evaluate_request(
            single_snapshot(),
            url("https://ads.example/banner.png"),
            ContentType::Image,
            FRAME,
            probe.callback(),
        );
        assert!(probe.values().is_empty());
        assert_eq!(h.dispatcher.in_flight(), 1);

        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::BlockRule]);
        assert_eq!(
            h.observer.events(),
            vec![ad_matched(
                "https://ads.example/banner.png",
                FilterMatchResult::BlockRule,
                ContentType::Image
            )]
        );

        let calls = h.classifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, "request");
        assert_eq!(calls[0].ancestors, vec![url(PARENT)]);
        assert_eq!(calls[0].content_type, Some(ContentType::Image));
        assert_eq!(calls[0].site_key, Some(SiteKey::new("key")));
        assert_eq!(calls[0].collections, 1);
        assert_eq!(h.site_keys.queries(), vec![vec![url(PARENT)]]);
    }

    #[tokio::test]
    async fn test_missing_frame_allows_without_engine() {
        let mut h = harness(ScriptedClassifier::blocking());
        let probe = Probe::new();

        h.dispatcher.evaluate_request(
            single_snapshot(),
            url("https://ads.example/banner.png"),
            ContentType::Ping,
            FrameId::new(99, 99),
            probe.callback(),
        );

        // Delivered before any draining.
        assert_eq!(probe.values(), vec![FilterMatchResult::NoRule]);
        assert_eq!(h.dispatcher.in_flight(), 0);
        h.dispatcher.run_until_idle().await;

        assert_eq!(h.classifier.call_count(), 0);
        assert!(h.site_keys.queries().is_empty());
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_frame_destroyed_during_evaluation() {
        let mut h = harness(ScriptedClassifier::blocking());
        let probe = Probe::new();

        h.dispatcher.evaluate_request(
            single_snapshot(),
            url("https://ads.example/banner.png"),
            ContentType::Image,
            FRAME,
            probe.callback(),
        );
        h.frames.destroy(FRAME);
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::BlockRule]);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_ignored_request_is_not_reported() {
        let mut h = harness(ScriptedClassifier::ignoring());
        let probe = Probe::new();

        h.dispatcher.evaluate_request(
            single_snapshot(),
            url("https://test.com/app.js"),
            ContentType::Script,
            FRAME,
            probe.callback(),
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::NoRule]);
        assert!(h.observer.events().is_empty());
        // Liveness is only checked again for results worth reporting.
        assert_eq!(h.frames.resolve_count(), 1);
    }

    #[tokio::test]
    async fn test_allowed_socket_upgrade() {
        let mut h = harness(ScriptedClassifier::allowing());
        let probe = Probe::new();

        h.dispatcher.evaluate_request_for_socket_upgrade(
            single_snapshot(),
            url("wss://test.com/url.x"),
            FRAME,
            probe.callback(),
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::AllowRule]);
        assert_eq!(
            h.observer.events(),
            vec![ad_matched(
                "wss://test.com/url.x",
                FilterMatchResult::AllowRule,
                ContentType::Websocket
            )]
        );
        assert_eq!(h.classifier.calls()[0].content_type, Some(ContentType::Websocket));
    }

    #[tokio::test]
    async fn test_response_passes_headers() {
        let mut h = harness(ScriptedClassifier::blocking());
        let probe = Probe::new();
        let headers: ResponseHeaders = [("Content-Type", "text/javascript")].into_iter().collect();

        h.dispatcher.evaluate_response(
            single_snapshot(),
            url("https://test.com/url.x"),
            ContentType::Script,
            FRAME,
            headers.clone(),
            probe.callback(),
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::BlockRule]);
        let calls = h.classifier.calls();
        assert_eq!(calls[0].kind, "response");
        assert_eq!(calls[0].headers, Some(headers));
        assert_eq!(calls[0].site_key, None);
        assert_eq!(
            h.observer.events(),
            vec![ad_matched(
                "https://test.com/url.x",
                FilterMatchResult::BlockRule,
                ContentType::Script
            )]
        );
    }

    #[tokio::test]
    async fn test_response_frame_destroyed_during_evaluation() {
        let mut h = harness(ScriptedClassifier::blocking());
        let probe = Probe::new();

        h.dispatcher.evaluate_response(
            single_snapshot(),
            url("https://test.com/url.x"),
            ContentType::Script,
            FRAME,
            ResponseHeaders::new(),
            probe.callback(),
        );
        h.frames.destroy(FRAME);
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::BlockRule]);
        assert_eq!(h.classifier.call_count(), 1);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_response_without_frame() {
        let mut h = harness(ScriptedClassifier::blocking());
        let probe = Probe::new();

        h.dispatcher.evaluate_response(
            single_snapshot(),
            url("https://test.com/url.x"),
            ContentType::Image,
            FrameId::new(1, 2),
            ResponseHeaders::new(),
            probe.callback(),
        );

        assert_eq!(probe.values(), vec![FilterMatchResult::NoRule]);
        assert_eq!(h.dispatcher.in_flight(), 0);
        assert_eq!(h.classifier.call_count(), 0);
    }

    #[tokio::test]
    async fn test_popup_blocked_notifies_with_opener() {
        let h = harness(ScriptedClassifier::blocking());

        let result = h
            .dispatcher
            .evaluate_popup(single_snapshot(), &url("https://popup.example/"), FRAME);

        assert_eq!(result, FilterMatchResult::BlockRule);
        assert_eq!(
            h.observer.events(),
            vec![Recorded::PopupMatched {
                url: url("https://popup.example/"),
                result: FilterMatchResult::BlockRule,
                opener: Some(url(PARENT)),
                frame: FRAME,
                subscription: easylist(),
            }]
        );
        assert_eq!(h.classifier.calls()[0].site_key, Some(SiteKey::new("key")));
    }

    #[tokio::test]
    async fn test_popup_from_top_frame_has_no_opener() {
        let h = harness(ScriptedClassifier::allowing());
        let top = FrameId::new(7, 2);
        h.frames.insert(top, "https://top.example/", &[]);

        let result = h
            .dispatcher
            .evaluate_popup(single_snapshot(), &url("https://popup.example/"), top);

        assert_eq!(result, FilterMatchResult::AllowRule);
        match &h.observer.events()[..] {
            [Recorded::PopupMatched { opener, frame, .. }] => {
                assert_eq!(*opener, None);
                assert_eq!(*frame, top);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_popup_ignored_or_frameless() {
        let h = harness(ScriptedClassifier::ignoring());
        let popup = url("https://popup.example/");

        assert_eq!(
            h.dispatcher.evaluate_popup(single_snapshot(), &popup, FRAME),
            FilterMatchResult::NoRule
        );
        assert_eq!(
            h.dispatcher.evaluate_popup(single_snapshot(), &popup, FrameId::new(5, 5)),
            FilterMatchResult::NoRule
        );
        assert_eq!(h.classifier.call_count(), 1);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_document_allowlist_stops_at_first_miss() {
        let mut h = harness(ScriptedClassifier::ignoring());
        let first = CountingCollection::new(None, None);
        let second = CountingCollection::new(None, Some("https://easylist.com/list.txt"));

        h.dispatcher.check_main_document_allowed(
            snapshot_of(&[&first, &second]),
            url("https://test.com/url.x"),
            FRAME,
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(first.special_calls(), 1);
        assert_eq!(second.special_calls(), 0);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_document_allowlisted_everywhere() {
        let mut h = harness(ScriptedClassifier::ignoring());
        let first = CountingCollection::new(None, Some("https://first.example/list.txt"));
        let second = CountingCollection::new(None, Some("https://easylist.com/list.txt"));

        h.dispatcher.check_main_document_allowed(
            snapshot_of(&[&first, &second]),
            url("https://test.com/url.x"),
            FRAME,
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(first.special_calls(), 1);
        assert_eq!(second.special_calls(), 1);
        assert_eq!(
            h.observer.events(),
            vec![Recorded::PageAllowed {
                url: url("https://test.com/url.x"),
                frame: FRAME,
                subscription: easylist(),
            }]
        );
    }

    #[tokio::test]
    async fn test_document_allowlist_needs_live_frame() {
        let mut h = harness(ScriptedClassifier::ignoring());
        let only = CountingCollection::new(None, Some("https://easylist.com/list.txt"));

        h.dispatcher.check_main_document_allowed(
            snapshot_of(&[&only]),
            url("https://test.com/url.x"),
            FRAME,
        );
        h.frames.destroy(FRAME);
        h.dispatcher.run_until_idle().await;

        assert_eq!(only.special_calls(), 1);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_first_answer_wins() {
        let mut h = harness(ScriptedClassifier::ignoring());
        let first = CountingCollection::new(None, None);
        let second = CountingCollection::new(Some("https://cdn.example/clean.js"), None);
        let third = CountingCollection::new(Some("https://other.example/x.js"), None);
        let probe = Probe::new();

        h.dispatcher.evaluate_rewrite(
            snapshot_of(&[&first, &second, &third]),
            url("https://ads.example/tracker.js"),
            FRAME,
            probe.callback(),
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![Some(url("https://cdn.example/clean.js"))]);
        assert_eq!(first.rewrite_calls(), 1);
        assert_eq!(second.rewrite_calls(), 1);
        assert_eq!(third.rewrite_calls(), 0);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_frame_destroyed_during_evaluation() {
        let mut h = harness(ScriptedClassifier::ignoring());
        let only = CountingCollection::new(Some("https://cdn.example/clean.js"), None);
        let probe = Probe::new();

        h.dispatcher.evaluate_rewrite(
            snapshot_of(&[&only]),
            url("https://ads.example/tracker.js"),
            FRAME,
            probe.callback(),
        );
        h.frames.destroy(FRAME);
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![Some(url("https://cdn.example/clean.js"))]);
        assert_eq!(only.rewrite_calls(), 1);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_without_frame() {
        let mut h = harness(ScriptedClassifier::ignoring());
        let only = CountingCollection::new(Some("https://cdn.example/clean.js"), None);
        let probe = Probe::new();

        h.dispatcher.evaluate_rewrite(
            snapshot_of(&[&only]),
            url("https://ads.example/tracker.js"),
            FrameId::new(3, 3),
            probe.callback(),
        );

        assert_eq!(probe.values(), vec![None]);
        assert_eq!(only.rewrite_calls(), 0);
        assert_eq!(h.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_engine_panic_reports_no_rule() {
        let mut h = harness(ScriptedClassifier::panicking());
        let probe = Probe::new();

        h.dispatcher.evaluate_request(
            single_snapshot(),
            url("https://ads.example/banner.png"),
            ContentType::Image,
            FRAME,
            probe.callback(),
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::NoRule]);
        assert!(h.observer.events().is_empty());
        assert_eq!(h.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_all_complete() {
        let mut h = harness(ScriptedClassifier::blocking());
        let done = Arc::new(Mutex::new(BTreeSet::new()));

        for n in 0..16 {
            let done = Arc::clone(&done);
            h.dispatcher.evaluate_request(
                single_snapshot(),
                url(&format!("https://ads.example/{}.png", n)),
                ContentType::Image,
                FRAME,
                move |result| {
                    assert_eq!(result, FilterMatchResult::BlockRule);
                    done.lock().unwrap().insert(n);
                },
            );
        }
        h.dispatcher.run_until_idle().await;

        assert_eq!(done.lock().unwrap().len(), 16);
        assert_eq!(h.observer.events().len(), 16);
    }

    #[tokio::test]
    async fn test_removed_observer_not_notified() {
        let mut h = harness(ScriptedClassifier::blocking());
        let probe = Probe::new();

        h.dispatcher.evaluate_request(
            single_snapshot(),
            url("https://ads.example/banner.png"),
            ContentType::Image,
            FRAME,
            probe.callback(),
        );
        h.dispatcher.remove_observer(&h.observer);
        h.dispatcher.remove_observer(&h.observer);
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::BlockRule]);
        assert!(h.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_observer_is_not_kept_alive() {
        let mut h = harness(ScriptedClassifier::blocking());
        let dropped = RecordingObserver::new();
        let watch = Arc::downgrade(&dropped);
        h.dispatcher.add_observer(dropped);
        let probe = Probe::new();

        // The dispatcher does not own its observers.
        assert_eq!(watch.strong_count(), 0);

        h.dispatcher.evaluate_request(
            single_snapshot(),
            url("https://ads.example/banner.png"),
            ContentType::Image,
            FRAME,
            probe.callback(),
        );
        h.dispatcher.run_until_idle().await;

        assert_eq!(probe.values(), vec![FilterMatchResult::BlockRule]);
        assert_eq!(h.observer.events().len(), 1);
        assert!(watch.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_process_ready_does_not_wait() {
        let mut h = harness(ScriptedClassifier::blocking());
        let delivered = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let delivered = Arc::clone(&delivered);
            h.dispatcher.evaluate_request(
                single_snapshot(),
                url("https://ads.example/banner.png"),
                ContentType::Image,
                FRAME,
                move |_| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        let mut total = 0;
        while h.dispatcher.in_flight() > 0 {
            total += h.dispatcher.process_ready();
            tokio::task::yield_now().await;
        }

        assert_eq!(total, 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 3);
    }
}
