//! Capabilities the dispatcher consumes from its host.
//!
//! Frame lookup and site-key lookup are cheap, in-process and run on the
//! control sequence. Classification is CPU-bound and runs on background
//! workers, so classifiers must tolerate concurrent calls.

use url::Url;

use crate::headers::ResponseHeaders;
use crate::snapshot::SubscriptionSnapshot;
use crate::types::{Classification, ContentType, FrameId, LiveFrame, SiteKey};

/// Maps opaque frame handles to live frames.
pub trait FrameResolver: Send {
    /// The live frame for `id`, or `None` once the frame is gone.
    fn resolve(&self, id: FrameId) -> Option<LiveFrame>;

    /// Ancestor URLs of `frame`, nearest parent first. Empty for a top-level
    /// frame.
    fn ancestor_chain(&self, frame: &LiveFrame) -> Vec<Url>;
}

/// Looks up site keys registered for pages.
pub trait SiteKeyResolver: Send + Sync {
    /// The first URL in `urls` with a known key, together with that key.
    fn find_site_key(&self, urls: &[Url]) -> Option<(Url, SiteKey)>;
}

/// The filter engine.
pub trait ResourceClassifier: Send + Sync {
    fn classify_request(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        ancestors: &[Url],
        content_type: ContentType,
        site_key: &SiteKey,
    ) -> Classification;

    fn classify_response(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        ancestors: &[Url],
        content_type: ContentType,
        headers: &ResponseHeaders,
    ) -> Classification;

    fn classify_popup(
        &self,
        snapshot: SubscriptionSnapshot,
        url: &Url,
        ancestors: &[Url],
        site_key: &SiteKey,
    ) -> Classification;
}
