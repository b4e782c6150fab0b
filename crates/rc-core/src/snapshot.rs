//! Subscription collections and the per-request snapshot of them.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::types::{SiteKey, SpecialFilterKind};

/// One active filter configuration. Read-only; queried from background
/// workers, so it must be shareable across threads.
pub trait SubscriptionCollection: Send + Sync {
    /// Rewrite target for `url` loaded under `ancestors`, if any filter
    /// rewrites it.
    fn rewrite_target(&self, url: &Url, ancestors: &[Url]) -> Option<Url>;

    /// Subscription holding a special filter of `kind` that matches `url`.
    fn find_by_special_filter(
        &self,
        kind: SpecialFilterKind,
        url: &Url,
        ancestors: &[Url],
        site_key: &SiteKey,
    ) -> Option<Url>;
}

/// The collections active when a single request was received, in priority
/// order. Each request is handed its own snapshot and consumes it.
#[derive(Clone, Default)]
pub struct SubscriptionSnapshot {
    collections: Vec<Arc<dyn SubscriptionCollection>>,
}

impl SubscriptionSnapshot {
    pub fn new(collections: Vec<Arc<dyn SubscriptionCollection>>) -> Self {
        Self { collections }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn SubscriptionCollection> {
        self.collections.iter().map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// First rewrite target any collection produces. Later collections are
    /// not consulted once one answers.
    pub fn first_rewrite_target(&self, url: &Url, ancestors: &[Url]) -> Option<Url> {
        self.iter().find_map(|c| c.rewrite_target(url, ancestors))
    }

    /// Subscription allowlisting the document `url`, provided every
    /// collection allowlists it. Stops at the first collection without a
    /// match. On success the subscription reported is the one found in the
    /// last collection.
    pub fn document_allowlisted_by(&self, url: &Url) -> Option<Url> {
        let mut subscription = None;
        for collection in self.iter() {
            subscription = Some(collection.find_by_special_filter(
                SpecialFilterKind::Document,
                url,
                &[],
                &SiteKey::default(),
            )?);
        }
        subscription
    }
}

impl FromIterator<Arc<dyn SubscriptionCollection>> for SubscriptionSnapshot {
    fn from_iter<I: IntoIterator<Item = Arc<dyn SubscriptionCollection>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Debug for SubscriptionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSnapshot")
            .field("collections", &self.collections.len())
            .finish()
    }
}
