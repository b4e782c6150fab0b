//! Observer interface and the registry the dispatcher notifies.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rc_core::{ContentType, FilterMatchResult, LiveFrame, Url};

/// A resource matched an allowing or blocking filter.
#[derive(Debug, Clone, Copy)]
pub struct AdMatched<'a> {
    pub url: &'a Url,
    pub result: FilterMatchResult,
    /// Ancestor chain the request was evaluated under, nearest parent first
    pub ancestors: &'a [Url],
    pub content_type: ContentType,
    pub frame: &'a LiveFrame,
    pub subscription: &'a Url,
}

/// Every active configuration allowlists the document.
#[derive(Debug, Clone, Copy)]
pub struct PageAllowed<'a> {
    pub url: &'a Url,
    pub frame: &'a LiveFrame,
    pub subscription: &'a Url,
}

/// A popup matched an allowing or blocking filter.
#[derive(Debug, Clone, Copy)]
pub struct PopupMatched<'a> {
    pub url: &'a Url,
    pub result: FilterMatchResult,
    /// URL of the frame opening the popup, `None` when it has no ancestors
    pub opener: Option<&'a Url>,
    pub frame: &'a LiveFrame,
    pub subscription: &'a Url,
}

/// Listener for classification outcomes. Invoked on the control sequence
/// only; all methods default to doing nothing.
pub trait ClassificationObserver: Send + Sync {
    fn on_ad_matched(&self, _event: &AdMatched<'_>) {}

    fn on_page_allowed(&self, _event: &PageAllowed<'_>) {}

    fn on_popup_matched(&self, _event: &PopupMatched<'_>) {}
}

/// Identity-keyed set of observers.
///
/// The set does not own its observers: it holds weak references, and an
/// observer whose last `Arc` is dropped stops being notified and is pruned
/// on the next pass. Notification iterates over a copy of the registrations
/// and re-checks membership before each call, so an observer removed
/// mid-pass is not invoked afterwards.
#[derive(Clone, Default)]
pub(crate) struct ObserverList {
    entries: Arc<Mutex<Vec<Weak<dyn ClassificationObserver>>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`. Returns false if it was already registered.
    pub fn add(&self, observer: &Arc<dyn ClassificationObserver>) -> bool {
        let mut entries = self.lock();
        if entries.iter().any(|e| same_observer(e, observer)) {
            return false;
        }
        entries.push(Arc::downgrade(observer));
        true
    }

    /// Unregister `observer`. Returns false if it was not registered.
    pub fn remove<O>(&self, observer: &Arc<O>) -> bool
    where
        O: ClassificationObserver + ?Sized,
    {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !same_observer(e, observer));
        entries.len() != before
    }

    fn contains(&self, observer: &Arc<dyn ClassificationObserver>) -> bool {
        self.lock().iter().any(|e| same_observer(e, observer))
    }

    /// Registered observers that are still alive.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().iter().filter(|e| e.strong_count() > 0).count()
    }

    /// Invoke `notify` for every registered observer that is still alive.
    /// Registrations whose observer is gone are dropped.
    pub fn notify(&self, mut notify: impl FnMut(&dyn ClassificationObserver)) {
        let live: Vec<Arc<dyn ClassificationObserver>> = {
            let mut entries = self.lock();
            entries.retain(|e| e.strong_count() > 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in &live {
            if !self.contains(observer) {
                continue;
            }
            notify(observer.as_ref());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<dyn ClassificationObserver>>> {
        // A panicking observer leaves the list itself intact.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn registrations(&self) -> usize {
        self.lock().len()
    }
}

fn same_observer<O>(entry: &Weak<dyn ClassificationObserver>, observer: &Arc<O>) -> bool
where
    O: ?Sized,
{
    entry.as_ptr().cast::<()>() == Arc::as_ptr(observer).cast::<()>()
}
