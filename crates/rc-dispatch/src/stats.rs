//! Per-subscription match counters fed by dispatcher notifications.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use rc_core::{FilterMatchResult, Url};

use crate::observer::{AdMatched, ClassificationObserver};

/// Counts allowing and blocking resource matches per subscription for the
/// current session. Nothing is counted until
/// [`SessionStats::start_collecting`]; popup and page-allowed events are not
/// counted.
#[derive(Debug, Default)]
pub struct SessionStats {
    collecting: AtomicBool,
    counts: Mutex<Counts>,
}

#[derive(Debug, Default)]
struct Counts {
    allowed: BTreeMap<Url, u64>,
    blocked: BTreeMap<Url, u64>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_collecting(&self) {
        if !self.collecting.swap(true, Ordering::SeqCst) {
            debug!("session stats collection started");
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    pub fn allowed_counts(&self) -> BTreeMap<Url, u64> {
        self.lock().allowed.clone()
    }

    pub fn blocked_counts(&self) -> BTreeMap<Url, u64> {
        self.lock().blocked.clone()
    }

    fn record(&self, result: FilterMatchResult, subscription: &Url) {
        if !self.is_collecting() {
            return;
        }
        let mut counts = self.lock();
        let map = match result {
            FilterMatchResult::AllowRule => &mut counts.allowed,
            FilterMatchResult::BlockRule => &mut counts.blocked,
            FilterMatchResult::NoRule => return,
        };
        *map.entry(subscription.clone()).or_insert(0) += 1;
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClassificationObserver for SessionStats {
    fn on_ad_matched(&self, event: &AdMatched<'_>) {
        self.record(event.result, event.subscription);
    }
}
