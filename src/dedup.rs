// src/dedup.rs
// Process-lifetime set of item ids that have already been forwarded for
// insight generation. Unbounded by design for a single run; when the soft
// cap is crossed we keep recording and log one warning so long-lived
// deployments notice.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use metrics::gauge;

const DEFAULT_SOFT_CAP: usize = 500_000;

#[derive(Debug)]
pub struct Deduplicator {
    inner: Mutex<HashSet<String>>,
    soft_cap: usize,
    cap_warned: AtomicBool,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::with_soft_cap(DEFAULT_SOFT_CAP)
    }
}

impl Deduplicator {
    pub fn with_soft_cap(soft_cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
            soft_cap,
            cap_warned: AtomicBool::new(false),
        }
    }

    pub fn seen(&self, id: &str) -> bool {
        let set = self.inner.lock().expect("dedup mutex poisoned");
        set.contains(id)
    }

    pub fn record(&self, id: &str) {
        let mut set = self.inner.lock().expect("dedup mutex poisoned");
        set.insert(id.to_string());
        self.after_insert(set.len());
    }

    /// Atomic check-and-record: returns true iff `id` was unseen and is now
    /// recorded. Under racing callers with the same id, at most one gets true.
    pub fn check_and_record(&self, id: &str) -> bool {
        let mut set = self.inner.lock().expect("dedup mutex poisoned");
        let fresh = set.insert(id.to_string());
        if fresh {
            self.after_insert(set.len());
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn after_insert(&self, len: usize) {
        gauge!("dedup_set_size").set(len as f64);
        if len > self.soft_cap && !self.cap_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                target: "dedup",
                size = len,
                soft_cap = self.soft_cap,
                "dedup set crossed its soft cap; consider restarting the poller"
            );
        }
    }
}
