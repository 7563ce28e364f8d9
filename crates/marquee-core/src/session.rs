//! Run-scoped shared crawl state.
//!
//! Everything mutable that tasks share lives here: the identity dedup
//! ledger, the item quota, and the drop counters. All updates are atomic
//! check-and-update, so the session stays correct even if tasks ever run
//! concurrently. One session per crawl run; nothing is persisted.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters snapshot reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlStats {
    /// All records handed to the sink (parents and sub-resource items).
    pub records_emitted: u64,
    /// Detail-stage (parent) records only; this is what the quota counts.
    pub parents_emitted: u64,
    /// Detail tasks dropped because the identity was already claimed.
    pub duplicates_dropped: u64,
    /// Detail tasks dropped for lack of a resolvable identity.
    pub identity_missing: u64,
    /// Lookup targets whose search returned no candidates.
    pub lookup_unmatched: u64,
    /// Tasks abandoned after exhausting transient-failure retries.
    pub tasks_abandoned: u64,
    /// Listing/Detail tasks skipped after the quota was reached.
    pub quota_skipped: u64,
}

/// Shared per-run state: dedup ledger, quota gate, counters.
///
/// The ledger only grows — an identity claimed once stays claimed for the
/// life of the run. Identity counts per run are bounded (tens of thousands),
/// so there is no eviction.
#[derive(Debug)]
pub struct CrawlSession {
    seen: Mutex<HashSet<String>>,
    quota: Option<u64>,
    parents_emitted: AtomicU64,
    records_emitted: AtomicU64,
    duplicates_dropped: AtomicU64,
    identity_missing: AtomicU64,
    lookup_unmatched: AtomicU64,
    tasks_abandoned: AtomicU64,
    quota_skipped: AtomicU64,
}

impl CrawlSession {
    pub fn new(quota: Option<u64>) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            quota,
            parents_emitted: AtomicU64::new(0),
            records_emitted: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            identity_missing: AtomicU64::new(0),
            lookup_unmatched: AtomicU64::new(0),
            tasks_abandoned: AtomicU64::new(0),
            quota_skipped: AtomicU64::new(0),
        }
    }

    /// Acquires the ledger lock, recovering from poison if necessary.
    fn lock_seen(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned dedup ledger");
            poisoned.into_inner()
        })
    }

    /// Atomically claim an identity. Returns true exactly once per identity
    /// per run: the first discovery wins, later discoveries (same entity via
    /// a different link) are duplicates.
    pub fn claim(&self, id: &str) -> bool {
        self.lock_seen().insert(id.to_string())
    }

    /// Membership test without claiming.
    pub fn seen(&self, id: &str) -> bool {
        self.lock_seen().contains(id)
    }

    /// Count a parent record emission; returns the new total.
    pub fn record_parent_emitted(&self) -> u64 {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
        self.parents_emitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a sub-resource record emission.
    pub fn record_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the parent-record quota has been reached. `None` quota never
    /// trips.
    pub fn quota_reached(&self) -> bool {
        match self.quota {
            Some(q) => self.parents_emitted.load(Ordering::Relaxed) >= q,
            None => false,
        }
    }

    pub fn quota(&self) -> Option<u64> {
        self.quota
    }

    pub fn note_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_identity_missing(&self) {
        self.identity_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_lookup_unmatched(&self) {
        self.lookup_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_abandoned(&self) {
        self.tasks_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_quota_skipped(&self) {
        self.quota_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CrawlStats {
        CrawlStats {
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            parents_emitted: self.parents_emitted.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            identity_missing: self.identity_missing.load(Ordering::Relaxed),
            lookup_unmatched: self.lookup_unmatched.load(Ordering::Relaxed),
            tasks_abandoned: self.tasks_abandoned.load(Ordering::Relaxed),
            quota_skipped: self.quota_skipped.load(Ordering::Relaxed),
        }
    }
}
