use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::engine::{MatchResult, MatchStatus};

pub(crate) const LATENCY_BUCKET_BOUNDS_MS: [u64; 12] =
    [0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000];

fn hist_bucket_idx(v: u64, bounds: &[u64]) -> usize {
    for (i, b) in bounds.iter().enumerate() {
        if v <= *b {
            return i;
        }
    }
    bounds.len()
}

fn hist_to_json(hist: &[AtomicU64]) -> Vec<u64> {
    hist.iter().map(|c| c.load(Ordering::Relaxed)).collect()
}

/// Cross-worker counters. The only shared mutable state between group
/// workers; every update is a relaxed atomic.
pub struct PerfCounters {
    pub batches_started: AtomicU64,
    pub batches_completed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub batches_cancelled: AtomicU64,

    pub groups_committed: AtomicU64,
    pub groups_failed: AtomicU64,
    pub groups_skipped: AtomicU64,

    pub negatives_matched: AtomicU64,
    pub negatives_partial: AtomicU64,
    pub negatives_unmatched: AtomicU64,
    pub matched_amount_cents: AtomicI64,
    pub fragments_created: AtomicU64,

    pub stale_restarts: AtomicU64,
    pub refetch_rounds: AtomicU64,
    pub fetch_retries: AtomicU64,
    pub group_timeouts: AtomicU64,

    fetch_ms_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
    commit_ms_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
    group_ms_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            batches_started: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_cancelled: AtomicU64::new(0),
            groups_committed: AtomicU64::new(0),
            groups_failed: AtomicU64::new(0),
            groups_skipped: AtomicU64::new(0),
            negatives_matched: AtomicU64::new(0),
            negatives_partial: AtomicU64::new(0),
            negatives_unmatched: AtomicU64::new(0),
            matched_amount_cents: AtomicI64::new(0),
            fragments_created: AtomicU64::new(0),
            stale_restarts: AtomicU64::new(0),
            refetch_rounds: AtomicU64::new(0),
            fetch_retries: AtomicU64::new(0),
            group_timeouts: AtomicU64::new(0),
            fetch_ms_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            commit_ms_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            group_ms_hist: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn observe_fetch_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.fetch_ms_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_commit_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.commit_ms_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_group_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.group_ms_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result(&self, result: &MatchResult) {
        match result.status {
            MatchStatus::Matched => {
                self.negatives_matched.fetch_add(1, Ordering::Relaxed);
            }
            MatchStatus::Partial => {
                self.negatives_partial.fetch_add(1, Ordering::Relaxed);
            }
            MatchStatus::Unmatched => {
                self.negatives_unmatched.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.matched_amount_cents
            .fetch_add(result.total_allocated_cents, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "batches": {
                "started": self.batches_started.load(Ordering::Relaxed),
                "completed": self.batches_completed.load(Ordering::Relaxed),
                "failed": self.batches_failed.load(Ordering::Relaxed),
                "cancelled": self.batches_cancelled.load(Ordering::Relaxed),
            },
            "groups": {
                "committed": self.groups_committed.load(Ordering::Relaxed),
                "failed": self.groups_failed.load(Ordering::Relaxed),
                "skipped": self.groups_skipped.load(Ordering::Relaxed),
                "stale_restarts": self.stale_restarts.load(Ordering::Relaxed),
                "refetch_rounds": self.refetch_rounds.load(Ordering::Relaxed),
                "fetch_retries": self.fetch_retries.load(Ordering::Relaxed),
                "timeouts": self.group_timeouts.load(Ordering::Relaxed),
            },
            "negatives": {
                "matched": self.negatives_matched.load(Ordering::Relaxed),
                "partial": self.negatives_partial.load(Ordering::Relaxed),
                "unmatched": self.negatives_unmatched.load(Ordering::Relaxed),
                "matched_amount_cents": self.matched_amount_cents.load(Ordering::Relaxed),
                "fragments_created": self.fragments_created.load(Ordering::Relaxed),
            },
            "latency": {
                "bucket_bounds_ms": LATENCY_BUCKET_BOUNDS_MS,
                "fetch_ms": hist_to_json(&self.fetch_ms_hist),
                "commit_ms": hist_to_json(&self.commit_ms_hist),
                "group_ms": hist_to_json(&self.group_ms_hist),
            },
        })
    }
}
