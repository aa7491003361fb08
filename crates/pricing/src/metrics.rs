//! In-process worker counters.
//!
//! Permanent pricing failures have no client-visible surface at all; this
//! counter (and the structured error log next to it) is how they are seen.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub events_processed: AtomicU64,
    pub events_skipped: AtomicU64,
    pub events_failed: AtomicU64,
    pub permanent_pricing_failures: AtomicU64,
    pub wallet_debits: AtomicU64,
    pub invoices_created: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
