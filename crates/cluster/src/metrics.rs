//! Client statistics sink.
//!
//! [`ClientStats`] counts ledger operations, their failures and cumulative
//! latency, along with protocol events such as ensemble changes, digest
//! mismatches and panicking completion callbacks.
//!
//! # Memory Ordering
//!
//! All counters use `Ordering::Relaxed`. Each counter is independent and
//! monotonically increasing, so a [`snapshot`](ClientStats::snapshot) may
//! observe counters slightly out of step with each other; that is acceptable
//! for telemetry.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use quorumlog_cluster::ClientStats;
//!
//! let stats = ClientStats::new();
//! stats.record_add(Duration::from_micros(120), true);
//! stats.record_ensemble_change();
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.add_count, 1);
//! assert_eq!(snapshot.ensemble_changes, 1);
//! ```

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Lock-free counters shared by every handle of a client.
#[derive(Debug, Default)]
pub struct ClientStats {
    add_count: AtomicU64,
    add_failures: AtomicU64,
    add_latency_us: AtomicU64,
    read_count: AtomicU64,
    read_failures: AtomicU64,
    read_latency_us: AtomicU64,
    batch_read_count: AtomicU64,
    batch_read_failures: AtomicU64,
    lac_read_count: AtomicU64,
    lac_read_failures: AtomicU64,
    lac_update_hits: AtomicU64,
    lac_update_misses: AtomicU64,
    ensemble_changes: AtomicU64,
    ensemble_change_failures: AtomicU64,
    digest_mismatches: AtomicU64,
    callback_panics: AtomicU64,
    recoveries: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    /// Add operations completed.
    pub add_count: u64,
    /// Add operations that failed.
    pub add_failures: u64,
    /// Cumulative add latency in microseconds.
    pub add_latency_us: u64,
    /// Range reads completed.
    pub read_count: u64,
    /// Range reads that failed.
    pub read_failures: u64,
    /// Cumulative read latency in microseconds.
    pub read_latency_us: u64,
    /// Batch reads completed.
    pub batch_read_count: u64,
    /// Batch reads that failed.
    pub batch_read_failures: u64,
    /// Last-add-confirmed queries completed.
    pub lac_read_count: u64,
    /// Last-add-confirmed queries that failed.
    pub lac_read_failures: u64,
    /// Queries that advanced the local last-add-confirmed.
    pub lac_update_hits: u64,
    /// Queries that left the local last-add-confirmed unchanged.
    pub lac_update_misses: u64,
    /// Ensemble changes written to metadata.
    pub ensemble_changes: u64,
    /// Ensemble changes that could not be completed.
    pub ensemble_change_failures: u64,
    /// Responses rejected by digest verification.
    pub digest_mismatches: u64,
    /// Completion callbacks that panicked.
    pub callback_panics: u64,
    /// Ledgers recovered on open.
    pub recoveries: u64,
}

impl ClientStatsSnapshot {
    /// Average add latency in microseconds.
    #[must_use]
    pub fn avg_add_latency_us(&self) -> f64 {
        average(self.add_latency_us, self.add_count)
    }

    /// Average read latency in microseconds.
    #[must_use]
    pub fn avg_read_latency_us(&self) -> f64 {
        average(self.read_latency_us, self.read_count)
    }
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    total as f64 / count as f64
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl ClientStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished add.
    pub fn record_add(&self, latency: Duration, ok: bool) {
        self.add_count.fetch_add(1, Ordering::Relaxed);
        self.add_latency_us.fetch_add(micros(latency), Ordering::Relaxed);
        if !ok {
            self.add_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a finished range read.
    pub fn record_read(&self, latency: Duration, ok: bool) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_latency_us.fetch_add(micros(latency), Ordering::Relaxed);
        if !ok {
            self.read_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a finished batch read.
    pub fn record_batch_read(&self, ok: bool) {
        self.batch_read_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.batch_read_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a finished last-add-confirmed query.
    pub fn record_lac_read(&self, ok: bool) {
        self.lac_read_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.lac_read_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records whether a query advanced the local last-add-confirmed.
    pub fn record_lac_update(&self, advanced: bool) {
        if advanced {
            self.lac_update_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lac_update_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a completed ensemble change.
    pub fn record_ensemble_change(&self) {
        self.ensemble_changes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an ensemble change that had to be abandoned.
    pub fn record_ensemble_change_failure(&self) {
        self.ensemble_change_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a response rejected by digest verification.
    pub fn record_digest_mismatch(&self) {
        self.digest_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completion callback that panicked.
    pub fn record_callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a ledger recovered on open.
    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            add_count: self.add_count.load(Ordering::Relaxed),
            add_failures: self.add_failures.load(Ordering::Relaxed),
            add_latency_us: self.add_latency_us.load(Ordering::Relaxed),
            read_count: self.read_count.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            read_latency_us: self.read_latency_us.load(Ordering::Relaxed),
            batch_read_count: self.batch_read_count.load(Ordering::Relaxed),
            batch_read_failures: self.batch_read_failures.load(Ordering::Relaxed),
            lac_read_count: self.lac_read_count.load(Ordering::Relaxed),
            lac_read_failures: self.lac_read_failures.load(Ordering::Relaxed),
            lac_update_hits: self.lac_update_hits.load(Ordering::Relaxed),
            lac_update_misses: self.lac_update_misses.load(Ordering::Relaxed),
            ensemble_changes: self.ensemble_changes.load(Ordering::Relaxed),
            ensemble_change_failures: self.ensemble_change_failures.load(Ordering::Relaxed),
            digest_mismatches: self.digest_mismatches.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.add_count,
            &self.add_failures,
            &self.add_latency_us,
            &self.read_count,
            &self.read_failures,
            &self.read_latency_us,
            &self.batch_read_count,
            &self.batch_read_failures,
            &self.lac_read_count,
            &self.lac_read_failures,
            &self.lac_update_hits,
            &self.lac_update_misses,
            &self.ensemble_changes,
            &self.ensemble_change_failures,
            &self.digest_mismatches,
            &self.callback_panics,
            &self.recoveries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_add_latency_average() {
        let stats = ClientStats::new();
        stats.record_add(Duration::from_micros(100), true);
        stats.record_add(Duration::from_micros(300), false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.add_count, 2);
        assert_eq!(snapshot.add_failures, 1);
        assert!((snapshot.avg_add_latency_us() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_of_nothing_is_zero() {
        assert!(ClientStats::new().snapshot().avg_read_latency_us().abs() < f64::EPSILON);
    }

    #[test]
    fn test_lac_update_hits_and_misses() {
        let stats = ClientStats::new();
        stats.record_lac_update(true);
        stats.record_lac_update(false);
        stats.record_lac_update(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.lac_update_hits, 1);
        assert_eq!(snapshot.lac_update_misses, 2);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let stats = ClientStats::new();
        stats.record_read(Duration::from_millis(1), false);
        stats.record_callback_panic();
        stats.record_digest_mismatch();
        stats.reset();

        assert_eq!(stats.snapshot(), ClientStatsSnapshot::default());
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(ClientStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        stats.record_batch_read(true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().ok();
        }

        assert_eq!(stats.snapshot().batch_read_count, 8_000);
    }
}
