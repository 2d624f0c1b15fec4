//! Statistics for the cache coordinator.
//!
//! Lock-free counters shared by every file of a session. Nothing here is
//! needed for correctness; the counters exist for monitoring and tests.
//!
//! ```
//! use netcache::stats::CacheStats;
//!
//! let stats = CacheStats::new();
//! stats.record_read_submitted();
//! stats.record_read_miss();
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.read_submitted, 1);
//! assert!((snapshot.hit_rate() - 0.5).abs() < f64::EPSILON);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for cache activity.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// File objects registered.
    pub registrations: AtomicU64,
    /// Registration attempts that were skipped.
    pub registration_skips: AtomicU64,
    /// File objects unregistered (content kept).
    pub unregistrations: AtomicU64,
    /// File objects revoked (content discarded).
    pub revocations: AtomicU64,
    /// Page reads submitted to the store.
    pub read_submitted: AtomicU64,
    /// Page reads that missed.
    pub read_misses: AtomicU64,
    /// Page reads that failed unexpectedly.
    pub read_errors: AtomicU64,
    /// Pages written to the store.
    pub writes: AtomicU64,
    /// Page writes that failed.
    pub write_failures: AtomicU64,
    /// Pages invalidated.
    pub invalidations: AtomicU64,
    /// Release requests that allowed reclaim.
    pub releases: AtomicU64,
    /// Release requests that asked to retain the page.
    pub retains: AtomicU64,
    /// Asynchronous uncache requests queued.
    pub async_uncaches: AtomicU64,
    /// Now-uncached sweeps run.
    pub sweeps: AtomicU64,
    /// Page markers cleared by sweeps.
    pub markers_cleared: AtomicU64,
}

macro_rules! recorder {
    ($($(#[$doc:meta])* $name:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CacheStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    recorder! {
        /// Record a registration.
        record_registration => registrations;
        /// Record a skipped registration.
        record_registration_skip => registration_skips;
        /// Record an unregistration.
        record_unregistration => unregistrations;
        /// Record a revocation.
        record_revocation => revocations;
        /// Record a submitted page read.
        record_read_submitted => read_submitted;
        /// Record a page read miss.
        record_read_miss => read_misses;
        /// Record a page read error.
        record_read_error => read_errors;
        /// Record a page write.
        record_write => writes;
        /// Record a failed page write.
        record_write_failure => write_failures;
        /// Record a page invalidation.
        record_invalidation => invalidations;
        /// Record a release that allowed reclaim.
        record_release => releases;
        /// Record a release that retained the page.
        record_retain => retains;
        /// Record a queued asynchronous uncache.
        record_async_uncache => async_uncaches;
        /// Record a now-uncached sweep.
        record_sweep => sweeps;
    }

    /// Record markers cleared by a sweep.
    #[inline]
    pub fn record_markers_cleared(&self, count: u64) {
        self.markers_cleared.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            registrations: load(&self.registrations),
            registration_skips: load(&self.registration_skips),
            unregistrations: load(&self.unregistrations),
            revocations: load(&self.revocations),
            read_submitted: load(&self.read_submitted),
            read_misses: load(&self.read_misses),
            read_errors: load(&self.read_errors),
            writes: load(&self.writes),
            write_failures: load(&self.write_failures),
            invalidations: load(&self.invalidations),
            releases: load(&self.releases),
            retains: load(&self.retains),
            async_uncaches: load(&self.async_uncaches),
            sweeps: load(&self.sweeps),
            markers_cleared: load(&self.markers_cleared),
        }
    }
}

/// Serializable copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CacheStatsSnapshot {
    pub registrations: u64,
    pub registration_skips: u64,
    pub unregistrations: u64,
    pub revocations: u64,
    pub read_submitted: u64,
    pub read_misses: u64,
    pub read_errors: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub invalidations: u64,
    pub releases: u64,
    pub retains: u64,
    pub async_uncaches: u64,
    pub sweeps: u64,
    pub markers_cleared: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of page reads served by the cache (0.0 to 1.0).
    ///
    /// Returns 0.0 if no reads have been attempted.
    pub fn hit_rate(&self) -> f64 {
        let total = self.read_submitted + self.read_misses + self.read_errors;
        if total == 0 {
            0.0
        } else {
            self.read_submitted as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_hit_rate_empty() {
        assert!(CacheStats::new().snapshot().hit_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_counts_errors_as_misses() {
        let stats = CacheStats::new();
        stats.record_read_submitted();
        stats.record_read_submitted();
        stats.record_read_miss();
        stats.record_read_error();
        assert!((stats.snapshot().hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_markers_cleared_accumulates() {
        let stats = CacheStats::new();
        stats.record_markers_cleared(10);
        stats.record_markers_cleared(5);
        assert_eq!(stats.snapshot().markers_cleared, 15);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CacheStats::new();
        stats.record_revocation();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"revocations\":1"));
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(CacheStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_write();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().writes, 8000);
    }
}
