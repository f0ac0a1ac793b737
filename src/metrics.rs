use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-cache metrics for observability and testing
///
/// Each Cache instance has its own set of metrics, allowing:
/// - Isolated testing with loom (no global state contamination)
/// - Multiple cache instances with independent metrics
/// - Clean metric validation in tests
pub struct CacheMetrics {
    // Lookup outcomes
    pub hits: Counter,
    pub misses: Counter,

    // Page loads
    pub loads: Counter,
    pub load_failures: Counter,
    pub load_waits: Counter,

    // Removals
    pub evictions: Counter,
    pub invalidations: Counter,

    // Buffering and maintenance
    pub read_buffer_drops: Counter,
    pub write_buffer_retries: Counter,
    pub inline_maintenance: Counter,
    pub maintenance_runs: Counter,
    pub lock_wait_warnings: Counter,

    // Optimistic reads that observed a version change
    pub stale_reads: Counter,

    // CAS contention metrics
    pub cas_retry: Counter,

    // Current state gauges
    pub pages_free: Gauge,
    pub entries_live: Gauge,
}

impl CacheMetrics {
    /// Create a new set of metrics for a cache instance
    pub fn new() -> Self {
        Self {
            hits: Counter::new(),
            misses: Counter::new(),
            loads: Counter::new(),
            load_failures: Counter::new(),
            load_waits: Counter::new(),
            evictions: Counter::new(),
            invalidations: Counter::new(),
            read_buffer_drops: Counter::new(),
            write_buffer_retries: Counter::new(),
            inline_maintenance: Counter::new(),
            maintenance_runs: Counter::new(),
            lock_wait_warnings: Counter::new(),
            stale_reads: Counter::new(),
            cas_retry: Counter::new(),
            pages_free: Gauge::new(),
            entries_live: Gauge::new(),
        }
    }

    /// Percentage of lookups served without a load, `0.0` before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.value();
        let total = hits + self.misses.value();
        if total == 0 {
            return 0.0;
        }
        hits as f64 * 100.0 / total as f64
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_is_zero_without_lookups() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);
    }

    #[test]
    fn hit_ratio_is_a_percentage() {
        let metrics = CacheMetrics::new();
        metrics.hits.add(3);
        metrics.misses.increment();
        assert!((metrics.hit_ratio() - 75.0).abs() < f64::EPSILON);
    }
}
