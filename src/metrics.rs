// =============================================================================
// Engine Metrics — lock-free counters plus coarse latency histograms
// =============================================================================
//
// Counters are atomics any thread may bump without coordination; histograms
// take a short parking_lot lock. `snapshot()` serializes everything for the
// GET /metrics endpoint.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Fixed histogram bucket upper bounds in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 8] = [5, 10, 25, 50, 100, 250, 1000, 5000];

/// Coarse latency histogram with fixed millisecond buckets.
#[derive(Debug, Default)]
struct LatencyHistogram {
    counts: [u64; LATENCY_BUCKETS_MS.len() + 1],
    sum_ms: u64,
    total: u64,
}

impl LatencyHistogram {
    fn observe(&mut self, ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.counts[idx] += 1;
        self.sum_ms += ms;
        self.total += 1;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = Vec::with_capacity(self.counts.len());
        for (i, &count) in self.counts.iter().enumerate() {
            let le = LATENCY_BUCKETS_MS
                .get(i)
                .map(|b| b.to_string())
                .unwrap_or_else(|| "+Inf".to_string());
            buckets.push(HistogramBucket { le, count });
        }
        HistogramSnapshot {
            buckets,
            sum_ms: self.sum_ms,
            count: self.total,
            mean_ms: if self.total > 0 {
                self.sum_ms as f64 / self.total as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub le: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<HistogramBucket>,
    pub sum_ms: u64,
    pub count: u64,
    pub mean_ms: f64,
}

/// All engine counters. Shared as `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    // ── Signal pipeline ─────────────────────────────────────────────────
    pub signals_generated: AtomicU64,
    pub signals_below_threshold: AtomicU64,
    pub signals_unchanged_price: AtomicU64,
    pub signals_rejected: AtomicU64,

    // ── Consensus cache ─────────────────────────────────────────────────
    pub consensus_cache_hits: AtomicU64,
    pub consensus_cache_misses: AtomicU64,

    // ── Providers ───────────────────────────────────────────────────────
    pub provider_successes: AtomicU64,
    pub provider_failures: AtomicU64,
    pub provider_short_circuits: AtomicU64,

    // ── Execution ───────────────────────────────────────────────────────
    pub orders_submitted: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub brackets_incomplete: AtomicU64,

    // ── Queue ───────────────────────────────────────────────────────────
    pub queue_enqueued: AtomicU64,
    pub queue_retried: AtomicU64,
    pub queue_filled: AtomicU64,
    pub queue_expired: AtomicU64,
    pub queue_abandoned: AtomicU64,

    // ── Latency histograms ──────────────────────────────────────────────
    signal_latency: Mutex<LatencyHistogram>,
    order_latency: Mutex<LatencyHistogram>,
}

/// Per-reason rejection tally included in the snapshot.
#[derive(Debug, Default)]
pub struct RejectionCounters {
    inner: Mutex<std::collections::BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_signal_latency(&self, ms: u64) {
        self.signal_latency.lock().observe(ms);
    }

    pub fn observe_order_latency(&self, ms: u64) {
        self.order_latency.lock().observe(ms);
    }

    /// Consensus cache hit rate in [0, 1], or `None` before any lookup.
    pub fn consensus_hit_rate(&self) -> Option<f64> {
        let hits = self.consensus_cache_hits.load(Ordering::Relaxed);
        let misses = self.consensus_cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return None;
        }
        Some(hits as f64 / total as f64)
    }

    /// Provider success rate in [0, 1], or `None` before any call.
    pub fn provider_success_rate(&self) -> Option<f64> {
        let ok = self.provider_successes.load(Ordering::Relaxed);
        let err = self.provider_failures.load(Ordering::Relaxed);
        let total = ok + err;
        if total == 0 {
            return None;
        }
        Some(ok as f64 / total as f64)
    }

    /// Full serializable snapshot for GET /metrics.
    pub fn snapshot(&self, rejections: &RejectionCounters, queue_depth: u64) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            signals_generated: load(&self.signals_generated),
            signals_below_threshold: load(&self.signals_below_threshold),
            signals_unchanged_price: load(&self.signals_unchanged_price),
            signals_rejected: load(&self.signals_rejected),
            consensus_cache_hits: load(&self.consensus_cache_hits),
            consensus_cache_misses: load(&self.consensus_cache_misses),
            consensus_cache_hit_rate: self.consensus_hit_rate(),
            provider_successes: load(&self.provider_successes),
            provider_failures: load(&self.provider_failures),
            provider_short_circuits: load(&self.provider_short_circuits),
            provider_success_rate: self.provider_success_rate(),
            orders_submitted: load(&self.orders_submitted),
            orders_rejected: load(&self.orders_rejected),
            brackets_incomplete: load(&self.brackets_incomplete),
            queue_enqueued: load(&self.queue_enqueued),
            queue_retried: load(&self.queue_retried),
            queue_filled: load(&self.queue_filled),
            queue_expired: load(&self.queue_expired),
            queue_abandoned: load(&self.queue_abandoned),
            queue_depth,
            rejection_reasons: rejections.inner.lock().clone(),
            signal_latency: self.signal_latency.lock().snapshot(),
            order_latency: self.order_latency.lock().snapshot(),
        }
    }
}

impl RejectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, code: &str) {
        *self.inner.lock().entry(code.to_string()).or_insert(0) += 1;
    }
}

/// Serializable metrics payload.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub signals_generated: u64,
    pub signals_below_threshold: u64,
    pub signals_unchanged_price: u64,
    pub signals_rejected: u64,
    pub consensus_cache_hits: u64,
    pub consensus_cache_misses: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_cache_hit_rate: Option<f64>,
    pub provider_successes: u64,
    pub provider_failures: u64,
    pub provider_short_circuits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_success_rate: Option<f64>,
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub brackets_incomplete: u64,
    pub queue_enqueued: u64,
    pub queue_retried: u64,
    pub queue_filled: u64,
    pub queue_expired: u64,
    pub queue_abandoned: u64,
    pub queue_depth: u64,
    pub rejection_reasons: std::collections::BTreeMap<String, u64>,
    pub signal_latency: HistogramSnapshot,
    pub order_latency: HistogramSnapshot,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_upper_bound() {
        let mut h = LatencyHistogram::default();
        h.observe(3);
        h.observe(10);
        h.observe(7000);
        let snap = h.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.buckets[0].count, 1); // <= 5
        assert_eq!(snap.buckets[1].count, 1); // <= 10
        assert_eq!(snap.buckets.last().unwrap().count, 1); // +Inf
        assert_eq!(snap.sum_ms, 7013);
    }

    #[test]
    fn hit_rate_none_until_first_lookup() {
        let m = Metrics::new();
        assert!(m.consensus_hit_rate().is_none());
        Metrics::inc(&m.consensus_cache_hits);
        Metrics::inc(&m.consensus_cache_misses);
        assert_eq!(m.consensus_hit_rate(), Some(0.5));
    }

    #[test]
    fn rejection_reasons_tally_by_code() {
        let r = RejectionCounters::new();
        r.record("INSUFFICIENT_BUYING_POWER");
        r.record("INSUFFICIENT_BUYING_POWER");
        r.record("SYMBOL_DENIED");
        let m = Metrics::new();
        let snap = m.snapshot(&r, 4);
        assert_eq!(snap.rejection_reasons["INSUFFICIENT_BUYING_POWER"], 2);
        assert_eq!(snap.rejection_reasons["SYMBOL_DENIED"], 1);
        assert_eq!(snap.queue_depth, 4);
    }
}
