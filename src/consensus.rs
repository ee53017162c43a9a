// =============================================================================
// Consensus Engine — regime-aware weighted fusion of provider votes
// =============================================================================
//
// Pipeline per (symbol, cycle):
//   1. Drop signals failing quality gates (stale, below the provider's
//      confidence floor, flagged incomplete/out-of-bounds).
//   2. Normalize weights over the survivors (regime-specific overrides first).
//   3. Directional score S = Σ wᵢ · dirᵢ · (confᵢ / 100).
//   4. Direction from the sign of S; S == 0 resolves to NEUTRAL (reject).
//   5. Confidence = min(100, |S| · 100 · κ) with κ the regime calibration
//      factor, then an optional monotone calibration curve.
//
// Results are cached per (symbol, quantized price bucket, active-provider
// set) with TTL + LRU eviction to absorb back-to-back cycles over identical
// inputs.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::metrics::Metrics;
use crate::providers::ProviderSignal;
use crate::types::{Direction, Regime};

/// Hard cap on cached consensus results.
const CACHE_CAP: usize = 512;
/// Price buckets of roughly 0.1 % for cache keying.
const PRICE_BUCKET_LN_SCALE: f64 = 1000.0;

// ---------------------------------------------------------------------------
// Policy & result types
// ---------------------------------------------------------------------------

/// Quality gates applied before fusion.
#[derive(Debug, Clone)]
pub struct QualityPolicy {
    /// Signals older than this are dropped as stale.
    pub stale_after_ms: u64,
    /// Per-provider minimum confidence; signals below their provider's floor
    /// are dropped.
    pub confidence_floors: HashMap<String, f64>,
    /// Floor for providers absent from the map.
    pub default_floor: f64,
}

impl QualityPolicy {
    fn floor_for(&self, provider_id: &str) -> f64 {
        self.confidence_floors
            .get(provider_id)
            .copied()
            .unwrap_or(self.default_floor)
    }
}

/// Contribution of one provider to the final score.
#[derive(Debug, Clone, Serialize)]
pub struct Contribution {
    pub provider_id: String,
    pub weight: f64,
    pub confidence: f64,
    pub direction: Direction,
    pub contribution: f64,
}

/// Fused decision for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusResult {
    pub direction: Direction,
    /// Post-regime, post-calibration confidence in [0, 100].
    pub confidence: f64,
    /// Raw directional score in [-1, 1].
    pub score: f64,
    /// Providers whose signals survived the quality gates, sorted.
    pub sources_used: Vec<String>,
    pub contributions: Vec<Contribution>,
    pub dropped: usize,
}

// ---------------------------------------------------------------------------
// TTL + LRU cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    at: Instant,
    result: ConsensusResult,
}

struct ConsensusCache {
    entries: HashMap<u64, CacheEntry>,
    order: VecDeque<u64>,
    ttl: Duration,
}

impl ConsensusCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
        }
    }

    fn get(&mut self, key: u64) -> Option<ConsensusResult> {
        let expired = match self.entries.get(&key) {
            Some(entry) if entry.at.elapsed() <= self.ttl => {
                return Some(entry.result.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&key);
            self.order.retain(|k| *k != key);
        }
        None
    }

    fn put(&mut self, key: u64, result: ConsensusResult) {
        if self.entries.insert(key, CacheEntry { at: Instant::now(), result }).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > CACHE_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Regime-aware consensus engine with a TTL'd result cache.
pub struct ConsensusEngine {
    policy: QualityPolicy,
    /// κ per regime; 1.0 when absent.
    calibration: HashMap<Regime, f64>,
    /// Optional monotone calibration curve per regime: sorted (raw, out)
    /// points, linearly interpolated, identity outside the points.
    curves: HashMap<Regime, Vec<(f64, f64)>>,
    /// Regime-specific weight overrides by provider id.
    regime_weights: HashMap<Regime, HashMap<String, f64>>,
    cache: Mutex<ConsensusCache>,
    metrics: Arc<Metrics>,
}

impl ConsensusEngine {
    pub fn new(policy: QualityPolicy, cache_ttl: Duration, metrics: Arc<Metrics>) -> Self {
        let calibration = HashMap::from([
            (Regime::Trending, 1.05),
            (Regime::Consolidation, 0.90),
            (Regime::Volatile, 0.95),
        ]);
        Self {
            policy,
            calibration,
            curves: HashMap::new(),
            regime_weights: HashMap::new(),
            cache: Mutex::new(ConsensusCache::new(cache_ttl)),
            metrics,
        }
    }

    /// Replace the κ calibration map.
    pub fn set_calibration(&mut self, calibration: HashMap<Regime, f64>) {
        self.calibration = calibration;
    }

    /// Register a monotone calibration curve for a regime.
    pub fn set_curve(&mut self, regime: Regime, points: Vec<(f64, f64)>) {
        self.curves.insert(regime, points);
    }

    /// Register regime-specific weight overrides.
    pub fn set_regime_weights(&mut self, regime: Regime, weights: HashMap<String, f64>) {
        self.regime_weights.insert(regime, weights);
    }

    // -------------------------------------------------------------------------
    // Cached entry point
    // -------------------------------------------------------------------------

    /// Fuse with caching. `reference_price` keys the price bucket; cycles
    /// whose inputs land on the same (symbol, bucket, provider set) within
    /// the TTL reuse the previous result.
    pub fn fuse_cached(
        &self,
        symbol: &str,
        reference_price: Option<f64>,
        signals: &[ProviderSignal],
        base_weights: &HashMap<String, f64>,
        regime: Option<Regime>,
        now: DateTime<Utc>,
    ) -> ConsensusResult {
        let key = Self::cache_key(symbol, reference_price, signals, regime);

        if let Some(hit) = self.cache.lock().get(key) {
            Metrics::inc(&self.metrics.consensus_cache_hits);
            return hit;
        }
        Metrics::inc(&self.metrics.consensus_cache_misses);

        let result = self.fuse(signals, base_weights, regime, now);
        self.cache.lock().put(key, result.clone());
        result
    }

    fn cache_key(
        symbol: &str,
        reference_price: Option<f64>,
        signals: &[ProviderSignal],
        regime: Option<Regime>,
    ) -> u64 {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);

        let bucket = reference_price
            .filter(|p| *p > 0.0)
            .map(|p| (p.ln() * PRICE_BUCKET_LN_SCALE).round() as i64)
            .unwrap_or(i64::MIN);
        bucket.hash(&mut hasher);

        let mut ids: Vec<&str> = signals.iter().map(|s| s.provider_id.as_str()).collect();
        ids.sort_unstable();
        ids.hash(&mut hasher);

        regime.map(|r| r.to_string()).hash(&mut hasher);
        hasher.finish()
    }

    // -------------------------------------------------------------------------
    // Fusion
    // -------------------------------------------------------------------------

    /// Uncached fusion of the given provider signals.
    pub fn fuse(
        &self,
        signals: &[ProviderSignal],
        base_weights: &HashMap<String, f64>,
        regime: Option<Regime>,
        now: DateTime<Utc>,
    ) -> ConsensusResult {
        // ── 1. Quality gates ────────────────────────────────────────────
        let mut survivors: Vec<&ProviderSignal> = Vec::with_capacity(signals.len());
        for s in signals {
            let too_old = s.age_ms(now) > self.policy.stale_after_ms;
            let below_floor = s.confidence < self.policy.floor_for(&s.provider_id);
            if too_old || below_floor || !s.quality.clean() {
                continue;
            }
            survivors.push(s);
        }
        let dropped = signals.len() - survivors.len();

        if survivors.is_empty() {
            return ConsensusResult {
                direction: Direction::Neutral,
                confidence: 0.0,
                score: 0.0,
                sources_used: Vec::new(),
                contributions: Vec::new(),
                dropped,
            };
        }

        // ── 2. Normalized weights (regime overrides first) ──────────────
        let overrides = regime.and_then(|r| self.regime_weights.get(&r));
        let raw_weight = |id: &str| -> f64 {
            overrides
                .and_then(|m| m.get(id).copied())
                .or_else(|| base_weights.get(id).copied())
                .unwrap_or(1.0)
                .max(0.0)
        };

        let total: f64 = survivors.iter().map(|s| raw_weight(&s.provider_id)).sum();
        if total <= 0.0 {
            return ConsensusResult {
                direction: Direction::Neutral,
                confidence: 0.0,
                score: 0.0,
                sources_used: Vec::new(),
                contributions: Vec::new(),
                dropped,
            };
        }

        // ── 3. Directional score ────────────────────────────────────────
        let mut score = 0.0;
        let mut contributions = Vec::with_capacity(survivors.len());
        for s in &survivors {
            let weight = raw_weight(&s.provider_id) / total;
            let contribution = weight * s.direction.sign() * (s.confidence / 100.0);
            score += contribution;
            contributions.push(Contribution {
                provider_id: s.provider_id.clone(),
                weight,
                confidence: s.confidence,
                direction: s.direction,
                contribution,
            });
        }

        // ── 4. Direction (exact zero resolves to NEUTRAL) ───────────────
        let direction = if score > 0.0 {
            Direction::Long
        } else if score < 0.0 {
            Direction::Short
        } else {
            Direction::Neutral
        };

        // ── 5. Calibrated confidence ────────────────────────────────────
        let kappa = regime
            .and_then(|r| self.calibration.get(&r).copied())
            .unwrap_or(1.0);
        let raw_confidence = (score.abs() * 100.0 * kappa).min(100.0);
        let confidence = self.apply_curve(regime, raw_confidence);

        let mut sources_used: Vec<String> =
            survivors.iter().map(|s| s.provider_id.clone()).collect();
        sources_used.sort();

        debug!(
            direction = %direction,
            score = format!("{:.4}", score),
            confidence = format!("{:.2}", confidence),
            sources = sources_used.len(),
            dropped,
            "consensus fused"
        );

        ConsensusResult {
            direction,
            confidence,
            score,
            sources_used,
            contributions,
            dropped,
        }
    }

    /// Piecewise-linear monotone calibration; identity when no curve is
    /// registered for the regime.
    fn apply_curve(&self, regime: Option<Regime>, raw: f64) -> f64 {
        let Some(points) = regime.and_then(|r| self.curves.get(&r)) else {
            return raw;
        };
        if points.is_empty() {
            return raw;
        }

        if raw <= points[0].0 {
            return points[0].1;
        }
        for pair in points.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if raw <= x1 {
                let t = if (x1 - x0).abs() < f64::EPSILON {
                    0.0
                } else {
                    (raw - x0) / (x1 - x0)
                };
                return y0 + t * (y1 - y0);
            }
        }
        points[points.len() - 1].1
    }
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("cached", &self.cache.lock().entries.len())
            .finish()
    }
}
