// =============================================================================
// Regime Classifier — labels recent price action, derives confidence gates
// =============================================================================
//
// Classifies each symbol's recent closes into one of three regimes using
// realized volatility and the Kaufman efficiency ratio.
//
// Detection hierarchy (evaluated top-to-bottom; first match wins):
//
//   1. VOLATILE       — realized vol above the volatility threshold
//   2. TRENDING       — efficiency ratio above the trend threshold
//   3. CONSOLIDATION  — everything else
//
// Each regime maps to a minimum confidence threshold (configuration); the
// signal generator emits only at or above that threshold.
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::indicators::{efficiency_ratio, realized_volatility};
use crate::types::Regime;

/// Closes required before a classification is attempted.
const MIN_CLOSES: usize = 20;
/// Per-sample realized volatility above which the regime is VOLATILE.
const VOLATILE_VOL_THRESHOLD: f64 = 0.012;
/// Efficiency ratio above which the regime is TRENDING.
const TRENDING_ER_THRESHOLD: f64 = 0.45;

/// Snapshot of the classification plus the metrics behind it.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub realized_vol: f64,
    pub efficiency: f64,
    /// Confidence in the classification itself, [0.0, 1.0].
    pub confidence: f64,
    pub regime_age_secs: f64,
}

struct SymbolRegime {
    state: RegimeState,
    last_change: Instant,
}

/// Thread-safe per-symbol regime classifier.
///
/// Designed to be wrapped in an `Arc` and shared across the async runtime.
pub struct RegimeClassifier {
    by_symbol: RwLock<HashMap<String, SymbolRegime>>,
}

impl RegimeClassifier {
    pub fn new() -> Self {
        Self {
            by_symbol: RwLock::new(HashMap::new()),
        }
    }

    /// Classify `closes` (oldest first) for `symbol`, cache the result, and
    /// return it. Returns `None` when too little data exists to classify.
    pub fn classify(&self, symbol: &str, closes: &[f64]) -> Option<RegimeState> {
        if closes.len() < MIN_CLOSES {
            trace!(symbol, have = closes.len(), need = MIN_CLOSES, "regime: insufficient closes");
            return None;
        }

        let vol = realized_volatility(closes)?;
        let er = efficiency_ratio(closes)?;
        let (regime, confidence) = classify(vol, er);

        let now = Instant::now();
        let mut by_symbol = self.by_symbol.write();
        let entry = by_symbol.entry(symbol.to_string());

        let state = match entry {
            std::collections::hash_map::Entry::Occupied(mut occ) => {
                let prev = occ.get_mut();
                if prev.state.regime != regime {
                    prev.last_change = now;
                }
                let age = now.duration_since(prev.last_change).as_secs_f64();
                prev.state = RegimeState {
                    regime,
                    realized_vol: vol,
                    efficiency: er,
                    confidence,
                    regime_age_secs: age,
                };
                prev.state.clone()
            }
            std::collections::hash_map::Entry::Vacant(vac) => {
                let state = RegimeState {
                    regime,
                    realized_vol: vol,
                    efficiency: er,
                    confidence,
                    regime_age_secs: 0.0,
                };
                vac.insert(SymbolRegime {
                    state: state.clone(),
                    last_change: now,
                });
                state
            }
        };

        debug!(
            symbol,
            regime = %state.regime,
            vol = format!("{:.5}", vol),
            efficiency = format!("{:.3}", er),
            confidence = format!("{:.2}", confidence),
            "regime classified"
        );
        Some(state)
    }

    /// Latest cached state for `symbol` without recomputing.
    pub fn current(&self, symbol: &str) -> Option<RegimeState> {
        self.by_symbol.read().get(symbol).map(|s| s.state.clone())
    }

    /// Snapshot of every tracked symbol's regime for the health endpoint.
    pub fn snapshot(&self) -> HashMap<String, RegimeState> {
        self.by_symbol
            .read()
            .iter()
            .map(|(sym, s)| (sym.clone(), s.state.clone()))
            .collect()
    }
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegimeClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeClassifier")
            .field("symbols", &self.by_symbol.read().len())
            .finish()
    }
}

// =============================================================================
// Classification logic
// =============================================================================

fn classify(vol: f64, er: f64) -> (Regime, f64) {
    // 1. VOLATILE — volatility dominates every other consideration.
    if vol >= VOLATILE_VOL_THRESHOLD {
        let confidence = remap(vol, VOLATILE_VOL_THRESHOLD, VOLATILE_VOL_THRESHOLD * 3.0, 0.60, 1.0);
        return (Regime::Volatile, confidence);
    }

    // 2. TRENDING — efficient directional movement.
    if er >= TRENDING_ER_THRESHOLD {
        let confidence = remap(er, TRENDING_ER_THRESHOLD, 0.90, 0.60, 1.0);
        return (Regime::Trending, confidence);
    }

    // 3. CONSOLIDATION — quiet, inefficient chop.
    let confidence = remap(er, TRENDING_ER_THRESHOLD, 0.05, 0.50, 0.95);
    (Regime::Consolidation, confidence)
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range. Works with inverted input ranges.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_volatility_wins() {
        let (regime, conf) = classify(0.03, 0.9);
        assert_eq!(regime, Regime::Volatile);
        assert!(conf > 0.6);
    }

    #[test]
    fn efficient_move_is_trending() {
        let (regime, _) = classify(0.004, 0.7);
        assert_eq!(regime, Regime::Trending);
    }

    #[test]
    fn quiet_chop_is_consolidation() {
        let (regime, _) = classify(0.002, 0.15);
        assert_eq!(regime, Regime::Consolidation);
    }

    #[test]
    fn classifier_needs_enough_closes() {
        let classifier = RegimeClassifier::new();
        assert!(classifier.classify("NVDA", &[450.0; 5]).is_none());
        assert!(classifier.current("NVDA").is_none());
    }

    #[test]
    fn steady_climb_classifies_trending() {
        let classifier = RegimeClassifier::new();
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + i as f64 * 0.2).collect();
        let state = classifier.classify("NVDA", &closes).unwrap();
        assert_eq!(state.regime, Regime::Trending);
        assert_eq!(classifier.current("NVDA").unwrap().regime, Regime::Trending);
    }

    #[test]
    fn wild_swings_classify_volatile() {
        let classifier = RegimeClassifier::new();
        let closes: Vec<f64> = (0..50)
            .map(|i| if i % 2 == 0 { 100.0 } else { 104.0 })
            .collect();
        let state = classifier.classify("BTCUSD", &closes).unwrap();
        assert_eq!(state.regime, Regime::Volatile);
    }

    #[test]
    fn tight_range_classifies_consolidation() {
        let classifier = RegimeClassifier::new();
        let closes: Vec<f64> = (0..50)
            .map(|i| 100.0 + ((i * 7) % 5) as f64 * 0.02)
            .collect();
        let state = classifier.classify("SPY", &closes).unwrap();
        assert_eq!(state.regime, Regime::Consolidation);
    }

    #[test]
    fn regime_age_resets_on_change() {
        let classifier = RegimeClassifier::new();
        let trend: Vec<f64> = (0..50).map(|i| 100.0 + i as f64 * 0.2).collect();
        let chop: Vec<f64> = (0..50).map(|i| 100.0 + ((i * 7) % 5) as f64 * 0.02).collect();

        classifier.classify("X", &trend).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(15));
        let same = classifier.classify("X", &trend).unwrap();
        assert!(same.regime_age_secs > 0.0);

        let changed = classifier.classify("X", &chop).unwrap();
        assert_eq!(changed.regime, Regime::Consolidation);
        assert_eq!(changed.regime_age_secs, 0.0);
    }
}
