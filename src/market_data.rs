// =============================================================================
// Price History — sharded per-symbol rolling close buffer
// =============================================================================
//
// Shared read surface for the technical provider, the regime classifier, and
// the position sizer's volatility lookup. The signal generator records one
// point per symbol per cycle (the winning market quote).
//
// Sharding: symbols hash onto a fixed set of shards, each behind its own
// RwLock. Critical sections are single-entry read-modify-write.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::indicators;

/// Number of lock shards. Symbols hash onto these; 16 keeps contention low
/// for panels far larger than any realistic symbol list.
const SHARD_COUNT: usize = 16;

/// Maximum retained closes per symbol.
const MAX_POINTS: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Rolling per-symbol price history.
pub struct PriceHistory {
    shards: Vec<RwLock<HashMap<String, VecDeque<PricePoint>>>>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, symbol: &str) -> &RwLock<HashMap<String, VecDeque<PricePoint>>> {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Record a new close for `symbol`, evicting the oldest point once the
    /// per-symbol cap is reached.
    pub fn record(&self, symbol: &str, price: f64, at: DateTime<Utc>) {
        if price <= 0.0 {
            return;
        }
        let mut shard = self.shard(symbol).write();
        let points = shard.entry(symbol.to_string()).or_default();
        points.push_back(PricePoint { price, at });
        while points.len() > MAX_POINTS {
            points.pop_front();
        }
    }

    /// Most recent close for `symbol`, if any.
    pub fn last(&self, symbol: &str) -> Option<f64> {
        self.shard(symbol)
            .read()
            .get(symbol)
            .and_then(|p| p.back().map(|pt| pt.price))
    }

    /// The most recent `n` closes, oldest first.
    pub fn closes(&self, symbol: &str, n: usize) -> Vec<f64> {
        let shard = self.shard(symbol).read();
        match shard.get(symbol) {
            Some(points) => {
                let skip = points.len().saturating_sub(n);
                points.iter().skip(skip).map(|pt| pt.price).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.shard(symbol).read().get(symbol).map_or(0, |p| p.len())
    }

    /// Realized volatility over the last `n` closes, if enough data exists.
    pub fn realized_volatility(&self, symbol: &str, n: usize) -> Option<f64> {
        let closes = self.closes(symbol, n);
        indicators::realized_volatility(&closes)
    }

    /// Mean realized volatility across all tracked symbols. Used as the
    /// portfolio reference in position sizing.
    pub fn portfolio_avg_volatility(&self, window: usize) -> Option<f64> {
        let mut vols = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            for points in shard.values() {
                let skip = points.len().saturating_sub(window);
                let closes: Vec<f64> = points.iter().skip(skip).map(|pt| pt.price).collect();
                if let Some(v) = indicators::realized_volatility(&closes) {
                    vols.push(v);
                }
            }
        }
        if vols.is_empty() {
            return None;
        }
        Some(vols.iter().sum::<f64>() / vols.len() as f64)
    }
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PriceHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbols: usize = self.shards.iter().map(|s| s.read().len()).sum();
        f.debug_struct("PriceHistory").field("symbols", &symbols).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_read_back() {
        let history = PriceHistory::new();
        for i in 0..5 {
            history.record("NVDA", 450.0 + i as f64, Utc::now());
        }
        assert_eq!(history.last("NVDA"), Some(454.0));
        assert_eq!(history.closes("NVDA", 3), vec![452.0, 453.0, 454.0]);
        assert_eq!(history.len("NVDA"), 5);
        assert_eq!(history.last("AAPL"), None);
    }

    #[test]
    fn cap_evicts_oldest() {
        let history = PriceHistory::new();
        for i in 0..(MAX_POINTS + 10) {
            history.record("BTCUSD", 1.0 + i as f64, Utc::now());
        }
        assert_eq!(history.len("BTCUSD"), MAX_POINTS);
        let closes = history.closes("BTCUSD", 1);
        assert_eq!(closes[0], (MAX_POINTS + 10) as f64);
    }

    #[test]
    fn non_positive_prices_are_ignored() {
        let history = PriceHistory::new();
        history.record("SPY", 0.0, Utc::now());
        history.record("SPY", -1.0, Utc::now());
        assert_eq!(history.len("SPY"), 0);
    }

    #[test]
    fn portfolio_average_spans_symbols() {
        let history = PriceHistory::new();
        for i in 0..30 {
            history.record("A", 100.0 + (i % 2) as f64 * 0.1, Utc::now());
            history.record("B", 100.0 + (i % 2) as f64 * 4.0, Utc::now());
        }
        let avg = history.portfolio_avg_volatility(30).unwrap();
        let a = history.realized_volatility("A", 30).unwrap();
        let b = history.realized_volatility("B", 30).unwrap();
        assert!(avg > a && avg < b);
    }
}
