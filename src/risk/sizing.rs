// =============================================================================
// Position Sizer — equity, confidence, and volatility scaled order quantity
// =============================================================================
//
//   base      = equity · position_size_pct
//   conf_mult = 1.0 + ((confidence − 75) / 25) · 0.5     (1.0 @ 75, 1.5 @ 100)
//   vol_mult  = min(avg_portfolio_volatility / asset_volatility, 1.5)
//   nominal   = min(base · conf_mult · vol_mult, equity · max_position_size_pct)
//   qty       = floor(nominal / entry)  — whole shares for equities,
//               fractional for crypto (subject to a minimum notional)
//
// Per-symbol volatility lookups go through a bounded TTL cache; expired
// entries are recomputed from the shared price history on access.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::RejectReason;
use crate::market_data::PriceHistory;
use crate::types::{AssetClass, SymbolSpec};

/// Hard cap on cached volatility entries.
const VOL_CACHE_CAP: usize = 1024;
/// Closes used for the realized-volatility window.
const VOL_WINDOW: usize = 100;
/// Confidence multiplier bounds.
const CONF_MULT_MIN: f64 = 0.5;
const CONF_MULT_MAX: f64 = 1.5;
/// Volatility multiplier cap.
const VOL_MULT_MAX: f64 = 1.5;
/// Minimum notional for crypto symbols without an explicit configuration.
const DEFAULT_CRYPTO_MIN_NOTIONAL: f64 = 10.0;

/// A sized order ready for the risk gate and broker.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub qty: f64,
    pub notional: f64,
    pub conf_mult: f64,
    pub vol_mult: f64,
}

struct VolEntry {
    at: Instant,
    vol: Option<f64>,
}

/// Computes order quantities. Holds only configuration plus the volatility
/// cache.
pub struct PositionSizer {
    position_size_pct: f64,
    max_position_size_pct: f64,
    crypto_min_notional: HashMap<String, f64>,
    vol_cache_ttl: Duration,
    history: Arc<PriceHistory>,
    vol_cache: Mutex<HashMap<String, VolEntry>>,
}

impl PositionSizer {
    pub fn from_config(cfg: &EngineConfig, history: Arc<PriceHistory>) -> Self {
        Self {
            position_size_pct: cfg.position_size_pct,
            max_position_size_pct: cfg.max_position_size_pct,
            crypto_min_notional: cfg.crypto_min_notional.clone(),
            vol_cache_ttl: Duration::from_millis(cfg.volatility_cache_ttl_ms),
            history,
            vol_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Size an order using cached volatility lookups.
    pub fn size(
        &self,
        spec: &SymbolSpec,
        entry_price: f64,
        confidence: f64,
        equity: f64,
    ) -> Result<SizedOrder, RejectReason> {
        let asset_vol = self.cached_volatility(&spec.symbol);
        let avg_vol = self.history.portfolio_avg_volatility(VOL_WINDOW);
        self.size_with_volatility(spec, entry_price, confidence, equity, avg_vol, asset_vol)
    }

    /// Pure sizing arithmetic with the volatility inputs supplied directly.
    pub fn size_with_volatility(
        &self,
        spec: &SymbolSpec,
        entry_price: f64,
        confidence: f64,
        equity: f64,
        avg_portfolio_vol: Option<f64>,
        asset_vol: Option<f64>,
    ) -> Result<SizedOrder, RejectReason> {
        if entry_price <= 0.0 || equity <= 0.0 {
            return Err(RejectReason::QtyBelowMinimum);
        }

        let base = equity * self.position_size_pct;

        let conf_mult =
            (1.0 + ((confidence - 75.0) / 25.0) * 0.5).clamp(CONF_MULT_MIN, CONF_MULT_MAX);

        let vol_mult = match (avg_portfolio_vol, asset_vol) {
            (Some(avg), Some(asset)) if asset > 0.0 => (avg / asset).min(VOL_MULT_MAX),
            _ => 1.0,
        };

        let nominal = (base * conf_mult * vol_mult).min(equity * self.max_position_size_pct);

        let (qty, notional) = match spec.asset_class {
            AssetClass::Equity => {
                let qty = (nominal / entry_price).floor();
                if qty < 1.0 {
                    return Err(RejectReason::QtyBelowMinimum);
                }
                (qty, qty * entry_price)
            }
            AssetClass::Crypto => {
                let qty = nominal / entry_price;
                let notional = qty * entry_price;
                let min_notional = self
                    .crypto_min_notional
                    .get(&spec.symbol)
                    .copied()
                    .unwrap_or(DEFAULT_CRYPTO_MIN_NOTIONAL);
                if notional < min_notional {
                    return Err(RejectReason::QtyBelowMinimum);
                }
                (qty, notional)
            }
        };

        debug!(
            symbol = %spec.symbol,
            qty,
            notional,
            conf_mult,
            vol_mult,
            "order sized"
        );

        Ok(SizedOrder {
            qty,
            notional,
            conf_mult,
            vol_mult,
        })
    }

    /// Per-symbol realized volatility with TTL caching. Expired entries are
    /// recomputed from the price history on access.
    fn cached_volatility(&self, symbol: &str) -> Option<f64> {
        {
            let cache = self.vol_cache.lock();
            if let Some(entry) = cache.get(symbol) {
                if entry.at.elapsed() <= self.vol_cache_ttl {
                    return entry.vol;
                }
            }
        }

        let vol = self.history.realized_volatility(symbol, VOL_WINDOW);

        let mut cache = self.vol_cache.lock();
        if cache.len() >= VOL_CACHE_CAP && !cache.contains_key(symbol) {
            // Evict the stalest entry to stay bounded.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, e)| e.at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            symbol.to_string(),
            VolEntry {
                at: Instant::now(),
                vol,
            },
        );
        vol
    }
}

impl std::fmt::Debug for PositionSizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionSizer")
            .field("position_size_pct", &self.position_size_pct)
            .field("max_position_size_pct", &self.max_position_size_pct)
            .field("cached_vols", &self.vol_cache.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> PositionSizer {
        PositionSizer::from_config(&EngineConfig::default(), Arc::new(PriceHistory::new()))
    }

    #[test]
    fn reference_equity_sizing() {
        // equity 100k, 10 % base, confidence 88.5 → ×1.27, vol ×1.2,
        // nominal 15 240 capped at 15 000, entry 450 → 33 shares.
        let s = sizer();
        let sized = s
            .size_with_volatility(
                &SymbolSpec::equity("NVDA"),
                450.0,
                88.5,
                100_000.0,
                Some(0.012),
                Some(0.010),
            )
            .unwrap();
        assert_eq!(sized.qty, 33.0);
        assert!((sized.conf_mult - 1.27).abs() < 1e-9);
        assert!((sized.vol_mult - 1.2).abs() < 1e-9);
        assert!((sized.notional - 33.0 * 450.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_multiplier_bounds() {
        let s = sizer();
        let at_75 = s
            .size_with_volatility(&SymbolSpec::equity("X"), 10.0, 75.0, 100_000.0, None, None)
            .unwrap();
        assert!((at_75.conf_mult - 1.0).abs() < 1e-12);

        let at_100 = s
            .size_with_volatility(&SymbolSpec::equity("X"), 10.0, 100.0, 100_000.0, None, None)
            .unwrap();
        assert!((at_100.conf_mult - 1.5).abs() < 1e-12);
    }

    #[test]
    fn volatile_assets_are_sized_down_and_cap_applies() {
        let s = sizer();
        // Asset twice as volatile as the portfolio: half size.
        let calm = s
            .size_with_volatility(
                &SymbolSpec::equity("X"),
                10.0,
                75.0,
                100_000.0,
                Some(0.01),
                Some(0.02),
            )
            .unwrap();
        assert!((calm.vol_mult - 0.5).abs() < 1e-12);

        // Very calm asset: multiplier capped at 1.5.
        let wild = s
            .size_with_volatility(
                &SymbolSpec::equity("X"),
                10.0,
                75.0,
                100_000.0,
                Some(0.05),
                Some(0.001),
            )
            .unwrap();
        assert!((wild.vol_mult - 1.5).abs() < 1e-12);
    }

    #[test]
    fn equity_qty_below_one_share_rejects() {
        let s = sizer();
        // 10 % of 1 000 = 100 nominal; a 500-per-share stock gets zero shares.
        assert_eq!(
            s.size_with_volatility(&SymbolSpec::equity("X"), 500.0, 75.0, 1_000.0, None, None),
            Err(RejectReason::QtyBelowMinimum)
        );
    }

    #[test]
    fn crypto_is_fractional_above_min_notional() {
        let s = sizer();
        let sized = s
            .size_with_volatility(
                &SymbolSpec::crypto("BTCUSD"),
                60_000.0,
                80.0,
                100_000.0,
                None,
                None,
            )
            .unwrap();
        assert!(sized.qty > 0.0 && sized.qty < 1.0);
        assert!(sized.notional >= DEFAULT_CRYPTO_MIN_NOTIONAL);
    }

    #[test]
    fn crypto_below_min_notional_rejects() {
        let mut cfg = EngineConfig::default();
        cfg.crypto_min_notional.insert("BTCUSD".into(), 50_000.0);
        let s = PositionSizer::from_config(&cfg, Arc::new(PriceHistory::new()));
        assert_eq!(
            s.size_with_volatility(
                &SymbolSpec::crypto("BTCUSD"),
                60_000.0,
                80.0,
                100_000.0,
                None,
                None,
            ),
            Err(RejectReason::QtyBelowMinimum)
        );
    }

    #[test]
    fn nonsense_inputs_reject() {
        let s = sizer();
        assert!(s
            .size_with_volatility(&SymbolSpec::equity("X"), 0.0, 80.0, 100_000.0, None, None)
            .is_err());
        assert!(s
            .size_with_volatility(&SymbolSpec::equity("X"), 10.0, 80.0, 0.0, None, None)
            .is_err());
    }

    #[test]
    fn volatility_cache_serves_within_ttl() {
        let history = Arc::new(PriceHistory::new());
        for i in 0..60 {
            history.record("NVDA", 100.0 + (i % 3) as f64, chrono::Utc::now());
        }
        let s = PositionSizer::from_config(&EngineConfig::default(), history.clone());

        let first = s.cached_volatility("NVDA");
        assert!(first.is_some());

        // New data arrives, but the cached value still serves.
        for _ in 0..60 {
            history.record("NVDA", 100.0, chrono::Utc::now());
        }
        assert_eq!(s.cached_volatility("NVDA"), first);
    }
}
