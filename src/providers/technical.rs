// =============================================================================
// Technical Provider — local indicator vote from the shared price history
// =============================================================================
//
// No network IO: direction comes from EMA trend alignment plus RSI
// confirmation over the rolling close buffer. Reports `incomplete` until
// enough history has accumulated so the consensus quality gate drops it
// early in a fresh process.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::indicators::{calculate_ema, calculate_rsi};
use crate::market_data::PriceHistory;
use crate::providers::{DataProvider, ProviderKind, ProviderSignal};
use crate::types::{AssetClass, Direction, SymbolSpec};

/// Closes required before the vote is meaningful.
const MIN_HISTORY: usize = 30;
/// Closes fed to the indicator stack.
const LOOKBACK: usize = 100;

const EMA_FAST: usize = 9;
const EMA_SLOW: usize = 21;
const RSI_PERIOD: usize = 14;

pub struct TechnicalProvider {
    id: String,
    history: Arc<PriceHistory>,
}

impl TechnicalProvider {
    pub fn new(id: impl Into<String>, history: Arc<PriceHistory>) -> Self {
        Self {
            id: id.into(),
            history,
        }
    }

    /// Derive a vote from the indicator stack.
    fn vote(closes: &[f64]) -> (Direction, f64) {
        let fast = calculate_ema(closes, EMA_FAST);
        let slow = calculate_ema(closes, EMA_SLOW);
        let rsi = calculate_rsi(closes, RSI_PERIOD);

        let (Some(&fast_last), Some(&slow_last), Some(rsi_val)) =
            (fast.last(), slow.last(), rsi)
        else {
            return (Direction::Neutral, 0.0);
        };

        let last = closes[closes.len() - 1];
        let trend_up = fast_last > slow_last && last > fast_last;
        let trend_down = fast_last < slow_last && last < fast_last;

        // EMA alignment sets the base vote; RSI extremes strengthen or veto.
        if trend_up {
            if rsi_val > 75.0 {
                // Overbought against the trend: stand aside.
                (Direction::Neutral, 40.0)
            } else {
                let conf = 65.0 + ((60.0 - (rsi_val - 50.0).abs()).max(0.0) / 60.0) * 20.0;
                (Direction::Long, conf.min(90.0))
            }
        } else if trend_down {
            if rsi_val < 25.0 {
                (Direction::Neutral, 40.0)
            } else {
                let conf = 65.0 + ((60.0 - (rsi_val - 50.0).abs()).max(0.0) / 60.0) * 20.0;
                (Direction::Short, conf.min(90.0))
            }
        } else if rsi_val < 30.0 {
            (Direction::Long, 50.0 + (30.0 - rsi_val))
        } else if rsi_val > 70.0 {
            (Direction::Short, 50.0 + (rsi_val - 70.0))
        } else {
            (Direction::Neutral, 30.0)
        }
    }
}

#[async_trait]
impl DataProvider for TechnicalProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Technical
    }

    fn supports_asset_class(&self, _class: AssetClass) -> bool {
        true
    }

    async fn fetch(
        &self,
        symbol: &SymbolSpec,
        _cancel: &CancellationToken,
    ) -> Result<ProviderSignal, ProviderError> {
        let closes = self.history.closes(&symbol.symbol, LOOKBACK);

        if closes.len() < MIN_HISTORY {
            let mut signal =
                ProviderSignal::new(&self.id, &symbol.symbol, Direction::Neutral, 0.0);
            signal.quality.incomplete = true;
            return Ok(signal);
        }

        let (direction, confidence) = Self::vote(&closes);
        let last = closes[closes.len() - 1];
        Ok(ProviderSignal::new(&self.id, &symbol.symbol, direction, confidence).with_price(last))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn provider_with_closes(closes: &[f64]) -> TechnicalProvider {
        let history = Arc::new(PriceHistory::new());
        for &c in closes {
            history.record("TEST", c, Utc::now());
        }
        TechnicalProvider::new("tech", history)
    }

    #[tokio::test]
    async fn short_history_is_incomplete_neutral() {
        let provider = provider_with_closes(&[100.0; 5]);
        let spec = SymbolSpec::equity("TEST");
        let cancel = CancellationToken::new();
        let signal = provider.fetch(&spec, &cancel).await.unwrap();
        assert_eq!(signal.direction, Direction::Neutral);
        assert!(signal.quality.incomplete);
    }

    #[tokio::test]
    async fn steady_uptrend_votes_long() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.5).collect();
        let provider = provider_with_closes(&closes);
        let spec = SymbolSpec::equity("TEST");
        let cancel = CancellationToken::new();
        let signal = provider.fetch(&spec, &cancel).await.unwrap();
        // A relentless rise drives RSI to overbought, which the vote either
        // rides (LONG) or stands aside from (NEUTRAL) — never SHORT.
        assert_ne!(signal.direction, Direction::Short);
        assert!(signal.quality.clean());
        assert!(signal.indicative_price.is_some());
    }

    #[test]
    fn downtrend_vote_is_short() {
        // Decline with periodic relief bounces so RSI stays off the floor.
        let mut closes: Vec<f64> = Vec::new();
        for i in 0..60 {
            let base = 200.0 - i as f64 * 0.4;
            closes.push(base + if i % 3 == 0 { 1.5 } else { 0.0 });
        }
        let (dir, conf) = TechnicalProvider::vote(&closes);
        assert_eq!(dir, Direction::Short);
        assert!(conf >= 65.0);
    }

    #[test]
    fn flat_series_is_neutral() {
        let closes = vec![100.0; 60];
        let (dir, _) = TechnicalProvider::vote(&closes);
        assert_eq!(dir, Direction::Neutral);
    }
}
