// =============================================================================
// Score Feed Provider — adapter over sentiment / model-inference endpoints
// =============================================================================
//
// Serves both the SENTIMENT and AI panel slots: any upstream that reduces a
// symbol to a signed score plus its own confidence fits this shape.
//
// Wire shape expected from `GET {base_url}/v1/score?symbol=S`:
//
//   { "symbol": "NVDA", "score": 0.62, "confidence": 78.0, "as_of": 1710000000000 }
//
// `score` in [-1, 1]: positive bullish, negative bearish.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;
use crate::providers::{DataProvider, ProviderKind, ProviderSignal};
use crate::types::{AssetClass, Direction, SymbolSpec};

/// Scores inside the deadband carry no directional vote.
const SCORE_DEADBAND: f64 = 0.15;

#[derive(Debug, Deserialize)]
struct ScoreWire {
    #[allow(dead_code)]
    symbol: Option<String>,
    score: f64,
    #[serde(default)]
    confidence: Option<f64>,
    /// Upstream evaluation time, unix milliseconds.
    #[serde(default)]
    as_of: Option<i64>,
}

pub struct ScoreFeedProvider {
    id: String,
    kind: ProviderKind,
    base_url: String,
    client: reqwest::Client,
    max_score_age_ms: i64,
}

impl ScoreFeedProvider {
    /// `kind` must be `Sentiment` or `Ai`.
    pub fn new(id: impl Into<String>, kind: ProviderKind, base_url: impl Into<String>) -> Self {
        debug_assert!(matches!(kind, ProviderKind::Sentiment | ProviderKind::Ai));
        Self {
            id: id.into(),
            kind,
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            max_score_age_ms: 10 * 60 * 1000,
        }
    }

    /// Convert a wire score into a directional vote. Out-of-range scores are
    /// flagged rather than clamped so the quality gate can drop them.
    fn interpret(wire: &ScoreWire) -> (Direction, f64, bool) {
        let out_of_bounds = !(-1.0..=1.0).contains(&wire.score);
        let score = wire.score.clamp(-1.0, 1.0);

        let direction = if score.abs() < SCORE_DEADBAND {
            Direction::Neutral
        } else if score > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        // Upstream confidence wins when present; otherwise derive it from the
        // score magnitude.
        let confidence = wire
            .confidence
            .unwrap_or_else(|| score.abs() * 100.0)
            .clamp(0.0, 100.0);

        (direction, confidence, out_of_bounds)
    }

    async fn fetch_score(&self, symbol: &str) -> Result<ScoreWire, ProviderError> {
        let url = format!("{}/v1/score", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Upstream5xx { status: 599 }
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<ScoreWire>()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()));
        }
        match status.as_u16() {
            429 => Err(ProviderError::RateLimited),
            401 | 403 => Err(ProviderError::Auth),
            404 => Err(ProviderError::UnsupportedSymbol(symbol.to_string())),
            s if s >= 500 => Err(ProviderError::Upstream5xx { status: s }),
            s => Err(ProviderError::Malformed(format!("unexpected status {s}"))),
        }
    }
}

#[async_trait]
impl DataProvider for ScoreFeedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn supports_asset_class(&self, _class: AssetClass) -> bool {
        true
    }

    async fn fetch(
        &self,
        symbol: &SymbolSpec,
        cancel: &CancellationToken,
    ) -> Result<ProviderSignal, ProviderError> {
        let wire = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            score = self.fetch_score(&symbol.symbol) => score?,
        };

        let (direction, confidence, out_of_bounds) = Self::interpret(&wire);

        let mut signal = ProviderSignal::new(&self.id, &symbol.symbol, direction, confidence);
        signal.quality.out_of_bounds = out_of_bounds;

        if let Some(as_of) = wire.as_of {
            let age = Utc::now().timestamp_millis() - as_of;
            if age > self.max_score_age_ms {
                signal.quality.stale = true;
            }
        }

        debug!(
            provider = %self.id,
            symbol = %symbol.symbol,
            score = wire.score,
            direction = %signal.direction,
            confidence = signal.confidence,
            "score fetched"
        );
        Ok(signal)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn wire(score: f64, confidence: Option<f64>) -> ScoreWire {
        ScoreWire {
            symbol: None,
            score,
            confidence,
            as_of: None,
        }
    }

    #[test]
    fn positive_score_votes_long() {
        let (dir, conf, oob) = ScoreFeedProvider::interpret(&wire(0.62, Some(78.0)));
        assert_eq!(dir, Direction::Long);
        assert_eq!(conf, 78.0);
        assert!(!oob);
    }

    #[test]
    fn negative_score_votes_short_with_derived_confidence() {
        let (dir, conf, _) = ScoreFeedProvider::interpret(&wire(-0.5, None));
        assert_eq!(dir, Direction::Short);
        assert!((conf - 50.0).abs() < 1e-12);
    }

    #[test]
    fn deadband_is_neutral() {
        let (dir, _, _) = ScoreFeedProvider::interpret(&wire(0.1, Some(90.0)));
        assert_eq!(dir, Direction::Neutral);
    }

    #[test]
    fn out_of_range_score_is_flagged() {
        let (dir, _, oob) = ScoreFeedProvider::interpret(&wire(3.5, Some(90.0)));
        assert_eq!(dir, Direction::Long);
        assert!(oob);
    }
}
