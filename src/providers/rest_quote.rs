// =============================================================================
// REST Quote Provider — market-data adapter over a simple quote endpoint
// =============================================================================
//
// Two instances of this adapter (different upstreams) form the primary
// market-data race; further instances may be registered as SECONDARY_MARKET.
//
// Wire shape expected from `GET {base_url}/v1/quote?symbol=S`:
//
//   { "symbol": "NVDA", "price": 450.12, "change_pct": 1.8, "ts": 1710000000000 }
//
// `change_pct` (day move, percent) is optional; when present it seeds a weak
// directional lean so the quote contributes more than a bare price.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;
use crate::providers::{DataProvider, ProviderKind, ProviderSignal};
use crate::types::{AssetClass, Direction, SymbolSpec};

/// Day move below which the quote stays NEUTRAL (percent).
const DIRECTION_DEADBAND_PCT: f64 = 0.25;
/// Base confidence of a directional lean from a bare quote.
const BASE_CONFIDENCE: f64 = 55.0;

#[derive(Debug, Deserialize)]
struct QuoteWire {
    #[allow(dead_code)]
    symbol: Option<String>,
    price: f64,
    #[serde(default)]
    change_pct: Option<f64>,
    /// Upstream quote timestamp, unix milliseconds.
    #[serde(default)]
    ts: Option<i64>,
}

/// REST market-data adapter. `kind` distinguishes the primary race pair from
/// secondary confirmation sources.
pub struct RestQuoteProvider {
    id: String,
    kind: ProviderKind,
    base_url: String,
    client: reqwest::Client,
    /// Quotes older than this (upstream timestamp) are flagged stale.
    max_quote_age_ms: i64,
    crypto_capable: bool,
}

impl RestQuoteProvider {
    pub fn new(
        id: impl Into<String>,
        kind: ProviderKind,
        base_url: impl Into<String>,
        crypto_capable: bool,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            max_quote_age_ms: 30_000,
            crypto_capable,
        }
    }

    fn map_status(status: reqwest::StatusCode) -> ProviderError {
        match status.as_u16() {
            429 => ProviderError::RateLimited,
            401 | 403 => ProviderError::Auth,
            404 => ProviderError::UnsupportedSymbol(String::new()),
            s if s >= 500 => ProviderError::Upstream5xx { status: s },
            s => ProviderError::Malformed(format!("unexpected status {s}")),
        }
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteWire, ProviderError> {
        let url = format!("{}/v1/quote", self.base_url);
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
        if !status.is_success() {
            let err = Self::map_status(status);
            return Err(match err {
                ProviderError::UnsupportedSymbol(_) => {
                    ProviderError::UnsupportedSymbol(symbol.to_string())
                }
                other => other,
            });
        }

        resp.json::<QuoteWire>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl DataProvider for RestQuoteProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn supports_asset_class(&self, class: AssetClass) -> bool {
        match class {
            AssetClass::Equity => true,
            AssetClass::Crypto => self.crypto_capable,
        }
    }

    async fn fetch(
        &self,
        symbol: &SymbolSpec,
        cancel: &CancellationToken,
    ) -> Result<ProviderSignal, ProviderError> {
        let wire = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            quote = self.fetch_quote(&symbol.symbol) => quote?,
        };

        if wire.price <= 0.0 {
            return Err(ProviderError::Malformed(format!(
                "non-positive price {} for {}",
                wire.price, symbol.symbol
            )));
        }

        let (direction, confidence) = match wire.change_pct {
            Some(chg) if chg.abs() >= DIRECTION_DEADBAND_PCT => {
                let dir = if chg > 0.0 { Direction::Long } else { Direction::Short };
                // Stronger day moves lean harder, capped well short of the
                // analytic providers.
                (dir, BASE_CONFIDENCE + (chg.abs() * 4.0).min(20.0))
            }
            _ => (Direction::Neutral, BASE_CONFIDENCE),
        };

        let mut signal = ProviderSignal::new(&self.id, &symbol.symbol, direction, confidence)
            .with_price(wire.price);

        if let Some(ts) = wire.ts {
            let age = Utc::now().timestamp_millis() - ts;
            if age > self.max_quote_age_ms {
                signal.quality.stale = true;
            }
        }

        debug!(
            provider = %self.id,
            symbol = %symbol.symbol,
            price = wire.price,
            direction = %signal.direction,
            "quote fetched"
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

    #[test]
    fn status_mapping() {
        assert_eq!(
            RestQuoteProvider::map_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            ProviderError::RateLimited
        );
        assert_eq!(
            RestQuoteProvider::map_status(reqwest::StatusCode::UNAUTHORIZED),
            ProviderError::Auth
        );
        assert_eq!(
            RestQuoteProvider::map_status(reqwest::StatusCode::BAD_GATEWAY),
            ProviderError::Upstream5xx { status: 502 }
        );
        assert!(matches!(
            RestQuoteProvider::map_status(reqwest::StatusCode::NOT_FOUND),
            ProviderError::UnsupportedSymbol(_)
        ));
    }

    #[test]
    fn asset_class_routing() {
        let equities_only =
            RestQuoteProvider::new("alpha", ProviderKind::PrimaryMarket, "http://x", false);
        assert!(equities_only.supports_asset_class(AssetClass::Equity));
        assert!(!equities_only.supports_asset_class(AssetClass::Crypto));

        let both = RestQuoteProvider::new("beacon", ProviderKind::PrimaryMarket, "http://x", true);
        assert!(both.supports_asset_class(AssetClass::Crypto));
    }

    #[test]
    fn wire_parses_with_optional_fields() {
        let wire: QuoteWire =
            serde_json::from_str(r#"{"symbol":"NVDA","price":450.0}"#).unwrap();
        assert_eq!(wire.price, 450.0);
        assert!(wire.change_pct.is_none());
        assert!(wire.ts.is_none());
    }
}
