// =============================================================================
// Data Provider interface — one adapter per upstream market/analytic source
// =============================================================================
//
// Adapters convert their native payloads into `ProviderSignal` on their side
// of the boundary; the engine never sees provider wire formats. Every fetch
// accepts a cancellation token the cycle enforces on its deadline.
// =============================================================================

pub mod health;
pub mod registry;
pub mod rest_quote;
pub mod score_feed;
pub mod technical;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::types::{AssetClass, Direction, SymbolSpec};

pub use health::{HealthStatus, ProviderHealth, ProviderHealthSnapshot};
pub use registry::ProviderRegistry;

// ---------------------------------------------------------------------------
// Provider kinds
// ---------------------------------------------------------------------------

/// What role a provider plays in the panel. Affects default weighting and
/// which providers enter the first-success market-data race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    PrimaryMarket,
    SecondaryMarket,
    Technical,
    Sentiment,
    Ai,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryMarket => write!(f, "PRIMARY_MARKET"),
            Self::SecondaryMarket => write!(f, "SECONDARY_MARKET"),
            Self::Technical => write!(f, "TECHNICAL"),
            Self::Sentiment => write!(f, "SENTIMENT"),
            Self::Ai => write!(f, "AI"),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider signal
// ---------------------------------------------------------------------------

/// Quality annotations attached by the adapter. Signals failing any flag are
/// dropped before consensus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityFlags {
    /// Data was older than the adapter's own freshness bound.
    #[serde(default)]
    pub stale: bool,
    /// Required upstream fields were missing.
    #[serde(default)]
    pub incomplete: bool,
    /// A value fell outside plausible bounds (negative price, >100 score).
    #[serde(default)]
    pub out_of_bounds: bool,
}

impl QualityFlags {
    pub fn clean(&self) -> bool {
        !self.stale && !self.incomplete && !self.out_of_bounds
    }
}

/// What one provider returned for one symbol in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSignal {
    pub provider_id: String,
    pub symbol: String,
    pub fetched_at: DateTime<Utc>,
    pub direction: Direction,
    /// Confidence in [0, 100]; clamped at construction.
    pub confidence: f64,
    /// Reference price the provider evaluated at, when it has one.
    #[serde(default)]
    pub indicative_price: Option<f64>,
    #[serde(default)]
    pub quality: QualityFlags,
}

impl ProviderSignal {
    pub fn new(
        provider_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        confidence: f64,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            symbol: symbol.into(),
            fetched_at: Utc::now(),
            direction,
            confidence: confidence.clamp(0.0, 100.0),
            indicative_price: None,
            quality: QualityFlags::default(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        if price > 0.0 {
            self.indicative_price = Some(price);
        } else {
            self.quality.out_of_bounds = true;
        }
        self
    }

    /// Age relative to `now` in milliseconds (zero if the clock went
    /// backwards).
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.fetched_at).num_milliseconds().max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// A single market-data or analytic source.
///
/// Implementations must return within their configured timeout and respect
/// `cancel`; a cancelled fetch returns `ProviderError::Cancelled` promptly
/// and commits no partial state.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Stable unique id; also the key for weights, rate limits, and health.
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn supports_asset_class(&self, class: AssetClass) -> bool;

    async fn fetch(
        &self,
        symbol: &SymbolSpec,
        cancel: &CancellationToken,
    ) -> Result<ProviderSignal, ProviderError>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped_at_construction() {
        let s = ProviderSignal::new("p", "NVDA", Direction::Long, 150.0);
        assert_eq!(s.confidence, 100.0);
        let s = ProviderSignal::new("p", "NVDA", Direction::Short, -5.0);
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn non_positive_price_flags_out_of_bounds() {
        let s = ProviderSignal::new("p", "NVDA", Direction::Long, 50.0).with_price(0.0);
        assert!(s.indicative_price.is_none());
        assert!(!s.quality.clean());
        let s = ProviderSignal::new("p", "NVDA", Direction::Long, 50.0).with_price(450.0);
        assert_eq!(s.indicative_price, Some(450.0));
        assert!(s.quality.clean());
    }

    #[test]
    fn age_never_negative() {
        let mut s = ProviderSignal::new("p", "NVDA", Direction::Neutral, 10.0);
        s.fetched_at = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(s.age_ms(Utc::now()), 0);
    }
}
