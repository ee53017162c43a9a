// =============================================================================
// Error taxonomy — transient vs logical vs fatal, per component boundary
// =============================================================================
//
// Components return typed errors at their boundaries; `anyhow` is used only
// for application plumbing (startup, config IO). The classification helpers
// (`is_transient`, `is_queueable`) drive retry, circuit-breaker, and
// deferred-queue policy, so they live next to the enums they classify.
// =============================================================================

use thiserror::Error;

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Failure modes of a `DataProvider::fetch` call. Every variant updates the
/// provider's rolling health window.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,

    #[error("provider rate limit exhausted")]
    RateLimited,

    #[error("provider authentication failed")]
    Auth,

    #[error("provider upstream returned {status}")]
    Upstream5xx { status: u16 },

    #[error("provider payload malformed: {0}")]
    Malformed(String),

    #[error("symbol not supported by provider: {0}")]
    UnsupportedSymbol(String),

    /// Short-circuit response while the provider's circuit breaker is open.
    #[error("provider upstream down (breaker open)")]
    UpstreamDown,

    #[error("fetch cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient errors count toward the breaker but are individually
    /// recoverable on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Upstream5xx { .. }
        )
    }

    /// Errors that should trip the circuit breaker when repeated.
    /// Cancellation is the caller's doing and never counts against the
    /// provider.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::UpstreamDown)
    }
}

// ---------------------------------------------------------------------------
// Broker errors
// ---------------------------------------------------------------------------

/// Failure modes surfaced by a `Broker` adapter, normalized from the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker request timed out")]
    Timeout,

    #[error("broker rate limit exhausted")]
    RateLimited,

    #[error("broker upstream returned {status}")]
    Upstream5xx { status: u16 },

    #[error("broker authentication failed")]
    Auth,

    #[error("insufficient buying power")]
    InsufficientBuyingPower,

    #[error("market closed")]
    MarketClosed,

    #[error("symbol not tradable")]
    SymbolNotTradable,

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    UnknownOrder(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Transient errors are retried with backoff inside the execution engine.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Upstream5xx { .. } | Self::Transport(_)
        )
    }

    /// Errors worth a deferred re-attempt once account state changes.
    pub fn is_queueable(&self) -> bool {
        self.is_transient() || matches!(self, Self::InsufficientBuyingPower | Self::MarketClosed)
    }

    /// Fatal errors halt the owning subsystem rather than retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth)
    }
}

// ---------------------------------------------------------------------------
// Risk-gate rejection reasons
// ---------------------------------------------------------------------------

/// Why the risk gate (or sizer) refused a trade. Stable `code()` strings are
/// what operators and the deferred queue see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("trading is paused")]
    TradingPaused,

    #[error("account is blocked by the broker")]
    AccountBlocked,

    #[error("confidence below profile minimum")]
    BelowProfileConfidence,

    #[error("maximum concurrent positions reached")]
    MaxConcurrentPositions,

    #[error("symbol is denied by profile rules")]
    SymbolDenied,

    #[error("daily loss limit reached")]
    DailyLossLimit,

    #[error("drawdown limit reached")]
    DrawdownLimit,

    #[error("insufficient buying power")]
    InsufficientBuyingPower,

    #[error("existing position on the same side")]
    ExistingPositionSameSide,

    #[error("correlation bucket is full")]
    CorrelationCap,

    #[error("sized quantity below instrument minimum")]
    QtyBelowMinimum,

    #[error("market closed for this asset class")]
    MarketClosed,
}

impl RejectReason {
    /// Stable machine-readable code for events and operator responses.
    pub fn code(self) -> &'static str {
        match self {
            Self::TradingPaused => "TRADING_PAUSED",
            Self::AccountBlocked => "ACCOUNT_BLOCKED",
            Self::BelowProfileConfidence => "BELOW_CONFIDENCE_THRESHOLD",
            Self::MaxConcurrentPositions => "MAX_CONCURRENT_POSITIONS",
            Self::SymbolDenied => "SYMBOL_DENIED",
            Self::DailyLossLimit => "DAILY_LOSS_LIMIT",
            Self::DrawdownLimit => "DRAWDOWN_LIMIT",
            Self::InsufficientBuyingPower => "INSUFFICIENT_BUYING_POWER",
            Self::ExistingPositionSameSide => "EXISTING_POSITION_SAME_SIDE",
            Self::CorrelationCap => "CORRELATION_CAP",
            Self::QtyBelowMinimum => "QTY_BELOW_MINIMUM",
            Self::MarketClosed => "MARKET_CLOSED",
        }
    }

    /// Logical rejections that are still worth a deferred re-attempt: the
    /// account may regain buying power, the market will reopen. Everything
    /// else is final for this signal.
    pub fn is_queueable(self) -> bool {
        matches!(self, Self::InsufficientBuyingPower | Self::MarketClosed)
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Failures of the append-only signal store. `AppendOnly` and `ChainBroken`
/// are integrity-class: the caller pauses emission and alerts.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("signals are append-only: {0}")]
    AppendOnly(String),

    #[error("hash chain broken at {signal_id}: {detail}")]
    ChainBroken { signal_id: String, detail: String },

    #[error("signal failed validation: {0}")]
    InvalidSignal(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::Upstream5xx { status: 503 }.is_transient());
        assert!(!ProviderError::Auth.is_transient());
        assert!(!ProviderError::Malformed("x".into()).is_transient());
    }

    #[test]
    fn cancellation_never_counts_against_breaker() {
        assert!(!ProviderError::Cancelled.counts_against_breaker());
        assert!(!ProviderError::UpstreamDown.counts_against_breaker());
        assert!(ProviderError::Timeout.counts_against_breaker());
    }

    #[test]
    fn queueable_broker_errors() {
        assert!(BrokerError::InsufficientBuyingPower.is_queueable());
        assert!(BrokerError::MarketClosed.is_queueable());
        assert!(BrokerError::Upstream5xx { status: 502 }.is_queueable());
        assert!(!BrokerError::SymbolNotTradable.is_queueable());
        assert!(!BrokerError::Auth.is_queueable());
    }

    #[test]
    fn queueable_reject_reasons() {
        assert!(RejectReason::InsufficientBuyingPower.is_queueable());
        assert!(RejectReason::MarketClosed.is_queueable());
        assert!(!RejectReason::ExistingPositionSameSide.is_queueable());
        assert!(!RejectReason::SymbolDenied.is_queueable());
        assert!(!RejectReason::CorrelationCap.is_queueable());
    }

    #[test]
    fn reject_codes_are_stable() {
        assert_eq!(
            RejectReason::InsufficientBuyingPower.code(),
            "INSUFFICIENT_BUYING_POWER"
        );
        assert_eq!(
            RejectReason::ExistingPositionSameSide.code(),
            "EXISTING_POSITION_SAME_SIDE"
        );
    }
}
