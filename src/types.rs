// =============================================================================
// Shared types used across the Meridian signal engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Symbols & asset classes
// ---------------------------------------------------------------------------

/// Asset class of a traded symbol. Determines trading-hours applicability,
/// quantity granularity, and provider routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Crypto,
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equity => write!(f, "equity"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

/// A configured symbol together with its asset class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub asset_class: AssetClass,
}

impl SymbolSpec {
    pub fn new(symbol: impl Into<String>, asset_class: AssetClass) -> Self {
        Self {
            symbol: symbol.into(),
            asset_class,
        }
    }

    pub fn equity(symbol: impl Into<String>) -> Self {
        Self::new(symbol, AssetClass::Equity)
    }

    pub fn crypto(symbol: impl Into<String>) -> Self {
        Self::new(symbol, AssetClass::Crypto)
    }
}

// ---------------------------------------------------------------------------
// Directions & actions
// ---------------------------------------------------------------------------

/// Directional vote carried by a provider signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// Numeric vote: +1 long, -1 short, 0 neutral.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
            Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Action carried by an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Regimes
// ---------------------------------------------------------------------------

/// Coarse market-state classification. A single regime applies per
/// `(symbol, cycle)` and shifts the minimum confidence required to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Trending,
    Consolidation,
    Volatile,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Consolidation => write!(f, "CONSOLIDATION"),
            Self::Volatile => write!(f, "VOLATILE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal record
// ---------------------------------------------------------------------------

/// An emitted trading decision. Content-addressed and append-only: once
/// written to the store it is never updated or deleted, and `signal_id` is
/// the SHA-256 of the canonical serialization of every other content field.
///
/// Price geometry invariants (enforced before emission):
///   BUY:  stop_price < entry_price < target_price
///   SELL: target_price < entry_price < stop_price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Content hash (hex SHA-256). Unique.
    pub signal_id: String,
    /// `signal_id` of the previous signal in emission order, or empty for the
    /// first record. Forms a tamper-evident chain.
    pub prev_signal_hash: String,
    pub symbol: String,
    pub action: TradeAction,
    pub entry_price: f64,
    pub target_price: f64,
    pub stop_price: f64,
    /// Post-regime, post-calibration confidence in [0, 100].
    pub confidence: f64,
    pub regime: Regime,
    /// Provider ids that contributed to the consensus, sorted.
    pub sources_used: Vec<String>,
    /// Human-readable reasoning, at least 20 characters.
    pub rationale: String,
    pub generation_latency_ms: u64,
    /// RFC 3339 UTC, millisecond precision.
    pub server_timestamp: String,
    /// RFC 3339 UTC, millisecond precision.
    pub created_at: String,
    /// `created_at` + retention. Emitted for downstream archival; this engine
    /// never deletes on it.
    pub retention_expires_at: String,
}

impl Signal {
    /// Geometry check per the invariants above. A signal violating this must
    /// be refused before it reaches the store.
    pub fn prices_valid(&self) -> bool {
        match self.action {
            TradeAction::Buy => {
                self.stop_price < self.entry_price && self.entry_price < self.target_price
            }
            TradeAction::Sell => {
                self.target_price < self.entry_price && self.entry_price < self.stop_price
            }
        }
    }
}

/// Format a timestamp the way every signal field expects it: RFC 3339 UTC
/// with millisecond precision and a trailing `Z`.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Broker-facing types (normalized)
// ---------------------------------------------------------------------------

/// Explicit position side. Broker adapters normalize their native
/// representation (signed quantity or enum) into this plus a positive `qty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// An open position, normalized. `qty` is always positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub opened_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
}

impl OrderStatus {
    /// True once the broker will make no further transitions on this order
    /// without an explicit cancel.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Canceled)
    }

    /// True when polling may stop: the order is either working at the broker
    /// or terminal.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Filled | Self::Rejected | Self::Canceled
        )
    }
}

/// An order as reported by the broker, normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<f64>,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(default)]
    pub filled_avg_price: Option<f64>,
}

/// Account snapshot, normalized across broker adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub equity: f64,
    pub buying_power: f64,
    /// Realized + unrealized day P&L as a signed fraction of equity
    /// (e.g. -0.02 = down 2 % on the day).
    pub day_pnl_pct: f64,
    /// Highest equity observed this session (drawdown reference).
    pub peak_equity: f64,
    /// Broker-side restriction flag (e.g. PDT block, margin call).
    #[serde(default)]
    pub blocked: bool,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn signal(action: TradeAction, entry: f64, target: f64, stop: f64) -> Signal {
        Signal {
            signal_id: String::new(),
            prev_signal_hash: String::new(),
            symbol: "NVDA".into(),
            action,
            entry_price: entry,
            target_price: target,
            stop_price: stop,
            confidence: 90.0,
            regime: Regime::Trending,
            sources_used: vec![],
            rationale: "test rationale with enough length".into(),
            generation_latency_ms: 1,
            server_timestamp: "2025-01-01T00:00:00.000Z".into(),
            created_at: "2025-01-01T00:00:00.000Z".into(),
            retention_expires_at: "2025-01-31T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn buy_geometry_requires_stop_below_entry_below_target() {
        assert!(signal(TradeAction::Buy, 450.0, 472.5, 436.5).prices_valid());
        assert!(!signal(TradeAction::Buy, 450.0, 436.5, 472.5).prices_valid());
    }

    #[test]
    fn sell_geometry_requires_target_below_entry_below_stop() {
        assert!(signal(TradeAction::Sell, 450.0, 441.0, 459.0).prices_valid());
        // Long-style geometry on a SELL is invalid.
        assert!(!signal(TradeAction::Sell, 450.0, 459.0, 441.0).prices_valid());
    }

    #[test]
    fn direction_signs() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
        assert_eq!(Direction::Neutral.sign(), 0.0);
    }

    #[test]
    fn format_ts_is_millisecond_utc() {
        let ts = chrono::DateTime::parse_from_rfc3339("2025-06-01T12:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_ts(ts), "2025-06-01T12:30:45.123Z");
    }

    #[test]
    fn order_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Accepted.is_terminal());
        assert!(OrderStatus::Accepted.is_settled());
        assert!(!OrderStatus::New.is_settled());
    }
}
