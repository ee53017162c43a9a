// =============================================================================
// Engine Configuration — hot-reloadable settings with atomic save
// =============================================================================
//
// Every tunable of the signal pipeline, risk gate, execution engine, and
// deferred queue lives here. Saves go through a fsynced scratch file that is
// renamed over the target, so a crash mid-write never corrupts the file.
// Every field carries a serde default so older config files keep loading as
// fields are added.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Regime, SymbolSpec};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_cycle_interval_ms() -> u64 {
    5000
}

fn default_symbols() -> Vec<SymbolSpec> {
    vec![
        SymbolSpec::equity("NVDA"),
        SymbolSpec::equity("AAPL"),
        SymbolSpec::equity("SPY"),
        SymbolSpec::crypto("BTCUSD"),
        SymbolSpec::crypto("ETHUSD"),
    ]
}

fn default_min_price_change_pct() -> f64 {
    0.005
}

fn default_regime_thresholds() -> HashMap<Regime, f64> {
    HashMap::from([
        (Regime::Trending, 85.0),
        (Regime::Consolidation, 90.0),
        (Regime::Volatile, 88.0),
    ])
}

fn default_regime_fallback_threshold() -> f64 {
    75.0
}

fn default_profit_target_pct() -> f64 {
    0.05
}

fn default_stop_loss_pct() -> f64 {
    0.03
}

fn default_position_size_pct() -> f64 {
    0.10
}

fn default_max_position_size_pct() -> f64 {
    0.15
}

fn default_margin_buffer_pct() -> f64 {
    0.05
}

fn default_max_drawdown_pct() -> f64 {
    0.10
}

fn default_daily_loss_limit_pct() -> f64 {
    0.03
}

fn default_max_correlated_positions() -> u32 {
    2
}

fn default_provider_weight() -> f64 {
    1.0
}

fn default_provider_rate_limit() -> f64 {
    5.0
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_provider_stale_after_ms() -> u64 {
    60_000
}

fn default_provider_confidence_floor() -> f64 {
    20.0
}

fn default_rate_limit_max_wait_ms() -> u64 {
    1000
}

fn default_market_race_timeout_ms() -> u64 {
    30_000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_window_ms() -> u64 {
    60_000
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_consensus_cache_ttl_ms() -> u64 {
    120_000
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    500
}

fn default_order_deadline_ms() -> u64 {
    5000
}

fn default_queue_max_age_ms() -> u64 {
    15 * 60 * 1000
}

fn default_queue_max_attempts() -> u32 {
    5
}

fn default_queue_backoff_base_ms() -> u64 {
    1000
}

fn default_queue_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_price_drift_pct() -> f64 {
    0.005
}

fn default_account_cache_ttl_ms() -> u64 {
    30_000
}

fn default_positions_cache_ttl_ms() -> u64 {
    10_000
}

fn default_volatility_cache_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_monitor_poll_interval_ms() -> u64 {
    60_000
}

fn default_processor_wake_interval_ms() -> u64 {
    30_000
}

fn default_processor_batch_size() -> u32 {
    10
}

fn default_min_bp_to_retry() -> f64 {
    100.0
}

fn default_cycle_concurrency_cap() -> usize {
    6
}

fn default_retention_days() -> i64 {
    30
}

fn default_chain_verify_interval_ms() -> u64 {
    10 * 60 * 1000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Profile rules (optional stricter overlay for the risk gate)
// =============================================================================

/// Stricter account-profile rules applied as risk-gate layer two when
/// present. This is configuration, not a separate subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRules {
    /// Minimum post-regime confidence to execute (e.g. 82.0).
    pub min_confidence: f64,
    /// Maximum concurrently open positions.
    pub max_concurrent_positions: u32,
    /// If non-empty, only these symbols may trade.
    #[serde(default)]
    pub allowed_symbols: Vec<String>,
    /// Symbols that may never trade.
    #[serde(default)]
    pub denied_symbols: Vec<String>,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Cycle --------------------------------------------------------------
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Symbols the engine watches, each tagged with its asset class.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<SymbolSpec>,

    /// Fractional price move below which a cycle reuses the previous signal
    /// (0.005 = 0.5 %).
    #[serde(default = "default_min_price_change_pct")]
    pub min_price_change_pct: f64,

    /// Parallel symbol evaluations per cycle.
    #[serde(default = "default_cycle_concurrency_cap")]
    pub cycle_concurrency_cap: usize,

    // --- Regime gating ------------------------------------------------------
    /// Minimum post-calibration confidence per regime.
    #[serde(default = "default_regime_thresholds")]
    pub regime_thresholds: HashMap<Regime, f64>,

    /// Threshold used when no regime can be classified yet.
    #[serde(default = "default_regime_fallback_threshold")]
    pub regime_fallback_threshold: f64,

    // --- Price geometry -----------------------------------------------------
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: f64,

    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    // --- Sizing & risk ------------------------------------------------------
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: f64,

    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,

    /// Fraction of buying power held back when checking affordability.
    #[serde(default = "default_margin_buffer_pct")]
    pub margin_buffer_pct: f64,

    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,

    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: f64,

    #[serde(default = "default_max_correlated_positions")]
    pub max_correlated_positions: u32,

    /// Symbol -> correlation bucket (e.g. sector tag). Symbols absent from
    /// the map are uncorrelated.
    #[serde(default)]
    pub correlation_buckets: HashMap<String, String>,

    /// Optional stricter profile overlay.
    #[serde(default)]
    pub profile: Option<ProfileRules>,

    /// Minimum notional per crypto order (quote currency).
    #[serde(default)]
    pub crypto_min_notional: HashMap<String, f64>,

    // --- Providers ----------------------------------------------------------
    /// Provider id -> consensus weight.
    #[serde(default)]
    pub provider_weights: HashMap<String, f64>,

    /// Provider id -> token-bucket refill per second.
    #[serde(default)]
    pub provider_rate_limits: HashMap<String, f64>,

    /// Provider id -> fetch timeout in milliseconds.
    #[serde(default)]
    pub provider_timeouts: HashMap<String, u64>,

    /// Provider id -> minimum confidence for a signal to enter consensus.
    #[serde(default)]
    pub provider_confidence_floors: HashMap<String, f64>,

    /// Signals older than this are dropped as stale.
    #[serde(default = "default_provider_stale_after_ms")]
    pub provider_stale_after_ms: u64,

    /// Longest a cycle waits on a provider's rate limiter before proceeding
    /// without it.
    #[serde(default = "default_rate_limit_max_wait_ms")]
    pub rate_limit_max_wait_ms: u64,

    /// Deadline for the primary market-data race.
    #[serde(default = "default_market_race_timeout_ms")]
    pub market_race_timeout_ms: u64,

    // --- Circuit breaker ----------------------------------------------------
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_window_ms")]
    pub breaker_window_ms: u64,

    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    // --- Consensus ----------------------------------------------------------
    #[serde(default = "default_consensus_cache_ttl_ms")]
    pub consensus_cache_ttl_ms: u64,

    // --- Execution ----------------------------------------------------------
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Deadline for the main order to settle before giving up on polling.
    #[serde(default = "default_order_deadline_ms")]
    pub order_deadline_ms: u64,

    #[serde(default = "default_true")]
    pub auto_execute: bool,

    /// Close-and-reverse on an opposite-direction signal when true; close
    /// only when false.
    #[serde(default)]
    pub allow_flip: bool,

    /// Route orders to the in-memory paper broker instead of the live
    /// adapter.
    #[serde(default = "default_true")]
    pub paper_mode: bool,

    // --- Deferred queue -----------------------------------------------------
    #[serde(default = "default_queue_max_age_ms")]
    pub queue_max_age_ms: u64,

    #[serde(default = "default_queue_max_attempts")]
    pub queue_max_attempts: u32,

    #[serde(default = "default_queue_backoff_base_ms")]
    pub queue_backoff_base_ms: u64,

    #[serde(default = "default_queue_backoff_max_ms")]
    pub queue_backoff_max_ms: u64,

    /// Price drift beyond which a queued signal is expired instead of
    /// re-attempted.
    #[serde(default = "default_max_price_drift_pct")]
    pub max_price_drift_pct: f64,

    // --- Broker caches ------------------------------------------------------
    #[serde(default = "default_account_cache_ttl_ms")]
    pub account_cache_ttl_ms: u64,

    #[serde(default = "default_positions_cache_ttl_ms")]
    pub positions_cache_ttl_ms: u64,

    #[serde(default = "default_volatility_cache_ttl_ms")]
    pub volatility_cache_ttl_ms: u64,

    // --- Monitors -----------------------------------------------------------
    #[serde(default = "default_monitor_poll_interval_ms")]
    pub monitor_poll_interval_ms: u64,

    #[serde(default = "default_processor_wake_interval_ms")]
    pub processor_wake_interval_ms: u64,

    #[serde(default = "default_processor_batch_size")]
    pub processor_batch_size: u32,

    /// Buying power must cross this threshold upward to wake the queue.
    #[serde(default = "default_min_bp_to_retry")]
    pub min_bp_to_retry: f64,

    // --- Store --------------------------------------------------------------
    /// Retention horizon stamped on each signal (never acted upon here).
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_chain_verify_interval_ms")]
    pub chain_verify_interval_ms: u64,

    // --- Process ------------------------------------------------------------
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes via serde defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`. A missing file is the
    /// caller's concern (fall back to defaults); anything else names the
    /// offending file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let raw = std::fs::read(path)
            .with_context(|| format!("engine config unreadable: {}", path.display()))?;
        let config: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("engine config is not valid JSON: {}", path.display()))?;

        if config.symbols.is_empty() {
            warn!(path = %path.display(), "engine config defines no symbols; cycles will idle");
        }
        info!(
            path = %path.display(),
            symbols = config.symbols.len(),
            auto_execute = config.auto_execute,
            paper_mode = config.paper_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration crash-safely: serialize into a hidden
    /// scratch file beside the target, fsync it, then rename over the
    /// original. A half-written scratch file is removed, never promoted.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        use std::io::Write;

        let path = path.as_ref();
        let scratch_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => format!(".{name}.scratch"),
            None => ".engine_config.scratch".to_string(),
        };
        let scratch = path.with_file_name(scratch_name);

        let body = serde_json::to_vec_pretty(self).context("engine config serialization failed")?;

        let written = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&scratch)?;
            file.write_all(&body)?;
            file.sync_all()?;
            std::fs::rename(&scratch, path)
        })();

        if let Err(e) = written {
            let _ = std::fs::remove_file(&scratch);
            return Err(e)
                .with_context(|| format!("engine config save failed: {}", path.display()));
        }

        info!(path = %path.display(), bytes = body.len(), "engine config saved");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lookup helpers
    // -------------------------------------------------------------------------

    pub fn weight_for(&self, provider_id: &str) -> f64 {
        self.provider_weights
            .get(provider_id)
            .copied()
            .unwrap_or_else(default_provider_weight)
    }

    pub fn rate_limit_for(&self, provider_id: &str) -> f64 {
        self.provider_rate_limits
            .get(provider_id)
            .copied()
            .unwrap_or_else(default_provider_rate_limit)
    }

    pub fn timeout_for(&self, provider_id: &str) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.provider_timeouts
                .get(provider_id)
                .copied()
                .unwrap_or_else(default_provider_timeout_ms),
        )
    }

    pub fn confidence_floor_for(&self, provider_id: &str) -> f64 {
        self.provider_confidence_floors
            .get(provider_id)
            .copied()
            .unwrap_or_else(default_provider_confidence_floor)
    }

    /// Minimum post-calibration confidence for the given regime.
    pub fn threshold_for(&self, regime: Option<Regime>) -> f64 {
        match regime {
            Some(r) => self
                .regime_thresholds
                .get(&r)
                .copied()
                .unwrap_or(self.regime_fallback_threshold),
            None => self.regime_fallback_threshold,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetClass;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.cycle_interval_ms, 5000);
        assert_eq!(cfg.min_price_change_pct, 0.005);
        assert_eq!(cfg.market_race_timeout_ms, 30_000);
        assert_eq!(cfg.consensus_cache_ttl_ms, 120_000);
        assert_eq!(cfg.breaker_failure_threshold, 5);
        assert_eq!(cfg.breaker_cooldown_ms, 30_000);
        assert_eq!(cfg.account_cache_ttl_ms, 30_000);
        assert_eq!(cfg.positions_cache_ttl_ms, 10_000);
        assert_eq!(cfg.volatility_cache_ttl_ms, 3_600_000);
        assert_eq!(cfg.order_deadline_ms, 5000);
        assert_eq!(cfg.queue_max_age_ms, 900_000);
        assert_eq!(cfg.queue_max_attempts, 5);
        assert_eq!(cfg.queue_backoff_base_ms, 1000);
        assert!(cfg.paper_mode);
        assert!(!cfg.allow_flip);
    }

    #[test]
    fn regime_thresholds_have_fallback() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.threshold_for(Some(Regime::Trending)), 85.0);
        assert_eq!(cfg.threshold_for(Some(Regime::Consolidation)), 90.0);
        assert_eq!(cfg.threshold_for(Some(Regime::Volatile)), 88.0);
        assert_eq!(cfg.threshold_for(None), 75.0);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": [{"symbol": "TSLA", "asset_class": "equity"}],
            "auto_execute": false
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols.len(), 1);
        assert_eq!(cfg.symbols[0].symbol, "TSLA");
        assert_eq!(cfg.symbols[0].asset_class, AssetClass::Equity);
        assert!(!cfg.auto_execute);
        assert_eq!(cfg.cycle_interval_ms, 5000);
    }

    #[test]
    fn provider_lookups_fall_back_to_defaults() {
        let mut cfg = EngineConfig::default();
        cfg.provider_weights.insert("alpha".into(), 2.5);
        assert_eq!(cfg.weight_for("alpha"), 2.5);
        assert_eq!(cfg.weight_for("unknown"), 1.0);
        assert_eq!(cfg.rate_limit_for("unknown"), 5.0);
        assert_eq!(
            cfg.timeout_for("unknown"),
            std::time::Duration::from_millis(10_000)
        );
        assert_eq!(cfg.confidence_floor_for("unknown"), 20.0);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.allow_flip = true;
        cfg.position_size_pct = 0.07;
        cfg.save(&path).unwrap();

        // The scratch file is promoted, never left behind.
        assert!(!dir.path().join(".engine_config.json.scratch").exists());

        let loaded = EngineConfig::load(&path).unwrap();
        assert!(loaded.allow_flip);
        assert_eq!(loaded.position_size_pct, 0.07);
        assert_eq!(loaded.symbols.len(), cfg.symbols.len());
    }

    #[test]
    fn load_of_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineConfig::load(dir.path().join("absent.json")).is_err());
    }
}
