// =============================================================================
// Risk Gate — seven ordered pre-trade validation layers
// =============================================================================
//
// Layer order matters; the first failing layer reports its reason and the
// rest are skipped:
//
//   1. Account status     — global pause, broker block
//   2. Profile rules      — min confidence, position cap, allow/deny lists
//   3. Daily loss limit   — breach also pauses until the session boundary
//   4. Drawdown           — breach also pauses until the session boundary
//   5. Buying power       — sized notional vs buffered buying power
//   6. Position policy    — no stacking onto a same-direction position
//                           (opposite direction is the execution engine's
//                           close-or-flip path, not a rejection here)
//   7. Correlation cap    — bounded positions per correlation bucket
//
// The gate holds no mutable state beyond configuration: account and position
// snapshots are passed in by the caller, and pause transitions go through
// the shared PauseState handle.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{EngineConfig, ProfileRules};
use crate::error::RejectReason;
use crate::risk::PauseState;
use crate::types::{Account, Position, PositionSide, TradeAction};

/// The trade the gate is asked to approve.
#[derive(Debug, Clone)]
pub struct TradeRequest<'a> {
    pub symbol: &'a str,
    pub action: TradeAction,
    /// Post-regime confidence of the underlying signal.
    pub confidence: f64,
    pub entry_price: f64,
    /// Sized notional (entry price × quantity).
    pub notional: f64,
}

/// Configuration slice the gate evaluates against.
#[derive(Debug, Clone)]
pub struct RiskGate {
    daily_loss_limit_pct: f64,
    max_drawdown_pct: f64,
    margin_buffer_pct: f64,
    max_correlated_positions: u32,
    correlation_buckets: HashMap<String, String>,
    profile: Option<ProfileRules>,
}

impl RiskGate {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            daily_loss_limit_pct: cfg.daily_loss_limit_pct,
            max_drawdown_pct: cfg.max_drawdown_pct,
            margin_buffer_pct: cfg.margin_buffer_pct,
            max_correlated_positions: cfg.max_correlated_positions,
            correlation_buckets: cfg.correlation_buckets.clone(),
            profile: cfg.profile.clone(),
        }
    }

    /// Run all seven layers in order. `Ok(())` allows the trade.
    pub fn check(
        &self,
        req: &TradeRequest<'_>,
        account: &Account,
        positions: &[Position],
        pause: &PauseState,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        // ── 1. Account status ───────────────────────────────────────────
        if pause.is_paused(now) {
            return Err(RejectReason::TradingPaused);
        }
        if account.blocked {
            return Err(RejectReason::AccountBlocked);
        }

        // ── 2. Profile rules ────────────────────────────────────────────
        if let Some(profile) = &self.profile {
            if req.confidence < profile.min_confidence {
                return Err(RejectReason::BelowProfileConfidence);
            }
            if positions.len() as u32 >= profile.max_concurrent_positions {
                return Err(RejectReason::MaxConcurrentPositions);
            }
            if profile.denied_symbols.iter().any(|s| s == req.symbol) {
                return Err(RejectReason::SymbolDenied);
            }
            if !profile.allowed_symbols.is_empty()
                && !profile.allowed_symbols.iter().any(|s| s == req.symbol)
            {
                return Err(RejectReason::SymbolDenied);
            }
        }

        // ── 3. Daily loss limit ─────────────────────────────────────────
        if account.day_pnl_pct <= -self.daily_loss_limit_pct {
            warn!(
                day_pnl_pct = account.day_pnl_pct,
                limit = self.daily_loss_limit_pct,
                "daily loss limit breached"
            );
            pause.pause_until_next_session("daily loss limit breached", now);
            return Err(RejectReason::DailyLossLimit);
        }

        // ── 4. Drawdown protection ──────────────────────────────────────
        if account.peak_equity > 0.0 {
            let drawdown = (account.peak_equity - account.equity) / account.peak_equity;
            if drawdown > self.max_drawdown_pct {
                warn!(
                    drawdown = drawdown,
                    limit = self.max_drawdown_pct,
                    "drawdown limit breached"
                );
                pause.pause_until_next_session("drawdown limit breached", now);
                return Err(RejectReason::DrawdownLimit);
            }
        }

        // ── 5. Buying power ─────────────────────────────────────────────
        let usable = account.buying_power * (1.0 - self.margin_buffer_pct);
        if req.notional > usable {
            debug!(
                notional = req.notional,
                usable,
                "insufficient buffered buying power"
            );
            return Err(RejectReason::InsufficientBuyingPower);
        }

        // ── 6. Existing-position policy ─────────────────────────────────
        let intended_side = match req.action {
            TradeAction::Buy => PositionSide::Long,
            TradeAction::Sell => PositionSide::Short,
        };
        if positions
            .iter()
            .any(|p| p.symbol == req.symbol && p.side == intended_side)
        {
            return Err(RejectReason::ExistingPositionSameSide);
        }

        // ── 7. Correlation cap ──────────────────────────────────────────
        if let Some(bucket) = self.correlation_buckets.get(req.symbol) {
            let in_bucket = positions
                .iter()
                .filter(|p| {
                    p.symbol != req.symbol
                        && self.correlation_buckets.get(&p.symbol) == Some(bucket)
                })
                .count() as u32;
            if in_bucket >= self.max_correlated_positions {
                debug!(bucket = %bucket, in_bucket, "correlation bucket full");
                return Err(RejectReason::CorrelationCap);
            }
        }

        Ok(())
    }
}
