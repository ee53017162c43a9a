// =============================================================================
// Execution Engine — signal to protected order, with close/flip resolution
// =============================================================================
//
// Intent resolution against the current position:
//
//   none  + BUY   open LONG          LONG  + BUY   reject (no stacking)
//   none  + SELL  open SHORT         SHORT + SELL  reject (no stacking)
//   LONG  + SELL  close; flip to SHORT when allow_flip
//   SHORT + BUY   close; flip to LONG when allow_flip
//
// Submission protocol for an entry: size, risk-gate, submit the main order
// (retry with exponential backoff on transient errors), poll to settlement
// within the order deadline, then place both bracket legs concurrently. A
// failed leg is retried once; a still-missing leg logs BRACKET_INCOMPLETE
// but never blocks the other.
//
// Idempotency: one main order per signal_id, ever. The signal id also rides
// along as the broker client_order_id, so even a crash between submit and
// bookkeeping cannot double-order.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{Broker, CachedBroker, OrderRequest};
use crate::error::{BrokerError, RejectReason};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::{Metrics, RejectionCounters};
use crate::queue::SignalQueue;
use crate::risk::{PauseState, PositionSizer, RiskGate, TradeRequest};
use crate::types::{
    AssetClass, Order, OrderSide, OrderStatus, Position, PositionSide, Signal, SymbolSpec,
    TradeAction,
};

/// Poll interval while waiting for the main order to settle.
const ORDER_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Policy & outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub allow_flip: bool,
    pub max_retry_attempts: u32,
    pub base_retry_delay: Duration,
    pub order_deadline: Duration,
}

/// Result of executing one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Opened {
        order_id: String,
        qty: f64,
    },
    /// Opposite-direction signal closed the position; flips were disabled.
    ClosedOnly {
        realized_pnl: f64,
    },
    Flipped {
        realized_pnl: f64,
        order_id: String,
        qty: f64,
    },
    Rejected {
        reason: RejectReason,
        queued: bool,
    },
    /// Duplicate signal_id; nothing was submitted.
    Skipped,
    Failed {
        error: String,
        queued: bool,
    },
}

impl ExecutionOutcome {
    pub fn opened(&self) -> bool {
        matches!(self, Self::Opened { .. } | Self::Flipped { .. })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    broker: Arc<CachedBroker>,
    gate: RiskGate,
    sizer: Arc<PositionSizer>,
    queue: Arc<SignalQueue>,
    events: Arc<EventBus>,
    metrics: Arc<Metrics>,
    rejections: Arc<RejectionCounters>,
    pause: Arc<PauseState>,
    policy: ExecutionPolicy,
    asset_classes: HashMap<String, AssetClass>,
    /// signal_ids that have reached the submit stage.
    executed: Mutex<HashSet<String>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<CachedBroker>,
        gate: RiskGate,
        sizer: Arc<PositionSizer>,
        queue: Arc<SignalQueue>,
        events: Arc<EventBus>,
        metrics: Arc<Metrics>,
        rejections: Arc<RejectionCounters>,
        pause: Arc<PauseState>,
        policy: ExecutionPolicy,
        symbols: &[SymbolSpec],
    ) -> Self {
        Self {
            broker,
            gate,
            sizer,
            queue,
            events,
            metrics,
            rejections,
            pause,
            policy,
            asset_classes: symbols
                .iter()
                .map(|s| (s.symbol.clone(), s.asset_class))
                .collect(),
            executed: Mutex::new(HashSet::new()),
        }
    }

    fn spec_for(&self, symbol: &str) -> SymbolSpec {
        SymbolSpec {
            symbol: symbol.to_string(),
            asset_class: self
                .asset_classes
                .get(symbol)
                .copied()
                .unwrap_or(AssetClass::Equity),
        }
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Execute a signal. `enqueue_on_reject` is false when the queue
    /// processor is the caller — it owns re-enqueue policy itself, and a
    /// nested enqueue would loop.
    pub async fn execute(&self, signal: &Signal, enqueue_on_reject: bool) -> ExecutionOutcome {
        // One main order per signal_id, ever. Insert up front so a
        // concurrent duplicate sees it; roll back on paths that never
        // submitted.
        if !self.executed.lock().insert(signal.signal_id.clone()) {
            debug!(signal_id = %signal.signal_id, "duplicate signal; execution skipped");
            return ExecutionOutcome::Skipped;
        }

        let outcome = self.execute_inner(signal, enqueue_on_reject).await;

        match &outcome {
            ExecutionOutcome::Opened { .. }
            | ExecutionOutcome::Flipped { .. }
            | ExecutionOutcome::ClosedOnly { .. }
            | ExecutionOutcome::Skipped => {}
            // Nothing was submitted: allow a later re-attempt (queue retry).
            ExecutionOutcome::Rejected { .. } | ExecutionOutcome::Failed { .. } => {
                self.executed.lock().remove(&signal.signal_id);
            }
        }

        outcome
    }

    async fn execute_inner(&self, signal: &Signal, enqueue_on_reject: bool) -> ExecutionOutcome {
        info!(
            signal_id = %signal.signal_id,
            symbol = %signal.symbol,
            action = %signal.action,
            entry = signal.entry_price,
            confidence = signal.confidence,
            "execution requested"
        );

        let account = match self.broker.account().await {
            Ok(a) => a,
            Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
        };
        let position = match self.broker.position(&signal.symbol).await {
            Ok(p) => p,
            Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
        };

        // ── Intent resolution ───────────────────────────────────────────
        if let Some(pos) = &position {
            let same_side = matches!(
                (pos.side, signal.action),
                (PositionSide::Long, TradeAction::Buy) | (PositionSide::Short, TradeAction::Sell)
            );
            if same_side {
                return self
                    .reject(signal, RejectReason::ExistingPositionSameSide, enqueue_on_reject)
                    .await;
            }

            // Opposite direction: close, then maybe flip.
            let realized_pnl = match self.close_position(signal, pos).await {
                Ok(pnl) => pnl,
                Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
            };
            self.events.publish(EngineEvent::TradeClosed {
                symbol: signal.symbol.clone(),
                realized_pnl,
            });

            if !self.policy.allow_flip {
                return ExecutionOutcome::ClosedOnly { realized_pnl };
            }

            // Flip: open the opposite direction sized on fresh account state
            // (the close invalidated the account cache).
            let fresh = match self.broker.account().await {
                Ok(a) => a,
                Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
            };
            let fresh_positions = match self.broker.positions().await {
                Ok(p) => p,
                Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
            };
            return match self
                .open_entry(signal, &fresh, &fresh_positions, enqueue_on_reject)
                .await
            {
                ExecutionOutcome::Opened { order_id, qty } => ExecutionOutcome::Flipped {
                    realized_pnl,
                    order_id,
                    qty,
                },
                other => other,
            };
        }

        // ── Fresh entry ─────────────────────────────────────────────────
        let positions = match self.broker.positions().await {
            Ok(p) => p,
            Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
        };
        self.open_entry(signal, &account, &positions, enqueue_on_reject)
            .await
    }

    // -------------------------------------------------------------------------
    // Entry path
    // -------------------------------------------------------------------------

    async fn open_entry(
        &self,
        signal: &Signal,
        account: &crate::types::Account,
        positions: &[Position],
        enqueue_on_reject: bool,
    ) -> ExecutionOutcome {
        let spec = self.spec_for(&signal.symbol);

        // Sizing first (pure arithmetic): the buying-power layer needs the
        // actually-sized notional.
        let sized = match self.sizer.size(&spec, signal.entry_price, signal.confidence, account.equity) {
            Ok(s) => s,
            Err(reason) => return self.reject(signal, reason, enqueue_on_reject).await,
        };

        let request = TradeRequest {
            symbol: &signal.symbol,
            action: signal.action,
            confidence: signal.confidence,
            entry_price: signal.entry_price,
            notional: sized.notional,
        };
        if let Err(reason) =
            self.gate
                .check(&request, account, positions, &self.pause, Utc::now())
        {
            return self.reject(signal, reason, enqueue_on_reject).await;
        }

        // ── Main order ──────────────────────────────────────────────────
        let side = match signal.action {
            TradeAction::Buy => OrderSide::Buy,
            TradeAction::Sell => OrderSide::Sell,
        };
        let main = OrderRequest::limit(&signal.symbol, side, sized.qty, signal.entry_price)
            .with_client_id(&signal.signal_id);

        let started = std::time::Instant::now();
        let order_id = match self.submit_with_retries(&main).await {
            Ok(id) => id,
            Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
        };
        Metrics::inc(&self.metrics.orders_submitted);

        let settled = match self.await_settlement(&order_id).await {
            Ok(order) => order,
            Err(e) => return self.broker_failure(signal, e, enqueue_on_reject).await,
        };
        self.metrics
            .observe_order_latency(started.elapsed().as_millis() as u64);

        match settled.status {
            OrderStatus::Rejected | OrderStatus::Canceled => {
                Metrics::inc(&self.metrics.orders_rejected);
                // A settled rejection with no machine reason is logical, not
                // transient: no brackets, no enqueue.
                warn!(order_id = %order_id, status = ?settled.status, "main order did not stand");
                return ExecutionOutcome::Failed {
                    error: format!("main order settled {:?}", settled.status),
                    queued: false,
                };
            }
            _ => {}
        }

        // ── Bracket children (both legs, independently) ─────────────────
        self.place_bracket(signal, side, sized.qty).await;

        self.events.publish(EngineEvent::TradeOpened {
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            side: side.to_string(),
            qty: sized.qty,
            order_id: order_id.clone(),
        });
        info!(
            signal_id = %signal.signal_id,
            symbol = %signal.symbol,
            order_id = %order_id,
            qty = sized.qty,
            "entry executed with protective bracket"
        );

        ExecutionOutcome::Opened {
            order_id,
            qty: sized.qty,
        }
    }

    /// Place stop and target legs concurrently; retry each once; a missing
    /// leg is logged and reported but never blocks the other.
    async fn place_bracket(&self, signal: &Signal, entry_side: OrderSide, qty: f64) {
        let close_side = entry_side.opposite();

        let stop = async {
            match self
                .broker
                .place_stop(&signal.symbol, close_side, signal.stop_price, qty)
                .await
            {
                Ok(id) => Ok(id),
                Err(first) => {
                    debug!(symbol = %signal.symbol, error = %first, "stop leg failed; retrying once");
                    self.broker
                        .place_stop(&signal.symbol, close_side, signal.stop_price, qty)
                        .await
                }
            }
        };
        let target = async {
            match self
                .broker
                .place_target(&signal.symbol, close_side, signal.target_price, qty)
                .await
            {
                Ok(id) => Ok(id),
                Err(first) => {
                    debug!(symbol = %signal.symbol, error = %first, "target leg failed; retrying once");
                    self.broker
                        .place_target(&signal.symbol, close_side, signal.target_price, qty)
                        .await
                }
            }
        };

        let (stop_result, target_result) = tokio::join!(stop, target);

        for (leg, result) in [("stop", &stop_result), ("target", &target_result)] {
            if let Err(e) = result {
                Metrics::inc(&self.metrics.brackets_incomplete);
                warn!(
                    symbol = %signal.symbol,
                    leg,
                    error = %e,
                    "BRACKET_INCOMPLETE: protective leg missing after retry"
                );
                self.events.publish(EngineEvent::BracketIncomplete {
                    symbol: signal.symbol.clone(),
                    missing_leg: leg.to_string(),
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Close path
    // -------------------------------------------------------------------------

    /// Close an existing position at the signal's reference price and return
    /// realized P&L derived from the broker fill.
    async fn close_position(&self, signal: &Signal, pos: &Position) -> Result<f64, BrokerError> {
        let close_side = match pos.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let request = OrderRequest::limit(&signal.symbol, close_side, pos.qty, signal.entry_price)
            .with_client_id(format!("{}:close", signal.signal_id));

        let order_id = self.submit_with_retries(&request).await?;
        Metrics::inc(&self.metrics.orders_submitted);
        let settled = self.await_settlement(&order_id).await?;

        if matches!(settled.status, OrderStatus::Rejected | OrderStatus::Canceled) {
            return Err(BrokerError::Rejected(format!(
                "close order settled {:?}",
                settled.status
            )));
        }

        let fill = settled.filled_avg_price.unwrap_or(signal.entry_price);
        let direction = match pos.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        };
        let realized = (fill - pos.entry_price) * pos.qty * direction;

        info!(
            symbol = %signal.symbol,
            closed_side = %pos.side,
            qty = pos.qty,
            fill,
            realized_pnl = realized,
            "position closed"
        );
        Ok(realized)
    }

    // -------------------------------------------------------------------------
    // Broker plumbing
    // -------------------------------------------------------------------------

    /// Submit with exponential backoff on transient errors.
    async fn submit_with_retries(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let mut attempt = 1u32;
        loop {
            match self.broker.submit_order(request).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < self.policy.max_retry_attempts => {
                    let delay = self.policy.base_retry_delay * 2u32.pow(attempt - 1);
                    warn!(
                        symbol = %request.symbol,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient submit failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll until the order is ACCEPTED/FILLED/REJECTED/CANCELED or the
    /// deadline passes. On deadline the order is cancelled best-effort and
    /// reported as a timeout (queueable).
    async fn await_settlement(&self, order_id: &str) -> Result<Order, BrokerError> {
        let deadline = std::time::Instant::now() + self.policy.order_deadline;
        loop {
            let order = self.broker.order(order_id).await?;
            if order.status.is_settled() {
                return Ok(order);
            }
            if std::time::Instant::now() >= deadline {
                warn!(order_id, "order deadline elapsed; cancelling");
                if let Err(e) = self.broker.cancel(order_id).await {
                    warn!(order_id, error = %e, "cancel after deadline failed");
                }
                return Err(BrokerError::Timeout);
            }
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
        }
    }

    // -------------------------------------------------------------------------
    // Rejection / failure handling
    // -------------------------------------------------------------------------

    async fn reject(
        &self,
        signal: &Signal,
        reason: RejectReason,
        enqueue_on_reject: bool,
    ) -> ExecutionOutcome {
        Metrics::inc(&self.metrics.signals_rejected);
        self.rejections.record(reason.code());

        let queued = if enqueue_on_reject && reason.is_queueable() {
            match self.queue.enqueue(signal, reason.code()) {
                Ok(inserted) => {
                    if inserted {
                        Metrics::inc(&self.metrics.queue_enqueued);
                    }
                    true
                }
                Err(e) => {
                    warn!(signal_id = %signal.signal_id, error = %e, "enqueue failed");
                    false
                }
            }
        } else {
            false
        };

        warn!(
            signal_id = %signal.signal_id,
            symbol = %signal.symbol,
            reason = reason.code(),
            queued,
            "SIGNAL_REJECTED"
        );
        self.events.publish(EngineEvent::SignalRejected {
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            reason: reason.code().to_string(),
            queued,
        });

        ExecutionOutcome::Rejected { reason, queued }
    }

    async fn broker_failure(
        &self,
        signal: &Signal,
        error: BrokerError,
        enqueue_on_reject: bool,
    ) -> ExecutionOutcome {
        // Logical broker rejections map onto gate reasons where they exist.
        match error {
            BrokerError::InsufficientBuyingPower => {
                return self
                    .reject(signal, RejectReason::InsufficientBuyingPower, enqueue_on_reject)
                    .await
            }
            BrokerError::MarketClosed => {
                return self
                    .reject(signal, RejectReason::MarketClosed, enqueue_on_reject)
                    .await
            }
            _ => {}
        }

        let queued = if enqueue_on_reject && error.is_queueable() {
            match self.queue.enqueue(signal, &error.to_string()) {
                Ok(inserted) => {
                    if inserted {
                        Metrics::inc(&self.metrics.queue_enqueued);
                    }
                    true
                }
                Err(e) => {
                    warn!(signal_id = %signal.signal_id, error = %e, "enqueue failed");
                    false
                }
            }
        } else {
            false
        };

        warn!(
            signal_id = %signal.signal_id,
            symbol = %signal.symbol,
            error = %error,
            queued,
            "execution failed"
        );
        self.events.publish(EngineEvent::SignalRejected {
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            reason: error.to_string(),
            queued,
        });

        ExecutionOutcome::Failed {
            error: error.to_string(),
            queued,
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("allow_flip", &self.policy.allow_flip)
            .field("executed", &self.executed.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::config::EngineConfig;
    use crate::market_data::PriceHistory;
    use crate::queue::{QueuePolicy, QueueStatus};
    use crate::types::Regime;

    struct Fixture {
        paper: Arc<PaperBroker>,
        engine: ExecutionEngine,
        queue: Arc<SignalQueue>,
        events: Arc<EventBus>,
    }

    fn fixture(allow_flip: bool) -> Fixture {
        let mut cfg = EngineConfig::default();
        cfg.allow_flip = allow_flip;
        fixture_with_config(cfg)
    }

    fn fixture_with_config(cfg: EngineConfig) -> Fixture {
        let paper = Arc::new(PaperBroker::new(100_000.0));
        let broker = Arc::new(CachedBroker::new(
            paper.clone(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        ));
        let history = Arc::new(PriceHistory::new());
        let queue = Arc::new(
            SignalQueue::open_in_memory(QueuePolicy {
                max_age: Duration::from_secs(900),
                max_attempts: 5,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_secs(1),
            })
            .unwrap(),
        );
        let events = Arc::new(EventBus::new());

        let engine = ExecutionEngine::new(
            broker,
            RiskGate::from_config(&cfg),
            Arc::new(PositionSizer::from_config(&cfg, history)),
            queue.clone(),
            events.clone(),
            Arc::new(Metrics::new()),
            Arc::new(RejectionCounters::new()),
            Arc::new(PauseState::new()),
            ExecutionPolicy {
                allow_flip: cfg.allow_flip,
                max_retry_attempts: 3,
                base_retry_delay: Duration::from_millis(5),
                order_deadline: Duration::from_secs(5),
            },
            &cfg.symbols,
        );

        Fixture {
            paper,
            engine,
            queue,
            events,
        }
    }

    fn long_signal(id: &str, symbol: &str, entry: f64) -> Signal {
        Signal {
            signal_id: id.into(),
            prev_signal_hash: String::new(),
            symbol: symbol.into(),
            action: TradeAction::Buy,
            entry_price: entry,
            target_price: entry * 1.05,
            stop_price: entry * 0.97,
            confidence: 88.5,
            regime: Regime::Trending,
            sources_used: vec!["alpha".into()],
            rationale: "unanimous long consensus in trending regime".into(),
            generation_latency_ms: 5,
            server_timestamp: "2025-06-01T14:30:00.123Z".into(),
            created_at: "2025-06-01T14:30:00.120Z".into(),
            retention_expires_at: "2025-07-01T14:30:00.120Z".into(),
        }
    }

    fn short_signal(id: &str, symbol: &str, entry: f64) -> Signal {
        let mut s = long_signal(id, symbol, entry);
        s.action = TradeAction::Sell;
        s.target_price = entry * 0.98;
        s.stop_price = entry * 1.02;
        s
    }

    #[tokio::test]
    async fn long_entry_places_main_and_bracket() {
        let fx = fixture(false);
        let mut rx = fx.events.subscribe();

        let outcome = fx
            .engine
            .execute(&long_signal("e1", "NVDA", 450.0), true)
            .await;
        let ExecutionOutcome::Opened { qty, .. } = outcome else {
            panic!("expected Opened, got {outcome:?}");
        };
        // 100k equity, 10 % base, ×1.27 confidence, no volatility history
        // (×1.0): floor(12 700 / 450) = 28 shares.
        assert_eq!(qty, 28.0);

        let positions = fx.paper.positions().await.unwrap();
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].qty, 28.0);

        // Main + two bracket legs.
        assert_eq!(fx.paper.order_count(), 3);

        match rx.recv().await.unwrap() {
            EngineEvent::TradeOpened { symbol, qty, .. } => {
                assert_eq!(symbol, "NVDA");
                assert_eq!(qty, 28.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_entry_opens_short_with_inverted_bracket() {
        let fx = fixture(false);
        let outcome = fx
            .engine
            .execute(&short_signal("e4", "SPY", 450.0), true)
            .await;
        assert!(outcome.opened());

        let positions = fx.paper.positions().await.unwrap();
        assert_eq!(positions[0].side, PositionSide::Short);
    }

    #[tokio::test]
    async fn duplicate_signal_submits_at_most_one_main_order() {
        let fx = fixture(false);
        let signal = long_signal("dup", "NVDA", 450.0);

        let first = fx.engine.execute(&signal, true).await;
        assert!(first.opened());
        let orders_after_first = fx.paper.order_count();

        let second = fx.engine.execute(&signal, true).await;
        assert_eq!(second, ExecutionOutcome::Skipped);
        assert_eq!(fx.paper.order_count(), orders_after_first);
    }

    #[tokio::test]
    async fn same_side_stacking_is_rejected_not_queued() {
        let fx = fixture(false);
        assert!(fx
            .engine
            .execute(&long_signal("a", "NVDA", 450.0), true)
            .await
            .opened());

        let outcome = fx
            .engine
            .execute(&long_signal("b", "NVDA", 451.0), true)
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Rejected {
                reason: RejectReason::ExistingPositionSameSide,
                queued: false,
            }
        );
        assert_eq!(fx.queue.depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn opposite_signal_closes_without_flip() {
        let fx = fixture(false);
        assert!(fx
            .engine
            .execute(&long_signal("a", "AAPL", 175.0), true)
            .await
            .opened());

        let outcome = fx
            .engine
            .execute(&short_signal("b", "AAPL", 180.0), true)
            .await;
        let ExecutionOutcome::ClosedOnly { realized_pnl } = outcome else {
            panic!("expected ClosedOnly, got {outcome:?}");
        };

        // Entry sized floor(12 700 / 175) = 72 shares; closed 5 points up.
        assert!((realized_pnl - 360.0).abs() < 1e-9);
        assert!(fx.paper.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn opposite_signal_flips_when_enabled() {
        let fx = fixture(true);
        assert!(fx
            .engine
            .execute(&long_signal("a", "AAPL", 175.0), true)
            .await
            .opened());

        let outcome = fx
            .engine
            .execute(&short_signal("b", "AAPL", 180.0), true)
            .await;
        let ExecutionOutcome::Flipped {
            realized_pnl, qty, ..
        } = outcome
        else {
            panic!("expected Flipped, got {outcome:?}");
        };
        assert!(realized_pnl > 0.0);
        assert!(qty > 0.0);

        let positions = fx.paper.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].symbol, "AAPL");
    }

    #[tokio::test]
    async fn insufficient_buying_power_queues_the_signal() {
        let fx = fixture(false);
        fx.paper.set_buying_power(Some(0.0));

        let outcome = fx
            .engine
            .execute(&long_signal("e3", "NVDA", 450.0), true)
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Rejected {
                reason: RejectReason::InsufficientBuyingPower,
                queued: true,
            }
        );
        assert_eq!(fx.queue.depth().unwrap(), 1);
        let queued = fx.queue.get("e3").unwrap().unwrap();
        assert_eq!(queued.status, QueueStatus::Pending);
        assert_eq!(queued.reason, "INSUFFICIENT_BUYING_POWER");

        // A queue-processor retry (enqueue_on_reject = false) must not
        // re-enqueue on its own.
        fx.queue.claim_ready(1, chrono::Utc::now().timestamp_millis()).unwrap();
        let retry = fx
            .engine
            .execute(&long_signal("e3", "NVDA", 450.0), false)
            .await;
        assert_eq!(
            retry,
            ExecutionOutcome::Rejected {
                reason: RejectReason::InsufficientBuyingPower,
                queued: false,
            }
        );
    }

    #[tokio::test]
    async fn transient_submit_errors_are_retried() {
        let fx = fixture(false);
        fx.paper
            .fail_next_submit(BrokerError::Upstream5xx { status: 503 });
        fx.paper.fail_next_submit(BrokerError::RateLimited);

        let outcome = fx
            .engine
            .execute(&long_signal("r", "NVDA", 450.0), true)
            .await;
        assert!(outcome.opened(), "got {outcome:?}");
    }

    #[tokio::test]
    async fn exhausted_transient_retries_queue_the_signal() {
        let fx = fixture(false);
        for _ in 0..3 {
            fx.paper
                .fail_next_submit(BrokerError::Upstream5xx { status: 503 });
        }

        let outcome = fx
            .engine
            .execute(&long_signal("q", "NVDA", 450.0), true)
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                error: BrokerError::Upstream5xx { status: 503 }.to_string(),
                queued: true,
            }
        );
        assert_eq!(fx.queue.depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_bracket_leg_reports_incomplete_without_blocking_the_other() {
        let fx = fixture(false);
        // The stop leg fails on its try and its single retry; the target leg
        // then drains an empty failure queue and succeeds.
        fx.paper.fail_next_leg(BrokerError::Transport("blip".into()));
        fx.paper.fail_next_leg(BrokerError::Transport("blip".into()));

        let mut rx = fx.events.subscribe();
        let outcome = fx
            .engine
            .execute(&long_signal("b", "NVDA", 450.0), true)
            .await;
        assert!(outcome.opened(), "got {outcome:?}");

        match rx.recv().await.unwrap() {
            EngineEvent::BracketIncomplete { missing_leg, .. } => {
                assert_eq!(missing_leg, "stop");
            }
            other => panic!("expected BracketIncomplete, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::TradeOpened { .. }
        ));
    }
}
