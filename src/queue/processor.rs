// =============================================================================
// Queue Processor — re-validates and re-submits deferred signals
// =============================================================================
//
// Wakes on the monitor's notify or on its own timer. Each pass:
//
//   1. Claim up to `batch_size` eligible rows (the queue handles age expiry
//      and backoff eligibility).
//   2. Re-fetch the current price; drift beyond `max_price_drift_pct` from
//      the queued entry price expires the signal (stale, market moved).
//   3. Re-run the full execution path (risk gate included) with enqueueing
//      disabled — re-enqueue with backoff is this processor's job, and a
//      nested enqueue would tight-loop.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::execution::{ExecutionEngine, ExecutionOutcome};
use crate::metrics::Metrics;
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::queue::{QueuedSignal, RetryDisposition, SignalQueue};
use crate::types::SymbolSpec;

#[derive(Debug, Clone)]
pub struct ProcessorPolicy {
    pub wake_interval: Duration,
    pub batch_size: u32,
    pub max_price_drift_pct: f64,
}

pub struct QueueProcessor {
    queue: Arc<SignalQueue>,
    engine: Arc<ExecutionEngine>,
    registry: Arc<ProviderRegistry>,
    symbols: Vec<SymbolSpec>,
    wake: Arc<Notify>,
    events: Arc<EventBus>,
    metrics: Arc<Metrics>,
    policy: ProcessorPolicy,
}

impl QueueProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<SignalQueue>,
        engine: Arc<ExecutionEngine>,
        registry: Arc<ProviderRegistry>,
        symbols: Vec<SymbolSpec>,
        wake: Arc<Notify>,
        events: Arc<EventBus>,
        metrics: Arc<Metrics>,
        policy: ProcessorPolicy,
    ) -> Self {
        Self {
            queue,
            engine,
            registry,
            symbols,
            wake,
            events,
            metrics,
            policy,
        }
    }

    /// Long-lived processor loop on its own task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.wake_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            wake_interval_s = self.policy.wake_interval.as_secs(),
            batch_size = self.policy.batch_size,
            "queue processor running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("queue processor stopping");
                    return;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {
                    debug!("queue processor woken by account transition");
                }
            }
            self.drain(&cancel).await;
        }
    }

    /// One claim-and-retry pass. Returns the number of rows handled.
    pub async fn drain(&self, cancel: &CancellationToken) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let claimed = match self.queue.claim_ready(self.policy.batch_size, now_ms) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "queue claim failed");
                return 0;
            }
        };
        if claimed.is_empty() {
            return 0;
        }

        info!(count = claimed.len(), "retrying queued signals");
        let mut handled = 0;
        for item in claimed {
            if cancel.is_cancelled() {
                // Shutdown mid-batch: put unprocessed rows back in line.
                let _ = self.queue.release_for_retry(
                    &item.signal.signal_id,
                    "shutdown during retry",
                    now_ms,
                );
                continue;
            }
            self.process_one(item, now_ms).await;
            handled += 1;
        }
        handled
    }

    async fn process_one(&self, item: QueuedSignal, now_ms: i64) {
        let signal_id = item.signal.signal_id.clone();
        let symbol = item.signal.symbol.clone();

        // ── 2. Price-drift check ────────────────────────────────────────
        match self.current_price(&symbol).await {
            Some(price) => {
                let drift = (price - item.signal.entry_price).abs() / item.signal.entry_price;
                if drift > self.policy.max_price_drift_pct {
                    info!(
                        signal_id = %signal_id,
                        symbol = %symbol,
                        queued_entry = item.signal.entry_price,
                        current = price,
                        drift_pct = drift * 100.0,
                        "queued signal stale; price drifted"
                    );
                    Metrics::inc(&self.metrics.queue_expired);
                    let _ = self.queue.expire(&signal_id, "price drift exceeded limit");
                    return;
                }
            }
            None => {
                debug!(signal_id = %signal_id, "no current price; retrying later");
                self.release(&signal_id, "price unavailable", now_ms);
                return;
            }
        }

        // ── 3. Re-gate and re-submit ────────────────────────────────────
        Metrics::inc(&self.metrics.queue_retried);
        let outcome = self.engine.execute(&item.signal, false).await;
        match outcome {
            ExecutionOutcome::Opened { .. }
            | ExecutionOutcome::Flipped { .. }
            | ExecutionOutcome::ClosedOnly { .. } => {
                Metrics::inc(&self.metrics.queue_filled);
                let _ = self.queue.complete_filled(&signal_id);
                self.events.publish(EngineEvent::QueueDrained {
                    signal_id: signal_id.clone(),
                });
            }
            // A duplicate means this signal already produced its one main
            // order; nothing left to retry.
            ExecutionOutcome::Skipped => {
                let _ = self.queue.complete_filled(&signal_id);
            }
            ExecutionOutcome::Rejected { reason, .. } => {
                if reason.is_queueable() {
                    self.release(&signal_id, reason.code(), now_ms);
                } else {
                    Metrics::inc(&self.metrics.queue_abandoned);
                    let _ = self.queue.abandon(&signal_id, reason.code());
                }
            }
            ExecutionOutcome::Failed { error, .. } => {
                // Transient or unclassified: let the attempt budget decide.
                self.release(&signal_id, &error, now_ms);
            }
        }
    }

    fn release(&self, signal_id: &str, error: &str, now_ms: i64) {
        match self.queue.release_for_retry(signal_id, error, now_ms) {
            Ok(RetryDisposition::Requeued { .. }) => {}
            Ok(RetryDisposition::Abandoned) => {
                Metrics::inc(&self.metrics.queue_abandoned);
            }
            Err(e) => warn!(signal_id, error = %e, "queue release failed"),
        }
    }

    /// Current price from the first responsive market-data provider.
    async fn current_price(&self, symbol: &str) -> Option<f64> {
        let spec = self
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .cloned()
            .unwrap_or_else(|| SymbolSpec::equity(symbol));

        let cancel = CancellationToken::new();
        for kind in [ProviderKind::PrimaryMarket, ProviderKind::SecondaryMarket] {
            for provider in self.registry.providers_of_kind(kind, spec.asset_class) {
                match self
                    .registry
                    .guarded_fetch(provider.id(), &spec, &cancel)
                    .await
                {
                    Ok(signal) => {
                        if let Some(price) = signal.indicative_price {
                            return Some(price);
                        }
                    }
                    Err(e) => {
                        debug!(provider = %provider.id(), symbol, error = %e, "price refetch failed");
                    }
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("batch_size", &self.policy.batch_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, CachedBroker, PaperBroker};
    use crate::config::EngineConfig;
    use crate::error::ProviderError;
    use crate::market_data::PriceHistory;
    use crate::metrics::RejectionCounters;
    use crate::providers::registry::{BreakerSettings, ProviderSettings};
    use crate::providers::{DataProvider, ProviderSignal};
    use crate::queue::{QueuePolicy, QueueStatus};
    use crate::risk::{PauseState, PositionSizer, RiskGate};
    use crate::types::{AssetClass, Direction, Regime, Signal, TradeAction};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    /// Primary-market stub with a settable price.
    struct FakeQuote {
        price: PlMutex<Option<f64>>,
    }

    #[async_trait]
    impl DataProvider for FakeQuote {
        fn id(&self) -> &str {
            "fake-quote"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::PrimaryMarket
        }

        fn supports_asset_class(&self, _class: AssetClass) -> bool {
            true
        }

        async fn fetch(
            &self,
            symbol: &SymbolSpec,
            _cancel: &CancellationToken,
        ) -> Result<ProviderSignal, ProviderError> {
            match *self.price.lock() {
                Some(p) => Ok(
                    ProviderSignal::new("fake-quote", &symbol.symbol, Direction::Neutral, 50.0)
                        .with_price(p),
                ),
                None => Err(ProviderError::Timeout),
            }
        }
    }

    struct Fixture {
        paper: Arc<PaperBroker>,
        quote: Arc<FakeQuote>,
        queue: Arc<SignalQueue>,
        processor: QueueProcessor,
    }

    fn fixture() -> Fixture {
        let cfg = EngineConfig::default();
        let metrics = Arc::new(Metrics::new());
        let events = Arc::new(EventBus::new());

        let paper = Arc::new(PaperBroker::new(100_000.0));
        let broker = Arc::new(CachedBroker::new(
            paper.clone(),
            Duration::from_millis(1),
            Duration::from_millis(1),
        ));
        let queue = Arc::new(
            SignalQueue::open_in_memory(QueuePolicy {
                max_age: Duration::from_secs(900),
                max_attempts: 3,
                backoff_base: Duration::from_millis(0),
                backoff_max: Duration::from_secs(1),
            })
            .unwrap(),
        );

        let engine = Arc::new(ExecutionEngine::new(
            broker,
            RiskGate::from_config(&cfg),
            Arc::new(PositionSizer::from_config(
                &cfg,
                Arc::new(PriceHistory::new()),
            )),
            queue.clone(),
            events.clone(),
            metrics.clone(),
            Arc::new(RejectionCounters::new()),
            Arc::new(PauseState::new()),
            crate::execution::ExecutionPolicy {
                allow_flip: false,
                max_retry_attempts: 2,
                base_retry_delay: Duration::from_millis(1),
                order_deadline: Duration::from_secs(2),
            },
            &cfg.symbols,
        ));

        let quote = Arc::new(FakeQuote {
            price: PlMutex::new(Some(450.0)),
        });
        let mut registry = ProviderRegistry::new(Duration::from_millis(50), metrics.clone());
        registry.register(
            quote.clone(),
            ProviderSettings {
                weight: 1.0,
                rate_limit_per_sec: 1000.0,
                timeout: Duration::from_secs(1),
            },
            BreakerSettings {
                failure_threshold: 100,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(1),
            },
        );

        let processor = QueueProcessor::new(
            queue.clone(),
            engine,
            Arc::new(registry),
            cfg.symbols.clone(),
            Arc::new(Notify::new()),
            events,
            metrics,
            ProcessorPolicy {
                wake_interval: Duration::from_secs(30),
                batch_size: 10,
                max_price_drift_pct: 0.005,
            },
        );

        Fixture {
            paper,
            quote,
            queue,
            processor,
        }
    }

    fn signal(id: &str) -> Signal {
        Signal {
            signal_id: id.into(),
            prev_signal_hash: String::new(),
            symbol: "NVDA".into(),
            action: TradeAction::Buy,
            entry_price: 450.0,
            target_price: 472.5,
            stop_price: 436.5,
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

    #[tokio::test]
    async fn queued_signal_executes_once_funds_return() {
        let fx = fixture();
        fx.queue.enqueue(&signal("e3"), "INSUFFICIENT_BUYING_POWER").unwrap();

        // Funds present; the retry goes through.
        let handled = fx.processor.drain(&CancellationToken::new()).await;
        assert_eq!(handled, 1);
        assert_eq!(
            fx.queue.get("e3").unwrap().unwrap().status,
            QueueStatus::Filled
        );
        assert_eq!(fx.paper.positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn price_drift_expires_instead_of_executing() {
        let fx = fixture();
        fx.queue.enqueue(&signal("d"), "INSUFFICIENT_BUYING_POWER").unwrap();
        // 1 % above the queued entry: beyond the 0.5 % drift bound.
        *fx.quote.price.lock() = Some(454.5);

        fx.processor.drain(&CancellationToken::new()).await;
        assert_eq!(
            fx.queue.get("d").unwrap().unwrap().status,
            QueueStatus::Expired
        );
        assert!(fx.paper.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn still_rejected_goes_back_to_pending_with_backoff() {
        let fx = fixture();
        fx.paper.set_buying_power(Some(0.0));
        fx.queue.enqueue(&signal("p"), "INSUFFICIENT_BUYING_POWER").unwrap();

        fx.processor.drain(&CancellationToken::new()).await;
        let row = fx.queue.get("p").unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Pending);
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn repeated_rejection_exhausts_the_attempt_budget() {
        let fx = fixture();
        fx.paper.set_buying_power(Some(0.0));
        fx.queue.enqueue(&signal("x"), "INSUFFICIENT_BUYING_POWER").unwrap();

        // max_attempts = 3 with zero backoff: three passes abandon it.
        for _ in 0..3 {
            fx.processor.drain(&CancellationToken::new()).await;
        }
        assert_eq!(
            fx.queue.get("x").unwrap().unwrap().status,
            QueueStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn unavailable_price_defers_rather_than_expires() {
        let fx = fixture();
        *fx.quote.price.lock() = None;
        fx.queue.enqueue(&signal("u"), "INSUFFICIENT_BUYING_POWER").unwrap();

        fx.processor.drain(&CancellationToken::new()).await;
        let row = fx.queue.get("u").unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Pending);
        assert_eq!(row.attempts, 1);
    }
}
