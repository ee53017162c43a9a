// =============================================================================
// Signal Generator — the per-cycle orchestrator
// =============================================================================
//
// Every `cycle_interval` the generator dispatches one evaluation per free
// symbol (a symbol still in flight from a previous tick is skipped, never
// overlapped). High-volatility symbols dispatch first; a semaphore bounds
// parallelism so the provider panel is never thundering-herded.
//
// Per-symbol pipeline:
//   1. Race the PRIMARY_MARKET providers; first success wins, peers are
//      cancelled.
//   2. Early exit when the price moved less than `min_price_change_pct`
//      since the last emission for the symbol.
//   3. Fan out to every other provider; join with per-provider timeouts.
//   4. Consensus + regime classification + threshold gate (>= emits).
//   5. Assemble the signal (price geometry, rationale, timestamps), seal it
//      into the append-only store, publish, and hand to execution.
//
// A store failure aborts the emission: nothing is published and nothing is
// executed; the next cycle re-evaluates from scratch.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::consensus::ConsensusEngine;
use crate::events::{EngineEvent, EventBus};
use crate::execution::ExecutionEngine;
use crate::market_data::PriceHistory;
use crate::metrics::Metrics;
use crate::providers::{ProviderKind, ProviderRegistry, ProviderSignal};
use crate::regime::RegimeClassifier;
use crate::risk::PauseState;
use crate::store::{canonical_json, SignalStore};
use crate::types::{format_ts, Direction, Signal, SymbolSpec, TradeAction};

/// Closes handed to the regime classifier.
const REGIME_LOOKBACK: usize = 100;
/// Closes used for the volatility-based dispatch ordering.
const PRIORITY_VOL_WINDOW: usize = 50;

/// What one symbol evaluation concluded.
#[derive(Debug)]
pub enum CycleOutcome {
    Emitted(Box<Signal>),
    /// Price barely moved; the previous signal stands.
    Unchanged,
    /// Providers disagreed to a standstill (or nothing survived quality
    /// gates).
    NoConsensus,
    BelowThreshold {
        confidence: f64,
        threshold: f64,
    },
    /// No usable market data this cycle.
    NoData,
    /// Assembly or persistence refused the signal.
    Refused(String),
}

pub struct SignalGenerator {
    config: Arc<RwLock<EngineConfig>>,
    registry: Arc<ProviderRegistry>,
    consensus: Arc<ConsensusEngine>,
    regime: Arc<RegimeClassifier>,
    history: Arc<PriceHistory>,
    store: Arc<SignalStore>,
    execution: Arc<ExecutionEngine>,
    events: Arc<EventBus>,
    metrics: Arc<Metrics>,
    pause: Arc<PauseState>,
    /// Set when chain verification fails; emission halts until an operator
    /// intervenes.
    integrity_hold: Arc<AtomicBool>,

    // Generator-owned caches (nothing else writes these).
    last_price: Mutex<HashMap<String, f64>>,
    last_signal: Mutex<HashMap<String, Signal>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    permits: Arc<Semaphore>,
}

impl SignalGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<EngineConfig>>,
        registry: Arc<ProviderRegistry>,
        consensus: Arc<ConsensusEngine>,
        regime: Arc<RegimeClassifier>,
        history: Arc<PriceHistory>,
        store: Arc<SignalStore>,
        execution: Arc<ExecutionEngine>,
        events: Arc<EventBus>,
        metrics: Arc<Metrics>,
        pause: Arc<PauseState>,
        integrity_hold: Arc<AtomicBool>,
    ) -> Self {
        let cap = config.read().cycle_concurrency_cap.max(1);
        Self {
            config,
            registry,
            consensus,
            regime,
            history,
            store,
            execution,
            events,
            metrics,
            pause,
            integrity_hold,
            last_price: Mutex::new(HashMap::new()),
            last_signal: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(cap)),
        }
    }

    // -------------------------------------------------------------------------
    // Cycle loop
    // -------------------------------------------------------------------------

    /// Long-lived generation loop. Each tick dispatches the free symbols;
    /// symbols still in flight are skipped for this tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval_ms = self.config.read().cycle_interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(cycle_interval_ms = interval_ms, "signal generator running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("signal generator stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.dispatch_cycle();
        }
    }

    /// Spawn one evaluation task per free symbol, highest recent volatility
    /// first.
    fn dispatch_cycle(self: &Arc<Self>) {
        let (mut symbols, cycle_interval_ms) = {
            let cfg = self.config.read();
            (cfg.symbols.clone(), cfg.cycle_interval_ms)
        };

        // Most informative assets first: sort by recent realized volatility.
        symbols.sort_by(|a, b| {
            let va = self
                .history
                .realized_volatility(&a.symbol, PRIORITY_VOL_WINDOW)
                .unwrap_or(0.0);
            let vb = self
                .history
                .realized_volatility(&b.symbol, PRIORITY_VOL_WINDOW)
                .unwrap_or(0.0);
            vb.partial_cmp(&va).unwrap_or(std::cmp::Ordering::Equal)
        });

        for spec in symbols {
            if !self.in_flight.lock().insert(spec.symbol.clone()) {
                debug!(symbol = %spec.symbol, "previous cycle still in flight; tick skipped");
                continue;
            }

            let this = self.clone();
            // Cycle tokens are independent of the run loop: on shutdown,
            // in-flight cycles finish within the grace window instead of
            // being cut mid-write. The deadline below still bounds them.
            let cycle_cancel = CancellationToken::new();
            let deadline = Duration::from_millis(cycle_interval_ms * 2);

            tokio::spawn(async move {
                let permit = this.permits.clone().acquire_owned().await;
                let Ok(_permit) = permit else {
                    this.in_flight.lock().remove(&spec.symbol);
                    return;
                };

                let guard_cancel = cycle_cancel.clone();
                let outcome = tokio::select! {
                    outcome = this.evaluate_symbol(&spec, &cycle_cancel) => outcome,
                    _ = tokio::time::sleep(deadline) => {
                        guard_cancel.cancel();
                        warn!(symbol = %spec.symbol, "cycle deadline elapsed; evaluation cancelled");
                        CycleOutcome::NoData
                    }
                };

                debug!(symbol = %spec.symbol, outcome = ?outcome_label(&outcome), "cycle complete");
                this.in_flight.lock().remove(&spec.symbol);
            });
        }
    }

    // -------------------------------------------------------------------------
    // Per-symbol evaluation
    // -------------------------------------------------------------------------

    pub async fn evaluate_symbol(
        &self,
        spec: &SymbolSpec,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let started = std::time::Instant::now();
        let cfg = self.config.read().clone();

        // ── 1. Primary market-data race ─────────────────────────────────
        let quote = self.race_primary(spec, cancel, &cfg).await;
        let price = quote.as_ref().and_then(|q| q.indicative_price);

        // ── 2. Early exit on an unmoved price ───────────────────────────
        if let Some(price) = price {
            let unchanged = {
                let last = self.last_price.lock();
                last.get(&spec.symbol).is_some_and(|prev| {
                    (price - prev).abs() / prev < cfg.min_price_change_pct
                })
            };
            if unchanged && self.last_signal.lock().contains_key(&spec.symbol) {
                Metrics::inc(&self.metrics.signals_unchanged_price);
                debug!(symbol = %spec.symbol, price, "price unchanged; reusing previous signal");
                return CycleOutcome::Unchanged;
            }
            // Record before the fan-out so the technical provider and the
            // regime classifier see this cycle's close.
            self.history.record(&spec.symbol, price, Utc::now());
        }

        // ── 3. Fan out to every other provider ──────────────────────────
        let mut signals = self.fan_out(spec, cancel).await;
        if let Some(q) = quote {
            signals.push(q);
        }
        if signals.is_empty() {
            return CycleOutcome::NoData;
        }

        // ── 4. Regime + consensus ───────────────────────────────────────
        let closes = self.history.closes(&spec.symbol, REGIME_LOOKBACK);
        let regime_state = self.regime.classify(&spec.symbol, &closes);
        let regime = regime_state.as_ref().map(|r| r.regime);

        let weights = self.registry.weights();
        let fused = self.consensus.fuse_cached(
            &spec.symbol,
            price,
            &signals,
            &weights,
            regime,
            Utc::now(),
        );

        let action = match fused.direction {
            Direction::Long => TradeAction::Buy,
            Direction::Short => TradeAction::Sell,
            Direction::Neutral => return CycleOutcome::NoConsensus,
        };

        // ── 5. Regime-adjusted confidence gate (>= emits) ───────────────
        let threshold = cfg.threshold_for(regime);
        if fused.confidence < threshold {
            Metrics::inc(&self.metrics.signals_below_threshold);
            debug!(
                symbol = %spec.symbol,
                confidence = fused.confidence,
                threshold,
                "below regime threshold; nothing emitted"
            );
            return CycleOutcome::BelowThreshold {
                confidence: fused.confidence,
                threshold,
            };
        }

        // ── 6. Assemble ─────────────────────────────────────────────────
        let Some(entry_price) = price.or_else(|| self.history.last(&spec.symbol)) else {
            return CycleOutcome::NoData;
        };

        let (target_price, stop_price) = match action {
            TradeAction::Buy => (
                entry_price * (1.0 + cfg.profit_target_pct),
                entry_price * (1.0 - cfg.stop_loss_pct),
            ),
            TradeAction::Sell => (
                entry_price * (1.0 - cfg.profit_target_pct),
                entry_price * (1.0 + cfg.stop_loss_pct),
            ),
        };

        let now = Utc::now();
        let regime_value = regime.unwrap_or(crate::types::Regime::Consolidation);
        let rationale = build_rationale(&fused.sources_used, action, regime, fused.score);

        let draft = Signal {
            signal_id: String::new(),
            prev_signal_hash: String::new(),
            symbol: spec.symbol.clone(),
            action,
            entry_price,
            target_price,
            stop_price,
            confidence: fused.confidence,
            regime: regime_value,
            sources_used: fused.sources_used.clone(),
            rationale,
            generation_latency_ms: started.elapsed().as_millis() as u64,
            server_timestamp: format_ts(now),
            created_at: format_ts(now),
            retention_expires_at: format_ts(now + chrono::Duration::days(cfg.retention_days)),
        };

        if !draft.prices_valid() {
            warn!(
                symbol = %spec.symbol,
                action = %action,
                entry_price,
                target_price,
                stop_price,
                "price geometry invalid; emission refused"
            );
            return CycleOutcome::Refused("invalid price geometry".into());
        }

        // ── 7. Persist (the chain's single ordering point) ──────────────
        if self.integrity_hold.load(Ordering::SeqCst) {
            warn!(symbol = %spec.symbol, "integrity hold active; emission suppressed");
            return CycleOutcome::Refused("integrity hold".into());
        }

        let sealed = match self.store.seal_and_write(draft) {
            Ok(s) => s,
            Err(e) => {
                // Abort this emission entirely; the next cycle re-evaluates.
                error!(symbol = %spec.symbol, error = %e, "signal store write failed");
                return CycleOutcome::Refused(e.to_string());
            }
        };

        self.last_price.lock().insert(spec.symbol.clone(), entry_price);
        self.last_signal
            .lock()
            .insert(spec.symbol.clone(), sealed.clone());

        Metrics::inc(&self.metrics.signals_generated);
        self.metrics
            .observe_signal_latency(sealed.generation_latency_ms);

        // ── 8. Publish & dispatch ───────────────────────────────────────
        match canonical_json(&sealed) {
            Ok(payload) => self.events.publish(EngineEvent::SignalEmitted {
                signal_id: sealed.signal_id.clone(),
                symbol: sealed.symbol.clone(),
                payload,
            }),
            Err(e) => warn!(error = %e, "signal publication serialization failed"),
        }

        info!(
            signal_id = %sealed.signal_id,
            symbol = %sealed.symbol,
            action = %sealed.action,
            confidence = sealed.confidence,
            regime = %sealed.regime,
            latency_ms = sealed.generation_latency_ms,
            "signal emitted"
        );

        if cfg.auto_execute && !self.pause.is_paused(Utc::now()) {
            let outcome = self.execution.execute(&sealed, true).await;
            debug!(signal_id = %sealed.signal_id, outcome = ?outcome, "auto-execution finished");
        }

        CycleOutcome::Emitted(Box::new(sealed))
    }

    // -------------------------------------------------------------------------
    // Provider orchestration
    // -------------------------------------------------------------------------

    /// First successful PRIMARY_MARKET response wins; the rest are
    /// cancelled. Returns `None` when nobody answered inside the race
    /// deadline — other provider kinds may still supply direction.
    async fn race_primary(
        &self,
        spec: &SymbolSpec,
        cancel: &CancellationToken,
        cfg: &EngineConfig,
    ) -> Option<ProviderSignal> {
        let racers = self
            .registry
            .providers_of_kind(ProviderKind::PrimaryMarket, spec.asset_class);
        if racers.is_empty() {
            return None;
        }

        let race_cancel = cancel.child_token();
        let mut futures = FuturesUnordered::new();
        for provider in racers {
            let id = provider.id().to_string();
            let registry = self.registry.clone();
            let spec = spec.clone();
            let token = race_cancel.clone();
            futures.push(async move { registry.guarded_fetch(&id, &spec, &token).await });
        }

        let deadline = Duration::from_millis(cfg.market_race_timeout_ms);
        let result = tokio::time::timeout(deadline, async {
            while let Some(result) = futures.next().await {
                match result {
                    Ok(signal) => return Some(signal),
                    Err(e) => debug!(symbol = %spec.symbol, error = %e, "race participant failed"),
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        // Winner found or deadline hit: stop the stragglers either way.
        race_cancel.cancel();
        result
    }

    /// Request every non-primary provider concurrently; late responders are
    /// dropped by their per-provider timeouts inside the registry.
    async fn fan_out(&self, spec: &SymbolSpec, cancel: &CancellationToken) -> Vec<ProviderSignal> {
        let others = self
            .registry
            .providers_except_kind(ProviderKind::PrimaryMarket, spec.asset_class);

        let fetches = others.into_iter().map(|provider| {
            let id = provider.id().to_string();
            let registry = self.registry.clone();
            let spec = spec.clone();
            let token = cancel.clone();
            async move { registry.guarded_fetch(&id, &spec, &token).await }
        });

        futures_util::future::join_all(fetches)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }
}

impl std::fmt::Debug for SignalGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalGenerator")
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

fn outcome_label(outcome: &CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Emitted(_) => "emitted",
        CycleOutcome::Unchanged => "unchanged",
        CycleOutcome::NoConsensus => "no-consensus",
        CycleOutcome::BelowThreshold { .. } => "below-threshold",
        CycleOutcome::NoData => "no-data",
        CycleOutcome::Refused(_) => "refused",
    }
}

/// Deterministic, human-readable rationale. Always at least 20 characters.
fn build_rationale(
    sources: &[String],
    action: TradeAction,
    regime: Option<crate::types::Regime>,
    score: f64,
) -> String {
    let regime_label = regime
        .map(|r| r.to_string())
        .unwrap_or_else(|| "UNCLASSIFIED".to_string());
    format!(
        "{count} source consensus {action} in {regime_label} regime; weighted score {score:.3}; sources: {list}",
        count = sources.len(),
        list = sources.join(", "),
    )
}
