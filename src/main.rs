// =============================================================================
// Meridian Signal Engine — Main Entry Point
// =============================================================================
//
// The engine starts Paused for safety. Trading begins only after an explicit
// POST /resume; auto-execution then follows the configured `auto_execute`
// flag.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod config;
mod consensus;
mod error;
mod events;
mod execution;
mod generator;
mod indicators;
mod market_data;
mod metrics;
mod providers;
mod queue;
mod regime;
mod risk;
mod store;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::{Broker, CachedBroker, PaperBroker, RestBroker};
use crate::config::EngineConfig;
use crate::consensus::{ConsensusEngine, QualityPolicy};
use crate::events::{EngineEvent, EventBus};
use crate::execution::{ExecutionEngine, ExecutionPolicy};
use crate::generator::SignalGenerator;
use crate::market_data::PriceHistory;
use crate::metrics::{Metrics, RejectionCounters};
use crate::providers::registry::{BreakerSettings, ProviderRegistry, ProviderSettings};
use crate::providers::rest_quote::RestQuoteProvider;
use crate::providers::score_feed::ScoreFeedProvider;
use crate::providers::technical::TechnicalProvider;
use crate::providers::{DataProvider, ProviderKind};
use crate::queue::{AccountStateMonitor, QueuePolicy, QueueProcessor, SignalQueue};
use crate::queue::processor::ProcessorPolicy;
use crate::regime::RegimeClassifier;
use crate::risk::{PauseState, PositionSizer, RiskGate};
use crate::store::SignalStore;

const CONFIG_PATH: &str = "engine_config.json";
const SIGNALS_DB_PATH: &str = "meridian_signals.db";
const QUEUE_DB_PATH: &str = "meridian_queue.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Signal Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available ("NVDA:equity,BTCUSD:crypto").
    if let Ok(raw) = std::env::var("MERIDIAN_SYMBOLS") {
        let parsed = parse_symbol_list(&raw);
        if !parsed.is_empty() {
            config.symbols = parsed;
        }
    }
    if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
        config.bind_addr = addr;
    }

    info!(
        symbols = config.symbols.len(),
        auto_execute = config.auto_execute,
        paper_mode = config.paper_mode,
        "configured trading panel"
    );

    // ── 2. Core services ─────────────────────────────────────────────────
    let metrics = Arc::new(Metrics::new());
    let rejections = Arc::new(RejectionCounters::new());
    let events = Arc::new(EventBus::new());
    let history = Arc::new(PriceHistory::new());
    let regime = Arc::new(RegimeClassifier::new());
    let integrity_hold = Arc::new(AtomicBool::new(false));

    // SAFETY: always boot paused; trading requires an explicit resume.
    let pause = Arc::new(PauseState::new_paused(
        "startup safety; resume via POST /resume",
    ));

    let store = Arc::new(SignalStore::open(SIGNALS_DB_PATH)?);
    let queue = Arc::new(SignalQueue::open(
        QUEUE_DB_PATH,
        QueuePolicy {
            max_age: Duration::from_millis(config.queue_max_age_ms),
            max_attempts: config.queue_max_attempts,
            backoff_base: Duration::from_millis(config.queue_backoff_base_ms),
            backoff_max: Duration::from_millis(config.queue_backoff_max_ms),
        },
    )?);

    // ── 3. Provider panel ────────────────────────────────────────────────
    let registry = Arc::new(build_registry(&config, history.clone(), metrics.clone()));

    let mut consensus = ConsensusEngine::new(
        QualityPolicy {
            stale_after_ms: config.provider_stale_after_ms,
            confidence_floors: config.provider_confidence_floors.clone(),
            default_floor: 20.0,
        },
        Duration::from_millis(config.consensus_cache_ttl_ms),
        metrics.clone(),
    );
    // Regime weight tilt: the technical vote means more in a trend, less in
    // chop.
    consensus.set_regime_weights(
        crate::types::Regime::Trending,
        HashMap::from([("tech".to_string(), 1.5)]),
    );
    consensus.set_regime_weights(
        crate::types::Regime::Consolidation,
        HashMap::from([("tech".to_string(), 0.7)]),
    );
    let consensus = Arc::new(consensus);

    // ── 4. Broker ────────────────────────────────────────────────────────
    let inner_broker: Arc<dyn Broker> = if config.paper_mode {
        info!("paper mode: orders route to the in-memory paper broker");
        Arc::new(PaperBroker::new(100_000.0))
    } else {
        let api_key = std::env::var("MERIDIAN_BROKER_KEY").unwrap_or_default();
        let api_secret = std::env::var("MERIDIAN_BROKER_SECRET").unwrap_or_default();
        let base_url = std::env::var("MERIDIAN_BROKER_URL")
            .unwrap_or_else(|_| "https://api.broker.example.com".into());
        info!(base_url = %base_url, "live mode: orders route to the REST broker");
        Arc::new(RestBroker::new(api_key, api_secret, base_url))
    };
    let broker = Arc::new(CachedBroker::new(
        inner_broker,
        Duration::from_millis(config.account_cache_ttl_ms),
        Duration::from_millis(config.positions_cache_ttl_ms),
    ));

    // ── 5. Risk & execution ──────────────────────────────────────────────
    let sizer = Arc::new(PositionSizer::from_config(&config, history.clone()));
    let gate = RiskGate::from_config(&config);

    let execution = Arc::new(ExecutionEngine::new(
        broker.clone(),
        gate,
        sizer,
        queue.clone(),
        events.clone(),
        metrics.clone(),
        rejections.clone(),
        pause.clone(),
        ExecutionPolicy {
            allow_flip: config.allow_flip,
            max_retry_attempts: config.max_retry_attempts,
            base_retry_delay: Duration::from_millis(config.base_retry_delay_ms),
            order_deadline: Duration::from_millis(config.order_deadline_ms),
        },
        &config.symbols,
    ));

    // ── 6. Shared state & API server ─────────────────────────────────────
    let shutdown_grace = Duration::from_millis(config.shutdown_grace_ms);
    let chain_verify_interval = Duration::from_millis(config.chain_verify_interval_ms);
    let monitor_poll = Duration::from_millis(config.monitor_poll_interval_ms);
    let processor_policy = ProcessorPolicy {
        wake_interval: Duration::from_millis(config.processor_wake_interval_ms),
        batch_size: config.processor_batch_size,
        max_price_drift_pct: config.max_price_drift_pct,
    };
    let min_bp_to_retry = config.min_bp_to_retry;
    let bind_addr = config.bind_addr.clone();
    let symbols = config.symbols.clone();

    let config = Arc::new(RwLock::new(config));
    let state = Arc::new(AppState::new(
        config.clone(),
        pause.clone(),
        metrics.clone(),
        rejections,
        events.clone(),
        store.clone(),
        queue.clone(),
        registry.clone(),
        regime.clone(),
        broker.clone(),
        integrity_hold.clone(),
    ));

    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 7. Signal generator ──────────────────────────────────────────────
    let root_cancel = CancellationToken::new();

    let generator = Arc::new(SignalGenerator::new(
        config.clone(),
        registry.clone(),
        consensus,
        regime,
        history,
        store.clone(),
        execution.clone(),
        events.clone(),
        metrics.clone(),
        pause.clone(),
        integrity_hold.clone(),
    ));
    tokio::spawn(generator.run(root_cancel.child_token()));

    // ── 8. Account monitor + queue processor ─────────────────────────────
    let wake = Arc::new(Notify::new());

    let monitor = Arc::new(AccountStateMonitor::new(
        broker.clone(),
        pause.clone(),
        wake.clone(),
        min_bp_to_retry,
        monitor_poll,
    ));
    tokio::spawn(monitor.run(events.clone(), root_cancel.child_token()));

    let processor = Arc::new(QueueProcessor::new(
        queue,
        execution,
        registry,
        symbols,
        wake,
        events.clone(),
        metrics,
        processor_policy,
    ));
    tokio::spawn(processor.run(root_cancel.child_token()));

    // ── 9. Chain verification loop ───────────────────────────────────────
    {
        let store = store.clone();
        let events = events.clone();
        let integrity_hold = integrity_hold.clone();
        let pause = pause.clone();
        let cancel = root_cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(chain_verify_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match store.verify_chain(None, None) {
                    Ok(report) => {
                        info!(records = report.records_verified, "hash chain verified");
                        events.publish(EngineEvent::ChainVerified {
                            records: report.records_verified,
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "HASH_MISMATCH: hash chain verification failed");
                        integrity_hold.store(true, Ordering::SeqCst);
                        pause.pause("hash chain broken; operator action required");
                        if let crate::error::StoreError::ChainBroken { signal_id, detail } = e {
                            events.publish(EngineEvent::ChainBroken { signal_id, detail });
                        }
                    }
                }
            }
        });
    }

    // ── 10. Engine event log ─────────────────────────────────────────────
    {
        let state = state.clone();
        let mut rx = events.subscribe();
        let cancel = root_cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => match event {
                        Ok(EngineEvent::BracketIncomplete { symbol, missing_leg }) => {
                            state.push_error(
                                format!("bracket incomplete on {symbol}: {missing_leg} leg missing"),
                                Some("BRACKET_INCOMPLETE".into()),
                            );
                        }
                        Ok(EngineEvent::ChainBroken { signal_id, detail }) => {
                            state.push_error(
                                format!("hash chain broken at {signal_id}: {detail}"),
                                Some("HASH_MISMATCH".into()),
                            );
                        }
                        Ok(_) => {
                            state.increment_version();
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
    }

    info!("all subsystems running; engine is PAUSED until POST /resume");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    root_cancel.cancel();
    tokio::time::sleep(shutdown_grace).await;

    if let Err(e) = config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("Meridian Signal Engine shut down complete.");
    Ok(())
}

// =============================================================================
// Wiring helpers
// =============================================================================

/// Register the provider panel: two racing market-quote adapters, the local
/// technical-analysis provider, and the sentiment/AI score feeds.
fn build_registry(
    config: &EngineConfig,
    history: Arc<PriceHistory>,
    metrics: Arc<Metrics>,
) -> ProviderRegistry {
    let breaker = BreakerSettings {
        failure_threshold: config.breaker_failure_threshold,
        window: Duration::from_millis(config.breaker_window_ms),
        cooldown: Duration::from_millis(config.breaker_cooldown_ms),
    };

    let alpha_url = std::env::var("MERIDIAN_QUOTE_ALPHA_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:9101".into());
    let beacon_url = std::env::var("MERIDIAN_QUOTE_BEACON_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:9102".into());
    let sentiment_url = std::env::var("MERIDIAN_SENTIMENT_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:9103".into());
    let oracle_url =
        std::env::var("MERIDIAN_AI_URL").unwrap_or_else(|_| "http://127.0.0.1:9104".into());

    let providers: Vec<Arc<dyn DataProvider>> = vec![
        Arc::new(RestQuoteProvider::new(
            "alpha",
            ProviderKind::PrimaryMarket,
            alpha_url,
            true,
        )),
        Arc::new(RestQuoteProvider::new(
            "beacon",
            ProviderKind::PrimaryMarket,
            beacon_url,
            true,
        )),
        Arc::new(TechnicalProvider::new("tech", history)),
        Arc::new(ScoreFeedProvider::new(
            "pulse",
            ProviderKind::Sentiment,
            sentiment_url,
        )),
        Arc::new(ScoreFeedProvider::new("oracle", ProviderKind::Ai, oracle_url)),
    ];

    let rate_limit_max_wait = Duration::from_millis(config.rate_limit_max_wait_ms);
    let mut registry = ProviderRegistry::new(rate_limit_max_wait, metrics);
    for provider in providers {
        let id = provider.id().to_string();
        registry.register(
            provider,
            ProviderSettings {
                weight: config.weight_for(&id),
                rate_limit_per_sec: config.rate_limit_for(&id),
                timeout: config.timeout_for(&id),
            },
            breaker,
        );
    }
    registry
}

/// Parse "NVDA:equity,BTCUSD:crypto" (class defaults to equity).
fn parse_symbol_list(raw: &str) -> Vec<crate::types::SymbolSpec> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let (symbol, class) = match part.split_once(':') {
                Some((s, "crypto")) => (s, crate::types::AssetClass::Crypto),
                Some((s, _)) => (s, crate::types::AssetClass::Equity),
                None => (part, crate::types::AssetClass::Equity),
            };
            Some(crate::types::SymbolSpec::new(
                symbol.to_uppercase(),
                class,
            ))
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetClass;

    #[test]
    fn symbol_list_parses_classes_and_uppercases() {
        let parsed = parse_symbol_list("nvda:equity, btcusd:crypto ,SPY,,");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].symbol, "NVDA");
        assert_eq!(parsed[0].asset_class, AssetClass::Equity);
        assert_eq!(parsed[1].symbol, "BTCUSD");
        assert_eq!(parsed[1].asset_class, AssetClass::Crypto);
        assert_eq!(parsed[2].symbol, "SPY");
        assert_eq!(parsed[2].asset_class, AssetClass::Equity);
    }

    #[test]
    fn registry_builds_the_full_panel() {
        let config = EngineConfig::default();
        let registry = build_registry(
            &config,
            Arc::new(PriceHistory::new()),
            Arc::new(Metrics::new()),
        );
        assert_eq!(
            registry
                .providers_of_kind(ProviderKind::PrimaryMarket, AssetClass::Equity)
                .len(),
            2
        );
        assert_eq!(
            registry
                .providers_except_kind(ProviderKind::PrimaryMarket, AssetClass::Crypto)
                .len(),
            3
        );
        assert!(registry.crypto_capable_ids().contains(&"tech".to_string()));
    }
}
