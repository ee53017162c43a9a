// =============================================================================
// Central Application State — Meridian Signal Engine
// =============================================================================
//
// Ties the constructor-injected component graph together for the operator
// API. Nothing here owns pipeline logic; subsystems manage their own
// interior mutability and AppState provides unified snapshots.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the error ring buffer.
//   - Arc wrappers for subsystem engines.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::{Broker, CachedBroker};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::metrics::{Metrics, RejectionCounters};
use crate::providers::ProviderRegistry;
use crate::queue::SignalQueue;
use crate::regime::RegimeClassifier;
use crate::risk::{PauseInfo, PauseState};
use crate::store::SignalStore;

/// Maximum number of recent errors retained for the dashboard.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the operator error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub at: String,
}

/// Central shared state, wrapped in `Arc` across all async tasks.
pub struct AppState {
    pub state_version: AtomicU64,
    pub config: Arc<RwLock<EngineConfig>>,
    pub pause: Arc<PauseState>,
    pub metrics: Arc<Metrics>,
    pub rejections: Arc<RejectionCounters>,
    pub events: Arc<EventBus>,
    pub store: Arc<SignalStore>,
    pub queue: Arc<SignalQueue>,
    pub registry: Arc<ProviderRegistry>,
    pub regime: Arc<RegimeClassifier>,
    pub broker: Arc<CachedBroker>,
    pub integrity_hold: Arc<AtomicBool>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<EngineConfig>>,
        pause: Arc<PauseState>,
        metrics: Arc<Metrics>,
        rejections: Arc<RejectionCounters>,
        events: Arc<EventBus>,
        store: Arc<SignalStore>,
        queue: Arc<SignalQueue>,
        registry: Arc<ProviderRegistry>,
        regime: Arc<RegimeClassifier>,
        broker: Arc<CachedBroker>,
        integrity_hold: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            pause,
            metrics,
            rejections,
            events,
            store,
            queue,
            registry,
            regime,
            broker,
            integrity_hold,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    /// Record an error for the operator log; the ring is capped at
    /// [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: impl Into<String>, code: Option<String>) {
        let record = ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }

        self.increment_version();
    }

    // ── Health snapshot ─────────────────────────────────────────────────

    /// Aggregated health payload for GET /health.
    pub async fn build_health(&self) -> HealthSnapshot {
        let now = Utc::now();
        let paused = self.pause.snapshot();
        let is_paused = self.pause.is_paused(now);
        let integrity_hold = self.integrity_hold.load(Ordering::SeqCst);

        let providers = self.registry.health_snapshots();
        let breakers: std::collections::BTreeMap<String, String> = self
            .registry
            .breaker_states()
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();

        let any_unhealthy = providers
            .values()
            .any(|p| p.status == crate::providers::HealthStatus::Unhealthy);

        let status = if integrity_hold {
            "integrity_hold"
        } else if is_paused {
            "paused"
        } else if any_unhealthy {
            "degraded"
        } else {
            "ok"
        };

        // Drawdown from the (cached) account snapshot; absent when the
        // broker is unreachable.
        let drawdown_pct = match self.broker.account().await {
            Ok(account) if account.peak_equity > 0.0 => {
                Some(((account.peak_equity - account.equity) / account.peak_equity).max(0.0))
            }
            _ => None,
        };

        HealthSnapshot {
            status: status.to_string(),
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            paused,
            integrity_hold,
            providers: providers.into_iter().collect(),
            breakers,
            consensus_cache_hit_rate: self.metrics.consensus_hit_rate(),
            provider_success_rate: self.metrics.provider_success_rate(),
            queue_depth: self.queue.depth().unwrap_or(0),
            signals_stored: self.store.count().unwrap_or(0),
            drawdown_pct,
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

/// GET /health payload.
#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<PauseInfo>,
    pub integrity_hold: bool,
    pub providers: std::collections::BTreeMap<String, crate::providers::ProviderHealthSnapshot>,
    pub breakers: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_cache_hit_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_success_rate: Option<f64>,
    pub queue_depth: u64,
    pub signals_stored: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawdown_pct: Option<f64>,
    pub recent_errors: Vec<ErrorRecord>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .finish()
    }
}
