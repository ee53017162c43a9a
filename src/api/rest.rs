// =============================================================================
// REST Control Surface — Axum 0.7
// =============================================================================
//
// Operator endpoints only; signal consumers subscribe to the event bus, not
// to HTTP. Errors are structured `{code, message}` objects with a stable
// code string — no stack traces in responses.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::AssetClass;

// =============================================================================
// Router construction
// =============================================================================

/// Build the operator API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/crypto/status", get(crypto_status))
        .layer(cors)
        .with_state(state)
}

/// Structured error body; `code` matches the engine error taxonomy.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError {
                code: "INTERNAL".into(),
                message: message.into(),
            }),
        )
    }
}

// =============================================================================
// Health & metrics
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_health().await)
}

async fn metrics(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let depth = state
        .queue
        .depth()
        .map_err(|e| ApiError::internal(format!("queue depth unavailable: {e}")))?;
    Ok(Json(state.metrics.snapshot(&state.rejections, depth)))
}

// =============================================================================
// Pause / resume (idempotent)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    paused: bool,
    message: String,
}

async fn pause(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.pause.pause("operator requested via API");
    state.increment_version();
    info!("trading PAUSED via API");

    Json(ControlResponse {
        paused: true,
        message: "Trading paused".into(),
    })
}

async fn resume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.integrity_hold.load(Ordering::SeqCst) {
        warn!("operator resume clears an active integrity hold");
        state.integrity_hold.store(false, Ordering::SeqCst);
    }
    state.pause.resume();
    state.increment_version();
    info!("trading RESUMED via API");

    Json(ControlResponse {
        paused: false,
        message: "Trading resumed".into(),
    })
}

// =============================================================================
// Crypto status
// =============================================================================

#[derive(Serialize)]
struct CryptoStatusResponse {
    crypto_enabled: bool,
    /// Crypto venues never close; signals generate around the clock.
    always_open: bool,
    symbols: Vec<String>,
    providers: Vec<String>,
}

async fn crypto_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let symbols: Vec<String> = state
        .config
        .read()
        .symbols
        .iter()
        .filter(|s| s.asset_class == AssetClass::Crypto)
        .map(|s| s.symbol.clone())
        .collect();
    let providers = state.registry.crypto_capable_ids();

    Json(CryptoStatusResponse {
        crypto_enabled: !symbols.is_empty() && !providers.is_empty(),
        always_open: true,
        symbols,
        providers,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{CachedBroker, PaperBroker};
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::metrics::{Metrics, RejectionCounters};
    use crate::providers::ProviderRegistry;
    use crate::queue::{QueuePolicy, SignalQueue};
    use crate::regime::RegimeClassifier;
    use crate::risk::PauseState;
    use crate::store::SignalStore;
    use chrono::Utc;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn app_state() -> Arc<AppState> {
        let metrics = Arc::new(Metrics::new());
        let paper = Arc::new(PaperBroker::new(100_000.0));
        Arc::new(AppState::new(
            Arc::new(RwLock::new(EngineConfig::default())),
            Arc::new(PauseState::new_paused("startup safety")),
            metrics.clone(),
            Arc::new(RejectionCounters::new()),
            Arc::new(EventBus::new()),
            Arc::new(SignalStore::open_in_memory().unwrap()),
            Arc::new(
                SignalQueue::open_in_memory(QueuePolicy {
                    max_age: Duration::from_secs(900),
                    max_attempts: 5,
                    backoff_base: Duration::from_secs(1),
                    backoff_max: Duration::from_secs(60),
                })
                .unwrap(),
            ),
            Arc::new(ProviderRegistry::new(Duration::from_millis(100), metrics)),
            Arc::new(RegimeClassifier::new()),
            Arc::new(CachedBroker::new(
                paper,
                Duration::from_secs(30),
                Duration::from_secs(10),
            )),
            Arc::new(AtomicBool::new(false)),
        ))
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let state = app_state();

        // Startup pause is active; resuming twice lands in the same place.
        resume(State(state.clone())).await;
        resume(State(state.clone())).await;
        assert!(!state.pause.is_paused(Utc::now()));

        pause(State(state.clone())).await;
        pause(State(state.clone())).await;
        assert!(state.pause.is_paused(Utc::now()));
    }

    #[tokio::test]
    async fn resume_clears_integrity_hold() {
        let state = app_state();
        state.integrity_hold.store(true, Ordering::SeqCst);

        resume(State(state.clone())).await;
        assert!(!state.integrity_hold.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn router_builds() {
        let _ = router(app_state());
    }
}
