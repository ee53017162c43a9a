// =============================================================================
// Provider Registry — weights, rate limits, circuit breakers, health
// =============================================================================
//
// One entry per registered provider. Breaker and limiter state are guarded
// per-provider (fine-grained locks); no lock is held across an await of the
// underlying fetch.
//
// Circuit breaker contract: after `failure_threshold` consecutive failures
// within `window`, the breaker opens and fetches short-circuit with
// UPSTREAM_DOWN until `cooldown` elapses; then exactly one probe is admitted
// (half-open). Probe success closes the breaker, failure re-opens it.
//
// Rate limiter contract: token bucket per provider. `acquire` waits up to
// `max_wait`; on timeout the caller proceeds without this provider.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::metrics::Metrics;
use crate::providers::health::{ProviderHealth, ProviderHealthSnapshot};
use crate::providers::{DataProvider, ProviderKind, ProviderSignal};
use crate::types::{AssetClass, SymbolSpec};

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with fractional refill per second.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    pub fn new(refill_per_sec: f64) -> Self {
        let capacity = refill_per_sec.max(1.0);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: refill_per_sec.max(0.1),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Acquire one token, waiting up to `max_wait`. Returns false on timeout.
    pub async fn acquire(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.try_acquire() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            // Sleep roughly one token's worth, bounded by the deadline.
            let per_token = Duration::from_secs_f64(1.0 / self.refill_per_sec);
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(per_token.min(remaining).min(Duration::from_millis(50))).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Per-provider circuit breaker (closed / open / half-open).
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            window,
            cooldown,
        }
    }

    /// Gate a call. `Ok(())` admits it; `Err(UpstreamDown)` short-circuits.
    /// An open breaker whose cooldown has elapsed transitions to half-open
    /// and admits exactly one probe.
    pub fn check(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Err(ProviderError::UpstreamDown),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(ProviderError::UpstreamDown)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.state == BreakerState::HalfOpen {
            // Probe failed: re-open for a full cooldown.
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            return;
        }

        // A run of failures only counts while it stays inside the window.
        match inner.first_failure_at {
            Some(first) if now.duration_since(first) <= self.window => {
                inner.consecutive_failures += 1;
            }
            _ => {
                inner.first_failure_at = Some(now);
                inner.consecutive_failures = 1;
            }
        }

        if inner.consecutive_failures >= self.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, BreakerState::Open)
    }

    pub fn state_label(&self) -> &'static str {
        match self.inner.lock().state {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ProviderEntry {
    provider: Arc<dyn DataProvider>,
    weight: f64,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
    health: ProviderHealth,
    timeout: Duration,
}

/// Configuration for one registered provider.
pub struct ProviderSettings {
    pub weight: f64,
    pub rate_limit_per_sec: f64,
    pub timeout: Duration,
}

/// Shared breaker/limiter configuration applied to every provider.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

/// Owns per-provider weights, rate limiters, breakers, and health windows.
/// Built once at startup; entries are never added or removed at runtime.
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
    rate_limit_max_wait: Duration,
    metrics: Arc<Metrics>,
}

impl ProviderRegistry {
    pub fn new(rate_limit_max_wait: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: HashMap::new(),
            rate_limit_max_wait,
            metrics,
        }
    }

    pub fn register(
        &mut self,
        provider: Arc<dyn DataProvider>,
        settings: ProviderSettings,
        breaker: BreakerSettings,
    ) {
        let id = provider.id().to_string();
        debug!(
            provider = %id,
            kind = %provider.kind(),
            weight = settings.weight,
            rate_limit = settings.rate_limit_per_sec,
            "provider registered"
        );
        self.entries.insert(
            id,
            ProviderEntry {
                provider,
                weight: settings.weight,
                limiter: TokenBucket::new(settings.rate_limit_per_sec),
                breaker: CircuitBreaker::new(
                    breaker.failure_threshold,
                    breaker.window,
                    breaker.cooldown,
                ),
                health: ProviderHealth::new(Duration::from_secs(300)),
                timeout: settings.timeout,
            },
        );
    }

    pub fn weight(&self, provider_id: &str) -> f64 {
        self.entries.get(provider_id).map_or(0.0, |e| e.weight)
    }

    pub fn weights(&self) -> HashMap<String, f64> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.weight))
            .collect()
    }

    /// Providers of `kind` that support `class`.
    pub fn providers_of_kind(
        &self,
        kind: ProviderKind,
        class: AssetClass,
    ) -> Vec<Arc<dyn DataProvider>> {
        self.entries
            .values()
            .filter(|e| e.provider.kind() == kind && e.provider.supports_asset_class(class))
            .map(|e| e.provider.clone())
            .collect()
    }

    /// All providers supporting `class` except the given kind.
    pub fn providers_except_kind(
        &self,
        kind: ProviderKind,
        class: AssetClass,
    ) -> Vec<Arc<dyn DataProvider>> {
        self.entries
            .values()
            .filter(|e| e.provider.kind() != kind && e.provider.supports_asset_class(class))
            .map(|e| e.provider.clone())
            .collect()
    }

    /// Ids of providers that can serve crypto symbols (24/7 surface).
    pub fn crypto_capable_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.provider.supports_asset_class(AssetClass::Crypto))
            .map(|e| e.provider.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Fetch through the provider's breaker, limiter, and timeout, recording
    /// the outcome into its health window.
    pub async fn guarded_fetch(
        &self,
        provider_id: &str,
        symbol: &SymbolSpec,
        cancel: &CancellationToken,
    ) -> Result<ProviderSignal, ProviderError> {
        let entry = self
            .entries
            .get(provider_id)
            .ok_or_else(|| ProviderError::UnsupportedSymbol(symbol.symbol.clone()))?;

        entry.breaker.check().inspect_err(|_| {
            Metrics::inc(&self.metrics.provider_short_circuits);
        })?;

        if !entry.limiter.acquire(self.rate_limit_max_wait).await {
            // Not a provider fault: the cycle proceeds without this source.
            return Err(ProviderError::RateLimited);
        }

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            fetched = tokio::time::timeout(entry.timeout, entry.provider.fetch(symbol, cancel)) => {
                match fetched {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::Timeout),
                }
            }
        };
        let latency = started.elapsed();

        match &result {
            Ok(_) => {
                entry.breaker.record_success();
                entry.health.record_success(latency);
                Metrics::inc(&self.metrics.provider_successes);
            }
            Err(e) if e.counts_against_breaker() => {
                entry.breaker.record_failure();
                entry.health.record_failure(latency);
                Metrics::inc(&self.metrics.provider_failures);
                warn!(provider = %provider_id, symbol = %symbol.symbol, error = %e, "provider fetch failed");
            }
            Err(_) => {}
        }

        result
    }

    /// Health snapshots for the /health endpoint, keyed by provider id.
    pub fn health_snapshots(&self) -> HashMap<String, ProviderHealthSnapshot> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.health.snapshot()))
            .collect()
    }

    /// Breaker state labels, keyed by provider id.
    pub fn breaker_states(&self) -> HashMap<String, &'static str> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.breaker.state_label()))
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.entries.len())
            .finish()
    }
}
