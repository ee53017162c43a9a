// =============================================================================
// Provider Health — rolling success/failure/latency window per provider
// =============================================================================
//
// Each recorded call carries its outcome and latency; samples older than the
// window are pruned on write and on snapshot. Status derivation:
//
//   HEALTHY    success_rate >= 0.90
//   DEGRADED   success_rate >= 0.50
//   UNHEALTHY  otherwise, or >= 5 consecutive failures
//
// With fewer than 3 samples the provider is reported HEALTHY (no evidence of
// trouble yet).
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Minimum samples before the rate is trusted.
const MIN_SAMPLES: usize = 3;
/// Consecutive failures that force UNHEALTHY regardless of rate.
const CONSECUTIVE_FAILURE_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    ok: bool,
    latency: Duration,
}

struct Inner {
    samples: VecDeque<Sample>,
    consecutive_failures: u32,
}

/// Serializable health snapshot for the /health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub samples: usize,
    pub mean_latency_ms: f64,
}

/// Rolling health window for one provider.
pub struct ProviderHealth {
    inner: Mutex<Inner>,
    window: Duration,
}

impl ProviderHealth {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                consecutive_failures: 0,
            }),
            window,
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        Self::push(&mut inner, self.window, true, latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        Self::push(&mut inner, self.window, false, latency);
    }

    fn push(inner: &mut Inner, window: Duration, ok: bool, latency: Duration) {
        let now = Instant::now();
        inner.samples.push_back(Sample { at: now, ok, latency });
        while let Some(front) = inner.samples.front() {
            if now.duration_since(front.at) > window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> ProviderHealthSnapshot {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        while let Some(front) = inner.samples.front() {
            if now.duration_since(front.at) > self.window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }

        let samples = inner.samples.len();
        let successes = inner.samples.iter().filter(|s| s.ok).count();
        let success_rate = if samples == 0 {
            1.0
        } else {
            successes as f64 / samples as f64
        };
        let mean_latency_ms = if samples == 0 {
            0.0
        } else {
            inner
                .samples
                .iter()
                .map(|s| s.latency.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / samples as f64
        };

        let status = if inner.consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
            HealthStatus::Unhealthy
        } else if samples < MIN_SAMPLES {
            HealthStatus::Healthy
        } else if success_rate >= 0.90 {
            HealthStatus::Healthy
        } else if success_rate >= 0.50 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        ProviderHealthSnapshot {
            status,
            success_rate,
            consecutive_failures: inner.consecutive_failures,
            samples,
            mean_latency_ms,
        }
    }
}

impl std::fmt::Debug for ProviderHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("ProviderHealth")
            .field("status", &snap.status)
            .field("samples", &snap.samples)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fresh_provider_is_healthy() {
        let h = ProviderHealth::new(Duration::from_secs(60));
        let snap = h.snapshot();
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert_eq!(snap.samples, 0);
        assert_eq!(snap.success_rate, 1.0);
    }

    #[test]
    fn mixed_results_degrade() {
        let h = ProviderHealth::new(Duration::from_secs(60));
        for _ in 0..6 {
            h.record_success(ms(10));
        }
        for _ in 0..4 {
            h.record_failure(ms(10));
        }
        let snap = h.snapshot();
        assert_eq!(snap.status, HealthStatus::Degraded);
        assert!((snap.success_rate - 0.6).abs() < 1e-12);
    }

    #[test]
    fn heavy_failures_are_unhealthy() {
        let h = ProviderHealth::new(Duration::from_secs(60));
        h.record_success(ms(10));
        for _ in 0..9 {
            h.record_failure(ms(10));
        }
        assert_eq!(h.snapshot().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn consecutive_failures_force_unhealthy_and_reset_on_success() {
        let h = ProviderHealth::new(Duration::from_secs(60));
        // 100 successes keep the rate high, but a run of failures still trips.
        for _ in 0..100 {
            h.record_success(ms(5));
        }
        for _ in 0..5 {
            h.record_failure(ms(5));
        }
        assert_eq!(h.snapshot().status, HealthStatus::Unhealthy);
        assert_eq!(h.snapshot().consecutive_failures, 5);

        h.record_success(ms(5));
        let snap = h.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.status, HealthStatus::Healthy);
    }

    #[test]
    fn old_samples_fall_out_of_window() {
        let h = ProviderHealth::new(Duration::from_millis(20));
        h.record_failure(ms(1));
        std::thread::sleep(Duration::from_millis(40));
        let snap = h.snapshot();
        assert_eq!(snap.samples, 0);
        // Consecutive-failure count is independent of the window.
        assert_eq!(snap.consecutive_failures, 1);
    }
}
