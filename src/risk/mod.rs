// =============================================================================
// Risk module — pre-trade gate, position sizing, pause state
// =============================================================================

pub mod gate;
pub mod sizing;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

pub use gate::{RiskGate, TradeRequest};
pub use sizing::{PositionSizer, SizedOrder};

// ---------------------------------------------------------------------------
// Pause state
// ---------------------------------------------------------------------------

/// Why and until when trading is paused. `until = None` means the pause holds
/// until an operator resumes.
#[derive(Debug, Clone, Serialize)]
pub struct PauseInfo {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

/// Shared global trading-pause flag. The risk gate trips it on daily-loss and
/// drawdown breaches; operators toggle it via /pause and /resume; the
/// account-state monitor clears session-bound pauses at the UTC day roll.
pub struct PauseState {
    inner: RwLock<Option<PauseInfo>>,
}

impl PauseState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Engine boots paused; trading starts only after an explicit resume.
    pub fn new_paused(reason: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Some(PauseInfo {
                reason: reason.into(),
                until: None,
            })),
        }
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        match &*self.inner.read() {
            Some(info) => match info.until {
                Some(until) => now < until,
                None => true,
            },
            None => false,
        }
    }

    pub fn snapshot(&self) -> Option<PauseInfo> {
        self.inner.read().clone()
    }

    /// Pause until manually resumed. Idempotent.
    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "trading paused");
        *self.inner.write() = Some(PauseInfo {
            reason,
            until: None,
        });
    }

    /// Pause until the next UTC session boundary (midnight).
    pub fn pause_until_next_session(&self, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        let until = next_session_boundary(now);
        warn!(reason = %reason, until = %until, "trading paused until session boundary");
        *self.inner.write() = Some(PauseInfo {
            reason,
            until: Some(until),
        });
    }

    /// Clear any pause. Idempotent.
    pub fn resume(&self) {
        let mut inner = self.inner.write();
        if inner.is_some() {
            info!("trading resumed");
        }
        *inner = None;
    }

    /// Drop a session-bound pause whose boundary has passed. Called by the
    /// account-state monitor on its poll cadence.
    pub fn clear_expired(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        if let Some(info) = &*inner {
            if let Some(until) = info.until {
                if now >= until {
                    info!(reason = %info.reason, "session boundary reached; pause cleared");
                    *inner = None;
                    return true;
                }
            }
        }
        false
    }
}

impl Default for PauseState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PauseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseState")
            .field("paused", &self.inner.read().is_some())
            .finish()
    }
}

/// Next UTC midnight strictly after `now`.
pub fn next_session_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_pause_holds_until_resume() {
        let pause = PauseState::new();
        let now = Utc::now();
        assert!(!pause.is_paused(now));

        pause.pause("operator requested");
        assert!(pause.is_paused(now));
        assert!(pause.is_paused(now + Duration::days(30)));

        pause.resume();
        assert!(!pause.is_paused(now));
    }

    #[test]
    fn session_pause_expires_at_utc_midnight() {
        let pause = PauseState::new();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 15, 30, 0).unwrap();
        pause.pause_until_next_session("daily loss limit", now);

        assert!(pause.is_paused(now));
        let boundary = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        assert!(!pause.is_paused(boundary));

        assert!(pause.clear_expired(boundary));
        assert!(pause.snapshot().is_none());
    }

    #[test]
    fn clear_expired_keeps_manual_pauses() {
        let pause = PauseState::new_paused("startup safety");
        assert!(!pause.clear_expired(Utc::now() + Duration::days(365)));
        assert!(pause.is_paused(Utc::now()));
    }

    #[test]
    fn boundary_is_strictly_after_now() {
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 23, 59, 59).unwrap();
        assert_eq!(
            next_session_boundary(late),
            Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()
        );
    }
}
