// =============================================================================
// Account State Monitor — detects transitions that make queued signals viable
// =============================================================================
//
// Polls the broker on a cadence (plus immediately after every trade event)
// and compares against the previous snapshot:
//
//   - buying power crossed `min_bp_to_retry` upward   -> wake the processor
//   - a position symbol disappeared (position closed) -> wake the processor
//   - a session-bound pause reached its boundary      -> clear it
//
// The monitor never touches the queue itself; it only signals the processor
// through a shared Notify.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::events::{EngineEvent, EventBus};
use crate::risk::PauseState;

#[derive(Debug, Clone)]
struct AccountSnapshot {
    buying_power: f64,
    open_symbols: HashSet<String>,
}

/// Why the monitor decided to wake the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    BuyingPowerRestored,
    PositionClosed,
}

pub struct AccountStateMonitor {
    broker: Arc<dyn Broker>,
    pause: Arc<PauseState>,
    wake: Arc<Notify>,
    min_bp_to_retry: f64,
    poll_interval: Duration,
    last: Mutex<Option<AccountSnapshot>>,
}

impl AccountStateMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        pause: Arc<PauseState>,
        wake: Arc<Notify>,
        min_bp_to_retry: f64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            pause,
            wake,
            min_bp_to_retry,
            poll_interval,
            last: Mutex::new(None),
        }
    }

    /// Long-lived monitor loop. Runs on its own task; also re-polls on every
    /// trade event from the bus.
    pub async fn run(self: Arc<Self>, events: Arc<EventBus>, cancel: CancellationToken) {
        let mut rx = events.subscribe();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            poll_interval_s = self.poll_interval.as_secs(),
            min_bp_to_retry = self.min_bp_to_retry,
            "account state monitor running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("account state monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                event = rx.recv() => {
                    match event {
                        Ok(EngineEvent::TradeOpened { .. }) | Ok(EngineEvent::TradeClosed { .. }) => {
                            debug!("trade event; polling account state immediately");
                            self.poll_once().await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "monitor lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    /// One poll + transition check. Public for tests and for a forced poll
    /// at startup.
    pub async fn poll_once(&self) {
        // Session-bound pauses lapse at the UTC day roll regardless of what
        // the broker says.
        self.pause.clear_expired(Utc::now());

        let account = match self.broker.account().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "account poll failed");
                return;
            }
        };
        let positions = match self.broker.positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "positions poll failed");
                return;
            }
        };

        let current = AccountSnapshot {
            buying_power: account.buying_power,
            open_symbols: positions.into_iter().map(|p| p.symbol).collect(),
        };

        let reasons = {
            let mut last = self.last.lock();
            let reasons = match &*last {
                Some(prev) => Self::transitions(prev, &current, self.min_bp_to_retry),
                None => Vec::new(),
            };
            *last = Some(current);
            reasons
        };

        for reason in reasons {
            info!(reason = ?reason, "positive account transition; waking queue processor");
            self.wake.notify_one();
        }
    }

    /// Pure transition detection between two snapshots.
    fn transitions(
        prev: &AccountSnapshot,
        current: &AccountSnapshot,
        min_bp: f64,
    ) -> Vec<WakeReason> {
        let mut out = Vec::new();

        if prev.buying_power < min_bp && current.buying_power >= min_bp {
            out.push(WakeReason::BuyingPowerRestored);
        }
        if prev
            .open_symbols
            .iter()
            .any(|s| !current.open_symbols.contains(s))
        {
            out.push(WakeReason::PositionClosed);
        }

        out
    }
}

impl std::fmt::Debug for AccountStateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStateMonitor")
            .field("min_bp_to_retry", &self.min_bp_to_retry)
            .field("has_snapshot", &self.last.lock().is_some())
            .finish()
    }
}
