// =============================================================================
// Engine Event Bus — broadcast channel for signal and trade lifecycle events
// =============================================================================
//
// Every subsystem publishes here; downstream subscribers (signal publication,
// the account-state monitor, tests) attach with `subscribe()`. Lagging
// subscribers drop oldest events rather than blocking producers.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;

/// Channel capacity before the slowest subscriber starts losing events.
const BUS_CAPACITY: usize = 256;

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    /// A signal passed the gate and was persisted. `payload` is the canonical
    /// JSON record — the exact bytes downstream consumers hash-verify.
    SignalEmitted {
        signal_id: String,
        symbol: String,
        payload: String,
    },
    /// The risk gate (or sizer) refused execution.
    SignalRejected {
        signal_id: String,
        symbol: String,
        reason: String,
        queued: bool,
    },
    TradeOpened {
        signal_id: String,
        symbol: String,
        side: String,
        qty: f64,
        order_id: String,
    },
    TradeClosed {
        symbol: String,
        realized_pnl: f64,
    },
    /// One bracket leg failed after its retry; the entry is protected by at
    /// most one leg.
    BracketIncomplete {
        symbol: String,
        missing_leg: String,
    },
    /// A queued signal was re-attempted and filled.
    QueueDrained {
        signal_id: String,
    },
    ChainVerified {
        records: u64,
    },
    /// Integrity failure: the stored chain no longer matches its content
    /// hashes. Emission pauses pending operator action.
    ChainBroken {
        signal_id: String,
        detail: String,
    },
}

/// Broadcast bus shared across subsystems.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A zero-subscriber bus is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
