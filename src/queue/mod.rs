// =============================================================================
// Signal Queue — durable deferred-execution store
// =============================================================================
//
// Signals rejected for recoverable reasons (insufficient buying power,
// market closed, transient broker trouble) wait here for the account-state
// monitor to wake the processor.
//
// Status transitions form a DAG:
//
//   PENDING -> IN_FLIGHT -> { PENDING, FILLED, ABANDONED }
//   PENDING -> EXPIRED
//
// Claims are atomic single-statement updates (PENDING -> IN_FLIGHT) so two
// processors can never take the same row. Expiry is evaluated on every claim
// pass: a row whose age has reached `max_age` is expired, not retried.
// =============================================================================

pub mod monitor;
pub mod processor;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{canonical_json, from_canonical_json};
use crate::types::Signal;

pub use monitor::AccountStateMonitor;
pub use processor::QueueProcessor;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Filled,
    Expired,
    Abandoned,
}

impl QueueStatus {
    fn parse(s: &str) -> Self {
        match s {
            "IN_FLIGHT" => Self::InFlight,
            "FILLED" => Self::Filled,
            "EXPIRED" => Self::Expired,
            "ABANDONED" => Self::Abandoned,
            _ => Self::Pending,
        }
    }
}

/// A deferred signal plus its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedSignal {
    pub signal: Signal,
    pub reason: String,
    pub enqueued_at_ms: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_after_ms: i64,
    pub status: QueueStatus,
}

/// What happened to a released row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Back to PENDING; eligible again at the contained unix-ms time.
    Requeued { next_attempt_after_ms: i64 },
    /// Attempt budget exhausted.
    Abandoned,
}

/// Retry policy applied by the queue itself.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_age: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

// ---------------------------------------------------------------------------
// The queue
// ---------------------------------------------------------------------------

/// Durable queue keyed by `signal_id`. Exclusively owns its store.
pub struct SignalQueue {
    conn: Mutex<Connection>,
    policy: QueuePolicy,
}

impl SignalQueue {
    pub fn open(path: impl AsRef<Path>, policy: QueuePolicy) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path.as_ref())?, policy)
    }

    pub fn open_in_memory(policy: QueuePolicy) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, policy)
    }

    fn with_connection(conn: Connection, policy: QueuePolicy) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signal_queue (
                signal_id          TEXT PRIMARY KEY,
                symbol             TEXT NOT NULL,
                payload            TEXT NOT NULL,
                reason             TEXT NOT NULL,
                enqueued_at        INTEGER NOT NULL,
                attempts           INTEGER NOT NULL DEFAULT 0,
                last_error         TEXT,
                next_attempt_after INTEGER NOT NULL,
                status             TEXT NOT NULL DEFAULT 'PENDING',
                claim_token        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status
                ON signal_queue(status, next_attempt_after);
            CREATE INDEX IF NOT EXISTS idx_queue_symbol
                ON signal_queue(symbol);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
        })
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    // -------------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------------

    /// Add a rejected signal. Returns false when the id is already queued
    /// (a re-reject while the row is pending is not a new attempt).
    pub fn enqueue(&self, signal: &Signal, reason: &str) -> Result<bool, StoreError> {
        let payload = canonical_json(signal)?;
        let now = Self::now_ms();

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO signal_queue
                (signal_id, symbol, payload, reason, enqueued_at, attempts, next_attempt_after, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, 'PENDING')
             ON CONFLICT(signal_id) DO NOTHING",
            params![signal.signal_id, signal.symbol, payload, reason, now],
        )?;

        if inserted > 0 {
            info!(signal_id = %signal.signal_id, symbol = %signal.symbol, reason, "signal queued for deferred execution");
        } else {
            debug!(signal_id = %signal.signal_id, "signal already queued; enqueue ignored");
        }
        Ok(inserted > 0)
    }

    // -------------------------------------------------------------------------
    // Claim
    // -------------------------------------------------------------------------

    /// Expire over-age rows, then atomically claim up to `limit` eligible
    /// rows (PENDING, `next_attempt_after <= now`) as IN_FLIGHT.
    pub fn claim_ready(&self, limit: u32, now_ms: i64) -> Result<Vec<QueuedSignal>, StoreError> {
        let conn = self.conn.lock();

        // Age exactly at max_age expires (boundary inclusive).
        let cutoff = now_ms - self.policy.max_age.as_millis() as i64;
        let expired = conn.execute(
            "UPDATE signal_queue SET status = 'EXPIRED', last_error = 'exceeded max queue age'
             WHERE status = 'PENDING' AND enqueued_at <= ?1",
            params![cutoff],
        )?;
        if expired > 0 {
            warn!(count = expired, "queued signals expired by age");
        }

        // Single-statement PENDING -> IN_FLIGHT transition tagged with a
        // fresh claim token: concurrent claimers cannot double-claim, and
        // each caller reads back only its own rows.
        let token = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "UPDATE signal_queue SET status = 'IN_FLIGHT', claim_token = ?3
             WHERE signal_id IN (
                 SELECT signal_id FROM signal_queue
                 WHERE status = 'PENDING' AND next_attempt_after <= ?1
                 ORDER BY enqueued_at, rowid
                 LIMIT ?2
             )",
            params![now_ms, limit, token],
        )?;

        let mut stmt = conn.prepare(
            "SELECT signal_id, payload, reason, enqueued_at, attempts, last_error,
                    next_attempt_after, status
             FROM signal_queue WHERE status = 'IN_FLIGHT' AND claim_token = ?1
             ORDER BY enqueued_at, rowid",
        )?;
        let rows = stmt.query_map(params![token], Self::row_to_queued)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn row_to_queued(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<QueuedSignal, StoreError>> {
        let payload: String = row.get(1)?;
        let reason: String = row.get(2)?;
        let enqueued_at_ms: i64 = row.get(3)?;
        let attempts: i64 = row.get(4)?;
        let last_error: Option<String> = row.get(5)?;
        let next_attempt_after_ms: i64 = row.get(6)?;
        let status: String = row.get(7)?;

        Ok(from_canonical_json(&payload).map(|signal| QueuedSignal {
            signal,
            reason,
            enqueued_at_ms,
            attempts: attempts as u32,
            last_error,
            next_attempt_after_ms,
            status: QueueStatus::parse(&status),
        }))
    }

    // -------------------------------------------------------------------------
    // Completion paths
    // -------------------------------------------------------------------------

    /// Mark an in-flight row FILLED.
    pub fn complete_filled(&self, signal_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signal_queue SET status = 'FILLED' WHERE signal_id = ?1 AND status = 'IN_FLIGHT'",
            params![signal_id],
        )?;
        info!(signal_id, "queued signal filled");
        Ok(())
    }

    /// Return an in-flight row to PENDING with exponential backoff, or
    /// abandon it once the attempt budget is spent.
    pub fn release_for_retry(
        &self,
        signal_id: &str,
        error: &str,
        now_ms: i64,
    ) -> Result<RetryDisposition, StoreError> {
        let conn = self.conn.lock();

        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempts FROM signal_queue WHERE signal_id = ?1 AND status = 'IN_FLIGHT'",
                params![signal_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Err(StoreError::InvalidSignal(format!(
                "release of {signal_id} which is not IN_FLIGHT"
            )));
        };

        let attempts = attempts as u32 + 1;
        if attempts >= self.policy.max_attempts {
            conn.execute(
                "UPDATE signal_queue SET status = 'ABANDONED', attempts = ?2, last_error = ?3
                 WHERE signal_id = ?1",
                params![signal_id, attempts, error],
            )?;
            warn!(signal_id, attempts, "queued signal abandoned after max attempts");
            return Ok(RetryDisposition::Abandoned);
        }

        let backoff_ms = self
            .policy
            .backoff_base
            .as_millis()
            .saturating_mul(1u128 << attempts.min(32))
            .min(self.policy.backoff_max.as_millis()) as i64;
        let next = now_ms + backoff_ms;

        conn.execute(
            "UPDATE signal_queue
             SET status = 'PENDING', attempts = ?2, last_error = ?3, next_attempt_after = ?4
             WHERE signal_id = ?1",
            params![signal_id, attempts, error, next],
        )?;
        debug!(signal_id, attempts, next_attempt_after = next, "queued signal released for retry");
        Ok(RetryDisposition::Requeued {
            next_attempt_after_ms: next,
        })
    }

    /// Expire a specific row (price drifted, market moved on).
    pub fn expire(&self, signal_id: &str, reason: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signal_queue SET status = 'EXPIRED', last_error = ?2
             WHERE signal_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT')",
            params![signal_id, reason],
        )?;
        info!(signal_id, reason, "queued signal expired");
        Ok(())
    }

    /// Abandon a specific row (non-recoverable rejection on retry).
    pub fn abandon(&self, signal_id: &str, reason: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signal_queue SET status = 'ABANDONED', last_error = ?2
             WHERE signal_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT')",
            params![signal_id, reason],
        )?;
        warn!(signal_id, reason, "queued signal abandoned");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Number of rows still awaiting execution.
    pub fn depth(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signal_queue WHERE status IN ('PENDING', 'IN_FLIGHT')",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn get(&self, signal_id: &str) -> Result<Option<QueuedSignal>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT signal_id, payload, reason, enqueued_at, attempts, last_error,
                        next_attempt_after, status
                 FROM signal_queue WHERE signal_id = ?1",
                params![signal_id],
                Self::row_to_queued,
            )
            .optional()?;
        row.transpose()
    }
}

impl std::fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalQueue")
            .field("depth", &self.depth().unwrap_or(0))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Regime, TradeAction};

    fn policy() -> QueuePolicy {
        QueuePolicy {
            max_age: Duration::from_secs(900),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
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
            generation_latency_ms: 10,
            server_timestamp: "2025-06-01T14:30:00.123Z".into(),
            created_at: "2025-06-01T14:30:00.120Z".into(),
            retention_expires_at: "2025-07-01T14:30:00.120Z".into(),
        }
    }

    #[test]
    fn enqueue_claim_complete_lifecycle() {
        let queue = SignalQueue::open_in_memory(policy()).unwrap();
        assert!(queue.enqueue(&signal("a"), "INSUFFICIENT_BUYING_POWER").unwrap());
        // Duplicate enqueue is a no-op.
        assert!(!queue.enqueue(&signal("a"), "INSUFFICIENT_BUYING_POWER").unwrap());
        assert_eq!(queue.depth().unwrap(), 1);

        let now = SignalQueue::now_ms();
        let claimed = queue.claim_ready(10, now).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, QueueStatus::InFlight);
        assert_eq!(claimed[0].signal.signal_id, "a");

        // A second claim pass gets nothing.
        assert!(queue.claim_ready(10, now).unwrap().is_empty());

        queue.complete_filled("a").unwrap();
        assert_eq!(queue.get("a").unwrap().unwrap().status, QueueStatus::Filled);
        assert_eq!(queue.depth().unwrap(), 0);
    }

    #[test]
    fn release_backs_off_exponentially() {
        let queue = SignalQueue::open_in_memory(policy()).unwrap();
        queue.enqueue(&signal("a"), "UPSTREAM_5XX").unwrap();

        let now = SignalQueue::now_ms();
        queue.claim_ready(1, now).unwrap();
        let disp = queue.release_for_retry("a", "still down", now).unwrap();
        // attempts = 1 → backoff = base · 2¹ = 2 s.
        assert_eq!(
            disp,
            RetryDisposition::Requeued {
                next_attempt_after_ms: now + 2000
            }
        );

        // Not eligible before its next_attempt_after.
        assert!(queue.claim_ready(1, now + 1000).unwrap().is_empty());
        assert_eq!(queue.claim_ready(1, now + 2000).unwrap().len(), 1);

        let disp = queue.release_for_retry("a", "still down", now).unwrap();
        // attempts = 2 → backoff 4 s.
        assert_eq!(
            disp,
            RetryDisposition::Requeued {
                next_attempt_after_ms: now + 4000
            }
        );
    }

    #[test]
    fn backoff_is_capped() {
        let mut p = policy();
        p.backoff_max = Duration::from_secs(3);
        let queue = SignalQueue::open_in_memory(p).unwrap();
        queue.enqueue(&signal("a"), "x").unwrap();

        let now = SignalQueue::now_ms();
        queue.claim_ready(1, now).unwrap();
        queue.release_for_retry("a", "e", now).unwrap();
        queue.claim_ready(1, now + 10_000).unwrap();
        let disp = queue.release_for_retry("a", "e", now).unwrap();
        assert_eq!(
            disp,
            RetryDisposition::Requeued {
                next_attempt_after_ms: now + 3000
            }
        );
    }

    #[test]
    fn abandoned_after_max_attempts_and_not_before() {
        let mut p = policy();
        p.max_attempts = 3;
        p.backoff_base = Duration::from_millis(0);
        let queue = SignalQueue::open_in_memory(p).unwrap();
        queue.enqueue(&signal("a"), "x").unwrap();

        let now = SignalQueue::now_ms();
        for attempt in 1..3 {
            assert_eq!(queue.claim_ready(1, now).unwrap().len(), 1, "attempt {attempt}");
            let disp = queue.release_for_retry("a", "err", now).unwrap();
            assert!(matches!(disp, RetryDisposition::Requeued { .. }));
        }

        queue.claim_ready(1, now).unwrap();
        let disp = queue.release_for_retry("a", "err", now).unwrap();
        assert_eq!(disp, RetryDisposition::Abandoned);
        assert_eq!(queue.get("a").unwrap().unwrap().status, QueueStatus::Abandoned);
    }

    #[test]
    fn age_exactly_at_max_expires() {
        let p = policy();
        let max_age_ms = p.max_age.as_millis() as i64;
        let queue = SignalQueue::open_in_memory(p).unwrap();
        queue.enqueue(&signal("a"), "x").unwrap();
        let enqueued_at = queue.get("a").unwrap().unwrap().enqueued_at_ms;

        // One millisecond short of max age: still claimable.
        let claimed = queue.claim_ready(1, enqueued_at + max_age_ms - 1).unwrap();
        assert_eq!(claimed.len(), 1);
        queue.release_for_retry("a", "e", enqueued_at).unwrap();

        // Exactly at max age: expired, never claimed.
        let claimed = queue.claim_ready(1, enqueued_at + max_age_ms).unwrap();
        assert!(claimed.is_empty());
        assert_eq!(queue.get("a").unwrap().unwrap().status, QueueStatus::Expired);
    }

    #[test]
    fn explicit_expire_and_abandon() {
        let queue = SignalQueue::open_in_memory(policy()).unwrap();
        queue.enqueue(&signal("a"), "x").unwrap();
        queue.enqueue(&signal("b"), "x").unwrap();

        queue.expire("a", "price drifted").unwrap();
        queue.abandon("b", "symbol denied on retry").unwrap();

        assert_eq!(queue.get("a").unwrap().unwrap().status, QueueStatus::Expired);
        assert_eq!(queue.get("b").unwrap().unwrap().status, QueueStatus::Abandoned);
        assert_eq!(queue.depth().unwrap(), 0);

        // Terminal rows stay terminal.
        queue.expire("b", "again").unwrap();
        assert_eq!(queue.get("b").unwrap().unwrap().status, QueueStatus::Abandoned);
    }

    #[test]
    fn claim_respects_limit_and_order() {
        let queue = SignalQueue::open_in_memory(policy()).unwrap();
        for id in ["a", "b", "c"] {
            queue.enqueue(&signal(id), "x").unwrap();
        }

        let claimed = queue.claim_ready(2, SignalQueue::now_ms()).unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].signal.signal_id, "a");

        // A second claimer sees only the remaining row, never the rows the
        // first claim is still working on.
        let rest = queue.claim_ready(2, SignalQueue::now_ms()).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].signal.signal_id, "c");
    }
}
