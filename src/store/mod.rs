// =============================================================================
// Signal Store — append-only, content-addressed, hash-chained
// =============================================================================
//
// One SQLite database owns the `signals` and `signal_audit_log` tables.
// Writes serialize through a single connection lock, which is also the one
// global ordering point the hash chain requires: each record links to its
// predecessor via `prev_signal_hash`.
//
// Append-only is enforced in the storage layer itself: BEFORE UPDATE/DELETE
// triggers on `signals` record the attempt in the audit log and then fail
// the statement (RAISE(FAIL) keeps the audit row).
//
// `verify_chain` recomputes every content hash and checks the links; any
// mismatch is an integrity failure that pauses emission upstream.
// =============================================================================

pub mod canonical;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::types::Signal;

pub use canonical::{canonical_json, content_hash, from_canonical_json};

/// Minimum rationale length accepted by the store.
const MIN_RATIONALE_LEN: usize = 20;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of an idempotent write.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The record was inserted.
    Inserted(Signal),
    /// A record with this `signal_id` already existed; nothing was written.
    Existing(Signal),
}

impl WriteOutcome {
    pub fn signal(&self) -> &Signal {
        match self {
            Self::Inserted(s) | Self::Existing(s) => s,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// One audit-log row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub at: String,
    pub operation: String,
    pub signal_id: String,
    pub detail: String,
}

/// Outcome of a chain verification pass.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub records_verified: u64,
}

struct Inner {
    conn: Connection,
    /// `signal_id` of the most recently appended record.
    head: Option<String>,
}

/// Append-only signal store. The connection mutex is the global write
/// serialization point; hold it only for synchronous SQLite calls.
pub struct SignalStore {
    inner: Mutex<Inner>,
}

impl SignalStore {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    /// In-memory store for tests and paper runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signals (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id  TEXT NOT NULL UNIQUE,
                symbol     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol, seq);

            CREATE TABLE IF NOT EXISTS signal_audit_log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                at        TEXT NOT NULL,
                operation TEXT NOT NULL,
                signal_id TEXT NOT NULL,
                detail    TEXT NOT NULL
            );

            CREATE TRIGGER IF NOT EXISTS signals_block_update
            BEFORE UPDATE ON signals
            BEGIN
                INSERT INTO signal_audit_log (at, operation, signal_id, detail)
                VALUES (strftime('%Y-%m-%dT%H:%M:%fZ','now'), 'UPDATE', OLD.signal_id,
                        'update blocked: signals is append-only');
                SELECT RAISE(FAIL, 'signals is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS signals_block_delete
            BEFORE DELETE ON signals
            BEGIN
                INSERT INTO signal_audit_log (at, operation, signal_id, detail)
                VALUES (strftime('%Y-%m-%dT%H:%M:%fZ','now'), 'DELETE', OLD.signal_id,
                        'delete blocked: signals is append-only');
                SELECT RAISE(FAIL, 'signals is append-only');
            END;",
        )?;

        let head: Option<String> = conn
            .query_row(
                "SELECT signal_id FROM signals ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(ref h) = head {
            info!(head = %h, "signal store opened with existing chain head");
        }

        Ok(Self {
            inner: Mutex::new(Inner { conn, head }),
        })
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    fn validate(signal: &Signal) -> Result<(), StoreError> {
        if signal.rationale.trim().is_empty() || signal.rationale.len() < MIN_RATIONALE_LEN {
            return Err(StoreError::InvalidSignal(format!(
                "rationale must be at least {MIN_RATIONALE_LEN} chars"
            )));
        }
        if !signal.prices_valid() {
            return Err(StoreError::InvalidSignal(format!(
                "price geometry invalid for {} {}: entry={} target={} stop={}",
                signal.symbol,
                signal.action,
                signal.entry_price,
                signal.target_price,
                signal.stop_price
            )));
        }
        if !(0.0..=100.0).contains(&signal.confidence) {
            return Err(StoreError::InvalidSignal(format!(
                "confidence {} outside [0, 100]",
                signal.confidence
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Link `signal` to the current chain head, compute its content hash, and
    /// append it. The caller leaves `signal_id`/`prev_signal_hash` empty.
    pub fn seal_and_write(&self, mut signal: Signal) -> Result<Signal, StoreError> {
        Self::validate(&signal)?;

        let mut inner = self.inner.lock();
        signal.prev_signal_hash = inner.head.clone().unwrap_or_default();
        signal.signal_id = content_hash(&signal)?;

        let record = canonical_json(&signal)?;
        let inserted = inner.conn.execute(
            "INSERT INTO signals (signal_id, symbol, created_at, record)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(signal_id) DO NOTHING",
            params![signal.signal_id, signal.symbol, signal.created_at, record],
        )?;

        if inserted == 0 {
            // Identical content re-sealed against the same head: a no-op
            // returning the record already on disk.
            if let Some(existing) = Self::fetch_by_id(&inner.conn, &signal.signal_id)? {
                return Ok(existing);
            }
            return Ok(signal);
        }

        inner.head = Some(signal.signal_id.clone());
        Ok(signal)
    }

    /// Idempotent write of an already-sealed record. Re-submitting an
    /// existing `signal_id` returns the stored record without writing.
    pub fn write(&self, signal: &Signal) -> Result<WriteOutcome, StoreError> {
        Self::validate(signal)?;

        let expected = content_hash(signal)?;
        if expected != signal.signal_id {
            return Err(StoreError::InvalidSignal(format!(
                "signal_id {} does not match content hash {}",
                signal.signal_id, expected
            )));
        }

        let mut inner = self.inner.lock();

        if let Some(existing) = Self::fetch_by_id(&inner.conn, &signal.signal_id)? {
            return Ok(WriteOutcome::Existing(existing));
        }

        let head = inner.head.clone().unwrap_or_default();
        if signal.prev_signal_hash != head {
            return Err(StoreError::InvalidSignal(format!(
                "prev_signal_hash {} does not extend the chain head {}",
                signal.prev_signal_hash, head
            )));
        }

        let record = canonical_json(signal)?;
        inner.conn.execute(
            "INSERT INTO signals (signal_id, symbol, created_at, record)
             VALUES (?1, ?2, ?3, ?4)",
            params![signal.signal_id, signal.symbol, signal.created_at, record],
        )?;
        inner.head = Some(signal.signal_id.clone());

        Ok(WriteOutcome::Inserted(signal.clone()))
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn fetch_by_id(conn: &Connection, signal_id: &str) -> Result<Option<Signal>, StoreError> {
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM signals WHERE signal_id = ?1",
                params![signal_id],
                |row| row.get(0),
            )
            .optional()?;
        record.map(|r| from_canonical_json(&r)).transpose()
    }

    pub fn get_by_id(&self, signal_id: &str) -> Result<Option<Signal>, StoreError> {
        let inner = self.inner.lock();
        Self::fetch_by_id(&inner.conn, signal_id)
    }

    /// The most recent `n` records, newest first.
    pub fn list_recent(&self, n: usize) -> Result<Vec<Signal>, StoreError> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT record FROM signals ORDER BY seq DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![n as i64], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for record in rows {
            out.push(from_canonical_json(&record?)?);
        }
        Ok(out)
    }

    /// Latest record for `symbol`, if any.
    pub fn latest(&self, symbol: &str) -> Result<Option<Signal>, StoreError> {
        let inner = self.inner.lock();
        let record: Option<String> = inner
            .conn
            .query_row(
                "SELECT record FROM signals WHERE symbol = ?1 ORDER BY seq DESC LIMIT 1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        record.map(|r| from_canonical_json(&r)).transpose()
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        let n: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT at, operation, signal_id, detail FROM signal_audit_log ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(AuditEntry {
                at: row.get(0)?,
                operation: row.get(1)?,
                signal_id: row.get(2)?,
                detail: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -------------------------------------------------------------------------
    // Chain verification
    // -------------------------------------------------------------------------

    /// Recompute every content hash in `[from_seq, to_seq]` (1-based,
    /// inclusive; pass `None` for the full chain) and confirm each record
    /// links to its predecessor.
    pub fn verify_chain(
        &self,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<ChainReport, StoreError> {
        let inner = self.inner.lock();

        let lo = from_seq.unwrap_or(1) as i64;
        let hi = to_seq.map(|v| v as i64).unwrap_or(i64::MAX);

        let mut stmt = inner.conn.prepare(
            "SELECT seq, record FROM signals WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![lo, hi], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        // When verifying a sub-range, the first record's back-link is taken
        // on faith; full-chain verification starts from the genesis record.
        let mut expected_prev: Option<String> = None;
        let mut verified = 0u64;

        for row in rows {
            let (seq, record) = row?;
            let signal = from_canonical_json(&record)?;

            let recomputed = content_hash(&signal)?;
            if recomputed != signal.signal_id {
                warn!(seq, signal_id = %signal.signal_id, "chain verification: content hash mismatch");
                return Err(StoreError::ChainBroken {
                    signal_id: signal.signal_id,
                    detail: format!("content hash mismatch at seq {seq}: recomputed {recomputed}"),
                });
            }

            match &expected_prev {
                Some(prev) if &signal.prev_signal_hash != prev => {
                    warn!(seq, signal_id = %signal.signal_id, "chain verification: broken link");
                    return Err(StoreError::ChainBroken {
                        signal_id: signal.signal_id,
                        detail: format!(
                            "prev_signal_hash {} does not match predecessor {prev} at seq {seq}",
                            signal.prev_signal_hash
                        ),
                    });
                }
                None if seq == 1 && !signal.prev_signal_hash.is_empty() => {
                    return Err(StoreError::ChainBroken {
                        signal_id: signal.signal_id,
                        detail: "genesis record has a non-empty prev_signal_hash".into(),
                    });
                }
                _ => {}
            }

            expected_prev = Some(signal.signal_id);
            verified += 1;
        }

        Ok(ChainReport {
            records_verified: verified,
        })
    }
}

impl std::fmt::Debug for SignalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalStore")
            .field("head", &self.inner.lock().head)
            .finish()
    }
}
