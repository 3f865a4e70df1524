//! Bidding persistence on sqlite.
//!
//! WAL mode for concurrent reads during writes; every multi-row transition
//! (accept, close-and-expire, cancel-on-order-event) is one transaction, so a
//! window and its bids can never be observed half-moved. Uniqueness
//! constraints back the idempotency-key and single-accepted-bid invariants.

use crate::bidding::error::BidError;
use crate::bidding::models::{
    AuditKind, Bid, BidAuditEvent, BidStatus, BidStrategy, BiddingWindow, PorterFilter,
    PorterMetadata, StrategyWeights, WindowStatus,
};
use crate::events::WindowOutcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS bidding_windows (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    strategy_id TEXT NOT NULL,
    minimum_bid_cents INTEGER NOT NULL,
    reserve_price_cents INTEGER,
    porter_filter TEXT,
    max_bids_per_porter INTEGER NOT NULL,
    open_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    closed_at TEXT,
    created_by TEXT NOT NULL,
    correlation_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_windows_status_expiry
    ON bidding_windows(status, expires_at);

-- join table instead of an array column so order lookups stay indexed
CREATE TABLE IF NOT EXISTS window_orders (
    window_id TEXT NOT NULL REFERENCES bidding_windows(id),
    order_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (window_id, order_id)
);

CREATE INDEX IF NOT EXISTS idx_window_orders_order ON window_orders(order_id);

CREATE TABLE IF NOT EXISTS bids (
    id TEXT PRIMARY KEY,
    window_id TEXT NOT NULL REFERENCES bidding_windows(id),
    porter_id TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    eta_minutes INTEGER NOT NULL,
    status TEXT NOT NULL,
    placed_at TEXT NOT NULL,
    accepted_at TEXT,
    cancelled_at TEXT,
    expired_at TEXT,
    idempotency_key TEXT NOT NULL UNIQUE,
    cancel_reason TEXT,
    accepted_by TEXT,
    metadata TEXT,
    correlation_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bids_window ON bids(window_id, status);
CREATE INDEX IF NOT EXISTS idx_bids_porter ON bids(porter_id, status);

-- at most one ACCEPTED bid per window, enforced by the engine itself
CREATE UNIQUE INDEX IF NOT EXISTS idx_bids_one_accepted
    ON bids(window_id) WHERE status = 'ACCEPTED';

CREATE TABLE IF NOT EXISTS bid_strategies (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    price_weight REAL NOT NULL,
    eta_weight REAL NOT NULL,
    rating_weight REAL NOT NULL,
    reliability_weight REAL NOT NULL,
    distance_weight REAL NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS bid_audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bid_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    actor TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_bid ON bid_audit_events(bid_id, id);
"#;

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_ts_from_sql(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(ts_from_sql).transpose()
}

/// Result of the atomic accept transaction.
#[derive(Debug)]
pub struct AcceptResult {
    pub window: BiddingWindow,
    pub bid: Bid,
    pub expired_bids: Vec<Bid>,
}

/// Result of the atomic close-and-expire transaction.
#[derive(Debug)]
pub struct CloseResult {
    pub window: BiddingWindow,
    pub expired_bids: Vec<Bid>,
    pub total_bids: u64,
    pub outcome: WindowOutcome,
}

/// Result of cancelling a window because its order was cancelled.
#[derive(Debug)]
pub struct CancelWindowResult {
    pub window: BiddingWindow,
    pub cancelled_bids: Vec<Bid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BiddingStatistics {
    pub windows_by_status: BTreeMap<String, i64>,
    pub bids_by_status: BTreeMap<String, i64>,
    pub strategies_active: i64,
}

pub struct BiddingDb {
    conn: Mutex<Connection>,
}

impl BiddingDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(&path).with_context(|| {
            format!("failed to open bidding db at {}", path.as_ref().display())
        })?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply bidding schema")?;
        info!(path = %path.as_ref().display(), "bidding database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private on-disk-free database; used by tests and local tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ----- windows -----

    pub fn insert_window(&self, window: &BiddingWindow) -> Result<(), BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO bidding_windows
             (id, status, strategy_id, minimum_bid_cents, reserve_price_cents, porter_filter,
              max_bids_per_porter, open_at, expires_at, closed_at, created_by, correlation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                window.id,
                window.status.as_str(),
                window.strategy_id,
                window.minimum_bid_cents,
                window.reserve_price_cents,
                window
                    .porter_filter
                    .as_ref()
                    .map(|f| serde_json::to_string(f).unwrap_or_default()),
                window.max_bids_per_porter,
                ts_to_sql(window.open_at),
                ts_to_sql(window.expires_at),
                window.closed_at.map(ts_to_sql),
                window.created_by,
                window.correlation_id,
            ],
        )?;
        for (position, order_id) in window.order_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO window_orders (window_id, order_id, position) VALUES (?1, ?2, ?3)",
                params![window.id, order_id, position as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_window_tx(tx: &Transaction<'_>, window_id: &str) -> rusqlite::Result<Option<BiddingWindow>> {
        let base = tx
            .query_row(
                "SELECT id, status, strategy_id, minimum_bid_cents, reserve_price_cents,
                        porter_filter, max_bids_per_porter, open_at, expires_at, closed_at,
                        created_by, correlation_id
                 FROM bidding_windows WHERE id = ?1",
                params![window_id],
                Self::window_from_row,
            )
            .optional()?;
        let Some(mut window) = base else {
            return Ok(None);
        };
        let mut stmt =
            tx.prepare("SELECT order_id FROM window_orders WHERE window_id = ?1 ORDER BY position")?;
        let order_ids = stmt
            .query_map(params![window_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        window.order_ids = order_ids;
        Ok(Some(window))
    }

    fn window_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BiddingWindow> {
        let status: String = row.get(1)?;
        let filter: Option<String> = row.get(5)?;
        let open_at: String = row.get(7)?;
        let expires_at: String = row.get(8)?;
        let closed_at: Option<String> = row.get(9)?;
        Ok(BiddingWindow {
            id: row.get(0)?,
            order_ids: Vec::new(),
            status: WindowStatus::parse(&status).unwrap_or(WindowStatus::Closed),
            strategy_id: row.get(2)?,
            minimum_bid_cents: row.get(3)?,
            reserve_price_cents: row.get(4)?,
            porter_filter: filter
                .as_deref()
                .and_then(|f| serde_json::from_str::<PorterFilter>(f).ok()),
            max_bids_per_porter: row.get(6)?,
            open_at: ts_from_sql(&open_at)?,
            expires_at: ts_from_sql(&expires_at)?,
            closed_at: opt_ts_from_sql(closed_at)?,
            created_by: row.get(10)?,
            correlation_id: row.get(11)?,
        })
    }

    pub fn get_window(&self, window_id: &str) -> Result<Option<BiddingWindow>, BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let window = Self::load_window_tx(&tx, window_id)?;
        tx.commit()?;
        Ok(window)
    }

    /// Ids of OPEN windows whose deadline has passed.
    pub fn expired_open_window_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>, BidError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM bidding_windows WHERE status = 'OPEN' AND expires_at <= ?1",
        )?;
        let ids = stmt
            .query_map(params![ts_to_sql(now)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Ids of OPEN windows covering the given order.
    pub fn open_window_ids_for_order(&self, order_id: &str) -> Result<Vec<String>, BidError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT w.id FROM bidding_windows w
             JOIN window_orders wo ON wo.window_id = w.id
             WHERE wo.order_id = ?1 AND w.status = 'OPEN'",
        )?;
        let ids = stmt
            .query_map(params![order_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    // ----- bids -----

    pub fn find_bid_by_idempotency_key(&self, key: &str) -> Result<Option<Bid>, BidError> {
        let conn = self.conn.lock();
        let bid = conn
            .query_row(
                &format!("{BID_SELECT} WHERE idempotency_key = ?1"),
                params![key],
                Self::bid_from_row,
            )
            .optional()?;
        Ok(bid)
    }

    pub fn get_bid(&self, bid_id: &str) -> Result<Option<Bid>, BidError> {
        let conn = self.conn.lock();
        let bid = conn
            .query_row(
                &format!("{BID_SELECT} WHERE id = ?1"),
                params![bid_id],
                Self::bid_from_row,
            )
            .optional()?;
        Ok(bid)
    }

    /// PLACED or ACCEPTED bids this porter holds in the window.
    pub fn count_live_bids(&self, window_id: &str, porter_id: &str) -> Result<u32, BidError> {
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM bids
             WHERE window_id = ?1 AND porter_id = ?2 AND status IN ('PLACED', 'ACCEPTED')",
            params![window_id, porter_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_bids(&self, window_id: &str) -> Result<u64, BidError> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM bids WHERE window_id = ?1",
            params![window_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn placed_bids_for_window(&self, window_id: &str) -> Result<Vec<Bid>, BidError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{BID_SELECT} WHERE window_id = ?1 AND status = 'PLACED' ORDER BY placed_at"
        ))?;
        let bids = stmt
            .query_map(params![window_id], Self::bid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bids)
    }

    /// Insert a new PLACED bid with its audit record. A concurrent insert on
    /// the same idempotency key loses the UNIQUE race; the caller re-reads
    /// and returns the original.
    pub fn insert_bid(&self, bid: &Bid) -> Result<bool, BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO bids
             (id, window_id, porter_id, amount_cents, eta_minutes, status, placed_at,
              accepted_at, cancelled_at, expired_at, idempotency_key, cancel_reason,
              accepted_by, metadata, correlation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                bid.id,
                bid.window_id,
                bid.porter_id,
                bid.amount_cents,
                bid.eta_minutes,
                bid.status.as_str(),
                ts_to_sql(bid.placed_at),
                bid.accepted_at.map(ts_to_sql),
                bid.cancelled_at.map(ts_to_sql),
                bid.expired_at.map(ts_to_sql),
                bid.idempotency_key,
                bid.cancel_reason,
                bid.accepted_by,
                if bid.metadata.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&bid.metadata).unwrap_or_default())
                },
                bid.correlation_id,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        Self::insert_audit_tx(
            &tx,
            &bid.id,
            AuditKind::Placed,
            serde_json::json!({
                "windowId": bid.window_id,
                "amountCents": bid.amount_cents,
                "etaMinutes": bid.eta_minutes,
            }),
            &bid.porter_id,
            &bid.correlation_id,
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn bid_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bid> {
        let status: String = row.get(5)?;
        let placed_at: String = row.get(6)?;
        let accepted_at: Option<String> = row.get(7)?;
        let cancelled_at: Option<String> = row.get(8)?;
        let expired_at: Option<String> = row.get(9)?;
        let metadata: Option<String> = row.get(13)?;
        Ok(Bid {
            id: row.get(0)?,
            window_id: row.get(1)?,
            porter_id: row.get(2)?,
            amount_cents: row.get(3)?,
            eta_minutes: row.get(4)?,
            status: BidStatus::parse(&status).unwrap_or(BidStatus::Expired),
            placed_at: ts_from_sql(&placed_at)?,
            accepted_at: opt_ts_from_sql(accepted_at)?,
            cancelled_at: opt_ts_from_sql(cancelled_at)?,
            expired_at: opt_ts_from_sql(expired_at)?,
            idempotency_key: row.get(10)?,
            cancel_reason: row.get(11)?,
            accepted_by: row.get(12)?,
            metadata: metadata
                .as_deref()
                .and_then(|m| serde_json::from_str::<PorterMetadata>(m).ok())
                .unwrap_or_default(),
            correlation_id: row.get(14)?,
        })
    }

    // ----- atomic transitions -----

    /// The race-safe winner selection: accept one bid, close the window,
    /// expire every other PLACED bid, append the audit record — atomically.
    pub fn accept_bid(
        &self,
        window_id: &str,
        bid_id: &str,
        accepted_by: &str,
        correlation_id: &str,
    ) -> Result<AcceptResult, BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let window = Self::load_window_tx(&tx, window_id)?.ok_or(BidError::WindowNotFound)?;
        if window.status != WindowStatus::Open {
            return Err(BidError::WindowNotOpen);
        }
        let bid = tx
            .query_row(
                &format!("{BID_SELECT} WHERE id = ?1"),
                params![bid_id],
                Self::bid_from_row,
            )
            .optional()?
            .ok_or(BidError::BidNotFound)?;
        if bid.window_id != window_id {
            return Err(BidError::BidWrongWindow);
        }
        if bid.status != BidStatus::Placed {
            return Err(BidError::BidNotPlaced);
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE bids SET status = 'ACCEPTED', accepted_at = ?1, accepted_by = ?2 WHERE id = ?3",
            params![ts_to_sql(now), accepted_by, bid_id],
        )?;
        tx.execute(
            "UPDATE bidding_windows SET status = 'CLOSED', closed_at = ?1 WHERE id = ?2",
            params![ts_to_sql(now), window_id],
        )?;
        tx.execute(
            "UPDATE bids SET status = 'EXPIRED', expired_at = ?1
             WHERE window_id = ?2 AND status = 'PLACED' AND id <> ?3",
            params![ts_to_sql(now), window_id, bid_id],
        )?;
        Self::insert_audit_tx(
            &tx,
            bid_id,
            AuditKind::Accepted,
            serde_json::json!({ "windowId": window_id, "acceptedBy": accepted_by }),
            accepted_by,
            correlation_id,
        )?;

        let mut stmt = tx.prepare(&format!(
            "{BID_SELECT} WHERE window_id = ?1 AND status = 'EXPIRED' AND expired_at = ?2"
        ))?;
        let expired_bids = stmt
            .query_map(params![window_id, ts_to_sql(now)], Self::bid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let accepted = tx.query_row(
            &format!("{BID_SELECT} WHERE id = ?1"),
            params![bid_id],
            Self::bid_from_row,
        )?;
        let closed_window = Self::load_window_tx(&tx, window_id)?.ok_or(BidError::WindowNotFound)?;
        tx.commit()?;

        Ok(AcceptResult {
            window: closed_window,
            bid: accepted,
            expired_bids,
        })
    }

    /// Close an OPEN window (deadline or explicit) and expire its PLACED
    /// bids atomically.
    pub fn close_window(&self, window_id: &str) -> Result<CloseResult, BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let window = Self::load_window_tx(&tx, window_id)?.ok_or(BidError::WindowNotFound)?;
        if window.status != WindowStatus::Open {
            return Err(BidError::WindowNotOpen);
        }

        let now = Utc::now();
        let total_bids: u64 = tx.query_row(
            "SELECT COUNT(*) FROM bids WHERE window_id = ?1",
            params![window_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "UPDATE bids SET status = 'EXPIRED', expired_at = ?1
             WHERE window_id = ?2 AND status = 'PLACED'",
            params![ts_to_sql(now), window_id],
        )?;
        tx.execute(
            "UPDATE bidding_windows SET status = 'CLOSED', closed_at = ?1 WHERE id = ?2",
            params![ts_to_sql(now), window_id],
        )?;

        let mut stmt = tx.prepare(&format!(
            "{BID_SELECT} WHERE window_id = ?1 AND status = 'EXPIRED' AND expired_at = ?2"
        ))?;
        let expired_bids = stmt
            .query_map(params![window_id, ts_to_sql(now)], Self::bid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for bid in &expired_bids {
            Self::insert_audit_tx(
                &tx,
                &bid.id,
                AuditKind::Expired,
                serde_json::json!({ "windowId": window_id }),
                "system",
                &window.correlation_id,
            )?;
        }

        let closed = Self::load_window_tx(&tx, window_id)?.ok_or(BidError::WindowNotFound)?;
        tx.commit()?;

        let outcome = if total_bids == 0 {
            WindowOutcome::NoBids
        } else {
            WindowOutcome::Expired
        };
        Ok(CloseResult {
            window: closed,
            expired_bids,
            total_bids,
            outcome,
        })
    }

    /// Cancel an OPEN window because its order was cancelled. Returns `None`
    /// when the window is already terminal, making event redelivery a no-op.
    pub fn cancel_window(
        &self,
        window_id: &str,
        reason: &str,
    ) -> Result<Option<CancelWindowResult>, BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let window = Self::load_window_tx(&tx, window_id)?.ok_or(BidError::WindowNotFound)?;
        if window.status != WindowStatus::Open {
            return Ok(None);
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE bidding_windows SET status = 'CANCELLED', closed_at = ?1 WHERE id = ?2",
            params![ts_to_sql(now), window_id],
        )?;
        tx.execute(
            "UPDATE bids SET status = 'CANCELLED', cancelled_at = ?1, cancel_reason = ?2
             WHERE window_id = ?3 AND status = 'PLACED'",
            params![ts_to_sql(now), reason, window_id],
        )?;

        let mut stmt = tx.prepare(&format!(
            "{BID_SELECT} WHERE window_id = ?1 AND status = 'CANCELLED' AND cancelled_at = ?2"
        ))?;
        let cancelled_bids = stmt
            .query_map(params![window_id, ts_to_sql(now)], Self::bid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for bid in &cancelled_bids {
            Self::insert_audit_tx(
                &tx,
                &bid.id,
                AuditKind::Cancelled,
                serde_json::json!({ "windowId": window_id, "reason": reason }),
                "system",
                &window.correlation_id,
            )?;
        }

        let cancelled = Self::load_window_tx(&tx, window_id)?.ok_or(BidError::WindowNotFound)?;
        tx.commit()?;
        Ok(Some(CancelWindowResult {
            window: cancelled,
            cancelled_bids,
        }))
    }

    /// Porter-initiated cancel of a single PLACED bid.
    pub fn cancel_bid(
        &self,
        bid_id: &str,
        reason: &str,
        actor: &str,
        correlation_id: &str,
    ) -> Result<Bid, BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let bid = tx
            .query_row(
                &format!("{BID_SELECT} WHERE id = ?1"),
                params![bid_id],
                Self::bid_from_row,
            )
            .optional()?
            .ok_or(BidError::BidNotFound)?;
        if bid.status != BidStatus::Placed {
            return Err(BidError::BidTerminal);
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE bids SET status = 'CANCELLED', cancelled_at = ?1, cancel_reason = ?2 WHERE id = ?3",
            params![ts_to_sql(now), reason, bid_id],
        )?;
        Self::insert_audit_tx(
            &tx,
            bid_id,
            AuditKind::Cancelled,
            serde_json::json!({ "reason": reason }),
            actor,
            correlation_id,
        )?;
        let cancelled = tx.query_row(
            &format!("{BID_SELECT} WHERE id = ?1"),
            params![bid_id],
            Self::bid_from_row,
        )?;
        tx.commit()?;
        Ok(cancelled)
    }

    /// Cancel every PLACED bid by this porter across all windows. Idempotent
    /// by construction: already-terminal bids are untouched.
    pub fn cancel_bids_for_porter(
        &self,
        porter_id: &str,
        reason: &str,
        correlation_id: &str,
    ) -> Result<Vec<Bid>, BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let now = Utc::now();
        tx.execute(
            "UPDATE bids SET status = 'CANCELLED', cancelled_at = ?1, cancel_reason = ?2
             WHERE porter_id = ?3 AND status = 'PLACED'",
            params![ts_to_sql(now), reason, porter_id],
        )?;
        let mut stmt = tx.prepare(&format!(
            "{BID_SELECT} WHERE porter_id = ?1 AND status = 'CANCELLED' AND cancelled_at = ?2"
        ))?;
        let cancelled = stmt
            .query_map(params![porter_id, ts_to_sql(now)], Self::bid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for bid in &cancelled {
            Self::insert_audit_tx(
                &tx,
                &bid.id,
                AuditKind::Cancelled,
                serde_json::json!({ "reason": reason }),
                "system",
                correlation_id,
            )?;
        }
        tx.commit()?;
        Ok(cancelled)
    }

    // ----- queries for the RPC surface -----

    /// PLACED bids in OPEN windows covering `order_id`, newest first.
    pub fn active_bids_for_order(
        &self,
        order_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Bid>, u64), BidError> {
        let conn = self.conn.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM bids b
             JOIN bidding_windows w ON w.id = b.window_id
             JOIN window_orders wo ON wo.window_id = w.id
             WHERE wo.order_id = ?1 AND w.status = 'OPEN' AND b.status = 'PLACED'",
            params![order_id],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT b.id, b.window_id, b.porter_id, b.amount_cents, b.eta_minutes, b.status,
                    b.placed_at, b.accepted_at, b.cancelled_at, b.expired_at, b.idempotency_key,
                    b.cancel_reason, b.accepted_by, b.metadata, b.correlation_id
             FROM bids b
             JOIN bidding_windows w ON w.id = b.window_id
             JOIN window_orders wo ON wo.window_id = w.id
             WHERE wo.order_id = ?1 AND w.status = 'OPEN' AND b.status = 'PLACED'
             ORDER BY b.placed_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let offset = u64::from(page.saturating_sub(1)) * u64::from(page_size);
        let bids = stmt
            .query_map(
                params![order_id, page_size, offset],
                Self::bid_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((bids, total))
    }

    pub fn bids_for_porter(
        &self,
        porter_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Bid>, u64), BidError> {
        let conn = self.conn.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM bids WHERE porter_id = ?1",
            params![porter_id],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "{BID_SELECT} WHERE porter_id = ?1 ORDER BY placed_at DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let offset = u64::from(page.saturating_sub(1)) * u64::from(page_size);
        let bids = stmt
            .query_map(params![porter_id, page_size, offset], Self::bid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((bids, total))
    }

    pub fn statistics(&self) -> Result<BiddingStatistics, BidError> {
        let conn = self.conn.lock();
        let mut windows_by_status = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM bidding_windows GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            windows_by_status.insert(status, count);
        }
        drop(stmt);

        let mut bids_by_status = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM bids GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            bids_by_status.insert(status, count);
        }
        drop(stmt);

        let strategies_active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bid_strategies WHERE active = 1",
            [],
            |row| row.get(0),
        )?;

        Ok(BiddingStatistics {
            windows_by_status,
            bids_by_status,
            strategies_active,
        })
    }

    // ----- strategies -----

    pub fn get_strategy(&self, strategy_id: &str) -> Result<Option<BidStrategy>, BidError> {
        let conn = self.conn.lock();
        let strategy = conn
            .query_row(
                "SELECT id, name, description, price_weight, eta_weight, rating_weight,
                        reliability_weight, distance_weight, active
                 FROM bid_strategies WHERE id = ?1",
                params![strategy_id],
                Self::strategy_from_row,
            )
            .optional()?;
        Ok(strategy)
    }

    pub fn list_strategies(&self) -> Result<Vec<BidStrategy>, BidError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, price_weight, eta_weight, rating_weight,
                    reliability_weight, distance_weight, active
             FROM bid_strategies ORDER BY id",
        )?;
        let strategies = stmt
            .query_map([], Self::strategy_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(strategies)
    }

    pub fn insert_strategy(&self, strategy: &BidStrategy) -> Result<(), BidError> {
        strategy
            .weights
            .validate()
            .map_err(BidError::Validation)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bid_strategies
             (id, name, description, price_weight, eta_weight, rating_weight,
              reliability_weight, distance_weight, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                strategy.id,
                strategy.name,
                strategy.description,
                strategy.weights.price_weight,
                strategy.weights.eta_weight,
                strategy.weights.rating_weight,
                strategy.weights.reliability_weight,
                strategy.weights.distance_weight,
                strategy.active as i64,
            ],
        )?;
        Ok(())
    }

    /// Insert the default strategy when absent so a fresh deployment can open
    /// windows immediately.
    pub fn seed_default_strategy(&self, strategy_id: &str) -> Result<(), BidError> {
        let weights = StrategyWeights::balanced();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO bid_strategies
             (id, name, description, price_weight, eta_weight, rating_weight,
              reliability_weight, distance_weight, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
            params![
                strategy_id,
                "Balanced",
                "Default multi-criteria strategy",
                weights.price_weight,
                weights.eta_weight,
                weights.rating_weight,
                weights.reliability_weight,
                weights.distance_weight,
            ],
        )?;
        Ok(())
    }

    fn strategy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BidStrategy> {
        Ok(BidStrategy {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            weights: StrategyWeights {
                price_weight: row.get(3)?,
                eta_weight: row.get(4)?,
                rating_weight: row.get(5)?,
                reliability_weight: row.get(6)?,
                distance_weight: row.get(7)?,
            },
            active: row.get::<_, i64>(8)? != 0,
        })
    }

    // ----- audit -----

    fn insert_audit_tx(
        tx: &Transaction<'_>,
        bid_id: &str,
        kind: AuditKind,
        payload: serde_json::Value,
        actor: &str,
        correlation_id: &str,
    ) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO bid_audit_events (bid_id, kind, payload, actor, correlation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                bid_id,
                kind.as_str(),
                payload.to_string(),
                actor,
                correlation_id,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Append an audit record outside a transition (e.g. EVALUATED).
    pub fn append_audit(
        &self,
        bid_id: &str,
        kind: AuditKind,
        payload: serde_json::Value,
        actor: &str,
        correlation_id: &str,
    ) -> Result<(), BidError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::insert_audit_tx(&tx, bid_id, kind, payload, actor, correlation_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn audit_for_bid(&self, bid_id: &str) -> Result<Vec<BidAuditEvent>, BidError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, bid_id, kind, payload, actor, correlation_id, created_at
             FROM bid_audit_events WHERE bid_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![bid_id], |row| {
                let kind: String = row.get(2)?;
                let payload: String = row.get(3)?;
                let created_at: String = row.get(6)?;
                Ok(BidAuditEvent {
                    id: row.get(0)?,
                    bid_id: row.get(1)?,
                    kind: AuditKind::parse(&kind).unwrap_or(AuditKind::Evaluated),
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::Null),
                    actor: row.get(4)?,
                    correlation_id: row.get(5)?,
                    created_at: ts_from_sql(&created_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

const BID_SELECT: &str = "SELECT id, window_id, porter_id, amount_cents, eta_minutes, status, \
     placed_at, accepted_at, cancelled_at, expired_at, idempotency_key, cancel_reason, \
     accepted_by, metadata, correlation_id FROM bids";

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn window(id: &str, orders: &[&str]) -> BiddingWindow {
        let now = Utc::now();
        BiddingWindow {
            id: id.to_string(),
            order_ids: orders.iter().map(|o| o.to_string()).collect(),
            status: WindowStatus::Open,
            strategy_id: "balanced-v1".to_string(),
            minimum_bid_cents: 0,
            reserve_price_cents: None,
            porter_filter: None,
            max_bids_per_porter: 3,
            open_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            closed_at: None,
            created_by: "u-1".to_string(),
            correlation_id: format!("corr-{id}"),
        }
    }

    fn bid(id: &str, window_id: &str, porter_id: &str, amount: i64) -> Bid {
        Bid {
            id: id.to_string(),
            window_id: window_id.to_string(),
            porter_id: porter_id.to_string(),
            amount_cents: amount,
            eta_minutes: 30,
            status: BidStatus::Placed,
            placed_at: Utc::now(),
            accepted_at: None,
            cancelled_at: None,
            expired_at: None,
            idempotency_key: Uuid::new_v4().to_string(),
            cancel_reason: None,
            accepted_by: None,
            metadata: PorterMetadata::default(),
            correlation_id: format!("corr-{id}"),
        }
    }

    #[test]
    fn test_window_round_trip() {
        let db = BiddingDb::open_in_memory().unwrap();
        let w = window("w-1", &["o-1", "o-2"]);
        db.insert_window(&w).unwrap();

        let loaded = db.get_window("w-1").unwrap().unwrap();
        assert_eq!(loaded.order_ids, vec!["o-1", "o-2"]);
        assert_eq!(loaded.status, WindowStatus::Open);
        assert_eq!(loaded.correlation_id, "corr-w-1");
        assert!(db.get_window("w-missing").unwrap().is_none());
    }

    #[test]
    fn test_accept_expires_siblings_atomically() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-1", &["o-1"])).unwrap();
        db.insert_bid(&bid("b-1", "w-1", "p-1", 10_000)).unwrap();
        db.insert_bid(&bid("b-2", "w-1", "p-2", 12_000)).unwrap();
        db.insert_bid(&bid("b-3", "w-1", "p-3", 9_000)).unwrap();

        let result = db.accept_bid("w-1", "b-1", "u-1", "corr").unwrap();
        assert_eq!(result.bid.status, BidStatus::Accepted);
        assert_eq!(result.bid.accepted_by.as_deref(), Some("u-1"));
        assert_eq!(result.window.status, WindowStatus::Closed);
        assert!(result.window.closed_at.is_some());
        assert_eq!(result.expired_bids.len(), 2);

        // second accept on any bid fails on window state
        let err = db.accept_bid("w-1", "b-2", "u-1", "corr").unwrap_err();
        assert!(matches!(err, BidError::WindowNotOpen));
    }

    #[test]
    fn test_accept_rejects_wrong_window_and_terminal_bids() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-1", &["o-1"])).unwrap();
        db.insert_window(&window("w-2", &["o-2"])).unwrap();
        db.insert_bid(&bid("b-1", "w-1", "p-1", 10_000)).unwrap();

        assert!(matches!(
            db.accept_bid("w-2", "b-1", "u-1", "corr").unwrap_err(),
            BidError::BidWrongWindow
        ));
        assert!(matches!(
            db.accept_bid("w-1", "b-missing", "u-1", "corr").unwrap_err(),
            BidError::BidNotFound
        ));

        let cancelled = db.cancel_bid("b-1", "changed my mind", "p-1", "corr").unwrap();
        assert_eq!(cancelled.status, BidStatus::Cancelled);
        assert!(matches!(
            db.accept_bid("w-1", "b-1", "u-1", "corr").unwrap_err(),
            BidError::BidNotPlaced
        ));
    }

    #[test]
    fn test_idempotency_key_unique() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-1", &["o-1"])).unwrap();
        let mut first = bid("b-1", "w-1", "p-1", 10_000);
        first.idempotency_key = "k1".to_string();
        assert!(db.insert_bid(&first).unwrap());

        let mut dup = bid("b-2", "w-1", "p-1", 11_000);
        dup.idempotency_key = "k1".to_string();
        assert!(!db.insert_bid(&dup).unwrap());

        let found = db.find_bid_by_idempotency_key("k1").unwrap().unwrap();
        assert_eq!(found.id, "b-1");
        assert!(db.get_bid("b-2").unwrap().is_none());
    }

    #[test]
    fn test_close_window_outcomes() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-empty", &["o-1"])).unwrap();
        let empty = db.close_window("w-empty").unwrap();
        assert_eq!(empty.outcome, WindowOutcome::NoBids);
        assert_eq!(empty.total_bids, 0);

        db.insert_window(&window("w-bids", &["o-2"])).unwrap();
        db.insert_bid(&bid("b-1", "w-bids", "p-1", 10_000)).unwrap();
        let with_bids = db.close_window("w-bids").unwrap();
        assert_eq!(with_bids.outcome, WindowOutcome::Expired);
        assert_eq!(with_bids.expired_bids.len(), 1);

        // already closed
        assert!(matches!(
            db.close_window("w-bids").unwrap_err(),
            BidError::WindowNotOpen
        ));
    }

    #[test]
    fn test_cancel_window_is_idempotent() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-1", &["o-1"])).unwrap();
        db.insert_bid(&bid("b-1", "w-1", "p-1", 10_000)).unwrap();

        let first = db.cancel_window("w-1", "order cancelled").unwrap().unwrap();
        assert_eq!(first.window.status, WindowStatus::Cancelled);
        assert_eq!(first.cancelled_bids.len(), 1);
        assert_eq!(
            first.cancelled_bids[0].cancel_reason.as_deref(),
            Some("order cancelled")
        );

        // redelivery
        assert!(db.cancel_window("w-1", "order cancelled").unwrap().is_none());
    }

    #[test]
    fn test_cancel_bids_for_porter_spares_terminal() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-1", &["o-1"])).unwrap();
        db.insert_window(&window("w-2", &["o-2"])).unwrap();
        db.insert_bid(&bid("b-1", "w-1", "p-1", 10_000)).unwrap();
        db.insert_bid(&bid("b-2", "w-2", "p-1", 9_000)).unwrap();
        db.insert_bid(&bid("b-3", "w-2", "p-2", 8_000)).unwrap();
        db.accept_bid("w-1", "b-1", "u-1", "corr").unwrap();

        let cancelled = db
            .cancel_bids_for_porter("p-1", "porter suspended", "corr")
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, "b-2");
        // accepted bid untouched
        assert_eq!(db.get_bid("b-1").unwrap().unwrap().status, BidStatus::Accepted);
        // other porter untouched
        assert_eq!(db.get_bid("b-3").unwrap().unwrap().status, BidStatus::Placed);
    }

    #[test]
    fn test_expired_open_window_scan() {
        let db = BiddingDb::open_in_memory().unwrap();
        let mut overdue = window("w-old", &["o-1"]);
        overdue.expires_at = Utc::now() - chrono::Duration::seconds(10);
        db.insert_window(&overdue).unwrap();
        db.insert_window(&window("w-fresh", &["o-2"])).unwrap();

        let ids = db.expired_open_window_ids(Utc::now()).unwrap();
        assert_eq!(ids, vec!["w-old".to_string()]);
    }

    #[test]
    fn test_active_bids_for_order_pagination() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-1", &["o-1"])).unwrap();
        for i in 0..5 {
            db.insert_bid(&bid(&format!("b-{i}"), "w-1", &format!("p-{i}"), 10_000 + i))
                .unwrap();
        }
        let (page1, total) = db.active_bids_for_order("o-1", 1, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        let (page3, _) = db.active_bids_for_order("o-1", 3, 2).unwrap();
        assert_eq!(page3.len(), 1);

        db.close_window("w-1").unwrap();
        let (_, total_after) = db.active_bids_for_order("o-1", 1, 10).unwrap();
        assert_eq!(total_after, 0);
    }

    #[test]
    fn test_strategy_seed_and_validation() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.seed_default_strategy("balanced-v1").unwrap();
        db.seed_default_strategy("balanced-v1").unwrap(); // idempotent

        let strategy = db.get_strategy("balanced-v1").unwrap().unwrap();
        assert!(strategy.active);
        assert!(strategy.weights.validate().is_ok());

        let bad = BidStrategy {
            id: "bad".to_string(),
            name: "Broken".to_string(),
            description: None,
            weights: StrategyWeights {
                price_weight: 0.9,
                eta_weight: 0.9,
                rating_weight: 0.0,
                reliability_weight: 0.0,
                distance_weight: 0.0,
            },
            active: true,
        };
        assert!(matches!(
            db.insert_strategy(&bad).unwrap_err(),
            BidError::Validation(_)
        ));
    }

    #[test]
    fn test_on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bidding.db");
        {
            let db = BiddingDb::open(&path).unwrap();
            db.insert_window(&window("w-1", &["o-1"])).unwrap();
            db.insert_bid(&bid("b-1", "w-1", "p-1", 10_000)).unwrap();
        }
        let db = BiddingDb::open(&path).unwrap();
        let loaded = db.get_window("w-1").unwrap().unwrap();
        assert_eq!(loaded.order_ids, vec!["o-1"]);
        assert_eq!(db.get_bid("b-1").unwrap().unwrap().amount_cents, 10_000);
    }

    #[test]
    fn test_audit_trail_appends() {
        let db = BiddingDb::open_in_memory().unwrap();
        db.insert_window(&window("w-1", &["o-1"])).unwrap();
        db.insert_bid(&bid("b-1", "w-1", "p-1", 10_000)).unwrap();
        db.accept_bid("w-1", "b-1", "u-1", "corr").unwrap();

        let trail = db.audit_for_bid("b-1").unwrap();
        let kinds: Vec<_> = trail.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::Placed, AuditKind::Accepted]);
    }
}
