// Execution Ledger Store
// SQLite persistence for execution records with status-guarded updates
//
// Every update is conditional on the status the caller last observed, so two
// writers racing on the same record cannot both win. Terminal records are
// never modified.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::broker::OrderStatus;
use crate::error::{CoreError, CoreResult};
use crate::ledger::resolver::{resolve_status, summarize, LogicalOrderSummary};
use crate::ledger::{ExecutionRecord, ExecutionSide, ExecutionUpdate, NewExecution};
use crate::types::{BrokerId, Money};

const RECORD_COLUMNS: &str = "id, logical_order_id, broker_id, side, direction, symbol, status, \
     quantity, executed_quantity, execution_price, broker_order_id, order_type, product_type, \
     exit_kind, note, created_at, updated_at";

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let text: String = row.get(idx)?;
    T::from_str(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_opt_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => T::from_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())),
        None => Ok(None),
    }
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        logical_order_id: row.get(1)?,
        broker_id: BrokerId::new(row.get::<_, String>(2)?),
        side: parse_text(row, 3)?,
        direction: parse_text(row, 4)?,
        symbol: row.get(5)?,
        status: parse_text(row, 6)?,
        quantity: row.get(7)?,
        executed_quantity: row.get(8)?,
        execution_price: parse_opt_text::<Money>(row, 9)?,
        broker_order_id: row.get(10)?,
        order_type: row.get(11)?,
        product_type: row.get(12)?,
        exit_kind: parse_opt_text(row, 13)?,
        note: row.get(14)?,
        created_at: parse_time(row, 15)?,
        updated_at: parse_time(row, 16)?,
    })
}

/// Result of a retention cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub logical_orders: usize,
    pub records: usize,
}

// =============================================================================
// Ledger Implementation
// =============================================================================

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    writes: AtomicU64,
}

impl SqliteLedger {
    pub fn open<P: AsRef<Path>>(db_path: P) -> CoreResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CoreError::Configuration(format!(
                        "cannot create ledger directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let ledger = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "execution ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> CoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
            writes: AtomicU64::new(0),
        };
        ledger.create_tables()?;
        Ok(ledger)
    }

    fn conn(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CoreError::LockPoisoned)
    }

    fn create_tables(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS logical_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                strategy TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                logical_order_id INTEGER NOT NULL REFERENCES logical_orders(id) ON DELETE CASCADE,
                broker_id TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('ENTRY', 'EXIT')),
                direction TEXT NOT NULL,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                executed_quantity INTEGER NOT NULL DEFAULT 0,
                execution_price TEXT,
                broker_order_id TEXT,
                order_type TEXT,
                product_type TEXT,
                exit_kind TEXT,
                note TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_logical ON executions(logical_order_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_broker_order
                ON executions(broker_id, broker_order_id) WHERE broker_order_id IS NOT NULL;",
        )?;
        debug!("ledger schema created/verified");
        Ok(())
    }

    /// Effective writes since open. Status-guarded no-ops are not counted.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn create_logical_order(&self, symbol: &str, strategy: Option<&str>) -> CoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO logical_orders (symbol, strategy, created_at) VALUES (?1, ?2, ?3)",
            params![symbol, strategy, timestamp(Utc::now())],
        )?;
        let id = conn.last_insert_rowid();
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(logical_order_id = id, symbol, "logical order created");
        Ok(id)
    }

    /// Persist a broker-confirmed execution. EXIT records that would push the
    /// exited quantity past the filled entry quantity are rejected.
    pub fn insert(&self, new: &NewExecution) -> CoreResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if new.side == ExecutionSide::Exit && new.executed_quantity > 0 {
            check_exit_invariant(&tx, new.logical_order_id, &new.broker_id, new.executed_quantity, None)?;
        }

        let now = timestamp(Utc::now());
        tx.execute(
            "INSERT INTO executions
             (logical_order_id, broker_id, side, direction, symbol, status, quantity,
              executed_quantity, execution_price, broker_order_id, order_type, product_type,
              exit_kind, note, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                new.logical_order_id,
                new.broker_id.as_str(),
                new.side.as_str(),
                new.direction.as_str(),
                new.symbol,
                new.status.as_str(),
                new.quantity,
                new.executed_quantity,
                new.execution_price.map(|p| p.to_string()),
                new.broker_order_id,
                new.order_type,
                new.product_type,
                new.exit_kind.map(|k| k.as_str()),
                new.note,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        info!(
            record_id = id,
            logical_order_id = new.logical_order_id,
            broker = %new.broker_id,
            side = %new.side,
            status = %new.status,
            qty = new.executed_quantity,
            "execution recorded"
        );
        Ok(id)
    }

    /// Apply `update` only if the record is still in `expected` status.
    ///
    /// Returns `Ok(false)` without writing when the stored status moved on,
    /// the record is terminal, the update would shrink the executed quantity,
    /// or nothing would change.
    pub fn update_if_status(
        &self,
        record_id: i64,
        expected: OrderStatus,
        update: &ExecutionUpdate,
    ) -> CoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = load_record(&tx, record_id)?.ok_or(CoreError::RecordNotFound { record_id })?;
        if current.status != expected {
            debug!(record_id, expected = %expected, actual = %current.status, "status moved on, update skipped");
            return Ok(false);
        }
        if current.status.is_terminal() {
            if update.status != current.status {
                warn!(record_id, status = %current.status, attempted = %update.status, "refusing to modify terminal record");
            }
            return Ok(false);
        }

        let executed = update.executed_quantity.unwrap_or(current.executed_quantity);
        if executed < current.executed_quantity {
            warn!(
                record_id,
                stored = current.executed_quantity,
                attempted = executed,
                "refusing to shrink executed quantity"
            );
            return Ok(false);
        }
        let price = update.execution_price.or(current.execution_price);
        let note = update.note.clone().or_else(|| current.note.clone());
        if update.status == current.status
            && executed == current.executed_quantity
            && price == current.execution_price
            && note == current.note
        {
            return Ok(false);
        }

        if current.side == ExecutionSide::Exit && executed > current.executed_quantity {
            check_exit_invariant(
                &tx,
                current.logical_order_id,
                &current.broker_id,
                executed,
                Some(record_id),
            )?;
        }

        let changed = tx.execute(
            "UPDATE executions
             SET status = ?1, executed_quantity = ?2, execution_price = ?3, note = ?4, updated_at = ?5
             WHERE id = ?6 AND status = ?7",
            params![
                update.status.as_str(),
                executed,
                price.map(|p| p.to_string()),
                note,
                timestamp(Utc::now()),
                record_id,
                expected.as_str(),
            ],
        )?;
        tx.commit()?;

        if changed == 1 {
            self.writes.fetch_add(1, Ordering::Relaxed);
            info!(
                record_id,
                logical_order_id = current.logical_order_id,
                from = %current.status,
                to = %update.status,
                qty = executed,
                "execution updated"
            );
        }
        Ok(changed == 1)
    }

    pub fn record(&self, record_id: i64) -> CoreResult<Option<ExecutionRecord>> {
        let conn = self.conn()?;
        Ok(load_record(&conn, record_id)?)
    }

    pub fn records_for(&self, logical_order_id: i64) -> CoreResult<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM executions WHERE logical_order_id = ?1 ORDER BY id"
        ))?;
        let records = stmt
            .query_map(params![logical_order_id], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn find_by_broker_order(
        &self,
        broker: &BrokerId,
        broker_order_id: &str,
    ) -> CoreResult<Option<ExecutionRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM executions WHERE broker_id = ?1 AND broker_order_id = ?2"
                ),
                params![broker.as_str(), broker_order_id],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn logical_order_ids(&self) -> CoreResult<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM logical_orders ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Logical orders whose derived status is not terminal
    pub fn open_logical_orders(&self) -> CoreResult<Vec<i64>> {
        let mut open = Vec::new();
        for id in self.logical_order_ids()? {
            if !resolve_status(&self.records_for(id)?).is_terminal() {
                open.push(id);
            }
        }
        Ok(open)
    }

    pub fn summary(&self, logical_order_id: i64) -> CoreResult<LogicalOrderSummary> {
        Ok(summarize(logical_order_id, &self.records_for(logical_order_id)?))
    }

    /// Delete terminal logical orders whose last update is older than
    /// `retention_days`. Orders still in flight are kept regardless of age.
    pub fn cleanup(&self, retention_days: u32) -> CoreResult<CleanupReport> {
        let cutoff = timestamp(Utc::now() - ChronoDuration::days(i64::from(retention_days)));
        let mut report = CleanupReport::default();

        for id in self.logical_order_ids()? {
            let records = self.records_for(id)?;
            if !resolve_status(&records).is_terminal() {
                continue;
            }
            let last_touch = records.iter().map(|r| timestamp(r.updated_at)).max();
            let created = {
                let conn = self.conn()?;
                conn.query_row(
                    "SELECT created_at FROM logical_orders WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, String>(0),
                )?
            };
            if last_touch.unwrap_or(created) >= cutoff {
                continue;
            }

            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let deleted = tx.execute("DELETE FROM executions WHERE logical_order_id = ?1", params![id])?;
            tx.execute("DELETE FROM logical_orders WHERE id = ?1", params![id])?;
            tx.commit()?;
            self.writes.fetch_add(1, Ordering::Relaxed);
            report.logical_orders += 1;
            report.records += deleted;
        }

        info!(
            retention_days,
            logical_orders = report.logical_orders,
            records = report.records,
            "ledger cleanup complete"
        );
        Ok(report)
    }

    /// Write every record as pretty JSON, e.g. as a backup before cleanup
    pub fn export_json<P: AsRef<Path>>(&self, path: P) -> CoreResult<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM executions ORDER BY id"))?;
        let records = stmt
            .query_map([], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| CoreError::Configuration(format!("cannot serialize ledger: {e}")))?;
        std::fs::write(path.as_ref(), json).map_err(|e| {
            CoreError::Configuration(format!("cannot write {}: {e}", path.as_ref().display()))
        })?;
        debug!(records = records.len(), path = %path.as_ref().display(), "ledger exported");
        Ok(records.len())
    }

    #[cfg(test)]
    fn backdate(&self, logical_order_id: i64, days: i64) -> CoreResult<()> {
        let past = timestamp(Utc::now() - ChronoDuration::days(days));
        let conn = self.conn()?;
        conn.execute(
            "UPDATE executions SET updated_at = ?1 WHERE logical_order_id = ?2",
            params![past, logical_order_id],
        )?;
        conn.execute(
            "UPDATE logical_orders SET created_at = ?1 WHERE id = ?2",
            params![past, logical_order_id],
        )?;
        Ok(())
    }
}

fn load_record(conn: &Connection, record_id: i64) -> rusqlite::Result<Option<ExecutionRecord>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM executions WHERE id = ?1"),
        params![record_id],
        map_record,
    )
    .optional()
}

/// Exited quantity on `broker` must stay within the filled entry quantity.
/// `exit_quantity` replaces the stored quantity of `exclude` when given.
fn check_exit_invariant(
    tx: &Transaction<'_>,
    logical_order_id: i64,
    broker: &BrokerId,
    exit_quantity: i64,
    exclude: Option<i64>,
) -> CoreResult<()> {
    let (entry_filled, exit_filled): (i64, i64) = tx.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN side = 'ENTRY' THEN executed_quantity ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN side = 'EXIT' AND id != ?3 THEN executed_quantity ELSE 0 END), 0)
         FROM executions WHERE logical_order_id = ?1 AND broker_id = ?2",
        params![logical_order_id, broker.as_str(), exclude.unwrap_or(-1)],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let total_exit = exit_filled + exit_quantity;
    if total_exit > entry_filled {
        error!(
            logical_order_id,
            broker = %broker,
            entry_filled,
            exit_filled = total_exit,
            "ledger invariant violation: exit exceeds filled entry"
        );
        return Err(CoreError::LedgerInvariantViolation {
            logical_order_id,
            broker: broker.clone(),
            entry_quantity: entry_filled,
            exit_quantity: total_exit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ExitKind, LogicalOrderStatus};
    use crate::types::TradeDirection;
    use rust_decimal_macros::dec;

    fn fyers() -> BrokerId {
        BrokerId::new("fyers")
    }

    fn seeded() -> (SqliteLedger, i64, i64) {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let logical = ledger.create_logical_order("NIFTY24OCTFUT", Some("breakout")).unwrap();
        let entry = NewExecution::entry(logical, fyers(), TradeDirection::Buy, "NIFTY24OCTFUT", 75, "5001")
            .filled(75, Money::from_decimal(dec!(115.50)));
        let entry_id = ledger.insert(&entry).unwrap();
        (ledger, logical, entry_id)
    }

    #[test]
    fn test_insert_and_read_back() {
        let (ledger, logical, entry_id) = seeded();
        let record = ledger.record(entry_id).unwrap().unwrap();
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.execution_price, Some(Money::from_decimal(dec!(115.50))));
        assert_eq!(ledger.records_for(logical).unwrap().len(), 1);
        assert_eq!(
            ledger.find_by_broker_order(&fyers(), "5001").unwrap().map(|r| r.id),
            Some(entry_id)
        );
    }

    #[test]
    fn test_exit_beyond_entry_is_rejected() {
        let (ledger, logical, entry_id) = seeded();
        let entry = ledger.record(entry_id).unwrap().unwrap();
        let exit = NewExecution::exit(&entry, "5002-BO-3", 100, ExitKind::Target)
            .filled(100, Money::from_i64(117));
        let err = ledger.insert(&exit).unwrap_err();
        assert!(matches!(
            err,
            CoreError::LedgerInvariantViolation { entry_quantity: 75, exit_quantity: 100, .. }
        ));
        assert_eq!(ledger.records_for(logical).unwrap().len(), 1);
    }

    #[test]
    fn test_manual_exit_follows_ledger_contract() {
        let (ledger, logical, entry_id) = seeded();
        let entry = ledger.record(entry_id).unwrap().unwrap();

        let too_much = NewExecution::exit(&entry, "M-1", 80, ExitKind::Manual)
            .filled(80, Money::from_i64(116))
            .with_note("closed by operator");
        assert!(matches!(
            ledger.insert(&too_much).unwrap_err(),
            CoreError::LedgerInvariantViolation { entry_quantity: 75, exit_quantity: 80, .. }
        ));

        let first = NewExecution::exit(&entry, "M-1", 50, ExitKind::Manual)
            .filled(50, Money::from_i64(116))
            .with_note("closed by operator");
        let first_id = ledger.insert(&first).unwrap();
        assert_eq!(ledger.summary(logical).unwrap().status, LogicalOrderStatus::Open);

        let rest = NewExecution::exit(&entry, "M-2", 25, ExitKind::Manual)
            .filled(25, Money::from_i64(119))
            .with_note("closed by operator");
        ledger.insert(&rest).unwrap();

        let stored = ledger.record(first_id).unwrap().unwrap();
        assert_eq!(stored.side, ExecutionSide::Exit);
        assert_eq!(stored.exit_kind, Some(ExitKind::Manual));
        assert_eq!(stored.note.as_deref(), Some("closed by operator"));
        assert_eq!(stored.direction, TradeDirection::Sell);

        // (50 * 116 + 25 * 119) / 75
        let summary = ledger.summary(logical).unwrap();
        assert_eq!(summary.status, LogicalOrderStatus::Closed);
        assert_eq!(summary.exit_vwap, Some(Money::from_i64(117)));
        assert_eq!(summary.realized_pnl, Some(Money::from_decimal(dec!(112.5))));
    }

    #[test]
    fn test_conditional_update() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let logical = ledger.create_logical_order("NIFTY", None).unwrap();
        let id = ledger
            .insert(&NewExecution::entry(logical, fyers(), TradeDirection::Buy, "NIFTY", 75, "7001"))
            .unwrap();

        // Stale expectation loses
        let fill = ExecutionUpdate::fill(OrderStatus::Filled, 75, Some(Money::from_i64(100)));
        assert!(!ledger.update_if_status(id, OrderStatus::PartiallyFilled, &fill).unwrap());

        assert!(ledger.update_if_status(id, OrderStatus::Pending, &fill).unwrap());
        let writes = ledger.writes();

        // Terminal records are frozen
        let cancel = ExecutionUpdate::status(OrderStatus::Cancelled);
        assert!(!ledger.update_if_status(id, OrderStatus::Filled, &cancel).unwrap());
        assert_eq!(ledger.writes(), writes);
        assert_eq!(ledger.record(id).unwrap().unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_identical_update_is_not_a_write() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let logical = ledger.create_logical_order("NIFTY", None).unwrap();
        let id = ledger
            .insert(&NewExecution::entry(logical, fyers(), TradeDirection::Buy, "NIFTY", 75, "7001"))
            .unwrap();
        let partial = ExecutionUpdate::fill(OrderStatus::PartiallyFilled, 25, Some(Money::from_i64(100)));
        assert!(ledger.update_if_status(id, OrderStatus::Pending, &partial).unwrap());
        let writes = ledger.writes();
        assert!(!ledger.update_if_status(id, OrderStatus::PartiallyFilled, &partial).unwrap());
        assert_eq!(ledger.writes(), writes);

        let shrink = ExecutionUpdate::fill(OrderStatus::PartiallyFilled, 10, None);
        assert!(!ledger.update_if_status(id, OrderStatus::PartiallyFilled, &shrink).unwrap());
    }

    #[test]
    fn test_exit_update_checks_invariant() {
        let (ledger, _logical, entry_id) = seeded();
        let entry = ledger.record(entry_id).unwrap().unwrap();
        let exit_id = ledger
            .insert(&NewExecution::exit(&entry, "9001", 75, ExitKind::Signal))
            .unwrap();
        let over = ExecutionUpdate::fill(OrderStatus::Filled, 80, Some(Money::from_i64(116)));
        assert!(ledger.update_if_status(exit_id, OrderStatus::Pending, &over).is_err());
        let ok = ExecutionUpdate::fill(OrderStatus::Filled, 75, Some(Money::from_i64(116)));
        assert!(ledger.update_if_status(exit_id, OrderStatus::Pending, &ok).unwrap());
    }

    #[test]
    fn test_unknown_record() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let err = ledger
            .update_if_status(42, OrderStatus::Pending, &ExecutionUpdate::status(OrderStatus::Filled))
            .unwrap_err();
        assert!(matches!(err, CoreError::RecordNotFound { record_id: 42 }));
    }

    #[test]
    fn test_cleanup_respects_retention_and_open_orders() {
        let (ledger, closed, entry_id) = seeded();
        let entry = ledger.record(entry_id).unwrap().unwrap();
        ledger
            .insert(
                &NewExecution::exit(&entry, "5002-BO-3", 75, ExitKind::Target)
                    .filled(75, Money::from_decimal(dec!(116.85))),
            )
            .unwrap();
        assert_eq!(ledger.summary(closed).unwrap().status, LogicalOrderStatus::Closed);

        let open = ledger.create_logical_order("BANKNIFTY", None).unwrap();
        ledger
            .insert(
                &NewExecution::entry(open, fyers(), TradeDirection::Sell, "BANKNIFTY", 30, "8001")
                    .filled(30, Money::from_i64(51000)),
            )
            .unwrap();

        ledger.backdate(closed, 120).unwrap();
        ledger.backdate(open, 120).unwrap();

        let report = ledger.cleanup(90).unwrap();
        assert_eq!(report, CleanupReport { logical_orders: 1, records: 2 });
        assert_eq!(ledger.logical_order_ids().unwrap(), vec![open]);
        assert_eq!(ledger.open_logical_orders().unwrap(), vec![open]);
    }

    #[test]
    fn test_failed_entry_without_broker_id() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let logical = ledger.create_logical_order("NIFTY", None).unwrap();
        for _ in 0..2 {
            ledger
                .insert(&NewExecution::failed_entry(
                    logical,
                    fyers(),
                    TradeDirection::Buy,
                    "NIFTY",
                    75,
                    "margin shortfall",
                ))
                .unwrap();
        }
        assert_eq!(ledger.summary(logical).unwrap().status, LogicalOrderStatus::Failed);
    }
}
