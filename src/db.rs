//! SQLite-backed persistence for time intervals, tasks and invoices, plus an
//! aggregate cache table shared by every process that opens the same file.
//!
//! This module provides:
//! - Database initialization with schema versioning
//! - The production [`Gateway`] implementation
//! - A TTL cache table for aggregates ([`SqliteCache`])
//! - Concurrent access support via WAL mode and immediate transactions

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cache::AggregateCache;
use crate::clock::Clock;
use crate::error::{Result, TrackerError};
use crate::gateway::{Gateway, OpenedInterval};
use crate::models::{
    AggregateResult, ClientInfo, ClosedInterval, HoursSource, Invoice, InvoiceStatus, LineItem,
    Project, Scope, Task, TaskStatus, TimeInterval,
};

pub const SCHEMA_VERSION: &str = "1";

/// Resolve the database file path
///
/// Checks `BILLABLE_DB_PATH` first, falls back to the platform data directory.
pub fn default_db_path() -> Result<PathBuf> {
    if let Ok(custom_path) = env::var("BILLABLE_DB_PATH")
        && !custom_path.trim().is_empty()
    {
        return Ok(PathBuf::from(custom_path));
    }

    let dirs = directories::ProjectDirs::from("", "", "billable")
        .ok_or_else(|| TrackerError::Persistence("failed to find a data directory".into()))?;
    Ok(dirs.data_dir().join("billable.db"))
}

/// Open database connection with WAL mode and retry logic
///
/// Retries "database locked" errors with a linear backoff and sets a busy
/// timeout so concurrent writers queue instead of failing.
fn open_db(path: &Path) -> Result<Connection> {
    let mut attempts = 0;
    let max_attempts = 3;

    loop {
        match Connection::open(path) {
            Ok(conn) => {
                conn.pragma_update(None, "busy_timeout", 5000)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                return Ok(conn);
            }
            Err(e) if e.to_string().contains("locked") && attempts < max_attempts => {
                attempts += 1;
                thread::sleep(Duration::from_millis(100 * attempts));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Initialize database schema
///
/// Creates tables and indexes if they don't exist. At most one running
/// interval per task is enforced by a partial unique index.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            hourly_rate REAL
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL,
            estimate_hours REAL,
            billed_in_invoice_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
        CREATE TABLE IF NOT EXISTS time_intervals (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            started_at_ms INTEGER NOT NULL,
            ended_at_ms INTEGER,
            duration_seconds INTEGER,
            is_running INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_intervals_task ON time_intervals(task_id, started_at_ms);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_one_running_interval
            ON time_intervals(task_id) WHERE is_running = 1;
        CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            client TEXT NOT NULL,
            total_amount REAL NOT NULL,
            total_hours REAL NOT NULL,
            status TEXT NOT NULL,
            generated_at_ms INTEGER NOT NULL,
            due_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_invoices_project ON invoices(project_id);
        CREATE TABLE IF NOT EXISTS invoice_lines (
            invoice_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            task_id TEXT NOT NULL,
            title TEXT NOT NULL,
            hours_worked REAL NOT NULL,
            hourly_rate REAL NOT NULL,
            earnings REAL NOT NULL,
            hours_source TEXT NOT NULL,
            PRIMARY KEY (invoice_id, position)
        );
        CREATE TABLE IF NOT EXISTS aggregate_cache (
            cache_key TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            fetched_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cache_expires ON aggregate_cache(expires_at_ms);
        CREATE TABLE IF NOT EXISTS aggregate_generations (
            cache_key TEXT PRIMARY KEY,
            generation INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER
        );
        INSERT OR IGNORE INTO metadata (key, value) VALUES ('schema_version', '1');",
    )?;
    Ok(())
}

fn ts_from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

const INTERVAL_COLUMNS: &str =
    "id, task_id, started_at_ms, ended_at_ms, duration_seconds, is_running";

fn map_interval(row: &Row<'_>) -> rusqlite::Result<TimeInterval> {
    let ended_at = match row.get::<_, Option<i64>>(3)? {
        Some(ms) => Some(ts_from_millis(3, ms)?),
        None => None,
    };
    Ok(TimeInterval {
        id: row.get(0)?,
        task_id: row.get(1)?,
        started_at: ts_from_millis(2, row.get(2)?)?,
        ended_at,
        duration_seconds: row.get(4)?,
        is_running: row.get::<_, i64>(5)? != 0,
    })
}

const TASK_COLUMNS: &str = "id, project_id, title, status, estimate_hours, billed_in_invoice_id";

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        status: parse_column::<TaskStatus>(3, row.get(3)?)?,
        estimate_hours: row.get(4)?,
        billed_in_invoice_id: row.get(5)?,
    })
}

fn map_line(row: &Row<'_>) -> rusqlite::Result<LineItem> {
    Ok(LineItem {
        task_id: row.get(0)?,
        title: row.get(1)?,
        hours_worked: row.get(2)?,
        hourly_rate: row.get(3)?,
        earnings: row.get(4)?,
        hours_source: parse_column::<HoursSource>(5, row.get(5)?)?,
    })
}

/// Close every running interval of a task at `now`, inside `tx`.
fn close_running_in_tx(
    tx: &Transaction<'_>,
    task_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<TimeInterval>> {
    let mut running: Vec<TimeInterval> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM time_intervals
             WHERE task_id = ?1 AND is_running = 1
             ORDER BY started_at_ms DESC"
        ))?;
        let rows = stmt.query_map(params![task_id], map_interval)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for interval in running.iter_mut() {
        let closed = interval.close_at(now);
        tx.execute(
            "UPDATE time_intervals
             SET ended_at_ms = ?1, duration_seconds = ?2, is_running = 0
             WHERE id = ?3 AND is_running = 1",
            params![
                closed.ended_at.timestamp_millis(),
                closed.duration_seconds,
                interval.id
            ],
        )?;
        interval.apply_close(closed);
    }
    Ok(running)
}

fn insert_invoice_in_tx(tx: &Transaction<'_>, invoice: &Invoice) -> Result<()> {
    let client = serde_json::to_string(&invoice.client)?;
    tx.execute(
        "INSERT INTO invoices (id, project_id, client, total_amount, total_hours, status, generated_at_ms, due_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            invoice.id,
            invoice.project_id,
            client,
            invoice.total_amount,
            invoice.total_hours,
            invoice.status.as_str(),
            invoice.generated_at.timestamp_millis(),
            invoice.due_at.timestamp_millis()
        ],
    )?;
    for (position, line) in invoice.task_details.iter().enumerate() {
        tx.execute(
            "INSERT INTO invoice_lines (invoice_id, position, task_id, title, hours_worked, hourly_rate, earnings, hours_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                invoice.id,
                position as i64,
                line.task_id,
                line.title,
                line.hours_worked,
                line.hourly_rate,
                line.earnings,
                line.hours_source.as_str()
            ],
        )?;
    }
    Ok(())
}

/// Stamp every task or fail on the first one that is missing or already
/// billed. The caller drops `tx` on error, which rolls back earlier stamps.
fn stamp_tasks_in_tx(tx: &Transaction<'_>, invoice_id: &str, task_ids: &[String]) -> Result<()> {
    for task_id in task_ids {
        let updated = tx.execute(
            "UPDATE tasks SET billed_in_invoice_id = ?1
             WHERE id = ?2 AND billed_in_invoice_id IS NULL",
            params![invoice_id, task_id],
        )?;
        if updated == 0 {
            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT billed_in_invoice_id FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match existing {
                Some(Some(existing)) => TrackerError::AlreadyBilled {
                    task_id: task_id.clone(),
                    invoice_id: existing,
                },
                _ => TrackerError::not_found("task", task_id.clone()),
            });
        }
    }
    Ok(())
}

/// Production gateway over a SQLite file. Each call opens a short-lived
/// connection so the gateway can be shared freely across threads.
#[derive(Debug, Clone)]
pub struct SqliteGateway {
    path: PathBuf,
}

impl SqliteGateway {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .map_err(|e| TrackerError::Persistence(format!("{}: {e}", parent.display())))?;
        }
        let conn = open_db(&path)?;
        init_schema(&conn)?;
        debug!("opened tracker database at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        open_db(&self.path)
    }

    pub fn schema_version(&self) -> Result<Option<String>> {
        let conn = self.conn()?;
        let version = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    fn load_lines(conn: &Connection, invoice_id: &str) -> Result<Vec<LineItem>> {
        let mut stmt = conn.prepare(
            "SELECT task_id, title, hours_worked, hourly_rate, earnings, hours_source
             FROM invoice_lines WHERE invoice_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![invoice_id], map_line)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_invoices(conn: &Connection, sql: &str, key: &str) -> Result<Vec<Invoice>> {
        let headers = {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    parse_column::<InvoiceStatus>(5, row.get(5)?)?,
                    ts_from_millis(6, row.get(6)?)?,
                    ts_from_millis(7, row.get(7)?)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut invoices = Vec::with_capacity(headers.len());
        for (id, project_id, client, total_amount, total_hours, status, generated_at, due_at) in
            headers
        {
            let client: ClientInfo = serde_json::from_str(&client)?;
            let task_details = Self::load_lines(conn, &id)?;
            invoices.push(Invoice {
                id,
                project_id,
                client,
                total_amount,
                total_hours,
                status,
                task_details,
                generated_at,
                due_at,
            });
        }
        Ok(invoices)
    }
}

const INVOICE_SELECT: &str = "SELECT id, project_id, client, total_amount, total_hours, status,
        generated_at_ms, due_at_ms FROM invoices";

impl Gateway for SqliteGateway {
    fn insert_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO projects (id, owner_id, name, hourly_rate) VALUES (?1, ?2, ?3, ?4)",
            params![project.id, project.owner_id, project.name, project.hourly_rate],
        )?;
        Ok(())
    }

    fn find_project(&self, project_id: &str) -> Result<Option<Project>> {
        let conn = self.conn()?;
        let project = conn
            .query_row(
                "SELECT id, owner_id, name, hourly_rate FROM projects WHERE id = ?1",
                params![project_id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        name: row.get(2)?,
                        hourly_rate: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, project_id, title, status, estimate_hours, billed_in_invoice_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.id,
                task.project_id,
                task.title,
                task.status.as_str(),
                task.estimate_hours,
                task.billed_in_invoice_id
            ],
        )?;
        Ok(())
    }

    fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
                map_task,
            )
            .optional()?;
        Ok(task)
    }

    fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), task_id],
        )?;
        Ok(updated > 0)
    }

    fn tasks_for_project(&self, project_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![project_id], map_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn intervals_for_task(&self, task_id: &str) -> Result<Vec<TimeInterval>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM time_intervals
             WHERE task_id = ?1 ORDER BY started_at_ms ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], map_interval)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn intervals_for_project(&self, project_id: &str) -> Result<Vec<TimeInterval>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT i.id, i.task_id, i.started_at_ms, i.ended_at_ms, i.duration_seconds, i.is_running
             FROM time_intervals i
             JOIN tasks t ON t.id = i.task_id
             WHERE t.project_id = ?1
             ORDER BY i.started_at_ms ASC, i.rowid ASC",
        )?;
        let rows = stmt.query_map(params![project_id], map_interval)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn latest_running_interval(&self, task_id: &str) -> Result<Option<TimeInterval>> {
        let conn = self.conn()?;
        let interval = conn
            .query_row(
                &format!(
                    "SELECT {INTERVAL_COLUMNS} FROM time_intervals
                     WHERE task_id = ?1 AND is_running = 1
                     ORDER BY started_at_ms DESC LIMIT 1"
                ),
                params![task_id],
                map_interval,
            )
            .optional()?;
        Ok(interval)
    }

    fn open_interval(
        &self,
        task_id: &str,
        interval_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenedInterval> {
        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front so racing starts serialize
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let closed = close_running_in_tx(&tx, task_id, now)?;

        let interval = TimeInterval::start(interval_id.to_string(), task_id.to_string(), now);
        tx.execute(
            "INSERT INTO time_intervals (id, task_id, started_at_ms, ended_at_ms, duration_seconds, is_running)
             VALUES (?1, ?2, ?3, NULL, NULL, 1)",
            params![interval.id, interval.task_id, now.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(OpenedInterval { interval, closed })
    }

    fn close_interval(&self, interval_id: &str, closed: ClosedInterval) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE time_intervals
             SET ended_at_ms = ?1, duration_seconds = ?2, is_running = 0
             WHERE id = ?3 AND is_running = 1",
            params![
                closed.ended_at.timestamp_millis(),
                closed.duration_seconds,
                interval_id
            ],
        )?;
        Ok(updated > 0)
    }

    fn insert_invoice(&self, invoice: &Invoice) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_invoice_in_tx(&tx, invoice)?;
        tx.commit()?;
        Ok(())
    }

    fn find_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
        let conn = self.conn()?;
        let mut invoices =
            Self::load_invoices(&conn, &format!("{INVOICE_SELECT} WHERE id = ?1"), invoice_id)?;
        Ok(invoices.pop())
    }

    fn invoices_for_project(&self, project_id: &str) -> Result<Vec<Invoice>> {
        let conn = self.conn()?;
        Self::load_invoices(
            &conn,
            &format!("{INVOICE_SELECT} WHERE project_id = ?1 ORDER BY generated_at_ms, rowid"),
            project_id,
        )
    }

    fn stamp_tasks_billed(&self, invoice_id: &str, task_ids: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        stamp_tasks_in_tx(&tx, invoice_id, task_ids)?;
        tx.commit()?;
        Ok(())
    }

    fn update_invoice_status(
        &self,
        invoice_id: &str,
        from: InvoiceStatus,
        to: InvoiceStatus,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE invoices SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![to.as_str(), invoice_id, from.as_str()],
        )?;
        Ok(updated > 0)
    }

    fn create_invoice_billed(&self, invoice: &Invoice) -> Result<()> {
        let mut conn = self.conn()?;
        // one IMMEDIATE transaction: a lost stamp race rolls the invoice back too
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_invoice_in_tx(&tx, invoice)?;
        stamp_tasks_in_tx(&tx, &invoice.id, &invoice.task_ids())?;
        tx.commit()?;
        Ok(())
    }
}

/// Aggregate cache stored in the tracker database, so separate processes
/// polling the same file share one cache.
pub struct SqliteCache {
    path: PathBuf,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    pub fn new(gateway: &SqliteGateway, ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: gateway.path().to_path_buf(),
            ttl,
            clock,
        }
    }

    fn try_get(&self, scope: &Scope) -> Result<Option<AggregateResult>> {
        let conn = open_db(&self.path)?;
        let now = self.clock.now().timestamp_millis();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM aggregate_cache WHERE cache_key = ?1 AND expires_at_ms > ?2",
                params![scope.cache_key(), now],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    fn try_generation(&self, scope: &Scope) -> Result<u64> {
        let conn = open_db(&self.path)?;
        generation_of(&conn, &scope.cache_key())
    }

    fn try_set(&self, scope: &Scope, value: &AggregateResult, generation: u64) -> Result<bool> {
        let mut conn = open_db(&self.path)?;
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let data = serde_json::to_string(value)?;
        let key = scope.cache_key();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if generation_of(&tx, &key)? != generation {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO aggregate_cache (cache_key, data, fetched_at_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                 data = excluded.data,
                 fetched_at_ms = excluded.fetched_at_ms,
                 expires_at_ms = excluded.expires_at_ms",
            params![key, data, now.timestamp_millis(), expires_at.timestamp_millis()],
        )?;

        // opportunistic cleanup
        tx.execute(
            "DELETE FROM aggregate_cache WHERE expires_at_ms <= ?1",
            params![now.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn try_invalidate(&self, scope: &Scope) -> Result<()> {
        let mut conn = open_db(&self.path)?;
        let key = scope.cache_key();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM aggregate_cache WHERE cache_key = ?1", params![key])?;
        tx.execute(
            "INSERT INTO aggregate_generations (cache_key, generation) VALUES (?1, 1)
             ON CONFLICT(cache_key) DO UPDATE SET generation = generation + 1",
            params![key],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn generation_of(conn: &Connection, key: &str) -> Result<u64> {
    let generation: Option<i64> = conn
        .query_row(
            "SELECT generation FROM aggregate_generations WHERE cache_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(generation.unwrap_or(0).max(0) as u64)
}

impl AggregateCache for SqliteCache {
    fn get(&self, scope: &Scope) -> Option<AggregateResult> {
        match self.try_get(scope) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("aggregate cache read failed for {scope}: {e}");
                None
            }
        }
    }

    fn generation(&self, scope: &Scope) -> Option<u64> {
        match self.try_generation(scope) {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!("aggregate cache generation read failed for {scope}: {e}");
                None
            }
        }
    }

    fn set(&self, scope: &Scope, value: &AggregateResult, generation: u64) -> bool {
        match self.try_set(scope, value, generation) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("aggregate cache write failed for {scope}: {e}");
                false
            }
        }
    }

    fn invalidate(&self, scope: &Scope) -> Result<()> {
        self.try_invalidate(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serial_test::serial;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn gateway(dir: &TempDir) -> SqliteGateway {
        SqliteGateway::open(dir.path().join("test.db")).unwrap()
    }

    fn task(id: &str, project_id: &str) -> Task {
        Task {
            id: id.into(),
            project_id: project_id.into(),
            title: format!("task {id}"),
            status: TaskStatus::Todo,
            estimate_hours: Some(1.5),
            billed_in_invoice_id: None,
        }
    }

    #[test]
    fn test_db_init() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        assert_eq!(gw.schema_version().unwrap().as_deref(), Some(SCHEMA_VERSION));
        // reopening must not fail on existing tables
        SqliteGateway::open(gw.path()).unwrap();
    }

    #[test]
    #[serial]
    fn test_default_db_path_from_env() {
        // SAFETY: Test runs serially, no concurrent env access
        unsafe { env::set_var("BILLABLE_DB_PATH", "/tmp/custom-billable.db") };
        assert_eq!(
            default_db_path().unwrap(),
            PathBuf::from("/tmp/custom-billable.db")
        );
        unsafe { env::remove_var("BILLABLE_DB_PATH") };
    }

    #[test]
    fn test_task_roundtrip_and_status() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        gw.insert_task(&task("t1", "p1")).unwrap();

        assert!(gw.set_task_status("t1", TaskStatus::Done).unwrap());
        assert!(!gw.set_task_status("missing", TaskStatus::Done).unwrap());

        let loaded = gw.find_task("t1").unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Done);
        assert_eq!(loaded.estimate_hours, Some(1.5));
    }

    #[test]
    fn test_open_interval_closes_previous_running_row() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);

        gw.open_interval("t1", "i1", t0()).unwrap();
        let opened = gw
            .open_interval("t1", "i2", t0() + chrono::Duration::seconds(42))
            .unwrap();

        assert_eq!(opened.closed.len(), 1);
        assert_eq!(opened.closed[0].duration_seconds, Some(42));

        let rows = gw.intervals_for_task("t1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|i| i.is_running).count(), 1);
        assert_eq!(
            gw.latest_running_interval("t1").unwrap().map(|i| i.id),
            Some("i2".to_string())
        );
    }

    #[test]
    fn test_unique_index_rejects_second_running_row() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        gw.open_interval("t1", "i1", t0()).unwrap();

        let conn = open_db(gw.path()).unwrap();
        let result = conn.execute(
            "INSERT INTO time_intervals (id, task_id, started_at_ms, is_running) VALUES ('x', 't1', 0, 1)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stamp_rolls_back_on_conflict() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        gw.insert_task(&task("a", "p1")).unwrap();
        gw.insert_task(&Task {
            billed_in_invoice_id: Some("old".into()),
            ..task("b", "p1")
        })
        .unwrap();

        let err = gw
            .stamp_tasks_billed("new", &["a".into(), "b".into()])
            .unwrap_err();
        assert!(matches!(err, TrackerError::AlreadyBilled { .. }));
        assert_eq!(gw.find_task("a").unwrap().unwrap().billed_in_invoice_id, None);

        gw.stamp_tasks_billed("new", &["a".into()]).unwrap();
        assert_eq!(
            gw.find_task("a").unwrap().unwrap().billed_in_invoice_id.as_deref(),
            Some("new")
        );
    }

    #[test]
    fn test_create_invoice_billed_rolls_back_invoice_on_conflict() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        gw.insert_task(&task("a", "p1")).unwrap();
        gw.insert_task(&Task {
            billed_in_invoice_id: Some("rival".into()),
            ..task("b", "p1")
        })
        .unwrap();
        let line = |task_id: &str| LineItem {
            task_id: task_id.into(),
            title: task_id.to_uppercase(),
            hours_worked: 1.0,
            hourly_rate: 50.0,
            earnings: 50.0,
            hours_source: HoursSource::Estimate,
        };
        let invoice = Invoice {
            id: "late".into(),
            project_id: "p1".into(),
            client: ClientInfo::default(),
            total_amount: 100.0,
            total_hours: 2.0,
            status: InvoiceStatus::Pending,
            task_details: vec![line("a"), line("b")],
            generated_at: t0(),
            due_at: t0() + chrono::Duration::days(30),
        };

        let err = gw.create_invoice_billed(&invoice).unwrap_err();
        assert!(matches!(
            err,
            TrackerError::AlreadyBilled { ref task_id, ref invoice_id }
                if task_id == "b" && invoice_id == "rival"
        ));
        assert_eq!(gw.find_invoice("late").unwrap(), None);
        assert!(gw.invoices_for_project("p1").unwrap().is_empty());
        assert_eq!(gw.find_task("a").unwrap().unwrap().billed_in_invoice_id, None);

        let fresh = Invoice {
            id: "fresh".into(),
            task_details: vec![line("a")],
            ..invoice
        };
        gw.create_invoice_billed(&fresh).unwrap();
        assert_eq!(gw.find_invoice("fresh").unwrap(), Some(fresh));
        assert_eq!(
            gw.find_task("a").unwrap().unwrap().billed_in_invoice_id.as_deref(),
            Some("fresh")
        );
    }

    #[test]
    fn test_invoice_roundtrip() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        let invoice = Invoice {
            id: "inv1".into(),
            project_id: "p1".into(),
            client: ClientInfo {
                name: "Acme".into(),
                email: Some("ap@acme.test".into()),
                address: None,
            },
            total_amount: 150.0,
            total_hours: 3.0,
            status: InvoiceStatus::Pending,
            task_details: vec![
                LineItem {
                    task_id: "a".into(),
                    title: "A".into(),
                    hours_worked: 2.0,
                    hourly_rate: 50.0,
                    earnings: 100.0,
                    hours_source: HoursSource::Estimate,
                },
                LineItem {
                    task_id: "b".into(),
                    title: "B".into(),
                    hours_worked: 1.0,
                    hourly_rate: 50.0,
                    earnings: 50.0,
                    hours_source: HoursSource::Tracked,
                },
            ],
            generated_at: t0(),
            due_at: t0() + chrono::Duration::days(30),
        };
        gw.insert_invoice(&invoice).unwrap();

        assert_eq!(gw.find_invoice("inv1").unwrap(), Some(invoice.clone()));
        assert_eq!(gw.invoices_for_project("p1").unwrap(), vec![invoice]);

        assert!(
            gw.update_invoice_status("inv1", InvoiceStatus::Pending, InvoiceStatus::Paid)
                .unwrap()
        );
        assert!(
            !gw.update_invoice_status("inv1", InvoiceStatus::Pending, InvoiceStatus::Cancelled)
                .unwrap()
        );
    }

    #[test]
    fn test_sqlite_cache_expiry_and_invalidate() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = SqliteCache::new(&gw, chrono::Duration::seconds(30), clock.clone());
        let scope = Scope::Task("t1".into());
        let value = AggregateResult {
            total_seconds: 125,
            ..AggregateResult::default()
        };

        assert_eq!(cache.get(&scope), None);
        assert_eq!(cache.generation(&scope), Some(0));
        assert!(cache.set(&scope, &value, 0));
        assert_eq!(cache.get(&scope), Some(value.clone()));

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(cache.get(&scope), None);

        assert!(cache.set(&scope, &value, 0));
        cache.invalidate(&scope).unwrap();
        assert_eq!(cache.get(&scope), None);
        assert_eq!(cache.generation(&scope), Some(1));
    }

    #[test]
    fn test_sqlite_cache_rejects_write_from_older_generation() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        let clock = Arc::new(ManualClock::new(t0()));
        let reader = SqliteCache::new(&gw, chrono::Duration::seconds(30), clock.clone());
        let writer = SqliteCache::new(&gw, chrono::Duration::seconds(30), clock);
        let scope = Scope::Project("p1".into());
        let stale = AggregateResult {
            total_seconds: 60,
            ..AggregateResult::default()
        };

        let seen = reader.generation(&scope).unwrap();
        writer.invalidate(&scope).unwrap();

        assert!(!reader.set(&scope, &stale, seen));
        assert_eq!(reader.get(&scope), None);
    }
}
