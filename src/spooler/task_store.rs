//! Durable recurring-task records.
//!
//! One row per named task. The scheduler owns every scheduling field
//! (`is_running`, `prev_run`, `next_run`, `run_count`); handlers own only
//! the opaque JSON `state` payload. Rows are created once at first boot and
//! never deleted in normal operation.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS spooler_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    frequency_seconds INTEGER,
    prev_run INTEGER,
    next_run INTEGER,
    is_running INTEGER NOT NULL DEFAULT 0,
    run_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    state TEXT NOT NULL DEFAULT '{}'
);
"#;

/// A durable task record. `frequency_seconds == Some(0)` means run exactly
/// once; `None` means the task is parked and never scheduled.
#[derive(Debug, Clone)]
pub struct SpoolerTask {
    pub id: i64,
    pub name: String,
    pub frequency_seconds: Option<i64>,
    pub prev_run: Option<i64>,
    pub next_run: Option<i64>,
    pub is_running: bool,
    pub run_count: i64,
    pub last_error: Option<String>,
    pub state: serde_json::Value,
}

impl SpoolerTask {
    pub fn is_one_shot(&self) -> bool {
        self.frequency_seconds == Some(0)
    }
}

/// A task to create at first boot.
#[derive(Debug, Clone)]
pub struct TaskSeed {
    pub name: &'static str,
    pub frequency_seconds: i64,
}

pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize spooler schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the default task rows, but only on a truly empty table:
    /// seeding is skipped entirely if *any* task row exists, whatever its
    /// name, so operator edits survive restarts.
    pub fn seed_if_empty(&self, seeds: &[TaskSeed]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM spooler_tasks", [], |r| r.get(0))?;
        if existing > 0 {
            return Ok(0);
        }

        let tx = conn.transaction().context("begin seed tx")?;
        for seed in seeds {
            tx.execute(
                "INSERT INTO spooler_tasks (name, frequency_seconds) VALUES (?1, ?2)",
                params![seed.name, seed.frequency_seconds],
            )?;
        }
        tx.commit().context("commit seed tx")?;
        info!("🌱 Seeded {} default spooler tasks", seeds.len());
        Ok(seeds.len())
    }

    /// Every schedulable row (non-null frequency), in creation order.
    pub fn list_scheduled(&self) -> Result<Vec<SpoolerTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, frequency_seconds, prev_run, next_run, is_running, run_count, last_error, state
             FROM spooler_tasks WHERE frequency_seconds IS NOT NULL ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub fn get(&self, id: i64) -> Result<SpoolerTask> {
        let conn = self.conn.lock();
        let task = conn
            .prepare_cached(
                "SELECT id, name, frequency_seconds, prev_run, next_run, is_running, run_count, last_error, state
                 FROM spooler_tasks WHERE id = ?1",
            )?
            .query_row(params![id], row_to_task)
            .optional()?;
        task.ok_or_else(|| anyhow!("no spooler task with id {id}"))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<SpoolerTask>> {
        let conn = self.conn.lock();
        let task = conn
            .prepare_cached(
                "SELECT id, name, frequency_seconds, prev_run, next_run, is_running, run_count, last_error, state
                 FROM spooler_tasks WHERE name = ?1",
            )?
            .query_row(params![name], row_to_task)
            .optional()?;
        Ok(task)
    }

    /// Clear any run latch left set by a process that died mid-run. This
    /// process is the sole writer of these rows, so at boot every held
    /// latch is stale by definition; without this a crashed run would
    /// starve its task forever. Call before starting the spooler.
    pub fn recover_stale_latches(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let cleared = conn.execute(
            "UPDATE spooler_tasks SET is_running = 0 WHERE is_running = 1",
            [],
        )?;
        if cleared > 0 {
            warn!(cleared, "recovered run latches held by a previous process");
        }
        Ok(cleared)
    }

    /// Atomically set the running latch. Exactly one caller can win between
    /// two clears; the read-check and the write are a single statement, so
    /// there is no window for a duplicate run.
    pub fn try_begin_run(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE spooler_tasks SET is_running = 1 WHERE id = ?1 AND is_running = 0",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Successful run: advance the scheduling fields, store the handler's
    /// new state, clear the latch and any previous error.
    pub fn complete_run(
        &self,
        id: i64,
        state: &serde_json::Value,
        now_ms: i64,
        next_run: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE spooler_tasks
             SET state = ?2, prev_run = ?3, next_run = ?4,
                 run_count = run_count + 1, is_running = 0, last_error = NULL
             WHERE id = ?1",
            params![id, state.to_string(), now_ms, next_run],
        )?;
        if changed != 1 {
            return Err(anyhow!("complete_run: no spooler task with id {id}"));
        }
        Ok(())
    }

    /// Failed run: clear the latch and record the error, leaving
    /// `prev_run`/`next_run`/`run_count` untouched so the task stays due
    /// and is retried by the next refresh cycle's catch-up rule.
    pub fn fail_run(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE spooler_tasks SET is_running = 0, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        if changed != 1 {
            return Err(anyhow!("fail_run: no spooler task with id {id}"));
        }
        Ok(())
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<SpoolerTask> {
    let state_raw: String = row.get(8)?;
    let state = serde_json::from_str(&state_raw).unwrap_or_else(|e| {
        warn!(error = %e, "unparseable task state, treating as empty object");
        serde_json::json!({})
    });
    Ok(SpoolerTask {
        id: row.get(0)?,
        name: row.get(1)?,
        frequency_seconds: row.get(2)?,
        prev_run: row.get(3)?,
        next_run: row.get(4)?,
        is_running: row.get::<_, i64>(5)? != 0,
        run_count: row.get(6)?,
        last_error: row.get(7)?,
        state,
    })
}
