//! SQLite-backed persistence for tasks and execution logs.
//!
//! Tasks live in a plain key-value table as JSON under a `task:` prefix;
//! execution logs get typed columns so recovery and retention queries
//! stay cheap. Writes are durable when the call returns.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use tempo_core::{Result, TempoError};

use crate::task::{ExecutionLog, ExecutionStatus, ScheduleTask};

const TASK_PREFIX: &str = "task:";

/// Error message written into logs left `running` by a previous crash.
pub const RECOVERY_ERROR: &str = "interrupted by restart";

/// Durable store for tasks (KV semantics) and execution logs.
pub trait TaskStore: Send + Sync {
    fn put_task(&self, task: &ScheduleTask) -> Result<()>;
    fn get_task(&self, task_id: &str) -> Result<Option<ScheduleTask>>;
    fn delete_task(&self, task_id: &str) -> Result<()>;
    /// All persisted tasks, via prefix scan.
    fn load_tasks(&self) -> Result<Vec<ScheduleTask>>;

    fn insert_log(&self, log: &ExecutionLog) -> Result<()>;
    fn update_log(&self, log: &ExecutionLog) -> Result<()>;
    fn logs_for_task(&self, task_id: &str) -> Result<Vec<ExecutionLog>>;
    fn all_logs(&self) -> Result<Vec<ExecutionLog>>;
    fn delete_logs_for_task(&self, task_id: &str) -> Result<()>;
    /// Resolve logs still `running` from a prior crash to a terminal
    /// state; returns how many were recovered.
    fn recover_stuck_logs(&self) -> Result<u32>;
    /// Purge logs whose `started_at` precedes `cutoff`; returns the
    /// number removed.
    fn cleanup_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u32>;
}

/// SQLite implementation of [`TaskStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;

             CREATE TABLE IF NOT EXISTS kv (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS execution_logs (
                 id TEXT PRIMARY KEY,
                 task_id TEXT NOT NULL,
                 started_at TEXT NOT NULL,
                 completed_at TEXT,
                 status TEXT NOT NULL DEFAULT 'running',
                 result TEXT,
                 error TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_execution_logs_task
                 ON execution_logs(task_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_kv(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
        Ok(())
    }

    fn kv_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key LIKE ?1 ORDER BY key")?;
        let rows = stmt.query_map(rusqlite::params![format!("{prefix}%")], |row| {
            row.get::<_, String>(0)
        })?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    fn query_logs(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<ExecutionLog>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut logs = Vec::new();
        for row in rows {
            let (id, task_id, started_at, completed_at, status, result, error) = row?;
            logs.push(ExecutionLog {
                id,
                task_id,
                started_at: parse_timestamp(&started_at)?,
                completed_at: match completed_at {
                    Some(raw) => Some(parse_timestamp(&raw)?),
                    None => None,
                },
                status: ExecutionStatus::parse(&status)?,
                result,
                error,
            });
        }
        Ok(logs)
    }
}

const LOG_COLUMNS: &str = "id, task_id, started_at, completed_at, status, result, error";

impl TaskStore for SqliteStore {
    fn put_task(&self, task: &ScheduleTask) -> Result<()> {
        let value = serde_json::to_string(task)?;
        self.set_kv(&format!("{TASK_PREFIX}{}", task.id), &value)
    }

    fn get_task(&self, task_id: &str) -> Result<Option<ScheduleTask>> {
        match self.get_kv(&format!("{TASK_PREFIX}{task_id}"))? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    fn delete_task(&self, task_id: &str) -> Result<()> {
        self.delete_kv(&format!("{TASK_PREFIX}{task_id}"))
    }

    fn load_tasks(&self) -> Result<Vec<ScheduleTask>> {
        let mut tasks = Vec::new();
        for value in self.kv_by_prefix(TASK_PREFIX)? {
            match serde_json::from_str::<ScheduleTask>(&value) {
                Ok(task) => tasks.push(task),
                // A single corrupt record must not take the engine down.
                Err(e) => tracing::warn!("skipping unreadable task record: {e}"),
            }
        }
        Ok(tasks)
    }

    fn insert_log(&self, log: &ExecutionLog) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO execution_logs (id, task_id, started_at, completed_at, status, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                log.id,
                log.task_id,
                log.started_at.to_rfc3339(),
                log.completed_at.map(|t| t.to_rfc3339()),
                log.status.as_str(),
                log.result,
                log.error,
            ],
        )?;
        Ok(())
    }

    fn update_log(&self, log: &ExecutionLog) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE execution_logs
             SET completed_at = ?1, status = ?2, result = ?3, error = ?4
             WHERE id = ?5",
            rusqlite::params![
                log.completed_at.map(|t| t.to_rfc3339()),
                log.status.as_str(),
                log.result,
                log.error,
                log.id,
            ],
        )?;
        Ok(())
    }

    fn logs_for_task(&self, task_id: &str) -> Result<Vec<ExecutionLog>> {
        self.query_logs(
            &format!(
                "SELECT {LOG_COLUMNS} FROM execution_logs
                 WHERE task_id = ?1 ORDER BY started_at DESC"
            ),
            &[&task_id],
        )
    }

    fn all_logs(&self) -> Result<Vec<ExecutionLog>> {
        self.query_logs(
            &format!("SELECT {LOG_COLUMNS} FROM execution_logs ORDER BY started_at DESC"),
            &[],
        )
    }

    fn delete_logs_for_task(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM execution_logs WHERE task_id = ?1",
            rusqlite::params![task_id],
        )?;
        Ok(())
    }

    fn recover_stuck_logs(&self) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE execution_logs
             SET status = 'failed', completed_at = ?1, error = ?2
             WHERE status = 'running'",
            rusqlite::params![Utc::now().to_rfc3339(), RECOVERY_ERROR],
        )?;
        Ok(changed as u32)
    }

    fn cleanup_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM execution_logs WHERE started_at < ?1",
            rusqlite::params![cutoff.to_rfc3339()],
        )?;
        Ok(changed as u32)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TempoError::Storage(format!("bad timestamp {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{IntervalUnit, NewTask, Schedule, TaskPayload};
    use tempo_core::SchedulerConfig;

    fn sample_task() -> ScheduleTask {
        NewTask::new(
            "sample",
            Schedule::Interval {
                value: 1,
                unit: IntervalUnit::Min,
            },
            TaskPayload::Message {
                message: "ping".into(),
                images: vec![],
            },
        )
        .into_task(&SchedulerConfig::default(), Utc::now())
    }

    #[test]
    fn task_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let task = sample_task();
        store.put_task(&task).unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.schedule, task.schedule);
        assert_eq!(store.load_tasks().unwrap().len(), 1);

        store.delete_task(&task.id).unwrap();
        assert!(store.get_task(&task.id).unwrap().is_none());
    }

    #[test]
    fn prefix_scan_ignores_foreign_keys() {
        let store = SqliteStore::in_memory().unwrap();
        store.set_kv("settings:theme", "\"dark\"").unwrap();
        store.put_task(&sample_task()).unwrap();
        assert_eq!(store.load_tasks().unwrap().len(), 1);
    }

    #[test]
    fn log_lifecycle_running_to_success() {
        let store = SqliteStore::in_memory().unwrap();
        let mut log = ExecutionLog::started("t1", Utc::now());
        store.insert_log(&log).unwrap();

        log.status = ExecutionStatus::Success;
        log.completed_at = Some(Utc::now());
        log.result = Some("done".into());
        store.update_log(&log).unwrap();

        let logs = store.logs_for_task("t1").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionStatus::Success);
        assert_eq!(logs[0].result.as_deref(), Some("done"));
    }

    #[test]
    fn recover_stuck_logs_resolves_running_rows() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_log(&ExecutionLog::started("t1", Utc::now())).unwrap();

        let mut done = ExecutionLog::started("t2", Utc::now());
        done.status = ExecutionStatus::Success;
        done.completed_at = Some(Utc::now());
        store.insert_log(&done).unwrap();

        assert_eq!(store.recover_stuck_logs().unwrap(), 1);
        // Second pass finds nothing left to recover.
        assert_eq!(store.recover_stuck_logs().unwrap(), 0);

        let logs = store.logs_for_task("t1").unwrap();
        assert_eq!(logs[0].status, ExecutionStatus::Failed);
        assert_eq!(logs[0].error.as_deref(), Some(RECOVERY_ERROR));
        assert!(logs[0].completed_at.is_some());
    }

    #[test]
    fn cleanup_removes_only_old_logs() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let old = ExecutionLog::started("t1", now - chrono::Duration::days(10));
        let fresh = ExecutionLog::started("t1", now);
        store.insert_log(&old).unwrap();
        store.insert_log(&fresh).unwrap();

        let removed = store
            .cleanup_logs_before(now - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = store.logs_for_task("t1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
    }

    #[test]
    fn delete_logs_for_task_leaves_other_tasks() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_log(&ExecutionLog::started("a", Utc::now())).unwrap();
        store.insert_log(&ExecutionLog::started("b", Utc::now())).unwrap();
        store.delete_logs_for_task("a").unwrap();
        assert!(store.logs_for_task("a").unwrap().is_empty());
        assert_eq!(store.logs_for_task("b").unwrap().len(), 1);
    }
}
