//! Execution bookkeeping — the transient running-set.
//!
//! Invariants: at most one entry per task id, and never more entries
//! than the global concurrency cap. Entries are never persisted; after
//! a crash the stuck `running` log rows are the only trace left.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use tempo_core::{Result, TempoError};

/// One in-flight execution.
pub struct RunningTask {
    pub task_id: String,
    /// Log row this attempt belongs to; the timeout handler uses it to
    /// avoid resolving a later attempt of the same task.
    pub log_id: String,
    pub started_at: DateTime<Utc>,
    pub timeout: Option<JoinHandle<()>>,
}

/// The running-set plus the global concurrency cap.
pub struct RunningTasks {
    max_concurrent: usize,
    inner: Mutex<HashMap<String, RunningTask>>,
}

impl RunningTasks {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a slot for `task_id`. Rejects (never queues) when the
    /// task is already running or the cap is reached.
    pub fn begin(&self, task_id: &str, log_id: &str) -> Result<()> {
        let mut running = self.inner.lock().unwrap();
        if running.contains_key(task_id) {
            return Err(TempoError::AlreadyRunning(task_id.to_string()));
        }
        if running.len() >= self.max_concurrent {
            return Err(TempoError::CapacityExhausted(running.len()));
        }
        running.insert(
            task_id.to_string(),
            RunningTask {
                task_id: task_id.to_string(),
                log_id: log_id.to_string(),
                started_at: Utc::now(),
                timeout: None,
            },
        );
        Ok(())
    }

    /// Attach a timeout handle to an in-flight entry. If the entry is
    /// already gone the handle is aborted immediately.
    pub fn attach_timeout(&self, task_id: &str, handle: JoinHandle<()>) {
        let mut running = self.inner.lock().unwrap();
        match running.get_mut(task_id) {
            Some(entry) => entry.timeout = Some(handle),
            None => handle.abort(),
        }
    }

    /// Remove and return the entry for this exact attempt. Returns
    /// `None` when the entry is gone or belongs to a different attempt —
    /// which means the timeout path already resolved this one.
    pub fn take(&self, task_id: &str, log_id: &str) -> Option<RunningTask> {
        let mut running = self.inner.lock().unwrap();
        if running.get(task_id).is_some_and(|e| e.log_id == log_id) {
            running.remove(task_id)
        } else {
            None
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Drop every entry, aborting pending timeout handles. Shutdown path.
    pub fn clear(&self) {
        let mut running = self.inner.lock().unwrap();
        for (_, entry) in running.drain() {
            if let Some(handle) = entry.timeout {
                handle.abort();
            }
        }
    }
}
