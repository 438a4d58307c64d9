//! Cron evaluator — the collaborator that owns cron occurrence
//! arithmetic and live cron firing. The engine never times cron
//! triggers itself; it registers a callback here and trusts the
//! evaluator's clock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::task::JoinHandle;
use tracing::warn;

use tempo_core::{Result, TempoError};

/// Callback invoked on each cron occurrence.
pub type CronCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Computes occurrences for cron expressions and keeps live
/// registrations that fire a callback at each one.
pub trait CronEvaluator: Send + Sync {
    /// The first occurrence strictly after `after`. Errors on malformed
    /// expressions.
    fn next_after(&self, expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Register a live firing for `task_id`. Replaces any existing
    /// registration under the same id.
    fn register(&self, task_id: &str, expression: &str, callback: CronCallback) -> Result<()>;

    /// Drop the live firing for `task_id`. Safe on unknown ids.
    fn unregister(&self, task_id: &str);
}

/// Default evaluator backed by the `cron` crate. Public expressions are
/// 5-field (no seconds column); a `0` seconds field is prepended before
/// parsing. Each registration is a tokio task that sleeps to the next
/// occurrence and fires.
pub struct CronClock {
    registrations: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CronClock {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
        }
    }

    fn parse(expression: &str) -> Result<CronSchedule> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(TempoError::Cron(format!(
                "expected 5 fields, got {fields}"
            )));
        }
        let with_seconds = format!("0 {}", expression.trim());
        CronSchedule::from_str(&with_seconds)
            .map_err(|e| TempoError::Cron(format!("{expression}: {e}")))
    }
}

impl Default for CronClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CronEvaluator for CronClock {
    fn next_after(&self, expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = Self::parse(expression)?;
        schedule
            .after(&after)
            .next()
            .ok_or_else(|| TempoError::Cron(format!("no next occurrence for {expression}")))
    }

    fn register(&self, task_id: &str, expression: &str, callback: CronCallback) -> Result<()> {
        let schedule = Self::parse(expression)?;
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    warn!("cron registration {id} has no further occurrences");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;
                callback().await;
            }
        });
        let mut registrations = self.registrations.lock().unwrap();
        if let Some(old) = registrations.insert(task_id.to_string(), handle) {
            old.abort();
        }
        Ok(())
    }

    fn unregister(&self, task_id: &str) {
        if let Some(handle) = self.registrations.lock().unwrap().remove(task_id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn next_after_daily_expression() {
        let clock = CronClock::new();
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 7, 30, 0).unwrap();
        let next = clock.next_after("0 8 * * *", after).unwrap();
        assert_eq!(next.hour(), 8);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.date_naive(), after.date_naive());
    }

    #[test]
    fn next_after_every_15_minutes() {
        let clock = CronClock::new();
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 0).unwrap();
        let next = clock.next_after("*/15 * * * *", after).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn next_after_rejects_malformed() {
        let clock = CronClock::new();
        let after = Utc::now();
        assert!(clock.next_after("bad", after).is_err());
        assert!(clock.next_after("61 * * * *", after).is_err());
        // 6-field expressions belong to the internal format, not the API.
        assert!(clock.next_after("0 0 8 * * *", after).is_err());
    }

    #[tokio::test]
    async fn unregister_is_safe_on_unknown_id() {
        let clock = CronClock::new();
        clock.unregister("never-registered");
        clock.unregister("never-registered");
    }

    #[tokio::test]
    async fn register_replaces_existing_registration() {
        let clock = CronClock::new();
        let fires = Arc::new(AtomicU32::new(0));
        let make_cb = |fires: Arc<AtomicU32>| -> CronCallback {
            Arc::new(move || {
                let fires = fires.clone();
                Box::pin(async move {
                    fires.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        clock
            .register("job", "*/5 * * * *", make_cb(fires.clone()))
            .unwrap();
        clock
            .register("job", "*/10 * * * *", make_cb(fires.clone()))
            .unwrap();
        assert_eq!(clock.registrations.lock().unwrap().len(), 1);
        clock.unregister("job");
        assert!(clock.registrations.lock().unwrap().is_empty());
    }
}
