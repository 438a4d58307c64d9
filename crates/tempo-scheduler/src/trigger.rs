//! Trigger primitives — what actually causes a task to fire.
//!
//! Two mechanisms behind one seam: a software timer for one-shot and
//! interval tasks, and a delegated evaluator registration for cron
//! tasks. The engine arms and disarms through [`TriggerMap`] without
//! caring which one a task uses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use tempo_core::Result;

use crate::cron::{CronCallback, CronEvaluator};

/// An armed trigger for one task.
pub trait Trigger: Send {
    /// Cancel the future firing. Must be safe to call more than once.
    fn disarm(&mut self);
}

/// Timer trigger: sleeps for `delay`, fires once. Used for both Once
/// tasks and each leg of an Interval task (the engine re-arms after
/// every run, so interval phase drifts by execution latency).
pub struct OneShotTrigger {
    handle: Option<JoinHandle<()>>,
}

impl OneShotTrigger {
    pub fn arm<F, Fut>(delay: Duration, fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire().await;
        });
        Self {
            handle: Some(handle),
        }
    }
}

impl Trigger for OneShotTrigger {
    fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Cron trigger: a live registration with the evaluator, which owns the
/// firing clock. Disarming unregisters.
pub struct RecurringCronTrigger {
    evaluator: Arc<dyn CronEvaluator>,
    task_id: String,
    armed: bool,
}

impl RecurringCronTrigger {
    pub fn arm(
        evaluator: Arc<dyn CronEvaluator>,
        task_id: &str,
        expression: &str,
        callback: CronCallback,
    ) -> Result<Self> {
        evaluator.register(task_id, expression, callback)?;
        Ok(Self {
            evaluator,
            task_id: task_id.to_string(),
            armed: true,
        })
    }
}

impl Trigger for RecurringCronTrigger {
    fn disarm(&mut self) {
        if self.armed {
            self.evaluator.unregister(&self.task_id);
            self.armed = false;
        }
    }
}

/// Armed triggers keyed by task id. Arming always disarms whatever was
/// there before, so re-arming is idempotent.
pub struct TriggerMap {
    inner: Mutex<HashMap<String, Box<dyn Trigger>>>,
}

impl TriggerMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn arm(&self, task_id: &str, trigger: Box<dyn Trigger>) {
        let mut triggers = self.inner.lock().unwrap();
        if let Some(mut old) = triggers.remove(task_id) {
            old.disarm();
        }
        triggers.insert(task_id.to_string(), trigger);
    }

    /// Disarm and remove. Safe on ids that were never armed.
    pub fn disarm(&self, task_id: &str) {
        let removed = self.inner.lock().unwrap().remove(task_id);
        if let Some(mut trigger) = removed {
            trigger.disarm();
        }
    }

    /// Remove the entry without cancelling anything. Used by a timer
    /// that just fired: the spawned task is the caller, so aborting it
    /// would cancel the execution in progress.
    pub fn forget(&self, task_id: &str) {
        self.inner.lock().unwrap().remove(task_id);
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(task_id)
    }

    /// Disarm everything. Shutdown path.
    pub fn clear(&self) {
        let mut triggers = self.inner.lock().unwrap();
        for (_, mut trigger) in triggers.drain() {
            trigger.disarm();
        }
    }
}

impl Default for TriggerMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlagTrigger {
        disarmed: Arc<AtomicU32>,
    }

    impl Trigger for FlagTrigger {
        fn disarm(&mut self) {
            self.disarmed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn disarm_is_idempotent() {
        let map = TriggerMap::new();
        let disarmed = Arc::new(AtomicU32::new(0));
        map.arm(
            "t1",
            Box::new(FlagTrigger {
                disarmed: disarmed.clone(),
            }),
        );
        map.disarm("t1");
        map.disarm("t1");
        assert_eq!(disarmed.load(Ordering::SeqCst), 1);
        assert!(!map.contains("t1"));
    }

    #[test]
    fn arm_replaces_and_disarms_previous() {
        let map = TriggerMap::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        map.arm("t1", Box::new(FlagTrigger { disarmed: first.clone() }));
        map.arm("t1", Box::new(FlagTrigger { disarmed: second.clone() }));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forget_does_not_cancel() {
        let map = TriggerMap::new();
        let disarmed = Arc::new(AtomicU32::new(0));
        map.arm(
            "t1",
            Box::new(FlagTrigger {
                disarmed: disarmed.clone(),
            }),
        );
        map.forget("t1");
        assert_eq!(disarmed.load(Ordering::SeqCst), 0);
        assert!(!map.contains("t1"));
    }

    #[tokio::test]
    async fn one_shot_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let _trigger = OneShotTrigger::arm(Duration::from_millis(20), move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disarmed_one_shot_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let mut trigger = OneShotTrigger::arm(Duration::from_millis(20), move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        trigger.disarm();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
