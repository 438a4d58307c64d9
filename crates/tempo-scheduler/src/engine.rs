//! Scheduler Engine — arms triggers, runs the execution pipeline, and
//! keeps the persisted task records honest.
//!
//! One engine instance is built at process start with its store, cron
//! evaluator, and config injected, then handed to every consumer. All
//! shared state sits behind its own lock and no lock is ever held
//! across an await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tempo_core::{Agent, BroadcastSink, Result, SchedulerConfig, TempoError};

use crate::broadcast::Broadcaster;
use crate::cron::{CronCallback, CronEvaluator};
use crate::pipeline::RunningTasks;
use crate::store::TaskStore;
use crate::task::{
    ExecutionLog, ExecutionStatus, NewTask, Schedule, ScheduleTask, TaskPayload, TaskStatus,
    TaskUpdate,
};
use crate::trigger::{OneShotTrigger, RecurringCronTrigger, TriggerMap};

/// Fixed message recorded when the bookkeeping timeout fires.
pub const TIMEOUT_MESSAGE: &str = "task execution timed out";

/// The scheduling and execution engine.
pub struct SchedulerEngine {
    weak: Weak<SchedulerEngine>,
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    evaluator: Arc<dyn CronEvaluator>,
    agent: RwLock<Option<Arc<dyn Agent>>>,
    broadcaster: Broadcaster,
    triggers: TriggerMap,
    running: RunningTasks,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SchedulerEngine {
    /// Build an engine around its collaborators. Nothing is armed until
    /// [`start`](Self::start).
    pub fn new(
        store: Arc<dyn TaskStore>,
        evaluator: Arc<dyn CronEvaluator>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            running: RunningTasks::new(config.max_concurrent_tasks),
            config,
            store,
            evaluator,
            agent: RwLock::new(None),
            broadcaster: Broadcaster::new(),
            triggers: TriggerMap::new(),
            sweep_handle: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn set_agent(&self, agent: Arc<dyn Agent>) {
        *self.agent.write().unwrap() = Some(agent);
    }

    pub fn set_broadcast_sink(&self, sink: Arc<dyn BroadcastSink>) {
        self.broadcaster.set_sink(sink);
    }

    /// Load persisted tasks, arm the active ones, recover logs orphaned
    /// by a previous crash, purge old logs, and start the sweep.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tasks = match self.store.load_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let active: Vec<_> = tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Active)
            .collect();
        info!("⏰ Scheduler starting with {} active tasks", active.len());
        for task in &active {
            self.arm_task(task);
        }

        // Recovery and retention are best-effort; a broken row must not
        // keep the scheduler down.
        match self.store.recover_stuck_logs() {
            Ok(0) => {}
            Ok(recovered) => info!("🔁 Recovered {recovered} execution logs stuck in 'running'"),
            Err(e) => warn!("failed to recover stuck execution logs: {e}"),
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.config.log_retention_days);
        if let Err(e) = self.store.cleanup_logs_before(cutoff) {
            warn!("failed to clean up old execution logs: {e}");
        }

        let weak = self.weak.clone();
        let period = Duration::from_millis(self.config.check_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                engine.sweep().await;
            }
        });
        *self.sweep_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the sweep, disarm every trigger, drop all transient
    /// execution state. Safe to call repeatedly or before `start`.
    pub fn cleanup(&self) {
        let was_running = self.started.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.triggers.clear();
        self.running.clear();
        if was_running {
            info!("🛑 Scheduler stopped");
        }
    }

    // ─── Task CRUD ──────────────────────────────────────

    /// Validate and persist a new task; arm it if the engine is running.
    pub fn create_task(&self, new: NewTask) -> Result<ScheduleTask> {
        let now = Utc::now();
        let next = self.initial_next(&new.schedule, now)?;
        let mut task = new.into_task(&self.config, now);
        task.next_execution_at = next;
        self.store.put_task(&task)?;
        info!("📅 Task created: '{}' ({})", task.name, task.id);
        self.broadcaster.task_created(&task);
        if self.started.load(Ordering::SeqCst) {
            self.arm_task(&task);
        }
        Ok(task)
    }

    /// Apply a partial update. A schedule change is re-validated and the
    /// trigger re-armed.
    pub fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<ScheduleTask> {
        let mut task = self.require_task(task_id)?;
        let now = Utc::now();
        if let Some(name) = update.name {
            task.name = name;
        }
        if let Some(description) = update.description {
            task.description = Some(description);
        }
        if let Some(payload) = update.payload {
            task.payload = payload;
        }
        if let Some(max_retries) = update.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(retry_interval_ms) = update.retry_interval_ms {
            task.retry_interval_ms = retry_interval_ms;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            task.timeout_ms = timeout_ms;
        }
        if let Some(require_confirmation) = update.require_confirmation {
            task.require_confirmation = require_confirmation;
        }
        if let Some(session_id) = update.session_id {
            task.session_id = Some(session_id);
        }
        if let Some(schedule) = update.schedule {
            let next = self.initial_next(&schedule, now)?;
            task.schedule = schedule;
            task.next_execution_at = next;
        }
        task.updated_at = now;
        self.store.put_task(&task)?;
        self.broadcaster.task_updated(&task);
        if self.started.load(Ordering::SeqCst) {
            if task.status == TaskStatus::Active {
                self.arm_task(&task);
            } else {
                self.triggers.disarm(&task.id);
            }
        }
        Ok(task)
    }

    /// Disarm and remove a task along with its execution logs. An
    /// execution already dispatched keeps running; only its bookkeeping
    /// is dropped.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.require_task(task_id)?;
        self.triggers.disarm(task_id);
        self.store.delete_task(task_id)?;
        self.store.delete_logs_for_task(task_id)?;
        info!("🗑️ Task deleted: {task_id}");
        self.broadcaster.task_deleted(task_id);
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<ScheduleTask>> {
        self.store.get_task(task_id)
    }

    /// All tasks, newest first.
    pub fn list_tasks(&self) -> Result<Vec<ScheduleTask>> {
        let mut tasks = self.store.load_tasks()?;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Flip a task between Active and Paused. Terminal tasks cannot be
    /// toggled.
    pub fn toggle_task(&self, task_id: &str) -> Result<ScheduleTask> {
        let mut task = self.require_task(task_id)?;
        let now = Utc::now();
        match task.status {
            TaskStatus::Active => {
                task.status = TaskStatus::Paused;
            }
            TaskStatus::Paused => {
                task.status = TaskStatus::Active;
                // Resume recomputes the forward-looking types; a Once
                // task keeps its original time and catches up if it is
                // already past.
                match &task.schedule {
                    Schedule::Interval { .. } => {
                        task.next_execution_at = task.schedule.next_occurrence(now);
                    }
                    Schedule::Cron { expression } => {
                        task.next_execution_at = self.evaluator.next_after(expression, now).ok();
                    }
                    Schedule::Once { .. } => {}
                }
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(TempoError::Validation(format!(
                    "cannot toggle terminal task {task_id}"
                )));
            }
        }
        task.updated_at = now;
        self.store.put_task(&task)?;
        self.broadcaster.task_updated(&task);
        if self.started.load(Ordering::SeqCst) {
            if task.status == TaskStatus::Active {
                self.arm_task(&task);
            } else {
                self.triggers.disarm(&task.id);
            }
        }
        Ok(task)
    }

    // ─── Execution ──────────────────────────────────────

    /// Run a task immediately. Rejects without side effects when the
    /// task is unknown, already running, or the concurrency cap is
    /// reached; execution errors are rethrown to the caller.
    pub async fn execute_now(&self, task_id: &str) -> Result<()> {
        let task = self.require_task(task_id)?;
        let result = self.execute_task(&task).await;
        match &result {
            Err(e) if e.is_rejection() => {}
            _ => self.rearm_current(task_id),
        }
        result
    }

    pub fn logs_for_task(&self, task_id: &str) -> Result<Vec<ExecutionLog>> {
        self.store.logs_for_task(task_id)
    }

    pub fn all_logs(&self) -> Result<Vec<ExecutionLog>> {
        self.store.all_logs()
    }

    /// Timer/evaluator entry point: execute and re-arm, swallowing
    /// failures so one misbehaving task cannot halt the engine.
    async fn run_scheduled(&self, task_id: &str) {
        let task = match self.store.get_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.triggers.forget(task_id);
                return;
            }
            Err(e) => {
                warn!("failed to load task {task_id}: {e}");
                return;
            }
        };
        if task.status != TaskStatus::Active {
            return;
        }
        // A fired timer is spent; drop its entry so re-arming (or the
        // sweep) sees the truth. Cron registrations keep firing.
        if !matches!(task.schedule, Schedule::Cron { .. }) {
            self.triggers.forget(task_id);
        }
        match self.execute_task(&task).await {
            Ok(()) => {}
            Err(e) if e.is_rejection() => {
                debug!("skipping scheduled run of '{}': {e}", task.name);
            }
            Err(e) => warn!("⚠️ Scheduled execution of '{}' failed: {e}", task.name),
        }
        self.rearm_current(task_id);
    }

    /// The execution pipeline of one attempt.
    async fn execute_task(&self, task: &ScheduleTask) -> Result<()> {
        let log = ExecutionLog::started(&task.id, Utc::now());
        self.running.begin(&task.id, &log.id)?;
        // The running row goes in before dispatch so a crash mid-run
        // leaves a discoverable trace for recovery.
        if let Err(e) = self.store.insert_log(&log) {
            self.running.take(&task.id, &log.id);
            return Err(e);
        }

        if task.timeout_ms > 0 {
            let weak = self.weak.clone();
            let task_id = task.id.clone();
            let log_id = log.id.clone();
            let timeout = Duration::from_millis(task.timeout_ms);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(engine) = weak.upgrade() {
                    engine.resolve_timeout(&task_id, &log_id);
                }
            });
            self.running.attach_timeout(&task.id, handle);
        }

        info!("▶️ Executing task '{}' ({})", task.name, task.id);
        let agent = self.agent.read().unwrap().clone();
        let dispatched: Result<String> = match agent {
            None => Err(TempoError::Agent("no agent attached".into())),
            Some(agent) => match &task.payload {
                TaskPayload::Message { message, images } => agent
                    .process_user_message(message, images)
                    .await
                    .map(|_| String::new()),
                TaskPayload::Tool { name, args } => agent.execute_tool(name, args).await,
            },
        };

        // Always release the slot. A missing entry means the timeout
        // handler already resolved this attempt; its verdict stands and
        // no counters move.
        let Some(entry) = self.running.take(&task.id, &log.id) else {
            return Ok(());
        };
        if let Some(handle) = entry.timeout {
            handle.abort();
        }

        match dispatched {
            Ok(result) => {
                self.finish_success(&task.id, log, result);
                Ok(())
            }
            Err(error) => {
                self.finish_failure(&task.id, log, &error);
                Err(error)
            }
        }
    }

    fn finish_success(&self, task_id: &str, mut log: ExecutionLog, result: String) {
        let now = Utc::now();
        log.status = ExecutionStatus::Success;
        log.completed_at = Some(now);
        log.result = Some(result.clone());
        if let Err(e) = self.store.update_log(&log) {
            warn!("failed to update execution log {}: {e}", log.id);
        }
        // Re-read the record: it may have been edited while the agent
        // ran, or deleted (then there is nothing left to update).
        let Ok(Some(mut task)) = self.store.get_task(task_id) else {
            return;
        };
        task.execution_count += 1;
        task.failure_count = 0;
        task.last_executed_at = Some(now);
        task.updated_at = now;
        match &task.schedule {
            Schedule::Interval { .. } => {
                task.next_execution_at = task.schedule.next_occurrence(now);
            }
            Schedule::Once { .. } => {
                task.status = TaskStatus::Completed;
                task.next_execution_at = None;
            }
            Schedule::Cron { expression } => {
                // Informational catch-up value; live firing stays with
                // the evaluator registration.
                task.next_execution_at = self.evaluator.next_after(expression, now).ok();
            }
        }
        if let Err(e) = self.store.put_task(&task) {
            warn!("failed to persist task {task_id}: {e}");
        }
        info!("✅ Task '{}' executed", task.name);
        self.broadcaster.task_executed(&task, &result);
    }

    fn finish_failure(&self, task_id: &str, mut log: ExecutionLog, error: &TempoError) {
        let now = Utc::now();
        let message = error.to_string();
        log.status = ExecutionStatus::Failed;
        log.completed_at = Some(now);
        log.error = Some(message.clone());
        if let Err(e) = self.store.update_log(&log) {
            warn!("failed to update execution log {}: {e}", log.id);
        }
        if let Ok(Some(mut task)) = self.store.get_task(task_id) {
            task.failure_count += 1;
            task.updated_at = now;
            if task.failure_count >= task.max_retries {
                task.status = TaskStatus::Failed;
                task.next_execution_at = None;
                warn!(
                    "❌ Task '{}' failed {} times, marking failed",
                    task.name, task.failure_count
                );
            } else if matches!(task.schedule, Schedule::Interval { .. }) {
                task.next_execution_at = task.schedule.next_occurrence(now);
            }
            if let Err(e) = self.store.put_task(&task) {
                warn!("failed to persist task {task_id}: {e}");
            }
        }
        self.broadcaster.task_failed(task_id, &message);
    }

    /// Timeout bookkeeping: resolve the log and free the slot. The
    /// agent call stays in flight and failure counters stay untouched.
    fn resolve_timeout(&self, task_id: &str, log_id: &str) {
        let Some(entry) = self.running.take(task_id, log_id) else {
            return;
        };
        let log = ExecutionLog {
            id: log_id.to_string(),
            task_id: task_id.to_string(),
            started_at: entry.started_at,
            completed_at: Some(Utc::now()),
            status: ExecutionStatus::Timeout,
            result: None,
            error: Some(TIMEOUT_MESSAGE.to_string()),
        };
        if let Err(e) = self.store.update_log(&log) {
            warn!("failed to update execution log {log_id}: {e}");
        }
        warn!("⏱️ Task {task_id} hit its execution timeout");
        self.broadcaster.task_failed(task_id, TIMEOUT_MESSAGE);
    }

    // ─── Arming ──────────────────────────────────────

    /// Validate a schedule and compute its first occurrence. Cron
    /// expressions are parsed by the evaluator here so a bad one is
    /// rejected before anything is persisted.
    fn initial_next(
        &self,
        schedule: &Schedule,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<chrono::DateTime<Utc>>> {
        schedule.validate(now)?;
        match schedule {
            Schedule::Cron { expression } => {
                Ok(Some(self.evaluator.next_after(expression, now)?))
            }
            other => Ok(other.next_occurrence(now)),
        }
    }

    /// Arm the trigger for a task, replacing whatever was armed before.
    fn arm_task(&self, task: &ScheduleTask) {
        let weak = self.weak.clone();
        let task_id = task.id.clone();
        match &task.schedule {
            Schedule::Cron { expression } => {
                let callback: CronCallback = Arc::new(move || {
                    let weak = weak.clone();
                    let task_id = task_id.clone();
                    Box::pin(async move {
                        if let Some(engine) = weak.upgrade() {
                            engine.run_scheduled(&task_id).await;
                        }
                    })
                });
                match RecurringCronTrigger::arm(
                    self.evaluator.clone(),
                    &task.id,
                    expression,
                    callback,
                ) {
                    Ok(trigger) => self.triggers.arm(&task.id, Box::new(trigger)),
                    // The sweep retries the registration on its next pass.
                    Err(e) => warn!("failed to register cron trigger for '{}': {e}", task.name),
                }
            }
            _ => {
                let now = Utc::now();
                let next = task
                    .next_execution_at
                    .or_else(|| task.schedule.next_occurrence(now));
                let Some(next) = next else {
                    return; // a spent Once schedule has nothing to arm
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
                let trigger = OneShotTrigger::arm(delay, move || async move {
                    if let Some(engine) = weak.upgrade() {
                        engine.run_scheduled(&task_id).await;
                    }
                });
                self.triggers.arm(&task.id, Box::new(trigger));
            }
        }
    }

    /// Reload a task and bring its trigger in line with its state.
    /// Called after every execution.
    fn rearm_current(&self, task_id: &str) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let task = match self.store.get_task(task_id) {
            Ok(Some(task)) => task,
            _ => {
                self.triggers.disarm(task_id);
                return;
            }
        };
        if task.status != TaskStatus::Active {
            self.triggers.disarm(task_id);
            return;
        }
        match &task.schedule {
            // A live cron registration is authoritative; re-arming it
            // from inside its own callback would cancel the loop.
            Schedule::Cron { .. } if self.triggers.contains(task_id) => {}
            _ => self.arm_task(&task),
        }
    }

    /// Safety-net pass: fire active tasks whose next execution has
    /// passed without any trigger left to deliver it.
    async fn sweep(&self) {
        let tasks = match self.store.load_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("sweep: failed to load tasks: {e}");
                return;
            }
        };
        let now = Utc::now();
        for task in tasks {
            if task.status != TaskStatus::Active || self.running.contains(&task.id) {
                continue;
            }
            let armed = self.triggers.contains(&task.id);
            let due = task.next_execution_at.is_some_and(|next| next <= now);
            if !due {
                // Re-register cron triggers that were lost before the
                // evaluator came up.
                if !armed && matches!(task.schedule, Schedule::Cron { .. }) {
                    self.arm_task(&task);
                }
                continue;
            }
            if armed {
                continue;
            }
            if self.running.len() >= self.config.max_concurrent_tasks {
                debug!("sweep: concurrency cap reached, deferring remaining due tasks");
                break;
            }
            info!("🧹 Sweep firing missed task '{}'", task.name);
            match self.execute_task(&task).await {
                Ok(()) => {}
                Err(e) if e.is_rejection() => {}
                Err(e) => warn!("sweep execution of '{}' failed: {e}", task.name),
            }
            self.rearm_current(&task.id);
        }
    }

    fn require_task(&self, task_id: &str) -> Result<ScheduleTask> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| TempoError::TaskNotFound(task_id.to_string()))
    }
}
