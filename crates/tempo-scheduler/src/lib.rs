//! # Tempo Scheduler
//!
//! The scheduling and execution engine behind Tempo's automated tasks:
//! define a task once (message to the agent, or a direct tool call) and
//! it fires on an interval, a cron expression, or a one-time timestamp.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine
//!   ├── TriggerMap ── OneShotTrigger (tokio timer: once, interval)
//!   │              └─ RecurringCronTrigger (CronEvaluator registration)
//!   ├── RunningTasks — per-task + global concurrency bookkeeping
//!   ├── TaskStore (SQLite) — tasks as KV rows, execution logs typed
//!   ├── Broadcaster — best-effort lifecycle events to the UI sink
//!   └── sweep loop — catches triggers that were missed or never armed
//! ```
//!
//! On startup the engine loads persisted tasks, arms the active ones,
//! resolves execution logs left `running` by a crash, purges old logs,
//! and starts the sweep. Executions run through a concurrency-capped
//! pipeline that writes a `running` log row before dispatching to the
//! agent and settles it to success/failed/timeout afterwards.

pub mod broadcast;
pub mod cron;
pub mod engine;
pub mod pipeline;
pub mod store;
pub mod task;
pub mod trigger;

pub use broadcast::Broadcaster;
pub use cron::{CronCallback, CronClock, CronEvaluator};
pub use engine::{SchedulerEngine, TIMEOUT_MESSAGE};
pub use pipeline::{RunningTask, RunningTasks};
pub use store::{SqliteStore, TaskStore};
pub use task::{
    ExecutionLog, ExecutionStatus, IntervalUnit, NewTask, Schedule, ScheduleTask, TaskPayload,
    TaskStatus, TaskUpdate,
};
pub use trigger::{OneShotTrigger, RecurringCronTrigger, Trigger, TriggerMap};
