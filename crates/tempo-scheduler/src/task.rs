//! Task definitions — the core data model for scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tempo_core::{Result, SchedulerConfig, TempoError};

/// Milliseconds per interval unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Ms,
    S,
    Min,
    H,
    Day,
}

impl IntervalUnit {
    pub fn millis(&self) -> i64 {
        match self {
            IntervalUnit::Ms => 1,
            IntervalUnit::S => 1_000,
            IntervalUnit::Min => 60_000,
            IntervalUnit::H => 3_600_000,
            IntervalUnit::Day => 86_400_000,
        }
    }
}

/// How/when a task triggers. Each variant carries only the fields that
/// are meaningful for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run every `value` units, re-armed from the completion of each run.
    Interval { value: u64, unit: IntervalUnit },
    /// Run on a 5-field cron expression, fired by the cron evaluator.
    Cron { expression: String },
    /// Run once at a specific time.
    Once { at: DateTime<Utc> },
}

impl Schedule {
    /// Validate the schedule against the current time. Cron validation
    /// here is a shape check only; semantic parsing belongs to the
    /// evaluator.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        match self {
            Schedule::Interval { value, .. } => {
                if *value == 0 {
                    return Err(TempoError::Validation(
                        "interval value must be greater than zero".into(),
                    ));
                }
                Ok(())
            }
            Schedule::Cron { expression } => {
                let fields = expression.split_whitespace().count();
                if expression.trim().is_empty() || fields != 5 {
                    return Err(TempoError::Validation(format!(
                        "cron expression must have 5 fields, got {fields}"
                    )));
                }
                Ok(())
            }
            Schedule::Once { at } => {
                if *at <= now {
                    return Err(TempoError::Validation(
                        "one-time schedule must be in the future".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Compute the next occurrence after `base` for the types the engine
    /// can time on its own. Cron always returns `None`: the evaluator
    /// owns cron occurrence arithmetic.
    pub fn next_occurrence(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval { .. } => Some(base + self.interval_duration()?),
            Schedule::Cron { .. } => None,
            Schedule::Once { at } => {
                if *at > base {
                    Some(*at)
                } else {
                    None
                }
            }
        }
    }

    /// The full interval as a chrono duration (`None` for other types).
    pub fn interval_duration(&self) -> Option<chrono::Duration> {
        match self {
            Schedule::Interval { value, unit } => Some(chrono::Duration::milliseconds(
                (*value as i64).saturating_mul(unit.millis()),
            )),
            _ => None,
        }
    }
}

/// What the task does when triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Send a message to the agent, optionally with images.
    Message {
        message: String,
        #[serde(default)]
        images: Vec<String>,
    },
    /// Invoke a named tool directly.
    Tool {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

/// Task lifecycle status. `Completed` and `Failed` are terminal: no
/// trigger is ever armed for them again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A persisted scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule: Schedule,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_execution_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u32,
    /// Consecutive failures; reset to 0 on success.
    #[serde(default)]
    pub failure_count: u32,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    /// Bookkeeping timeout per execution, 0 = none.
    pub timeout_ms: u64,
    #[serde(default)]
    pub require_confirmation: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Parameters for creating a task. Policy fields left `None` fall back
/// to the engine's configured defaults.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub description: Option<String>,
    pub schedule: Schedule,
    pub payload: TaskPayload,
    pub max_retries: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub require_confirmation: bool,
    pub session_id: Option<String>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: TaskPayload) -> Self {
        Self {
            name: name.into(),
            description: None,
            schedule,
            payload,
            max_retries: None,
            retry_interval_ms: None,
            timeout_ms: None,
            require_confirmation: false,
            session_id: None,
        }
    }

    pub(crate) fn into_task(self, config: &SchedulerConfig, now: DateTime<Utc>) -> ScheduleTask {
        ScheduleTask {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            next_execution_at: self.schedule.next_occurrence(now),
            schedule: self.schedule,
            payload: self.payload,
            status: TaskStatus::Active,
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            execution_count: 0,
            failure_count: 0,
            max_retries: self.max_retries.unwrap_or(config.default_max_retries),
            retry_interval_ms: self
                .retry_interval_ms
                .unwrap_or(config.default_retry_interval_ms),
            timeout_ms: self.timeout_ms.unwrap_or(config.default_timeout_ms),
            require_confirmation: self.require_confirmation,
            session_id: self.session_id,
        }
    }
}

/// Partial update applied by `update_task`. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule: Option<Schedule>,
    pub payload: Option<TaskPayload>,
    pub max_retries: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub require_confirmation: Option<bool>,
    pub session_id: Option<String>,
}

/// One attempt to run a task, `running` until resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionLog {
    /// A fresh `running` row, inserted before dispatch so a crash
    /// mid-run leaves a discoverable trace.
    pub fn started(task_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            started_at: now,
            completed_at: None,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
        }
    }
}

/// Execution log lifecycle: `running` resolves to exactly one of the
/// terminal states. `Timeout` is distinct from `Failed` and stays out of
/// the retry-counting path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(TempoError::Storage(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn interval_next_occurrence_adds_unit_millis() {
        let schedule = Schedule::Interval {
            value: 5,
            unit: IntervalUnit::Min,
        };
        let next = schedule.next_occurrence(t0()).unwrap();
        assert_eq!((next - t0()).num_milliseconds(), 300_000);
    }

    #[test]
    fn unit_millis_mapping() {
        assert_eq!(IntervalUnit::Ms.millis(), 1);
        assert_eq!(IntervalUnit::S.millis(), 1_000);
        assert_eq!(IntervalUnit::Min.millis(), 60_000);
        assert_eq!(IntervalUnit::H.millis(), 3_600_000);
        assert_eq!(IntervalUnit::Day.millis(), 86_400_000);
    }

    #[test]
    fn once_next_occurrence_is_none_when_past() {
        let at = t0();
        let schedule = Schedule::Once { at };
        assert_eq!(schedule.next_occurrence(at), None);
        assert_eq!(
            schedule.next_occurrence(at - chrono::Duration::seconds(1)),
            Some(at)
        );
    }

    #[test]
    fn cron_next_occurrence_is_delegated() {
        let schedule = Schedule::Cron {
            expression: "*/5 * * * *".into(),
        };
        assert_eq!(schedule.next_occurrence(t0()), None);
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let schedule = Schedule::Interval {
            value: 0,
            unit: IntervalUnit::S,
        };
        assert!(schedule.validate(t0()).is_err());
    }

    #[test]
    fn validate_rejects_bad_cron_shape() {
        for expression in ["", "* * * *", "0 0 * * * *"] {
            let schedule = Schedule::Cron {
                expression: expression.into(),
            };
            assert!(schedule.validate(t0()).is_err(), "accepted {expression:?}");
        }
        let ok = Schedule::Cron {
            expression: "*/5 * * * *".into(),
        };
        assert!(ok.validate(t0()).is_ok());
    }

    #[test]
    fn validate_rejects_past_once() {
        let schedule = Schedule::Once {
            at: t0() - chrono::Duration::seconds(1),
        };
        assert!(schedule.validate(t0()).is_err());
    }

    #[test]
    fn message_payload_images_default_empty() {
        let payload: TaskPayload =
            serde_json::from_str(r#"{"type":"message","message":"hi"}"#).unwrap();
        match payload {
            TaskPayload::Message { images, .. } => assert!(images.is_empty()),
            _ => panic!("expected message payload"),
        }
    }

    #[test]
    fn new_task_applies_config_defaults() {
        let config = SchedulerConfig::default();
        let task = NewTask::new(
            "check",
            Schedule::Interval {
                value: 1,
                unit: IntervalUnit::Min,
            },
            TaskPayload::Message {
                message: "ping".into(),
                images: vec![],
            },
        )
        .into_task(&config, t0());
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.max_retries, config.default_max_retries);
        assert_eq!(task.timeout_ms, config.default_timeout_ms);
        assert_eq!(task.next_execution_at, Some(t0() + chrono::Duration::minutes(1)));
    }
}
