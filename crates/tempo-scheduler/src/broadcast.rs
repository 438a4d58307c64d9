//! Best-effort lifecycle notifications to a UI surface.
//!
//! The broadcaster has no state the engine can observe and no failure
//! mode: with no sink attached every emit is a debug log and nothing
//! else.

use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::debug;

use tempo_core::BroadcastSink;

use crate::task::ScheduleTask;

pub const TASK_CREATED: &str = "task-created";
pub const TASK_UPDATED: &str = "task-updated";
pub const TASK_DELETED: &str = "task-deleted";
pub const TASK_EXECUTED: &str = "task-executed";
pub const TASK_FAILED: &str = "task-failed";

pub struct Broadcaster {
    sink: RwLock<Option<Arc<dyn BroadcastSink>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            sink: RwLock::new(None),
        }
    }

    pub fn set_sink(&self, sink: Arc<dyn BroadcastSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    pub fn task_created(&self, task: &ScheduleTask) {
        self.emit(TASK_CREATED, json!({ "task": task }));
    }

    pub fn task_updated(&self, task: &ScheduleTask) {
        self.emit(TASK_UPDATED, json!({ "task": task }));
    }

    pub fn task_deleted(&self, task_id: &str) {
        self.emit(TASK_DELETED, json!({ "task_id": task_id }));
    }

    pub fn task_executed(&self, task: &ScheduleTask, result: &str) {
        self.emit(TASK_EXECUTED, json!({ "task": task, "result": result }));
    }

    pub fn task_failed(&self, task_id: &str, error: &str) {
        self.emit(TASK_FAILED, json!({ "task_id": task_id, "error": error }));
    }

    fn emit(&self, channel: &str, payload: serde_json::Value) {
        let sink = self.sink.read().unwrap().clone();
        match sink {
            Some(sink) => sink.send(channel, payload),
            None => debug!("no broadcast sink attached, dropping {channel}"),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink {
        events: Mutex<Vec<String>>,
    }

    impl BroadcastSink for CollectingSink {
        fn send(&self, channel: &str, _payload: serde_json::Value) {
            self.events.lock().unwrap().push(channel.to_string());
        }
    }

    #[test]
    fn emit_without_sink_is_a_noop() {
        let broadcaster = Broadcaster::new();
        broadcaster.task_deleted("t1");
        broadcaster.task_failed("t1", "boom");
    }

    #[test]
    fn emit_reaches_attached_sink() {
        let broadcaster = Broadcaster::new();
        let sink = Arc::new(CollectingSink {
            events: Mutex::new(Vec::new()),
        });
        broadcaster.set_sink(sink.clone());
        broadcaster.task_deleted("t1");
        broadcaster.task_failed("t1", "boom");
        let events = sink.events.lock().unwrap();
        assert_eq!(events.as_slice(), [TASK_DELETED, TASK_FAILED]);
    }
}
