//! The agent seam: whatever actually executes a task's payload.

use async_trait::async_trait;

use crate::error::Result;

/// An AI agent capable of handling a user message or running a named
/// tool directly. Calls may be slow; the engine never retries them
/// internally and cannot abort one once dispatched.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Process a message payload, optionally with image attachments.
    async fn process_user_message(&self, message: &str, images: &[String]) -> Result<()>;

    /// Invoke a named tool with JSON arguments and return its output.
    async fn execute_tool(&self, name: &str, args: &serde_json::Value) -> Result<String>;
}
