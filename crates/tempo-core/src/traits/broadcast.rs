//! The UI notification seam.

/// A fire-and-forget sink for lifecycle events (typically a renderer
/// process or dashboard socket). Implementations must not panic when
/// the underlying surface is gone; the engine never inspects an outcome.
pub trait BroadcastSink: Send + Sync {
    fn send(&self, channel: &str, payload: serde_json::Value);
}
