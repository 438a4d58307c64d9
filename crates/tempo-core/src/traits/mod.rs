//! Collaborator traits — the seams between the engine and the host
//! application. The engine treats every implementation as opaque.

pub mod agent;
pub mod broadcast;

pub use agent::Agent;
pub use broadcast::BroadcastSink;
