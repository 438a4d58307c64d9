//! # Tempo Core
//!
//! Shared foundation for the Tempo workspace: the error type, the TOML
//! configuration layer, and the traits every collaborator implements
//! (the agent that runs task payloads, the sink that receives lifecycle
//! broadcasts). Subsystem crates depend on this; it depends on nothing
//! internal.

pub mod config;
pub mod error;
pub mod traits;

pub use config::{SchedulerConfig, TempoConfig};
pub use error::{Result, TempoError};
pub use traits::{Agent, BroadcastSink};
