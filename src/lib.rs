//! taskfleet: bounded-concurrency task orchestration for browser
//! automation executors, with per-session trajectories and worker
//! sub-sessions.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod router;
pub mod store;
pub mod tasks;
pub mod trajectory;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
