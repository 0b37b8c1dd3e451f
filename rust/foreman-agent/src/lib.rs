//! Foreman worker agent.
//!
//! Connects out to the Foreman gateway, authenticates with its API key, and
//! executes dispatched tasks against local project checkouts through an
//! [`executor::ExecutionEngine`]. The [`processor`] enforces the per-worker
//! concurrency cap and cancellation; the [`monitor`] samples host resources
//! and gates admission.

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod processor;

pub use error::{AgentError, AgentResult};
