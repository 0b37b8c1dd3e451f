//! Worker-side error types.

use thiserror::Error;

/// Core error type for the worker agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Host resources are above the hard threshold; new tasks are rejected.
    #[error("resources exhausted: memory {memory_pct:.1}%, cpu {cpu_pct:.1}%")]
    ResourceExhausted { memory_pct: f64, cpu_pct: f64 },

    #[error("execution engine failure: {0}")]
    Engine(String),

    #[error("gateway connection failure: {0}")]
    Connection(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Protocol(#[from] foreman_protocol::ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
