//! Core error definitions for the AgentOS task engine.
//!
//! Every crate in the workspace reports failures through [`AgentosError`], so a
//! caller awaiting a task sees the same error value the agent runner raised,
//! the queue produced, or the registry refused with.
//!
//! # Main types
//!
//! - [`AgentosError`]: Unified error enum for the scheduler, registry and engine.
//! - [`AgentosResult`]: Convenience alias for `Result<T, AgentosError>`.

use uuid::Uuid;

/// Top-level error type for the engine.
///
/// Variants map one-to-one onto the failure kinds the engine surfaces.
#[derive(Debug, thiserror::Error)]
pub enum AgentosError {
    /// A task was submitted without an agent id or without input.
    #[error("Task validation error: {0}")]
    TaskValidation(String),

    /// An agent registration was missing a required field.
    #[error("Agent validation error: {0}")]
    AgentValidation(String),

    /// No agent with the given id is cached and the loader has none either.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The agent exists but has been deactivated.
    #[error("Agent is not active: {0}")]
    AgentNotActive(String),

    /// An agent with the same id is already registered.
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    /// The agent still has executions in flight.
    #[error("Cannot unregister agent {agent_id} with {count} active executions")]
    AgentHasActiveExecutions {
        /// Agent that was asked to unregister.
        agent_id: String,
        /// Number of executions currently referencing it.
        count: usize,
    },

    /// The agent runner failed while processing a task.
    #[error("Task execution error: {0}")]
    TaskExecution(String),

    /// The agent runner did not answer within the configured task timeout.
    #[error("Agent {agent_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// Agent whose run exceeded the timeout.
        agent_id: String,
        /// Timeout that was in force.
        timeout_ms: u64,
    },

    /// A pending task was cancelled before dispatch.
    #[error("Task cancelled: {0}")]
    Cancelled(Uuid),

    /// The pending queue was cleared while the task was still waiting.
    #[error("Queue cleared: task {0} was discarded")]
    QueueCleared(Uuid),

    /// The queue was dropped without ever settling the task.
    #[error("Task abandoned: {0}")]
    TaskAbandoned(Uuid),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentosError {
    /// Whether the error came out of running a task against its agent, as
    /// opposed to being a bookkeeping refusal.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            AgentosError::TaskExecution(_)
                | AgentosError::TaskTimeout { .. }
                | AgentosError::Json(_)
                | AgentosError::Io(_)
        )
    }

    /// Whether the error is the result of the task being withdrawn from the
    /// queue rather than executed.
    pub fn is_withdrawal(&self) -> bool {
        matches!(
            self,
            AgentosError::Cancelled(_)
                | AgentosError::QueueCleared(_)
                | AgentosError::TaskAbandoned(_)
        )
    }
}

/// A convenience `Result` alias using [`AgentosError`].
pub type AgentosResult<T> = Result<T, AgentosError>;
