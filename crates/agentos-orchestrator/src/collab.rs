//! Contracts the engine needs from the host application.
//!
//! The engine never loads agent definitions or performs agent work itself;
//! it is handed an [`AgentLoader`] and an [`AgentRunner`] at construction.

use crate::types::{AgentDescriptor, Metadata};
use agentos_core::AgentosResult;
use async_trait::async_trait;
use serde_json::Value;

/// Source of agent descriptors. Must be safe to call repeatedly.
#[async_trait]
pub trait AgentLoader: Send + Sync {
    /// Every agent known to the backing store.
    async fn load_agents(&self) -> AgentosResult<Vec<AgentDescriptor>>;

    /// A single agent, or `None` if the store has no such id.
    async fn load_agent(&self, agent_id: &str) -> AgentosResult<Option<AgentDescriptor>> {
        Ok(self
            .load_agents()
            .await?
            .into_iter()
            .find(|a| a.id == agent_id))
    }
}

/// Performs the actual work of an agent (usually an LLM call).
///
/// Errors are surfaced unchanged to the task's caller once retries run out.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_agent(
        &self,
        agent_id: &str,
        input: &Value,
        metadata: &Metadata,
    ) -> AgentosResult<Value>;
}

/// Loader over a fixed, in-memory descriptor list.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentLoader {
    agents: Vec<AgentDescriptor>,
}

impl StaticAgentLoader {
    pub fn new(agents: Vec<AgentDescriptor>) -> Self {
        Self { agents }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentLoader for StaticAgentLoader {
    async fn load_agents(&self) -> AgentosResult<Vec<AgentDescriptor>> {
        Ok(self.agents.clone())
    }
}
