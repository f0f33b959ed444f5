use crate::collab::{AgentLoader, AgentRunner};
use crate::config::{DrainPolicy, EngineConfig};
use crate::event_bus::{EngineEvent, EventBus};
use crate::types::{Agent, AgentDescriptor, AgentFilter, AgentStatus, Execution, Metadata};
use agentos_core::{AgentosError, AgentosResult};
use chrono::Utc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Snapshot returned by [`AgentManager::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentManagerStatus {
    pub total_agents: usize,
    pub active_agents: usize,
    pub active_executions: usize,
    pub initialized: bool,
}

/// Registry of agents and executor of single agent runs.
///
/// Lock order is `agents` before `executions`; no method holds `executions`
/// while acquiring `agents`.
pub struct AgentManager {
    agents: RwLock<HashMap<String, Agent>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    initialized: Mutex<bool>,
    loader: Arc<dyn AgentLoader>,
    runner: Arc<dyn AgentRunner>,
    events: Arc<EventBus>,
    task_timeout: Option<Duration>,
    drain: DrainPolicy,
}

impl AgentManager {
    pub fn new(
        loader: Arc<dyn AgentLoader>,
        runner: Arc<dyn AgentRunner>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            initialized: Mutex::new(false),
            loader,
            runner,
            events,
            task_timeout: None,
            drain: EngineConfig::default().agent_drain(),
        }
    }

    /// Abort runner calls that take longer than `timeout`.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    /// Load the initial agent set. A second call is a logged no-op.
    pub async fn initialize(&self) -> AgentosResult<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            warn!("Agent manager already initialized");
            return Ok(());
        }

        info!("Initializing agent manager");
        let descriptors = self.loader.load_agents().await.map_err(|e| {
            error!(error = %e, "Failed to initialize agent manager");
            e
        })?;

        let mut agents = self.agents.write().await;
        for descriptor in descriptors {
            agents
                .entry(descriptor.id.clone())
                .or_insert_with(|| Agent::activate(descriptor));
        }
        *initialized = true;
        info!(count = agents.len(), "Agent manager initialized");
        Ok(())
    }

    /// Look up an agent, falling back to the loader for ids not cached yet.
    pub async fn get_agent(&self, agent_id: &str) -> AgentosResult<Agent> {
        if let Some(agent) = self.agents.read().await.get(agent_id) {
            return Ok(agent.clone());
        }

        let descriptor = match self.loader.load_agent(agent_id).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return Err(AgentosError::AgentNotFound(agent_id.to_string())),
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Agent lookup failed");
                return Err(AgentosError::AgentNotFound(agent_id.to_string()));
            }
        };

        let mut agents = self.agents.write().await;
        let agent = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Agent::activate(descriptor));
        Ok(agent.clone())
    }

    /// Snapshot of the agents matching `filter`, ordered by id.
    pub async fn list_agents(&self, filter: &AgentFilter) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut matching: Vec<Agent> = agents
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id().cmp(b.id()));
        matching
    }

    pub async fn register_agent(&self, descriptor: AgentDescriptor) -> AgentosResult<Agent> {
        if descriptor.id.trim().is_empty()
            || descriptor.name.trim().is_empty()
            || descriptor.role.trim().is_empty()
        {
            return Err(AgentosError::AgentValidation(
                "Agent must have id, name, and role".into(),
            ));
        }

        let agent = {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&descriptor.id) {
                return Err(AgentosError::DuplicateAgent(descriptor.id));
            }
            let agent = Agent::activate(descriptor);
            agents.insert(agent.id().to_string(), agent.clone());
            agent
        };

        info!(agent_id = %agent.id(), name = %agent.descriptor.name, "Agent registered");
        self.events.emit(EngineEvent::AgentRegistered {
            agent: agent.clone(),
        });
        Ok(agent)
    }

    /// Remove an agent. Refused while any execution references it.
    pub async fn unregister_agent(&self, agent_id: &str) -> AgentosResult<Agent> {
        let agent = {
            let mut agents = self.agents.write().await;
            if !agents.contains_key(agent_id) {
                return Err(AgentosError::AgentNotFound(agent_id.to_string()));
            }
            let count = self.active_executions_for(agent_id).await;
            if count > 0 {
                return Err(AgentosError::AgentHasActiveExecutions {
                    agent_id: agent_id.to_string(),
                    count,
                });
            }
            agents
                .remove(agent_id)
                .ok_or_else(|| AgentosError::AgentNotFound(agent_id.to_string()))?
        };

        info!(agent_id = %agent_id, "Agent unregistered");
        self.events.emit(EngineEvent::AgentUnregistered {
            agent: agent.clone(),
        });
        Ok(agent)
    }

    /// Activate or deactivate a registered agent.
    pub async fn set_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> AgentosResult<Agent> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentosError::AgentNotFound(agent_id.to_string()))?;
        agent.status = status;
        info!(agent_id = %agent_id, status = %status, "Agent status changed");
        Ok(agent.clone())
    }

    /// Run one input through one agent and wait for the result.
    pub async fn execute(
        &self,
        agent_id: &str,
        input: &Value,
        metadata: &Metadata,
    ) -> AgentosResult<Value> {
        let snapshot = self.get_agent(agent_id).await?;

        let mut execution = {
            let agents = self.agents.read().await;
            let agent = agents
                .get(agent_id)
                .ok_or_else(|| AgentosError::AgentNotFound(agent_id.to_string()))?;
            if !agent.is_active() {
                return Err(AgentosError::AgentNotActive(agent_id.to_string()));
            }
            let execution = Execution::start(agent_id);
            self.executions
                .write()
                .await
                .insert(execution.id, execution.clone());
            execution
        };

        info!(agent_id = %agent_id, execution_id = %execution.id, "Executing agent");
        let outcome = self.run(agent_id, input, metadata).await;

        match outcome {
            Ok(result) => {
                let agent = {
                    let mut agents = self.agents.write().await;
                    match agents.get_mut(agent_id) {
                        Some(agent) => {
                            agent.execution_count += 1;
                            agent.last_executed_at = Some(Utc::now());
                            agent.clone()
                        }
                        None => snapshot,
                    }
                };
                execution.complete(result.clone());
                self.executions.write().await.remove(&execution.id);

                info!(
                    agent_id = %agent_id,
                    execution_id = %execution.id,
                    duration_ms = execution.duration_ms.unwrap_or_default(),
                    "Agent execution completed"
                );
                self.events
                    .emit(EngineEvent::AgentExecuted { agent, execution });
                Ok(result)
            }
            Err(e) => {
                let agent = self
                    .agents
                    .read()
                    .await
                    .get(agent_id)
                    .cloned()
                    .unwrap_or(snapshot);
                execution.fail(e.to_string());
                self.executions.write().await.remove(&execution.id);

                error!(
                    agent_id = %agent_id,
                    execution_id = %execution.id,
                    error = %e,
                    "Agent execution failed"
                );
                self.events.emit(EngineEvent::AgentExecutionFailed {
                    agent,
                    execution,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        agent_id: &str,
        input: &Value,
        metadata: &Metadata,
    ) -> AgentosResult<Value> {
        let call = AssertUnwindSafe(self.runner.run_agent(agent_id, input, metadata))
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|panic| Err(runner_panicked(&*panic))));
        match self.task_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                AgentosError::TaskTimeout {
                    agent_id: agent_id.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => call.await,
        }
    }

    /// Whether any execution is currently running against the agent.
    pub async fn is_busy(&self, agent_id: &str) -> bool {
        self.active_executions_for(agent_id).await > 0
    }

    async fn active_executions_for(&self, agent_id: &str) -> usize {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| e.agent_id == agent_id)
            .count()
    }

    pub async fn active_execution_count(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn get_status(&self) -> AgentManagerStatus {
        // `initialize` holds this flag while taking the agents lock.
        let initialized = *self.initialized.lock().await;
        let (total_agents, active_agents) = {
            let agents = self.agents.read().await;
            (agents.len(), agents.values().filter(|a| a.is_active()).count())
        };
        AgentManagerStatus {
            total_agents,
            active_agents,
            active_executions: self.active_execution_count().await,
            initialized,
        }
    }

    /// Wait (bounded) for executions to finish, then clear all state.
    pub async fn shutdown(&self) {
        info!("Shutting down agent manager");

        let active = self.active_execution_count().await;
        if active > 0 {
            warn!(count = active, "Waiting for active executions to complete");
            let left = self
                .drain
                .wait(move || async move { self.active_execution_count().await })
                .await;
            if left > 0 {
                warn!(count = left, "Force stopping active executions");
            }
        }

        self.agents.write().await.clear();
        self.executions.write().await.clear();
        *self.initialized.lock().await = false;
        info!("Agent manager shut down");
    }
}

/// Convert a runner panic payload into an execution error.
fn runner_panicked(payload: &(dyn Any + Send)) -> AgentosError {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    AgentosError::TaskExecution(format!("agent runner panicked: {reason}"))
}
