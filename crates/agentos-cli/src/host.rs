//! Host-side configuration files and the stand-in agent runner.

use agentos_core::{AgentosError, AgentosResult};
use agentos_orchestrator::{AgentDescriptor, AgentRunner, EngineConfig, Metadata, TaskConfig};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Contents of `agentos.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentosConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

impl AgentosConfig {
    pub fn load(path: &Path) -> AgentosResult<Self> {
        let raw = read(path)?;
        let config: AgentosConfig = toml::from_str(&raw).map_err(|e| {
            AgentosError::Config(format!("Failed to parse '{}': {e}", path.display()))
        })?;
        config.engine.validate()?;
        Ok(config)
    }
}

/// A batch of tasks to submit, as `[[tasks]]` entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl TaskFile {
    pub fn load(path: &Path) -> AgentosResult<Self> {
        let raw = read(path)?;
        toml::from_str(&raw).map_err(|e| {
            AgentosError::Config(format!("Failed to parse '{}': {e}", path.display()))
        })
    }
}

fn read(path: &Path) -> AgentosResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        AgentosError::Config(format!("Failed to read '{}': {e}", path.display()))
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct EchoBehaviour {
    latency: Duration,
    fail: bool,
}

/// Runner that echoes its input back after an optional per-agent delay.
///
/// Descriptors may carry `latency_ms = <n>` and `fail = true`.
#[derive(Debug, Default)]
pub struct EchoRunner {
    behaviour: HashMap<String, EchoBehaviour>,
}

impl EchoRunner {
    pub fn new(agents: &[AgentDescriptor]) -> Self {
        let behaviour = agents
            .iter()
            .map(|a| {
                let latency = a
                    .extra
                    .get("latency_ms")
                    .and_then(Value::as_u64)
                    .map_or(Duration::ZERO, Duration::from_millis);
                let fail = a.extra.get("fail").and_then(Value::as_bool).unwrap_or(false);
                (a.id.clone(), EchoBehaviour { latency, fail })
            })
            .collect();
        Self { behaviour }
    }
}

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run_agent(
        &self,
        agent_id: &str,
        input: &Value,
        metadata: &Metadata,
    ) -> AgentosResult<Value> {
        let behaviour = self.behaviour.get(agent_id).copied().unwrap_or_default();
        debug!(agent_id = %agent_id, latency_ms = behaviour.latency.as_millis() as u64, "Echo run");
        if !behaviour.latency.is_zero() {
            tokio::time::sleep(behaviour.latency).await;
        }
        if behaviour.fail {
            return Err(AgentosError::TaskExecution(format!(
                "agent {agent_id} is configured to fail"
            )));
        }
        Ok(json!({
            "agent": agent_id,
            "echo": input,
            "metadata": metadata,
        }))
    }
}
