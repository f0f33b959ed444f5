use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Free-form key/value metadata handed to the agent runner with a task.
pub type Metadata = serde_json::Map<String, Value>;

/// Activation status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Static description of an agent as supplied by the loader or a registration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
    /// Any other descriptor fields the host application carries along.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            model_provider: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_model_provider(mut self, provider: impl Into<String>) -> Self {
        self.model_provider = Some(provider.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A registered agent together with its lifecycle state and usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    pub status: AgentStatus,
    pub execution_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Wrap a descriptor as a freshly registered, active agent.
    pub fn activate(descriptor: AgentDescriptor) -> Self {
        Self {
            descriptor,
            status: AgentStatus::Active,
            execution_count: 0,
            last_executed_at: None,
            registered_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Filter applied by `list_agents`. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model_provider: Option<String>,
}

impl AgentFilter {
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_model_provider(mut self, provider: impl Into<String>) -> Self {
        self.model_provider = Some(provider.into());
        self
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.status.map_or(true, |s| agent.status == s)
            && self
                .role
                .as_ref()
                .map_or(true, |r| &agent.descriptor.role == r)
            && self
                .model_provider
                .as_ref()
                .map_or(true, |p| agent.descriptor.model_provider.as_ref() == Some(p))
    }
}

/// Status of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// Transient record of one in-progress (or just finished) agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    pub fn start(agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
        }
    }

    fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    pub fn complete(&mut self, result: Value) {
        self.finish(ExecutionStatus::Completed);
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(ExecutionStatus::Failed);
        self.error = Some(error.into());
    }
}

/// Status of a task in the execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of work asking one agent to process one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    /// Higher is more urgent.
    pub priority: i64,
    pub input: Value,
    pub metadata: Metadata,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(agent_id: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            task_type: DEFAULT_TASK_TYPE.to_string(),
            priority: 5,
            input,
            metadata: Metadata::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            result: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Task type used when the caller does not name one.
pub const DEFAULT_TASK_TYPE: &str = "execute";

/// Caller-side request for `Engine::execute_task`.
///
/// Unset optional fields fall back to the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskConfig {
    pub fn new(agent_id: impl Into<String>, input: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            input,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
