use agentos_core::{AgentosError, AgentosResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the engine and the components it composes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Per-task wall-clock budget. Only enforced when `enforce_task_timeout` is set.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default)]
    pub enforce_task_timeout: bool,
    /// Retries granted to a task that does not set its own `max_retries`.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_priority")]
    pub default_priority: i64,
    /// Capacity of the event bus replay buffer.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_queue_drain_timeout_ms")]
    pub queue_drain_timeout_ms: u64,
    #[serde(default = "default_agent_drain_timeout_ms")]
    pub agent_drain_timeout_ms: u64,
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
}

fn default_max_concurrent_tasks() -> usize {
    10
}
fn default_task_timeout_ms() -> u64 {
    300_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_priority() -> i64 {
    5
}
fn default_event_history() -> usize {
    1000
}
fn default_dispatch_interval_ms() -> u64 {
    100
}
fn default_queue_drain_timeout_ms() -> u64 {
    60_000
}
fn default_agent_drain_timeout_ms() -> u64 {
    30_000
}
fn default_drain_poll_interval_ms() -> u64 {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_ms: default_task_timeout_ms(),
            enforce_task_timeout: false,
            retry_attempts: default_retry_attempts(),
            default_priority: default_priority(),
            event_history: default_event_history(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            queue_drain_timeout_ms: default_queue_drain_timeout_ms(),
            agent_drain_timeout_ms: default_agent_drain_timeout_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> AgentosResult<Self> {
        let config: EngineConfig = toml::from_str(raw)
            .map_err(|e| AgentosError::Config(format!("Failed to parse engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> AgentosResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentosError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> AgentosResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(AgentosError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.event_history == 0 {
            return Err(AgentosError::Config(
                "event_history must be at least 1".into(),
            ));
        }
        if self.dispatch_interval_ms == 0 {
            return Err(AgentosError::Config(
                "dispatch_interval_ms must be greater than zero".into(),
            ));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(AgentosError::Config(
                "drain_poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.enforce_task_timeout
            .then(|| Duration::from_millis(self.task_timeout_ms))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn queue_drain(&self) -> DrainPolicy {
        DrainPolicy {
            timeout: Duration::from_millis(self.queue_drain_timeout_ms),
            poll_interval: Duration::from_millis(self.drain_poll_interval_ms),
        }
    }

    pub fn agent_drain(&self) -> DrainPolicy {
        DrainPolicy {
            timeout: Duration::from_millis(self.agent_drain_timeout_ms),
            poll_interval: Duration::from_millis(self.drain_poll_interval_ms),
        }
    }
}

/// Bounded wait used while shutting a component down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl DrainPolicy {
    /// Poll `pending` until it reports zero or the timeout elapses.
    ///
    /// Returns the count still outstanding when the wait ended.
    pub async fn wait<F, Fut>(&self, mut pending: F) -> usize
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = usize>,
    {
        let start = tokio::time::Instant::now();
        loop {
            let outstanding = pending().await;
            if outstanding == 0 || start.elapsed() >= self.timeout {
                return outstanding;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
