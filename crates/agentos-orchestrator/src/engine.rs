use crate::agent_manager::{AgentManager, AgentManagerStatus};
use crate::collab::{AgentLoader, AgentRunner};
use crate::config::EngineConfig;
use crate::event_bus::{EngineEvent, EventBus, EventHandler, EventKinds, SubscriptionId};
use crate::task_queue::{QueueStatus, TaskQueue};
use crate::types::{
    Agent, AgentDescriptor, AgentFilter, AgentStatus, Task, TaskConfig, DEFAULT_TASK_TYPE,
};
use agentos_core::{AgentosError, AgentosResult};
use futures_util::future::join_all;
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Starting => write!(f, "starting"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Counters over every task that went through [`Engine::execute_task`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// Running mean over every settled task, in milliseconds.
    pub average_task_time_ms: f64,
}

impl EngineMetrics {
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        self.tasks_processed += 1;
        if success {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
        let n = self.tasks_processed as f64;
        self.average_task_time_ms =
            (self.average_task_time_ms * (n - 1.0) + duration_ms as f64) / n;
    }
}

/// Aggregate report returned by [`Engine::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub status: EngineState,
    pub metrics: EngineMetrics,
    pub queue: QueueStatus,
    pub agents: AgentManagerStatus,
    /// Seconds since the last successful start, zero when stopped.
    pub uptime_secs: u64,
}

/// Outcomes of [`Engine::execute_batch`], in input order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<AgentosResult<Value>>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Facade over the event bus, agent manager and task queue.
///
/// Construct one per application and share it by reference or `Arc`.
pub struct Engine {
    config: EngineConfig,
    events: Arc<EventBus>,
    agents: Arc<AgentManager>,
    queue: TaskQueue,
    state: SyncRwLock<EngineState>,
    metrics: SyncMutex<EngineMetrics>,
    started_at: SyncMutex<Option<Instant>>,
    lifecycle: Mutex<()>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        loader: Arc<dyn AgentLoader>,
        runner: Arc<dyn AgentRunner>,
    ) -> AgentosResult<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new(config.event_history));
        let agents = Arc::new(
            AgentManager::new(loader, runner, Arc::clone(&events))
                .with_task_timeout(config.task_timeout())
                .with_drain_policy(config.agent_drain()),
        );
        let queue = TaskQueue::new(Arc::clone(&agents), config.max_concurrent_tasks)
            .with_dispatch_interval(config.dispatch_interval())
            .with_drain_policy(config.queue_drain());

        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            retry_attempts = config.retry_attempts,
            task_timeout_ms = config.task_timeout_ms,
            enforce_task_timeout = config.enforce_task_timeout,
            "Engine created"
        );

        Ok(Self {
            config,
            events,
            agents,
            queue,
            state: SyncRwLock::new(EngineState::Stopped),
            metrics: SyncMutex::new(EngineMetrics::default()),
            started_at: SyncMutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The bus the engine publishes on, for event queries and stats.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn metrics(&self) -> EngineMetrics {
        *self.metrics.lock()
    }

    /// Bring the components up: agents, then queue, then bus.
    ///
    /// Does nothing unless the engine is stopped. On failure the engine
    /// returns to `Stopped` and the error is passed back.
    pub async fn start(&self) -> AgentosResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if current != EngineState::Stopped {
            warn!(status = %current, "Engine is not stopped, start ignored");
            return Ok(());
        }

        *self.state.write() = EngineState::Starting;
        info!("Starting engine");

        if let Err(e) = self.agents.initialize().await {
            *self.state.write() = EngineState::Stopped;
            error!(error = %e, "Failed to start engine");
            return Err(e);
        }
        self.queue.start().await;
        self.events.start();

        *self.started_at.lock() = Some(Instant::now());
        *self.state.write() = EngineState::Running;
        self.events.emit(EngineEvent::EngineStarted);
        info!("Engine started");
        Ok(())
    }

    /// Tear the components down: queue, then bus, then agents.
    ///
    /// Does nothing unless the engine is running.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if current != EngineState::Running {
            warn!(status = %current, "Engine is not running, stop ignored");
            return;
        }

        *self.state.write() = EngineState::Stopping;
        info!("Stopping engine");

        self.queue.stop().await;
        self.events.emit(EngineEvent::EngineStopped);
        self.events.stop();
        self.agents.shutdown().await;

        *self.started_at.lock() = None;
        *self.state.write() = EngineState::Stopped;
        info!("Engine stopped");
    }

    /// Queue one task and wait for its final outcome.
    ///
    /// Validation failures are returned before anything is queued and are
    /// not counted in the metrics.
    pub async fn execute_task(&self, config: TaskConfig) -> AgentosResult<Value> {
        let started = Instant::now();
        let task = self.build_task(config)?;
        let task_id = task.id;
        let agent_id = task.agent_id.clone();

        info!(task_id = %task_id, agent_id = %agent_id, priority = task.priority, "Executing task");
        let state = self.state();
        if state != EngineState::Running {
            warn!(
                task_id = %task_id,
                state = %state,
                "Engine is not running, task waits in the queue until start"
            );
        }
        self.events.emit(EngineEvent::TaskCreated { task: task.clone() });

        let settled = self.queue.enqueue(task).await.settle().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match settled {
            Ok(settlement) => match settlement.outcome {
                Ok(result) => {
                    self.metrics.lock().record(true, duration_ms);
                    info!(task_id = %task_id, duration_ms, "Task completed successfully");
                    self.events.emit(EngineEvent::TaskCompleted {
                        task: settlement.task,
                        result: result.clone(),
                        duration_ms,
                    });
                    Ok(result)
                }
                Err(e) => Err(self.record_failure(task_id, agent_id, e, duration_ms)),
            },
            Err(e) => Err(self.record_failure(task_id, agent_id, e, duration_ms)),
        }
    }

    fn record_failure(
        &self,
        task_id: Uuid,
        agent_id: String,
        err: AgentosError,
        duration_ms: u64,
    ) -> AgentosError {
        self.metrics.lock().record(false, duration_ms);
        error!(
            task_id = %task_id,
            agent_id = %agent_id,
            duration_ms,
            error = %err,
            withdrawn = err.is_withdrawal(),
            "Task execution failed"
        );
        self.events.emit(EngineEvent::TaskFailed {
            task_id,
            agent_id,
            error: err.to_string(),
            duration_ms,
        });
        err
    }

    fn build_task(&self, config: TaskConfig) -> AgentosResult<Task> {
        if config.agent_id.trim().is_empty() {
            return Err(AgentosError::TaskValidation("agentId is required".into()));
        }
        let missing_input = match &config.input {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if missing_input {
            return Err(AgentosError::TaskValidation("input is required".into()));
        }

        let mut task = Task::new(config.agent_id, config.input)
            .with_priority(config.priority.unwrap_or(self.config.default_priority))
            .with_max_retries(config.max_retries.unwrap_or(self.config.retry_attempts))
            .with_metadata(config.metadata);
        task.task_type = config
            .task_type
            .unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string());
        Ok(task)
    }

    /// Run every task concurrently and collect all outcomes, successful or not.
    pub async fn execute_batch(&self, tasks: Vec<TaskConfig>) -> BatchOutcome {
        let total = tasks.len();
        info!(count = total, "Executing task batch");

        let results = join_all(tasks.into_iter().map(|t| self.execute_task(t))).await;
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let failed = total - succeeded;

        info!(total, succeeded, failed, "Batch execution completed");
        BatchOutcome {
            results,
            succeeded,
            failed,
        }
    }

    pub async fn get_status(&self) -> EngineStatus {
        let uptime_secs = self
            .started_at
            .lock()
            .map_or(0, |t| t.elapsed().as_secs());
        EngineStatus {
            status: self.state(),
            metrics: self.metrics(),
            queue: self.queue.get_status().await,
            agents: self.agents.get_status().await,
            uptime_secs,
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> AgentosResult<Agent> {
        self.agents.get_agent(agent_id).await
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> Vec<Agent> {
        self.agents.list_agents(filter).await
    }

    pub async fn register_agent(&self, descriptor: AgentDescriptor) -> AgentosResult<Agent> {
        self.agents.register_agent(descriptor).await
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> AgentosResult<Agent> {
        self.agents.unregister_agent(agent_id).await
    }

    pub async fn set_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> AgentosResult<Agent> {
        self.agents.set_agent_status(agent_id, status).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.queue.get_task(task_id).await
    }

    /// Withdraw a task that has not been dispatched yet.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        self.queue.cancel_task(task_id).await
    }

    /// Reject every pending task; returns how many were discarded.
    pub async fn clear_queue(&self) -> usize {
        self.queue.clear().await
    }

    pub fn subscribe(&self, kinds: impl Into<EventKinds>, handler: EventHandler) -> SubscriptionId {
        self.events.subscribe(kinds, handler)
    }

    pub fn unsubscribe(&self, kinds: impl Into<EventKinds>, id: SubscriptionId) -> usize {
        self.events.unsubscribe(kinds, id)
    }
}
