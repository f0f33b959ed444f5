//! In-process task scheduling and agent execution engine.
//!
//! Callers submit tasks that name an agent. Tasks wait in a priority queue,
//! are dispatched under a concurrency cap, are retried on failure, and every
//! step is published on a typed event bus with a bounded replay buffer.
//!
//! # Main types
//!
//! - [`Engine`]: Facade owning configuration, lifecycle, metrics and the public API.
//! - [`TaskQueue`]: Priority queue with concurrency-capped dispatch and bounded retry.
//! - [`AgentManager`]: Agent registry and single-run executor.
//! - [`EventBus`]: Typed publish/subscribe with a ring-buffer event log.
//! - [`AgentLoader`] / [`AgentRunner`]: Contracts the host application implements.

/// Registry of agents and execution of single agent runs.
pub mod agent_manager;
/// Host-provided agent loading and running contracts.
pub mod collab;
/// Engine configuration and shutdown drain policy.
pub mod config;
/// Engine facade and lifecycle.
pub mod engine;
/// Typed event bus with replay buffer.
pub mod event_bus;
/// Priority task queue and dispatcher.
pub mod task_queue;
/// Shared types (Task, Agent, Execution, etc.).
pub mod types;

pub use agent_manager::{AgentManager, AgentManagerStatus};
pub use collab::{AgentLoader, AgentRunner, StaticAgentLoader};
pub use config::{DrainPolicy, EngineConfig};
pub use engine::{BatchOutcome, Engine, EngineMetrics, EngineState, EngineStatus};
pub use event_bus::{
    EngineEvent, EventBus, EventHandler, EventKind, EventKinds, EventRecord, EventStats,
    SubscriptionId, DEFAULT_EVENT_HISTORY, DEFAULT_EVENT_QUERY,
};
pub use task_queue::{CompletionHandle, QueueStatus, TaskQueue, TaskSettlement};
pub use types::{
    Agent, AgentDescriptor, AgentFilter, AgentStatus, Execution, ExecutionStatus, Metadata, Task,
    TaskConfig, TaskStatus, DEFAULT_TASK_TYPE,
};
