use crate::types::{Agent, Execution, Task};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Replay buffer capacity used when none is configured.
pub const DEFAULT_EVENT_HISTORY: usize = 1000;

/// Default number of records returned by the event log queries.
pub const DEFAULT_EVENT_QUERY: usize = 100;

/// Names of the events the engine publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "agent.registered")]
    AgentRegistered,
    #[serde(rename = "agent.unregistered")]
    AgentUnregistered,
    #[serde(rename = "agent.executed")]
    AgentExecuted,
    #[serde(rename = "agent.executionFailed")]
    AgentExecutionFailed,
    #[serde(rename = "engine.started")]
    EngineStarted,
    #[serde(rename = "engine.stopped")]
    EngineStopped,
}

impl EventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [EventKind; 9] = [
        EventKind::TaskCreated,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::AgentRegistered,
        EventKind::AgentUnregistered,
        EventKind::AgentExecuted,
        EventKind::AgentExecutionFailed,
        EventKind::EngineStarted,
        EventKind::EngineStopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task.created",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::AgentRegistered => "agent.registered",
            EventKind::AgentUnregistered => "agent.unregistered",
            EventKind::AgentExecuted => "agent.executed",
            EventKind::AgentExecutionFailed => "agent.executionFailed",
            EventKind::EngineStarted => "engine.started",
            EventKind::EngineStopped => "engine.stopped",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown event name '{s}'"))
    }
}

/// An event published on the bus, with its typed payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    TaskCreated {
        task: Task,
    },
    TaskCompleted {
        task: Task,
        result: Value,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Uuid,
        agent_id: String,
        error: String,
        duration_ms: u64,
    },
    AgentRegistered {
        agent: Agent,
    },
    AgentUnregistered {
        agent: Agent,
    },
    AgentExecuted {
        agent: Agent,
        execution: Execution,
    },
    AgentExecutionFailed {
        agent: Agent,
        execution: Execution,
        error: String,
    },
    EngineStarted,
    EngineStopped,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::TaskCreated { .. } => EventKind::TaskCreated,
            EngineEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            EngineEvent::TaskFailed { .. } => EventKind::TaskFailed,
            EngineEvent::AgentRegistered { .. } => EventKind::AgentRegistered,
            EngineEvent::AgentUnregistered { .. } => EventKind::AgentUnregistered,
            EngineEvent::AgentExecuted { .. } => EventKind::AgentExecuted,
            EngineEvent::AgentExecutionFailed { .. } => EventKind::AgentExecutionFailed,
            EngineEvent::EngineStarted => EventKind::EngineStarted,
            EngineEvent::EngineStopped => EventKind::EngineStopped,
        }
    }
}

/// One entry of the replay buffer.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub name: EventKind,
    pub payload: EngineEvent,
    pub timestamp: DateTime<Utc>,
}

/// Callback invoked synchronously for every matching event.
pub type EventHandler = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One or more event kinds to (un)subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKinds(Vec<EventKind>);

impl From<EventKind> for EventKinds {
    fn from(kind: EventKind) -> Self {
        Self(vec![kind])
    }
}

impl From<Vec<EventKind>> for EventKinds {
    fn from(kinds: Vec<EventKind>) -> Self {
        Self(kinds)
    }
}

impl From<&[EventKind]> for EventKinds {
    fn from(kinds: &[EventKind]) -> Self {
        Self(kinds.to_vec())
    }
}

impl<const N: usize> From<[EventKind; N]> for EventKinds {
    fn from(kinds: [EventKind; N]) -> Self {
        Self(kinds.to_vec())
    }
}

/// Aggregate view over the replay buffer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total_events: usize,
    pub event_counts: BTreeMap<EventKind, usize>,
    pub oldest_event: Option<DateTime<Utc>>,
    pub newest_event: Option<DateTime<Utc>>,
}

struct BusState {
    running: bool,
    log: VecDeque<EventRecord>,
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
    next_id: u64,
}

/// Publish/subscribe channel with a bounded replay buffer.
///
/// Handlers run on the emitting task, in subscription order. A panicking
/// handler is logged and skipped; the remaining handlers still run.
pub struct EventBus {
    capacity: usize,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BusState {
                running: false,
                log: VecDeque::with_capacity(capacity),
                subscribers: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Open the bus and install the built-in logging subscribers.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.running {
                warn!("Event bus is already running");
                return;
            }
            state.running = true;
        }
        info!(capacity = self.capacity, "Event bus started");
        self.subscribe(EventKind::ALL, Arc::new(log_core_event));
    }

    /// Close the bus, dropping every subscription and the replay buffer.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            warn!("Event bus is not running");
            return;
        }
        state.running = false;
        state.subscribers.clear();
        state.log.clear();
        info!("Event bus stopped");
    }

    /// Record the event and deliver it to its subscribers.
    ///
    /// Returns `false` without doing anything while the bus is stopped.
    pub fn emit(&self, event: EngineEvent) -> bool {
        let kind = event.kind();
        let (record, handlers) = {
            let mut state = self.state.lock();
            if !state.running {
                warn!(event = %kind, "Event bus is not running, event not emitted");
                return false;
            }
            let record = EventRecord {
                name: kind,
                payload: event,
                timestamp: Utc::now(),
            };
            if state.log.len() >= self.capacity {
                state.log.pop_front();
            }
            state.log.push_back(record.clone());
            let handlers: Vec<EventHandler> = state
                .subscribers
                .get(&kind)
                .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            (record, handlers)
        };

        debug!(event = %kind, subscribers = handlers.len(), "Event emitted");

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&record))).is_err() {
                error!(event = %kind, "Event subscriber panicked");
            }
        }
        true
    }

    /// Register `handler` for one or more event kinds.
    pub fn subscribe(&self, kinds: impl Into<EventKinds>, handler: EventHandler) -> SubscriptionId {
        let mut state = self.state.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        for kind in kinds.into().0 {
            state
                .subscribers
                .entry(kind)
                .or_default()
                .push((id, Arc::clone(&handler)));
        }
        id
    }

    /// Remove a subscription from the given kinds. Returns how many
    /// registrations were removed.
    pub fn unsubscribe(&self, kinds: impl Into<EventKinds>, id: SubscriptionId) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        for kind in kinds.into().0 {
            if let Some(subs) = state.subscribers.get_mut(&kind) {
                let before = subs.len();
                subs.retain(|(sub, _)| *sub != id);
                removed += before - subs.len();
            }
        }
        removed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.state
            .lock()
            .subscribers
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// The `count` most recent records, oldest first.
    pub fn get_recent_events(&self, count: usize) -> Vec<EventRecord> {
        let state = self.state.lock();
        let skip = state.log.len().saturating_sub(count);
        state.log.iter().skip(skip).cloned().collect()
    }

    /// The `count` most recent records of one kind, oldest first.
    pub fn get_events_by_type(&self, kind: EventKind, count: usize) -> Vec<EventRecord> {
        let state = self.state.lock();
        let matching: Vec<&EventRecord> = state.log.iter().filter(|r| r.name == kind).collect();
        let skip = matching.len().saturating_sub(count);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        let count = state.log.len();
        state.log.clear();
        info!(count, "Event log cleared");
    }

    pub fn get_stats(&self) -> EventStats {
        let state = self.state.lock();
        let mut event_counts = BTreeMap::new();
        for record in &state.log {
            *event_counts.entry(record.name).or_insert(0) += 1;
        }
        EventStats {
            total_events: state.log.len(),
            event_counts,
            oldest_event: state.log.front().map(|r| r.timestamp),
            newest_event: state.log.back().map(|r| r.timestamp),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_HISTORY)
    }
}

fn log_core_event(record: &EventRecord) {
    match &record.payload {
        EngineEvent::TaskCreated { task } => {
            debug!(task_id = %task.id, "Task created event");
        }
        EngineEvent::TaskCompleted {
            task, duration_ms, ..
        } => {
            debug!(task_id = %task.id, duration_ms, "Task completed event");
        }
        EngineEvent::TaskFailed { task_id, error, .. } => {
            error!(task_id = %task_id, error = %error, "Task failed event");
        }
        EngineEvent::AgentRegistered { agent } => {
            info!(agent_id = %agent.id(), name = %agent.descriptor.name, "Agent registered event");
        }
        EngineEvent::AgentUnregistered { agent } => {
            info!(agent_id = %agent.id(), "Agent unregistered event");
        }
        EngineEvent::AgentExecuted { agent, execution } => {
            debug!(
                agent_id = %agent.id(),
                duration_ms = execution.duration_ms.unwrap_or_default(),
                "Agent executed event"
            );
        }
        EngineEvent::AgentExecutionFailed { agent, error, .. } => {
            error!(agent_id = %agent.id(), error = %error, "Agent execution failed event");
        }
        EngineEvent::EngineStarted => info!("Engine started event"),
        EngineEvent::EngineStopped => info!("Engine stopped event"),
    }
}
