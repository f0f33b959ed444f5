use crate::agent_manager::AgentManager;
use crate::config::{DrainPolicy, EngineConfig};
use crate::types::{Task, TaskStatus};
use agentos_core::{AgentosError, AgentosResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Final state of a task together with its outcome.
#[derive(Debug)]
pub struct TaskSettlement {
    pub task: Task,
    pub outcome: AgentosResult<Value>,
}

/// Receiving side of a queued task. Resolves once the task reaches a
/// terminal state.
#[derive(Debug)]
pub struct CompletionHandle {
    task_id: Uuid,
    rx: oneshot::Receiver<TaskSettlement>,
}

impl CompletionHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Wait for the settled task. Fails with `TaskAbandoned` if the queue
    /// went away without settling it.
    pub async fn settle(self) -> AgentosResult<TaskSettlement> {
        self.rx
            .await
            .map_err(|_| AgentosError::TaskAbandoned(self.task_id))
    }

    /// Wait for the task's result.
    pub async fn wait(self) -> AgentosResult<Value> {
        self.settle().await?.outcome
    }
}

/// Snapshot returned by [`TaskQueue::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub max_concurrent: usize,
    pub is_running: bool,
}

struct Entry {
    task: Task,
    done: oneshot::Sender<TaskSettlement>,
}

impl Entry {
    fn settle(self, outcome: AgentosResult<Value>) {
        let task_id = self.task.id;
        if self
            .done
            .send(TaskSettlement {
                task: self.task,
                outcome,
            })
            .is_err()
        {
            debug!(task_id = %task_id, "Task settled with no one waiting");
        }
    }
}

/// Ordered by priority descending, then arrival.
type PendingKey = (Reverse<i64>, u64);

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<PendingKey, Entry>,
    processing: HashMap<Uuid, Entry>,
    next_seq: u64,
}

impl QueueState {
    fn push_pending(&mut self, entry: Entry) {
        let key = (Reverse(entry.task.priority), self.next_seq);
        self.next_seq += 1;
        self.pending.insert(key, entry);
    }

    fn pending_key(&self, task_id: Uuid) -> Option<PendingKey> {
        self.pending
            .iter()
            .find(|(_, e)| e.task.id == task_id)
            .map(|(k, _)| *k)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    agents: Arc<AgentManager>,
    wake: Notify,
    running: AtomicBool,
    max_concurrent: usize,
}

/// Priority queue that feeds tasks to the agent manager under a
/// concurrency cap and retries failures.
///
/// Pending tasks are dispatched highest priority first; equal priorities go
/// in arrival order. A failed attempt goes to the back of its priority band.
pub struct TaskQueue {
    shared: Arc<Shared>,
    dispatch_interval: Duration,
    drain: DrainPolicy,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(agents: Arc<AgentManager>, max_concurrent: usize) -> Self {
        let defaults = EngineConfig::default();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                agents,
                wake: Notify::new(),
                running: AtomicBool::new(false),
                max_concurrent: max_concurrent.max(1),
            }),
            dispatch_interval: defaults.dispatch_interval(),
            drain: defaults.queue_drain(),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start dispatching. Calling it on a running queue does nothing.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("Task queue is already running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        let interval = self.dispatch_interval;
        *dispatcher = Some(tokio::spawn(run_dispatcher(shared, interval)));
        info!(
            max_concurrent = self.shared.max_concurrent,
            "Task queue started"
        );
    }

    /// Stop dispatching and wait (bounded) for in-flight tasks.
    ///
    /// Tasks still running when the bound passes are left to finish on
    /// their own. Pending tasks stay queued.
    pub async fn stop(&self) {
        let handle = {
            let mut dispatcher = self.dispatcher.lock().await;
            if !self.shared.running.swap(false, Ordering::SeqCst) {
                warn!("Task queue is not running");
                return;
            }
            dispatcher.take()
        };
        info!("Stopping task queue");
        self.shared.wake.notify_one();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Task dispatcher ended abnormally");
            }
        }

        let processing = self.processing_count().await;
        if processing > 0 {
            info!(count = processing, "Waiting for tasks to complete");
            let left = self
                .drain
                .wait(move || async move { self.processing_count().await })
                .await;
            if left > 0 {
                warn!(count = left, "Task queue stopped with tasks still running");
            }
        }
        info!("Task queue stopped");
    }

    /// Queue a task and return the handle its outcome will arrive on.
    pub async fn enqueue(&self, mut task: Task) -> CompletionHandle {
        let (done, rx) = oneshot::channel();
        let task_id = task.id;
        task.status = TaskStatus::Pending;
        let priority = task.priority;

        let queue_size = {
            let mut state = self.shared.state.lock().await;
            state.push_pending(Entry { task, done });
            state.pending.len()
        };
        debug!(task_id = %task_id, priority, queue_size, "Task added to queue");
        self.shared.wake.notify_one();

        CompletionHandle { task_id, rx }
    }

    /// Look a task up among in-flight tasks, then pending ones.
    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        let state = self.shared.state.lock().await;
        if let Some(entry) = state.processing.get(&task_id) {
            return Some(entry.task.clone());
        }
        state
            .pending
            .values()
            .find(|e| e.task.id == task_id)
            .map(|e| e.task.clone())
    }

    /// Withdraw a pending task. In-flight tasks cannot be cancelled.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let entry = {
            let mut state = self.shared.state.lock().await;
            if state.processing.contains_key(&task_id) {
                warn!(task_id = %task_id, "Cannot cancel task that is already processing");
                return false;
            }
            match state.pending_key(task_id) {
                Some(key) => state.pending.remove(&key),
                None => None,
            }
        };

        match entry {
            Some(mut entry) => {
                entry.task.status = TaskStatus::Cancelled;
                entry.task.completed_at = Some(Utc::now());
                entry.settle(Err(AgentosError::Cancelled(task_id)));
                info!(task_id = %task_id, "Task cancelled");
                true
            }
            None => false,
        }
    }

    /// Reject every pending task. In-flight tasks are not affected.
    pub async fn clear(&self) -> usize {
        let drained = std::mem::take(&mut self.shared.state.lock().await.pending);
        let count = drained.len();
        for mut entry in drained.into_values() {
            let task_id = entry.task.id;
            entry.task.status = TaskStatus::Cancelled;
            entry.task.completed_at = Some(Utc::now());
            entry.settle(Err(AgentosError::QueueCleared(task_id)));
        }
        info!(count, "Task queue cleared");
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    pub async fn processing_count(&self) -> usize {
        self.shared.state.lock().await.processing.len()
    }

    pub async fn get_status(&self) -> QueueStatus {
        let state = self.shared.state.lock().await;
        QueueStatus {
            pending: state.pending.len(),
            processing: state.processing.len(),
            max_concurrent: self.shared.max_concurrent,
            is_running: self.is_running(),
        }
    }
}

/// Dispatch whenever woken, with a periodic tick as a fallback.
async fn run_dispatcher(shared: Arc<Shared>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        dispatch(&shared).await;
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tick.tick() => {}
        }
    }
    debug!("Task dispatcher exited");
}

async fn dispatch(shared: &Arc<Shared>) {
    let mut state = shared.state.lock().await;
    while state.processing.len() < shared.max_concurrent {
        let Some((_, mut entry)) = state.pending.pop_first() else {
            break;
        };
        entry.task.status = TaskStatus::Running;
        entry.task.started_at = Some(Utc::now());
        let task = entry.task.clone();
        state.processing.insert(task.id, entry);

        debug!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            attempt = task.retry_count + 1,
            "Dispatching task"
        );
        tokio::spawn(process_task(Arc::clone(shared), task));
    }
}

async fn process_task(shared: Arc<Shared>, task: Task) {
    let outcome = shared
        .agents
        .execute(&task.agent_id, &task.input, &task.metadata)
        .await;
    finish(&shared, task.id, outcome).await;
}

async fn finish(shared: &Shared, task_id: Uuid, outcome: AgentosResult<Value>) {
    let mut state = shared.state.lock().await;
    let Some(mut entry) = state.processing.remove(&task_id) else {
        warn!(task_id = %task_id, "Finished task was not in processing");
        return;
    };

    match outcome {
        Ok(result) => {
            drop(state);
            entry.task.status = TaskStatus::Completed;
            entry.task.completed_at = Some(Utc::now());
            entry.task.result = Some(result.clone());
            entry.task.error = None;
            info!(task_id = %task_id, "Task completed");
            entry.settle(Ok(result));
            shared.wake.notify_one();
        }
        Err(e) if entry.task.can_retry() => {
            entry.task.retry_count += 1;
            entry.task.status = TaskStatus::Pending;
            entry.task.started_at = None;
            entry.task.error = Some(e.to_string());
            warn!(
                task_id = %task_id,
                retry = entry.task.retry_count,
                max_retries = entry.task.max_retries,
                error = %e,
                execution_failure = e.is_execution_failure(),
                "Task failed, retrying"
            );
            state.push_pending(entry);
            drop(state);
            shared.wake.notify_one();
        }
        Err(e) => {
            drop(state);
            entry.task.status = TaskStatus::Failed;
            entry.task.completed_at = Some(Utc::now());
            entry.task.error = Some(e.to_string());
            error!(
                task_id = %task_id,
                attempts = entry.task.retry_count + 1,
                error = %e,
                "Task failed after retries"
            );
            entry.settle(Err(e));
            shared.wake.notify_one();
        }
    }
}
