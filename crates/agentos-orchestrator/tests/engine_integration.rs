//! End-to-end scheduling tests through the public `Engine` API.
//!
//! Checks: priority order and arrival tie-break, concurrency cap, retry
//! exhaustion, unregister guard, metrics, cancellation scope and the bounded
//! event history.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use agentos_core::{AgentosError, AgentosResult};
use agentos_orchestrator::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scripted runner: behaviour is driven by the task input
// ---------------------------------------------------------------------------

/// `{"label": .., "hold": true}` parks until released,
/// `{"delay_ms": n}` sleeps, `{"fail": true}` errors, `{"panic": true}` panics.
#[derive(Default)]
struct ScriptedRunner {
    gate: Notify,
    order: Mutex<Vec<Value>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    fn release_one(&self) {
        self.gate.notify_one();
    }

    fn labels(&self) -> Vec<Value> {
        self.order.lock().clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run_agent(
        &self,
        agent_id: &str,
        input: &Value,
        _metadata: &Metadata,
    ) -> AgentosResult<Value> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.order.lock().push(input["label"].clone());

        if input["hold"] == json!(true) {
            self.gate.notified().await;
        }
        if let Some(ms) = input["delay_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if input["panic"] == json!(true) {
            panic!("{agent_id} crashed on {}", input["label"]);
        }
        if input["fail"] == json!(true) {
            return Err(AgentosError::TaskExecution(format!(
                "{agent_id} could not process {}",
                input["label"]
            )));
        }
        Ok(json!({ "agent": agent_id, "label": input["label"] }))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn started_engine(max_concurrent: usize) -> (Arc<Engine>, Arc<ScriptedRunner>) {
    let runner = Arc::new(ScriptedRunner::default());
    let config = EngineConfig {
        max_concurrent_tasks: max_concurrent,
        retry_attempts: 0,
        dispatch_interval_ms: 10,
        drain_poll_interval_ms: 10,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        Arc::new(StaticAgentLoader::new(vec![AgentDescriptor::new(
            "writer", "Writer", "content",
        )])),
        runner.clone(),
    )
    .unwrap();
    engine.start().await.unwrap();
    (Arc::new(engine), runner)
}

fn submit(
    engine: &Arc<Engine>,
    config: TaskConfig,
) -> tokio::task::JoinHandle<AgentosResult<Value>> {
    let engine = Arc::clone(engine);
    tokio::spawn(async move { engine.execute_task(config).await })
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_pending(engine: &Engine, expected: usize) {
    wait_until("pending tasks", move || async move {
        engine.get_status().await.queue.pending == expected
    })
    .await;
}

async fn wait_for_processing(engine: &Engine, expected: usize) {
    wait_until("processing tasks", move || async move {
        engine.get_status().await.queue.processing == expected
    })
    .await;
}

async fn wait_for_executions(engine: &Engine, expected: usize) {
    wait_until("agent executions", move || async move {
        engine.get_status().await.agents.active_executions == expected
    })
    .await;
}

fn created_task_ids(engine: &Engine) -> Vec<Uuid> {
    engine
        .events()
        .get_events_by_type(EventKind::TaskCreated, DEFAULT_EVENT_QUERY)
        .into_iter()
        .filter_map(|r| match r.payload {
            EngineEvent::TaskCreated { task } => Some(task.id),
            _ => None,
        })
        .collect()
}

fn held(label: &str) -> TaskConfig {
    TaskConfig::new("writer", json!({ "label": label, "hold": true }))
}

fn plain(label: &str) -> TaskConfig {
    TaskConfig::new("writer", json!({ "label": label }))
}

// ---------------------------------------------------------------------------
// 1. Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn higher_priority_dispatched_first_once_slot_frees() {
    let (engine, runner) = started_engine(1).await;

    let blocker = submit(&engine, held("blocker"));
    wait_for_processing(&engine, 1).await;

    let mut waiting = Vec::new();
    for (label, priority) in [("p1", 1), ("p5", 5), ("p3", 3)] {
        waiting.push(submit(&engine, plain(label).with_priority(priority)));
        wait_for_pending(&engine, waiting.len()).await;
    }

    runner.release_one();
    blocker.await.unwrap().unwrap();
    for handle in waiting {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        runner.labels(),
        vec![json!("blocker"), json!("p5"), json!("p3"), json!("p1")]
    );
    engine.stop().await;
}

#[tokio::test]
async fn equal_priority_keeps_arrival_order() {
    let (engine, runner) = started_engine(1).await;

    let blocker = submit(&engine, held("blocker"));
    wait_for_processing(&engine, 1).await;

    let a = submit(&engine, plain("A").with_priority(4));
    wait_for_pending(&engine, 1).await;
    let b = submit(&engine, plain("B").with_priority(4));
    wait_for_pending(&engine, 2).await;

    runner.release_one();
    blocker.await.unwrap().unwrap();
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(
        runner.labels(),
        vec![json!("blocker"), json!("A"), json!("B")]
    );
    engine.stop().await;
}

// ---------------------------------------------------------------------------
// 2. Concurrency cap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn processing_never_exceeds_cap() {
    let (engine, runner) = started_engine(3).await;

    let batch = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let tasks = (0..10)
                .map(|n| {
                    TaskConfig::new(
                        "writer",
                        json!({ "label": format!("t{n}"), "delay_ms": 15 }),
                    )
                })
                .collect();
            engine.execute_batch(tasks).await
        })
    };

    let mut max_seen = 0;
    while !batch.is_finished() {
        let processing = engine.get_status().await.queue.processing;
        assert!(processing <= 3, "processing reached {processing}");
        max_seen = max_seen.max(processing);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let outcome = batch.await.unwrap();
    assert_eq!(outcome.succeeded, 10);
    assert!(max_seen <= 3);
    assert!(runner.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(engine.metrics().tasks_processed, 10);
    engine.stop().await;
}

// ---------------------------------------------------------------------------
// 3. Retry exhaustion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_task_attempted_max_retries_plus_one() {
    let (engine, runner) = started_engine(2).await;

    let err = engine
        .execute_task(
            TaskConfig::new("writer", json!({ "label": "doomed", "fail": true }))
                .with_max_retries(2),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AgentosError::TaskExecution(ref msg) if msg.contains("doomed")));
    assert_eq!(runner.attempts.load(Ordering::SeqCst), 3);

    let metrics = engine.metrics();
    assert_eq!(metrics.tasks_processed, 1);
    assert_eq!(metrics.tasks_failed, 1);
    // Each failed attempt is visible on the bus, the task failure only once.
    assert_eq!(
        engine
            .events()
            .get_events_by_type(EventKind::AgentExecutionFailed, 10)
            .len(),
        3
    );
    assert_eq!(
        engine
            .events()
            .get_events_by_type(EventKind::TaskFailed, 10)
            .len(),
        1
    );
    engine.stop().await;
}

#[tokio::test]
async fn panicking_runner_settles_and_frees_slot() {
    let (engine, runner) = started_engine(1).await;

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        engine.execute_task(TaskConfig::new(
            "writer",
            json!({ "label": "boom", "panic": true }),
        )),
    )
    .await
    .expect("panicking task should settle")
    .unwrap_err();
    assert!(matches!(
        err,
        AgentosError::TaskExecution(ref msg) if msg.starts_with("agent runner panicked")
    ));

    let status = engine.get_status().await;
    assert_eq!(status.queue.processing, 0);
    assert_eq!(status.agents.active_executions, 0);
    assert_eq!(engine.metrics().tasks_failed, 1);

    let value = tokio::time::timeout(Duration::from_secs(2), engine.execute_task(plain("after")))
        .await
        .expect("follow-up task should settle")
        .unwrap();
    assert_eq!(value["label"], json!("after"));
    assert_eq!(runner.attempts.load(Ordering::SeqCst), 2);

    engine.unregister_agent("writer").await.unwrap();
    engine.stop().await;
}

// ---------------------------------------------------------------------------
// 4. Unregister guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unregister_refused_until_execution_settles() {
    let (engine, runner) = started_engine(2).await;
    engine
        .register_agent(AgentDescriptor::new("A", "Analyst", "analysis"))
        .await
        .unwrap();

    let running = submit(
        &engine,
        TaskConfig::new("A", json!({ "label": "busy", "hold": true })),
    );
    wait_for_executions(&engine, 1).await;

    let err = engine.unregister_agent("A").await.unwrap_err();
    assert!(matches!(
        err,
        AgentosError::AgentHasActiveExecutions { ref agent_id, count: 1 } if agent_id == "A"
    ));

    runner.release_one();
    running.await.unwrap().unwrap();

    let removed = engine.unregister_agent("A").await.unwrap();
    assert_eq!(removed.execution_count, 1);
    assert!(matches!(
        engine.get_agent("A").await,
        Err(AgentosError::AgentNotFound(_))
    ));
    engine.stop().await;
}

#[tokio::test]
async fn inactive_agent_rejects_tasks() {
    let (engine, runner) = started_engine(1).await;
    engine
        .set_agent_status("writer", AgentStatus::Inactive)
        .await
        .unwrap();

    let err = engine.execute_task(plain("x")).await.unwrap_err();
    assert!(matches!(err, AgentosError::AgentNotActive(_)));
    assert_eq!(runner.attempts.load(Ordering::SeqCst), 0);

    let inactive = engine
        .list_agents(&AgentFilter::default().with_status(AgentStatus::Inactive))
        .await;
    assert_eq!(inactive.len(), 1);
    engine.stop().await;
}

// ---------------------------------------------------------------------------
// 5. Metrics
// ---------------------------------------------------------------------------

#[test]
fn metrics_running_mean_over_settlements() {
    let mut metrics = EngineMetrics::default();
    for duration_ms in [10, 30, 20] {
        metrics.record(true, duration_ms);
    }
    assert_eq!(metrics.tasks_processed, 3);
    assert!((metrics.average_task_time_ms - 20.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn metrics_balance_across_outcomes() {
    let (engine, _runner) = started_engine(4).await;

    let outcome = engine
        .execute_batch(vec![
            plain("ok-1"),
            TaskConfig::new("writer", json!({ "label": "bad", "fail": true })),
            plain("ok-2"),
            TaskConfig::new("nobody", json!({ "label": "lost" })),
        ])
        .await;
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed, 2);
    assert_eq!(
        outcome.results[1].as_ref().unwrap_err().to_string(),
        "Task execution error: writer could not process \"bad\""
    );

    let metrics = engine.metrics();
    assert_eq!(metrics.tasks_processed, 4);
    assert_eq!(
        metrics.tasks_processed,
        metrics.tasks_succeeded + metrics.tasks_failed
    );
    assert!(metrics.average_task_time_ms >= 0.0);
    assert_eq!(engine.get_agent("writer").await.unwrap().execution_count, 2);
    engine.stop().await;
}

// ---------------------------------------------------------------------------
// 6. Cancellation scope
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_only_reaches_pending_tasks() {
    let (engine, runner) = started_engine(1).await;

    let running = submit(&engine, held("running"));
    wait_for_processing(&engine, 1).await;
    let queued = submit(&engine, plain("queued"));
    wait_for_pending(&engine, 1).await;

    let ids = created_task_ids(&engine);
    assert_eq!(ids.len(), 2);
    let (running_id, queued_id) = (ids[0], ids[1]);

    assert_eq!(
        engine.get_task(queued_id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert!(engine.cancel_task(queued_id).await);
    assert!(matches!(
        queued.await.unwrap(),
        Err(AgentosError::Cancelled(id)) if id == queued_id
    ));

    assert!(!engine.cancel_task(running_id).await);
    runner.release_one();
    let result = running.await.unwrap().unwrap();
    assert_eq!(result["label"], "running");
    assert_eq!(runner.labels(), vec![json!("running")]);
    engine.stop().await;
}

#[tokio::test]
async fn clear_queue_rejects_waiting_tasks() {
    let (engine, runner) = started_engine(1).await;

    let running = submit(&engine, held("running"));
    wait_for_processing(&engine, 1).await;
    let first = submit(&engine, plain("a"));
    let second = submit(&engine, plain("b"));
    wait_for_pending(&engine, 2).await;

    assert_eq!(engine.clear_queue().await, 2);
    assert!(matches!(first.await.unwrap(), Err(AgentosError::QueueCleared(_))));
    assert!(matches!(second.await.unwrap(), Err(AgentosError::QueueCleared(_))));

    runner.release_one();
    running.await.unwrap().unwrap();
    assert_eq!(engine.metrics().tasks_failed, 2);
    engine.stop().await;
}

// ---------------------------------------------------------------------------
// 7. Event history and subscriptions
// ---------------------------------------------------------------------------

#[test]
fn bounded_history_keeps_latest_thousand() {
    let bus = EventBus::new(1000);
    bus.start();
    let ids: Vec<Uuid> = (0..1500)
        .map(|n| {
            let task = Task::new("writer", json!(n));
            let id = task.id;
            bus.emit(EngineEvent::TaskCreated { task });
            id
        })
        .collect();

    let recent = bus.get_recent_events(1000);
    assert_eq!(recent.len(), 1000);
    let kept: Vec<Uuid> = recent
        .into_iter()
        .filter_map(|r| match r.payload {
            EngineEvent::TaskCreated { task } => Some(task.id),
            _ => None,
        })
        .collect();
    assert_eq!(kept, ids[500..].to_vec());
}

#[tokio::test]
async fn subscribers_see_task_lifecycle() {
    let (engine, _runner) = started_engine(2).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = engine.subscribe(
        [
            EventKind::TaskCreated,
            EventKind::AgentExecuted,
            EventKind::TaskCompleted,
        ],
        Arc::new(move |r: &EventRecord| sink.lock().push(r.name)),
    );

    engine.execute_task(plain("observed")).await.unwrap();
    assert_eq!(
        *seen.lock(),
        vec![
            EventKind::TaskCreated,
            EventKind::AgentExecuted,
            EventKind::TaskCompleted
        ]
    );

    assert_eq!(
        engine.unsubscribe(
            [
                EventKind::TaskCreated,
                EventKind::AgentExecuted,
                EventKind::TaskCompleted,
            ],
            id,
        ),
        3
    );
    engine.execute_task(plain("unobserved")).await.unwrap();
    assert_eq!(seen.lock().len(), 3);

    let stats = engine.events().get_stats();
    assert_eq!(stats.event_counts[&EventKind::TaskCompleted], 2);
    engine.stop().await;
}

// ---------------------------------------------------------------------------
// 8. Task timeout (opt-in)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enforced_timeout_fails_and_retries_slow_runs() {
    let runner = Arc::new(ScriptedRunner::default());
    let engine = Engine::new(
        EngineConfig {
            enforce_task_timeout: true,
            task_timeout_ms: 20,
            retry_attempts: 1,
            dispatch_interval_ms: 10,
            ..EngineConfig::default()
        },
        Arc::new(StaticAgentLoader::new(vec![AgentDescriptor::new(
            "writer", "Writer", "content",
        )])),
        runner.clone(),
    )
    .unwrap();
    engine.start().await.unwrap();

    let err = engine
        .execute_task(TaskConfig::new(
            "writer",
            json!({ "label": "slow", "delay_ms": 500 }),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentosError::TaskTimeout { timeout_ms: 20, .. }));
    assert_eq!(runner.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(engine.get_status().await.agents.active_executions, 0);
    engine.stop().await;
}
