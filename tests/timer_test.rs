use anyhow::Result;
use async_trait::async_trait;
use flowcore::definition::TimerSpec;
use flowcore::definition::builder::DefinitionBuilder;
use flowcore::runtime::engine::Engine;
use flowcore::runtime::instance::{InstanceSnapshot, InstanceStatus};
use flowcore::runtime::now_ms;
use flowcore::runtime::scheduler::{Scheduler, SchedulerConfig};
use flowcore::runtime::token::TokenState;
use flowcore::tasks::{TaskHandler, TaskInput};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Handler that sleeps, then reports the variables it was given.
#[derive(Debug)]
struct SleepTask {
    ms: u64,
}

#[async_trait]
impl TaskHandler for SleepTask {
    fn name(&self) -> &str {
        "sleep"
    }

    fn validate(&self, _properties: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _input: TaskInput) -> Result<HashMap<String, Value>> {
        tokio::time::sleep(Duration::from_millis(self.ms)).await;
        Ok(HashMap::from([("slept".to_string(), json!(true))]))
    }
}

fn setup(sleep_ms: u64) -> Arc<Engine> {
    let (scheduler, events) = Scheduler::new(SchedulerConfig::default());
    scheduler.register_task(Arc::new(SleepTask { ms: sleep_ms }));
    let engine = Arc::new(Engine::new(scheduler.clone()));
    tokio::spawn(scheduler.run());
    let pump = engine.clone();
    tokio::spawn(async move { pump.run_events(events).await });
    engine
}

async fn settle(engine: &Engine, instance_id: Uuid) -> InstanceSnapshot {
    for _ in 0..500 {
        let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
        if snapshot.status != InstanceStatus::Running {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance did not settle in time");
}

#[tokio::test]
async fn test_timer_fires_at_or_after_deadline() {
    let engine = setup(0);
    let model = DefinitionBuilder::new("timed")
        .start("start")
        .timer("pause", TimerSpec::Duration { ms: 200 })
        .script_task("after", "resumed = 1")
        .end("end")
        .connect("start", "pause")
        .connect("pause", "after")
        .connect("after", "end")
        .build();
    engine.register_model(model).expect("register");

    let before = now_ms();
    let instance_id = engine
        .start_instance("timed", HashMap::new())
        .await
        .expect("start");

    // Token parked on the timer while the instance keeps Running.
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Running);
    let parked = snapshot
        .tokens
        .iter()
        .filter(|t| t.node_id == "pause" && t.state == TokenState::Waiting)
        .count();
    assert_eq!(parked, 1);

    let snapshot = settle(&engine, instance_id).await;
    let elapsed = now_ms() - before;
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("resumed"), Some(&json!(1)));
    // Never early; lateness is bounded only by scheduling.
    assert!(elapsed >= 200, "timer fired early, after {elapsed}ms");
}

#[tokio::test]
async fn test_absolute_timer_deadline() {
    let engine = setup(0);
    let model = DefinitionBuilder::new("absolute")
        .start("start")
        .timer("pause", TimerSpec::Until { at_ms: now_ms() + 150 })
        .end("end")
        .connect("start", "pause")
        .connect("pause", "end")
        .build();
    engine.register_model(model).expect("register");

    let before = now_ms();
    let instance_id = engine
        .start_instance("absolute", HashMap::new())
        .await
        .expect("start");
    let snapshot = settle(&engine, instance_id).await;
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert!(now_ms() - before >= 140);
}

#[tokio::test]
async fn test_boundary_timer_interrupts_slow_task() {
    // Task sleeps 5s, boundary fires at 150ms: the interrupt path wins.
    let engine = setup(5_000);
    let model = DefinitionBuilder::new("deadline")
        .start("start")
        .service_task("slow", "sleep")
        .boundary_timer("timeout", "slow", TimerSpec::Duration { ms: 150 })
        .script_task("escalate", "timed_out = 1")
        .end("done")
        .end("escalated")
        .connect("start", "slow")
        .connect("slow", "done")
        .connect("timeout", "escalate")
        .connect("escalate", "escalated")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("deadline", HashMap::new())
        .await
        .expect("start");
    let snapshot = settle(&engine, instance_id).await;
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("timed_out"), Some(&json!(1)));
    // The host task never completed.
    assert_eq!(snapshot.variables.get("slept"), None);
    let host = snapshot
        .tokens
        .iter()
        .find(|t| t.node_id == "slow")
        .expect("host token");
    assert_eq!(host.state, TokenState::Consumed);
}

#[tokio::test]
async fn test_late_completion_after_interrupt_is_ignored() {
    // Task finishes at 300ms but the boundary already fired at 100ms;
    // the stale completion must not mutate the settled instance.
    let engine = setup(300);
    let model = DefinitionBuilder::new("late")
        .start("start")
        .service_task("slow", "sleep")
        .boundary_timer("timeout", "slow", TimerSpec::Duration { ms: 100 })
        .script_task("escalate", "timed_out = 1")
        .end("done")
        .end("escalated")
        .connect("start", "slow")
        .connect("slow", "done")
        .connect("timeout", "escalate")
        .connect("escalate", "escalated")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("late", HashMap::new())
        .await
        .expect("start");
    let snapshot = settle(&engine, instance_id).await;
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("timed_out"), Some(&json!(1)));

    // Give the dispatched task time to finish and its completion event
    // time to reach the pump, then confirm nothing changed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("slept"), None);
}

#[tokio::test]
async fn test_task_completion_cancels_boundary_timer() {
    // Task finishes at 50ms, boundary armed for 200ms: the normal path
    // wins and the interrupt path must never run.
    let engine = setup(50);
    let model = DefinitionBuilder::new("fast-enough")
        .start("start")
        .service_task("quick", "sleep")
        .boundary_timer("timeout", "quick", TimerSpec::Duration { ms: 200 })
        .script_task("escalate", "timed_out = 1")
        .end("done")
        .end("escalated")
        .connect("start", "quick")
        .connect("quick", "done")
        .connect("timeout", "escalate")
        .connect("escalate", "escalated")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("fast-enough", HashMap::new())
        .await
        .expect("start");
    let snapshot = settle(&engine, instance_id).await;
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("slept"), Some(&json!(true)));
    assert_eq!(snapshot.variables.get("timed_out"), None);

    // The cancelled boundary timer must stay silent after its deadline.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.variables.get("timed_out"), None);
}

#[tokio::test]
async fn test_parallel_branch_timers_fire_independently() {
    let engine = setup(0);
    let model = DefinitionBuilder::new("two-timers")
        .start("start")
        .parallel("split")
        .timer("short", TimerSpec::Duration { ms: 50 })
        .timer("long", TimerSpec::Duration { ms: 150 })
        .script_task("after_short", "short_done = 1")
        .script_task("after_long", "long_done = 1")
        .parallel("join")
        .end("end")
        .connect("start", "split")
        .connect("split", "short")
        .connect("split", "long")
        .connect("short", "after_short")
        .connect("long", "after_long")
        .connect("after_short", "join")
        .connect("after_long", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("two-timers", HashMap::new())
        .await
        .expect("start");
    let snapshot = settle(&engine, instance_id).await;
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("short_done"), Some(&json!(1)));
    assert_eq!(snapshot.variables.get("long_done"), Some(&json!(1)));
}
