use flowcore::definition::TimerSpec;
use flowcore::definition::builder::DefinitionBuilder;
use flowcore::runtime::engine::Engine;
use flowcore::runtime::instance::{InstanceSnapshot, InstanceStatus};
use flowcore::runtime::scheduler::{Scheduler, SchedulerConfig};
use flowcore::runtime::token::TokenState;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn setup() -> Arc<Engine> {
    let (scheduler, events) = Scheduler::new(SchedulerConfig::default());
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
async fn test_fork_join_merges_branch_variables() {
    let engine = setup();
    let model = DefinitionBuilder::new("fork-join")
        .start("start")
        .parallel("split")
        .script_task("branch_a", "x = 1")
        .script_task("branch_b", "y = 2")
        .parallel("join")
        .end("end")
        .connect("start", "split")
        .connect("split", "branch_a")
        .connect("split", "branch_b")
        .connect("branch_a", "join")
        .connect("branch_b", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("fork-join", HashMap::new())
        .await
        .expect("start");
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.active_token_count(), 0);
    // Both branch-local writes merged into the parent scope at the join.
    assert_eq!(snapshot.variables.get("x"), Some(&json!(1)));
    assert_eq!(snapshot.variables.get("y"), Some(&json!(2)));
}

#[tokio::test]
async fn test_join_waits_for_all_siblings() {
    let engine = setup();
    // branch_b parks on a timer, so the join holds branch_a's token.
    let model = DefinitionBuilder::new("join-waits")
        .start("start")
        .parallel("split")
        .task("branch_a")
        .timer("branch_b", TimerSpec::Duration { ms: 300 })
        .parallel("join")
        .end("end")
        .connect("start", "split")
        .connect("split", "branch_a")
        .connect("split", "branch_b")
        .connect("branch_a", "join")
        .connect("branch_b", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("join-waits", HashMap::new())
        .await
        .expect("start");

    // Mid-flight: one token held at the join, one parked on the timer.
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Running);
    assert_eq!(snapshot.active_token_count(), 0);
    let at_join = snapshot
        .tokens
        .iter()
        .filter(|t| t.node_id == "join" && t.state == TokenState::Waiting)
        .count();
    assert_eq!(at_join, 1);

    let snapshot = settle(&engine, instance_id).await;
    assert_eq!(snapshot.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_join_conflict_resolves_by_arrival_order() {
    let engine = setup();
    // Both branches write `winner`. branch_a arrives at the join first,
    // branch_b merges after it, so branch_b's value survives.
    let model = DefinitionBuilder::new("merge-order")
        .start("start")
        .parallel("split")
        .script_task("branch_a", "winner = \"a\"")
        .script_task("branch_b", "winner = \"b\"")
        .parallel("join")
        .end("end")
        .connect("start", "split")
        .connect("split", "branch_a")
        .connect("split", "branch_b")
        .connect("branch_a", "join")
        .connect("branch_b", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("merge-order", HashMap::new())
        .await
        .expect("start");
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("winner"), Some(&json!("b")));
}

#[tokio::test]
async fn test_branch_writes_stay_isolated_until_join() {
    let engine = setup();
    // branch_a writes then re-reads its own value; branch_b shadows the
    // same name. Neither sees the other before the join merges.
    let model = DefinitionBuilder::new("isolation")
        .var("tag", "root")
        .start("start")
        .parallel("split")
        .script_task("write_a", "tag = \"a\"; saw_a = tag")
        .script_task("write_b", "tag = \"b\"; saw_b = tag")
        .parallel("join")
        .end("end")
        .connect("start", "split")
        .connect("split", "write_a")
        .connect("split", "write_b")
        .connect("write_a", "join")
        .connect("write_b", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("isolation", HashMap::new())
        .await
        .expect("start");
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    // Each branch saw only its own shadow of `tag`.
    assert_eq!(snapshot.variables.get("saw_a"), Some(&json!("a")));
    assert_eq!(snapshot.variables.get("saw_b"), Some(&json!("b")));
}

#[tokio::test]
async fn test_nested_fork_join() {
    let engine = setup();
    let model = DefinitionBuilder::new("nested")
        .start("start")
        .parallel("outer_split")
        .script_task("left", "left_done = 1")
        .parallel("inner_split")
        .script_task("inner_a", "a_done = 1")
        .script_task("inner_b", "b_done = 1")
        .parallel("inner_join")
        .parallel("outer_join")
        .end("end")
        .connect("start", "outer_split")
        .connect("outer_split", "left")
        .connect("outer_split", "inner_split")
        .connect("inner_split", "inner_a")
        .connect("inner_split", "inner_b")
        .connect("inner_a", "inner_join")
        .connect("inner_b", "inner_join")
        .connect("left", "outer_join")
        .connect("inner_join", "outer_join")
        .connect("outer_join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("nested", HashMap::new())
        .await
        .expect("start");
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.active_token_count(), 0);
    assert_eq!(snapshot.variables.get("left_done"), Some(&json!(1)));
    assert_eq!(snapshot.variables.get("a_done"), Some(&json!(1)));
    assert_eq!(snapshot.variables.get("b_done"), Some(&json!(1)));
}

#[tokio::test]
async fn test_inclusive_gateway_takes_all_truthy_branches() {
    let engine = setup();
    let model = DefinitionBuilder::new("inclusive")
        .var("x", 10)
        .start("start")
        .inclusive("split")
        .script_task("low", "took_low = 1")
        .script_task("high", "took_high = 1")
        .script_task("fallback", "took_fallback = 1")
        .inclusive("join")
        .end("end")
        .connect("start", "split")
        .connect_if("split", "low", "x > 5")
        .connect_if("split", "high", "x > 100")
        .connect("split", "fallback")
        .connect("low", "join")
        .connect("high", "join")
        .connect("fallback", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("inclusive", HashMap::new())
        .await
        .expect("start");
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    // Only x > 5 held; the default is skipped when any condition holds.
    assert_eq!(snapshot.variables.get("took_low"), Some(&json!(1)));
    assert_eq!(snapshot.variables.get("took_high"), None);
    assert_eq!(snapshot.variables.get("took_fallback"), None);
}

#[tokio::test]
async fn test_inclusive_gateway_default_when_no_condition_holds() {
    let engine = setup();
    let model = DefinitionBuilder::new("inclusive-default")
        .var("x", 1)
        .start("start")
        .inclusive("split")
        .script_task("low", "took_low = 1")
        .script_task("fallback", "took_fallback = 1")
        .inclusive("join")
        .end("end")
        .connect("start", "split")
        .connect_if("split", "low", "x > 5")
        .connect("split", "fallback")
        .connect("low", "join")
        .connect("fallback", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("inclusive-default", HashMap::new())
        .await
        .expect("start");
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("took_fallback"), Some(&json!(1)));
    assert_eq!(snapshot.variables.get("took_low"), None);
}

#[tokio::test]
async fn test_inclusive_gateway_multiple_truthy_branches_join() {
    let engine = setup();
    let model = DefinitionBuilder::new("inclusive-multi")
        .var("x", 10)
        .start("start")
        .inclusive("split")
        .script_task("a", "took_a = 1")
        .script_task("b", "took_b = 1")
        .inclusive("join")
        .end("end")
        .connect("start", "split")
        .connect_if("split", "a", "x > 1")
        .connect_if("split", "b", "x > 2")
        .connect("a", "join")
        .connect("b", "join")
        .connect("join", "end")
        .build();
    engine.register_model(model).expect("register");

    let instance_id = engine
        .start_instance("inclusive-multi", HashMap::new())
        .await
        .expect("start");
    let snapshot = engine.snapshot(instance_id).await.expect("snapshot");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.variables.get("took_a"), Some(&json!(1)));
    assert_eq!(snapshot.variables.get("took_b"), Some(&json!(1)));
}
