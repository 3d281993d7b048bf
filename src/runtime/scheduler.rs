use crate::runtime::now_ms;
use crate::tasks::{TaskHandler, TaskInput};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Timer,
    ServiceTask,
}

/// A unit of scheduled async work tracked by the scheduler. The job
/// table is shared across all instances; entries are removed when the
/// job fires/completes or is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub token_id: Uuid,
    pub kind: JobKind,
    pub due_at_ms: Option<i64>,
    pub dispatched_at_ms: Option<i64>,
    pub task: Option<String>,
    pub attempts: u32,
}

/// Completions flowing back into the token engine. Emission order is
/// preserved per instance by the single engine-side event pump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    TimerFired {
        instance_id: Uuid,
        token_id: Uuid,
        job_id: Uuid,
    },
    TaskCompleted {
        instance_id: Uuid,
        token_id: Uuid,
        job_id: Uuid,
        result: HashMap<String, Value>,
    },
    TaskFailed {
        instance_id: Uuid,
        token_id: Uuid,
        job_id: Uuid,
        message: String,
    },
}

impl SchedulerEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            SchedulerEvent::TimerFired { instance_id, .. }
            | SchedulerEvent::TaskCompleted { instance_id, .. }
            | SchedulerEvent::TaskFailed { instance_id, .. } => *instance_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Retries after the first failed service-task attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Per-attempt execution timeout; expiry counts as a failure.
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 100,
            task_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    due_at_ms: i64,
    job_id: Uuid,
    instance_id: Uuid,
    token_id: Uuid,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at_ms
            .cmp(&other.due_at_ms)
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Timer and async-task scheduler. Timers live in a min-heap swept by
/// `run`; service tasks are dispatched onto spawned tokio tasks with a
/// timeout and exponential-backoff retries. All outcomes re-enter the
/// engine as `SchedulerEvent`s on the mpsc channel handed out by `new`.
pub struct Scheduler {
    jobs: DashMap<Uuid, ScheduledJob>,
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    timer_wake: Notify,
    event_tx: mpsc::Sender<SchedulerEvent>,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> (Arc<Self>, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let scheduler = Arc::new(Self {
            jobs: DashMap::new(),
            timers: Mutex::new(BinaryHeap::new()),
            timer_wake: Notify::new(),
            event_tx: tx,
            handlers: DashMap::new(),
            config,
        });
        (scheduler, rx)
    }

    pub fn register_task(&self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    pub fn job(&self, job_id: Uuid) -> Option<ScheduledJob> {
        self.jobs.get(&job_id).map(|j| j.value().clone())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Durable timer entry; fires at-or-after `due_at_ms`, never before.
    pub fn schedule_timer(&self, instance_id: Uuid, token_id: Uuid, due_at_ms: i64) -> Uuid {
        let job_id = Uuid::new_v4();
        self.jobs.insert(
            job_id,
            ScheduledJob {
                id: job_id,
                instance_id,
                token_id,
                kind: JobKind::Timer,
                due_at_ms: Some(due_at_ms),
                dispatched_at_ms: None,
                task: None,
                attempts: 0,
            },
        );
        self.timers
            .lock()
            .expect("timer heap poisoned")
            .push(Reverse(TimerEntry {
                due_at_ms,
                job_id,
                instance_id,
                token_id,
            }));
        self.timer_wake.notify_one();
        debug!(%instance_id, %token_id, %job_id, due_at_ms, "timer scheduled");
        job_id
    }

    /// Invoke the named task implementation asynchronously. Failures are
    /// retried with exponential backoff up to the configured limit, then
    /// surface as `TaskFailed`.
    pub fn dispatch_task(self: &Arc<Self>, task: String, input: TaskInput) -> Uuid {
        let job_id = Uuid::new_v4();
        self.jobs.insert(
            job_id,
            ScheduledJob {
                id: job_id,
                instance_id: input.instance_id,
                token_id: input.token_id,
                kind: JobKind::ServiceTask,
                due_at_ms: None,
                dispatched_at_ms: Some(now_ms()),
                task: Some(task.clone()),
                attempts: 0,
            },
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_task_attempts(job_id, task, input).await;
        });
        job_id
    }

    async fn run_task_attempts(&self, job_id: Uuid, task: String, input: TaskInput) {
        let instance_id = input.instance_id;
        let token_id = input.token_id;
        let mut attempt: u32 = 0;

        loop {
            // Cancelled (instance terminated or boundary interrupt won).
            if !self.jobs.contains_key(&job_id) {
                debug!(%instance_id, %job_id, "task job cancelled before attempt");
                return;
            }
            attempt += 1;
            if let Some(mut job) = self.jobs.get_mut(&job_id) {
                job.attempts = attempt;
            }

            let outcome = match self.handler(&task) {
                None => Err(format!("no task handler registered: {task}")),
                Some(handler) => {
                    match timeout(self.config.task_timeout, handler.execute(input.clone())).await {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!(
                            "task '{task}' timed out after {:?}",
                            self.config.task_timeout
                        )),
                    }
                }
            };

            match outcome {
                Ok(result) => {
                    if self.jobs.remove(&job_id).is_none() {
                        // Cancelled mid-flight; drop the late completion.
                        debug!(%instance_id, %job_id, "dropping completion of cancelled job");
                        return;
                    }
                    let _ = self
                        .event_tx
                        .send(SchedulerEvent::TaskCompleted {
                            instance_id,
                            token_id,
                            job_id,
                            result,
                        })
                        .await;
                    return;
                }
                Err(message) if attempt <= self.config.max_retries => {
                    let backoff = self.config.backoff_base_ms.saturating_mul(1 << (attempt - 1));
                    warn!(
                        %instance_id, %token_id, task = %task, attempt,
                        backoff_ms = backoff, error = %message, "task attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(message) => {
                    if self.jobs.remove(&job_id).is_none() {
                        return;
                    }
                    let _ = self
                        .event_tx
                        .send(SchedulerEvent::TaskFailed {
                            instance_id,
                            token_id,
                            job_id,
                            message,
                        })
                        .await;
                    return;
                }
            }
        }
    }

    /// Remove a job. Timer heap entries are removed lazily by the sweep.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        self.jobs.remove(&job_id).is_some()
    }

    /// Cancel every job belonging to an instance (terminate path).
    /// In-flight task invocations notice the removal and drop their
    /// eventual outcome.
    pub fn cancel_instance(&self, instance_id: Uuid) {
        self.jobs.retain(|_, job| job.instance_id != instance_id);
        self.timer_wake.notify_one();
    }

    /// The timer sweep: sleeps until the earliest deadline, re-checks on
    /// insert, and emits `TimerFired` for due, still-live jobs. Runs
    /// until the process shuts down; spawn it once per scheduler.
    pub async fn run(self: Arc<Self>) {
        loop {
            let next = {
                let mut heap = self.timers.lock().expect("timer heap poisoned");
                // Drop cancelled entries lazily.
                while let Some(Reverse(top)) = heap.peek() {
                    if self.jobs.contains_key(&top.job_id) {
                        break;
                    }
                    heap.pop();
                }
                heap.peek().map(|Reverse(e)| e.clone())
            };

            let entry = match next {
                None => {
                    self.timer_wake.notified().await;
                    continue;
                }
                Some(e) => e,
            };

            let now = now_ms();
            if entry.due_at_ms > now {
                let wait = Duration::from_millis((entry.due_at_ms - now) as u64);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.timer_wake.notified() => {}
                }
                continue;
            }

            let fired = {
                let mut heap = self.timers.lock().expect("timer heap poisoned");
                match heap.peek() {
                    Some(Reverse(top)) if top.job_id == entry.job_id => {
                        heap.pop();
                        true
                    }
                    _ => false,
                }
            };
            if fired && self.jobs.remove(&entry.job_id).is_some() {
                debug!(instance_id = %entry.instance_id, job_id = %entry.job_id, "timer fired");
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::TimerFired {
                        instance_id: entry.instance_id,
                        token_id: entry.token_id,
                        job_id: entry.job_id,
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct EchoTask;

    #[async_trait]
    impl TaskHandler for EchoTask {
        fn name(&self) -> &str {
            "echo"
        }
        fn validate(&self, _properties: &Value) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, input: TaskInput) -> Result<HashMap<String, Value>> {
            let mut out = HashMap::new();
            for (k, v) in input.properties {
                out.insert(k, v);
            }
            Ok(out)
        }
    }

    fn input(instance_id: Uuid, token_id: Uuid) -> TaskInput {
        TaskInput {
            instance_id,
            token_id,
            properties: serde_json::Map::new(),
            extensions: serde_json::Map::new(),
            variables: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn timer_fires_at_or_after_due() {
        let (scheduler, mut rx) = Scheduler::new(SchedulerConfig::default());
        tokio::spawn(Arc::clone(&scheduler).run());

        let start = now_ms();
        let instance_id = Uuid::new_v4();
        let token_id = Uuid::new_v4();
        scheduler.schedule_timer(instance_id, token_id, start + 100);

        let event = rx.recv().await.expect("timer event");
        assert!(now_ms() - start >= 100, "timer fired early");
        match event {
            SchedulerEvent::TimerFired {
                token_id: fired, ..
            } => assert_eq!(fired, token_id),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (scheduler, mut rx) = Scheduler::new(SchedulerConfig::default());
        tokio::spawn(Arc::clone(&scheduler).run());

        let job = scheduler.schedule_timer(Uuid::new_v4(), Uuid::new_v4(), now_ms() + 50);
        assert!(scheduler.cancel_job(job));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err(), "cancelled timer fired");
    }

    #[tokio::test]
    async fn missing_handler_fails_after_retries() {
        let config = SchedulerConfig {
            max_retries: 2,
            backoff_base_ms: 1,
            task_timeout: Duration::from_secs(1),
        };
        let (scheduler, mut rx) = Scheduler::new(config);

        scheduler.dispatch_task("nonexistent".into(), input(Uuid::new_v4(), Uuid::new_v4()));
        match rx.recv().await.expect("failure event") {
            SchedulerEvent::TaskFailed { message, .. } => {
                assert!(message.contains("no task handler"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_reports_completion() {
        let (scheduler, mut rx) = Scheduler::new(SchedulerConfig::default());
        scheduler.register_task(Arc::new(EchoTask));

        let mut task_input = input(Uuid::new_v4(), Uuid::new_v4());
        task_input
            .properties
            .insert("k".into(), Value::String("v".into()));
        scheduler.dispatch_task("echo".into(), task_input);

        match rx.recv().await.expect("completion event") {
            SchedulerEvent::TaskCompleted { result, .. } => {
                assert_eq!(result.get("k"), Some(&Value::String("v".into())));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
