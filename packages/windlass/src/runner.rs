//! Invocation runner and worker service.
//!
//! A worker polls its capability queues, leases tasks, and executes each
//! leased task as a journaled invocation: promote the lifecycle state, build
//! the execution context, run the task program (shell step or agent step,
//! then the gate), and map the outcome back onto the FSM. Suspension and
//! crash both leave a journal that the next attempt replays.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::dispatch::Dispatcher;
use crate::error::{Result, WindlassError};
use crate::job::{LifecycleState, Task};
use crate::lifecycle;
use crate::queue;
use crate::scheduler;
use crate::service::Service;
use crate::store::Store;

// ============================================================================
// Agent invoker (external collaborator seam)
// ============================================================================

/// External agent clients (LLM providers, remote executors) plug in here.
/// The runner journals the invocation through `ctx.call_agent`, so the call
/// happens at most once per attempt and its result replays.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, agent_type: &str, task: &Task, inputs: &Value) -> anyhow::Result<Value>;
}

/// Default invoker for deployments with no agent backends wired up.
pub struct UnconfiguredInvoker;

#[async_trait]
impl AgentInvoker for UnconfiguredInvoker {
    async fn invoke(&self, agent_type: &str, _task: &Task, _inputs: &Value) -> anyhow::Result<Value> {
        anyhow::bail!("no agent backend configured for agent type {agent_type}")
    }
}

// ============================================================================
// Task program
// ============================================================================

/// Run a shell command, capturing stdout. Non-zero exit is an error carrying
/// stderr.
async fn run_shell(cmd: &str) -> anyhow::Result<Value> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    Ok(Value::String(
        String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
    ))
}

/// Outputs of completed dependencies, keyed by their `var` binding (falling
/// back to the task name). Dependency outputs are immutable once recorded,
/// so this read needs no journal entry.
async fn gather_inputs(task: &Task, store: &Store) -> Result<Value> {
    let mut inputs = serde_json::Map::new();
    for dep in &task.needs.0 {
        let dep_task = Task::find(&task.job_id, dep, store).await?;
        let key = dep_task.var.clone().unwrap_or_else(|| dep.clone());
        inputs.insert(key, dep_task.output.clone().unwrap_or(Value::Null));
    }
    Ok(Value::Object(inputs))
}

/// The default task program: one command/agent step, then the gate.
async fn run_program(
    ctx: &mut ExecutionContext,
    task: &Task,
    inputs: Value,
    invoker: &Arc<dyn AgentInvoker>,
) -> Result<Value> {
    let output = match &task.run_cmd {
        Some(cmd) => {
            let cmd = cmd.clone();
            ctx.run("run-cmd", || async move { run_shell(&cmd).await }).await?
        }
        None => {
            let invoker = Arc::clone(invoker);
            let task_for_agent = task.clone();
            let agent_type = task.agent_type.clone();
            ctx.call_agent(&agent_type, || async move {
                invoker
                    .invoke(&task_for_agent.agent_type, &task_for_agent, &inputs)
                    .await
            })
            .await?
        }
    };

    match task.gate.as_deref() {
        None => {}
        Some("user_approval") => {
            let id = ctx.awakeable(None).await?;
            info!(
                job_id = %task.job_id,
                task = %task.name,
                awakeable = %id,
                "approval required; resolve the awakeable to continue"
            );
            let payload = ctx.await_awakeable(&id).await?;
            let approved = payload.get("action").and_then(Value::as_str) == Some("approve");
            if !approved {
                return Err(WindlassError::Fatal(format!(
                    "gate user_approval denied: {payload}"
                )));
            }
        }
        Some(other) => {
            return Err(WindlassError::Fatal(format!("unknown gate {other}")));
        }
    }

    Ok(output)
}

// ============================================================================
// Task executor
// ============================================================================

/// Executes leased tasks. Shared by the worker service and tests.
pub struct TaskExecutor {
    store: Store,
    invoker: Arc<dyn AgentInvoker>,
    dispatcher: Option<Dispatcher>,
    config: EngineConfig,
}

impl TaskExecutor {
    pub fn new(store: Store, invoker: Arc<dyn AgentInvoker>, config: EngineConfig) -> Self {
        Self {
            store,
            invoker,
            dispatcher: None,
            config,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Promote the task for execution. Returns the attempt to run under, or
    /// nothing when the lease is stale (task no longer runnable).
    async fn promote(&self, task: &Task, worker_id: &str) -> Result<Option<i64>> {
        let reason = format!("leased by {worker_id}");
        match task.status {
            LifecycleState::Ready => {
                lifecycle::transition_task(
                    &task.job_id,
                    &task.name,
                    LifecycleState::Running,
                    &reason,
                    &self.store,
                )
                .await?;
                Ok(Some(task.attempt))
            }
            LifecycleState::Pending => {
                lifecycle::transition_task(
                    &task.job_id,
                    &task.name,
                    LifecycleState::Ready,
                    &reason,
                    &self.store,
                )
                .await?;
                lifecycle::transition_task(
                    &task.job_id,
                    &task.name,
                    LifecycleState::Running,
                    &reason,
                    &self.store,
                )
                .await?;
                Ok(Some(task.attempt))
            }
            // Retry: the attempt bump opens a fresh journal scope exactly
            // when execution restarts.
            LifecycleState::BackingOff => {
                let mut tx = self.store.begin().await?;
                lifecycle::transition_task_in_tx(
                    &mut tx,
                    &task.job_id,
                    &task.name,
                    LifecycleState::Running,
                    "retry",
                )
                .await?;
                sqlx::query(
                    "UPDATE tasks SET attempt = attempt + 1, updated_at = $1 \
                     WHERE job_id = $2 AND name = $3",
                )
                .bind(chrono::Utc::now())
                .bind(&task.job_id)
                .bind(&task.name)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(Some(task.attempt + 1))
            }
            // A reaped lease from a crashed worker: the row still says
            // running. Resume the same attempt; the journal replays.
            LifecycleState::Running => Ok(Some(task.attempt)),
            _ => Ok(None),
        }
    }

    /// Execute one leased task end-to-end and settle its lifecycle.
    pub async fn execute(&self, job_id: &str, task_name: &str, worker_id: &str) -> Result<()> {
        let task = Task::find(job_id, task_name, &self.store).await?;
        let Some(attempt) = self.promote(&task, worker_id).await? else {
            debug!(job_id = %job_id, task = %task_name, status = %task.status, "stale lease, skipping");
            queue::release(job_id, task_name, &self.store).await?;
            return Ok(());
        };

        let mut ctx = ExecutionContext::create(job_id, task_name, attempt, &self.store).await?;
        if let Some(dispatcher) = &self.dispatcher {
            ctx = ctx.with_dispatcher(dispatcher.clone());
        }
        let inputs = gather_inputs(&task, &self.store).await?;

        let outcome = match tokio::time::timeout(
            self.config.attempt_timeout,
            run_program(&mut ctx, &task, inputs, &self.invoker),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WindlassError::Transient(
                "attempt wall-clock ceiling exceeded".into(),
            )),
        };

        match outcome {
            Ok(output) => {
                task.save_output(&output, &self.store).await?;
                lifecycle::transition_task(
                    job_id,
                    task_name,
                    LifecycleState::Completed,
                    "success",
                    &self.store,
                )
                .await?;
                queue::release(job_id, task_name, &self.store).await?;
                scheduler::advance_job(job_id, &self.store).await?;
                info!(job_id = %job_id, task = %task_name, attempt, "task completed");
            }
            Err(WindlassError::Suspended(reason)) => {
                // Already journaled and transitioned; just return the slot.
                queue::release(job_id, task_name, &self.store).await?;
                scheduler::advance_job(job_id, &self.store).await?;
                debug!(job_id = %job_id, task = %task_name, %reason, "task suspended");
            }
            Err(err) if err.is_fatal() => {
                let failure = format!("{}: {err}", err.failure_code());
                lifecycle::complete_task_failure(job_id, task_name, &failure, &self.store).await?;
                queue::release(job_id, task_name, &self.store).await?;
                scheduler::advance_job(job_id, &self.store).await?;
                error!(job_id = %job_id, task = %task_name, error = %err, "task failed fatally");
            }
            Err(err) => {
                let current = Task::find(job_id, task_name, &self.store).await?;
                if current.retry_count + 1 >= self.config.retry.max_attempts {
                    let failure = format!("retry attempts exhausted: {err}");
                    lifecycle::complete_task_failure(job_id, task_name, &failure, &self.store)
                        .await?;
                } else {
                    lifecycle::backoff_task(
                        job_id,
                        task_name,
                        &self.config.retry,
                        &err.to_string(),
                        &self.store,
                    )
                    .await?;
                }
                queue::release(job_id, task_name, &self.store).await?;
                scheduler::advance_job(job_id, &self.store).await?;
                warn!(job_id = %job_id, task = %task_name, error = %err, "task failed, retry policy applies");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Worker service
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Queues this worker serves (its capabilities).
    pub queues: Vec<String>,
    pub max_slots: i64,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            queues: vec!["agent:shell".to_string()],
            max_slots: 4,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Polls capability queues and executes leased tasks sequentially. The
/// engine does not fork parallel work inside a single invocation.
pub struct WorkerService {
    store: Store,
    executor: Arc<TaskExecutor>,
    config: WorkerConfig,
}

impl WorkerService {
    pub fn new(store: Store, executor: Arc<TaskExecutor>, config: WorkerConfig) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }
}

#[async_trait]
impl Service for WorkerService {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        queue::register_worker(
            &self.config.worker_id,
            &self.config.queues,
            self.config.max_slots,
            &self.store,
        )
        .await?;

        // Heartbeat keeps this worker's leases out of the reaper's reach.
        let heartbeat_store = self.store.clone();
        let heartbeat_id = self.config.worker_id.clone();
        let heartbeat_cancel = shutdown.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue::heartbeat(&heartbeat_id, &heartbeat_store).await {
                            warn!(worker_id = %heartbeat_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        info!(worker_id = %self.config.worker_id, queues = ?self.config.queues, "worker starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let mut worked = false;
            for queue_name in &self.config.queues {
                let leased = match queue::poll(&self.config.worker_id, queue_name, &self.store).await
                {
                    Ok(leased) => leased,
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "poll failed");
                        continue;
                    }
                };
                if let Some(leased) = leased {
                    worked = true;
                    if let Err(e) = self
                        .executor
                        .execute(&leased.job_id, &leased.task_name, &self.config.worker_id)
                        .await
                    {
                        error!(job_id = %leased.job_id, task = %leased.task_name, error = %e, "invocation failed");
                        // Free the lease so the task is not stuck until reap.
                        let _ = queue::release(&leased.job_id, &leased.task_name, &self.store).await;
                    }
                }
            }

            if !worked {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        let _ = heartbeat_handle.await;
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awakeable;
    use crate::job::{submit_job, CompletionResult, Job, TaskSpec};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Test invoker: scripted outputs per task name, with per-task failure
    /// budgets and a call counter.
    struct ScriptedInvoker {
        outputs: HashMap<String, Value>,
        fail_first: Mutex<HashMap<String, u32>>,
        calls: AtomicU32,
    }

    impl ScriptedInvoker {
        fn new(outputs: &[(&str, Value)]) -> Arc<Self> {
            Arc::new(Self {
                outputs: outputs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                fail_first: Mutex::new(HashMap::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn failing_first(self: Arc<Self>, task: &str, failures: u32) -> Arc<Self> {
            self.fail_first.lock().unwrap().insert(task.to_string(), failures);
            self
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedInvoker {
        async fn invoke(&self, _agent_type: &str, task: &Task, _inputs: &Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut budgets = self.fail_first.lock().unwrap();
                if let Some(remaining) = budgets.get_mut(&task.name) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        anyhow::bail!("scripted transient failure");
                    }
                }
            }
            Ok(self
                .outputs
                .get(&task.name)
                .cloned()
                .unwrap_or(Value::Null))
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.base = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(1);
        config
    }

    fn agent_spec(name: &str, needs: &[&str]) -> TaskSpec {
        TaskSpec::builder()
            .name(name)
            .needs(needs.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .agent_type("claude")
            .build()
    }

    async fn lease_and_execute(executor: &TaskExecutor, store: &Store) -> u32 {
        let mut executed = 0;
        while let Some(leased) = queue::poll("w1", "agent:claude", store).await.unwrap() {
            executor
                .execute(&leased.job_id, &leased.task_name, "w1")
                .await
                .unwrap();
            executed += 1;
        }
        executed
    }

    #[tokio::test]
    async fn approval_gate_suspends_then_resumes_with_payload() {
        let store = Store::in_memory().await.unwrap();
        let invoker = ScriptedInvoker::new(&[("verify", json!("verified"))]);
        let executor = TaskExecutor::new(store.clone(), invoker.clone(), fast_config());
        queue::register_worker("w1", &["agent:claude".to_string()], 4, &store)
            .await
            .unwrap();

        let spec = TaskSpec::builder()
            .name("verify")
            .agent_type("claude")
            .gate("user_approval")
            .build();
        submit_job("j1", "approval", None, &[spec], &store).await.unwrap();
        scheduler::run_scheduler_pass(&store).await.unwrap();
        lease_and_execute(&executor, &store).await;

        // Suspended on the awakeable.
        let task = Task::find("j1", "verify", &store).await.unwrap();
        assert_eq!(task.status, LifecycleState::Suspended);
        let promises = awakeable::Awakeable::list(Some("j1"), 10, &store).await.unwrap();
        assert_eq!(promises.len(), 1);
        assert!(promises[0].id.starts_with("prom_1"));

        // External approval.
        awakeable::resolve(&promises[0].id, json!({"action": "approve"}), &store)
            .await
            .unwrap();
        let task = Task::find("j1", "verify", &store).await.unwrap();
        assert_eq!(task.status, LifecycleState::Pending);

        // Scheduler re-enqueues; replay delivers the payload and completes.
        scheduler::run_scheduler_pass(&store).await.unwrap();
        lease_and_execute(&executor, &store).await;

        let task = Task::find("j1", "verify", &store).await.unwrap();
        assert_eq!(task.status, LifecycleState::Completed);
        assert!(task.failure_message.is_none());
        assert_eq!(task.output, Some(json!("verified")));
        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.completion_result, Some(CompletionResult::Success));
        // The agent step ran exactly once across both attempts of the body.
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_gate_fails_the_task_and_job() {
        let store = Store::in_memory().await.unwrap();
        let invoker = ScriptedInvoker::new(&[("verify", json!("v"))]);
        let executor = TaskExecutor::new(store.clone(), invoker, fast_config());
        queue::register_worker("w1", &["agent:claude".to_string()], 4, &store)
            .await
            .unwrap();

        let spec = TaskSpec::builder()
            .name("verify")
            .agent_type("claude")
            .gate("user_approval")
            .build();
        submit_job("j1", "approval", None, &[spec], &store).await.unwrap();
        scheduler::run_scheduler_pass(&store).await.unwrap();
        lease_and_execute(&executor, &store).await;

        let promises = awakeable::Awakeable::list(Some("j1"), 10, &store).await.unwrap();
        awakeable::resolve(&promises[0].id, json!({"action": "deny"}), &store)
            .await
            .unwrap();
        scheduler::run_scheduler_pass(&store).await.unwrap();
        lease_and_execute(&executor, &store).await;

        let task = Task::find("j1", "verify", &store).await.unwrap();
        assert_eq!(task.status, LifecycleState::Completed);
        assert!(task.failure_message.unwrap().contains("user_approval denied"));
        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.completion_result, Some(CompletionResult::Failure));
    }

    #[tokio::test]
    async fn crash_recovery_preserves_completed_outputs() {
        let store = Store::in_memory().await.unwrap();
        let invoker = ScriptedInvoker::new(&[
            ("a", json!("output-a")),
            ("b", json!("output-b")),
            ("c", json!("output-c")),
        ]);
        let executor = TaskExecutor::new(store.clone(), invoker.clone(), fast_config());
        queue::register_worker("w1", &["agent:claude".to_string()], 4, &store)
            .await
            .unwrap();

        submit_job(
            "j1",
            "pipeline",
            None,
            &[agent_spec("a", &[]), agent_spec("b", &[]), agent_spec("c", &["a", "b"])],
            &store,
        )
        .await
        .unwrap();
        scheduler::run_scheduler_pass(&store).await.unwrap();
        // A and B complete.
        assert_eq!(lease_and_execute(&executor, &store).await, 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);

        // C is leased and its worker dies mid-flight: simulate by leasing
        // without executing, then reaping the stale lease.
        scheduler::run_scheduler_pass(&store).await.unwrap();
        let leased = queue::poll("w1", "agent:claude", &store).await.unwrap().unwrap();
        assert_eq!(leased.task_name, "c");
        lifecycle::transition_task("j1", "c", LifecycleState::Running, "leased by w1", &store)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaped = queue::reap(Duration::ZERO, &store).await.unwrap();
        assert_eq!(reaped, 1);

        // Resume: A and B keep their journaled outputs, no re-execution.
        assert_eq!(lease_and_execute(&executor, &store).await, 1);
        let a = Task::find("j1", "a", &store).await.unwrap();
        let b = Task::find("j1", "b", &store).await.unwrap();
        assert_eq!(a.output, Some(json!("output-a")));
        assert_eq!(b.output, Some(json!("output-b")));
        // a, b ran once each; c ran once after recovery.
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);

        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.completion_result, Some(CompletionResult::Success));
    }

    #[tokio::test]
    async fn transient_failure_backs_off_then_retries_with_fresh_attempt() {
        let store = Store::in_memory().await.unwrap();
        let invoker = ScriptedInvoker::new(&[("flaky", json!("finally"))]).failing_first("flaky", 1);
        let executor = TaskExecutor::new(store.clone(), invoker, fast_config());
        queue::register_worker("w1", &["agent:claude".to_string()], 4, &store)
            .await
            .unwrap();

        submit_job("j1", "retry", None, &[agent_spec("flaky", &[])], &store)
            .await
            .unwrap();
        scheduler::run_scheduler_pass(&store).await.unwrap();
        lease_and_execute(&executor, &store).await;

        let task = Task::find("j1", "flaky", &store).await.unwrap();
        assert_eq!(task.status, LifecycleState::BackingOff);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.attempt, 1);

        // Retry pass promotes it once the deadline passes; the worker bumps
        // the attempt at lease time.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler::run_retry_pass(&store).await.unwrap(), 1);
        lease_and_execute(&executor, &store).await;

        let task = Task::find("j1", "flaky", &store).await.unwrap();
        assert_eq!(task.status, LifecycleState::Completed);
        assert_eq!(task.attempt, 2);
        assert_eq!(task.output, Some(json!("finally")));

        // The failed first attempt and the successful second have separate
        // journal scopes.
        let first = crate::journal::load("j1", "flaky", 1, &store).await.unwrap();
        assert!(first[0].is_failed());
        let second = crate::journal::load("j1", "flaky", 2, &store).await.unwrap();
        assert!(second[0].is_completed());
    }

    #[tokio::test]
    async fn retries_exhaust_into_completed_failure() {
        let store = Store::in_memory().await.unwrap();
        let invoker = ScriptedInvoker::new(&[]).failing_first("doomed", 99);
        let mut config = fast_config();
        config.retry.max_attempts = 2;
        let executor = TaskExecutor::new(store.clone(), invoker, config);
        queue::register_worker("w1", &["agent:claude".to_string()], 4, &store)
            .await
            .unwrap();

        submit_job("j1", "doomed", None, &[agent_spec("doomed", &[])], &store)
            .await
            .unwrap();
        scheduler::run_scheduler_pass(&store).await.unwrap();
        lease_and_execute(&executor, &store).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler::run_retry_pass(&store).await.unwrap();
        lease_and_execute(&executor, &store).await;

        let task = Task::find("j1", "doomed", &store).await.unwrap();
        assert_eq!(task.status, LifecycleState::Completed);
        assert!(task.failure_message.unwrap().contains("retry attempts exhausted"));
        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.completion_result, Some(CompletionResult::Failure));
    }

    #[tokio::test]
    async fn shell_task_captures_stdout() {
        let store = Store::in_memory().await.unwrap();
        let executor = TaskExecutor::new(store.clone(), Arc::new(UnconfiguredInvoker), fast_config());
        queue::register_worker("w1", &["agent:shell".to_string()], 4, &store)
            .await
            .unwrap();

        let spec = TaskSpec::builder()
            .name("hello")
            .agent_type("shell")
            .run_cmd("echo hello-world")
            .build();
        submit_job("j1", "shell", None, &[spec], &store).await.unwrap();
        scheduler::run_scheduler_pass(&store).await.unwrap();
        let leased = queue::poll("w1", "agent:shell", &store).await.unwrap().unwrap();
        executor.execute(&leased.job_id, &leased.task_name, "w1").await.unwrap();

        let task = Task::find("j1", "hello", &store).await.unwrap();
        assert_eq!(task.output, Some(json!("hello-world")));
        assert_eq!(task.status, LifecycleState::Completed);
    }

    #[tokio::test]
    async fn dependency_outputs_flow_into_inputs() {
        let store = Store::in_memory().await.unwrap();
        let invoker = ScriptedInvoker::new(&[("produce", json!({"n": 7}))]);
        let executor = TaskExecutor::new(store.clone(), invoker, fast_config());

        let producer = TaskSpec::builder()
            .name("produce")
            .agent_type("claude")
            .var("result")
            .build();
        submit_job("j1", "flow", None, &[producer, agent_spec("consume", &["produce"])], &store)
            .await
            .unwrap();

        let produce = Task::find("j1", "produce", &store).await.unwrap();
        produce.save_output(&json!({"n": 7}), &store).await.unwrap();

        let consume = Task::find("j1", "consume", &store).await.unwrap();
        let inputs = gather_inputs(&consume, &store).await.unwrap();
        // Bound under the producer's `var`.
        assert_eq!(inputs, json!({"result": {"n": 7}}));
        let _ = executor;
    }
}
