//! Scheduler and retry passes.
//!
//! Both passes are periodic and best-effort: a missed tick delays work but
//! never corrupts state, because every promotion goes through the lifecycle
//! FSM gate. The scheduler promotes dependency-satisfied tasks to `ready`
//! and enqueues them; the retry pass re-enqueues `backing-off` tasks whose
//! deadline has passed. Job state is derived from task states through
//! FSM-legal steps.

use chrono::Utc;

use crate::awakeable;
use crate::error::{Result, WindlassError};
use crate::events;
use crate::id::validate_id;
use crate::job::{CompletionResult, Job, LifecycleState, Task};
use crate::lifecycle;
use crate::queue;
use crate::store::Store;

use LifecycleState::*;

/// Counts from one scheduler pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerReport {
    pub tasks_scheduled: u64,
    pub tasks_failed_by_dependency: u64,
    pub jobs_completed: u64,
}

/// A completed task with no recorded failure succeeded.
fn task_succeeded(task: &Task) -> bool {
    task.status == Completed && task.failure_message.is_none()
}

fn task_failed(task: &Task) -> bool {
    task.status == Completed && task.failure_message.is_some()
}

/// One scheduler pass over every non-completed job.
pub async fn run_scheduler_pass(store: &Store) -> Result<SchedulerReport> {
    let mut report = SchedulerReport::default();

    for job in Job::find_active(store).await? {
        // Promote the job itself first.
        match job.status {
            Scheduled => {
                let due = job.scheduled_at.map(|t| t <= Utc::now()).unwrap_or(true);
                if !due {
                    continue;
                }
                lifecycle::transition_job(&job.id, Ready, "arrival deadline reached", store).await?;
            }
            Pending => {
                lifecycle::transition_job(&job.id, Ready, "scheduler", store).await?;
            }
            _ => {}
        }

        let tasks = Task::list_for_job(&job.id, store).await?;
        let by_name: std::collections::HashMap<&str, &Task> =
            tasks.iter().map(|t| (t.name.as_str(), t)).collect();

        for task in &tasks {
            if task.status != Pending {
                continue;
            }
            // A failed dependency fails the dependent; it will never become
            // runnable.
            if let Some(failed_dep) = task
                .needs
                .0
                .iter()
                .find(|dep| by_name.get(dep.as_str()).is_some_and(|d| task_failed(d)))
            {
                lifecycle::force_task_failure(
                    &job.id,
                    &task.name,
                    &format!("dependency {failed_dep} failed"),
                    store,
                )
                .await?;
                report.tasks_failed_by_dependency += 1;
                continue;
            }
            let runnable = task
                .needs
                .0
                .iter()
                .all(|dep| by_name.get(dep.as_str()).is_some_and(|d| task_succeeded(d)));
            if !runnable {
                continue;
            }

            lifecycle::transition_task(&job.id, &task.name, Ready, "dependencies satisfied", store)
                .await?;
            queue::enqueue(&job.id, &task.name, &task.queue_name(), store).await?;
            report.tasks_scheduled += 1;
        }

        if advance_job(&job.id, store).await? {
            report.jobs_completed += 1;
        }
    }

    Ok(report)
}

/// Re-enqueue `backing-off` tasks whose `next_retry_at` has passed. The
/// worker performs the FSM `backing-off -> running` promotion (with the
/// attempt bump) when it leases the row.
pub async fn run_retry_pass(store: &Store) -> Result<u64> {
    let now = Utc::now();
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT id, job_id, name, needs, agent_type, run_cmd, status, attempt, retry_count, \
                next_retry_at, gate, var, output, failure_message, created_at, updated_at \
         FROM tasks WHERE status = $1 AND next_retry_at IS NOT NULL",
    )
    .bind(BackingOff)
    .fetch_all(store.pool())
    .await?;

    let mut promoted = 0;
    for task in tasks {
        let due = task.next_retry_at.map(|t| t <= now).unwrap_or(false);
        if !due {
            continue;
        }
        if queue::enqueue(&task.job_id, &task.name, &task.queue_name(), store).await? {
            promoted += 1;
            tracing::info!(job_id = %task.job_id, task = %task.name, retry_count = task.retry_count, "retry enqueued");
        }
    }
    Ok(promoted)
}

/// Derive the job's state from its tasks and finish the job when every task
/// is terminal. Returns true when the job completed in this call.
pub async fn advance_job(job_id: &str, store: &Store) -> Result<bool> {
    let job = Job::find_by_id(job_id, store).await?;
    if job.status == Completed {
        return Ok(false);
    }
    let tasks = Task::list_for_job(job_id, store).await?;
    if tasks.is_empty() {
        return Ok(false);
    }

    let all_terminal = tasks.iter().all(|t| t.status == Completed);
    if all_terminal {
        let failed: Vec<&Task> = tasks.iter().filter(|t| task_failed(t)).collect();
        let (result, failure) = if failed.is_empty() {
            (CompletionResult::Success, None)
        } else {
            let summary = failed
                .iter()
                .map(|t| {
                    format!(
                        "task {} failed: {}",
                        t.name,
                        t.failure_message.as_deref().unwrap_or("unknown")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            (CompletionResult::Failure, Some(summary))
        };

        // Walk the job to a state that can legally complete.
        let mut status = job.status;
        loop {
            match status {
                Running | BackingOff => break,
                Pending | Scheduled => {
                    lifecycle::transition_job(job_id, Ready, "finalizing", store).await?;
                    status = Ready;
                }
                Ready | Suspended | Paused => {
                    lifecycle::transition_job(job_id, Running, "finalizing", store).await?;
                    status = Running;
                }
                Completed => return Ok(false),
            }
        }
        lifecycle::complete_job(job_id, result, failure.as_deref(), store).await?;
        // Orphaned promises must not be silently resolvable later.
        awakeable::cancel_for_job(job_id, store).await?;
        tracing::info!(job_id = %job_id, result = ?result, "job completed");
        return Ok(true);
    }

    // Mirror suspension: a job whose live tasks are all suspended is itself
    // suspended; any woken task brings it back.
    let live: Vec<&Task> = tasks.iter().filter(|t| t.status != Completed).collect();
    let all_suspended = live.iter().all(|t| t.status == Suspended);
    if all_suspended && job.status == Running {
        lifecycle::transition_job(job_id, Suspended, "all tasks suspended", store).await?;
    } else if !all_suspended && job.status == Suspended {
        lifecycle::transition_job(job_id, Running, "task woken", store).await?;
    } else if job.status == Ready
        && tasks.iter().any(|t| !matches!(t.status, Pending | Scheduled | Ready))
    {
        lifecycle::transition_job(job_id, Running, "tasks dispatched", store).await?;
    }

    Ok(false)
}

/// Cancel a job: every non-terminal task becomes `completed(failure)`, every
/// PENDING awakeable becomes CANCELLED, queue rows are dropped and leases
/// freed, and the job completes as a failure.
pub async fn cancel_job(job_id: &str, reason: &str, store: &Store) -> Result<()> {
    validate_id("job id", job_id)?;
    let job = Job::find_by_id(job_id, store).await?;
    if job.status == Completed {
        return Err(WindlassError::InvalidTransition {
            from: "completed".into(),
            to: "completed".into(),
        });
    }

    let reason = if reason.is_empty() { "cancelled" } else { reason };
    for task in Task::list_for_job(job_id, store).await? {
        if task.status != Completed {
            lifecycle::force_task_failure(job_id, &task.name, reason, store).await?;
        }
    }
    awakeable::cancel_for_job(job_id, store).await?;
    queue::clear_for_job(job_id, store).await?;
    advance_job(job_id, store).await?;

    tracing::info!(job_id = %job_id, reason = %reason, "job cancelled");
    Ok(())
}

/// Re-open a failed job: failed tasks return to `pending` with a fresh
/// attempt (a fresh journal scope), succeeded tasks keep their outputs.
///
/// This is an administrative reset, audited as `job.Retry` rather than a
/// state-change event — `completed` has no outgoing FSM edges.
pub async fn retry_job(job_id: &str, store: &Store) -> Result<()> {
    validate_id("job id", job_id)?;
    let job = Job::find_by_id(job_id, store).await?;
    if job.status != Completed || job.completion_result != Some(CompletionResult::Failure) {
        return Err(WindlassError::Validation(format!(
            "job {job_id} is not a failed job"
        )));
    }

    let mut tx = store.begin().await?;
    sqlx::query(
        "UPDATE tasks SET status = $1, attempt = attempt + 1, retry_count = 0, \
         next_retry_at = NULL, failure_message = NULL, updated_at = $2 \
         WHERE job_id = $3 AND failure_message IS NOT NULL",
    )
    .bind(Pending)
    .bind(Utc::now())
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE jobs SET status = $1, completion_result = NULL, completion_failure = NULL, \
         updated_at = $2 WHERE id = $3",
    )
    .bind(Pending)
    .bind(Utc::now())
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    events::emit(&mut tx, job_id, None, events::JOB_RETRY, None, None, "manual retry").await?;
    tx.commit().await?;

    tracing::info!(job_id = %job_id, "job reopened for retry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{submit_job, TaskSpec};

    fn spec(name: &str, needs: &[&str]) -> TaskSpec {
        TaskSpec::builder()
            .name(name)
            .needs(needs.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .agent_type("shell")
            .run_cmd("true")
            .build()
    }

    async fn complete_task(job: &str, task: &str, store: &Store) {
        lifecycle::transition_task(job, task, Running, "test", store).await.unwrap();
        lifecycle::transition_task(job, task, Completed, "success", store).await.unwrap();
    }

    #[tokio::test]
    async fn scheduler_promotes_only_dependency_satisfied_tasks() {
        let store = Store::in_memory().await.unwrap();
        submit_job("j1", "dag", None, &[spec("a", &[]), spec("b", &["a"])], &store)
            .await
            .unwrap();

        let report = run_scheduler_pass(&store).await.unwrap();
        assert_eq!(report.tasks_scheduled, 1);

        let a = Task::find("j1", "a", &store).await.unwrap();
        assert_eq!(a.status, Ready);
        let b = Task::find("j1", "b", &store).await.unwrap();
        assert_eq!(b.status, Pending);
        assert_eq!(queue::depth("agent:shell", &store).await.unwrap(), 1);

        // Finish a; b becomes schedulable.
        complete_task("j1", "a", &store).await;
        let report = run_scheduler_pass(&store).await.unwrap();
        assert_eq!(report.tasks_scheduled, 1);
        let b = Task::find("j1", "b", &store).await.unwrap();
        assert_eq!(b.status, Ready);
    }

    #[tokio::test]
    async fn scheduled_job_waits_for_arrival_deadline() {
        let store = Store::in_memory().await.unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);
        submit_job("j1", "later", Some(later), &[spec("a", &[])], &store)
            .await
            .unwrap();

        let report = run_scheduler_pass(&store).await.unwrap();
        assert_eq!(report.tasks_scheduled, 0);
        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.status, Scheduled);
    }

    #[tokio::test]
    async fn failed_dependency_fails_dependents_and_job() {
        let store = Store::in_memory().await.unwrap();
        submit_job("j1", "dag", None, &[spec("a", &[]), spec("b", &["a"])], &store)
            .await
            .unwrap();
        run_scheduler_pass(&store).await.unwrap();

        lifecycle::transition_task("j1", "a", Running, "test", &store).await.unwrap();
        lifecycle::complete_task_failure("j1", "a", "agent exploded", &store)
            .await
            .unwrap();

        let report = run_scheduler_pass(&store).await.unwrap();
        assert_eq!(report.tasks_failed_by_dependency, 1);
        assert_eq!(report.jobs_completed, 1);

        let b = Task::find("j1", "b", &store).await.unwrap();
        assert_eq!(b.status, Completed);
        assert!(b.failure_message.unwrap().contains("dependency a failed"));

        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.status, Completed);
        assert_eq!(job.completion_result, Some(CompletionResult::Failure));
        assert!(job.completion_failure.unwrap().contains("agent exploded"));
    }

    #[tokio::test]
    async fn job_completes_successfully_when_all_tasks_succeed() {
        let store = Store::in_memory().await.unwrap();
        submit_job("j1", "dag", None, &[spec("a", &[])], &store).await.unwrap();
        run_scheduler_pass(&store).await.unwrap();
        complete_task("j1", "a", &store).await;

        let report = run_scheduler_pass(&store).await.unwrap();
        assert_eq!(report.jobs_completed, 1);
        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.completion_result, Some(CompletionResult::Success));
        assert!(job.completion_failure.is_none());
    }

    #[tokio::test]
    async fn retry_pass_re_enqueues_due_backoffs_only() {
        let store = Store::in_memory().await.unwrap();
        submit_job("j1", "dag", None, &[spec("a", &[])], &store).await.unwrap();
        run_scheduler_pass(&store).await.unwrap();
        lifecycle::transition_task("j1", "a", Running, "test", &store).await.unwrap();

        // Drain the original queue row so re-enqueue is observable.
        queue::release("j1", "a", &store).await.unwrap();

        let policy = crate::config::RetryPolicy {
            base: std::time::Duration::from_millis(1),
            factor: 1.0,
            max_delay: std::time::Duration::from_millis(1),
            max_attempts: 5,
        };
        lifecycle::backoff_task("j1", "a", &policy, "flaky", &store).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let promoted = run_retry_pass(&store).await.unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(queue::depth("agent:shell", &store).await.unwrap(), 1);

        // Not due yet: long backoff is left alone.
        let long = crate::config::RetryPolicy::default();
        queue::release("j1", "a", &store).await.unwrap();
        lifecycle::transition_task("j1", "a", Running, "test", &store).await.unwrap();
        lifecycle::backoff_task("j1", "a", &long, "flaky again", &store).await.unwrap();
        let promoted = run_retry_pass(&store).await.unwrap();
        assert_eq!(promoted, 0);
    }

    #[tokio::test]
    async fn cancel_job_cancels_tasks_and_awakeables() {
        let store = Store::in_memory().await.unwrap();
        submit_job("j1", "dag", None, &[spec("a", &[]), spec("b", &["a"])], &store)
            .await
            .unwrap();
        run_scheduler_pass(&store).await.unwrap();

        // Task a suspended on an awakeable.
        lifecycle::transition_task("j1", "a", Running, "test", &store).await.unwrap();
        let mut ctx = crate::context::ExecutionContext::create("j1", "a", 1, &store)
            .await
            .unwrap();
        let id = ctx.awakeable(None).await.unwrap();
        let _ = ctx.await_awakeable(&id).await.unwrap_err();

        cancel_job("j1", "operator cancel", &store).await.unwrap();

        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.status, Completed);
        assert_eq!(job.completion_result, Some(CompletionResult::Failure));
        for task in Task::list_for_job("j1", &store).await.unwrap() {
            assert_eq!(task.status, Completed);
        }
        let row = crate::awakeable::Awakeable::find_by_id(&id, &store).await.unwrap();
        assert_eq!(row.status, crate::awakeable::AwakeableStatus::Cancelled);
        // Late resolution is rejected.
        let err = crate::awakeable::resolve(&id, serde_json::json!(1), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, WindlassError::NotPending { .. }));
    }

    #[tokio::test]
    async fn retry_job_reopens_failed_tasks_with_fresh_attempt() {
        let store = Store::in_memory().await.unwrap();
        submit_job("j1", "dag", None, &[spec("a", &[]), spec("b", &[])], &store)
            .await
            .unwrap();
        run_scheduler_pass(&store).await.unwrap();
        complete_task("j1", "a", &store).await;
        lifecycle::transition_task("j1", "b", Running, "test", &store).await.unwrap();
        lifecycle::complete_task_failure("j1", "b", "boom", &store).await.unwrap();
        run_scheduler_pass(&store).await.unwrap();

        retry_job("j1", &store).await.unwrap();

        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.status, Pending);
        assert!(job.completion_result.is_none());

        // b reopened with a fresh attempt; a keeps its completion.
        let b = Task::find("j1", "b", &store).await.unwrap();
        assert_eq!(b.status, Pending);
        assert_eq!(b.attempt, 2);
        assert!(b.failure_message.is_none());
        let a = Task::find("j1", "a", &store).await.unwrap();
        assert_eq!(a.status, Completed);
        assert_eq!(a.attempt, 1);
    }

    #[tokio::test]
    async fn retry_job_requires_a_failed_job() {
        let store = Store::in_memory().await.unwrap();
        submit_job("j1", "dag", None, &[spec("a", &[])], &store).await.unwrap();
        let err = retry_job("j1", &store).await.unwrap_err();
        assert!(matches!(err, WindlassError::Validation(_)));
    }
}
