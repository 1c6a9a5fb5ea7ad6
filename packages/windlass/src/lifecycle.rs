//! The eight-state lifecycle FSM for jobs and tasks.
//!
//! ```text
//! pending     -> ready | scheduled
//! scheduled   -> ready
//! ready       -> running
//! running     -> suspended | backing-off | completed
//! suspended   -> running | pending
//! backing-off -> running | paused | completed
//! paused      -> running
//! ```
//!
//! `suspended -> pending` is the wake path: resolving an awakeable (or a due
//! sleep) hands the task back to the scheduler, which re-enqueues it and
//! replay delivers the payload.
//!
//! Any other transition is rejected with the state unchanged. A successful
//! transition runs in one store transaction: status guard, auxiliary field
//! updates (backoff bookkeeping, completion fields), and the audit event.

use chrono::Utc;

use crate::config::RetryPolicy;
use crate::error::{Result, WindlassError};
use crate::events;
use crate::id::validate_id;
use crate::job::{CompletionResult, LifecycleState};
use crate::store::Store;

use LifecycleState::*;

/// The exhaustive transition table.
pub fn is_allowed(from: LifecycleState, to: LifecycleState) -> bool {
    matches!(
        (from, to),
        (Pending, Ready)
            | (Pending, Scheduled)
            | (Scheduled, Ready)
            | (Ready, Running)
            | (Running, Suspended)
            | (Running, BackingOff)
            | (Running, Completed)
            | (Suspended, Running)
            | (Suspended, Pending)
            | (BackingOff, Running)
            | (BackingOff, Paused)
            | (BackingOff, Completed)
            | (Paused, Running)
    )
}

fn check(from: LifecycleState, to: LifecycleState) -> Result<()> {
    if !is_allowed(from, to) {
        return Err(WindlassError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Task transitions
// ============================================================================

/// Transition a task inside an open transaction: status guard, update, audit
/// event. Returns the prior state.
pub async fn transition_task_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job_id: &str,
    task_name: &str,
    to: LifecycleState,
    reason: &str,
) -> Result<LifecycleState> {
    let from: LifecycleState =
        sqlx::query_scalar("SELECT status FROM tasks WHERE job_id = $1 AND name = $2")
            .bind(job_id)
            .bind(task_name)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| WindlassError::NotFound {
                kind: "task",
                id: format!("{job_id}/{task_name}"),
            })?;
    check(from, to)?;

    sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = $2 WHERE job_id = $3 AND name = $4 AND status = $5",
    )
    .bind(to)
    .bind(Utc::now())
    .bind(job_id)
    .bind(task_name)
    .bind(from)
    .execute(&mut **tx)
    .await?;

    events::emit(
        tx,
        job_id,
        Some(task_name),
        events::TASK_STATE_CHANGE,
        Some(from),
        Some(to),
        reason,
    )
    .await?;
    Ok(from)
}

/// Move a task to `to`, guarding against concurrent state changes.
pub async fn transition_task(
    job_id: &str,
    task_name: &str,
    to: LifecycleState,
    reason: &str,
    store: &Store,
) -> Result<()> {
    validate_id("job id", job_id)?;
    validate_id("task name", task_name)?;

    let mut tx = store.begin().await?;
    let from = transition_task_in_tx(&mut tx, job_id, task_name, to, reason).await?;
    tx.commit().await?;

    tracing::debug!(job_id = %job_id, task = %task_name, from = %from, to = %to, reason = %reason, "task transition");
    Ok(())
}

/// Enter `backing-off`: bump `retry_count`, stamp `next_retry_at` from the
/// retry policy.
pub async fn backoff_task(
    job_id: &str,
    task_name: &str,
    policy: &RetryPolicy,
    reason: &str,
    store: &Store,
) -> Result<()> {
    validate_id("job id", job_id)?;
    validate_id("task name", task_name)?;

    let mut tx = store.begin().await?;
    let (from, retry_count): (LifecycleState, i64) = sqlx::query_as(
        "SELECT status, retry_count FROM tasks WHERE job_id = $1 AND name = $2",
    )
    .bind(job_id)
    .bind(task_name)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| WindlassError::NotFound {
        kind: "task",
        id: format!("{job_id}/{task_name}"),
    })?;
    check(from, BackingOff)?;

    let retry_count = retry_count + 1;
    let next_retry_at = Utc::now()
        + chrono::Duration::from_std(policy.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));

    sqlx::query(
        "UPDATE tasks SET status = $1, retry_count = $2, next_retry_at = $3, \
         failure_message = $4, updated_at = $5 WHERE job_id = $6 AND name = $7",
    )
    .bind(BackingOff)
    .bind(retry_count)
    .bind(next_retry_at)
    .bind(reason)
    .bind(Utc::now())
    .bind(job_id)
    .bind(task_name)
    .execute(&mut *tx)
    .await?;

    events::emit(
        &mut tx,
        job_id,
        Some(task_name),
        events::TASK_STATE_CHANGE,
        Some(from),
        Some(BackingOff),
        reason,
    )
    .await?;
    tx.commit().await?;

    tracing::debug!(job_id = %job_id, task = %task_name, retry_count, next_retry_at = %next_retry_at, "task backing off");
    Ok(())
}

/// Enter `completed` with a failure message recorded on the task.
pub async fn complete_task_failure(
    job_id: &str,
    task_name: &str,
    failure: &str,
    store: &Store,
) -> Result<()> {
    validate_id("job id", job_id)?;
    validate_id("task name", task_name)?;

    let mut tx = store.begin().await?;
    let from: LifecycleState =
        sqlx::query_scalar("SELECT status FROM tasks WHERE job_id = $1 AND name = $2")
            .bind(job_id)
            .bind(task_name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| WindlassError::NotFound {
                kind: "task",
                id: format!("{job_id}/{task_name}"),
            })?;
    check(from, Completed)?;

    sqlx::query(
        "UPDATE tasks SET status = $1, failure_message = $2, updated_at = $3 \
         WHERE job_id = $4 AND name = $5",
    )
    .bind(Completed)
    .bind(failure)
    .bind(Utc::now())
    .bind(job_id)
    .bind(task_name)
    .execute(&mut *tx)
    .await?;

    events::emit(
        &mut tx,
        job_id,
        Some(task_name),
        events::TASK_STATE_CHANGE,
        Some(from),
        Some(Completed),
        failure,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Drive a task to `completed(failure)` from any non-terminal state through
/// FSM-legal hops, emitting an event per hop. Used by cancellation, where the
/// task may sit anywhere in the machine.
pub async fn force_task_failure(
    job_id: &str,
    task_name: &str,
    reason: &str,
    store: &Store,
) -> Result<()> {
    loop {
        let task = crate::job::Task::find(job_id, task_name, store).await?;
        match task.status {
            Completed => return Ok(()),
            Running | BackingOff => {
                return complete_task_failure(job_id, task_name, reason, store).await;
            }
            Pending | Scheduled => {
                transition_task(job_id, task_name, Ready, reason, store).await?;
            }
            Ready => transition_task(job_id, task_name, Running, reason, store).await?,
            Suspended | Paused => {
                transition_task(job_id, task_name, Running, reason, store).await?;
            }
        }
    }
}

// ============================================================================
// Job transitions
// ============================================================================

/// Move a job to `to`.
pub async fn transition_job(
    job_id: &str,
    to: LifecycleState,
    reason: &str,
    store: &Store,
) -> Result<()> {
    validate_id("job id", job_id)?;

    let mut tx = store.begin().await?;
    let from: LifecycleState = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WindlassError::NotFound {
            kind: "job",
            id: job_id.to_string(),
        })?;
    check(from, to)?;

    sqlx::query("UPDATE jobs SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4")
        .bind(to)
        .bind(Utc::now())
        .bind(job_id)
        .bind(from)
        .execute(&mut *tx)
        .await?;

    events::emit(
        &mut tx,
        job_id,
        None,
        events::JOB_STATE_CHANGE,
        Some(from),
        Some(to),
        reason,
    )
    .await?;
    tx.commit().await?;

    tracing::debug!(job_id = %job_id, from = %from, to = %to, reason = %reason, "job transition");
    Ok(())
}

/// Enter `completed` with the completion result and optional failure text.
pub async fn complete_job(
    job_id: &str,
    result: CompletionResult,
    failure: Option<&str>,
    store: &Store,
) -> Result<()> {
    validate_id("job id", job_id)?;

    let mut tx = store.begin().await?;
    let from: LifecycleState = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WindlassError::NotFound {
            kind: "job",
            id: job_id.to_string(),
        })?;
    check(from, Completed)?;

    sqlx::query(
        "UPDATE jobs SET status = $1, completion_result = $2, completion_failure = $3, \
         updated_at = $4 WHERE id = $5",
    )
    .bind(Completed)
    .bind(result)
    .bind(failure)
    .bind(Utc::now())
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    let reason = match result {
        CompletionResult::Success => "all tasks completed".to_string(),
        CompletionResult::Failure => failure.unwrap_or("job failed").to_string(),
    };
    events::emit(
        &mut tx,
        job_id,
        None,
        events::JOB_STATE_CHANGE,
        Some(from),
        Some(Completed),
        &reason,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{submit_job, Job, Task, TaskSpec};

    async fn seed(store: &Store) {
        let spec = TaskSpec::builder()
            .name("build")
            .agent_type("shell")
            .run_cmd("true")
            .build();
        submit_job("j1", "pipeline", None, &[spec], store).await.unwrap();
    }

    #[test]
    fn transition_table_is_exhaustive() {
        let states = [
            Pending, Scheduled, Ready, Running, Suspended, BackingOff, Paused, Completed,
        ];
        let allowed: Vec<(LifecycleState, LifecycleState)> = vec![
            (Pending, Ready),
            (Pending, Scheduled),
            (Scheduled, Ready),
            (Ready, Running),
            (Running, Suspended),
            (Running, BackingOff),
            (Running, Completed),
            (Suspended, Running),
            (Suspended, Pending),
            (BackingOff, Running),
            (BackingOff, Paused),
            (BackingOff, Completed),
            (Paused, Running),
        ];
        for from in states {
            for to in states {
                assert_eq!(
                    is_allowed(from, to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[tokio::test]
    async fn rejected_transition_leaves_state_unchanged() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;

        let err = transition_task("j1", "build", Completed, "skip ahead", &store)
            .await
            .unwrap_err();
        assert!(matches!(err, WindlassError::InvalidTransition { .. }));

        let task = Task::find("j1", "build", &store).await.unwrap();
        assert_eq!(task.status, Pending);
        // No event was recorded for the rejected transition.
        let events = events::list(Some("j1"), 10, &store).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn successful_transition_emits_event() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;

        transition_task("j1", "build", Ready, "dependencies satisfied", &store)
            .await
            .unwrap();
        transition_task("j1", "build", Running, "leased", &store)
            .await
            .unwrap();

        let events = events::list(Some("j1"), 10, &store).await.unwrap();
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].old_state.as_deref(), Some("ready"));
        assert_eq!(events[0].new_state.as_deref(), Some("running"));
    }

    #[tokio::test]
    async fn backoff_stamps_retry_fields() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;
        transition_task("j1", "build", Ready, "t", &store).await.unwrap();
        transition_task("j1", "build", Running, "t", &store).await.unwrap();

        let before = Utc::now();
        backoff_task("j1", "build", &RetryPolicy::default(), "agent timeout", &store)
            .await
            .unwrap();

        let task = Task::find("j1", "build", &store).await.unwrap();
        assert_eq!(task.status, BackingOff);
        assert_eq!(task.retry_count, 1);
        let next = task.next_retry_at.unwrap();
        assert!(next > before);
    }

    #[tokio::test]
    async fn complete_job_populates_completion_fields() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;
        transition_job("j1", Ready, "t", &store).await.unwrap();
        transition_job("j1", Running, "t", &store).await.unwrap();
        complete_job("j1", CompletionResult::Failure, Some("task build failed"), &store)
            .await
            .unwrap();

        let job = Job::find_by_id("j1", &store).await.unwrap();
        assert_eq!(job.status, Completed);
        assert_eq!(job.completion_result, Some(CompletionResult::Failure));
        assert_eq!(job.completion_failure.as_deref(), Some("task build failed"));
    }

    #[tokio::test]
    async fn force_failure_walks_legal_hops() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;

        force_task_failure("j1", "build", "cancelled", &store).await.unwrap();

        let task = Task::find("j1", "build", &store).await.unwrap();
        assert_eq!(task.status, Completed);
        assert_eq!(task.failure_message.as_deref(), Some("cancelled"));

        // Every emitted (old, new) pair is in the allowed set.
        for event in events::list(Some("j1"), 50, &store).await.unwrap() {
            let old: LifecycleState =
                serde_json::from_value(serde_json::Value::String(event.old_state.unwrap())).unwrap();
            let new: LifecycleState =
                serde_json::from_value(serde_json::Value::String(event.new_state.unwrap())).unwrap();
            assert!(is_allowed(old, new), "{old} -> {new}");
        }
    }
}
