//! Durable external promises.
//!
//! An awakeable is created inside an invocation (tied to a journal entry) and
//! resolved from outside the engine — an operator, a webhook, another system.
//! The row survives restarts; the id encodes its origin invocation. Exactly
//! one transition out of PENDING is ever accepted; everything after that is
//! `NotPending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, Sqlite, Transaction};

use crate::error::{Result, WindlassError};
use crate::id::{parse_awakeable_id, validate_id, validate_payload};
use crate::job::LifecycleState;
use crate::journal::{self, OpType};
use crate::lifecycle;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AwakeableStatus {
    Pending,
    Resolved,
    Rejected,
    Timeout,
    Cancelled,
}

impl AwakeableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AwakeableStatus::Pending => "PENDING",
            AwakeableStatus::Resolved => "RESOLVED",
            AwakeableStatus::Rejected => "REJECTED",
            AwakeableStatus::Timeout => "TIMEOUT",
            AwakeableStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for AwakeableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Awakeable {
    pub id: String,
    pub job_id: String,
    pub task_name: String,
    pub entry_index: i64,
    pub status: AwakeableStatus,
    pub payload: Option<Value>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

const AWAKEABLE_COLUMNS: &str =
    "id, job_id, task_name, entry_index, status, payload, timeout_at, created_at, resolved_at";

impl Awakeable {
    pub async fn find_by_id(id: &str, store: &Store) -> Result<Self> {
        parse_awakeable_id(id)?;
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {AWAKEABLE_COLUMNS} FROM awakeables WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| WindlassError::NotFound {
            kind: "awakeable",
            id: id.to_string(),
        })
    }

    pub async fn list(job_id: Option<&str>, limit: i64, store: &Store) -> Result<Vec<Self>> {
        let rows = match job_id {
            Some(job_id) => {
                validate_id("job id", job_id)?;
                sqlx::query_as::<_, Self>(&format!(
                    "SELECT {AWAKEABLE_COLUMNS} FROM awakeables WHERE job_id = $1 \
                     ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(job_id)
                .bind(limit)
                .fetch_all(store.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Self>(&format!(
                    "SELECT {AWAKEABLE_COLUMNS} FROM awakeables ORDER BY created_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(store.pool())
                .await?
            }
        };
        Ok(rows)
    }
}

/// Insert the awakeable row for a journal entry, tolerating a crash-repeat.
pub(crate) async fn insert_if_missing_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    job_id: &str,
    task_name: &str,
    entry_index: i64,
    timeout_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO awakeables (id, job_id, task_name, entry_index, status, timeout_at, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(job_id)
    .bind(task_name)
    .bind(entry_index)
    .bind(AwakeableStatus::Pending)
    .bind(timeout_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Resolve a PENDING awakeable with a payload and wake the suspended task.
/// One transaction: status flip, payload, wake. Duplicate resolutions fail
/// with `NotPending` and leave the row untouched.
pub async fn resolve(id: &str, payload: Value, store: &Store) -> Result<Awakeable> {
    validate_payload("awakeable", &payload)?;
    terminate(id, AwakeableStatus::Resolved, Some(payload), "awakeable resolved", store).await
}

/// Reject a PENDING awakeable with an error string. The awaiting caller
/// observes a failure carrying this message on replay.
pub async fn reject(id: &str, error: &str, store: &Store) -> Result<Awakeable> {
    if error.trim().is_empty() {
        return Err(WindlassError::Validation(
            "reject requires a non-empty error".into(),
        ));
    }
    terminate(
        id,
        AwakeableStatus::Rejected,
        Some(serde_json::json!({ "error": error })),
        "awakeable rejected",
        store,
    )
    .await
}

async fn terminate(
    id: &str,
    status: AwakeableStatus,
    payload: Option<Value>,
    reason: &str,
    store: &Store,
) -> Result<Awakeable> {
    parse_awakeable_id(id)?;

    let mut tx = store.begin().await?;
    let row = sqlx::query_as::<_, Awakeable>(&format!(
        "SELECT {AWAKEABLE_COLUMNS} FROM awakeables WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| WindlassError::NotFound {
        kind: "awakeable",
        id: id.to_string(),
    })?;

    if row.status != AwakeableStatus::Pending {
        return Err(WindlassError::NotPending {
            id: id.to_string(),
            status: row.status.to_string(),
        });
    }

    sqlx::query(
        "UPDATE awakeables SET status = $1, payload = $2, resolved_at = $3 \
         WHERE id = $4 AND status = $5",
    )
    .bind(status)
    .bind(&payload)
    .bind(Utc::now())
    .bind(id)
    .bind(AwakeableStatus::Pending)
    .execute(&mut *tx)
    .await?;

    wake_task_in_tx(&mut tx, &row.job_id, &row.task_name, reason).await?;
    tx.commit().await?;

    tracing::info!(awakeable = %id, status = %status, job_id = %row.job_id, task = %row.task_name, "awakeable terminated");
    Awakeable::find_by_id(id, store).await
}

/// Wake a suspended task back to `pending` so the scheduler re-enqueues it.
/// No-op when the task is not suspended (the invocation is still running and
/// will observe the row directly) or has no row (synthetic scope).
async fn wake_task_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    task_name: &str,
    reason: &str,
) -> Result<()> {
    let status: Option<LifecycleState> =
        sqlx::query_scalar("SELECT status FROM tasks WHERE job_id = $1 AND name = $2")
            .bind(job_id)
            .bind(task_name)
            .fetch_optional(&mut **tx)
            .await?;
    if status == Some(LifecycleState::Suspended) {
        lifecycle::transition_task_in_tx(tx, job_id, task_name, LifecycleState::Pending, reason)
            .await?;
    }
    Ok(())
}

/// Outcome of one timer sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: u64,
    pub sleeps_woken: u64,
}

/// The single timer pass: expire PENDING awakeables whose `timeout_at` has
/// passed, and wake suspended tasks whose durable sleep deadline is due. Both
/// the periodic server service and the CLI `timeout check` call this.
pub async fn sweep_timers(store: &Store) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let now = Utc::now();

    // Awakeable timeouts. Candidates are filtered in Rust so the deadline
    // comparison is on parsed timestamps, not TEXT collation.
    let candidates = sqlx::query_as::<_, Awakeable>(&format!(
        "SELECT {AWAKEABLE_COLUMNS} FROM awakeables \
         WHERE status = $1 AND timeout_at IS NOT NULL"
    ))
    .bind(AwakeableStatus::Pending)
    .fetch_all(store.pool())
    .await?;

    for row in candidates {
        let due = row.timeout_at.map(|t| t <= now).unwrap_or(false);
        if !due {
            continue;
        }
        let mut tx = store.begin().await?;
        let updated = sqlx::query(
            "UPDATE awakeables SET status = $1, resolved_at = $2 WHERE id = $3 AND status = $4",
        )
        .bind(AwakeableStatus::Timeout)
        .bind(now)
        .bind(&row.id)
        .bind(AwakeableStatus::Pending)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            // Raced with a resolver; the terminal transition already happened.
            continue;
        }
        wake_task_in_tx(&mut tx, &row.job_id, &row.task_name, "awakeable timed out").await?;
        tx.commit().await?;
        report.timed_out += 1;
        tracing::info!(awakeable = %row.id, job_id = %row.job_id, "awakeable timed out");
    }

    // Due sleeps: open sleep entries of suspended tasks at their current
    // attempt.
    let sleeping = sqlx::query_as::<_, crate::journal::JournalEntry>(
        "SELECT j.job_id, j.task_name, j.attempt, j.entry_index, j.op_type, j.op_name, j.flags, \
                j.input, j.output, j.failure_code, j.failure_message, j.created_at, j.completed_at \
         FROM journal j \
         JOIN tasks t ON t.job_id = j.job_id AND t.name = j.task_name AND t.attempt = j.attempt \
         WHERE t.status = $1 AND j.op_type = $2 AND j.flags & $3 = 0 AND j.flags & $4 = 0",
    )
    .bind(LifecycleState::Suspended)
    .bind(OpType::Sleep)
    .bind(crate::journal::flags::COMPLETED)
    .bind(crate::journal::flags::FAILED)
    .fetch_all(store.pool())
    .await?;

    for entry in sleeping {
        let wake_at = entry
            .input
            .as_ref()
            .and_then(|input| input.get("wake_at"))
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
        let due = wake_at.map(|t| t <= now).unwrap_or(false);
        if !due {
            continue;
        }
        let mut tx = store.begin().await?;
        journal::complete_in_tx(
            &mut tx,
            &entry.job_id,
            &entry.task_name,
            entry.attempt,
            entry.entry_index,
            None,
        )
        .await?;
        wake_task_in_tx(&mut tx, &entry.job_id, &entry.task_name, "sleep elapsed").await?;
        tx.commit().await?;
        report.sleeps_woken += 1;
        tracing::info!(job_id = %entry.job_id, task = %entry.task_name, "sleep elapsed, task woken");
    }

    Ok(report)
}

/// Cancel every non-terminal awakeable of a job, so late resolvers cannot
/// silently mutate orphaned promises. Part of job cancellation/completion.
pub async fn cancel_for_job(job_id: &str, store: &Store) -> Result<u64> {
    validate_id("job id", job_id)?;
    let result = sqlx::query(
        "UPDATE awakeables SET status = $1, resolved_at = $2 WHERE job_id = $3 AND status = $4",
    )
    .bind(AwakeableStatus::Cancelled)
    .bind(Utc::now())
    .bind(job_id)
    .bind(AwakeableStatus::Pending)
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected())
}
