//! Named task queues and the worker registry.
//!
//! Tasks reach workers through `task_queues` rows (default queue
//! `agent:<agent_type>`). A poll leases the oldest QUEUED row for the
//! requested queue in a single transaction that also enforces the worker's
//! slot cap. Leases stay alive through heartbeats; the reaper returns stale
//! leases to the queue and eventually unregisters dead workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::error::{Result, WindlassError};
use crate::id::{validate_id, validate_queue};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    Queued,
    Leased,
    Done,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub capabilities: Json<Vec<String>>,
    pub max_slots: i64,
    pub active_slots: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub job_id: String,
    pub task_name: String,
    pub queue_name: String,
    pub status: QueueStatus,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

const WORKER_COLUMNS: &str =
    "id, capabilities, max_slots, active_slots, last_heartbeat, registered_at";
const QUEUE_COLUMNS: &str =
    "job_id, task_name, queue_name, status, claimed_by, heartbeat_at, enqueued_at";

/// How many lease timeouts a worker may miss before it is unregistered.
const DEAD_WORKER_FACTOR: u32 = 10;

// ============================================================================
// Workers
// ============================================================================

/// Register (or re-register) a worker. Re-registration refreshes
/// capabilities, slot cap, and heartbeat but keeps `active_slots`.
pub async fn register_worker(
    id: &str,
    capabilities: &[String],
    max_slots: i64,
    store: &Store,
) -> Result<Worker> {
    validate_id("worker id", id)?;
    for queue in capabilities {
        validate_queue(queue)?;
    }
    if max_slots < 1 {
        return Err(WindlassError::Validation(format!(
            "worker {id} must have at least one slot"
        )));
    }

    let now = Utc::now();
    let worker = sqlx::query_as::<_, Worker>(&format!(
        "INSERT INTO workers (id, capabilities, max_slots, active_slots, last_heartbeat, registered_at) \
         VALUES ($1, $2, $3, 0, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET \
             capabilities = excluded.capabilities, \
             max_slots = excluded.max_slots, \
             last_heartbeat = excluded.last_heartbeat \
         RETURNING {WORKER_COLUMNS}"
    ))
    .bind(id)
    .bind(Json(capabilities.to_vec()))
    .bind(max_slots)
    .bind(now)
    .bind(now)
    .fetch_one(store.pool())
    .await?;

    tracing::info!(worker_id = %id, max_slots, capabilities = ?capabilities, "worker registered");
    Ok(worker)
}

pub async fn find_worker(id: &str, store: &Store) -> Result<Worker> {
    validate_id("worker id", id)?;
    sqlx::query_as::<_, Worker>(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"))
        .bind(id)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| WindlassError::NotFound {
            kind: "worker",
            id: id.to_string(),
        })
}

/// Refresh the worker's heartbeat and the heartbeats of its leased rows.
pub async fn heartbeat(worker_id: &str, store: &Store) -> Result<()> {
    validate_id("worker id", worker_id)?;
    let now = Utc::now();
    let mut tx = store.begin().await?;
    let updated = sqlx::query("UPDATE workers SET last_heartbeat = $1 WHERE id = $2")
        .bind(now)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(WindlassError::NotFound {
            kind: "worker",
            id: worker_id.to_string(),
        });
    }
    sqlx::query("UPDATE task_queues SET heartbeat_at = $1 WHERE claimed_by = $2 AND status = $3")
        .bind(now)
        .bind(worker_id)
        .bind(QueueStatus::Leased)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Queue operations
// ============================================================================

/// Enqueue a task. Idempotent on `(job_id, task_name)`: a QUEUED or LEASED
/// row is left alone; a DONE row is re-activated (retry / wake path).
/// Returns true when the task is now queued fresh.
pub async fn enqueue(job_id: &str, task_name: &str, queue: &str, store: &Store) -> Result<bool> {
    validate_id("job id", job_id)?;
    validate_id("task name", task_name)?;
    validate_queue(queue)?;

    let result = sqlx::query(
        "INSERT INTO task_queues (job_id, task_name, queue_name, status, enqueued_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (job_id, task_name) DO UPDATE SET \
             queue_name = excluded.queue_name, \
             status = excluded.status, \
             claimed_by = NULL, \
             heartbeat_at = NULL, \
             enqueued_at = excluded.enqueued_at \
         WHERE task_queues.status = 'DONE'",
    )
    .bind(job_id)
    .bind(task_name)
    .bind(queue)
    .bind(QueueStatus::Queued)
    .bind(Utc::now())
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Lease the oldest QUEUED task on `queue` for `worker_id`.
///
/// One transaction: the worker must be registered with a free slot; the row
/// flips to LEASED with claim metadata and the worker's `active_slots` is
/// incremented. Returns nothing when the queue is empty or the worker is
/// saturated (implicit backpressure).
pub async fn poll(worker_id: &str, queue: &str, store: &Store) -> Result<Option<QueuedTask>> {
    validate_id("worker id", worker_id)?;
    validate_queue(queue)?;

    let mut tx = store.begin().await?;
    let worker: Option<(i64, i64)> =
        sqlx::query_as("SELECT active_slots, max_slots FROM workers WHERE id = $1")
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await?;
    let (active_slots, max_slots) = worker.ok_or_else(|| WindlassError::NotFound {
        kind: "worker",
        id: worker_id.to_string(),
    })?;
    if active_slots >= max_slots {
        return Ok(None);
    }

    let now = Utc::now();
    let leased = sqlx::query_as::<_, QueuedTask>(&format!(
        "UPDATE task_queues SET status = $1, claimed_by = $2, heartbeat_at = $3 \
         WHERE (job_id, task_name) IN ( \
             SELECT job_id, task_name FROM task_queues \
             WHERE queue_name = $4 AND status = $5 AND claimed_by IS NULL \
             ORDER BY enqueued_at ASC LIMIT 1) \
         RETURNING {QUEUE_COLUMNS}"
    ))
    .bind(QueueStatus::Leased)
    .bind(worker_id)
    .bind(now)
    .bind(queue)
    .bind(QueueStatus::Queued)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(leased) = leased else {
        return Ok(None);
    };

    sqlx::query("UPDATE workers SET active_slots = active_slots + 1 WHERE id = $1")
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::debug!(worker_id = %worker_id, job_id = %leased.job_id, task = %leased.task_name, queue = %queue, "task leased");
    Ok(Some(leased))
}

/// Finish a lease: mark the row DONE and free the claimant's slot.
pub async fn release(job_id: &str, task_name: &str, store: &Store) -> Result<()> {
    validate_id("job id", job_id)?;
    validate_id("task name", task_name)?;

    let mut tx = store.begin().await?;
    let claimed_by: Option<Option<String>> = sqlx::query_scalar(
        "SELECT claimed_by FROM task_queues WHERE job_id = $1 AND task_name = $2 AND status = $3",
    )
    .bind(job_id)
    .bind(task_name)
    .bind(QueueStatus::Leased)
    .fetch_optional(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE task_queues SET status = $1, claimed_by = NULL, heartbeat_at = NULL \
         WHERE job_id = $2 AND task_name = $3",
    )
    .bind(QueueStatus::Done)
    .bind(job_id)
    .bind(task_name)
    .execute(&mut *tx)
    .await?;

    if let Some(Some(worker_id)) = claimed_by {
        sqlx::query("UPDATE workers SET active_slots = MAX(active_slots - 1, 0) WHERE id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Count of QUEUED rows on a queue.
pub async fn depth(queue: &str, store: &Store) -> Result<i64> {
    validate_queue(queue)?;
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM task_queues WHERE queue_name = $1 AND status = $2")
            .bind(queue)
            .bind(QueueStatus::Queued)
            .fetch_one(store.pool())
            .await?;
    Ok(count)
}

/// Return stale leases to the queue and drop consistently dead workers.
///
/// A LEASED row whose heartbeat is older than `timeout` goes back to QUEUED
/// with its claimant cleared and the claimant's slot freed. Workers silent
/// for `DEAD_WORKER_FACTOR` timeouts with no remaining leases are
/// unregistered.
pub async fn reap(timeout: std::time::Duration, store: &Store) -> Result<u64> {
    let now = Utc::now();
    let lease_cutoff = now
        - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(30));

    let stale = sqlx::query_as::<_, QueuedTask>(&format!(
        "SELECT {QUEUE_COLUMNS} FROM task_queues WHERE status = $1"
    ))
    .bind(QueueStatus::Leased)
    .fetch_all(store.pool())
    .await?;

    let mut reaped = 0u64;
    for row in stale {
        let expired = row.heartbeat_at.map(|t| t < lease_cutoff).unwrap_or(true);
        if !expired {
            continue;
        }
        let mut tx = store.begin().await?;
        let updated = sqlx::query(
            "UPDATE task_queues SET status = $1, claimed_by = NULL, heartbeat_at = NULL \
             WHERE job_id = $2 AND task_name = $3 AND status = $4",
        )
        .bind(QueueStatus::Queued)
        .bind(&row.job_id)
        .bind(&row.task_name)
        .bind(QueueStatus::Leased)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            continue;
        }
        if let Some(worker_id) = &row.claimed_by {
            sqlx::query("UPDATE workers SET active_slots = MAX(active_slots - 1, 0) WHERE id = $1")
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        reaped += 1;
        tracing::warn!(
            job_id = %row.job_id,
            task = %row.task_name,
            worker_id = ?row.claimed_by,
            "stale lease reaped"
        );
    }

    let worker_cutoff = now
        - chrono::Duration::from_std(timeout * DEAD_WORKER_FACTOR)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let dead = sqlx::query(
        "DELETE FROM workers WHERE last_heartbeat < $1 \
         AND id NOT IN (SELECT claimed_by FROM task_queues WHERE status = $2 AND claimed_by IS NOT NULL)",
    )
    .bind(worker_cutoff)
    .bind(QueueStatus::Leased)
    .execute(store.pool())
    .await?;
    if dead.rows_affected() > 0 {
        tracing::warn!(count = dead.rows_affected(), "dead workers unregistered");
    }

    Ok(reaped)
}

/// Drop every queue row of a job and free any slots its leases held. Part of
/// job cancellation.
pub async fn clear_for_job(job_id: &str, store: &Store) -> Result<()> {
    validate_id("job id", job_id)?;
    let mut tx = store.begin().await?;
    let claimants: Vec<String> = sqlx::query_scalar(
        "SELECT claimed_by FROM task_queues \
         WHERE job_id = $1 AND status = $2 AND claimed_by IS NOT NULL",
    )
    .bind(job_id)
    .bind(QueueStatus::Leased)
    .fetch_all(&mut *tx)
    .await?;
    for worker_id in claimants {
        sqlx::query("UPDATE workers SET active_slots = MAX(active_slots - 1, 0) WHERE id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM task_queues WHERE job_id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
