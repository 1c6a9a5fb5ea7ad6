//! Lifecycle audit events.
//!
//! Every successful FSM transition inserts one row here, in the same
//! transaction as the state change, so an external observer reading events
//! in insertion order sees a linearizable history per job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Sqlite, Transaction};

use crate::error::Result;
use crate::id::validate_id;
use crate::job::LifecycleState;
use crate::store::Store;

pub const JOB_STATE_CHANGE: &str = "job.StateChange";
pub const TASK_STATE_CHANGE: &str = "task.StateChange";
pub const JOB_RETRY: &str = "job.Retry";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub id: i64,
    pub job_id: String,
    pub task_name: Option<String>,
    pub event_type: String,
    pub old_state: Option<String>,
    pub new_state: Option<String>,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

/// Insert an event row inside an open transaction.
pub async fn emit(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    task_name: Option<&str>,
    event_type: &str,
    old_state: Option<LifecycleState>,
    new_state: Option<LifecycleState>,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (job_id, task_name, event_type, old_state, new_state, reason, ts) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(job_id)
    .bind(task_name)
    .bind(event_type)
    .bind(old_state.map(|s| s.as_str()))
    .bind(new_state.map(|s| s.as_str()))
    .bind(reason)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// List events, newest last, optionally filtered to one job.
pub async fn list(job_id: Option<&str>, limit: i64, store: &Store) -> Result<Vec<StateChangeEvent>> {
    let events = match job_id {
        Some(job_id) => {
            validate_id("job id", job_id)?;
            sqlx::query_as::<_, StateChangeEvent>(
                "SELECT id, job_id, task_name, event_type, old_state, new_state, reason, ts \
                 FROM events WHERE job_id = $1 ORDER BY id DESC LIMIT $2",
            )
            .bind(job_id)
            .bind(limit)
            .fetch_all(store.pool())
            .await?
        }
        None => {
            sqlx::query_as::<_, StateChangeEvent>(
                "SELECT id, job_id, task_name, event_type, old_state, new_state, reason, ts \
                 FROM events ORDER BY id DESC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(store.pool())
            .await?
        }
    };
    Ok(events)
}
