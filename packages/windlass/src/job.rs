//! Job and task models.
//!
//! A job is one workflow instance; its tasks form a DAG through `needs`.
//! `(job_id, task_name, attempt)` is the invocation key that scopes the
//! journal. Models own their SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::error::{Result, WindlassError};
use crate::id::validate_id;
use crate::store::Store;

// ============================================================================
// Enums
// ============================================================================

/// The eight lifecycle states shared by jobs and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    #[default]
    Pending,
    Scheduled,
    Ready,
    Running,
    Suspended,
    BackingOff,
    Paused,
    Completed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Scheduled => "scheduled",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Suspended => "suspended",
            LifecycleState::BackingOff => "backing-off",
            LifecycleState::Paused => "paused",
            LifecycleState::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a completed job or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompletionResult {
    Success,
    Failure,
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    pub id: String,
    pub name: String,
    #[builder(default)]
    pub status: LifecycleState,
    #[builder(default = 0)]
    pub retry_count: i64,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completion_result: Option<CompletionResult>,
    #[builder(default, setter(strip_option))]
    pub completion_failure: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, name, status, retry_count, next_retry_at, scheduled_at, \
     completion_result, completion_failure, created_at, updated_at";

impl Job {
    pub async fn find_by_id(id: &str, store: &Store) -> Result<Self> {
        validate_id("job id", id)?;
        Self::find_optional(id, store)
            .await?
            .ok_or_else(|| WindlassError::NotFound {
                kind: "job",
                id: id.to_string(),
            })
    }

    pub async fn find_optional(id: &str, store: &Store) -> Result<Option<Self>> {
        validate_id("job id", id)?;
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
        Ok(job)
    }

    pub async fn list(limit: i64, store: &Store) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(store.pool())
        .await?;
        Ok(jobs)
    }

    pub async fn insert(&self, store: &Store) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, name, status, retry_count, next_retry_at, scheduled_at, \
             completion_result, completion_failure, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(self.status)
        .bind(self.retry_count)
        .bind(self.next_retry_at)
        .bind(self.scheduled_at)
        .bind(self.completion_result)
        .bind(&self.completion_failure)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Jobs whose scheduler work may be pending: anything not yet completed.
    pub async fn find_active(store: &Store) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status != 'completed' ORDER BY created_at ASC"
        ))
        .fetch_all(store.pool())
        .await?;
        Ok(jobs)
    }
}

// ============================================================================
// Task model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    #[builder(default = uuid::Uuid::new_v4().to_string())]
    pub id: String,
    pub job_id: String,
    pub name: String,
    #[builder(default = Json(Vec::new()))]
    pub needs: Json<Vec<String>>,
    pub agent_type: String,
    #[builder(default, setter(strip_option))]
    pub run_cmd: Option<String>,
    #[builder(default)]
    pub status: LifecycleState,
    #[builder(default = 1)]
    pub attempt: i64,
    #[builder(default = 0)]
    pub retry_count: i64,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub gate: Option<String>,
    #[builder(default, setter(strip_option))]
    pub var: Option<String>,
    #[builder(default, setter(strip_option))]
    pub output: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub failure_message: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const TASK_COLUMNS: &str = "id, job_id, name, needs, agent_type, run_cmd, status, attempt, \
     retry_count, next_retry_at, gate, var, output, failure_message, created_at, updated_at";

impl Task {
    /// The queue this task is dispatched on.
    pub fn queue_name(&self) -> String {
        format!("agent:{}", self.agent_type)
    }

    pub async fn find(job_id: &str, name: &str, store: &Store) -> Result<Self> {
        validate_id("job id", job_id)?;
        validate_id("task name", name)?;
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE job_id = $1 AND name = $2"
        ))
        .bind(job_id)
        .bind(name)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| WindlassError::NotFound {
            kind: "task",
            id: format!("{job_id}/{name}"),
        })
    }

    pub async fn list_for_job(job_id: &str, store: &Store) -> Result<Vec<Self>> {
        validate_id("job id", job_id)?;
        let tasks = sqlx::query_as::<_, Self>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE job_id = $1 ORDER BY created_at ASC"
        ))
        .bind(job_id)
        .fetch_all(store.pool())
        .await?;
        Ok(tasks)
    }

    pub async fn insert(&self, store: &Store) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, job_id, name, needs, agent_type, run_cmd, status, attempt, \
             retry_count, next_retry_at, gate, var, output, failure_message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(&self.id)
        .bind(&self.job_id)
        .bind(&self.name)
        .bind(&self.needs)
        .bind(&self.agent_type)
        .bind(&self.run_cmd)
        .bind(self.status)
        .bind(self.attempt)
        .bind(self.retry_count)
        .bind(self.next_retry_at)
        .bind(&self.gate)
        .bind(&self.var)
        .bind(&self.output)
        .bind(&self.failure_message)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Record the invocation's output. Kept outside the lifecycle FSM: the
    /// output belongs to the journal-completed invocation, the status flip
    /// happens through `lifecycle::transition_task`.
    pub async fn save_output(&self, output: &serde_json::Value, store: &Store) -> Result<()> {
        sqlx::query("UPDATE tasks SET output = $1, updated_at = $2 WHERE job_id = $3 AND name = $4")
            .bind(output)
            .bind(Utc::now())
            .bind(&self.job_id)
            .bind(&self.name)
            .execute(store.pool())
            .await?;
        Ok(())
    }
}

// ============================================================================
// Job submission
// ============================================================================

/// Declarative task in a job submission.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskSpec {
    pub name: String,
    #[builder(default)]
    pub needs: Vec<String>,
    pub agent_type: String,
    #[builder(default, setter(strip_option))]
    pub run_cmd: Option<String>,
    #[builder(default, setter(strip_option))]
    pub gate: Option<String>,
    #[builder(default, setter(strip_option))]
    pub var: Option<String>,
}

/// Create a job and its task DAG in one transaction.
///
/// Validates every identifier, rejects duplicate task names and `needs`
/// references to tasks that are not part of the job.
pub async fn submit_job(
    job_id: &str,
    name: &str,
    scheduled_at: Option<DateTime<Utc>>,
    tasks: &[TaskSpec],
    store: &Store,
) -> Result<Job> {
    validate_id("job id", job_id)?;
    validate_id("job name", name)?;
    if tasks.is_empty() {
        return Err(WindlassError::Validation(format!(
            "job {job_id} has no tasks"
        )));
    }

    let mut names = std::collections::HashSet::new();
    for spec in tasks {
        validate_id("task name", &spec.name)?;
        validate_id("agent type", &spec.agent_type)?;
        if let Some(var) = &spec.var {
            validate_id("var", var)?;
        }
        if !names.insert(spec.name.as_str()) {
            return Err(WindlassError::Validation(format!(
                "duplicate task name {} in job {job_id}",
                spec.name
            )));
        }
    }
    for spec in tasks {
        for dep in &spec.needs {
            if !names.contains(dep.as_str()) {
                return Err(WindlassError::Validation(format!(
                    "task {} needs unknown task {dep}",
                    spec.name
                )));
            }
            if dep == &spec.name {
                return Err(WindlassError::Validation(format!(
                    "task {} depends on itself",
                    spec.name
                )));
            }
        }
    }

    let status = if scheduled_at.is_some() {
        LifecycleState::Scheduled
    } else {
        LifecycleState::Pending
    };
    let now = Utc::now();
    let job = Job::builder()
        .id(job_id)
        .name(name)
        .status(status)
        .created_at(now)
        .updated_at(now)
        .build();
    let job = Job {
        scheduled_at,
        ..job
    };

    let mut tx = store.begin().await?;
    sqlx::query(
        "INSERT INTO jobs (id, name, status, retry_count, next_retry_at, scheduled_at, \
         completion_result, completion_failure, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(&job.id)
    .bind(&job.name)
    .bind(job.status)
    .bind(job.retry_count)
    .bind(job.next_retry_at)
    .bind(job.scheduled_at)
    .bind(job.completion_result)
    .bind(&job.completion_failure)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut *tx)
    .await?;

    for spec in tasks {
        let task = Task::builder()
            .job_id(job_id)
            .name(spec.name.clone())
            .needs(Json(spec.needs.clone()))
            .agent_type(spec.agent_type.clone())
            .created_at(now)
            .updated_at(now)
            .build();
        let task = Task {
            run_cmd: spec.run_cmd.clone(),
            gate: spec.gate.clone(),
            var: spec.var.clone(),
            ..task
        };
        sqlx::query(
            "INSERT INTO tasks (id, job_id, name, needs, agent_type, run_cmd, status, attempt, \
             retry_count, next_retry_at, gate, var, output, failure_message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(&task.id)
        .bind(&task.job_id)
        .bind(&task.name)
        .bind(&task.needs)
        .bind(&task.agent_type)
        .bind(&task.run_cmd)
        .bind(task.status)
        .bind(task.attempt)
        .bind(task.retry_count)
        .bind(task.next_retry_at)
        .bind(&task.gate)
        .bind(&task.var)
        .bind(&task.output)
        .bind(&task.failure_message)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(job_id = %job_id, tasks = tasks.len(), "job submitted");
    Ok(job)
}
