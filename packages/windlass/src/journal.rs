//! Append-only journal of side-effectful operations.
//!
//! Scope is the invocation key `(job_id, task_name, attempt)`; `entry_index`
//! is allocated inside a transaction that reads the current maximum and
//! inserts the new row, so indices are sequential with no gaps even across
//! workers. Rows are never updated except to record completion or failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Sqlite, Transaction};

use crate::error::{Result, WindlassError};
use crate::id::{validate_id, validate_payload};
use crate::store::Store;

// ============================================================================
// Op types and flags
// ============================================================================

/// Journaled operation kinds. The op type recorded at a given index is
/// immutable; a replay-time mismatch is non-determinism, fatal to the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum OpType {
    Run,
    CallAgent,
    AwakeableCreate,
    AwakeableAwait,
    Sleep,
    GetState,
    SetState,
    ClearState,
    ClearAllState,
    Call,
    OneWayCall,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Run => "run",
            OpType::CallAgent => "call-agent",
            OpType::AwakeableCreate => "awakeable-create",
            OpType::AwakeableAwait => "awakeable-await",
            OpType::Sleep => "sleep",
            OpType::GetState => "get-state",
            OpType::SetState => "set-state",
            OpType::ClearState => "clear-state",
            OpType::ClearAllState => "clear-all-state",
            OpType::Call => "call",
            OpType::OneWayCall => "one-way-call",
        }
    }

    /// Base flag bits for a fresh entry of this op type.
    pub fn base_flags(&self) -> i64 {
        match self {
            OpType::Run | OpType::CallAgent | OpType::AwakeableAwait | OpType::Call => {
                flags::COMPLETABLE | flags::FALLIBLE
            }
            OpType::AwakeableCreate
            | OpType::Sleep
            | OpType::GetState
            | OpType::SetState
            | OpType::ClearState
            | OpType::ClearAllState
            | OpType::OneWayCall => flags::COMPLETABLE,
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flag bits on a journal entry.
pub mod flags {
    pub const COMPLETABLE: i64 = 1 << 0;
    pub const FALLIBLE: i64 = 1 << 1;
    pub const COMPLETED: i64 = 1 << 2;
    pub const FAILED: i64 = 1 << 3;
}

// ============================================================================
// Entry model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub job_id: String,
    pub task_name: String,
    pub attempt: i64,
    pub entry_index: i64,
    pub op_type: OpType,
    pub op_name: String,
    pub flags: i64,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    pub fn is_completed(&self) -> bool {
        self.flags & flags::COMPLETED != 0
    }

    pub fn is_failed(&self) -> bool {
        self.flags & flags::FAILED != 0
    }

    /// Neither completed nor failed: the effect was started (or is awaited)
    /// but its result has not been recorded.
    pub fn is_open(&self) -> bool {
        !self.is_completed() && !self.is_failed()
    }
}

const ENTRY_COLUMNS: &str = "job_id, task_name, attempt, entry_index, op_type, op_name, flags, \
     input, output, failure_code, failure_message, created_at, completed_at";

/// Append a new entry inside an open transaction, allocating the next
/// `entry_index` atomically. Returns the inserted row.
pub async fn append_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    task_name: &str,
    attempt: i64,
    op_type: OpType,
    op_name: &str,
    input: Option<&serde_json::Value>,
) -> Result<JournalEntry> {
    if let Some(input) = input {
        validate_payload("journal input", input)?;
    }
    let entry = sqlx::query_as::<_, JournalEntry>(&format!(
        "INSERT INTO journal (job_id, task_name, attempt, entry_index, op_type, op_name, flags, input, created_at) \
         VALUES ($1, $2, $3, \
             COALESCE((SELECT MAX(entry_index) + 1 FROM journal \
                       WHERE job_id = $1 AND task_name = $2 AND attempt = $3), 0), \
             $4, $5, $6, $7, $8) \
         RETURNING {ENTRY_COLUMNS}"
    ))
    .bind(job_id)
    .bind(task_name)
    .bind(attempt)
    .bind(op_type)
    .bind(op_name)
    .bind(op_type.base_flags())
    .bind(input)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(entry)
}

/// Append as a standalone transaction.
pub async fn append(
    job_id: &str,
    task_name: &str,
    attempt: i64,
    op_type: OpType,
    op_name: &str,
    input: Option<&serde_json::Value>,
    store: &Store,
) -> Result<JournalEntry> {
    validate_id("job id", job_id)?;
    validate_id("task name", task_name)?;
    let mut tx = store.begin().await?;
    let entry = append_in_tx(&mut tx, job_id, task_name, attempt, op_type, op_name, input).await?;
    tx.commit().await?;
    Ok(entry)
}

/// Mark an entry completed with its output.
pub async fn complete_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    task_name: &str,
    attempt: i64,
    entry_index: i64,
    output: Option<&serde_json::Value>,
) -> Result<()> {
    if let Some(output) = output {
        validate_payload("journal output", output)?;
    }
    let result = sqlx::query(
        "UPDATE journal SET output = $1, flags = flags | $2, completed_at = $3 \
         WHERE job_id = $4 AND task_name = $5 AND attempt = $6 AND entry_index = $7",
    )
    .bind(output)
    .bind(flags::COMPLETED)
    .bind(Utc::now())
    .bind(job_id)
    .bind(task_name)
    .bind(attempt)
    .bind(entry_index)
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(WindlassError::NotFound {
            kind: "journal entry",
            id: format!("{job_id}/{task_name}#{attempt}@{entry_index}"),
        });
    }
    Ok(())
}

/// Mark an entry failed with a code and message.
pub async fn fail_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    task_name: &str,
    attempt: i64,
    entry_index: i64,
    failure_code: &str,
    failure_message: &str,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE journal SET failure_code = $1, failure_message = $2, flags = flags | $3, \
         completed_at = $4 \
         WHERE job_id = $5 AND task_name = $6 AND attempt = $7 AND entry_index = $8",
    )
    .bind(failure_code)
    .bind(failure_message)
    .bind(flags::FAILED)
    .bind(Utc::now())
    .bind(job_id)
    .bind(task_name)
    .bind(attempt)
    .bind(entry_index)
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(WindlassError::NotFound {
            kind: "journal entry",
            id: format!("{job_id}/{task_name}#{attempt}@{entry_index}"),
        });
    }
    Ok(())
}

/// Load the journal for one invocation, ordered by entry index.
pub async fn load(
    job_id: &str,
    task_name: &str,
    attempt: i64,
    store: &Store,
) -> Result<Vec<JournalEntry>> {
    validate_id("job id", job_id)?;
    validate_id("task name", task_name)?;
    let entries = sqlx::query_as::<_, JournalEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal \
         WHERE job_id = $1 AND task_name = $2 AND attempt = $3 ORDER BY entry_index ASC"
    ))
    .bind(job_id)
    .bind(task_name)
    .bind(attempt)
    .fetch_all(store.pool())
    .await?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entry_indices_are_sequential_from_zero() {
        let store = Store::in_memory().await.unwrap();
        for expected in 0..5 {
            let entry = append("j1", "t1", 1, OpType::Run, "step", None, &store)
                .await
                .unwrap();
            assert_eq!(entry.entry_index, expected);
        }
        // A different attempt is a fresh replay space.
        let entry = append("j1", "t1", 2, OpType::Run, "step", None, &store)
            .await
            .unwrap();
        assert_eq!(entry.entry_index, 0);

        let entries = load("j1", "t1", 1, &store).await.unwrap();
        let indices: Vec<i64> = entries.iter().map(|e| e.entry_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn complete_and_fail_set_flag_bits() {
        let store = Store::in_memory().await.unwrap();
        let run = append("j1", "t1", 1, OpType::Run, "step", None, &store)
            .await
            .unwrap();
        assert!(run.is_open());
        assert_eq!(run.flags, flags::COMPLETABLE | flags::FALLIBLE);

        let mut tx = store.begin().await.unwrap();
        complete_in_tx(&mut tx, "j1", "t1", 1, run.entry_index, Some(&serde_json::json!("ok")))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let sleep = append("j1", "t1", 1, OpType::Sleep, "sleep", None, &store)
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        fail_in_tx(&mut tx, "j1", "t1", 1, sleep.entry_index, "timeout", "slept past deadline")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let entries = load("j1", "t1", 1, &store).await.unwrap();
        assert!(entries[0].is_completed());
        assert!(!entries[0].is_failed());
        assert_eq!(entries[0].output, Some(serde_json::json!("ok")));
        assert!(entries[1].is_failed());
        assert_eq!(entries[1].failure_code.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn completing_a_missing_entry_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let err = complete_in_tx(&mut tx, "j1", "t1", 1, 9, None).await.unwrap_err();
        assert!(matches!(err, WindlassError::NotFound { .. }));
    }

    #[tokio::test]
    async fn op_type_kebab_case_round_trip() {
        let store = Store::in_memory().await.unwrap();
        append("j1", "t1", 1, OpType::AwakeableCreate, "awakeable", None, &store)
            .await
            .unwrap();
        let raw: String = sqlx::query_scalar(
            "SELECT op_type FROM journal WHERE job_id = 'j1' AND entry_index = 0",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(raw, "awakeable-create");

        let entries = load("j1", "t1", 1, &store).await.unwrap();
        assert_eq!(entries[0].op_type, OpType::AwakeableCreate);
    }

    #[tokio::test]
    async fn oversize_input_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        let big = serde_json::Value::String("x".repeat(crate::id::MAX_PAYLOAD_BYTES + 1));
        let err = append("j1", "t1", 1, OpType::Run, "step", Some(&big), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, WindlassError::Validation(_)));
        assert!(load("j1", "t1", 1, &store).await.unwrap().is_empty());
    }
}
