//! Per-invocation execution context.
//!
//! The context walks the journal with a cursor starting at entry 0. While the
//! cursor is inside the recorded tail the invocation is in replay mode: each
//! side-effectful call returns the recorded result (or re-raises the recorded
//! failure) without executing anything, after checking that the call site
//! matches the recorded `op_type` — a mismatch is non-determinism and fatal.
//! Past the tail the invocation is live: every call appends a pending entry,
//! performs the effect, then records the outcome.
//!
//! Suspension (`await_awakeable`, `sleep`) is journaled and then signalled
//! with `WindlassError::Suspended`; the invocation body unwinds and the
//! runner releases the lease. Nothing about the suspension lives on the
//! stack.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::awakeable::{self, AwakeableStatus};
use crate::error::{Result, SuspensionReason, WindlassError};
use crate::id::{generate_awakeable_id, parse_awakeable_id, validate_id};
use crate::job::LifecycleState;
use crate::journal::{self, JournalEntry, OpType};
use crate::lifecycle;
use crate::store::Store;

/// Execution context for one invocation attempt of `(job_id, task_name)`.
pub struct ExecutionContext {
    store: Store,
    job_id: String,
    task_name: String,
    attempt: i64,
    entries: Vec<JournalEntry>,
    cursor: usize,
    dispatcher: Option<crate::dispatch::Dispatcher>,
}

impl ExecutionContext {
    /// Build a context, loading the invocation's journal for replay.
    pub async fn create(
        job_id: &str,
        task_name: &str,
        attempt: i64,
        store: &Store,
    ) -> Result<Self> {
        validate_id("job id", job_id)?;
        validate_id("task name", task_name)?;
        let entries = journal::load(job_id, task_name, attempt, store).await?;
        Ok(Self {
            store: store.clone(),
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            attempt,
            entries,
            cursor: 0,
            dispatcher: None,
        })
    }

    /// Attach a dispatcher so `call` / `one_way_call` can route to entities.
    pub fn with_dispatcher(mut self, dispatcher: crate::dispatch::Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn attempt(&self) -> i64 {
        self.attempt
    }

    /// True while the cursor is inside the recorded journal tail.
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Pop the next recorded entry, enforcing the op type of the call site.
    fn next_recorded(&mut self, expected: OpType) -> Result<Option<JournalEntry>> {
        if self.cursor >= self.entries.len() {
            return Ok(None);
        }
        let entry = self.entries[self.cursor].clone();
        if entry.op_type != expected {
            return Err(WindlassError::NonDeterminism {
                index: entry.entry_index,
                expected: expected.to_string(),
                found: entry.op_type.to_string(),
            });
        }
        self.cursor += 1;
        Ok(Some(entry))
    }

    /// Move the owning task to `suspended`. Tolerates scopes with no task row
    /// (entity handler invocations journal under a synthetic name).
    async fn suspend_task(&self, reason: &str) -> Result<()> {
        match lifecycle::transition_task(
            &self.job_id,
            &self.task_name,
            LifecycleState::Suspended,
            reason,
            &self.store,
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(WindlassError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // ctx.run / ctx.call_agent
    // ========================================================================

    /// Execute an arbitrary side effect exactly once.
    ///
    /// Only the closure's result is replayed, not its computation, so the
    /// closure must be deterministic given the same inputs.
    pub async fn run<T, F, Fut>(&mut self, op_name: &str, effect: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        self.run_as(OpType::Run, op_name, effect).await
    }

    /// Like [`run`](Self::run) but journaled as a `call-agent` entry.
    pub async fn call_agent<T, F, Fut>(&mut self, op_name: &str, effect: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        self.run_as(OpType::CallAgent, op_name, effect).await
    }

    async fn run_as<T, F, Fut>(&mut self, op_type: OpType, op_name: &str, effect: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let entry = match self.next_recorded(op_type)? {
            Some(entry) if entry.is_completed() => {
                let output = entry.output.unwrap_or(Value::Null);
                return Ok(serde_json::from_value(output)?);
            }
            Some(entry) if entry.is_failed() => {
                return Err(recorded_failure(&entry));
            }
            // Crash between append and completion: resume by re-executing
            // into the existing row.
            Some(entry) => entry,
            None => {
                journal::append(
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    op_type,
                    op_name,
                    Some(&json!({ "name": op_name })),
                    &self.store,
                )
                .await?
            }
        };

        match effect().await {
            Ok(value) => {
                let output = serde_json::to_value(&value)?;
                let mut tx = self.store.begin().await?;
                journal::complete_in_tx(
                    &mut tx,
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    entry.entry_index,
                    Some(&output),
                )
                .await?;
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let failure = WindlassError::from_effect(err);
                let mut tx = self.store.begin().await?;
                journal::fail_in_tx(
                    &mut tx,
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    entry.entry_index,
                    failure.failure_code(),
                    &failure.to_string(),
                )
                .await?;
                tx.commit().await?;
                Err(failure)
            }
        }
    }

    // ========================================================================
    // ctx.sleep
    // ========================================================================

    /// Durable sleep. Journals the wake deadline; past deadlines return
    /// immediately (including on replay), otherwise the invocation suspends
    /// and the timer sweeper wakes the task.
    pub async fn sleep(&mut self, duration: std::time::Duration) -> Result<()> {
        let entry = match self.next_recorded(OpType::Sleep)? {
            Some(entry) if entry.is_completed() => return Ok(()),
            Some(entry) if entry.is_failed() => return Err(recorded_failure(&entry)),
            Some(entry) => entry,
            None => {
                let wake_at = Utc::now()
                    + chrono::Duration::from_std(duration)
                        .map_err(|e| WindlassError::Validation(format!("sleep duration: {e}")))?;
                journal::append(
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    OpType::Sleep,
                    "sleep",
                    Some(&json!({ "wake_at": wake_at })),
                    &self.store,
                )
                .await?
            }
        };

        let wake_at = sleep_deadline(&entry)?;
        if Utc::now() >= wake_at {
            let mut tx = self.store.begin().await?;
            journal::complete_in_tx(
                &mut tx,
                &self.job_id,
                &self.task_name,
                self.attempt,
                entry.entry_index,
                None,
            )
            .await?;
            tx.commit().await?;
            return Ok(());
        }

        let reason = SuspensionReason::Sleep {
            wake_at: wake_at.to_rfc3339(),
        };
        self.suspend_task(&reason.to_string()).await?;
        Err(WindlassError::Suspended(reason))
    }

    // ========================================================================
    // Awakeables
    // ========================================================================

    /// Create a durable promise tied to the next journal entry. Returns the
    /// externally resolvable id.
    pub async fn awakeable(&mut self, timeout: Option<std::time::Duration>) -> Result<String> {
        match self.next_recorded(OpType::AwakeableCreate)? {
            Some(entry) if entry.is_completed() => {
                let output = entry.output.unwrap_or(Value::Null);
                let id = output
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| WindlassError::Fatal("awakeable-create entry has no id".into()))?;
                return Ok(id.to_string());
            }
            Some(entry) => {
                // Crash between append and completion: the id is a pure
                // function of the entry, so re-derive and finish the row.
                let id = generate_awakeable_id(&self.job_id, entry.entry_index);
                let mut tx = self.store.begin().await?;
                awakeable::insert_if_missing_in_tx(
                    &mut tx,
                    &id,
                    &self.job_id,
                    &self.task_name,
                    entry.entry_index,
                    timeout_at(timeout),
                )
                .await?;
                journal::complete_in_tx(
                    &mut tx,
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    entry.entry_index,
                    Some(&json!({ "id": id })),
                )
                .await?;
                tx.commit().await?;
                return Ok(id);
            }
            None => {}
        }

        let timeout_at = timeout_at(timeout);
        let mut tx = self.store.begin().await?;
        let entry = journal::append_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            OpType::AwakeableCreate,
            "awakeable",
            Some(&json!({ "timeout_at": timeout_at })),
        )
        .await?;
        let id = generate_awakeable_id(&self.job_id, entry.entry_index);
        awakeable::insert_if_missing_in_tx(
            &mut tx,
            &id,
            &self.job_id,
            &self.task_name,
            entry.entry_index,
            timeout_at,
        )
        .await?;
        journal::complete_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            entry.entry_index,
            Some(&json!({ "id": id })),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(job_id = %self.job_id, task = %self.task_name, awakeable = %id, "awakeable created");
        Ok(id)
    }

    /// Await a durable promise. Suspends while the awakeable is PENDING;
    /// returns its payload once RESOLVED; raises the recorded failure for
    /// REJECTED / TIMEOUT / CANCELLED.
    pub async fn await_awakeable(&mut self, id: &str) -> Result<Value> {
        parse_awakeable_id(id)?;

        let entry = match self.next_recorded(OpType::AwakeableAwait)? {
            Some(entry) if entry.is_completed() => {
                return Ok(entry.output.unwrap_or(Value::Null));
            }
            Some(entry) if entry.is_failed() => return Err(recorded_failure(&entry)),
            Some(entry) => entry,
            None => {
                journal::append(
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    OpType::AwakeableAwait,
                    "await-awakeable",
                    Some(&json!({ "id": id })),
                    &self.store,
                )
                .await?
            }
        };

        // The awakeable row is the source of truth; the await entry completes
        // here, in the waiting invocation, once the row left PENDING.
        let row = awakeable::Awakeable::find_by_id(id, &self.store).await?;
        match row.status {
            AwakeableStatus::Resolved => {
                let payload = row.payload.unwrap_or(Value::Null);
                let mut tx = self.store.begin().await?;
                journal::complete_in_tx(
                    &mut tx,
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    entry.entry_index,
                    Some(&payload),
                )
                .await?;
                tx.commit().await?;
                Ok(payload)
            }
            AwakeableStatus::Rejected => {
                let message = row
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("awakeable rejected")
                    .to_string();
                self.fail_entry(entry.entry_index, "rejected", &message).await?;
                Err(WindlassError::Fatal(message))
            }
            AwakeableStatus::Timeout => {
                let message = format!("awakeable {id} timed out");
                self.fail_entry(entry.entry_index, "timeout", &message).await?;
                Err(WindlassError::Fatal(message))
            }
            AwakeableStatus::Cancelled => {
                let message = format!("awakeable {id} cancelled");
                self.fail_entry(entry.entry_index, "cancelled", &message).await?;
                Err(WindlassError::Fatal(message))
            }
            AwakeableStatus::Pending => {
                let reason = SuspensionReason::Awakeable { id: id.to_string() };
                self.suspend_task(&reason.to_string()).await?;
                Err(WindlassError::Suspended(reason))
            }
        }
    }

    async fn fail_entry(&self, entry_index: i64, code: &str, message: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        journal::fail_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            entry_index,
            code,
            message,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Object state ops
    // ========================================================================

    /// Journaled read of one object state field. Replay returns the value
    /// recorded at this index, not the current state — that is what keeps
    /// replay deterministic when concurrent writers change state afterward.
    pub async fn get_state(&mut self, entity: &str, key: &str, field: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.next_recorded(OpType::GetState)? {
            if entry.is_failed() {
                return Err(recorded_failure(&entry));
            }
            return Ok(match entry.output {
                Some(Value::Null) | None => None,
                Some(value) => Some(value),
            });
        }

        validate_id("entity name", entity)?;
        validate_id("object key", key)?;
        validate_id("state field", field)?;

        let mut tx = self.store.begin().await?;
        let value: Option<Value> = sqlx::query_scalar(
            "SELECT value FROM object_state WHERE entity_name = $1 AND object_key = $2 AND field = $3",
        )
        .bind(entity)
        .bind(key)
        .bind(field)
        .fetch_optional(&mut *tx)
        .await?;
        let entry = journal::append_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            OpType::GetState,
            field,
            Some(&json!({ "entity": entity, "key": key, "field": field })),
        )
        .await?;
        journal::complete_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            entry.entry_index,
            Some(value.as_ref().unwrap_or(&Value::Null)),
        )
        .await?;
        tx.commit().await?;
        Ok(value)
    }

    /// Journaled write of one object state field.
    pub async fn set_state(&mut self, entity: &str, key: &str, field: &str, value: Value) -> Result<()> {
        if let Some(entry) = self.next_recorded(OpType::SetState)? {
            if entry.is_failed() {
                return Err(recorded_failure(&entry));
            }
            return Ok(());
        }

        validate_id("entity name", entity)?;
        validate_id("object key", key)?;
        validate_id("state field", field)?;
        crate::id::validate_payload("object state", &value)?;

        let mut tx = self.store.begin().await?;
        sqlx::query(
            "INSERT INTO object_state (entity_name, object_key, field, value, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (entity_name, object_key, field) \
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(entity)
        .bind(key)
        .bind(field)
        .bind(&value)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        let entry = journal::append_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            OpType::SetState,
            field,
            Some(&json!({ "entity": entity, "key": key, "field": field, "value": value })),
        )
        .await?;
        journal::complete_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            entry.entry_index,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Journaled delete of one object state field.
    pub async fn clear_state(&mut self, entity: &str, key: &str, field: &str) -> Result<()> {
        if let Some(entry) = self.next_recorded(OpType::ClearState)? {
            if entry.is_failed() {
                return Err(recorded_failure(&entry));
            }
            return Ok(());
        }

        validate_id("entity name", entity)?;
        validate_id("object key", key)?;
        validate_id("state field", field)?;

        let mut tx = self.store.begin().await?;
        sqlx::query("DELETE FROM object_state WHERE entity_name = $1 AND object_key = $2 AND field = $3")
            .bind(entity)
            .bind(key)
            .bind(field)
            .execute(&mut *tx)
            .await?;
        let entry = journal::append_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            OpType::ClearState,
            field,
            Some(&json!({ "entity": entity, "key": key, "field": field })),
        )
        .await?;
        journal::complete_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            entry.entry_index,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Journaled delete of every state field of one object.
    pub async fn clear_all_state(&mut self, entity: &str, key: &str) -> Result<()> {
        if let Some(entry) = self.next_recorded(OpType::ClearAllState)? {
            if entry.is_failed() {
                return Err(recorded_failure(&entry));
            }
            return Ok(());
        }

        validate_id("entity name", entity)?;
        validate_id("object key", key)?;

        let mut tx = self.store.begin().await?;
        sqlx::query("DELETE FROM object_state WHERE entity_name = $1 AND object_key = $2")
            .bind(entity)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        let entry = journal::append_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            OpType::ClearAllState,
            "clear-all",
            Some(&json!({ "entity": entity, "key": key })),
        )
        .await?;
        journal::complete_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            entry.entry_index,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Inter-entity calls
    // ========================================================================

    /// Journaled request/response call to another entity handler. The callee
    /// runs under its own journal scope; on replay the recorded response is
    /// returned without re-executing the handler.
    pub async fn call(
        &mut self,
        entity: &str,
        handler: &str,
        key: Option<&str>,
        payload: Value,
    ) -> Result<Value> {
        let entry = match self.next_recorded(OpType::Call)? {
            Some(entry) if entry.is_completed() => {
                return Ok(entry.output.unwrap_or(Value::Null));
            }
            Some(entry) if entry.is_failed() => return Err(recorded_failure(&entry)),
            Some(entry) => entry,
            None => {
                journal::append(
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    OpType::Call,
                    handler,
                    Some(&json!({ "entity": entity, "handler": handler, "key": key, "payload": payload })),
                    &self.store,
                )
                .await?
            }
        };

        let dispatcher = self.dispatcher.clone().ok_or_else(|| {
            WindlassError::Fatal("ctx.call used without a dispatcher attached".into())
        })?;
        let scope = crate::dispatch::InvocationScope {
            job_id: self.job_id.clone(),
            task_name: format!("call-{entity}.{handler}-{}", entry.entry_index),
            attempt: self.attempt,
        };
        match dispatcher.dispatch(scope, entity, handler, key, payload).await {
            Ok(outcome) => {
                let output = serde_json::to_value(&outcome)?;
                let mut tx = self.store.begin().await?;
                journal::complete_in_tx(
                    &mut tx,
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    entry.entry_index,
                    Some(&output),
                )
                .await?;
                tx.commit().await?;
                Ok(output)
            }
            Err(err) => {
                self.fail_entry(entry.entry_index, err.failure_code(), &err.to_string())
                    .await?;
                Err(err)
            }
        }
    }

    /// Journaled fire-and-forget call. The entry completes as enqueued; the
    /// dispatch itself runs detached.
    pub async fn one_way_call(
        &mut self,
        entity: &str,
        handler: &str,
        key: Option<&str>,
        payload: Value,
    ) -> Result<()> {
        let entry = match self.next_recorded(OpType::OneWayCall)? {
            Some(entry) if entry.is_completed() => return Ok(()),
            Some(entry) if entry.is_failed() => return Err(recorded_failure(&entry)),
            Some(entry) => entry,
            None => {
                journal::append(
                    &self.job_id,
                    &self.task_name,
                    self.attempt,
                    OpType::OneWayCall,
                    handler,
                    Some(&json!({ "entity": entity, "handler": handler, "key": key, "payload": payload })),
                    &self.store,
                )
                .await?
            }
        };

        let dispatcher = self.dispatcher.clone().ok_or_else(|| {
            WindlassError::Fatal("ctx.one_way_call used without a dispatcher attached".into())
        })?;
        let scope = crate::dispatch::InvocationScope {
            job_id: self.job_id.clone(),
            task_name: format!("send-{entity}.{handler}-{}", entry.entry_index),
            attempt: self.attempt,
        };
        let entity = entity.to_string();
        let handler = handler.to_string();
        let key = key.map(str::to_string);
        tokio::spawn(async move {
            if let Err(e) = dispatcher
                .dispatch(scope, &entity, &handler, key.as_deref(), payload)
                .await
            {
                tracing::warn!(entity = %entity, handler = %handler, error = %e, "one-way call failed");
            }
        });

        let mut tx = self.store.begin().await?;
        journal::complete_in_tx(
            &mut tx,
            &self.job_id,
            &self.task_name,
            self.attempt,
            entry.entry_index,
            Some(&json!({ "enqueued": true })),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Translate a failed journal entry back into the error the original
/// execution observed.
fn recorded_failure(entry: &JournalEntry) -> WindlassError {
    let message = entry
        .failure_message
        .clone()
        .unwrap_or_else(|| format!("{} failed", entry.op_type));
    match entry.failure_code.as_deref() {
        Some("transient") => WindlassError::Transient(message),
        _ => WindlassError::Fatal(message),
    }
}

fn sleep_deadline(entry: &JournalEntry) -> Result<DateTime<Utc>> {
    entry
        .input
        .as_ref()
        .and_then(|input| input.get("wake_at"))
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
        .ok_or_else(|| WindlassError::Fatal("sleep entry has no wake_at".into()))
}

fn timeout_at(timeout: Option<std::time::Duration>) -> Option<DateTime<Utc>> {
    timeout.and_then(|d| chrono::Duration::from_std(d).ok().map(|d| Utc::now() + d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn ctx(store: &Store, attempt: i64) -> ExecutionContext {
        ExecutionContext::create("j1", "t1", attempt, store).await.unwrap()
    }

    #[tokio::test]
    async fn run_executes_once_and_replays_result() {
        let store = Store::in_memory().await.unwrap();
        let calls = AtomicU32::new(0);

        let mut first = ctx(&store, 1).await;
        let value: String = first
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("output-a".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "output-a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Fresh context over the same journal: replay, no re-execution.
        let mut replay = ctx(&store, 1).await;
        assert!(replay.is_replaying());
        let value: String = replay
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("different".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "output-a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_op_type_mismatch_is_non_determinism() {
        let store = Store::in_memory().await.unwrap();
        let mut first = ctx(&store, 1).await;
        let _: i32 = first.run("step", || async { Ok(1) }).await.unwrap();

        let mut replay = ctx(&store, 1).await;
        let err = replay.sleep(std::time::Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, WindlassError::NonDeterminism { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn failed_run_is_journaled_and_replayed_as_failure() {
        let store = Store::in_memory().await.unwrap();
        let mut first = ctx(&store, 1).await;
        let err = first
            .run::<String, _, _>("flaky", || async { Err(anyhow::anyhow!("connection reset")) })
            .await
            .unwrap_err();
        assert!(matches!(err, WindlassError::Transient(_)));

        let mut replay = ctx(&store, 1).await;
        let err = replay
            .run::<String, _, _>("flaky", || async { Ok("should not run".into()) })
            .await
            .unwrap_err();
        assert!(matches!(err, WindlassError::Transient(_)));
    }

    #[tokio::test]
    async fn elapsed_sleep_returns_immediately() {
        let store = Store::in_memory().await.unwrap();
        let mut c = ctx(&store, 1).await;
        c.sleep(std::time::Duration::ZERO).await.unwrap();

        // Replay also returns immediately.
        let mut replay = ctx(&store, 1).await;
        replay.sleep(std::time::Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn pending_sleep_suspends() {
        let store = Store::in_memory().await.unwrap();
        let mut c = ctx(&store, 1).await;
        let err = c.sleep(std::time::Duration::from_secs(3600)).await.unwrap_err();
        assert!(matches!(
            err,
            WindlassError::Suspended(SuspensionReason::Sleep { .. })
        ));

        // The suspension is a journaled fact.
        let entries = journal::load("j1", "t1", 1, &store).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].op_type, OpType::Sleep);
        assert!(entries[0].is_open());
    }

    #[tokio::test]
    async fn state_ops_replay_recorded_values() {
        let store = Store::in_memory().await.unwrap();
        let mut c = ctx(&store, 1).await;
        c.set_state("Cart", "user-1", "count", json!(3)).await.unwrap();
        let read = c.get_state("Cart", "user-1", "count").await.unwrap();
        assert_eq!(read, Some(json!(3)));

        // Another writer changes the state afterward.
        let mut other = ExecutionContext::create("j2", "w", 1, &store).await.unwrap();
        other.set_state("Cart", "user-1", "count", json!(99)).await.unwrap();

        // Replay of the first invocation still sees the recorded value.
        let mut replay = ctx(&store, 1).await;
        replay.set_state("Cart", "user-1", "count", json!(3)).await.unwrap();
        let read = replay.get_state("Cart", "user-1", "count").await.unwrap();
        assert_eq!(read, Some(json!(3)));
    }

    #[tokio::test]
    async fn clear_all_state_removes_every_field() {
        let store = Store::in_memory().await.unwrap();
        let mut c = ctx(&store, 1).await;
        c.set_state("Cart", "user-1", "a", json!(1)).await.unwrap();
        c.set_state("Cart", "user-1", "b", json!(2)).await.unwrap();
        c.clear_all_state("Cart", "user-1").await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM object_state WHERE entity_name = 'Cart' AND object_key = 'user-1'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 0);
    }
}
