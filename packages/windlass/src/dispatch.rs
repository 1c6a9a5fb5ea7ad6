//! Entity dispatch: services, virtual objects, workflows.
//!
//! Handlers are async closures registered in-process; entity metadata (name,
//! kind, handler access modes) is persisted so operators can inspect what is
//! deployed. Routing rules:
//!
//! - **Service** — stateless, every invocation executes immediately.
//! - **Virtual object** — keyed. Writes hold the `(entity, object_key)` row
//!   lock; a contested write returns `{acquired: false, holder}` without
//!   executing. Reads take no lock.
//! - **Workflow** — keyed by `workflow_id`. The `run` handler body executes
//!   at most once per key; later `run` calls get the cached result. `signal`
//!   handlers pass through.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::types::Json;

use crate::context::ExecutionContext;
use crate::error::{Result, WindlassError};
use crate::id::{validate_id, validate_payload};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Service,
    VirtualObject,
    Workflow,
}

/// Access mode of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerMode {
    /// Virtual object read: concurrent, lock-free.
    Read,
    /// Virtual object write: single writer per key.
    Write,
    /// Workflow run body: at most once per workflow id.
    Run,
    /// Workflow signal: permitted during and after the run.
    Signal,
}

/// Journal scope a dispatched handler executes under.
#[derive(Debug, Clone)]
pub struct InvocationScope {
    pub job_id: String,
    pub task_name: String,
    pub attempt: i64,
}

impl InvocationScope {
    /// Lock-holder id. Deterministic per attempt so a crash-replay of the
    /// same attempt re-enters its own lock.
    pub fn holder_id(&self) -> String {
        format!("{}/{}#{}", self.job_id, self.task_name, self.attempt)
    }

    fn holder_prefix(holder: &str) -> &str {
        holder.rsplit_once('#').map(|(p, _)| p).unwrap_or(holder)
    }
}

/// Context handed to entity handlers: the journaled execution context plus
/// the entity/key binding for state ops.
pub struct HandlerContext {
    pub exec: ExecutionContext,
    pub entity: String,
    pub key: Option<String>,
}

impl HandlerContext {
    fn key(&self) -> Result<&str> {
        self.key.as_deref().ok_or_else(|| {
            WindlassError::Validation(format!("entity {} requires a key", self.entity))
        })
    }

    pub async fn get(&mut self, field: &str) -> Result<Option<Value>> {
        let entity = self.entity.clone();
        let key = self.key()?.to_string();
        self.exec.get_state(&entity, &key, field).await
    }

    pub async fn set(&mut self, field: &str, value: Value) -> Result<()> {
        let entity = self.entity.clone();
        let key = self.key()?.to_string();
        self.exec.set_state(&entity, &key, field, value).await
    }

    pub async fn clear(&mut self, field: &str) -> Result<()> {
        let entity = self.entity.clone();
        let key = self.key()?.to_string();
        self.exec.clear_state(&entity, &key, field).await
    }

    pub async fn clear_all(&mut self) -> Result<()> {
        let entity = self.entity.clone();
        let key = self.key()?.to_string();
        self.exec.clear_all_state(&entity, &key).await
    }
}

type HandlerFn = Arc<
    dyn Fn(HandlerContext, Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>
        + Send
        + Sync,
>;

struct HandlerRegistration {
    mode: HandlerMode,
    func: HandlerFn,
}

struct EntityRegistration {
    kind: EntityKind,
    handlers: HashMap<String, HandlerRegistration>,
}

/// Declarative entity definition, consumed by [`Dispatcher::register`].
pub struct EntityDef {
    name: String,
    kind: EntityKind,
    handlers: HashMap<String, HandlerRegistration>,
}

impl EntityDef {
    pub fn service(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntityKind::Service,
            handlers: HashMap::new(),
        }
    }

    pub fn virtual_object(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntityKind::VirtualObject,
            handlers: HashMap::new(),
        }
    }

    pub fn workflow(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntityKind::Workflow,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler with an explicit access mode. The handler owns its
    /// context for the duration of the invocation.
    pub fn handler<F, Fut>(mut self, name: &str, mode: HandlerMode, func: F) -> Self
    where
        F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let func = Arc::new(func);
        let boxed: HandlerFn = Arc::new(move |ctx, payload| {
            let func = Arc::clone(&func);
            Box::pin(async move { func(ctx, payload).await })
        });
        self.handlers.insert(
            name.to_string(),
            HandlerRegistration { mode, func: boxed },
        );
        self
    }
}

/// Routes invocations to registered entity handlers. Cheap to clone; the
/// handler registry is shared.
#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    entities: Arc<DashMap<String, EntityRegistration>>,
}

impl Dispatcher {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            entities: Arc::new(DashMap::new()),
        }
    }

    /// Register an entity: persists its metadata and installs the handlers.
    pub async fn register(&self, def: EntityDef) -> Result<()> {
        validate_id("entity name", &def.name)?;
        for (handler_name, registration) in &def.handlers {
            validate_id("handler name", handler_name)?;
            let valid = match def.kind {
                EntityKind::Service => {
                    matches!(registration.mode, HandlerMode::Read | HandlerMode::Write)
                }
                EntityKind::VirtualObject => {
                    matches!(registration.mode, HandlerMode::Read | HandlerMode::Write)
                }
                EntityKind::Workflow => {
                    matches!(registration.mode, HandlerMode::Run | HandlerMode::Signal)
                }
            };
            if !valid {
                return Err(WindlassError::Validation(format!(
                    "handler {handler_name} mode is not valid for entity kind"
                )));
            }
        }

        let modes: HashMap<&str, HandlerMode> = def
            .handlers
            .iter()
            .map(|(name, registration)| (name.as_str(), registration.mode))
            .collect();
        sqlx::query(
            "INSERT INTO entities (name, entity_type, handlers, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (name) DO UPDATE SET \
                 entity_type = excluded.entity_type, handlers = excluded.handlers",
        )
        .bind(&def.name)
        .bind(def.kind)
        .bind(Json(&modes))
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;

        self.entities.insert(
            def.name.clone(),
            EntityRegistration {
                kind: def.kind,
                handlers: def.handlers,
            },
        );
        tracing::info!(entity = %def.name, kind = ?def.kind, "entity registered");
        Ok(())
    }

    /// Route one invocation. The returned value is shaped per entity kind:
    /// services and reads return the handler value; writes return
    /// `{acquired, holder?, result?}`; workflow runs return
    /// `{status, result}`.
    pub async fn dispatch(
        &self,
        scope: InvocationScope,
        entity: &str,
        handler: &str,
        key: Option<&str>,
        payload: Value,
    ) -> Result<Value> {
        validate_id("entity name", entity)?;
        validate_id("handler name", handler)?;
        if let Some(key) = key {
            validate_id("object key", key)?;
        }
        validate_payload("dispatch", &payload)?;

        let (kind, mode, func) = {
            let registration = self.entities.get(entity).ok_or_else(|| WindlassError::NotFound {
                kind: "entity",
                id: entity.to_string(),
            })?;
            let handler_registration =
                registration
                    .handlers
                    .get(handler)
                    .ok_or_else(|| WindlassError::NotFound {
                        kind: "handler",
                        id: format!("{entity}/{handler}"),
                    })?;
            (
                registration.kind,
                handler_registration.mode,
                Arc::clone(&handler_registration.func),
            )
        };

        match kind {
            EntityKind::Service => self.invoke(scope, entity, None, func, payload).await,
            EntityKind::VirtualObject => {
                let key = key.ok_or_else(|| {
                    WindlassError::Validation(format!("virtual object {entity} requires a key"))
                })?;
                match mode {
                    HandlerMode::Write => {
                        self.dispatch_write(scope, entity, key, func, payload).await
                    }
                    _ => self.invoke(scope, entity, Some(key), func, payload).await,
                }
            }
            EntityKind::Workflow => {
                let key = key.ok_or_else(|| {
                    WindlassError::Validation(format!("workflow {entity} requires a workflow id"))
                })?;
                match mode {
                    HandlerMode::Run => self.dispatch_run(scope, entity, key, func, payload).await,
                    _ => self.invoke(scope, entity, Some(key), func, payload).await,
                }
            }
        }
    }

    async fn invoke(
        &self,
        scope: InvocationScope,
        entity: &str,
        key: Option<&str>,
        func: HandlerFn,
        payload: Value,
    ) -> Result<Value> {
        let exec = ExecutionContext::create(
            &scope.job_id,
            &scope.task_name,
            scope.attempt,
            &self.store,
        )
        .await?
        .with_dispatcher(self.clone());
        let ctx = HandlerContext {
            exec,
            entity: entity.to_string(),
            key: key.map(str::to_string),
        };
        func(ctx, payload).await.map_err(WindlassError::from_effect)
    }

    /// Keyed write: acquire the row lock, execute, release on every exit
    /// path. A contested write returns synchronously with the holder.
    async fn dispatch_write(
        &self,
        scope: InvocationScope,
        entity: &str,
        key: &str,
        func: HandlerFn,
        payload: Value,
    ) -> Result<Value> {
        let holder = scope.holder_id();
        if let Some(current) = self.try_acquire_lock(entity, key, &holder).await? {
            tracing::debug!(entity = %entity, key = %key, holder = %current, "write lock contested");
            return Ok(json!({ "acquired": false, "holder": current }));
        }

        let result = self.invoke(scope, entity, Some(key), func, payload).await;
        // Release is mandatory, including on handler failure.
        self.release_lock(entity, key, &holder).await?;

        match result {
            Ok(value) => Ok(json!({ "acquired": true, "result": value })),
            Err(err) => Err(err),
        }
    }

    /// Acquire the `(entity, key)` write lock for `holder`. Returns the
    /// current holder when contested. A holder from a prior attempt of the
    /// same invocation is taken over rather than deadlocking the key.
    async fn try_acquire_lock(
        &self,
        entity: &str,
        key: &str,
        holder: &str,
    ) -> Result<Option<String>> {
        let mut tx = self.store.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO object_locks (entity_name, object_key, holder, acquired_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (entity_name, object_key) DO NOTHING",
        )
        .bind(entity)
        .bind(key)
        .bind(holder)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(None);
        }

        let current: String = sqlx::query_scalar(
            "SELECT holder FROM object_locks WHERE entity_name = $1 AND object_key = $2",
        )
        .bind(entity)
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        if current == holder
            || InvocationScope::holder_prefix(&current) == InvocationScope::holder_prefix(holder)
        {
            // Re-entry from replay, or a fresh attempt of the invocation that
            // crashed while holding the lock.
            sqlx::query(
                "UPDATE object_locks SET holder = $1, acquired_at = $2 \
                 WHERE entity_name = $3 AND object_key = $4",
            )
            .bind(holder)
            .bind(Utc::now())
            .bind(entity)
            .bind(key)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(None);
        }

        Ok(Some(current))
    }

    async fn release_lock(&self, entity: &str, key: &str, holder: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM object_locks WHERE entity_name = $1 AND object_key = $2 AND holder = $3",
        )
        .bind(entity)
        .bind(key)
        .bind(holder)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Workflow run: execute the body at most once per `(entity, workflow_id)`.
    async fn dispatch_run(
        &self,
        scope: InvocationScope,
        entity: &str,
        workflow_id: &str,
        func: HandlerFn,
        payload: Value,
    ) -> Result<Value> {
        let holder = scope.holder_id();

        let mut tx = self.store.begin().await?;
        let existing: Option<(String, Option<Value>)> = sqlx::query_as(
            "SELECT status, result FROM workflow_runs WHERE entity_name = $1 AND workflow_id = $2",
        )
        .bind(entity)
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((status, result)) = existing {
            // Exactly-once: the body never runs twice for a key.
            return Ok(json!({
                "status": "cached",
                "run_status": status,
                "result": result,
            }));
        }
        sqlx::query(
            "INSERT INTO workflow_runs (entity_name, workflow_id, status, holder, started_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entity)
        .bind(workflow_id)
        .bind("running")
        .bind(&holder)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let result = self.invoke(scope, entity, Some(workflow_id), func, payload).await;
        let (status, stored) = match &result {
            Ok(value) => ("completed", value.clone()),
            Err(err) => ("failed", json!({ "error": err.to_string() })),
        };
        sqlx::query(
            "UPDATE workflow_runs SET status = $1, result = $2, finished_at = $3 \
             WHERE entity_name = $4 AND workflow_id = $5",
        )
        .bind(status)
        .bind(&stored)
        .bind(Utc::now())
        .bind(entity)
        .bind(workflow_id)
        .execute(self.store.pool())
        .await?;

        result.map(|value| json!({ "status": "completed", "result": value }))
    }
}
