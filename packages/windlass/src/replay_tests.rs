//! End-to-end replay properties: journal sequentiality and determinism
//! across a mixed-op invocation body.

use serde_json::{json, Value};

use crate::awakeable;
use crate::context::ExecutionContext;
use crate::error::WindlassError;
use crate::job::{submit_job, LifecycleState, TaskSpec};
use crate::journal::{self, OpType};
use crate::lifecycle;
use crate::store::Store;

async fn seeded_store() -> Store {
    let store = Store::in_memory().await.unwrap();
    let spec = TaskSpec::builder()
        .name("body")
        .agent_type("claude")
        .build();
    submit_job("j1", "mixed", None, &[spec], &store).await.unwrap();
    lifecycle::transition_task("j1", "body", LifecycleState::Ready, "t", &store)
        .await
        .unwrap();
    lifecycle::transition_task("j1", "body", LifecycleState::Running, "t", &store)
        .await
        .unwrap();
    store
}

/// The invocation body used by every test here: run, state write, state
/// read, durable sleep (already elapsed), awakeable round-trip.
async fn body(ctx: &mut ExecutionContext) -> crate::error::Result<Value> {
    let fetched: String = ctx.run("fetch", || async { Ok("payload".to_string()) }).await?;
    ctx.set_state("Cache", "k1", "fetched", json!(fetched)).await?;
    let cached = ctx.get_state("Cache", "k1", "fetched").await?;
    ctx.sleep(std::time::Duration::ZERO).await?;
    let id = ctx.awakeable(None).await?;
    let approval = ctx.await_awakeable(&id).await?;
    Ok(json!({ "cached": cached, "approval": approval }))
}

#[tokio::test]
async fn mixed_body_suspends_resumes_and_replays_identically() {
    let store = seeded_store().await;

    // First attempt runs live until the awakeable suspends it.
    let mut ctx = ExecutionContext::create("j1", "body", 1, &store).await.unwrap();
    let err = body(&mut ctx).await.unwrap_err();
    assert!(matches!(err, WindlassError::Suspended(_)));

    let entries = journal::load("j1", "body", 1, &store).await.unwrap();
    let ops: Vec<OpType> = entries.iter().map(|e| e.op_type).collect();
    assert_eq!(
        ops,
        vec![
            OpType::Run,
            OpType::SetState,
            OpType::GetState,
            OpType::Sleep,
            OpType::AwakeableCreate,
            OpType::AwakeableAwait,
        ]
    );
    // Property 1: indices are exactly 0..n with no gaps.
    let indices: Vec<i64> = entries.iter().map(|e| e.entry_index).collect();
    assert_eq!(indices, (0..entries.len() as i64).collect::<Vec<_>>());

    // Resolve externally; replay runs the same body to completion.
    let id = crate::id::generate_awakeable_id("j1", 4);
    awakeable::resolve(&id, json!({"action": "approve"}), &store).await.unwrap();

    let mut replay = ExecutionContext::create("j1", "body", 1, &store).await.unwrap();
    let out = body(&mut replay).await.unwrap();
    assert_eq!(
        out,
        json!({ "cached": "payload", "approval": {"action": "approve"} })
    );

    // Property 2: re-running in replay mode leaves the recorded
    // (op_type, input, output) sequence unchanged and appends nothing.
    let before = journal::load("j1", "body", 1, &store).await.unwrap();
    let mut again = ExecutionContext::create("j1", "body", 1, &store).await.unwrap();
    let out_again = body(&mut again).await.unwrap();
    assert_eq!(out_again, out);
    let after = journal::load("j1", "body", 1, &store).await.unwrap();
    assert_eq!(before.len(), after.len());
    for (lhs, rhs) in before.iter().zip(after.iter()) {
        assert_eq!(lhs.op_type, rhs.op_type);
        assert_eq!(lhs.input, rhs.input);
        assert_eq!(lhs.output, rhs.output);
    }
}

#[tokio::test]
async fn awakeable_id_encodes_origin_entry() {
    let store = seeded_store().await;
    let mut ctx = ExecutionContext::create("j1", "body", 1, &store).await.unwrap();
    let _: i32 = ctx.run("pad", || async { Ok(1) }).await.unwrap();
    let id = ctx.awakeable(None).await.unwrap();

    let (job_id, entry_index) = crate::id::parse_awakeable_id(&id).unwrap();
    assert_eq!(job_id, "j1");
    assert_eq!(entry_index, 1);

    let row = awakeable::Awakeable::find_by_id(&id, &store).await.unwrap();
    assert_eq!(row.job_id, "j1");
    assert_eq!(row.task_name, "body");
    assert_eq!(row.entry_index, 1);
}

#[tokio::test]
async fn replay_after_resolution_observes_one_terminal_transition() {
    let store = seeded_store().await;
    let mut ctx = ExecutionContext::create("j1", "body", 1, &store).await.unwrap();
    let id = ctx.awakeable(None).await.unwrap();
    let _ = ctx.await_awakeable(&id).await.unwrap_err();

    awakeable::resolve(&id, json!(1), &store).await.unwrap();
    // Property 3: every further terminal transition is refused.
    for attempt in [
        awakeable::resolve(&id, json!(2), &store).await,
        awakeable::reject(&id, "late", &store).await,
    ] {
        assert!(matches!(attempt.unwrap_err(), WindlassError::NotPending { .. }));
    }
    let row = awakeable::Awakeable::find_by_id(&id, &store).await.unwrap();
    assert_eq!(row.payload, Some(json!(1)));
}
