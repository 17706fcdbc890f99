//! Integration tests exercising the pool/backlog claim path and the
//! durable on-disk store across a real SQLite file (not `:memory:`),
//! so migrations and cross-connection visibility are covered too.

use descartes_kernel_core::models::{CreateTaskOptions, PersonaFields, TaskStatus};
use descartes_kernel_core::store::Store;
use descartes_kernel_core::{agents, queries, tasks};
use std::sync::Arc;
use tempfile::tempdir;

async fn file_backed_store() -> (Store, tempfile::TempDir) {
    let dir = tempdir().expect("failed to create temp dir");
    let db_path = dir.path().join("kernel.db");
    let store = Store::open_or_create(&db_path).await.expect("failed to open store");
    (store, dir)
}

#[tokio::test]
async fn migrations_apply_on_a_fresh_file_and_persist_across_reopen() {
    let (store, dir) = file_backed_store().await;
    let agent = agents::register(&store, None, "lead", true, PersonaFields::default())
        .await
        .expect("register failed");
    drop(store);

    let db_path = dir.path().join("kernel.db");
    let reopened = Store::open_or_create(&db_path).await.expect("reopen failed");
    let fetched = agents::fetch_by_id(&reopened, agent.id)
        .await
        .expect("fetch failed")
        .expect("agent missing after reopen");
    assert_eq!(fetched.name, "lead");
}

#[tokio::test]
async fn two_leads_racing_the_same_pool_task_only_one_wins() {
    let (store, _dir) = file_backed_store().await;
    let store = Arc::new(store);

    let lead_a = agents::register(&store, None, "lead-a", true, PersonaFields::default())
        .await
        .unwrap();
    let lead_b = agents::register(&store, None, "lead-b", true, PersonaFields::default())
        .await
        .unwrap();

    let task = tasks::create(&store, "ship the release", CreateTaskOptions::default())
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Unassigned);

    let store_a = store.clone();
    let store_b = store.clone();
    let task_id = task.id;
    let a = tokio::spawn(async move { tasks::claim(&store_a, task_id, lead_a.id).await });
    let b = tokio::spawn(async move { tasks::claim(&store_b, task_id, lead_b.id).await });

    let (result_a, result_b) = tokio::join!(a, b);
    let claimed_a = result_a.unwrap().unwrap();
    let claimed_b = result_b.unwrap().unwrap();

    let winners = [claimed_a, claimed_b].into_iter().filter(Option::is_some).count();
    assert_eq!(winners, 1, "exactly one racer should win the claim");

    let final_task = tasks::fetch_by_id(&store, task.id).await.unwrap().unwrap();
    assert!(final_task.agent_id == Some(lead_a.id) || final_task.agent_id == Some(lead_b.id));
    assert_eq!(final_task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn move_to_pool_then_query_builder_finds_it_unassigned() {
    let (store, _dir) = file_backed_store().await;

    let task = tasks::create(
        &store,
        "investigate flaky test",
        CreateTaskOptions {
            as_backlog: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(task.status, TaskStatus::Backlog);

    let moved = tasks::move_to_pool(&store, task.id).await.unwrap().unwrap();
    assert_eq!(moved.status, TaskStatus::Unassigned);
    assert!(moved.agent_id.is_none());

    let unassigned = queries::TaskQueryBuilder::new()
        .unassigned_only()
        .execute(&store)
        .await
        .unwrap();
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0].id, task.id);

    let count = tasks::count_unassigned(&store).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn stale_reviewing_tasks_are_released_back_to_pending() {
    let (store, _dir) = file_backed_store().await;
    let worker = agents::register(&store, None, "worker", false, PersonaFields::default())
        .await
        .unwrap();
    let task = tasks::create(
        &store,
        "review this",
        CreateTaskOptions {
            agent_id: Some(worker.id),
            offered_to: Some(worker.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    tasks::claim_offered(&store, task.id, worker.id).await.unwrap();
    let reviewing = tasks::fetch_by_id(&store, task.id).await.unwrap().unwrap();
    assert_eq!(reviewing.status, TaskStatus::Reviewing);

    // A 0-minute timeout treats every reviewing task as stale.
    let released = tasks::release_stale_reviewing_tasks(&store, 0).await.unwrap();
    assert_eq!(released, 1);

    let after = tasks::fetch_by_id(&store, task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Offered);
}
