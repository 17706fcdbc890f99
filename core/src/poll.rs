/// Trigger Dispatcher / Poll API.
///
/// `poll` is the linearisation point of every "what changed for me" signal
/// the kernel produces. Precedence is evaluated in order; the first match
/// wins. The whole precedence chain — every check plus the single write
/// that follows a match — runs inside one transaction, so a concurrent
/// writer can never leave a poll looking at a torn view across its own
/// checks.
use crate::agents;
use crate::epics;
use crate::inbox;
use crate::models::{Agent, Trigger};
use crate::store::Store;
use crate::tasks;
use crate::errors::KernelResult;
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

/// Triggers 1-4 look back this far / release bindings this stale.
const RECENT_CANCELLATION_MINUTES: i64 = 5;

pub async fn poll(store: &Store, agent_id: Uuid) -> KernelResult<Option<Trigger>> {
    // Opportunistic sweeps: cheap, idempotent, independent of the trigger
    // transaction below — never worth blocking a poll on.
    let _ = tasks::release_stale_reviewing_tasks(store, 30).await;
    let _ = inbox::release_stale_mention_processing(store, 30).await;

    let mut tx = store.begin().await?;

    let Some(agent) = agents::fetch_by_id_tx(&mut tx, agent_id).await? else {
        tx.commit().await?;
        return Ok(None);
    };

    let trigger = evaluate(&mut tx, &agent).await?;

    if trigger.is_some() {
        agents::reset_empty_polls_tx(&mut tx, agent.id).await?;
    } else {
        agents::increment_empty_polls_tx(&mut tx, agent.id).await?;
    }

    tx.commit().await?;
    Ok(trigger)
}

async fn evaluate(tx: &mut Transaction<'_, Sqlite>, agent: &Agent) -> KernelResult<Option<Trigger>> {
    // 1. task_cancelled
    if let Some(task) =
        tasks::get_recent_cancellation_for_agent_tx(&mut *tx, agent.id, RECENT_CANCELLATION_MINUTES).await?
    {
        tasks::mark_notified_tx(&mut *tx, &[task.id]).await?;
        return Ok(Some(Trigger::TaskCancelled { task }));
    }

    // 2. task_offered — atomic offered -> reviewing; skip if already claimed.
    if let Some(candidate) = tasks::get_offered_task_for_agent_tx(&mut *tx, agent.id).await? {
        if let Some(task) = tasks::claim_offered_tx(&mut *tx, candidate.id, agent.id).await? {
            return Ok(Some(Trigger::TaskOffered { task }));
        }
    }

    // 3. task_assigned — ready-task selection.
    if let Some(task) = tasks::get_pending_task_for_agent_tx(&mut *tx, agent.id).await? {
        return Ok(Some(Trigger::TaskAssigned { task }));
    }

    // 4. task_paused — resumption prompt.
    if let Some(task) = tasks::get_paused_task_for_agent_tx(&mut *tx, agent.id).await? {
        return Ok(Some(Trigger::TaskPaused { task }));
    }

    if !agent.is_lead {
        // 5.d for non-leads: worker_task_finished.
        if let Some(task) = tasks::get_unnotified_finished_task_tx(&mut *tx, agent.id).await? {
            tasks::mark_notified_tx(&mut *tx, &[task.id]).await?;
            return Ok(Some(Trigger::WorkerTaskFinished { task }));
        }
        return Ok(None);
    }

    // 5a. unread_mentions
    let claimed_channels = inbox::claim_mentions_tx(&mut *tx, agent.id).await?;
    if !claimed_channels.is_empty() {
        let count = inbox::count_unread_mentions_tx(&mut *tx, agent.id, &claimed_channels).await?;
        if count > 0 {
            return Ok(Some(Trigger::UnreadMentions {
                count,
                channels: claimed_channels,
            }));
        }
        // Nothing actually unread despite the claim; release immediately so
        // another poll can make progress instead of holding a dead lock.
        inbox::release_mention_processing_tx(&mut *tx, agent.id, &claimed_channels).await?;
    }

    // 5b. pool_tasks_available
    let pool_count = tasks::count_unassigned_tx(&mut *tx).await?;
    if pool_count > 0 {
        return Ok(Some(Trigger::PoolTasksAvailable { count: pool_count }));
    }

    // 5c. epic_progress
    let epics_with_updates = epics::get_epics_with_progress_updates_tx(&mut *tx).await?;
    if !epics_with_updates.is_empty() {
        let ids: Vec<Uuid> = epics_with_updates.iter().map(|e| e.id).collect();
        epics::mark_epics_progress_notified_tx(&mut *tx, &ids).await?;
        return Ok(Some(Trigger::EpicProgress { epics: ids }));
    }

    // 5d. worker_task_finished, also surfaced to leads.
    if let Some(task) = tasks::get_unnotified_finished_task_tx(&mut *tx, agent.id).await? {
        tasks::mark_notified_tx(&mut *tx, &[task.id]).await?;
        return Ok(Some(Trigger::WorkerTaskFinished { task }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateTaskOptions, PersonaFields};

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn scenario_offer_accept_assign_complete_notify() {
        let store = test_store().await;
        let lead = agents::register(&store, None, "lead", true, PersonaFields::default()).await.unwrap();
        let worker = agents::register(&store, None, "worker", false, PersonaFields::default()).await.unwrap();

        let task = tasks::create(&store, "build", CreateTaskOptions::default()).await.unwrap();

        let lead_trigger = poll(&store, lead.id).await.unwrap();
        assert!(matches!(lead_trigger, Some(Trigger::PoolTasksAvailable { count: 1 })));

        tasks::offer(&store, task.id, worker.id).await.unwrap();

        let worker_trigger = poll(&store, worker.id).await.unwrap();
        assert!(matches!(worker_trigger, Some(Trigger::TaskOffered { .. })));

        tasks::accept(&store, task.id, worker.id).await.unwrap();

        let assigned_trigger = poll(&store, worker.id).await.unwrap();
        assert!(matches!(assigned_trigger, Some(Trigger::TaskAssigned { .. })));

        tasks::start(&store, task.id).await.unwrap();
        let worker_after_start = agents::fetch_by_id(&store, worker.id).await.unwrap().unwrap();
        assert_eq!(worker_after_start.status, crate::models::AgentStatus::Busy);

        tasks::complete(&store, task.id, Some("ok")).await.unwrap();

        let lead_finish_trigger = poll(&store, lead.id).await.unwrap();
        assert!(matches!(lead_finish_trigger, Some(Trigger::WorkerTaskFinished { .. })));

        let lead_again = poll(&store, lead.id).await.unwrap();
        assert!(lead_again.is_none());
    }

    #[tokio::test]
    async fn scenario_dependency_gate_blocks_next_poll() {
        let store = test_store().await;
        let worker = agents::register(&store, None, "worker", false, PersonaFields::default()).await.unwrap();

        let a = tasks::create(
            &store,
            "A",
            CreateTaskOptions {
                agent_id: Some(worker.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let b = tasks::create(
            &store,
            "B",
            CreateTaskOptions {
                agent_id: Some(worker.id),
                depends_on: vec![a.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let first = poll(&store, worker.id).await.unwrap().unwrap();
        match first {
            Trigger::TaskAssigned { task } => assert_eq!(task.id, a.id),
            _ => panic!("expected task_assigned for A"),
        }

        // No forward progress before A completes.
        let again = poll(&store, worker.id).await.unwrap().unwrap();
        match again {
            Trigger::TaskAssigned { task } => assert_eq!(task.id, a.id),
            _ => panic!("expected task_assigned for A again"),
        }

        tasks::start(&store, a.id).await.unwrap();
        tasks::complete(&store, a.id, None).await.unwrap();

        let next = poll(&store, worker.id).await.unwrap().unwrap();
        match next {
            Trigger::TaskAssigned { task } => assert_eq!(task.id, b.id),
            _ => panic!("expected task_assigned for B"),
        }
    }
}
