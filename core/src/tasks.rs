/// Task Lifecycle Engine.
///
/// Every operation here is one transaction: load, check precondition, write,
/// log. Precondition failures return `Ok(None)` — "lost the race" is an
/// expected outcome, not an error.
use crate::agents;
use crate::errors::{KernelError, KernelResult};
use crate::models::{to_json_text, AgentTask, CreateTaskOptions, TaskSource, TaskStatus};
use crate::store::Store;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

pub(crate) fn row_to_task(row: &SqliteRow) -> KernelResult<AgentTask> {
    let status_text: String = row.try_get("status")?;
    let source_text: String = row.try_get("source")?;
    let tags_text: String = row.try_get("tags")?;
    let depends_on_text: String = row.try_get("depends_on")?;

    let parse_uuid = |col: &str| -> KernelResult<Option<Uuid>> {
        let raw: Option<String> = row.try_get(col)?;
        Ok(match raw {
            Some(s) => Some(Uuid::parse_str(&s).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?),
            None => None,
        })
    };
    let parse_ts = |col: &str| -> KernelResult<Option<chrono::DateTime<Utc>>> {
        let raw: Option<String> = row.try_get(col)?;
        Ok(match raw {
            Some(s) => Some(
                chrono::DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
                    .with_timezone(&Utc),
            ),
            None => None,
        })
    };
    let parse_json_opt = |col: &str| -> KernelResult<Option<Value>> {
        let raw: Option<String> = row.try_get(col)?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    };

    let id_text: String = row.try_get("id")?;
    let created_at_text: String = row.try_get("created_at")?;
    let last_updated_text: String = row.try_get("last_updated_at")?;

    Ok(AgentTask {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        agent_id: parse_uuid("agent_id")?,
        creator_agent_id: parse_uuid("creator_agent_id")?,
        task: row.try_get("task")?,
        status: status_text
            .parse()
            .map_err(|e: String| KernelError::StoreUnavailable(e))?,
        source: source_text
            .parse()
            .map_err(|e: String| KernelError::StoreUnavailable(e))?,
        task_type: row.try_get("task_type")?,
        tags: serde_json::from_str(&tags_text).unwrap_or_default(),
        priority: row.try_get("priority")?,
        depends_on: serde_json::from_str(&depends_on_text).unwrap_or_default(),
        offered_to: parse_uuid("offered_to")?,
        offered_at: parse_ts("offered_at")?,
        accepted_at: parse_ts("accepted_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
        slack_origin: parse_json_opt("slack_origin")?,
        github_origin: parse_json_opt("github_origin")?,
        agentmail_origin: parse_json_opt("agentmail_origin")?,
        mention_message_id: parse_uuid("mention_message_id")?,
        mention_channel_id: parse_uuid("mention_channel_id")?,
        epic_id: parse_uuid("epic_id")?,
        parent_task_id: parse_uuid("parent_task_id")?,
        claude_session_id: row.try_get("claude_session_id")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        last_updated_at: chrono::DateTime::parse_from_rfc3339(&last_updated_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        finished_at: parse_ts("finished_at")?,
        notified_at: parse_ts("notified_at")?,
        failure_reason: row.try_get("failure_reason")?,
        output: row.try_get("output")?,
        progress: row.try_get("progress")?,
    })
}

pub(crate) const TASK_COLUMNS: &str = "id, agent_id, creator_agent_id, task, status, source, task_type, tags, \
    priority, depends_on, offered_to, offered_at, accepted_at, rejection_reason, slack_origin, \
    github_origin, agentmail_origin, mention_message_id, mention_channel_id, epic_id, \
    parent_task_id, claude_session_id, created_at, last_updated_at, finished_at, notified_at, \
    failure_reason, output, progress";

async fn fetch_task(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: Uuid,
) -> KernelResult<Option<AgentTask>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM agent_tasks WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(task_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

async fn write_log(
    tx: &mut Transaction<'_, Sqlite>,
    event_type: &str,
    agent_id: Option<Uuid>,
    task_id: Option<Uuid>,
    old_value: Option<&str>,
    new_value: Option<&str>,
) {
    // Best-effort: a logging failure never aborts the causing mutation.
    let result = sqlx::query(
        "INSERT INTO agent_logs (id, event_type, agent_id, task_id, old_value, new_value, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(event_type)
    .bind(agent_id.map(|a| a.to_string()))
    .bind(task_id.map(|t| t.to_string()))
    .bind(old_value)
    .bind(new_value)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, event_type, "failed to write agent_logs entry");
    }
}

/// Creates a task with the initial status derived from the options given:
/// `offered` if `offeredTo` set; else `pending` if `agentId` set; else
/// `backlog` if the caller asked for it; else `unassigned`.
pub async fn create(store: &Store, task: &str, opts: CreateTaskOptions) -> KernelResult<AgentTask> {
    let now = Utc::now();
    let id = Uuid::new_v4();

    let status = if opts.offered_to.is_some() {
        TaskStatus::Offered
    } else if opts.agent_id.is_some() {
        TaskStatus::Pending
    } else if opts.as_backlog {
        TaskStatus::Backlog
    } else {
        TaskStatus::Unassigned
    };

    let offered_at = if opts.offered_to.is_some() { Some(now) } else { None };
    let source = opts.source.unwrap_or(TaskSource::Api);

    let mut tx = store.begin().await?;
    sqlx::query(
        "INSERT INTO agent_tasks (id, agent_id, creator_agent_id, task, status, source, task_type, \
         tags, priority, depends_on, offered_to, offered_at, slack_origin, github_origin, \
         agentmail_origin, mention_message_id, mention_channel_id, epic_id, parent_task_id, \
         created_at, last_updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(opts.agent_id.map(|a| a.to_string()))
    .bind(opts.creator_agent_id.map(|a| a.to_string()))
    .bind(task)
    .bind(status.as_str())
    .bind(source.as_str())
    .bind(opts.task_type.as_deref())
    .bind(to_json_text(&opts.tags))
    .bind(opts.priority)
    .bind(to_json_text(&opts.depends_on))
    .bind(opts.offered_to.map(|a| a.to_string()))
    .bind(offered_at.map(|t| t.to_rfc3339()))
    .bind(opts.slack_origin.as_ref().map(to_json_text))
    .bind(opts.github_origin.as_ref().map(to_json_text))
    .bind(opts.agentmail_origin.as_ref().map(to_json_text))
    .bind(opts.mention_message_id.map(|a| a.to_string()))
    .bind(opts.mention_channel_id.map(|a| a.to_string()))
    .bind(opts.epic_id.map(|a| a.to_string()))
    .bind(opts.parent_task_id.map(|a| a.to_string()))
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await?;

    write_log(&mut tx, "task_created", opts.agent_id, Some(id), None, Some(status.as_str())).await;
    tx.commit().await?;

    fetch_by_id(store, id).await?.ok_or_else(|| KernelError::NotFound("task just created".into()))
}

pub async fn fetch_by_id(store: &Store, task_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM agent_tasks WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(task_id.to_string())
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

/// Recomputes the assigned agent's busy/idle status after a status-relevant
/// mutation so `derive_capacity` never drifts from the actual task count.
async fn resync_agent_capacity(store: &Store, task: &Option<AgentTask>) -> KernelResult<()> {
    if let Some(agent_id) = task.as_ref().and_then(|t| t.agent_id) {
        agents::derive_capacity(store, agent_id).await?;
    }
    Ok(())
}

async fn transition_status(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: Uuid,
    from_statuses: &[TaskStatus],
    to_status: TaskStatus,
) -> KernelResult<bool> {
    let placeholders = from_statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "UPDATE agent_tasks SET status = ?, last_updated_at = ? \
         WHERE id = ? AND status IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql)
        .bind(to_status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string());
    for s in from_statuses {
        query = query.bind(s.as_str());
    }
    let result = query.execute(&mut **tx).await?;
    Ok(result.rows_affected() > 0)
}

/// `unassigned → pending`. Atomic; returns `None` if another claimer won.
pub async fn claim(store: &Store, task_id: Uuid, agent_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, agent_id = ?, last_updated_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(TaskStatus::Pending.as_str())
    .bind(agent_id.to_string())
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Unassigned.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        Some(agent_id),
        Some(task_id),
        Some(TaskStatus::Unassigned.as_str()),
        Some(TaskStatus::Pending.as_str()),
    )
    .await;
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// `unassigned → offered`, sets `offeredTo`/`offeredAt`.
pub async fn offer(store: &Store, task_id: Uuid, agent_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, offered_to = ?, offered_at = ?, last_updated_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(TaskStatus::Offered.as_str())
    .bind(agent_id.to_string())
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Unassigned.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        Some(agent_id),
        Some(task_id),
        Some(TaskStatus::Unassigned.as_str()),
        Some(TaskStatus::Offered.as_str()),
    )
    .await;
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// Atomic `offered → reviewing`, guarded by `offeredTo = agentId`.
pub async fn claim_offered(
    store: &Store,
    task_id: Uuid,
    agent_id: Uuid,
) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, last_updated_at = ? \
         WHERE id = ? AND status = ? AND offered_to = ?",
    )
    .bind(TaskStatus::Reviewing.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Offered.as_str())
    .bind(agent_id.to_string())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        Some(agent_id),
        Some(task_id),
        Some(TaskStatus::Offered.as_str()),
        Some(TaskStatus::Reviewing.as_str()),
    )
    .await;
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// `(offered|reviewing) → pending`, requires `offeredTo = agentId`.
pub async fn accept(store: &Store, task_id: Uuid, agent_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, accepted_at = ?, last_updated_at = ? \
         WHERE id = ? AND status IN (?, ?) AND offered_to = ?",
    )
    .bind(TaskStatus::Pending.as_str())
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Offered.as_str())
    .bind(TaskStatus::Reviewing.as_str())
    .bind(agent_id.to_string())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        Some(agent_id),
        Some(task_id),
        Some("offered_or_reviewing"),
        Some(TaskStatus::Pending.as_str()),
    )
    .await;
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// Returns the task to `unassigned`, clearing `offeredTo`/`offeredAt`.
pub async fn reject(
    store: &Store,
    task_id: Uuid,
    agent_id: Uuid,
    reason: Option<&str>,
) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, offered_to = NULL, offered_at = NULL, \
         rejection_reason = ?, last_updated_at = ? \
         WHERE id = ? AND status IN (?, ?) AND offered_to = ?",
    )
    .bind(TaskStatus::Unassigned.as_str())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Offered.as_str())
    .bind(TaskStatus::Reviewing.as_str())
    .bind(agent_id.to_string())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        Some(agent_id),
        Some(task_id),
        Some("offered_or_reviewing"),
        Some(TaskStatus::Unassigned.as_str()),
    )
    .await;
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// `pending → in_progress`.
pub async fn start(store: &Store, task_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let changed = transition_status(&mut tx, task_id, &[TaskStatus::Pending], TaskStatus::InProgress)
        .await?;
    if !changed {
        tx.commit().await?;
        return Ok(None);
    }
    write_log(
        &mut tx,
        "task_status_change",
        None,
        Some(task_id),
        Some(TaskStatus::Pending.as_str()),
        Some(TaskStatus::InProgress.as_str()),
    )
    .await;
    tx.commit().await?;
    let task = fetch_by_id(store, task_id).await?;
    resync_agent_capacity(store, &task).await?;
    Ok(task)
}

/// `in_progress → paused`; agent binding preserved.
pub async fn pause(store: &Store, task_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let changed = transition_status(&mut tx, task_id, &[TaskStatus::InProgress], TaskStatus::Paused)
        .await?;
    if !changed {
        tx.commit().await?;
        return Ok(None);
    }
    write_log(
        &mut tx,
        "task_status_change",
        None,
        Some(task_id),
        Some(TaskStatus::InProgress.as_str()),
        Some(TaskStatus::Paused.as_str()),
    )
    .await;
    tx.commit().await?;
    let task = fetch_by_id(store, task_id).await?;
    resync_agent_capacity(store, &task).await?;
    Ok(task)
}

/// `paused → in_progress`.
pub async fn resume(store: &Store, task_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let changed = transition_status(&mut tx, task_id, &[TaskStatus::Paused], TaskStatus::InProgress)
        .await?;
    if !changed {
        tx.commit().await?;
        return Ok(None);
    }
    write_log(
        &mut tx,
        "task_status_change",
        None,
        Some(task_id),
        Some(TaskStatus::Paused.as_str()),
        Some(TaskStatus::InProgress.as_str()),
    )
    .await;
    tx.commit().await?;
    let task = fetch_by_id(store, task_id).await?;
    resync_agent_capacity(store, &task).await?;
    Ok(task)
}

/// Terminal: sets `finishedAt` and optional `output`.
pub async fn complete(store: &Store, task_id: Uuid, output: Option<&str>) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let before = fetch_task(&mut tx, task_id).await?;
    let Some(before) = before else {
        tx.commit().await?;
        return Ok(None);
    };
    if before.status.is_terminal() {
        tx.commit().await?;
        return Ok(None);
    }

    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, finished_at = ?, output = ?, last_updated_at = ? \
         WHERE id = ? AND status NOT IN (?, ?, ?)",
    )
    .bind(TaskStatus::Completed.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(output)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Completed.as_str())
    .bind(TaskStatus::Failed.as_str())
    .bind(TaskStatus::Cancelled.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        before.agent_id,
        Some(task_id),
        Some(before.status.as_str()),
        Some(TaskStatus::Completed.as_str()),
    )
    .await;
    tx.commit().await?;
    let task = fetch_by_id(store, task_id).await?;
    resync_agent_capacity(store, &task).await?;
    Ok(task)
}

/// Terminal: sets `finishedAt` and `failureReason`.
pub async fn fail(store: &Store, task_id: Uuid, reason: &str) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let before = fetch_task(&mut tx, task_id).await?;
    let Some(before) = before else {
        tx.commit().await?;
        return Ok(None);
    };
    if before.status.is_terminal() {
        tx.commit().await?;
        return Ok(None);
    }

    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, finished_at = ?, failure_reason = ?, last_updated_at = ? \
         WHERE id = ? AND status NOT IN (?, ?, ?)",
    )
    .bind(TaskStatus::Failed.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Completed.as_str())
    .bind(TaskStatus::Failed.as_str())
    .bind(TaskStatus::Cancelled.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        before.agent_id,
        Some(task_id),
        Some(before.status.as_str()),
        Some(TaskStatus::Failed.as_str()),
    )
    .await;
    tx.commit().await?;
    let task = fetch_by_id(store, task_id).await?;
    resync_agent_capacity(store, &task).await?;
    Ok(task)
}

/// Terminal, only valid from `pending|in_progress`.
pub async fn cancel(store: &Store, task_id: Uuid, reason: Option<&str>) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let before = fetch_task(&mut tx, task_id).await?;
    let Some(before) = before else {
        tx.commit().await?;
        return Ok(None);
    };
    if !matches!(before.status, TaskStatus::Pending | TaskStatus::InProgress) {
        tx.commit().await?;
        return Ok(None);
    }

    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, finished_at = ?, failure_reason = COALESCE(?, failure_reason), \
         last_updated_at = ? WHERE id = ? AND status IN (?, ?)",
    )
    .bind(TaskStatus::Cancelled.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Pending.as_str())
    .bind(TaskStatus::InProgress.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }

    write_log(
        &mut tx,
        "task_status_change",
        before.agent_id,
        Some(task_id),
        Some(before.status.as_str()),
        Some(TaskStatus::Cancelled.as_str()),
    )
    .await;
    tx.commit().await?;
    let task = fetch_by_id(store, task_id).await?;
    resync_agent_capacity(store, &task).await?;
    Ok(task)
}

/// Coerces `pending → in_progress` if needed, updates `progress`, emits
/// `task_progress`.
pub async fn set_progress(store: &Store, task_id: Uuid, text: &str) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let before = fetch_task(&mut tx, task_id).await?;
    let Some(before) = before else {
        tx.commit().await?;
        return Ok(None);
    };
    if !matches!(before.status, TaskStatus::Pending | TaskStatus::InProgress) {
        tx.commit().await?;
        return Ok(None);
    }

    sqlx::query(
        "UPDATE agent_tasks SET status = ?, progress = ?, last_updated_at = ? WHERE id = ?",
    )
    .bind(TaskStatus::InProgress.as_str())
    .bind(text)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .execute(&mut *tx)
    .await?;

    write_log(&mut tx, "task_progress", before.agent_id, Some(task_id), None, Some(text)).await;
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// Attaches a Claude CLI session id to a task.
pub async fn set_claude_session(store: &Store, task_id: Uuid, session_id: &str) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let result = sqlx::query(
        "UPDATE agent_tasks SET claude_session_id = ?, last_updated_at = ? WHERE id = ?",
    )
    .bind(session_id)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// Bulk set `notifiedAt`, used by the poll endpoint for at-least-once
/// delivery.
pub async fn mark_notified(store: &Store, ids: &[Uuid]) -> KernelResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = Utc::now().to_rfc3339();
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("UPDATE agent_tasks SET notified_at = ? WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql).bind(now);
    for id in ids {
        query = query.bind(id.to_string());
    }
    query.execute(store.pool()).await?;
    Ok(())
}

/// Bulk clear `notifiedAt`, allowing re-delivery.
pub async fn reset_notified(store: &Store, ids: &[Uuid]) -> KernelResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("UPDATE agent_tasks SET notified_at = NULL WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id.to_string());
    }
    query.execute(store.pool()).await?;
    Ok(())
}

pub struct DependencyCheck {
    pub ready: bool,
    pub blocked_by: Vec<Uuid>,
}

/// `ready = true` iff every `dependsOn` member exists and is `completed`.
pub async fn check_dependencies(store: &Store, task_id: Uuid) -> KernelResult<DependencyCheck> {
    let Some(task) = fetch_by_id(store, task_id).await? else {
        return Err(KernelError::NotFound(format!("task {task_id}")));
    };
    check_dependencies_of(store, &task.depends_on).await
}

async fn check_dependencies_of(store: &Store, depends_on: &[Uuid]) -> KernelResult<DependencyCheck> {
    let mut blocked_by = Vec::new();
    for dep_id in depends_on {
        let dep = fetch_by_id(store, *dep_id).await?;
        match dep {
            Some(dep) if dep.status == TaskStatus::Completed => {}
            _ => blocked_by.push(*dep_id),
        }
    }
    Ok(DependencyCheck {
        ready: blocked_by.is_empty(),
        blocked_by,
    })
}

/// Ready-task selection: order `pending` tasks assigned to `agent_id`
/// by `(priority DESC, createdAt ASC)`, return the first whose dependencies
/// are all `completed`.
pub async fn get_pending_task_for_agent(store: &Store, agent_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status = ? \
         ORDER BY priority DESC, created_at ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Pending.as_str())
        .fetch_all(store.pool())
        .await?;

    for row in &rows {
        let task = row_to_task(row)?;
        let check = check_dependencies_of(store, &task.depends_on).await?;
        if check.ready {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

/// Returns any paused task owned by `agent_id` (resumption prompt, trigger
/// #4).
pub async fn get_paused_task_for_agent(store: &Store, agent_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status = ? \
         ORDER BY last_updated_at ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Paused.as_str())
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

/// Any task owned by `agent_id` cancelled within the last `within_minutes`
/// minutes with `notifiedAt IS NULL` (trigger #1).
pub async fn get_recent_cancellation_for_agent(
    store: &Store,
    agent_id: Uuid,
    within_minutes: i64,
) -> KernelResult<Option<AgentTask>> {
    let cutoff = (Utc::now() - Duration::minutes(within_minutes)).to_rfc3339();
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status = ? \
         AND finished_at >= ? AND notified_at IS NULL ORDER BY finished_at DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Cancelled.as_str())
        .bind(cutoff)
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

/// Any task in `offered` state with `offeredTo = agent_id` (trigger #2
/// candidate before the atomic `claim_offered` transition).
pub async fn get_offered_task_for_agent(store: &Store, agent_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE offered_to = ? AND status = ? \
         ORDER BY offered_at ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Offered.as_str())
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

/// Non-lead agents' recently finished tasks, `notifiedAt IS NULL` (trigger
/// #5.d, `worker_task_finished`). The caller is responsible for marking
/// `notifiedAt` via `mark_notified` once the trigger is delivered.
pub async fn get_unnotified_finished_task(store: &Store, agent_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status IN (?, ?, ?) \
         AND notified_at IS NULL ORDER BY finished_at ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Completed.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(TaskStatus::Cancelled.as_str())
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

pub async fn count_unassigned(store: &Store) -> KernelResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_tasks WHERE status = ?")
        .bind(TaskStatus::Unassigned.as_str())
        .fetch_one(store.pool())
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------
// Transaction-scoped variants for the trigger dispatcher.
//
// The poll dispatcher evaluates several of these in precedence order and
// needs every check, and the write that follows a match, to land in one
// transaction. These mirror the `&Store` versions above but take the
// transaction directly instead of opening and committing their own.
// ---------------------------------------------------------------------

pub(crate) async fn check_dependencies_of_tx(
    tx: &mut Transaction<'_, Sqlite>,
    depends_on: &[Uuid],
) -> KernelResult<DependencyCheck> {
    let mut blocked_by = Vec::new();
    for dep_id in depends_on {
        let dep = fetch_task(&mut *tx, *dep_id).await?;
        match dep {
            Some(dep) if dep.status == TaskStatus::Completed => {}
            _ => blocked_by.push(*dep_id),
        }
    }
    Ok(DependencyCheck {
        ready: blocked_by.is_empty(),
        blocked_by,
    })
}

pub(crate) async fn get_pending_task_for_agent_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status = ? \
         ORDER BY priority DESC, created_at ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Pending.as_str())
        .fetch_all(&mut **tx)
        .await?;

    for row in &rows {
        let task = row_to_task(row)?;
        let check = check_dependencies_of_tx(&mut *tx, &task.depends_on).await?;
        if check.ready {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

pub(crate) async fn get_paused_task_for_agent_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status = ? \
         ORDER BY last_updated_at ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Paused.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

pub(crate) async fn get_recent_cancellation_for_agent_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
    within_minutes: i64,
) -> KernelResult<Option<AgentTask>> {
    let cutoff = (Utc::now() - Duration::minutes(within_minutes)).to_rfc3339();
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status = ? \
         AND finished_at >= ? AND notified_at IS NULL ORDER BY finished_at DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Cancelled.as_str())
        .bind(cutoff)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

pub(crate) async fn get_offered_task_for_agent_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE offered_to = ? AND status = ? \
         ORDER BY offered_at ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Offered.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

/// `offered → reviewing`, guarded by `offeredTo = agentId`. Does not open or
/// commit its own transaction; the caller owns the boundary.
pub(crate) async fn claim_offered_tx(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: Uuid,
    agent_id: Uuid,
) -> KernelResult<Option<AgentTask>> {
    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, last_updated_at = ? \
         WHERE id = ? AND status = ? AND offered_to = ?",
    )
    .bind(TaskStatus::Reviewing.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .bind(TaskStatus::Offered.as_str())
    .bind(agent_id.to_string())
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    write_log(
        &mut *tx,
        "task_status_change",
        Some(agent_id),
        Some(task_id),
        Some(TaskStatus::Offered.as_str()),
        Some(TaskStatus::Reviewing.as_str()),
    )
    .await;
    fetch_task(&mut *tx, task_id).await
}

pub(crate) async fn get_unnotified_finished_task_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<Option<AgentTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE agent_id = ? AND status IN (?, ?, ?) \
         AND notified_at IS NULL ORDER BY finished_at ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .bind(TaskStatus::Completed.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(TaskStatus::Cancelled.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

pub(crate) async fn mark_notified_tx(tx: &mut Transaction<'_, Sqlite>, ids: &[Uuid]) -> KernelResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = Utc::now().to_rfc3339();
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("UPDATE agent_tasks SET notified_at = ? WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql).bind(now);
    for id in ids {
        query = query.bind(id.to_string());
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

pub(crate) async fn count_unassigned_tx(tx: &mut Transaction<'_, Sqlite>) -> KernelResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_tasks WHERE status = ?")
        .bind(TaskStatus::Unassigned.as_str())
        .fetch_one(&mut **tx)
        .await?;
    Ok(count)
}

/// `backlog → unassigned`: the only way a backlog task ever becomes visible
/// to pool queries. There is no implicit promotion.
pub async fn move_to_pool(store: &Store, task_id: Uuid) -> KernelResult<Option<AgentTask>> {
    let mut tx = store.begin().await?;
    let changed = transition_status(&mut tx, task_id, &[TaskStatus::Backlog], TaskStatus::Unassigned)
        .await?;
    if !changed {
        tx.commit().await?;
        return Ok(None);
    }
    write_log(
        &mut tx,
        "task_status_change",
        None,
        Some(task_id),
        Some(TaskStatus::Backlog.as_str()),
        Some(TaskStatus::Unassigned.as_str()),
    )
    .await;
    tx.commit().await?;
    fetch_by_id(store, task_id).await
}

/// Releases `reviewing` tasks whose `offeredAt` predates `timeout_minutes`
/// ago back to `offered`. Returns the number of tasks released.
///
/// This does not track a per-offer starvation counter; `offeredAt` ordering
/// (oldest processed first, and the sweep never re-assigns `offeredTo`) is
/// judged sufficient since the same agent can only re-win the race by
/// polling again, which is indistinguishable from a fresh legitimate claim.
pub async fn release_stale_reviewing_tasks(store: &Store, timeout_minutes: i64) -> KernelResult<u64> {
    let cutoff = (Utc::now() - Duration::minutes(timeout_minutes)).to_rfc3339();
    let mut tx = store.begin().await?;
    let result = sqlx::query(
        "UPDATE agent_tasks SET status = ?, last_updated_at = ? \
         WHERE status = ? AND offered_at < ?",
    )
    .bind(TaskStatus::Offered.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(TaskStatus::Reviewing.as_str())
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateTaskOptions;

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_derives_unassigned_by_default() {
        let store = test_store().await;
        let task = create(&store, "build", CreateTaskOptions::default()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Unassigned);
    }

    #[tokio::test]
    async fn create_derives_offered_when_offered_to_set() {
        let store = test_store().await;
        let agent = Uuid::new_v4();
        let opts = CreateTaskOptions {
            offered_to: Some(agent),
            ..Default::default()
        };
        let task = create(&store, "build", opts).await.unwrap();
        assert_eq!(task.status, TaskStatus::Offered);
        assert_eq!(task.offered_to, Some(agent));
    }

    #[tokio::test]
    async fn claim_offered_is_exclusive() {
        let store = test_store().await;
        let agent = Uuid::new_v4();
        let opts = CreateTaskOptions {
            offered_to: Some(agent),
            ..Default::default()
        };
        let task = create(&store, "build", opts).await.unwrap();

        let (a, b) = tokio::join!(
            claim_offered(&store, task.id, agent),
            claim_offered(&store, task.id, agent),
        );
        let results = [a.unwrap(), b.unwrap()];
        let successes = results.iter().filter(|r| r.is_some()).count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn pool_claim_is_exclusive() {
        let store = test_store().await;
        let task = create(&store, "build", CreateTaskOptions::default()).await.unwrap();
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();

        let (a, b) = tokio::join!(claim(&store, task.id, agent_a), claim(&store, task.id, agent_b));
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(a.is_some() ^ b.is_some());

        let winner_id = a.or(b).unwrap().agent_id.unwrap();
        let final_task = fetch_by_id(&store, task.id).await.unwrap().unwrap();
        assert_eq!(final_task.agent_id, Some(winner_id));
    }

    #[tokio::test]
    async fn terminal_tasks_never_change_status() {
        let store = test_store().await;
        let opts = CreateTaskOptions {
            agent_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let task = create(&store, "build", opts).await.unwrap();
        start(&store, task.id).await.unwrap();
        complete(&store, task.id, Some("ok")).await.unwrap().unwrap();

        let refailed = fail(&store, task.id, "too late").await.unwrap();
        assert!(refailed.is_none());

        let final_task = fetch_by_id(&store, task.id).await.unwrap().unwrap();
        assert_eq!(final_task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn dependency_gate_blocks_until_dependency_completes() {
        let store = test_store().await;
        let agent = Uuid::new_v4();
        let a = create(
            &store,
            "A",
            CreateTaskOptions {
                agent_id: Some(agent),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let b = create(
            &store,
            "B",
            CreateTaskOptions {
                agent_id: Some(agent),
                depends_on: vec![a.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let next = get_pending_task_for_agent(&store, agent).await.unwrap().unwrap();
        assert_eq!(next.id, a.id);

        start(&store, a.id).await.unwrap();
        complete(&store, a.id, None).await.unwrap();

        let next = get_pending_task_for_agent(&store, agent).await.unwrap().unwrap();
        assert_eq!(next.id, b.id);
    }
}
