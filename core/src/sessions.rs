/// Active-Session Tracker.
///
/// Durable but explicitly non-authoritative: rows are pruned by
/// `cleanup_stale` and must never be read as ground truth for task status
/// (that lives on `agent_tasks` itself).
use crate::errors::{KernelError, KernelResult};
use crate::models::{ActiveSession, SessionCost, SessionLog};
use crate::store::Store;
use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

fn row_to_session(row: &SqliteRow) -> KernelResult<ActiveSession> {
    let id_text: String = row.try_get("id")?;
    let agent_id_text: String = row.try_get("agent_id")?;
    let task_id: Option<String> = row.try_get("task_id")?;
    let inbox_message_id: Option<String> = row.try_get("inbox_message_id")?;
    let started_at_text: String = row.try_get("started_at")?;
    let last_heartbeat_text: String = row.try_get("last_heartbeat_at")?;

    Ok(ActiveSession {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        agent_id: Uuid::parse_str(&agent_id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        task_id: task_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        trigger_type: row.try_get("trigger_type")?,
        inbox_message_id: inbox_message_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        task_description: row.try_get("task_description")?,
        started_at: chrono::DateTime::parse_from_rfc3339(&started_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        last_heartbeat_at: chrono::DateTime::parse_from_rfc3339(&last_heartbeat_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn start(
    store: &Store,
    agent_id: Uuid,
    task_id: Option<Uuid>,
    trigger_type: &str,
    inbox_message_id: Option<Uuid>,
    task_description: Option<&str>,
) -> KernelResult<ActiveSession> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO active_sessions (id, agent_id, task_id, trigger_type, inbox_message_id, \
         task_description, started_at, last_heartbeat_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(agent_id.to_string())
    .bind(task_id.map(|t| t.to_string()))
    .bind(trigger_type)
    .bind(inbox_message_id.map(|m| m.to_string()))
    .bind(task_description)
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(store.pool())
    .await?;

    fetch_by_id(store, id).await?.ok_or_else(|| KernelError::NotFound("session just created".into()))
}

pub async fn fetch_by_id(store: &Store, session_id: Uuid) -> KernelResult<Option<ActiveSession>> {
    let row = sqlx::query(
        "SELECT id, agent_id, task_id, trigger_type, inbox_message_id, task_description, \
         started_at, last_heartbeat_at FROM active_sessions WHERE id = ?",
    )
    .bind(session_id.to_string())
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(row_to_session).transpose()
}

pub async fn heartbeat(store: &Store, task_id: Uuid) -> KernelResult<u64> {
    let result = sqlx::query("UPDATE active_sessions SET last_heartbeat_at = ? WHERE task_id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected())
}

pub async fn end(store: &Store, session_id: Uuid) -> KernelResult<bool> {
    let result = sqlx::query("DELETE FROM active_sessions WHERE id = ?")
        .bind(session_id.to_string())
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn end_by_task(store: &Store, task_id: Uuid) -> KernelResult<u64> {
    let result = sqlx::query("DELETE FROM active_sessions WHERE task_id = ?")
        .bind(task_id.to_string())
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected())
}

/// Deletes rows whose heartbeat is older than `max_age_minutes`.
pub async fn cleanup_stale(store: &Store, max_age_minutes: i64) -> KernelResult<u64> {
    let cutoff = (Utc::now() - Duration::minutes(max_age_minutes)).to_rfc3339();
    let result = sqlx::query("DELETE FROM active_sessions WHERE last_heartbeat_at < ?")
        .bind(cutoff)
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected())
}

pub async fn list(store: &Store, agent_id: Option<Uuid>) -> KernelResult<Vec<ActiveSession>> {
    let rows = match agent_id {
        Some(agent_id) => {
            sqlx::query(
                "SELECT id, agent_id, task_id, trigger_type, inbox_message_id, task_description, \
                 started_at, last_heartbeat_at FROM active_sessions WHERE agent_id = ? ORDER BY started_at ASC",
            )
            .bind(agent_id.to_string())
            .fetch_all(store.pool())
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, agent_id, task_id, trigger_type, inbox_message_id, task_description, \
                 started_at, last_heartbeat_at FROM active_sessions ORDER BY started_at ASC",
            )
            .fetch_all(store.pool())
            .await?
        }
    };
    rows.iter().map(row_to_session).collect()
}

pub async fn append_log(
    store: &Store,
    agent_id: Uuid,
    task_id: Option<Uuid>,
    session_id: Option<&str>,
    line: &str,
) -> KernelResult<SessionLog> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO session_logs (id, agent_id, task_id, session_id, line, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(agent_id.to_string())
    .bind(task_id.map(|t| t.to_string()))
    .bind(session_id)
    .bind(line)
    .bind(now.to_rfc3339())
    .execute(store.pool())
    .await?;

    Ok(SessionLog {
        id,
        agent_id,
        task_id,
        session_id: session_id.map(String::from),
        line: line.to_string(),
        created_at: now,
    })
}

pub async fn record_cost(
    store: &Store,
    agent_id: Uuid,
    task_id: Option<Uuid>,
    session_id: Option<&str>,
    input_tokens: i64,
    output_tokens: i64,
    total_cost_usd: f64,
) -> KernelResult<SessionCost> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO session_costs (id, agent_id, task_id, session_id, input_tokens, \
         output_tokens, total_cost_usd, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(agent_id.to_string())
    .bind(task_id.map(|t| t.to_string()))
    .bind(session_id)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(total_cost_usd)
    .bind(now.to_rfc3339())
    .execute(store.pool())
    .await?;

    Ok(SessionCost {
        id,
        agent_id,
        task_id,
        session_id: session_id.map(String::from),
        input_tokens,
        output_tokens,
        total_cost_usd,
        created_at: now,
    })
}

pub async fn list_costs(store: &Store, agent_id: Option<Uuid>) -> KernelResult<Vec<SessionCost>> {
    let rows: Vec<(String, String, Option<String>, Option<String>, i64, i64, f64, String)> = match agent_id {
        Some(agent_id) => {
            sqlx::query_as(
                "SELECT id, agent_id, task_id, session_id, input_tokens, output_tokens, \
                 total_cost_usd, created_at FROM session_costs WHERE agent_id = ? ORDER BY created_at DESC",
            )
            .bind(agent_id.to_string())
            .fetch_all(store.pool())
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT id, agent_id, task_id, session_id, input_tokens, output_tokens, \
                 total_cost_usd, created_at FROM session_costs ORDER BY created_at DESC",
            )
            .fetch_all(store.pool())
            .await?
        }
    };

    rows.into_iter()
        .map(|(id, agent_id, task_id, session_id, input_tokens, output_tokens, total_cost_usd, created_at)| {
            Ok(SessionCost {
                id: Uuid::parse_str(&id).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
                agent_id: Uuid::parse_str(&agent_id).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
                task_id: task_id
                    .map(|s| Uuid::parse_str(&s))
                    .transpose()
                    .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
                session_id,
                input_tokens,
                output_tokens,
                total_cost_usd,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
                    .with_timezone(&Utc),
            })
        })
        .collect()
}

pub struct CostSummary {
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost_usd: f64,
    pub session_count: i64,
}

pub async fn cost_summary(store: &Store, agent_id: Option<Uuid>) -> KernelResult<CostSummary> {
    let row = match agent_id {
        Some(agent_id) => {
            sqlx::query(
                "SELECT COALESCE(SUM(input_tokens),0) as ti, COALESCE(SUM(output_tokens),0) as to_, \
                 COALESCE(SUM(total_cost_usd),0.0) as tc, COUNT(*) as n \
                 FROM session_costs WHERE agent_id = ?",
            )
            .bind(agent_id.to_string())
            .fetch_one(store.pool())
            .await?
        }
        None => {
            sqlx::query(
                "SELECT COALESCE(SUM(input_tokens),0) as ti, COALESCE(SUM(output_tokens),0) as to_, \
                 COALESCE(SUM(total_cost_usd),0.0) as tc, COUNT(*) as n FROM session_costs",
            )
            .fetch_one(store.pool())
            .await?
        }
    };

    Ok(CostSummary {
        total_input_tokens: row.try_get("ti")?,
        total_output_tokens: row.try_get("to_")?,
        total_cost_usd: row.try_get("tc")?,
        session_count: row.try_get("n")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn cleanup_stale_removes_old_heartbeats() {
        let store = test_store().await;
        let agent = Uuid::new_v4();
        let session = start(&store, agent, None, "manual", None, None).await.unwrap();

        sqlx::query("UPDATE active_sessions SET last_heartbeat_at = ? WHERE id = ?")
            .bind((Utc::now() - Duration::minutes(60)).to_rfc3339())
            .bind(session.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let removed = cleanup_stale(&store, 30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(fetch_by_id(&store, session.id).await.unwrap().is_none());
    }
}
