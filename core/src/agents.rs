/// Agent Registry & Capacity.
use crate::errors::{KernelError, KernelResult};
use crate::models::{
    to_json_text, Agent, AgentStatus, ChangeSource, ContextVersion, PersonaFields,
    AGENT_ROLE_MAX_CHARS, PERSONA_FIELD_MAX_BYTES,
};
use crate::store::Store;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

pub const MAX_EMPTY_POLLS: i32 = 2;

const AGENT_COLUMNS: &str = "id, name, is_lead, status, max_tasks, empty_poll_count, role, \
    description, capabilities, claude_md, soul_md, identity_md, setup_script, tools_md, \
    created_at, last_updated_at";

fn row_to_agent(row: &SqliteRow) -> KernelResult<Agent> {
    let id_text: String = row.try_get("id")?;
    let status_text: String = row.try_get("status")?;
    let capabilities_text: String = row.try_get("capabilities")?;
    let created_at_text: String = row.try_get("created_at")?;
    let last_updated_text: String = row.try_get("last_updated_at")?;

    Ok(Agent {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        name: row.try_get("name")?,
        is_lead: row.try_get::<i64, _>("is_lead")? != 0,
        status: status_text
            .parse()
            .map_err(|e: String| KernelError::StoreUnavailable(e))?,
        max_tasks: row.try_get("max_tasks")?,
        empty_poll_count: row.try_get("empty_poll_count")?,
        role: row.try_get("role")?,
        description: row.try_get("description")?,
        capabilities: serde_json::from_str(&capabilities_text).unwrap_or_default(),
        claude_md: row.try_get("claude_md")?,
        soul_md: row.try_get("soul_md")?,
        identity_md: row.try_get("identity_md")?,
        setup_script: row.try_get("setup_script")?,
        tools_md: row.try_get("tools_md")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        last_updated_at: chrono::DateTime::parse_from_rfc3339(&last_updated_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn fetch_by_id(store: &Store, agent_id: Uuid) -> KernelResult<Option<Agent>> {
    let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(row_to_agent).transpose()
}

pub async fn fetch_by_name(store: &Store, name: &str) -> KernelResult<Option<Agent>> {
    let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?");
    let row = sqlx::query(&sql).bind(name).fetch_optional(store.pool()).await?;
    row.as_ref().map(row_to_agent).transpose()
}

pub async fn list(store: &Store) -> KernelResult<Vec<Agent>> {
    let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at ASC");
    let rows = sqlx::query(&sql).fetch_all(store.pool()).await?;
    rows.iter().map(row_to_agent).collect()
}

/// Idempotent upsert; if the agent already exists and is `offline`,
/// transitions it to `idle`.
pub async fn register(
    store: &Store,
    id: Option<Uuid>,
    name: &str,
    is_lead: bool,
    profile: PersonaFields,
) -> KernelResult<Agent> {
    if let Some(existing) = fetch_by_name(store, name).await? {
        if existing.status == AgentStatus::Offline {
            let mut tx = store.begin().await?;
            sqlx::query("UPDATE agents SET status = ?, empty_poll_count = 0, last_updated_at = ? WHERE id = ?")
                .bind(AgentStatus::Idle.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(existing.id.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        return fetch_by_id(store, existing.id)
            .await?
            .ok_or_else(|| KernelError::NotFound(format!("agent {}", existing.id)));
    }

    let id = id.unwrap_or_else(Uuid::new_v4);
    let now = Utc::now();
    let mut tx = store.begin().await?;
    sqlx::query(
        "INSERT INTO agents (id, name, is_lead, status, max_tasks, empty_poll_count, role, \
         description, capabilities, claude_md, soul_md, identity_md, setup_script, tools_md, \
         created_at, last_updated_at) \
         VALUES (?, ?, ?, ?, 1, 0, '', '', '[]', ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(name)
    .bind(is_lead as i64)
    .bind(AgentStatus::Idle.as_str())
    .bind(profile.claude_md.as_deref())
    .bind(profile.soul_md.as_deref())
    .bind(profile.identity_md.as_deref())
    .bind(profile.setup_script.as_deref())
    .bind(profile.tools_md.as_deref())
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    fetch_by_id(store, id).await?.ok_or_else(|| KernelError::NotFound("agent just created".into()))
}

/// Bumps `lastUpdatedAt`; `offline → idle`; preserves `busy`.
pub async fn heartbeat(store: &Store, agent_id: Uuid) -> KernelResult<Option<Agent>> {
    let Some(agent) = fetch_by_id(store, agent_id).await? else {
        return Ok(None);
    };

    let mut tx = store.begin().await?;
    let new_status = if agent.status == AgentStatus::Offline {
        AgentStatus::Idle
    } else {
        agent.status
    };
    sqlx::query("UPDATE agents SET status = ?, last_updated_at = ? WHERE id = ?")
        .bind(new_status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    fetch_by_id(store, agent_id).await
}

/// `status → offline`.
pub async fn close(store: &Store, agent_id: Uuid) -> KernelResult<Option<Agent>> {
    let mut tx = store.begin().await?;
    let result = sqlx::query("UPDATE agents SET status = ?, last_updated_at = ? WHERE id = ?")
        .bind(AgentStatus::Offline.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }
    tx.commit().await?;
    fetch_by_id(store, agent_id).await
}

/// Recomputes `status` from in-flight task counts: `offline` stays
/// `offline`; else `busy` iff `activeCount > 0`; else `idle`. Called after
/// every status-relevant mutation.
pub async fn derive_capacity(store: &Store, agent_id: Uuid) -> KernelResult<Option<Agent>> {
    let Some(agent) = fetch_by_id(store, agent_id).await? else {
        return Ok(None);
    };
    if agent.status == AgentStatus::Offline {
        return Ok(Some(agent));
    }

    let active_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM agent_tasks WHERE agent_id = ? AND status = 'in_progress'",
    )
    .bind(agent_id.to_string())
    .fetch_one(store.pool())
    .await?;

    let new_status = if active_count > 0 { AgentStatus::Busy } else { AgentStatus::Idle };
    if new_status != agent.status {
        let mut tx = store.begin().await?;
        sqlx::query("UPDATE agents SET status = ?, last_updated_at = ? WHERE id = ?")
            .bind(new_status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(agent_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    fetch_by_id(store, agent_id).await
}

pub fn has_capacity(agent: &Agent, active_count: i64) -> bool {
    active_count < agent.max_tasks as i64
}

/// Increments `emptyPollCount`; returns the new count. Any non-null poll
/// response should call `reset_empty_polls` instead.
pub async fn increment_empty_polls(store: &Store, agent_id: Uuid) -> KernelResult<i32> {
    let mut tx = store.begin().await?;
    sqlx::query("UPDATE agents SET empty_poll_count = empty_poll_count + 1 WHERE id = ?")
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    let count: i32 = sqlx::query_scalar("SELECT empty_poll_count FROM agents WHERE id = ?")
        .bind(agent_id.to_string())
        .fetch_one(store.pool())
        .await?;
    Ok(count)
}

pub async fn reset_empty_polls(store: &Store, agent_id: Uuid) -> KernelResult<()> {
    sqlx::query("UPDATE agents SET empty_poll_count = 0 WHERE id = ?")
        .bind(agent_id.to_string())
        .execute(store.pool())
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------
// Transaction-scoped variants for the trigger dispatcher. The caller owns
// the transaction boundary.
// ---------------------------------------------------------------------

pub(crate) async fn fetch_by_id_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<Option<Agent>> {
    let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(agent_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_agent).transpose()
}

pub(crate) async fn reset_empty_polls_tx(tx: &mut Transaction<'_, Sqlite>, agent_id: Uuid) -> KernelResult<()> {
    sqlx::query("UPDATE agents SET empty_poll_count = 0 WHERE id = ?")
        .bind(agent_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) async fn increment_empty_polls_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<i32> {
    sqlx::query("UPDATE agents SET empty_poll_count = empty_poll_count + 1 WHERE id = ?")
        .bind(agent_id.to_string())
        .execute(&mut **tx)
        .await?;
    let count: i32 = sqlx::query_scalar("SELECT empty_poll_count FROM agents WHERE id = ?")
        .bind(agent_id.to_string())
        .fetch_one(&mut **tx)
        .await?;
    Ok(count)
}

/// `true` once `emptyPollCount` has reached `MAX_EMPTY_POLLS` consecutive
/// empty responses — the worker loop should sleep or exit.
pub async fn is_poll_blocked(store: &Store, agent_id: Uuid) -> KernelResult<bool> {
    let count: i32 = sqlx::query_scalar("SELECT empty_poll_count FROM agents WHERE id = ?")
        .bind(agent_id.to_string())
        .fetch_one(store.pool())
        .await?;
    Ok(count >= MAX_EMPTY_POLLS)
}

/// Update with per-field content-hash versioning. `null` in
/// `PersonaFields` means "leave unchanged"; identical content (same SHA-256)
/// produces no new `ContextVersion`.
pub async fn update_profile(
    store: &Store,
    agent_id: Uuid,
    update: PersonaFields,
    change_source: ChangeSource,
    changed_by_agent_id: Option<Uuid>,
    change_reason: Option<&str>,
) -> KernelResult<Option<Agent>> {
    if fetch_by_id(store, agent_id).await?.is_none() {
        return Ok(None);
    }

    let mut tx = store.begin().await?;
    let now = Utc::now();

    for (field, content) in update.present_fields() {
        if content.len() > PERSONA_FIELD_MAX_BYTES {
            return Err(KernelError::bad_request(
                field,
                format!("exceeds {PERSONA_FIELD_MAX_BYTES} byte limit"),
            ));
        }

        let new_hash = format!("{:x}", Sha256::digest(content.as_bytes()));

        let latest: Option<(String, String)> = sqlx::query_as(
            "SELECT id, content_hash FROM context_versions WHERE agent_id = ? AND field = ? \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(agent_id.to_string())
        .bind(field)
        .fetch_optional(&mut *tx)
        .await?;

        let (prev_version, prev_id, unchanged) = match &latest {
            Some((id, hash)) => {
                let version: i32 = sqlx::query_scalar(
                    "SELECT version FROM context_versions WHERE agent_id = ? AND field = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(agent_id.to_string())
                .bind(field)
                .fetch_one(&mut *tx)
                .await?;
                (version, Some(id.clone()), *hash == new_hash)
            }
            None => (0, None, false),
        };

        if unchanged {
            continue;
        }

        sqlx::query(
            "INSERT INTO context_versions (id, agent_id, field, content, version, change_source, \
             changed_by_agent_id, change_reason, content_hash, previous_version_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(agent_id.to_string())
        .bind(field)
        .bind(content)
        .bind(prev_version + 1)
        .bind(change_source.as_str())
        .bind(changed_by_agent_id.map(|a| a.to_string()))
        .bind(change_reason)
        .bind(&new_hash)
        .bind(prev_id)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }

    // Only role/description live directly on the agent row alongside the
    // raw persona text; content-hash history always lives in context_versions.
    if let Some(claude_md) = &update.claude_md {
        sqlx::query("UPDATE agents SET claude_md = ?, last_updated_at = ? WHERE id = ?")
            .bind(claude_md)
            .bind(now.to_rfc3339())
            .bind(agent_id.to_string())
            .execute(&mut *tx)
            .await?;
    }
    if let Some(v) = &update.soul_md {
        sqlx::query("UPDATE agents SET soul_md = ?, last_updated_at = ? WHERE id = ?")
            .bind(v)
            .bind(now.to_rfc3339())
            .bind(agent_id.to_string())
            .execute(&mut *tx)
            .await?;
    }
    if let Some(v) = &update.identity_md {
        sqlx::query("UPDATE agents SET identity_md = ?, last_updated_at = ? WHERE id = ?")
            .bind(v)
            .bind(now.to_rfc3339())
            .bind(agent_id.to_string())
            .execute(&mut *tx)
            .await?;
    }
    if let Some(v) = &update.setup_script {
        sqlx::query("UPDATE agents SET setup_script = ?, last_updated_at = ? WHERE id = ?")
            .bind(v)
            .bind(now.to_rfc3339())
            .bind(agent_id.to_string())
            .execute(&mut *tx)
            .await?;
    }
    if let Some(v) = &update.tools_md {
        sqlx::query("UPDATE agents SET tools_md = ?, last_updated_at = ? WHERE id = ?")
            .bind(v)
            .bind(now.to_rfc3339())
            .bind(agent_id.to_string())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    fetch_by_id(store, agent_id).await
}

/// Updates `role` (≤100 chars) and/or `description`, independent of the
/// content-hash-versioned persona fields.
pub async fn update_role(store: &Store, agent_id: Uuid, role: &str, description: Option<&str>) -> KernelResult<Option<Agent>> {
    if role.chars().count() > AGENT_ROLE_MAX_CHARS {
        return Err(KernelError::bad_request(
            "role",
            format!("exceeds {AGENT_ROLE_MAX_CHARS} character limit"),
        ));
    }
    let mut tx = store.begin().await?;
    let result = sqlx::query(
        "UPDATE agents SET role = ?, description = COALESCE(?, description), last_updated_at = ? WHERE id = ?",
    )
    .bind(role)
    .bind(description)
    .bind(Utc::now().to_rfc3339())
    .bind(agent_id.to_string())
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        tx.commit().await?;
        return Ok(None);
    }
    tx.commit().await?;
    fetch_by_id(store, agent_id).await
}

pub async fn latest_context_version(
    store: &Store,
    agent_id: Uuid,
    field: &str,
) -> KernelResult<Option<ContextVersion>> {
    let row = sqlx::query(
        "SELECT id, agent_id, field, content, version, change_source, changed_by_agent_id, \
         change_reason, content_hash, previous_version_id, created_at \
         FROM context_versions WHERE agent_id = ? AND field = ? ORDER BY version DESC LIMIT 1",
    )
    .bind(agent_id.to_string())
    .bind(field)
    .fetch_optional(store.pool())
    .await?;

    let Some(row) = row else { return Ok(None) };
    let id: String = row.try_get("id")?;
    let agent_id_text: String = row.try_get("agent_id")?;
    let change_source_text: String = row.try_get("change_source")?;
    let changed_by: Option<String> = row.try_get("changed_by_agent_id")?;
    let previous_version_id: Option<String> = row.try_get("previous_version_id")?;
    let created_at_text: String = row.try_get("created_at")?;

    Ok(Some(ContextVersion {
        id: Uuid::parse_str(&id).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        agent_id: Uuid::parse_str(&agent_id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        field: row.try_get("field")?,
        content: row.try_get("content")?,
        version: row.try_get("version")?,
        change_source: change_source_text
            .parse()
            .map_err(|e: String| KernelError::StoreUnavailable(e))?,
        changed_by_agent_id: changed_by
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        change_reason: row.try_get("change_reason")?,
        content_hash: row.try_get("content_hash")?,
        previous_version_id: previous_version_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
    }))
}

pub fn capabilities_json(agent: &Agent) -> String {
    to_json_text(&agent.capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent_by_name() {
        let store = test_store().await;
        let a = register(&store, None, "worker-1", false, PersonaFields::default()).await.unwrap();
        let b = register(&store, None, "worker-1", false, PersonaFields::default()).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn register_reactivates_offline_agent() {
        let store = test_store().await;
        let a = register(&store, None, "worker-1", false, PersonaFields::default()).await.unwrap();
        close(&store, a.id).await.unwrap();
        let b = register(&store, None, "worker-1", false, PersonaFields::default()).await.unwrap();
        assert_eq!(b.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn identical_profile_update_creates_no_new_version() {
        let store = test_store().await;
        let agent = register(&store, None, "worker-1", false, PersonaFields::default()).await.unwrap();

        let update = PersonaFields {
            soul_md: Some("hello".into()),
            ..Default::default()
        };
        update_profile(&store, agent.id, update.clone(), ChangeSource::Api, None, None)
            .await
            .unwrap();
        let v1 = latest_context_version(&store, agent.id, "soulMd").await.unwrap().unwrap();
        assert_eq!(v1.version, 1);

        update_profile(&store, agent.id, update, ChangeSource::Api, None, None).await.unwrap();
        let v1_again = latest_context_version(&store, agent.id, "soulMd").await.unwrap().unwrap();
        assert_eq!(v1_again.version, 1);

        let update2 = PersonaFields {
            soul_md: Some("hello!".into()),
            ..Default::default()
        };
        update_profile(&store, agent.id, update2, ChangeSource::Api, None, None).await.unwrap();
        let v2 = latest_context_version(&store, agent.id, "soulMd").await.unwrap().unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous_version_id, Some(v1.id));
    }

    #[tokio::test]
    async fn capacity_derivation_matches_in_progress_count() {
        let store = test_store().await;
        let agent = register(&store, None, "worker-1", false, PersonaFields::default()).await.unwrap();

        let after_idle = derive_capacity(&store, agent.id).await.unwrap().unwrap();
        assert_eq!(after_idle.status, AgentStatus::Idle);

        let opts = crate::models::CreateTaskOptions {
            agent_id: Some(agent.id),
            ..Default::default()
        };
        let task = crate::tasks::create(&store, "build", opts).await.unwrap();
        crate::tasks::start(&store, task.id).await.unwrap();

        let after_busy = derive_capacity(&store, agent.id).await.unwrap().unwrap();
        assert_eq!(after_busy.status, AgentStatus::Busy);
    }
}
