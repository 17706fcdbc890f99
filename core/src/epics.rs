/// Epic Aggregate.
use crate::errors::{KernelError, KernelResult};
use crate::inbox;
use crate::models::{to_json_text, Epic, EpicProgress, EpicStatus};
use crate::store::Store;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

const EPIC_COLUMNS: &str = "id, name, goal, status, priority, tags, lead_agent_id, channel_id, \
    progress_notified_at, created_at, last_updated_at, started_at, completed_at";

fn row_to_epic(row: &SqliteRow) -> KernelResult<Epic> {
    let id_text: String = row.try_get("id")?;
    let status_text: String = row.try_get("status")?;
    let tags_text: String = row.try_get("tags")?;
    let lead_agent_id: Option<String> = row.try_get("lead_agent_id")?;
    let channel_id_text: String = row.try_get("channel_id")?;
    let progress_notified_at: Option<String> = row.try_get("progress_notified_at")?;
    let created_at_text: String = row.try_get("created_at")?;
    let last_updated_text: String = row.try_get("last_updated_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    let parse_ts = |raw: Option<String>| -> KernelResult<Option<chrono::DateTime<Utc>>> {
        raw.map(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| KernelError::StoreUnavailable(e.to_string()))
        })
        .transpose()
    };

    Ok(Epic {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        name: row.try_get("name")?,
        goal: row.try_get("goal")?,
        status: status_text
            .parse()
            .map_err(|e: String| KernelError::StoreUnavailable(e))?,
        priority: row.try_get("priority")?,
        tags: serde_json::from_str(&tags_text).unwrap_or_default(),
        lead_agent_id: lead_agent_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        channel_id: Uuid::parse_str(&channel_id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        progress_notified_at: parse_ts(progress_notified_at)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        last_updated_at: chrono::DateTime::parse_from_rfc3339(&last_updated_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        started_at: parse_ts(started_at)?,
        completed_at: parse_ts(completed_at)?,
    })
}

/// Lowercase, hyphenate, strip anything that isn't alphanumeric or a hyphen.
fn slugify(name: &str) -> String {
    let lower = name.to_lowercase();
    let mut slug = String::with_capacity(lower.len());
    let mut last_was_hyphen = false;
    for c in lower.chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_was_hyphen = false;
        } else if !last_was_hyphen && !slug.is_empty() {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Creates an epic and auto-provisions its channel (`epic-<slug>`) in the
/// same transaction.
pub async fn create(
    store: &Store,
    name: &str,
    goal: &str,
    priority: i32,
    tags: Vec<String>,
    lead_agent_id: Option<Uuid>,
) -> KernelResult<Epic> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let channel_name = format!("epic-{}", slugify(name));

    let mut tx = store.begin().await?;
    let channel_id = Uuid::new_v4();
    sqlx::query("INSERT INTO channels (id, name, created_by, created_at) VALUES (?, ?, ?, ?)")
        .bind(channel_id.to_string())
        .bind(&channel_name)
        .bind(lead_agent_id.map(|a| a.to_string()))
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO epics (id, name, goal, status, priority, tags, lead_agent_id, channel_id, \
         created_at, last_updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(name)
    .bind(goal)
    .bind(EpicStatus::Draft.as_str())
    .bind(priority)
    .bind(to_json_text(&tags))
    .bind(lead_agent_id.map(|a| a.to_string()))
    .bind(channel_id.to_string())
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    fetch_by_id(store, id).await?.ok_or_else(|| KernelError::NotFound("epic just created".into()))
}

pub async fn fetch_by_id(store: &Store, epic_id: Uuid) -> KernelResult<Option<Epic>> {
    let sql = format!("SELECT {EPIC_COLUMNS} FROM epics WHERE id = ?");
    let row = sqlx::query(&sql).bind(epic_id.to_string()).fetch_optional(store.pool()).await?;
    row.as_ref().map(row_to_epic).transpose()
}

pub async fn list(store: &Store) -> KernelResult<Vec<Epic>> {
    let sql = format!("SELECT {EPIC_COLUMNS} FROM epics ORDER BY created_at ASC");
    let rows = sqlx::query(&sql).fetch_all(store.pool()).await?;
    rows.iter().map(row_to_epic).collect()
}

pub async fn compute_progress(store: &Store, epic_id: Uuid) -> KernelResult<EpicProgress> {
    let row = sqlx::query(
        "SELECT \
            COUNT(*) as total, \
            SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) as completed, \
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) as failed, \
            SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END) as in_progress, \
            SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) as pending, \
            SUM(CASE WHEN status = 'unassigned' THEN 1 ELSE 0 END) as unassigned \
         FROM agent_tasks WHERE epic_id = ?",
    )
    .bind(epic_id.to_string())
    .fetch_one(store.pool())
    .await?;

    Ok(EpicProgress {
        total: row.try_get("total")?,
        completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
        failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        in_progress: row.try_get::<Option<i64>, _>("in_progress")?.unwrap_or(0),
        pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
        unassigned: row.try_get::<Option<i64>, _>("unassigned")?.unwrap_or(0),
    })
}

pub async fn get_epic_with_progress(store: &Store, epic_id: Uuid) -> KernelResult<Option<(Epic, EpicProgress)>> {
    let Some(epic) = fetch_by_id(store, epic_id).await? else {
        return Ok(None);
    };
    let progress = compute_progress(store, epic_id).await?;
    Ok(Some((epic, progress)))
}

/// Active epics whose child-task completions occurred after the epic's own
/// `progressNotifiedAt`: evaluated per-epic against that epic's own latest
/// child completion, so two concurrent
/// dispatcher transactions both reading the same `progressNotifiedAt` will
/// both observe the epic, but whichever commits its
/// `mark_epics_progress_notified` write first moves `progressNotifiedAt` up
/// to (at least) that completion time, so the second transaction's own
/// subsequent poll excludes it.
pub async fn get_epics_with_progress_updates(store: &Store) -> KernelResult<Vec<Epic>> {
    let sql = format!(
        "SELECT {EPIC_COLUMNS} FROM epics WHERE status = ? AND EXISTS ( \
            SELECT 1 FROM agent_tasks \
            WHERE agent_tasks.epic_id = epics.id \
              AND agent_tasks.status = 'completed' \
              AND (epics.progress_notified_at IS NULL \
                   OR agent_tasks.finished_at > epics.progress_notified_at) \
         ) ORDER BY epics.created_at ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(EpicStatus::Active.as_str())
        .fetch_all(store.pool())
        .await?;
    rows.iter().map(row_to_epic).collect()
}

/// Sets `progressNotifiedAt` to the latest completion time among each
/// epic's children, so a subsequent call sees no further "new" completions
/// unless one happened since.
pub async fn mark_epics_progress_notified(store: &Store, epic_ids: &[Uuid]) -> KernelResult<()> {
    for epic_id in epic_ids {
        sqlx::query(
            "UPDATE epics SET progress_notified_at = ( \
                SELECT MAX(finished_at) FROM agent_tasks \
                WHERE epic_id = ? AND status = 'completed' \
             ) WHERE id = ?",
        )
        .bind(epic_id.to_string())
        .bind(epic_id.to_string())
        .execute(store.pool())
        .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Transaction-scoped variants for the trigger dispatcher. The caller owns
// the transaction boundary.
// ---------------------------------------------------------------------

pub(crate) async fn get_epics_with_progress_updates_tx(
    tx: &mut Transaction<'_, Sqlite>,
) -> KernelResult<Vec<Epic>> {
    let sql = format!(
        "SELECT {EPIC_COLUMNS} FROM epics WHERE status = ? AND EXISTS ( \
            SELECT 1 FROM agent_tasks \
            WHERE agent_tasks.epic_id = epics.id \
              AND agent_tasks.status = 'completed' \
              AND (epics.progress_notified_at IS NULL \
                   OR agent_tasks.finished_at > epics.progress_notified_at) \
         ) ORDER BY epics.created_at ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(EpicStatus::Active.as_str())
        .fetch_all(&mut **tx)
        .await?;
    rows.iter().map(row_to_epic).collect()
}

pub(crate) async fn mark_epics_progress_notified_tx(
    tx: &mut Transaction<'_, Sqlite>,
    epic_ids: &[Uuid],
) -> KernelResult<()> {
    for epic_id in epic_ids {
        sqlx::query(
            "UPDATE epics SET progress_notified_at = ( \
                SELECT MAX(finished_at) FROM agent_tasks \
                WHERE epic_id = ? AND status = 'completed' \
             ) WHERE id = ?",
        )
        .bind(epic_id.to_string())
        .bind(epic_id.to_string())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn set_status(store: &Store, epic_id: Uuid, status: EpicStatus) -> KernelResult<Option<Epic>> {
    let now = Utc::now();
    let started_at_clause = if status == EpicStatus::Active {
        ", started_at = COALESCE(started_at, ?)"
    } else {
        ""
    };
    let completed_at_clause = if status == EpicStatus::Completed {
        ", completed_at = ?"
    } else {
        ""
    };

    let sql = format!(
        "UPDATE epics SET status = ?, last_updated_at = ?{started_at_clause}{completed_at_clause} WHERE id = ?"
    );
    let mut query = sqlx::query(&sql).bind(status.as_str()).bind(now.to_rfc3339());
    if status == EpicStatus::Active {
        query = query.bind(now.to_rfc3339());
    }
    if status == EpicStatus::Completed {
        query = query.bind(now.to_rfc3339());
    }
    query = query.bind(epic_id.to_string());

    let result = query.execute(store.pool()).await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }
    fetch_by_id(store, epic_id).await
}

pub fn resolve_default_channel() -> Uuid {
    inbox::default_channel_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateTaskOptions;
    use crate::tasks;

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_auto_provisions_slugified_channel() {
        let store = test_store().await;
        let epic = create(&store, "My Big Launch!", "ship it", 0, vec![], None).await.unwrap();
        let channel = inbox::fetch_channel(&store, epic.channel_id).await.unwrap().unwrap();
        assert_eq!(channel.name, "epic-my-big-launch");
    }

    #[tokio::test]
    async fn progress_percent_reflects_completed_children() {
        let store = test_store().await;
        let epic = create(&store, "Launch", "ship", 0, vec![], None).await.unwrap();
        let agent = Uuid::new_v4();

        let t1 = tasks::create(
            &store,
            "t1",
            CreateTaskOptions {
                agent_id: Some(agent),
                epic_id: Some(epic.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tasks::create(
            &store,
            "t2",
            CreateTaskOptions {
                agent_id: Some(agent),
                epic_id: Some(epic.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        tasks::start(&store, t1.id).await.unwrap();
        tasks::complete(&store, t1.id, None).await.unwrap();

        let progress = compute_progress(&store, epic.id).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.percent(), 50);
    }

    #[tokio::test]
    async fn progress_notification_is_not_repeated_without_new_completions() {
        let store = test_store().await;
        let epic = create(&store, "Launch", "ship", 0, vec![], None).await.unwrap();
        set_status(&store, epic.id, EpicStatus::Active).await.unwrap();
        let agent = Uuid::new_v4();

        let t1 = tasks::create(
            &store,
            "t1",
            CreateTaskOptions {
                agent_id: Some(agent),
                epic_id: Some(epic.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tasks::start(&store, t1.id).await.unwrap();
        tasks::complete(&store, t1.id, None).await.unwrap();

        let due = get_epics_with_progress_updates(&store).await.unwrap();
        assert_eq!(due.len(), 1);
        mark_epics_progress_notified(&store, &[epic.id]).await.unwrap();

        let due_again = get_epics_with_progress_updates(&store).await.unwrap();
        assert!(due_again.is_empty());
    }
}
