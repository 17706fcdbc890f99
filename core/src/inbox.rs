/// Inbox & Channels.
///
/// Two parallel substrates sharing the same claim/release shape: channel
/// mention processing locks, and per-agent inbox message claims. Both use an
/// advisory-lock column (`processingSince` / `status='processing'`) so two
/// concurrent pollers never duplicate work.
use crate::errors::{KernelError, KernelResult};
use crate::models::{
    to_json_text, Channel, ChannelMessage, CreateTaskOptions, InboxMessage, InboxStatus,
    TaskSource, DEFAULT_CHANNEL_ID,
};
use crate::store::Store;
use crate::tasks;
use chrono::{Duration, Utc};
use regex::Regex;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::sync::OnceLock;
use uuid::Uuid;

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9_-]+)").unwrap())
}

fn task_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*/task\b").unwrap())
}

fn new_message_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<new_message>(.*?)</new_message>").unwrap())
}

fn thread_history_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<thread_history>(.*?)</thread_history>").unwrap())
}

/// Extracts `@agent-name` mentions as raw token strings (caller resolves
/// against the agent registry — this module has no name→id dependency).
pub fn extract_mention_tokens(content: &str) -> Vec<String> {
    mention_regex()
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect()
}

pub fn has_task_prefix(content: &str) -> bool {
    task_prefix_regex().is_match(content)
}

/// Parsed structure of an inbox message body that embeds `<new_message>`
/// and/or `<thread_history>` blocks. The raw body is always preserved
/// verbatim on the row; this is a read-side convenience.
#[derive(Debug, Clone, Default)]
pub struct ParsedInboxContent {
    pub new_message: Option<String>,
    pub thread_history: Option<String>,
}

pub fn parse_inbox_content(content: &str) -> ParsedInboxContent {
    ParsedInboxContent {
        new_message: new_message_block_regex()
            .captures(content)
            .map(|c| c[1].trim().to_string()),
        thread_history: thread_history_block_regex()
            .captures(content)
            .map(|c| c[1].trim().to_string()),
    }
}

// ---------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------

fn row_to_channel(row: &SqliteRow) -> KernelResult<Channel> {
    let id_text: String = row.try_get("id")?;
    let created_by: Option<String> = row.try_get("created_by")?;
    let created_at_text: String = row.try_get("created_at")?;
    Ok(Channel {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        name: row.try_get("name")?,
        created_by: created_by
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn create_channel(store: &Store, name: &str, created_by: Option<Uuid>) -> KernelResult<Channel> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query("INSERT INTO channels (id, name, created_by, created_at) VALUES (?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(name)
        .bind(created_by.map(|a| a.to_string()))
        .bind(now.to_rfc3339())
        .execute(store.pool())
        .await?;
    fetch_channel(store, id).await?.ok_or_else(|| KernelError::NotFound("channel just created".into()))
}

pub async fn fetch_channel(store: &Store, channel_id: Uuid) -> KernelResult<Option<Channel>> {
    let row = sqlx::query("SELECT id, name, created_by, created_at FROM channels WHERE id = ?")
        .bind(channel_id.to_string())
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(row_to_channel).transpose()
}

/// Posts a message, records extracted mentions, and — if the body starts
/// with `/task` — synthesises one `AgentTask` per distinct mentioned agent
/// (direct assignment, `pending`). Threaded replies with no explicit
/// mentions inherit the parent's mentions for notification only, never for
/// task creation.
pub async fn post_message(
    store: &Store,
    channel_id: Uuid,
    author_agent_id: Option<Uuid>,
    content: &str,
    thread_parent_id: Option<Uuid>,
    resolve_mention: impl Fn(&str) -> Option<Uuid>,
) -> KernelResult<ChannelMessage> {
    let mut explicit_mentions: Vec<Uuid> = extract_mention_tokens(content)
        .into_iter()
        .filter_map(|token| resolve_mention(&token))
        .collect();
    explicit_mentions.sort();
    explicit_mentions.dedup();

    let notify_mentions = if explicit_mentions.is_empty() {
        if let Some(parent_id) = thread_parent_id {
            fetch_message(store, parent_id).await?.map(|m| m.mentions).unwrap_or_default()
        } else {
            Vec::new()
        }
    } else {
        explicit_mentions.clone()
    };

    let id = Uuid::new_v4();
    let now = Utc::now();
    let mut tx = store.begin().await?;
    sqlx::query(
        "INSERT INTO channel_messages (id, channel_id, author_agent_id, content, mentions, \
         thread_parent_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(channel_id.to_string())
    .bind(author_agent_id.map(|a| a.to_string()))
    .bind(content)
    .bind(to_json_text(&notify_mentions))
    .bind(thread_parent_id.map(|t| t.to_string()))
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await?;

    if has_task_prefix(content) {
        for agent_id in &explicit_mentions {
            let opts = CreateTaskOptions {
                agent_id: Some(*agent_id),
                creator_agent_id: author_agent_id,
                source: Some(TaskSource::Slack),
                mention_message_id: Some(id),
                mention_channel_id: Some(channel_id),
                ..Default::default()
            };
            tasks::create(store, content, opts).await?;
        }
    }

    tx.commit().await?;
    fetch_message(store, id).await?.ok_or_else(|| KernelError::NotFound("message just created".into()))
}

fn row_to_message(row: &SqliteRow) -> KernelResult<ChannelMessage> {
    let id_text: String = row.try_get("id")?;
    let channel_id_text: String = row.try_get("channel_id")?;
    let author: Option<String> = row.try_get("author_agent_id")?;
    let mentions_text: String = row.try_get("mentions")?;
    let thread_parent: Option<String> = row.try_get("thread_parent_id")?;
    let created_at_text: String = row.try_get("created_at")?;

    Ok(ChannelMessage {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        channel_id: Uuid::parse_str(&channel_id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        author_agent_id: author
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        content: row.try_get("content")?,
        mentions: serde_json::from_str(&mentions_text).unwrap_or_default(),
        thread_parent_id: thread_parent
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn fetch_message(store: &Store, message_id: Uuid) -> KernelResult<Option<ChannelMessage>> {
    let row = sqlx::query(
        "SELECT id, channel_id, author_agent_id, content, mentions, thread_parent_id, created_at \
         FROM channel_messages WHERE id = ?",
    )
    .bind(message_id.to_string())
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(row_to_message).transpose()
}

pub async fn list_messages(store: &Store, channel_id: Uuid, limit: i64) -> KernelResult<Vec<ChannelMessage>> {
    let rows = sqlx::query(
        "SELECT id, channel_id, author_agent_id, content, mentions, thread_parent_id, created_at \
         FROM channel_messages WHERE channel_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(channel_id.to_string())
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(row_to_message).collect()
}

async fn last_read_at(store: &Store, agent_id: Uuid, channel_id: Uuid) -> KernelResult<chrono::DateTime<Utc>> {
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT last_read_at FROM channel_read_state WHERE agent_id = ? AND channel_id = ?",
    )
    .bind(agent_id.to_string())
    .bind(channel_id.to_string())
    .fetch_optional(store.pool())
    .await?;
    match raw {
        Some(s) => Ok(chrono::DateTime::parse_from_rfc3339(&s)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc)),
        None => Ok(chrono::DateTime::<Utc>::MIN_UTC),
    }
}

pub async fn channel_ids_with_unread_mentions_for(store: &Store, agent_id: Uuid) -> KernelResult<Vec<Uuid>> {
    let channel_rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM channels")
        .fetch_all(store.pool())
        .await?;

    let mut result = Vec::new();
    for (channel_id_text,) in channel_rows {
        let channel_id = Uuid::parse_str(&channel_id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
        let read_at = last_read_at(store, agent_id, channel_id).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_messages WHERE channel_id = ? AND created_at > ? \
             AND mentions LIKE ?",
        )
        .bind(channel_id.to_string())
        .bind(read_at.to_rfc3339())
        .bind(format!("%{}%", agent_id))
        .fetch_one(store.pool())
        .await?;
        if count > 0 {
            result.push(channel_id);
        }
    }
    Ok(result)
}

/// For each channel with unread mentions for `agent_id`, try to set
/// `processingSince = now` iff currently null. Returns the channels actually
/// claimed.
pub async fn claim_mentions(store: &Store, agent_id: Uuid) -> KernelResult<Vec<Uuid>> {
    let candidates = channel_ids_with_unread_mentions_for(store, agent_id).await?;
    let mut claimed = Vec::new();

    let mut tx = store.begin().await?;
    for channel_id in candidates {
        let result = sqlx::query(
            "INSERT INTO channel_read_state (agent_id, channel_id, last_read_at, processing_since) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(agent_id, channel_id) DO UPDATE SET processing_since = excluded.processing_since \
             WHERE channel_read_state.processing_since IS NULL",
        )
        .bind(agent_id.to_string())
        .bind(channel_id.to_string())
        .bind(chrono::DateTime::<Utc>::MIN_UTC.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() > 0 {
            claimed.push(channel_id);
        }
    }
    tx.commit().await?;
    Ok(claimed)
}

pub async fn count_unread_mentions(store: &Store, agent_id: Uuid, channel_ids: &[Uuid]) -> KernelResult<i64> {
    let mut total = 0i64;
    for channel_id in channel_ids {
        let read_at = last_read_at(store, agent_id, *channel_id).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_messages WHERE channel_id = ? AND created_at > ? \
             AND mentions LIKE ?",
        )
        .bind(channel_id.to_string())
        .bind(read_at.to_rfc3339())
        .bind(format!("%{}%", agent_id))
        .fetch_one(store.pool())
        .await?;
        total += count;
    }
    Ok(total)
}

/// Clears `processingSince` and bumps `lastReadAt` for the given channels
/// once the worker has handled them.
pub async fn release_mention_processing(store: &Store, agent_id: Uuid, channel_ids: &[Uuid]) -> KernelResult<()> {
    let now = Utc::now().to_rfc3339();
    for channel_id in channel_ids {
        sqlx::query(
            "UPDATE channel_read_state SET processing_since = NULL, last_read_at = ? \
             WHERE agent_id = ? AND channel_id = ?",
        )
        .bind(&now)
        .bind(agent_id.to_string())
        .bind(channel_id.to_string())
        .execute(store.pool())
        .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Transaction-scoped variants for the trigger dispatcher. Same shape as
// the `&Store` versions above; the caller owns the transaction boundary.
// ---------------------------------------------------------------------

async fn last_read_at_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
    channel_id: Uuid,
) -> KernelResult<chrono::DateTime<Utc>> {
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT last_read_at FROM channel_read_state WHERE agent_id = ? AND channel_id = ?",
    )
    .bind(agent_id.to_string())
    .bind(channel_id.to_string())
    .fetch_optional(&mut **tx)
    .await?;
    match raw {
        Some(s) => Ok(chrono::DateTime::parse_from_rfc3339(&s)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc)),
        None => Ok(chrono::DateTime::<Utc>::MIN_UTC),
    }
}

async fn channel_ids_with_unread_mentions_for_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<Vec<Uuid>> {
    let channel_rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM channels")
        .fetch_all(&mut **tx)
        .await?;

    let mut result = Vec::new();
    for (channel_id_text,) in channel_rows {
        let channel_id =
            Uuid::parse_str(&channel_id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
        let read_at = last_read_at_tx(&mut *tx, agent_id, channel_id).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_messages WHERE channel_id = ? AND created_at > ? \
             AND mentions LIKE ?",
        )
        .bind(channel_id.to_string())
        .bind(read_at.to_rfc3339())
        .bind(format!("%{}%", agent_id))
        .fetch_one(&mut **tx)
        .await?;
        if count > 0 {
            result.push(channel_id);
        }
    }
    Ok(result)
}

pub(crate) async fn claim_mentions_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
) -> KernelResult<Vec<Uuid>> {
    let candidates = channel_ids_with_unread_mentions_for_tx(&mut *tx, agent_id).await?;
    let mut claimed = Vec::new();
    for channel_id in candidates {
        let result = sqlx::query(
            "INSERT INTO channel_read_state (agent_id, channel_id, last_read_at, processing_since) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(agent_id, channel_id) DO UPDATE SET processing_since = excluded.processing_since \
             WHERE channel_read_state.processing_since IS NULL",
        )
        .bind(agent_id.to_string())
        .bind(channel_id.to_string())
        .bind(chrono::DateTime::<Utc>::MIN_UTC.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() > 0 {
            claimed.push(channel_id);
        }
    }
    Ok(claimed)
}

pub(crate) async fn count_unread_mentions_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
    channel_ids: &[Uuid],
) -> KernelResult<i64> {
    let mut total = 0i64;
    for channel_id in channel_ids {
        let read_at = last_read_at_tx(&mut *tx, agent_id, *channel_id).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_messages WHERE channel_id = ? AND created_at > ? \
             AND mentions LIKE ?",
        )
        .bind(channel_id.to_string())
        .bind(read_at.to_rfc3339())
        .bind(format!("%{}%", agent_id))
        .fetch_one(&mut **tx)
        .await?;
        total += count;
    }
    Ok(total)
}

pub(crate) async fn release_mention_processing_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: Uuid,
    channel_ids: &[Uuid],
) -> KernelResult<()> {
    let now = Utc::now().to_rfc3339();
    for channel_id in channel_ids {
        sqlx::query(
            "UPDATE channel_read_state SET processing_since = NULL, last_read_at = ? \
             WHERE agent_id = ? AND channel_id = ?",
        )
        .bind(&now)
        .bind(agent_id.to_string())
        .bind(channel_id.to_string())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Periodic sweep: clears `processingSince` older than `timeout_minutes`
/// without advancing `lastReadAt` (the claim was abandoned, not fulfilled).
pub async fn release_stale_mention_processing(store: &Store, timeout_minutes: i64) -> KernelResult<u64> {
    let cutoff = (Utc::now() - Duration::minutes(timeout_minutes)).to_rfc3339();
    let result = sqlx::query(
        "UPDATE channel_read_state SET processing_since = NULL \
         WHERE processing_since IS NOT NULL AND processing_since < ?",
    )
    .bind(cutoff)
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------
// Inbox messages
// ---------------------------------------------------------------------

fn row_to_inbox_message(row: &SqliteRow) -> KernelResult<InboxMessage> {
    let id_text: String = row.try_get("id")?;
    let agent_id_text: String = row.try_get("agent_id")?;
    let status_text: String = row.try_get("status")?;
    let origin_text: Option<String> = row.try_get("origin")?;
    let delegated: Option<String> = row.try_get("delegated_to_task_id")?;
    let created_at_text: String = row.try_get("created_at")?;
    let last_updated_text: String = row.try_get("last_updated_at")?;

    Ok(InboxMessage {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        agent_id: Uuid::parse_str(&agent_id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        content: row.try_get("content")?,
        source: row.try_get("source")?,
        status: status_text
            .parse()
            .map_err(|e: String| KernelError::StoreUnavailable(e))?,
        origin: origin_text.map(|s| serde_json::from_str(&s)).transpose()?,
        delegated_to_task_id: delegated
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        response_text: row.try_get("response_text")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        last_updated_at: chrono::DateTime::parse_from_rfc3339(&last_updated_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn create_inbox_message(
    store: &Store,
    agent_id: Uuid,
    content: &str,
    source: &str,
    origin: Option<serde_json::Value>,
) -> KernelResult<InboxMessage> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO inbox_messages (id, agent_id, content, source, status, origin, created_at, last_updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(agent_id.to_string())
    .bind(content)
    .bind(source)
    .bind(InboxStatus::Unread.as_str())
    .bind(origin.as_ref().map(to_json_text))
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(store.pool())
    .await?;
    fetch_inbox_message(store, id).await?.ok_or_else(|| KernelError::NotFound("inbox message just created".into()))
}

pub async fn fetch_inbox_message(store: &Store, message_id: Uuid) -> KernelResult<Option<InboxMessage>> {
    let row = sqlx::query(
        "SELECT id, agent_id, content, source, status, origin, delegated_to_task_id, response_text, \
         created_at, last_updated_at FROM inbox_messages WHERE id = ?",
    )
    .bind(message_id.to_string())
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(row_to_inbox_message).transpose()
}

pub async fn list_inbox_messages(store: &Store, agent_id: Uuid) -> KernelResult<Vec<InboxMessage>> {
    let rows = sqlx::query(
        "SELECT id, agent_id, content, source, status, origin, delegated_to_task_id, response_text, \
         created_at, last_updated_at FROM inbox_messages WHERE agent_id = ? ORDER BY created_at DESC",
    )
    .bind(agent_id.to_string())
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(row_to_inbox_message).collect()
}

/// Atomically transitions up to `limit` `unread` messages to `processing`
/// and returns them.
pub async fn claim_inbox_messages(store: &Store, agent_id: Uuid, limit: i64) -> KernelResult<Vec<InboxMessage>> {
    let mut tx = store.begin().await?;
    let candidate_ids: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM inbox_messages WHERE agent_id = ? AND status = ? ORDER BY created_at ASC LIMIT ?",
    )
    .bind(agent_id.to_string())
    .bind(InboxStatus::Unread.as_str())
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    let mut claimed_ids = Vec::new();
    for (id_text,) in candidate_ids {
        let result = sqlx::query(
            "UPDATE inbox_messages SET status = ?, last_updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(InboxStatus::Processing.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(&id_text)
        .bind(InboxStatus::Unread.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() > 0 {
            claimed_ids.push(id_text);
        }
    }
    tx.commit().await?;

    let mut out = Vec::with_capacity(claimed_ids.len());
    for id_text in claimed_ids {
        let id = Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
        if let Some(m) = fetch_inbox_message(store, id).await? {
            out.push(m);
        }
    }
    Ok(out)
}

pub async fn resolve_inbox_message(
    store: &Store,
    message_id: Uuid,
    status: InboxStatus,
    response_text: Option<&str>,
    delegated_to_task_id: Option<Uuid>,
) -> KernelResult<Option<InboxMessage>> {
    let result = sqlx::query(
        "UPDATE inbox_messages SET status = ?, response_text = COALESCE(?, response_text), \
         delegated_to_task_id = COALESCE(?, delegated_to_task_id), last_updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(response_text)
    .bind(delegated_to_task_id.map(|t| t.to_string()))
    .bind(Utc::now().to_rfc3339())
    .bind(message_id.to_string())
    .execute(store.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }
    fetch_inbox_message(store, message_id).await
}

/// Periodic sweep identical in shape to mention processing: resets
/// `processing` inbox messages older than `timeout_minutes` back to
/// `unread`.
pub async fn release_stale_inbox_processing(store: &Store, timeout_minutes: i64) -> KernelResult<u64> {
    let cutoff = (Utc::now() - Duration::minutes(timeout_minutes)).to_rfc3339();
    let result = sqlx::query(
        "UPDATE inbox_messages SET status = ? WHERE status = ? AND last_updated_at < ?",
    )
    .bind(InboxStatus::Unread.as_str())
    .bind(InboxStatus::Processing.as_str())
    .bind(cutoff)
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected())
}

pub fn default_channel_id() -> Uuid {
    DEFAULT_CHANNEL_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents;
    use crate::models::PersonaFields;

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn mention_claim_is_mutually_exclusive() {
        let store = test_store().await;
        let lead = agents::register(&store, None, "lead", true, PersonaFields::default()).await.unwrap();
        let channel = default_channel_id();

        post_message(&store, channel, None, &format!("@lead hello"), None, |_| Some(lead.id))
            .await
            .unwrap();

        let first = claim_mentions(&store, lead.id).await.unwrap();
        assert_eq!(first, vec![channel]);

        let second = claim_mentions(&store, lead.id).await.unwrap();
        assert!(second.is_empty());

        release_mention_processing(&store, lead.id, &first).await.unwrap();
    }

    #[tokio::test]
    async fn task_prefix_creates_task_for_mentioned_agent() {
        let store = test_store().await;
        let worker = agents::register(&store, None, "worker", false, PersonaFields::default()).await.unwrap();
        let channel = default_channel_id();

        post_message(&store, channel, None, "/task @worker please build this", None, |_| Some(worker.id))
            .await
            .unwrap();

        let pending = tasks::get_pending_task_for_agent(&store, worker.id).await.unwrap();
        assert!(pending.is_some());
    }

    #[test]
    fn parses_structured_inbox_blocks() {
        let body = "<new_message>hi there</new_message><thread_history>a: hi\nb: hey</thread_history>";
        let parsed = parse_inbox_content(body);
        assert_eq!(parsed.new_message.as_deref(), Some("hi there"));
        assert_eq!(parsed.thread_history.as_deref(), Some("a: hi\nb: hey"));
    }
}
