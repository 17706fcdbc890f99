/// SQLite-backed durable record layer.
///
/// One process-wide connection pool; every mutation happens inside a
/// transaction scoped to the operation that needs it. Schema application is
/// idempotent and additive: re-running `open_or_create` against an existing
/// database file only ever adds tables/columns/indexes, never drops them.
use crate::errors::{KernelError, KernelResult};
use crate::models::DEFAULT_CHANNEL_ID;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// One migration: a monotonic version, a human name, and the statements it
/// applies. Statements run individually so a crash mid-migration can be
/// retried statement-by-statement on the next boot.
type Migration = (i64, &'static str, &'static [&'static str]);

const MIGRATIONS: &[Migration] = &[
    (
        1,
        "create_agents",
        &[
            r#"CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                is_lead INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'idle',
                max_tasks INTEGER NOT NULL DEFAULT 1,
                empty_poll_count INTEGER NOT NULL DEFAULT 0,
                role TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                capabilities TEXT NOT NULL DEFAULT '[]',
                claude_md TEXT,
                soul_md TEXT,
                identity_md TEXT,
                setup_script TEXT,
                tools_md TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status)"#,
        ],
    ),
    (
        2,
        "create_agent_tasks",
        &[
            r#"CREATE TABLE IF NOT EXISTS agent_tasks (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT,
                creator_agent_id TEXT,
                task TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'api',
                task_type TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                depends_on TEXT NOT NULL DEFAULT '[]',
                offered_to TEXT,
                offered_at TEXT,
                accepted_at TEXT,
                rejection_reason TEXT,
                slack_origin TEXT,
                github_origin TEXT,
                agentmail_origin TEXT,
                mention_message_id TEXT,
                mention_channel_id TEXT,
                epic_id TEXT,
                parent_task_id TEXT,
                claude_session_id TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                finished_at TEXT,
                notified_at TEXT,
                failure_reason TEXT,
                output TEXT,
                progress TEXT,
                FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE SET NULL,
                FOREIGN KEY (offered_to) REFERENCES agents(id) ON DELETE SET NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_tasks_status ON agent_tasks(status)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_tasks_agent_id ON agent_tasks(agent_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_tasks_offered_to ON agent_tasks(offered_to)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_tasks_epic_id ON agent_tasks(epic_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_tasks_priority_created ON agent_tasks(priority DESC, created_at ASC)"#,
        ],
    ),
    (
        3,
        "create_agent_logs",
        &[
            r#"CREATE TABLE IF NOT EXISTS agent_logs (
                id TEXT PRIMARY KEY NOT NULL,
                event_type TEXT NOT NULL,
                agent_id TEXT,
                task_id TEXT,
                old_value TEXT,
                new_value TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_logs_task_id ON agent_logs(task_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_logs_agent_id ON agent_logs(agent_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_agent_logs_event_type ON agent_logs(event_type)"#,
        ],
    ),
    (
        4,
        "create_channels",
        &[
            r#"CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                created_by TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (created_by) REFERENCES agents(id) ON DELETE SET NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS channel_messages (
                id TEXT PRIMARY KEY NOT NULL,
                channel_id TEXT NOT NULL,
                author_agent_id TEXT,
                content TEXT NOT NULL,
                mentions TEXT NOT NULL DEFAULT '[]',
                thread_parent_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_channel_messages_channel_created ON channel_messages(channel_id, created_at)"#,
            r#"CREATE TABLE IF NOT EXISTS channel_read_state (
                agent_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                last_read_at TEXT NOT NULL,
                processing_since TEXT,
                PRIMARY KEY (agent_id, channel_id),
                FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
            )"#,
        ],
    ),
    (
        5,
        "create_inbox_messages",
        &[
            r#"CREATE TABLE IF NOT EXISTS inbox_messages (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'unread',
                origin TEXT,
                delegated_to_task_id TEXT,
                response_text TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE CASCADE
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_inbox_messages_agent_status ON inbox_messages(agent_id, status)"#,
        ],
    ),
    (
        6,
        "create_epics",
        &[
            r#"CREATE TABLE IF NOT EXISTS epics (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                goal TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'draft',
                priority INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                lead_agent_id TEXT,
                channel_id TEXT NOT NULL,
                progress_notified_at TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                FOREIGN KEY (lead_agent_id) REFERENCES agents(id) ON DELETE SET NULL,
                FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE SET NULL
            )"#,
        ],
    ),
    (
        7,
        "create_scheduled_tasks",
        &[
            r#"CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                cron_expression TEXT,
                interval_ms INTEGER,
                task_template TEXT NOT NULL,
                task_type TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                target_agent_id TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                next_run_at TEXT,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                last_error_at TEXT,
                last_error_message TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                FOREIGN KEY (target_agent_id) REFERENCES agents(id) ON DELETE SET NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_enabled_next ON scheduled_tasks(enabled, next_run_at)"#,
        ],
    ),
    (
        8,
        "create_active_sessions",
        &[
            r#"CREATE TABLE IF NOT EXISTS active_sessions (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL,
                task_id TEXT,
                trigger_type TEXT NOT NULL,
                inbox_message_id TEXT,
                task_description TEXT,
                started_at TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_active_sessions_agent ON active_sessions(agent_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_active_sessions_task ON active_sessions(task_id)"#,
        ],
    ),
    (
        9,
        "create_session_outputs",
        &[
            r#"CREATE TABLE IF NOT EXISTS session_logs (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL,
                task_id TEXT,
                session_id TEXT,
                line TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_session_logs_task ON session_logs(task_id)"#,
            r#"CREATE TABLE IF NOT EXISTS session_costs (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL,
                task_id TEXT,
                session_id TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost_usd REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_session_costs_agent ON session_costs(agent_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_session_costs_created ON session_costs(created_at)"#,
        ],
    ),
    (
        10,
        "create_context_versions",
        &[
            r#"CREATE TABLE IF NOT EXISTS context_versions (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL,
                field TEXT NOT NULL,
                content TEXT NOT NULL,
                version INTEGER NOT NULL,
                change_source TEXT NOT NULL,
                changed_by_agent_id TEXT,
                change_reason TEXT,
                content_hash TEXT NOT NULL,
                previous_version_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE CASCADE
            )"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_context_versions_agent_field_version ON context_versions(agent_id, field, version)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_context_versions_agent_field_latest ON context_versions(agent_id, field, version DESC)"#,
        ],
    ),
];

impl Store {
    /// Open (creating if missing) the database at `path`, enabling WAL and
    /// foreign-key enforcement, then apply every pending migration.
    pub async fn open_or_create<P: AsRef<Path>>(path: P) -> KernelResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(&path.to_string_lossy())
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

        let store = Store { pool };
        store.apply_migrations().await?;
        store.seed_default_channel().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> KernelResult<Transaction<'_, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))
    }

    async fn apply_migrations(&self) -> KernelResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| KernelError::migration_failed(format!("migrations table: {e}")))?;

        let max_version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| KernelError::migration_failed(format!("reading schema version: {e}")))?;

        for (version, name, statements) in MIGRATIONS {
            if *version <= max_version {
                continue;
            }
            info!(version, name, "applying migration");
            for statement in *statements {
                // Crash-interrupted migrations can leave a later statement
                // already applied by hand; "already exists" is tolerated.
                if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                    let msg = e.to_string();
                    if msg.contains("already exists") {
                        warn!(statement, "migration statement already applied, skipping");
                        continue;
                    }
                    return Err(KernelError::migration_failed(format!(
                        "migration {name} failed: {msg}"
                    )));
                }
            }
            sqlx::query("INSERT INTO migrations (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(version)
                .bind(*name)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(|e| KernelError::migration_failed(format!("recording {name}: {e}")))?;
        }

        Ok(())
    }

    async fn seed_default_channel(&self) -> KernelResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO channels (id, name, created_by, created_at) VALUES (?, ?, NULL, ?)",
        )
        .bind(DEFAULT_CHANNEL_ID.to_string())
        .bind("general")
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.sqlite");

        let store = Store::open_or_create(&path).await.unwrap();
        drop(store);

        // Re-opening an existing file must not error or drop data.
        let store2 = Store::open_or_create(&path).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channels")
            .fetch_one(store2.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
