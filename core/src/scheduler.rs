/// Scheduler.
///
/// Runs on its own ticker (default 10s) behind a single-flight guard so
/// a slow tick never stacks with the next one.
use crate::errors::{KernelError, KernelResult};
use crate::models::{
    to_json_text, CreateTaskOptions, ScheduledTask, TaskSource, SCHEDULER_BACKOFF_BASE_MS,
    SCHEDULER_MAX_CONSECUTIVE_ERRORS,
};
use crate::store::Store;
use crate::tasks;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_TICK_SECS: u64 = 10;

const SCHEDULE_COLUMNS: &str = "id, name, cron_expression, interval_ms, task_template, task_type, \
    tags, priority, target_agent_id, enabled, last_run_at, next_run_at, timezone, \
    consecutive_errors, last_error_at, last_error_message, created_at, last_updated_at";

fn row_to_schedule(row: &SqliteRow) -> KernelResult<ScheduledTask> {
    let id_text: String = row.try_get("id")?;
    let tags_text: String = row.try_get("tags")?;
    let target_agent_id: Option<String> = row.try_get("target_agent_id")?;
    let last_run_at: Option<String> = row.try_get("last_run_at")?;
    let next_run_at: Option<String> = row.try_get("next_run_at")?;
    let last_error_at: Option<String> = row.try_get("last_error_at")?;
    let created_at_text: String = row.try_get("created_at")?;
    let last_updated_text: String = row.try_get("last_updated_at")?;

    let parse_ts = |raw: Option<String>| -> KernelResult<Option<DateTime<Utc>>> {
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| KernelError::StoreUnavailable(e.to_string()))
        })
        .transpose()
    };

    Ok(ScheduledTask {
        id: Uuid::parse_str(&id_text).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        interval_ms: row.try_get("interval_ms")?,
        task_template: row.try_get("task_template")?,
        task_type: row.try_get("task_type")?,
        tags: serde_json::from_str(&tags_text).unwrap_or_default(),
        priority: row.try_get("priority")?,
        target_agent_id: target_agent_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        last_run_at: parse_ts(last_run_at)?,
        next_run_at: parse_ts(next_run_at)?,
        timezone: row.try_get("timezone")?,
        consecutive_errors: row.try_get("consecutive_errors")?,
        last_error_at: parse_ts(last_error_at)?,
        last_error_message: row.try_get("last_error_message")?,
        created_at: DateTime::parse_from_rfc3339(&created_at_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
        last_updated_at: DateTime::parse_from_rfc3339(&last_updated_text)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn fetch_by_id(store: &Store, schedule_id: Uuid) -> KernelResult<Option<ScheduledTask>> {
    let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks WHERE id = ?");
    let row = sqlx::query(&sql).bind(schedule_id.to_string()).fetch_optional(store.pool()).await?;
    row.as_ref().map(row_to_schedule).transpose()
}

pub async fn list(store: &Store) -> KernelResult<Vec<ScheduledTask>> {
    let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks ORDER BY created_at ASC");
    let rows = sqlx::query(&sql).fetch_all(store.pool()).await?;
    rows.iter().map(row_to_schedule).collect()
}

/// Invariant: exactly one of `cron_expression`/`interval_ms` is set.
pub async fn create(
    store: &Store,
    name: &str,
    cron_expression: Option<String>,
    interval_ms: Option<i64>,
    task_template: &str,
    task_type: Option<String>,
    tags: Vec<String>,
    priority: i32,
    target_agent_id: Option<Uuid>,
    timezone: &str,
) -> KernelResult<ScheduledTask> {
    if cron_expression.is_some() == interval_ms.is_some() {
        return Err(KernelError::bad_request(
            "cronExpression/intervalMs",
            "exactly one of cronExpression or intervalMs must be set",
        ));
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    let next_run_at = compute_first_next_run(cron_expression.as_deref(), interval_ms, timezone, now)?;

    sqlx::query(
        "INSERT INTO scheduled_tasks (id, name, cron_expression, interval_ms, task_template, \
         task_type, tags, priority, target_agent_id, enabled, next_run_at, timezone, \
         created_at, last_updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(name)
    .bind(&cron_expression)
    .bind(interval_ms)
    .bind(task_template)
    .bind(task_type.as_deref())
    .bind(to_json_text(&tags))
    .bind(priority)
    .bind(target_agent_id.map(|a| a.to_string()))
    .bind(next_run_at.to_rfc3339())
    .bind(timezone)
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(store.pool())
    .await?;

    fetch_by_id(store, id).await?.ok_or_else(|| KernelError::NotFound("schedule just created".into()))
}

fn compute_first_next_run(
    cron_expression: Option<&str>,
    interval_ms: Option<i64>,
    timezone: &str,
    now: DateTime<Utc>,
) -> KernelResult<DateTime<Utc>> {
    match (cron_expression, interval_ms) {
        (Some(expr), None) => compute_next_cron_run(expr, timezone, now),
        (None, Some(ms)) => Ok(now + chrono::Duration::milliseconds(ms)),
        _ => unreachable!("validated exactly-one invariant at create time"),
    }
}

fn compute_next_cron_run(cron_expression: &str, timezone: &str, after: DateTime<Utc>) -> KernelResult<DateTime<Utc>> {
    let schedule = Schedule::from_str(cron_expression)
        .map_err(|e| KernelError::bad_request("cronExpression", e.to_string()))?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| KernelError::bad_request("timezone", format!("unknown IANA timezone: {timezone}")))?;
    let after_tz = after.with_timezone(&tz);
    let next = schedule
        .after(&after_tz)
        .next()
        .ok_or_else(|| KernelError::bad_request("cronExpression", "no future occurrence"))?;
    Ok(next.with_timezone(&Utc))
}

fn backoff_delay_ms(consecutive_errors: i32) -> i64 {
    let capped_exponent = consecutive_errors.min(10);
    SCHEDULER_BACKOFF_BASE_MS * 2i64.pow(capped_exponent as u32)
}

/// Runs one schedule's tick body: creates the materialised task, advances
/// `nextRunAt`, and records success/failure bookkeeping.
async fn run_schedule_tick(store: &Store, schedule: &ScheduledTask) -> KernelResult<()> {
    let now = Utc::now();
    let mut tags = schedule.tags.clone();
    tags.push("scheduled".to_string());
    tags.push(format!("schedule:{}", schedule.name));

    let opts = CreateTaskOptions {
        agent_id: schedule.target_agent_id,
        source: Some(TaskSource::Api),
        task_type: schedule.task_type.clone(),
        tags,
        priority: schedule.priority,
        ..Default::default()
    };

    let outcome = tasks::create(store, &schedule.task_template, opts).await;

    match outcome {
        Ok(_) => {
            let next_run_at = match (&schedule.cron_expression, schedule.interval_ms) {
                (Some(expr), _) => compute_next_cron_run(expr, &schedule.timezone, now)?,
                (None, Some(ms)) => now + chrono::Duration::milliseconds(ms),
                (None, None) => return Err(KernelError::bad_request("schedule", "neither cron nor interval set")),
            };
            sqlx::query(
                "UPDATE scheduled_tasks SET last_run_at = ?, next_run_at = ?, consecutive_errors = 0, \
                 last_error_at = NULL, last_error_message = NULL, last_updated_at = ? WHERE id = ?",
            )
            .bind(now.to_rfc3339())
            .bind(next_run_at.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(schedule.id.to_string())
            .execute(store.pool())
            .await?;
            Ok(())
        }
        Err(e) => {
            let consecutive_errors = schedule.consecutive_errors + 1;
            let message: String = e.to_string().chars().take(500).collect();
            let delay_ms = backoff_delay_ms(consecutive_errors);
            let next_run_at = now + chrono::Duration::milliseconds(delay_ms);
            let disable = consecutive_errors >= SCHEDULER_MAX_CONSECUTIVE_ERRORS;

            sqlx::query(
                "UPDATE scheduled_tasks SET consecutive_errors = ?, last_error_at = ?, \
                 last_error_message = ?, next_run_at = ?, enabled = CASE WHEN ? THEN 0 ELSE enabled END, \
                 last_updated_at = ? WHERE id = ?",
            )
            .bind(consecutive_errors)
            .bind(now.to_rfc3339())
            .bind(&message)
            .bind(next_run_at.to_rfc3339())
            .bind(disable)
            .bind(now.to_rfc3339())
            .bind(schedule.id.to_string())
            .execute(store.pool())
            .await?;

            tracing::warn!(schedule = %schedule.name, error = %message, consecutive_errors, "schedule tick failed");
            Ok(())
        }
    }
}

/// Loads due schedules (`enabled ∧ nextRunAt ≤ now`) and runs each tick body
/// in order. Returns the number of schedules processed.
pub async fn tick(store: &Store) -> KernelResult<usize> {
    let now = Utc::now().to_rfc3339();
    let sql = format!(
        "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks WHERE enabled = 1 AND next_run_at <= ? \
         ORDER BY next_run_at ASC"
    );
    let rows = sqlx::query(&sql).bind(&now).fetch_all(store.pool()).await?;
    let due: Vec<ScheduledTask> = rows.iter().map(row_to_schedule).collect::<KernelResult<_>>()?;

    for schedule in &due {
        run_schedule_tick(store, schedule).await?;
    }
    Ok(due.len())
}

/// Like the tick body but only updates `lastRunAt`, leaving `nextRunAt`
/// untouched. Fails if the schedule is disabled or missing.
pub async fn run_now(store: &Store, schedule_id: Uuid) -> KernelResult<ScheduledTask> {
    let schedule = fetch_by_id(store, schedule_id)
        .await?
        .ok_or_else(|| KernelError::NotFound(format!("schedule {schedule_id}")))?;
    if !schedule.enabled {
        return Err(KernelError::Conflict(format!("schedule {schedule_id} is disabled")));
    }

    let mut tags = schedule.tags.clone();
    tags.push("scheduled".to_string());
    tags.push(format!("schedule:{}", schedule.name));
    tags.push("manual-run".to_string());

    let opts = CreateTaskOptions {
        agent_id: schedule.target_agent_id,
        source: Some(TaskSource::Api),
        task_type: schedule.task_type.clone(),
        tags,
        priority: schedule.priority,
        ..Default::default()
    };
    tasks::create(store, &schedule.task_template, opts).await?;

    let now = Utc::now();
    sqlx::query("UPDATE scheduled_tasks SET last_run_at = ?, last_updated_at = ? WHERE id = ?")
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(schedule_id.to_string())
        .execute(store.pool())
        .await?;

    fetch_by_id(store, schedule_id).await?.ok_or_else(|| KernelError::NotFound(format!("schedule {schedule_id}")))
}

/// Single-flight ticker: spawns `tokio::time::interval`-driven ticks,
/// skipping overlapping ticks via the boolean guard.
pub struct SchedulerHandle {
    processing: Arc<Mutex<bool>>,
}

impl SchedulerHandle {
    pub fn spawn(store: Arc<Store>, tick_period_secs: u64) -> Self {
        let processing = Arc::new(Mutex::new(false));
        let guard = processing.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_period_secs));
            loop {
                interval.tick().await;
                let mut in_flight = guard.lock().await;
                if *in_flight {
                    continue;
                }
                *in_flight = true;
                drop(in_flight);

                match tick(&store).await {
                    Ok(count) if count > 0 => tracing::debug!(count, "scheduler tick processed schedules"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
                }

                *guard.lock().await = false;
            }
        });

        SchedulerHandle { processing }
    }

    pub async fn is_processing(&self) -> bool {
        *self.processing.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn interval_schedule_materialises_task_and_advances_next_run() {
        let store = test_store().await;
        let schedule = create(
            &store,
            "heartbeat",
            None,
            Some(60_000),
            "x",
            None,
            vec![],
            0,
            None,
            "UTC",
        )
        .await
        .unwrap();

        // Force it due immediately.
        sqlx::query("UPDATE scheduled_tasks SET next_run_at = ? WHERE id = ?")
            .bind((Utc::now() - chrono::Duration::milliseconds(1)).to_rfc3339())
            .bind(schedule.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let processed = tick(&store).await.unwrap();
        assert_eq!(processed, 1);

        let updated = fetch_by_id(&store, schedule.id).await.unwrap().unwrap();
        assert!(updated.last_run_at.is_some());
        assert!(updated.next_run_at.unwrap() > schedule.next_run_at.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_both_cron_and_interval() {
        let store = test_store().await;
        let result = create(
            &store,
            "bad",
            Some("0 * * * * *".to_string()),
            Some(1000),
            "x",
            None,
            vec![],
            0,
            None,
            "UTC",
        )
        .await;
        assert!(result.is_err());
    }
}
