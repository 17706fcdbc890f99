//! Flexible task retrieval for list and board views.
//!
//! `TaskQueryBuilder` assembles a single parameterised SQL statement rather
//! than filtering in Rust, so large task tables stay index-friendly.
use crate::errors::KernelResult;
use crate::models::{AgentTask, TaskStatus};
use crate::store::Store;
use crate::tasks::{row_to_task, TASK_COLUMNS};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSortField {
    CreatedAt,
    LastUpdatedAt,
    Priority,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default)]
pub struct TaskQueryBuilder {
    status_filter: Option<Vec<TaskStatus>>,
    agent_filter: Option<Vec<Uuid>>,
    epic_filter: Option<Uuid>,
    tag_filter: Option<String>,
    search_term: Option<String>,
    unassigned_only: bool,
    sort_by: Option<TaskSortField>,
    sort_order: Option<SortOrder>,
    offset: i64,
    limit: i64,
}

impl TaskQueryBuilder {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status_filter.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<TaskStatus>) -> Self {
        self.status_filter = Some(statuses);
        self
    }

    pub fn assigned_to(mut self, agent_id: Uuid) -> Self {
        self.agent_filter.get_or_insert_with(Vec::new).push(agent_id);
        self
    }

    pub fn unassigned_only(mut self) -> Self {
        self.unassigned_only = true;
        self
    }

    pub fn in_epic(mut self, epic_id: Uuid) -> Self {
        self.epic_filter = Some(epic_id);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag_filter = Some(tag.into());
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    pub fn sort_by(mut self, field: TaskSortField) -> Self {
        self.sort_by = Some(field);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.sort_order = Some(order);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    fn build(&self) -> (String, Vec<String>) {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM agent_tasks");
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(statuses) = &self.status_filter {
            if !statuses.is_empty() {
                let placeholders = vec!["?"; statuses.len()].join(", ");
                clauses.push(format!("status IN ({placeholders})"));
                params.extend(statuses.iter().map(|s| s.as_str().to_string()));
            }
        }

        if self.unassigned_only {
            clauses.push("agent_id IS NULL".to_string());
        } else if let Some(agents) = &self.agent_filter {
            if !agents.is_empty() {
                let placeholders = vec!["?"; agents.len()].join(", ");
                clauses.push(format!("agent_id IN ({placeholders})"));
                params.extend(agents.iter().map(|a| a.to_string()));
            }
        }

        if let Some(epic_id) = self.epic_filter {
            clauses.push("epic_id = ?".to_string());
            params.push(epic_id.to_string());
        }

        if let Some(tag) = &self.tag_filter {
            clauses.push("tags LIKE ?".to_string());
            params.push(format!("%\"{tag}\"%"));
        }

        if let Some(term) = &self.search_term {
            clauses.push("task LIKE ?".to_string());
            params.push(format!("%{term}%"));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let column = match self.sort_by.unwrap_or(TaskSortField::LastUpdatedAt) {
            TaskSortField::CreatedAt => "created_at",
            TaskSortField::LastUpdatedAt => "last_updated_at",
            TaskSortField::Priority => "priority",
            TaskSortField::Status => "status",
        };
        let direction = match self.sort_order.unwrap_or(SortOrder::Descending) {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {column} {direction}"));
        sql.push_str(&format!(" LIMIT {} OFFSET {}", self.limit.max(0), self.offset.max(0)));

        (sql, params)
    }

    pub async fn execute(&self, store: &Store) -> KernelResult<Vec<AgentTask>> {
        let (sql, params) = self.build();
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(store.pool()).await?;
        rows.iter().map(row_to_task).collect()
    }
}

#[derive(Debug, Default)]
pub struct KanbanBoard {
    pub backlog: Vec<AgentTask>,
    pub unassigned: Vec<AgentTask>,
    pub offered: Vec<AgentTask>,
    pub pending: Vec<AgentTask>,
    pub in_progress: Vec<AgentTask>,
    pub reviewing: Vec<AgentTask>,
    pub paused: Vec<AgentTask>,
    pub finished: Vec<AgentTask>,
}

/// Groups every non-cancelled task by status for board-style UIs in one pass.
pub async fn kanban_board(store: &Store) -> KernelResult<KanbanBoard> {
    let tasks = TaskQueryBuilder::new()
        .limit(10_000)
        .sort_by(TaskSortField::Priority)
        .order(SortOrder::Descending)
        .execute(store)
        .await?;

    let mut board = KanbanBoard::default();
    for task in tasks {
        match task.status {
            TaskStatus::Backlog => board.backlog.push(task),
            TaskStatus::Unassigned => board.unassigned.push(task),
            TaskStatus::Offered => board.offered.push(task),
            TaskStatus::Pending => board.pending.push(task),
            TaskStatus::InProgress => board.in_progress.push(task),
            TaskStatus::Reviewing => board.reviewing.push(task),
            TaskStatus::Paused => board.paused.push(task),
            TaskStatus::Completed | TaskStatus::Failed => board.finished.push(task),
            TaskStatus::Cancelled => {}
        }
    }
    Ok(board)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateTaskOptions;
    use crate::store::Store;
    use crate::tasks;

    async fn test_store() -> Store {
        Store::open_or_create(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn filters_by_status_and_orders_by_priority() {
        let store = test_store().await;
        tasks::create(
            &store,
            "low",
            CreateTaskOptions {
                priority: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tasks::create(
            &store,
            "high",
            CreateTaskOptions {
                priority: 9,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let results = TaskQueryBuilder::new()
            .with_status(TaskStatus::Unassigned)
            .sort_by(TaskSortField::Priority)
            .order(SortOrder::Descending)
            .execute(&store)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].task, "high");
        assert_eq!(results[1].task, "low");
    }

    #[tokio::test]
    async fn kanban_board_buckets_by_status() {
        let store = test_store().await;
        tasks::create(&store, "a", CreateTaskOptions::default()).await.unwrap();

        let board = kanban_board(&store).await.unwrap();
        assert_eq!(board.unassigned.len(), 1);
        assert!(board.in_progress.is_empty());
    }
}
