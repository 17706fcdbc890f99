/// Core data model for the orchestration kernel.
///
/// Every entity here is a persisted row owned exclusively by the `Store`
/// other components only ever hold values returned from a
/// transactional read, never a long-lived mutable cache.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Thin wrapper so `tags`/`dependsOn`/`capabilities` round-trip through a
/// single JSON TEXT column without every call site re-serializing by hand.
pub fn to_json_text<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

pub fn from_json_text<T: for<'de> Deserialize<'de> + Default>(text: &str) -> T {
    serde_json::from_str(text).unwrap_or_default()
}

// ---------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("invalid agent status: {other}")),
        }
    }
}

/// The persona text fields on an agent. Each is capped at 64 KiB.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaFields {
    pub claude_md: Option<String>,
    pub soul_md: Option<String>,
    pub identity_md: Option<String>,
    pub setup_script: Option<String>,
    pub tools_md: Option<String>,
}

pub const PERSONA_FIELD_MAX_BYTES: usize = 64 * 1024;
pub const AGENT_ROLE_MAX_CHARS: usize = 100;

impl PersonaFields {
    /// Iterate `(field_name, content)` for every field present in this update.
    pub fn present_fields(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(v) = &self.claude_md {
            out.push(("claudeMd", v.as_str()));
        }
        if let Some(v) = &self.soul_md {
            out.push(("soulMd", v.as_str()));
        }
        if let Some(v) = &self.identity_md {
            out.push(("identityMd", v.as_str()));
        }
        if let Some(v) = &self.setup_script {
            out.push(("setupScript", v.as_str()));
        }
        if let Some(v) = &self.tools_md {
            out.push(("toolsMd", v.as_str()));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub is_lead: bool,
    pub status: AgentStatus,
    pub max_tasks: i32,
    pub empty_poll_count: i32,
    pub role: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub claude_md: Option<String>,
    pub soul_md: Option<String>,
    pub identity_md: Option<String>,
    pub setup_script: Option<String>,
    pub tools_md: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// AgentTask
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Unassigned,
    Offered,
    Reviewing,
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Unassigned => "unassigned",
            TaskStatus::Offered => "offered",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never mutate again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(TaskStatus::Backlog),
            "unassigned" => Ok(TaskStatus::Unassigned),
            "offered" => Ok(TaskStatus::Offered),
            "reviewing" => Ok(TaskStatus::Reviewing),
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Mcp,
    Slack,
    Api,
    Github,
    Agentmail,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Mcp => "mcp",
            TaskSource::Slack => "slack",
            TaskSource::Api => "api",
            TaskSource::Github => "github",
            TaskSource::Agentmail => "agentmail",
        }
    }
}

impl std::str::FromStr for TaskSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mcp" => Ok(TaskSource::Mcp),
            "slack" => Ok(TaskSource::Slack),
            "api" => Ok(TaskSource::Api),
            "github" => Ok(TaskSource::Github),
            "agentmail" => Ok(TaskSource::Agentmail),
            other => Err(format!("invalid task source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub agent_id: Option<Uuid>,
    pub creator_agent_id: Option<Uuid>,
    pub task: String,
    pub status: TaskStatus,
    pub source: TaskSource,
    pub task_type: Option<String>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub depends_on: Vec<Uuid>,
    pub offered_to: Option<Uuid>,
    pub offered_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub slack_origin: Option<Value>,
    pub github_origin: Option<Value>,
    pub agentmail_origin: Option<Value>,
    pub mention_message_id: Option<Uuid>,
    pub mention_channel_id: Option<Uuid>,
    pub epic_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub claude_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub output: Option<String>,
    pub progress: Option<String>,
}

impl AgentTask {
    /// Derived one-line title for list views; the `task` field stays the
    /// single required description.
    pub fn title(&self) -> String {
        let first_line = self.task.lines().next().unwrap_or("");
        if first_line.chars().count() > 80 {
            first_line.chars().take(77).collect::<String>() + "..."
        } else {
            first_line.to_string()
        }
    }
}

/// Options accepted by `tasks::create`.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub agent_id: Option<Uuid>,
    pub creator_agent_id: Option<Uuid>,
    pub offered_to: Option<Uuid>,
    pub as_backlog: bool,
    pub source: Option<TaskSource>,
    pub task_type: Option<String>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub depends_on: Vec<Uuid>,
    pub slack_origin: Option<Value>,
    pub github_origin: Option<Value>,
    pub agentmail_origin: Option<Value>,
    pub mention_message_id: Option<Uuid>,
    pub mention_channel_id: Option<Uuid>,
    pub epic_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
}

// ---------------------------------------------------------------------
// AgentLog
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: Uuid,
    pub event_type: String,
    pub agent_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Channels & inbox
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The well-known default channel seeded on first boot.
pub const DEFAULT_CHANNEL_ID: Uuid = Uuid::from_u128(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_agent_id: Option<Uuid>,
    pub content: String,
    pub mentions: Vec<Uuid>,
    pub thread_parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReadState {
    pub agent_id: Uuid,
    pub channel_id: Uuid,
    pub last_read_at: DateTime<Utc>,
    pub processing_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    Unread,
    Processing,
    Read,
    Responded,
    Delegated,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Unread => "unread",
            InboxStatus::Processing => "processing",
            InboxStatus::Read => "read",
            InboxStatus::Responded => "responded",
            InboxStatus::Delegated => "delegated",
        }
    }
}

impl std::str::FromStr for InboxStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(InboxStatus::Unread),
            "processing" => Ok(InboxStatus::Processing),
            "read" => Ok(InboxStatus::Read),
            "responded" => Ok(InboxStatus::Responded),
            "delegated" => Ok(InboxStatus::Delegated),
            other => Err(format!("invalid inbox status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub content: String,
    pub source: String,
    pub status: InboxStatus,
    pub origin: Option<Value>,
    pub delegated_to_task_id: Option<Uuid>,
    pub response_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Epic
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl EpicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpicStatus::Draft => "draft",
            EpicStatus::Active => "active",
            EpicStatus::Paused => "paused",
            EpicStatus::Completed => "completed",
            EpicStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for EpicStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(EpicStatus::Draft),
            "active" => Ok(EpicStatus::Active),
            "paused" => Ok(EpicStatus::Paused),
            "completed" => Ok(EpicStatus::Completed),
            "cancelled" => Ok(EpicStatus::Cancelled),
            other => Err(format!("invalid epic status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: Uuid,
    pub name: String,
    pub goal: String,
    pub status: EpicStatus,
    pub priority: i32,
    pub tags: Vec<String>,
    pub lead_agent_id: Option<Uuid>,
    pub channel_id: Uuid,
    pub progress_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EpicProgress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub in_progress: i64,
    pub pending: i64,
    pub unassigned: i64,
}

impl EpicProgress {
    pub fn percent(&self) -> i64 {
        if self.total == 0 {
            0
        } else {
            ((self.completed as f64 / self.total as f64) * 100.0).round() as i64
        }
    }
}

// ---------------------------------------------------------------------
// ScheduledTask
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<i64>,
    pub task_template: String,
    pub task_type: Option<String>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub target_agent_id: Option<Uuid>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub consecutive_errors: i32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

pub const SCHEDULER_MAX_CONSECUTIVE_ERRORS: i32 = 5;
pub const SCHEDULER_BACKOFF_BASE_MS: i64 = 60_000;

// ---------------------------------------------------------------------
// ActiveSession + session outputs
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Option<Uuid>,
    pub trigger_type: String,
    pub inbox_message_id: Option<Uuid>,
    pub task_description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLog {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub line: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCost {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// ContextVersion (persona field history)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    System,
    Api,
    SelfEdit,
    LeadCoaching,
    SessionSync,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::System => "system",
            ChangeSource::Api => "api",
            ChangeSource::SelfEdit => "self_edit",
            ChangeSource::LeadCoaching => "lead_coaching",
            ChangeSource::SessionSync => "session_sync",
        }
    }
}

impl std::str::FromStr for ChangeSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ChangeSource::System),
            "api" => Ok(ChangeSource::Api),
            "self_edit" => Ok(ChangeSource::SelfEdit),
            "lead_coaching" => Ok(ChangeSource::LeadCoaching),
            "session_sync" => Ok(ChangeSource::SessionSync),
            other => Err(format!("invalid change source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextVersion {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub field: String,
    pub content: String,
    pub version: i32,
    pub change_source: ChangeSource,
    pub changed_by_agent_id: Option<Uuid>,
    pub change_reason: Option<String>,
    pub content_hash: String,
    pub previous_version_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Trigger {
    #[serde(rename = "task_cancelled")]
    TaskCancelled { task: AgentTask },
    #[serde(rename = "task_offered")]
    TaskOffered { task: AgentTask },
    #[serde(rename = "task_assigned")]
    TaskAssigned { task: AgentTask },
    #[serde(rename = "task_paused")]
    TaskPaused { task: AgentTask },
    #[serde(rename = "unread_mentions")]
    UnreadMentions { count: i64, channels: Vec<Uuid> },
    #[serde(rename = "pool_tasks_available")]
    PoolTasksAvailable { count: i64 },
    #[serde(rename = "epic_progress")]
    EpicProgress { epics: Vec<Uuid> },
    #[serde(rename = "worker_task_finished")]
    WorkerTaskFinished { task: AgentTask },
}
