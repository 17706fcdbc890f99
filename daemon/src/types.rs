/// Request/response envelopes for the HTTP API. Domain structs themselves
/// (`AgentTask`, `Agent`, ...) come straight from `descartes_kernel_core`
/// and serialize directly; these wrapper types exist only for request
/// bodies and the list-envelope shapes fixed by the external interface.
use descartes_kernel_core::models::{PersonaFields, TaskSource};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub is_lead: bool,
    #[serde(flatten)]
    pub profile: PersonaFields,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateTaskRequest {
    pub task: String,
    pub agent_id: Option<Uuid>,
    pub creator_agent_id: Option<Uuid>,
    pub offered_to: Option<Uuid>,
    #[serde(default)]
    pub as_backlog: bool,
    pub source: Option<TaskSource>,
    pub task_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub slack_origin: Option<serde_json::Value>,
    pub github_origin: Option<serde_json::Value>,
    pub agentmail_origin: Option<serde_json::Value>,
    pub mention_message_id: Option<Uuid>,
    pub mention_channel_id: Option<Uuid>,
    pub epic_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SetClaudeSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelTaskRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetNotifiedRequest {
    pub task_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub author_agent_id: Option<Uuid>,
    pub content: String,
    pub thread_parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInboxMessageRequest {
    pub agent_id: Uuid,
    pub content: String,
    #[serde(default = "default_inbox_source")]
    pub source: String,
    pub origin: Option<serde_json::Value>,
}

fn default_inbox_source() -> String {
    "api".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ClaimInboxRequest {
    #[serde(default = "default_claim_limit")]
    pub limit: i64,
}

fn default_claim_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct RecordSessionCostRequest {
    pub agent_id: Uuid,
    pub task_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(flatten)]
    pub profile: PersonaFields,
    pub role: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub change_reason: Option<String>,
}

