/// Route handlers for the HTTP API.
///
/// Each handler is a free function taking the shared `Kernel` context plus
/// whatever the route needs, returning a `DaemonResult<Response<Body>>`.
use crate::errors::{DaemonError, DaemonResult};
use crate::kernel::Kernel;
use crate::types::*;
use descartes_kernel_core::models::CreateTaskOptions;
use descartes_kernel_core::{agents, epics, inbox, poll, queries, scheduler, sessions, tasks};
use hyper::{Body, Response, StatusCode};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

pub fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> DaemonResult<Response<Body>> {
    let body = serde_json::to_string(value).map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

pub fn ok<T: serde::Serialize>(value: &T) -> DaemonResult<Response<Body>> {
    json_response(StatusCode::OK, value)
}

pub fn agent_id_header(req: &hyper::Request<Body>) -> DaemonResult<Uuid> {
    req.headers()
        .get("X-Agent-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| DaemonError::InvalidRequest("missing or invalid X-Agent-ID header".into()))
}

pub async fn read_body<T: serde::de::DeserializeOwned>(req: hyper::Request<Body>) -> DaemonResult<T> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| DaemonError::InvalidRequest(e.to_string()))
}

/// Splits a raw query string (`a=1&b=2`) into a lookup map. No percent
/// decoding beyond `+` -> space, matching the simple filters this API uses.
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(raw) = raw else { return out };
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("").replace('+', " ");
        let value = parts.next().unwrap_or("").replace('+', " ");
        out.insert(key, value);
    }
    out
}

// --- Agents --------------------------------------------------------------

pub async fn create_agent(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let existing_id = req
        .headers()
        .get("X-Agent-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok());
    let body: CreateAgentRequest = read_body(req).await?;

    let pre_existing = agents::fetch_by_name(&kernel.store, &body.name).await?;
    let agent = agents::register(&kernel.store, existing_id, &body.name, body.is_lead, body.profile).await?;

    let status = if pre_existing.is_some() { StatusCode::OK } else { StatusCode::CREATED };
    json_response(status, &agent)
}

pub async fn me(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let agent = agents::fetch_by_id(&kernel.store, agent_id)
        .await?
        .ok_or(DaemonError::NotFound)?;
    ok(&agent)
}

pub async fn ping(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let agent = agents::heartbeat(&kernel.store, agent_id).await?.ok_or(DaemonError::NotFound)?;
    ok(&agent)
}

pub async fn close(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let agent = agents::close(&kernel.store, agent_id).await?.ok_or(DaemonError::NotFound)?;
    ok(&agent)
}

pub async fn get_agent(kernel: &Kernel, id: Uuid) -> DaemonResult<Response<Body>> {
    let agent = agents::fetch_by_id(&kernel.store, id).await?.ok_or(DaemonError::NotFound)?;
    ok(&agent)
}

pub async fn list_agents(kernel: &Kernel) -> DaemonResult<Response<Body>> {
    let agent_list = agents::list(&kernel.store).await?;
    ok(&json!({ "agents": agent_list }))
}

pub async fn update_profile(kernel: &Kernel, id: Uuid, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: UpdateProfileRequest = read_body(req).await?;

    if let Some(role) = &body.role {
        agents::update_role(&kernel.store, id, role, body.description.as_deref())
            .await?
            .ok_or(DaemonError::NotFound)?;
    }

    let agent = agents::update_profile(
        &kernel.store,
        id,
        body.profile,
        descartes_kernel_core::models::ChangeSource::Api,
        None,
        body.change_reason.as_deref(),
    )
    .await?
    .ok_or(DaemonError::NotFound)?;

    ok(&agent)
}

// --- Poll ------------------------------------------------------------------

pub async fn poll_for_agent(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let trigger = poll::poll(&kernel.store, agent_id).await?;
    ok(&json!({ "trigger": trigger }))
}

// --- Tasks -------------------------------------------------------------

pub async fn create_task(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: CreateTaskRequest = read_body(req).await?;
    if body.task.trim().is_empty() {
        return Err(DaemonError::InvalidRequest("task description is required".into()));
    }

    // parentTaskId auto-routes to the parent's agent when agentId is omitted.
    let mut agent_id = body.agent_id;
    if agent_id.is_none() {
        if let Some(parent_id) = body.parent_task_id {
            if let Some(parent) = tasks::fetch_by_id(&kernel.store, parent_id).await? {
                agent_id = parent.agent_id;
            }
        }
    }

    let opts = CreateTaskOptions {
        agent_id,
        creator_agent_id: body.creator_agent_id,
        offered_to: body.offered_to,
        as_backlog: body.as_backlog,
        source: body.source,
        task_type: body.task_type,
        tags: body.tags,
        priority: body.priority,
        depends_on: body.depends_on,
        slack_origin: body.slack_origin,
        github_origin: body.github_origin,
        agentmail_origin: body.agentmail_origin,
        mention_message_id: body.mention_message_id,
        mention_channel_id: body.mention_channel_id,
        epic_id: body.epic_id,
        parent_task_id: body.parent_task_id,
    };

    let task = tasks::create(&kernel.store, &body.task, opts).await?;
    json_response(StatusCode::CREATED, &task)
}

pub async fn get_task(kernel: &Kernel, id: Uuid) -> DaemonResult<Response<Body>> {
    let task = tasks::fetch_by_id(&kernel.store, id).await?.ok_or(DaemonError::NotFound)?;
    ok(&task)
}

pub async fn list_tasks(kernel: &Kernel, query: &HashMap<String, String>) -> DaemonResult<Response<Body>> {
    let mut builder = queries::TaskQueryBuilder::new();

    if let Some(status) = query.get("status") {
        let parsed: descartes_kernel_core::models::TaskStatus = status
            .parse()
            .map_err(|e| DaemonError::InvalidRequest(format!("status: {e}")))?;
        builder = builder.with_status(parsed);
    }
    if let Some(agent_id) = query.get("agent_id") {
        let id = Uuid::parse_str(agent_id).map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
        builder = builder.assigned_to(id);
    }
    if query.get("unassigned").map(|v| v == "true").unwrap_or(false) {
        builder = builder.unassigned_only();
    }
    if let Some(epic_id) = query.get("epic_id") {
        let id = Uuid::parse_str(epic_id).map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
        builder = builder.in_epic(id);
    }
    if let Some(tag) = query.get("tag") {
        builder = builder.with_tag(tag.clone());
    }
    if let Some(search) = query.get("search") {
        builder = builder.search(search.clone());
    }
    if let Some(limit) = query.get("limit").and_then(|v| v.parse().ok()) {
        builder = builder.limit(limit);
    }
    if let Some(offset) = query.get("offset").and_then(|v| v.parse().ok()) {
        builder = builder.offset(offset);
    }

    let tasks = builder.execute(&kernel.store).await?;
    ok(&json!({ "tasks": tasks, "total": tasks.len() }))
}

pub async fn set_claude_session(kernel: &Kernel, id: Uuid, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: SetClaudeSessionRequest = read_body(req).await?;
    let task = tasks::set_claude_session(&kernel.store, id, &body.session_id)
        .await?
        .ok_or(DaemonError::NotFound)?;
    ok(&task)
}

pub async fn pause_task(kernel: &Kernel, id: Uuid) -> DaemonResult<Response<Body>> {
    let task = tasks::pause(&kernel.store, id).await?.ok_or(DaemonError::NotFound)?;
    ok(&task)
}

pub async fn resume_task(kernel: &Kernel, id: Uuid) -> DaemonResult<Response<Body>> {
    let task = tasks::resume(&kernel.store, id).await?.ok_or(DaemonError::NotFound)?;
    ok(&task)
}

pub async fn cancel_task(kernel: &Kernel, id: Uuid, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: CancelTaskRequest = read_body(req).await?;
    let task = tasks::cancel(&kernel.store, id, body.reason.as_deref())
        .await?
        .ok_or(DaemonError::NotFound)?;
    ok(&task)
}

pub async fn reset_notified(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: ResetNotifiedRequest = read_body(req).await?;
    tasks::reset_notified(&kernel.store, &body.task_ids).await?;
    ok(&json!({ "reset": body.task_ids.len() }))
}

pub async fn stats(kernel: &Kernel) -> DaemonResult<Response<Body>> {
    let board = queries::kanban_board(&kernel.store).await?;
    let agent_list = agents::list(&kernel.store).await?;
    ok(&json!({
        "tasks": {
            "backlog": board.backlog.len(),
            "unassigned": board.unassigned.len(),
            "offered": board.offered.len(),
            "pending": board.pending.len(),
            "in_progress": board.in_progress.len(),
            "reviewing": board.reviewing.len(),
            "paused": board.paused.len(),
            "finished": board.finished.len(),
        },
        "agents": {
            "total": agent_list.len(),
            "busy": agent_list.iter().filter(|a| a.status == descartes_kernel_core::models::AgentStatus::Busy).count(),
        },
    }))
}

// --- Session costs -------------------------------------------------------

pub async fn record_session_cost(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: RecordSessionCostRequest = read_body(req).await?;
    let cost = sessions::record_cost(
        &kernel.store,
        body.agent_id,
        body.task_id,
        body.session_id.as_deref(),
        body.input_tokens,
        body.output_tokens,
        body.total_cost_usd,
    )
    .await?;
    json_response(StatusCode::CREATED, &cost)
}

pub async fn list_session_costs(kernel: &Kernel, query: &HashMap<String, String>) -> DaemonResult<Response<Body>> {
    let agent_id = query
        .get("agent_id")
        .map(|s| Uuid::parse_str(s))
        .transpose()
        .map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
    let costs = sessions::list_costs(&kernel.store, agent_id).await?;
    ok(&json!({ "costs": costs, "total": costs.len() }))
}

pub async fn session_cost_summary(kernel: &Kernel, query: &HashMap<String, String>) -> DaemonResult<Response<Body>> {
    let agent_id = query
        .get("agent_id")
        .map(|s| Uuid::parse_str(s))
        .transpose()
        .map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
    let summary = sessions::cost_summary(&kernel.store, agent_id).await?;
    ok(&json!({
        "total_input_tokens": summary.total_input_tokens,
        "total_output_tokens": summary.total_output_tokens,
        "total_cost_usd": summary.total_cost_usd,
        "session_count": summary.session_count,
    }))
}

pub async fn session_cost_dashboard(kernel: &Kernel) -> DaemonResult<Response<Body>> {
    let agent_list = agents::list(&kernel.store).await?;
    let mut per_agent = Vec::with_capacity(agent_list.len());
    for agent in &agent_list {
        let summary = sessions::cost_summary(&kernel.store, Some(agent.id)).await?;
        per_agent.push(json!({
            "agent_id": agent.id,
            "name": agent.name,
            "total_cost_usd": summary.total_cost_usd,
            "session_count": summary.session_count,
        }));
    }
    let overall = sessions::cost_summary(&kernel.store, None).await?;
    ok(&json!({ "agents": per_agent, "overall_total_cost_usd": overall.total_cost_usd }))
}

// --- Scheduled tasks -------------------------------------------------------

pub async fn list_scheduled_tasks(kernel: &Kernel, query: &HashMap<String, String>) -> DaemonResult<Response<Body>> {
    let mut schedules = scheduler::list(&kernel.store).await?;
    if let Some(enabled) = query.get("enabled") {
        let want = enabled == "true";
        schedules.retain(|s| s.enabled == want);
    }
    if let Some(name) = query.get("name") {
        schedules.retain(|s| &s.name == name);
    }
    ok(&json!({ "scheduled_tasks": schedules, "total": schedules.len() }))
}

pub async fn run_schedule_now(kernel: &Kernel, id: Uuid) -> DaemonResult<Response<Body>> {
    let schedule = scheduler::run_now(&kernel.store, id).await?;
    ok(&schedule)
}

// --- Channels & inbox ------------------------------------------------------

pub async fn create_channel(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: CreateChannelRequest = read_body(req).await?;
    let channel = inbox::create_channel(&kernel.store, &body.name, body.created_by).await?;
    json_response(StatusCode::CREATED, &channel)
}

pub async fn post_message(kernel: &Kernel, channel_id: Uuid, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: PostMessageRequest = read_body(req).await?;
    let store = &kernel.store;

    let by_name: HashMap<String, Uuid> =
        agents::list(store).await?.into_iter().map(|a| (a.name, a.id)).collect();

    let message = inbox::post_message(
        store,
        channel_id,
        body.author_agent_id,
        &body.content,
        body.thread_parent_id,
        |name| by_name.get(name).copied(),
    )
    .await?;
    json_response(StatusCode::CREATED, &message)
}

pub async fn list_channel_messages(kernel: &Kernel, channel_id: Uuid, query: &HashMap<String, String>) -> DaemonResult<Response<Body>> {
    let limit = query.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);
    let messages = inbox::list_messages(&kernel.store, channel_id, limit).await?;
    ok(&json!({ "messages": messages, "total": messages.len() }))
}

pub async fn channel_unread(kernel: &Kernel, channel_id: Uuid, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let count = inbox::count_unread_mentions(&kernel.store, agent_id, &[channel_id]).await?;
    ok(&json!({ "unread": count }))
}

pub async fn channel_mentions(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let channel_ids = inbox::channel_ids_with_unread_mentions_for(&kernel.store, agent_id).await?;
    ok(&json!({ "channels": channel_ids }))
}

pub async fn claim_mentions(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let claimed = inbox::claim_mentions(&kernel.store, agent_id).await?;
    ok(&json!({ "channels": claimed }))
}

pub async fn release_mentions(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let body: serde_json::Value = read_body(req).await?;
    let channel_ids: Vec<Uuid> = serde_json::from_value(body["channel_ids"].clone())
        .map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
    inbox::release_mention_processing(&kernel.store, agent_id, &channel_ids).await?;
    ok(&json!({ "released": channel_ids.len() }))
}

pub async fn create_inbox_message(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let body: CreateInboxMessageRequest = read_body(req).await?;
    let message = inbox::create_inbox_message(
        &kernel.store,
        body.agent_id,
        &body.content,
        &body.source,
        body.origin,
    )
    .await?;
    json_response(StatusCode::CREATED, &message)
}

pub async fn list_inbox_messages(kernel: &Kernel, agent_id: Uuid) -> DaemonResult<Response<Body>> {
    let messages = inbox::list_inbox_messages(&kernel.store, agent_id).await?;
    ok(&json!({ "messages": messages, "total": messages.len() }))
}

pub async fn claim_inbox(kernel: &Kernel, req: hyper::Request<Body>) -> DaemonResult<Response<Body>> {
    let agent_id = agent_id_header(&req)?;
    let body: ClaimInboxRequest = read_body(req).await?;
    let messages = inbox::claim_inbox_messages(&kernel.store, agent_id, body.limit).await?;
    ok(&json!({ "messages": messages, "total": messages.len() }))
}

// --- Epics (not in the route table's minimal surface but exercised by the
// scheduler/epic progress trigger, exposed for parity with the rest of the
// read-model routes) ---------------------------------------------------

pub async fn list_epics(kernel: &Kernel) -> DaemonResult<Response<Body>> {
    let epics = epics::list(&kernel.store).await?;
    ok(&json!({ "epics": epics }))
}
