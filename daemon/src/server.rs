/// HTTP server: method+path dispatch over the route table, auth gate, and
/// graceful shutdown wiring.
use crate::auth::AuthGate;
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::handlers;
use crate::kernel::Kernel;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct RpcServer {
    config: DaemonConfig,
    kernel: Arc<Kernel>,
    auth: Arc<AuthGate>,
}

impl RpcServer {
    pub fn new(config: DaemonConfig, kernel: Kernel) -> Self {
        let auth = Arc::new(AuthGate::new(config.kernel.api_key.clone()));
        Self {
            config,
            kernel: Arc::new(kernel),
            auth,
        }
    }

    pub async fn run(&self) -> DaemonResult<()> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.kernel.port);
        let addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| DaemonError::InvalidRequest(format!("invalid bind address: {e}")))?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| DaemonError::InvalidRequest(format!("failed to bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serves on an already-bound listener. Lets callers (tests, or a
    /// supervisor doing socket activation) pick the port themselves.
    pub async fn serve(&self, listener: std::net::TcpListener) -> DaemonResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| DaemonError::InvalidRequest(format!("no local address: {e}")))?;
        let kernel = self.kernel.clone();
        let auth = self.auth.clone();

        let make_svc = make_service_fn(move |_conn| {
            let kernel = kernel.clone();
            let auth = auth.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let kernel = kernel.clone();
                    let auth = auth.clone();
                    async move { Ok::<_, hyper::Error>(dispatch(req, kernel, auth).await) }
                }))
            }
        });

        let server = Server::from_tcp(listener)
            .map_err(|e| DaemonError::InvalidRequest(format!("failed to adopt listener: {e}")))?
            .serve(make_svc);
        info!("kernel daemon listening on http://{addr}");

        server
            .await
            .map_err(|e| DaemonError::InvalidRequest(format!("server error: {e}")))
    }
}

async fn dispatch(req: Request<Body>, kernel: Arc<Kernel>, auth: Arc<AuthGate>) -> Response<Body> {
    if req.method() == Method::GET && req.uri().path() == "/health" {
        return Response::new(Body::from("OK"));
    }

    if let Err(e) = auth.check(&req) {
        return e.into_response();
    }

    route(req, &kernel).await.unwrap_or_else(|e| e.into_response())
}

fn parse_id(segment: &str) -> DaemonResult<Uuid> {
    Uuid::parse_str(segment).map_err(|_| DaemonError::InvalidRequest(format!("invalid id: {segment}")))
}

async fn route(req: Request<Body>, kernel: &Kernel) -> DaemonResult<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = handlers::parse_query(req.uri().query());
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::POST, ["api", "agents"]) => handlers::create_agent(kernel, req).await,
        (&Method::GET, ["me"]) => handlers::me(kernel, req).await,
        (&Method::POST, ["ping"]) => handlers::ping(kernel, req).await,
        (&Method::POST, ["close"]) => handlers::close(kernel, req).await,
        (&Method::GET, ["api", "poll"]) => handlers::poll_for_agent(kernel, req).await,

        (&Method::GET, ["api", "agents", id]) => handlers::get_agent(kernel, parse_id(id)?).await,
        (&Method::GET, ["api", "agents"]) => handlers::list_agents(kernel).await,
        (&Method::PUT, ["api", "agents", id, "profile"]) => {
            handlers::update_profile(kernel, parse_id(id)?, req).await
        }

        (&Method::POST, ["api", "tasks"]) => handlers::create_task(kernel, req).await,
        (&Method::GET, ["api", "tasks", id]) => handlers::get_task(kernel, parse_id(id)?).await,
        (&Method::GET, ["api", "tasks"]) => handlers::list_tasks(kernel, &query).await,
        (&Method::PUT, ["api", "tasks", id, "claude-session"]) => {
            handlers::set_claude_session(kernel, parse_id(id)?, req).await
        }
        (&Method::POST, ["api", "tasks", id, "pause"]) => handlers::pause_task(kernel, parse_id(id)?).await,
        (&Method::POST, ["api", "tasks", id, "resume"]) => handlers::resume_task(kernel, parse_id(id)?).await,
        (&Method::POST, ["api", "tasks", id, "cancel"]) => {
            handlers::cancel_task(kernel, parse_id(id)?, req).await
        }
        (&Method::POST, ["api", "tasks", "notified", "reset"]) => {
            handlers::reset_notified(kernel, req).await
        }

        (&Method::GET, ["api", "stats"]) => handlers::stats(kernel).await,

        (&Method::POST, ["api", "session-costs"]) => handlers::record_session_cost(kernel, req).await,
        (&Method::GET, ["api", "session-costs", "summary"]) => {
            handlers::session_cost_summary(kernel, &query).await
        }
        (&Method::GET, ["api", "session-costs", "dashboard"]) => {
            handlers::session_cost_dashboard(kernel).await
        }
        (&Method::GET, ["api", "session-costs"]) => handlers::list_session_costs(kernel, &query).await,

        (&Method::GET, ["api", "scheduled-tasks"]) => handlers::list_scheduled_tasks(kernel, &query).await,
        (&Method::POST, ["api", "scheduled-tasks", id, "run-now"]) => {
            handlers::run_schedule_now(kernel, parse_id(id)?).await
        }

        (&Method::POST, ["api", "channels"]) => handlers::create_channel(kernel, req).await,
        (&Method::POST, ["api", "channels", id, "messages"]) => {
            handlers::post_message(kernel, parse_id(id)?, req).await
        }
        (&Method::GET, ["api", "channels", id, "messages"]) => {
            handlers::list_channel_messages(kernel, parse_id(id)?, &query).await
        }
        (&Method::GET, ["api", "channels", id, "unread"]) => {
            handlers::channel_unread(kernel, parse_id(id)?, req).await
        }
        (&Method::GET, ["api", "channels", "mentions"]) => handlers::channel_mentions(kernel, req).await,
        (&Method::POST, ["api", "channels", "mentions", "claim"]) => {
            handlers::claim_mentions(kernel, req).await
        }
        (&Method::POST, ["api", "channels", "mentions", "release"]) => {
            handlers::release_mentions(kernel, req).await
        }

        (&Method::POST, ["api", "inbox"]) => handlers::create_inbox_message(kernel, req).await,
        (&Method::GET, ["api", "inbox", agent_id]) => {
            handlers::list_inbox_messages(kernel, parse_id(agent_id)?).await
        }
        (&Method::POST, ["api", "inbox", "claim"]) => handlers::claim_inbox(kernel, req).await,

        (&Method::GET, ["api", "epics"]) => handlers::list_epics(kernel).await,

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(r#"{"error":"no such route"}"#))
            .unwrap()),
    }
}
