/// Normalised shape ingress adapters are expected to produce before calling
/// the kernel.
///
/// Signature verification, HTTP clients, and provider-specific payload
/// parsing remain external collaborators — this module only defines the
/// contract surface `core::tasks`/`core::inbox` accept.
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum IngressEvent {
    Chat {
        channel_name: String,
        author: String,
        content: String,
        event_id: String,
    },
    Github {
        event_id: String,
        payload: Value,
    },
    Mail {
        event_id: String,
        from: String,
        subject: String,
        body: String,
    },
    Api {
        event_id: String,
        payload: Value,
    },
}

impl IngressEvent {
    /// The stable id used for the 60s idempotency window.
    pub fn event_id(&self) -> &str {
        match self {
            IngressEvent::Chat { event_id, .. } => event_id,
            IngressEvent::Github { event_id, .. } => event_id,
            IngressEvent::Mail { event_id, .. } => event_id,
            IngressEvent::Api { event_id, .. } => event_id,
        }
    }
}
