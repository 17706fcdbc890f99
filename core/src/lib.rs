//! Orchestration kernel core: durable state store, task lifecycle engine,
//! agent registry, trigger dispatcher, inbox/mention protocol, scheduler,
//! epic aggregation and session tracking.

pub mod agents;
pub mod config;
pub mod epics;
pub mod errors;
pub mod inbox;
pub mod ingress;
pub mod models;
pub mod poll;
pub mod queries;
pub mod runtime;
pub mod scheduler;
pub mod sessions;
pub mod store;
pub mod tasks;

pub use errors::{KernelError, KernelResult};
pub use models::{
    ActiveSession, Agent, AgentLog, AgentStatus, Channel, ChannelMessage, ChannelReadState,
    ChangeSource, ContextVersion, CreateTaskOptions, Epic, EpicProgress, EpicStatus,
    InboxMessage, InboxStatus, PersonaFields, ScheduledTask, SessionCost, SessionLog, AgentTask,
    TaskSource, TaskStatus, Trigger,
};
pub use runtime::KernelRuntime;
pub use store::Store;

/// Library version, surfaced on `/health` and in startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
