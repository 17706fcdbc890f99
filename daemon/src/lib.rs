/// Orchestration kernel daemon: HTTP front end over `descartes_kernel_core`.
pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod kernel;
pub mod server;
pub mod types;

pub use config::DaemonConfig;
pub use errors::{DaemonError, DaemonResult};
pub use kernel::Kernel;
pub use server::RpcServer;

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
