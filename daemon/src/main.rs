/// Orchestration kernel daemon entry point.
use descartes_kernel_core::scheduler::SchedulerHandle;
use descartes_kerneld::{DaemonConfig, Kernel, RpcServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();

    info!("starting orchestration kernel daemon v{}", descartes_kerneld::VERSION);

    let config = DaemonConfig::from_env();
    config.validate().map_err(anyhow::Error::msg)?;

    let kernel = Kernel::open(config.clone()).await?;
    let scheduler_store = Arc::new(kernel.store.clone());
    let _scheduler = SchedulerHandle::spawn(scheduler_store, config.kernel.scheduler_tick_secs);

    let server = RpcServer::new(config, kernel);

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let signal_handler = tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("received CTRL+C signal"),
            () = terminate => info!("received SIGTERM signal"),
        }

        let _ = tx.send(()).await;
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "server error");
        }
    });

    tokio::select! {
        _ = signal_handler => info!("shutting down daemon..."),
        _ = rx.recv() => info!("shutting down daemon..."),
        _ = server_handle => info!("server terminated unexpectedly"),
    }

    info!("orchestration kernel daemon stopped");
    Ok(())
}
