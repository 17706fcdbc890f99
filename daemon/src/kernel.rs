/// Shared application state handed to every route handler.
use crate::config::DaemonConfig;
use crate::errors::DaemonResult;
use descartes_kernel_core::{KernelRuntime, Store};

pub struct Kernel {
    pub store: Store,
    pub runtime: KernelRuntime,
    pub config: DaemonConfig,
}

impl Kernel {
    pub async fn open(config: DaemonConfig) -> DaemonResult<Self> {
        let store = Store::open_or_create(&config.kernel.database_path).await?;
        Ok(Self {
            store,
            runtime: KernelRuntime::new(),
            config,
        })
    }
}
