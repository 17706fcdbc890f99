/// Daemon process configuration, layered on the core kernel's env-driven config.
use descartes_kernel_core::config::KernelConfig;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub kernel: KernelConfig,
    pub bind_addr: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let kernel = KernelConfig::from_env();
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());
        Self { kernel, bind_addr }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.kernel.port == 0 {
            return Err("PORT must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DaemonConfig::default().validate().is_ok());
    }
}
