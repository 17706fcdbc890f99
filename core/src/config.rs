/// Environment-driven configuration for the kernel and its daemon.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Resolved kernel configuration. Every field reads from the environment at
/// `KernelConfig::from_env()`; nothing here is read lazily at call sites.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub database_path: PathBuf,
    pub port: u16,
    pub api_key: Option<String>,
    pub app_url: Option<String>,
    pub scheduler_tick_secs: u64,
    pub stale_reviewing_minutes: i64,
    pub stale_mention_processing_minutes: i64,
    pub stale_session_minutes: i64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            database_path: PathBuf::from("./agent-swarm-db.sqlite"),
            port: 8080,
            api_key: None,
            app_url: None,
            scheduler_tick_secs: 10,
            stale_reviewing_minutes: 30,
            stale_mention_processing_minutes: 30,
            stale_session_minutes: 30,
        }
    }
}

impl KernelConfig {
    /// Read every setting from the process environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = KernelConfig::default();

        KernelConfig {
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            api_key: std::env::var("API_KEY").ok().filter(|s| !s.is_empty()),
            app_url: std::env::var("APP_URL").ok().filter(|s| !s.is_empty()),
            scheduler_tick_secs: std::env::var("SCHEDULER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.scheduler_tick_secs),
            stale_reviewing_minutes: defaults.stale_reviewing_minutes,
            stale_mention_processing_minutes: defaults.stale_mention_processing_minutes,
            stale_session_minutes: defaults.stale_session_minutes,
        }
    }
}

/// Write `key=value` into a `.env`-style file at `path`, preserving every
/// other line verbatim. Creates the file if it does not exist.
pub fn write_env_file(path: impl AsRef<Path>, key: &str, value: &str) -> std::io::Result<()> {
    let path = path.as_ref();
    let existing = std::fs::read_to_string(path).unwrap_or_default();

    let mut ordered_keys: Vec<String> = Vec::new();
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    let mut passthrough: Vec<String> = Vec::new();

    for line in existing.lines() {
        match line.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() && !line.trim_start().starts_with('#') => {
                let k = k.trim().to_string();
                ordered_keys.push(k.clone());
                values.insert(k, v.to_string());
            }
            _ => passthrough.push(line.to_string()),
        }
    }

    if !values.contains_key(key) {
        ordered_keys.push(key.to_string());
    }
    values.insert(key.to_string(), value.to_string());

    let mut out = String::new();
    for line in &passthrough {
        out.push_str(line);
        out.push('\n');
    }
    for k in &ordered_keys {
        out.push_str(k);
        out.push('=');
        out.push_str(&values[k]);
        out.push('\n');
    }

    std::fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_env_file_preserves_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "FOO=bar\n# a comment\nBAZ=qux\n").unwrap();

        write_env_file(&path, "API_KEY", "secret123").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("FOO=bar"));
        assert!(content.contains("BAZ=qux"));
        assert!(content.contains("API_KEY=secret123"));
        assert!(content.contains("# a comment"));
    }

    #[test]
    fn write_env_file_overwrites_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "API_KEY=old\n").unwrap();

        write_env_file(&path, "API_KEY", "new").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "API_KEY=new\n");
    }
}
