//! Runtime configuration for the engine host.
//!
//! Loaded from `ENGINE_HOST_CONFIG` or `~/.engine-host/config.toml`. Every field
//! has a default, so a missing file is the normal case.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::handshake::{DEFAULT_BUFFER_SIZE, DEFAULT_RENDEZVOUS_NAME};

const CONFIG_ENV: &str = "ENGINE_HOST_CONFIG";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".engine-host/config.toml";
const DEFAULT_CRASH_DB_RELATIVE_PATH: &str = ".engine-host/crashes";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub lifecycle: LifecycleConfig,
    pub handshake: HandshakeConfig,
    pub crash_reporter: CrashReporterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    pub idle_grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_grace_ms: 5000,
            poll_interval_ms: 50,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_grace_period(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero interval would spin the poll loop.
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeConfig {
    pub name: String,
    pub directory: Option<PathBuf>,
    pub buffer_size: usize,
    /// Unset keeps the unbounded wait for the watchdog.
    pub timeout_ms: Option<u64>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_RENDEZVOUS_NAME.to_string(),
            directory: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout_ms: None,
        }
    }
}

impl HandshakeConfig {
    pub fn socket_path(&self) -> PathBuf {
        let directory = self.directory.clone().unwrap_or_else(std::env::temp_dir);
        directory.join(format!("{}.sock", self.name))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrashReporterConfig {
    /// Crash handler executable. Crash reporting is disabled when unset.
    pub handler: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub upload_url: String,
    pub arguments: Vec<String>,
    pub ready_timeout_ms: Option<u64>,
    /// Registers `System.InduceFault` for exercising the fatal path.
    pub allow_induced_fault: bool,
}

impl CrashReporterConfig {
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(DEFAULT_CRASH_DB_RELATIVE_PATH))
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<HostConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(HostConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)?;
    parse_config(&content).map_err(|source| ConfigError::Parse {
        path: config_path,
        source,
    })
}

fn parse_config(content: &str) -> Result<HostConfig, toml::de::Error> {
    toml::from_str::<HostConfig>(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_reference_timings() {
        let config = parse_config("").expect("parse empty config");
        assert_eq!(config.lifecycle.idle_grace_period(), Duration::from_millis(5000));
        assert_eq!(config.lifecycle.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.handshake.name, DEFAULT_RENDEZVOUS_NAME);
        assert_eq!(config.handshake.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.handshake.timeout(), None);
        assert!(config.crash_reporter.handler.is_none());
        assert!(!config.crash_reporter.allow_induced_fault);
    }

    #[test]
    fn parses_partial_sections() {
        let config = parse_config(
            r#"
            [lifecycle]
            idle_grace_ms = 250

            [handshake]
            directory = "/tmp/engine-host-test"
            timeout_ms = 1000

            [crash_reporter]
            handler = "/opt/engine/crash_handler"
            upload_url = "https://crash.example.invalid/submit"
            arguments = ["--verbose"]
            allow_induced_fault = true
            "#,
        )
        .expect("parse config");

        assert_eq!(config.lifecycle.idle_grace_ms, 250);
        assert_eq!(config.lifecycle.poll_interval_ms, 50);
        assert_eq!(
            config.handshake.socket_path(),
            PathBuf::from("/tmp/engine-host-test/exit-engine-crash-handler.sock")
        );
        assert_eq!(config.handshake.timeout(), Some(Duration::from_secs(1)));
        assert!(config.crash_reporter.handler.is_some());
        assert_eq!(config.crash_reporter.arguments, vec!["--verbose"]);
        assert!(config.crash_reporter.allow_induced_fault);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(parse_config("[lifecycle]\nidle_grace = 5\n").is_err());
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = parse_config("[lifecycle]\npoll_interval_ms = 0\n").expect("parse config");
        assert_eq!(config.lifecycle.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(Some(dir.path().join("absent.toml"))).expect("load config");
        assert_eq!(config.lifecycle.idle_grace_ms, 5000);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[lifecycle\n").expect("write config");

        let err = load_config(Some(path.clone())).expect_err("malformed config");
        assert!(err.to_string().contains(&path.display().to_string()));
    }
}
