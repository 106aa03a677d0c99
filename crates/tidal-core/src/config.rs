//! Process configuration, loaded from TOML.
//!
//! ```toml
//! name = "tidal"
//! imports = ["tcp 0.0.0.0:9000", "mmap /dev/shm/tidal.feed"]
//!
//! [engine]
//! pool_nodes = 4096
//! workers = 2
//! sinks = ["log", "latency 100000"]
//!
//! [ring]
//! overload_timeout_secs = 5
//!
//! [log]
//! level = "info"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::sink::split_spec;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process name, used in log lines.
    pub name: String,
    pub engine: EngineConfig,
    pub ring: RingConfig,
    pub log: LogConfig,
    /// Importer specifications: `tcp <addr>`, `pipe <path>`, `mmap <path>`.
    pub imports: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "tidal".into(),
            engine: EngineConfig::default(),
            ring: RingConfig::default(),
            log: LogConfig::default(),
            imports: Vec::new(),
        }
    }
}

/// Distribution engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of message nodes allocated at startup.
    pub pool_nodes: usize,
    /// Delivery worker threads.
    pub workers: usize,
    /// Busy-poll instead of sleeping on the idle condvar.
    pub pooling: bool,
    /// Idle sleep of a worker between rounds without progress.
    pub idle_wait_us: u64,
    /// Replace a worker that exited after a sink failure.
    pub respawn_workers: bool,
    /// Cores to pin workers to, assigned round-robin. Empty disables pinning.
    pub cpu_affinity: Vec<usize>,
    /// Add a `log` sink in front of the configured ones.
    pub log_sink: bool,
    /// Sink specifications; `;` joins several sinks into one chain.
    pub sinks: Vec<String>,
    /// Directory searched for `lib<name>.so` plugins.
    pub plugin_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_nodes: 4096,
            workers: 2,
            pooling: false,
            idle_wait_us: 300,
            respawn_workers: true,
            cpu_affinity: Vec::new(),
            log_sink: false,
            sinks: Vec::new(),
            plugin_dir: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_micros(self.idle_wait_us)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// How long a ring writer waits for its reader before failing.
    pub overload_timeout_secs: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            overload_timeout_secs: tidal_ring::DEFAULT_OVERLOAD_TIMEOUT.as_secs(),
        }
    }
}

impl RingConfig {
    pub fn overload_timeout(&self) -> Duration {
        Duration::from_secs(self.overload_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&contents)
    }

    fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        let engine = &self.engine;
        if engine.pool_nodes < 2 {
            return Err(ConfigError::invalid("engine.pool_nodes", "at least 2 nodes are required"));
        }
        if engine.pool_nodes >= u32::MAX as usize - 1 {
            return Err(ConfigError::invalid("engine.pool_nodes", "too large"));
        }
        if engine.workers == 0 {
            return Err(ConfigError::invalid("engine.workers", "at least one worker is required"));
        }
        if !engine.pooling && engine.idle_wait_us == 0 {
            return Err(ConfigError::invalid("engine.idle_wait_us", "must be positive unless pooling"));
        }
        if let Some(spec) = engine.sinks.iter().find(|s| s.trim().is_empty()) {
            return Err(ConfigError::invalid("engine.sinks", format!("empty sink spec {spec:?}")));
        }
        if self.ring.overload_timeout_secs == 0 {
            return Err(ConfigError::invalid("ring.overload_timeout_secs", "must be positive"));
        }
        Ok(())
    }

    /// Sink specifications with process-wide ring settings filled in.
    ///
    /// A bare `mmap <path>` sink inherits the engine's pooling mode and the
    /// ring overload timeout.
    pub fn sink_specs(&self) -> Vec<String> {
        let mode = if self.engine.pooling { "pooling" } else { "blocking" };
        let timeout = self.ring.overload_timeout_secs;

        let log = self.engine.log_sink.then(|| "log".to_string());
        log.into_iter()
            .chain(self.engine.sinks.iter().map(|spec| {
                spec.split(';')
                    .map(|part| {
                        let part = part.trim();
                        match split_spec(part) {
                            ("mmap", params) if params.split_whitespace().count() == 1 => {
                                format!("mmap {params} {mode} {timeout}")
                            }
                            _ => part.to_string(),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(";")
            }))
            .collect()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.name, "tidal");
        assert_eq!(config.engine.pool_nodes, 4096);
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.idle_wait(), Duration::from_micros(300));
        assert!(config.engine.respawn_workers);
        assert_eq!(config.ring.overload_timeout(), Duration::from_secs(5));
        assert_eq!(config.log.level, "info");
        assert!(config.imports.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_str(
            r#"
            name = "hub-1"
            imports = ["tcp 0.0.0.0:9000", "mmap /dev/shm/tidal.feed"]

            [engine]
            pool_nodes = 128
            workers = 4
            pooling = true
            cpu_affinity = [2, 3]
            log_sink = true
            sinks = ["latency 1000", "mmap /dev/shm/out"]
            plugin_dir = "/opt/tidal/lib"

            [ring]
            overload_timeout_secs = 9

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "hub-1");
        assert_eq!(config.engine.pool_nodes, 128);
        assert_eq!(config.engine.cpu_affinity, vec![2, 3]);
        assert_eq!(config.engine.plugin_dir, PathBuf::from("/opt/tidal/lib"));
        assert_eq!(config.imports.len(), 2);
        assert_eq!(
            config.sink_specs(),
            vec!["log", "latency 1000", "mmap /dev/shm/out pooling 9"]
        );
    }

    #[test]
    fn test_sink_specs_inside_chain() {
        let mut config = Config::default();
        config.engine.sinks = vec!["log; mmap /tmp/a".into(), "mmap /tmp/b pooling 1".into()];
        assert_eq!(
            config.sink_specs(),
            vec!["log;mmap /tmp/a blocking 5", "mmap /tmp/b pooling 1"]
        );
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            Config::from_str("[engine]\nworkers = 0"),
            Err(ConfigError::InvalidValue { field: "engine.workers", .. })
        ));
        assert!(matches!(
            Config::from_str("[engine]\npool_nodes = 1"),
            Err(ConfigError::InvalidValue { field: "engine.pool_nodes", .. })
        ));
        assert!(matches!(
            Config::from_str("[ring]\noverload_timeout_secs = 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(Config::from_str("[engine]\npooling = true\nidle_wait_us = 0").is_ok());
        assert!(matches!(
            Config::from_str("name = 3"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidal.toml");
        fs::write(&path, "name = \"from-file\"\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().name, "from-file");

        let err = Config::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
