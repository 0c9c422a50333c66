use std::path::Path;

use prefork::{PoolConfig, SignalConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ServerError, ServerResult};

pub const DEFAULT_PORT: u16 = 2342;
pub(crate) const DEFAULT_BUSY_POLL_US: u32 = 50;
pub(crate) const DEFAULT_BODY: &str = "Hello, World!";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Number of workers; defaults to one per CPU.
    pub workers: Option<usize>,
    /// CPU list in kernel syntax (`"0-3,6"`); defaults to the process's
    /// affinity mask.
    pub cpus: Option<String>,
    /// Pin each worker to its CPU.
    pub affinity: bool,
    pub response: ResponseConfig,
    pub socket: SocketConfig,
    pub signals: SignalConfig,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: None,
            cpus: None,
            affinity: true,
            response: ResponseConfig::default(),
            socket: SocketConfig::default(),
            signals: SignalConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Body of `GET /plaintext`.
    pub plaintext: String,
    /// `message` field of `GET /json`.
    pub json_message: String,
    /// Value of the `Server` header.
    pub server_name: String,
    pub date_header: bool,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            plaintext: DEFAULT_BODY.into(),
            json_message: DEFAULT_BODY.into(),
            server_name: "prefork".into(),
            date_header: true,
        }
    }
}

/// Per-listener socket options, applied by each worker to its own listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub enabled: bool,
    /// `SO_BUSY_POLL` in microseconds.
    pub busy_poll_us: Option<u32>,
    /// Set `TCP_NODELAY` (disable Nagle).
    pub nodelay: bool,
    /// Set `SO_KEEPALIVE` to this value.
    pub keepalive: Option<bool>,
    /// Attach a classic BPF program that steers each connection to the
    /// listener of the worker running on the receiving CPU.
    pub reuseport_cbpf: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            busy_poll_us: Some(DEFAULT_BUSY_POLL_US),
            nodelay: true,
            keepalive: Some(false),
            reuseport_cbpf: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Prefix each line with the emitting process id.
    pub pid: bool,
    pub timestamps: bool,
    pub colors: bool,
    pub disabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            pid: true,
            timestamps: true,
            colors: true,
            disabled: false,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub cpus: Option<String>,
    pub no_affinity: bool,
    pub no_socket_tuning: bool,
    pub disable_log: bool,
}

/// Load and validate a server config from a YAML file.
pub fn load(path: &Path) -> ServerResult<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("read {}: {e}", path.display())))?;
    let config: ServerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ServerError::Config(format!("parse {}: {e}", path.display())))?;
    config
        .validate()
        .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
    Ok(config)
}

impl ServerConfig {
    pub fn validate(&self) -> ServerResult<()> {
        if self.port == 0 {
            return Err(ServerError::Config("port must be non-zero".into()));
        }
        if self.workers == Some(0) {
            return Err(ServerError::Config(
                "workers must be greater than zero".into(),
            ));
        }
        if let Some(cpus) = &self.cpus {
            prefork::cpu::parse_cpu_list(cpus)
                .map_err(|e| ServerError::Config(format!("cpus: {e}")))?;
        }
        Ok(())
    }

    /// Apply command-line overrides and re-validate.
    pub fn apply(&mut self, overrides: Overrides) -> ServerResult<()> {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(workers) = overrides.workers {
            self.workers = Some(workers);
        }
        if let Some(cpus) = overrides.cpus {
            self.cpus = Some(cpus);
        }
        if overrides.no_affinity {
            self.affinity = false;
        }
        if overrides.no_socket_tuning {
            self.socket.enabled = false;
        }
        if overrides.disable_log {
            self.log.disabled = true;
        }
        self.validate()
    }

    /// Build the worker pool configuration.
    ///
    /// Without an explicit CPU list the pool gets one worker per CPU in the
    /// affinity mask. If that mask cannot be read, it falls back to a single
    /// unpinned worker.
    pub fn pool_config(&self) -> ServerResult<PoolConfig> {
        let mut pool = match &self.cpus {
            Some(list) => {
                let cpus = prefork::cpu::parse_cpu_list(list)
                    .map_err(|e| ServerError::Config(format!("cpus: {e}")))?;
                PoolConfig::new(cpus, self.affinity)
            }
            None => match PoolConfig::from_online_cpus() {
                Ok(pool) => PoolConfig {
                    enable_affinity: self.affinity,
                    ..pool
                },
                Err(e) => {
                    warn!(error = %e, "cpu query failed, falling back to one unpinned worker");
                    PoolConfig::new(vec![0], false)
                }
            },
        };
        if let Some(workers) = self.workers {
            pool = pool.with_workers(workers);
        }
        pool.validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
port: 8080
workers: 4
cpus: "0-1"
affinity: false
response:
  plaintext: pong
  json_message: hi
  server_name: test
  date_header: false
socket:
  enabled: true
  busy_poll_us: null
  nodelay: false
  keepalive: true
  reuseport_cbpf: false
signals:
  reload: true
  broken_pipe: false
log:
  level: debug
  pid: false
  colors: false
"#,
        );

        let config = load(&path).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.cpus.as_deref(), Some("0-1"));
        assert!(!config.affinity);
        assert_eq!(config.response.plaintext, "pong");
        assert_eq!(config.response.json_message, "hi");
        assert_eq!(config.response.server_name, "test");
        assert!(!config.response.date_header);
        assert_eq!(config.socket.busy_poll_us, None);
        assert!(!config.socket.nodelay);
        assert_eq!(config.socket.keepalive, Some(true));
        assert!(!config.socket.reuseport_cbpf);
        assert!(config.signals.reload);
        assert!(config.signals.terminate);
        assert!(!config.signals.broken_pipe);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(!config.log.pid);
        assert!(config.log.timestamps);
        assert!(!config.log.colors);
    }

    #[test]
    fn load_empty_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "{}\n");
        let config = load(&path).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.socket.busy_poll_us, Some(DEFAULT_BUSY_POLL_US));
        assert_eq!(config.socket.keepalive, Some(false));
        assert_eq!(config.response.plaintext, "Hello, World!");
    }

    #[test]
    fn load_rejects_port_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "port: 0\n");
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("port must be non-zero"), "{err}");
    }

    #[test]
    fn load_rejects_bad_cpu_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "cpus: \"3-1\"\n");
        assert!(matches!(load(&path), Err(ServerError::Config(_))));
    }

    #[test]
    fn load_rejects_cpu_ids_that_cannot_be_pinned() {
        let dir = tempfile::tempdir().unwrap();
        for cpus in ["5000", "0-4000000000"] {
            let path = write_config(&dir, &format!("cpus: \"{cpus}\"\n"));
            assert!(
                matches!(load(&path), Err(ServerError::Config(_))),
                "{cpus:?} was accepted"
            );
        }
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "port: [not a port\n");
        let err = load(&path).unwrap_err().to_string();
        assert!(err.contains("parse"), "{err}");
        assert!(err.contains("server.yaml"), "{err}");
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("read"), "{err}");
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = ServerConfig::default();
        config
            .apply(Overrides {
                port: Some(9000),
                workers: Some(2),
                cpus: Some("0".into()),
                no_affinity: true,
                no_socket_tuning: true,
                disable_log: true,
            })
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.cpus.as_deref(), Some("0"));
        assert!(!config.affinity);
        assert!(!config.socket.enabled);
        assert!(config.log.disabled);
    }

    #[test]
    fn empty_overrides_change_nothing() {
        let mut config = ServerConfig::default();
        config.apply(Overrides::default()).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn overrides_are_validated() {
        let mut config = ServerConfig::default();
        let result = config.apply(Overrides {
            workers: Some(0),
            ..Overrides::default()
        });
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn pool_config_from_explicit_cpus() {
        let config = ServerConfig {
            cpus: Some("2,0-1".into()),
            ..ServerConfig::default()
        };
        let pool = config.pool_config().unwrap();
        assert_eq!(pool.cpu_ids, vec![2, 0, 1]);
        assert_eq!(pool.worker_count, 3);
        assert!(pool.enable_affinity);
    }

    #[test]
    fn pool_config_cycles_cpus_for_extra_workers() {
        let config = ServerConfig {
            cpus: Some("0-1".into()),
            workers: Some(5),
            affinity: false,
            ..ServerConfig::default()
        };
        let pool = config.pool_config().unwrap();
        assert_eq!(pool.cpu_ids, vec![0, 1, 0, 1, 0]);
        assert!(!pool.enable_affinity);
    }

    #[test]
    fn pool_config_defaults_to_affinity_mask() {
        let pool = ServerConfig::default().pool_config().unwrap();
        assert_eq!(pool.cpu_ids, prefork::cpu::online_cpus().unwrap());
        assert!(pool.enable_affinity);
    }
}
