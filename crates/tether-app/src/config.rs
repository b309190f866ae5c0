//! Daemon configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use tether_notify::{ClassifierConfig, DEFAULT_AGENT_PATTERNS, DEFAULT_PROMPT_PATTERN};
use tether_pty::SessionOptions;
use tether_vt::BufferConfig;
use tracing_subscriber::EnvFilter;

use crate::logging;

/// Current configuration layout.
pub const CONFIG_VERSION: u32 = 2;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Layout version. Absent means current; older layouts are upgraded.
    pub version: u32,
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
    pub sessions: SessionsConfig,
    pub classifier: ClassifierSection,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerConfig::default(),
            terminal: TerminalConfig::default(),
            sessions: SessionsConfig::default(),
            classifier: ClassifierSection::default(),
            notifications: NotificationsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// SQLite file for settings; `None` keeps them in memory.
    pub database: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7420".to_string(),
            database: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub default_cols: u16,
    pub default_rows: u16,
    pub scrollback_lines: usize,
    pub snapshot_history: usize,
    pub frame_history: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        let buffer = BufferConfig::default();
        Self {
            default_cols: 80,
            default_rows: 24,
            scrollback_lines: buffer.scrollback_lines,
            snapshot_history: buffer.snapshot_history,
            frame_history: buffer.frame_history,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub kill_grace_ms: u64,
    pub kill_timeout_ms: u64,
    pub exit_drain_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: 2000,
            kill_timeout_ms: 3000,
            exit_drain_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub long_command_threshold_ms: u64,
    /// Empty disables regex prompt detection.
    pub prompt_pattern: String,
    pub agent_patterns: Vec<String>,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            long_command_threshold_ms: 3000,
            prompt_pattern: DEFAULT_PROMPT_PATTERN.to_string(),
            agent_patterns: DEFAULT_AGENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Bells from one session closer together than this are merged.
    pub bell_window_ms: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { bell_window_ms: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `tether_pty=debug,info`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            scrollback_lines: self.terminal.scrollback_lines,
            frame_history: self.terminal.frame_history,
            snapshot_history: self.terminal.snapshot_history,
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        let pattern = &self.classifier.prompt_pattern;
        ClassifierConfig {
            long_command_threshold: Duration::from_millis(
                self.classifier.long_command_threshold_ms,
            ),
            prompt_pattern: (!pattern.trim().is_empty()).then(|| pattern.clone()),
            agent_patterns: self.classifier.agent_patterns.clone(),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            buffer: self.buffer_config(),
            classifier: self.classifier_config(),
            kill_grace: Duration::from_millis(self.sessions.kill_grace_ms),
            kill_timeout: Duration::from_millis(self.sessions.kill_timeout_ms),
            exit_drain: Duration::from_millis(self.sessions.exit_drain_ms),
        }
    }

    pub fn bell_window(&self) -> Duration {
        Duration::from_millis(self.notifications.bell_window_ms)
    }

    pub fn log_filter(&self) -> Result<EnvFilter, ConfigError> {
        logging::filter(&self.logging.level).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `path`, else `$TETHER_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Config::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse configuration from string, upgrading older layouts.
    pub fn parse(content: &str, path: &Path) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self::upgrade(config))
    }

    pub fn upgrade(mut config: Config) -> Config {
        if config.version < 2 {
            // v1 measured the command threshold in seconds.
            if config.classifier.long_command_threshold_ms < 1000 {
                config.classifier.long_command_threshold_ms *= 1000;
            }
        }
        if config.version < CONFIG_VERSION {
            info!("upgrading config v{} -> v{}", config.version, CONFIG_VERSION);
            config.version = CONFIG_VERSION;
        }
        config
    }

    /// Validate configuration
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.terminal.default_cols == 0 || config.terminal.default_rows == 0 {
            return Err(ConfigError::Invalid(
                "terminal.default_cols and terminal.default_rows must be positive".into(),
            ));
        }
        if config.terminal.frame_history == 0 {
            return Err(ConfigError::Invalid(
                "terminal.frame_history must be at least 1".into(),
            ));
        }
        if config.sessions.kill_grace_ms == 0 || config.sessions.kill_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sessions.kill_grace_ms and sessions.kill_timeout_ms must be positive".into(),
            ));
        }
        config.log_filter()?;
        config
            .classifier_config()
            .build_matchers()
            .map_err(|e| ConfigError::Invalid(format!("classifier pattern: {e}")))?;
        Ok(())
    }
}
