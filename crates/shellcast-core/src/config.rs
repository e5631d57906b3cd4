// ABOUTME: Configuration loading and validation for shellcast
// ABOUTME: TOML file with env expansion, sensible defaults, and static hook validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ExecError};
use crate::hooks::{HookDescriptor, HookPhase, HookRunner};
use crate::session::SessionLimits;
use crate::supervisor::SupervisorConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SHELLCAST_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub process: ProcessConfig,
    /// Pre/post execution hooks
    pub hooks: Vec<HookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,
    /// WebSocket endpoint path
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8003".to_string(),
            ws_path: "/ws/mcp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Evict sessions idle longer than this
    pub idle_timeout_secs: u64,
    /// Absolute session age limit, 0 = unlimited
    pub max_lifetime_secs: u64,
    /// How often the eviction sweep runs
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout_secs: 3600,
            max_lifetime_secs: 0,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Shell used to interpret commands (`<shell> -c <command>`)
    pub shell: String,
    /// Timeout when a request does not give one
    pub default_timeout_secs: u64,
    /// Upper bound for requested timeouts
    pub max_timeout_secs: u64,
    /// SIGTERM to SIGKILL interval
    pub grace_period_ms: u64,
    /// Read size for output chunks
    pub chunk_size: usize,
    /// Stdout kept in memory for JSON mode
    pub max_capture_bytes: usize,
    /// Default working directory for commands
    pub working_dir: Option<PathBuf>,
    /// Permitted first tokens; empty allows everything
    pub allowed_commands: Vec<String>,
    /// Set PYTHONUNBUFFERED / NODE_NO_READLINE for children
    pub unbuffered: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            default_timeout_secs: 600,
            max_timeout_secs: 3600,
            grace_period_ms: 2000,
            chunk_size: 8192,
            max_capture_bytes: 8 * 1024 * 1024,
            working_dir: None,
            allowed_commands: Vec::new(),
            unbuffered: true,
        }
    }
}

impl ProcessConfig {
    /// Requested timeout, or the default, clamped to the maximum.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_timeout_secs);
        requested
            .unwrap_or(Duration::from_secs(self.default_timeout_secs))
            .min(max)
    }

    /// Reject blank commands and, with an allow-list, unlisted programs.
    pub fn check_command(&self, command: &str) -> Result<(), ExecError> {
        let Some(program) = command.split_whitespace().next() else {
            return Err(ExecError::InvalidParams("command is empty".into()));
        };
        if self.allowed_commands.is_empty() || self.allowed_commands.iter().any(|c| c == program) {
            Ok(())
        } else {
            Err(ExecError::CommandNotAllowed(program.to_string()))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: String,
    pub command: String,
    pub phase: HookPhase,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub order: i32,
}

fn default_hook_timeout() -> u64 {
    crate::hooks::DEFAULT_HOOK_TIMEOUT.as_secs()
}

impl From<&HookConfig> for HookDescriptor {
    fn from(h: &HookConfig) -> Self {
        HookDescriptor {
            name: h.name.clone(),
            command: h.command.clone(),
            phase: h.phase,
            timeout: Duration::from_secs(h.timeout_secs),
            order: h.order,
        }
    }
}

impl Config {
    /// Get the XDG config directory for shellcast (~/.config/shellcast)
    pub fn config_dir() -> PathBuf {
        // Respect XDG_CONFIG_HOME if set, otherwise use ~/.config
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("shellcast")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from an explicit path, `SHELLCAST_CONFIG`, or the XDG location.
    ///
    /// Only a missing default file falls back to defaults; a missing explicit
    /// file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Self::load_from(path);
            }
        }

        let path = Self::config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Parse TOML after expanding `${VAR}` references from the environment.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = shellexpand::env_with_context_no_errors(content, |var: &str| {
            match std::env::var(var) {
                Ok(val) => Some(val),
                Err(_) => {
                    tracing::warn!(
                        variable = %var,
                        "Environment variable not defined, using empty string"
                    );
                    Some(String::new())
                }
            }
        });
        Ok(toml::from_str(&expanded)?)
    }

    /// Check everything that can be checked before serving.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::invalid("server.bind", "must not be empty"));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::invalid("server.ws_path", "must start with '/'"));
        }
        if self.server.ws_path == "/health" {
            return Err(ConfigError::invalid("server.ws_path", "conflicts with /health"));
        }

        let s = &self.sessions;
        if s.max_sessions == 0 {
            return Err(ConfigError::invalid("sessions.max_sessions", "must be at least 1"));
        }
        if s.idle_timeout_secs == 0 {
            return Err(ConfigError::invalid("sessions.idle_timeout_secs", "must be positive"));
        }
        if s.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("sessions.sweep_interval_secs", "must be positive"));
        }

        let p = &self.process;
        if p.shell.trim().is_empty() {
            return Err(ConfigError::invalid("process.shell", "must not be empty"));
        }
        if p.chunk_size == 0 {
            return Err(ConfigError::invalid("process.chunk_size", "must be at least 1"));
        }
        if p.default_timeout_secs == 0 || p.max_timeout_secs == 0 {
            return Err(ConfigError::invalid("process.default_timeout_secs", "timeouts must be positive"));
        }
        if p.default_timeout_secs > p.max_timeout_secs {
            return Err(ConfigError::invalid(
                "process.default_timeout_secs",
                format!("{} exceeds max_timeout_secs {}", p.default_timeout_secs, p.max_timeout_secs),
            ));
        }

        // building the runner checks names, duplicates and command syntax
        self.hook_runner().map(|_| ())
    }

    pub fn hook_descriptors(&self) -> Vec<HookDescriptor> {
        self.hooks.iter().map(HookDescriptor::from).collect()
    }

    pub fn hook_runner(&self) -> Result<HookRunner, ConfigError> {
        HookRunner::new(self.hook_descriptors())
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_sessions: self.sessions.max_sessions,
            idle_timeout: Duration::from_secs(self.sessions.idle_timeout_secs),
            max_lifetime: (self.sessions.max_lifetime_secs > 0)
                .then(|| Duration::from_secs(self.sessions.max_lifetime_secs)),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            shell: self.process.shell.clone(),
            chunk_size: self.process.chunk_size,
            grace: Duration::from_millis(self.process.grace_period_ms),
            unbuffered: self.process.unbuffered,
        }
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# shellcast configuration
# Location: ~/.config/shellcast/config.toml
# ${VAR} references are expanded from the environment.

[server]
bind = "127.0.0.1:8003"
ws_path = "/ws/mcp"

[sessions]
max_sessions = 100
idle_timeout_secs = 3600
# max_lifetime_secs = 0   # 0 = unlimited
sweep_interval_secs = 30

[process]
shell = "/bin/sh"
default_timeout_secs = 600
max_timeout_secs = 3600
grace_period_ms = 2000
chunk_size = 8192
max_capture_bytes = 8388608
# working_dir = "/srv/work"
# allowed_commands = ["python", "echo", "ls"]   # empty = allow all
unbuffered = true

# Hooks run in order of (phase, order). A failing pre hook blocks the command.
# [[hooks]]
# name = "setup_env"
# command = "/usr/local/bin/setup-env --quiet"
# phase = "pre"
# timeout_secs = 30
# order = 0
#
# [[hooks]]
# name = "record"
# command = "${HOME}/bin/record-run"
# phase = "post"
"#
        .to_string()
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

        // Write default config if it doesn't exist
        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_toml())
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_toml_parses_to_defaults() {
        let config = Config::from_toml(&Config::default_toml()).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.server.bind, "127.0.0.1:8003");
        assert_eq!(config.sessions.max_sessions, 100);
        assert_eq!(config.process.chunk_size, 8192);
        assert!(config.hooks.is_empty());
        assert!(config.session_limits().max_lifetime.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
[sessions]
max_sessions = 5

[[hooks]]
name = "gate"
command = "/bin/false"
phase = "pre"
"#,
        )
        .expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.sessions.max_sessions, 5);
        assert_eq!(config.sessions.idle_timeout_secs, 3600);
        assert_eq!(config.hooks[0].timeout_secs, 60);
        assert_eq!(config.hook_descriptors()[0].phase, HookPhase::Pre);
    }

    #[test]
    fn expands_environment_references() {
        std::env::set_var("SHELLCAST_TEST_BIND", "0.0.0.0:9999");
        let config = Config::from_toml("[server]\nbind = \"${SHELLCAST_TEST_BIND}\"\n").expect("parse");
        assert_eq!(config.server.bind, "0.0.0.0:9999");

        let config =
            Config::from_toml("[process]\nshell = \"/bin/${SHELLCAST_TEST_UNSET_VAR}sh\"\n").expect("parse");
        assert_eq!(config.process.shell, "/bin/sh");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.sessions.max_sessions = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "sessions.max_sessions"));

        let mut config = Config::default();
        config.process.default_timeout_secs = 7200;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.process.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let hook = HookConfig {
            name: "twice".into(),
            command: "true".into(),
            phase: HookPhase::Post,
            timeout_secs: 5,
            order: 0,
        };
        config.hooks = vec![hook.clone(), hook];
        assert_eq!(config.validate(), Err(ConfigError::DuplicateHook("twice".into())));
    }

    #[test]
    fn load_from_reports_path_on_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[sessions]\nmax_sessions = \"lots\"").expect("write");
        let err = Config::load_from(file.path()).expect_err("type error");
        assert!(format!("{err:#}").contains(&file.path().display().to_string()));

        assert!(Config::load(Some(Path::new("/no/such/shellcast.toml"))).is_err());
    }

    #[test]
    fn timeout_is_defaulted_and_clamped() {
        let p = ProcessConfig::default();
        assert_eq!(p.effective_timeout(None), Duration::from_secs(600));
        assert_eq!(p.effective_timeout(Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(
            p.effective_timeout(Some(Duration::from_secs(99_999))),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn allow_list_checks_first_token() {
        let mut p = ProcessConfig::default();
        p.check_command("anything goes").expect("open");
        assert!(matches!(p.check_command("   "), Err(ExecError::InvalidParams(_))));

        p.allowed_commands = vec!["echo".into(), "python".into()];
        p.check_command("echo hi").expect("listed");
        assert_eq!(
            p.check_command("rm -rf /tmp/x"),
            Err(ExecError::CommandNotAllowed("rm".into()))
        );
    }
}
