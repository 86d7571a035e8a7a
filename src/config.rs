//! Configuration loading and types for voicetotex
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/voicetotex/config.toml)
//! 3. Environment variables (VOICETOTEX_*)
//! 4. CLI arguments (highest priority)

use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that pins the worker interpreter
pub const PYTHON_ENV: &str = "VOICETOTEX_PYTHON";

/// Environment variable that points at the backend directory
pub const BACKEND_DIR_ENV: &str = "VOICETOTEX_BACKEND_DIR";

/// Environment variable that overrides the worker port
pub const PORT_ENV: &str = "VOICETOTEX_PORT";

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# VoiceToTex host configuration
#
# Location: ~/.config/voicetotex/config.toml
# All settings can be overridden via CLI flags

# State file for external integrations (Waybar, polybar, etc.)
# Use "auto" for default location ($XDG_RUNTIME_DIR/voicetotex/state),
# a custom path, or "disabled" to turn off. The host writes the backend
# status ("starting", "ready", "restarting", ...) whenever it changes.
state_file = "auto"

# Append raw backend stdout/stderr to this file (optional)
# log_file = "/tmp/voicetotex-backend.log"

[worker]
# Directory holding the backend script and requirements.txt
# backend_dir = "/usr/share/voicetotex/backend"

# Backend entry point, relative to backend_dir
script = "server.py"

# Fixed WebSocket port for the backend (omit to let it choose)
# port = 8765

# Seconds to wait for the READY handshake. The first run downloads the
# speech model, so keep this generous.
startup_timeout_secs = 120

# Automatic restarts after a crash before giving up
max_restarts = 3

# Restart delay grows linearly: attempt * restart_step_ms
restart_step_ms = 1000

# Grace period between terminate and kill on shutdown
shutdown_grace_ms = 5000

# Pause after terminating a backend left over from a previous run
stale_wait_ms = 500

[provision]
# Explicit interpreter (same as VOICETOTEX_PYTHON)
# python = "/usr/bin/python3"

# Pre-bundled Python runtime shipped with the app
# bundled_dir = "/usr/share/voicetotex/python"

# Where a user-scoped environment is bootstrapped on first run
# venv_dir = "~/.local/share/voicetotex/venv"

# Timeouts for the first-run bootstrap
venv_timeout_secs = 120
install_timeout_secs = 900

[transport]
host = "127.0.0.1"

# Reconnect delay doubles from base to max after each unexpected close
reconnect_base_ms = 500
reconnect_max_ms = 10000

# Keep-alive ping interval
heartbeat_interval_secs = 15
"#;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Optional path to state file for external integrations (e.g., Waybar)
    /// Example: "/run/user/1000/voicetotex/state" or use "auto" for default location
    #[serde(default)]
    pub state_file: Option<String>,

    /// Append backend stdout/stderr to this file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub provision: ProvisionConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

/// Worker process supervision settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Directory containing the backend script and dependency manifest
    #[serde(default)]
    pub backend_dir: Option<PathBuf>,

    /// Script passed to the interpreter, relative to backend_dir
    #[serde(default = "default_script")]
    pub script: String,

    /// Extra arguments appended after the script
    #[serde(default)]
    pub args: Vec<String>,

    /// Port passed to the backend via --port
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_step")]
    pub restart_step_ms: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// How long to wait after signalling a stale backend from a previous run
    #[serde(default = "default_stale_wait")]
    pub stale_wait_ms: u64,
}

/// Runtime discovery and bootstrap settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub python: Option<PathBuf>,

    #[serde(default)]
    pub bundled_dir: Option<PathBuf>,

    #[serde(default)]
    pub venv_dir: Option<PathBuf>,

    #[serde(default = "default_venv_timeout")]
    pub venv_timeout_secs: u64,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

/// Event channel settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
}

fn default_script() -> String {
    "server.py".to_string()
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_step() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    5000
}

fn default_stale_wait() -> u64 {
    500
}

fn default_venv_timeout() -> u64 {
    120
}

fn default_install_timeout() -> u64 {
    900 // pip pulls torch/CUDA wheels on first run
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_reconnect_base() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    10_000
}

fn default_heartbeat() -> u64 {
    15
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend_dir: None,
            script: default_script(),
            args: vec![],
            port: None,
            startup_timeout_secs: default_startup_timeout(),
            max_restarts: default_max_restarts(),
            restart_step_ms: default_restart_step(),
            shutdown_grace_ms: default_shutdown_grace(),
            stale_wait_ms: default_stale_wait(),
        }
    }
}

impl WorkerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn restart_step(&self) -> Duration {
        Duration::from_millis(self.restart_step_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn stale_wait(&self) -> Duration {
        Duration::from_millis(self.stale_wait_ms)
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            python: None,
            bundled_dir: None,
            venv_dir: None,
            venv_timeout_secs: default_venv_timeout(),
            install_timeout_secs: default_install_timeout(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
            heartbeat_interval_secs: default_heartbeat(),
        }
    }
}

impl TransportConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: Some("auto".to_string()),
            log_file: None,
            worker: WorkerConfig::default(),
            provision: ProvisionConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voicetotex")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the runtime directory for ephemeral files (state)
    pub fn runtime_dir() -> PathBuf {
        // Use XDG_RUNTIME_DIR if available, otherwise fall back to /tmp
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("voicetotex")
    }

    /// Get the data directory path (for the bootstrapped runtime)
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "voicetotex")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve the state file path from config
    /// Returns None if state_file is not configured or explicitly disabled
    pub fn resolve_state_file(&self) -> Option<PathBuf> {
        self.state_file.as_ref().and_then(|path| {
            match path.to_lowercase().as_str() {
                "disabled" | "none" | "off" | "false" => None,
                "auto" => Some(Self::runtime_dir().join("state")),
                _ => Some(PathBuf::from(path)),
            }
        })
    }

    /// Backend directory: configured value, else `backend/` next to the executable
    pub fn resolve_backend_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.worker.backend_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.join("backend")))
            .unwrap_or_else(|| PathBuf::from("backend"))
    }

    /// User-scoped runtime created by bootstrap
    pub fn resolve_venv_dir(&self) -> PathBuf {
        self.provision
            .venv_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("venv"))
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, HostError> {
    let mut config = Config::default();

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| HostError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| HostError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Apply VOICETOTEX_* overrides using the given variable lookup
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), HostError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup(BACKEND_DIR_ENV) {
        config.worker.backend_dir = Some(PathBuf::from(dir));
    }
    if let Some(port) = lookup(PORT_ENV) {
        let port = port
            .parse::<u16>()
            .map_err(|_| HostError::Config(format!("{} is not a valid port: {}", PORT_ENV, port)))?;
        config.worker.port = Some(port);
    }
    Ok(())
}
