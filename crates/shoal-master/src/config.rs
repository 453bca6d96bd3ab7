//! Master configuration.
//!
//! Resolution order, later wins: defaults, the TOML file given with
//! `--config`, `SHOAL_*` environment variables, command-line flags.
//!
//! ```toml
//! signals = true
//!
//! [worker]
//! exec = "/usr/local/bin/app"
//! args = ["--port", "8080"]
//! size = 4
//! silent = false
//!
//! [worker.env]
//! APP_ENV = "production"
//!
//! [timing]
//! min_restart_age_ms = 2000
//! delay_before_kill_ms = 2000
//! delay_before_restart_when_min_restart_age_ms = 2000
//! delay_between_shutdown_and_disconnect_ms = 500
//! delay_for_restart_checking_ms = 2000
//!
//! [console]
//! enabled = true
//! path = "shoal-master.sock"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use shoal_supervisor::SupervisorConfig;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_true")]
    pub signals: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    pub exec: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Defaults to the host CPU count.
    pub size: Option<usize>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_delay_ms")]
    pub min_restart_age_ms: u64,
    #[serde(default = "default_delay_ms")]
    pub delay_before_kill_ms: u64,
    #[serde(default = "default_delay_ms")]
    pub delay_before_restart_when_min_restart_age_ms: u64,
    /// Zero or absent disables the shutdown notice.
    pub delay_between_shutdown_and_disconnect_ms: Option<u64>,
    #[serde(default = "default_delay_ms")]
    pub delay_for_restart_checking_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_restart_age_ms: default_delay_ms(),
            delay_before_kill_ms: default_delay_ms(),
            delay_before_restart_when_min_restart_age_ms: default_delay_ms(),
            delay_between_shutdown_and_disconnect_ms: None,
            delay_for_restart_checking_ms: default_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_console_path")]
    pub path: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_console_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Values that replace whatever the file says.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub exec: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub size: Option<usize>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub console: Option<bool>,
    pub console_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Layer `later` on top of `self`.
    pub fn merge(self, later: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            exec: later.exec.or(self.exec),
            args: later.args.or(self.args),
            size: later.size.or(self.size),
            log_level: later.log_level.or(self.log_level),
            log_format: later.log_format.or(self.log_format),
            console: later.console.or(self.console),
            console_path: later.console_path.or(self.console_path),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_delay_ms() -> u64 {
    2000
}

fn default_console_path() -> PathBuf {
    PathBuf::from("shoal-master.sock")
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// `SHOAL_CONSOLE` values that switch the console off.
const CONSOLE_OFF: &[&str] = &["off", "false", "0", "none"];

impl MasterConfig {
    /// Load from an optional file, then apply `SHOAL_*` variables and the
    /// command-line `overrides`.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let overrides = config_overrides_from_env()?.merge(overrides);
        match path {
            Some(path) => load_config_from_with_overrides(path, overrides),
            None => load_config_from_str_with_overrides("", overrides),
        }
    }

    /// Supervisor settings derived from this configuration.
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(self.worker.exec.clone().unwrap_or_default())
            .with_args(self.worker.args.iter().cloned())
            .with_signals(self.signals);
        if let Some(size) = self.worker.size {
            config.size = size;
        }
        config.env = self.worker.env.clone();
        config.silent = self.worker.silent;
        config.min_restart_age = Duration::from_millis(self.timing.min_restart_age_ms);
        config.delay_before_kill = Duration::from_millis(self.timing.delay_before_kill_ms);
        config.delay_before_restart_when_min_restart_age =
            Duration::from_millis(self.timing.delay_before_restart_when_min_restart_age_ms);
        config.delay_between_shutdown_and_disconnect = self
            .timing
            .delay_between_shutdown_and_disconnect_ms
            .map(Duration::from_millis);
        config.delay_for_restart_checking =
            Duration::from_millis(self.timing.delay_for_restart_checking_ms);
        config
    }

    /// Log the resolved configuration.
    pub fn log_config(&self) {
        info!(
            exec = %self.worker.exec.as_deref().unwrap_or(Path::new("")).display(),
            args = ?self.worker.args,
            size = ?self.worker.size,
            env_overrides = self.worker.env.len(),
            silent = self.worker.silent,
            "Worker configuration"
        );
        info!(
            min_restart_age_ms = self.timing.min_restart_age_ms,
            delay_before_kill_ms = self.timing.delay_before_kill_ms,
            delay_before_restart_when_min_restart_age_ms =
                self.timing.delay_before_restart_when_min_restart_age_ms,
            delay_between_shutdown_and_disconnect_ms =
                ?self.timing.delay_between_shutdown_and_disconnect_ms,
            delay_for_restart_checking_ms = self.timing.delay_for_restart_checking_ms,
            "Timing configuration"
        );
        if self.console.enabled {
            info!(path = %self.console.path.display(), "Console enabled");
        } else {
            info!("Console disabled");
        }
        info!(
            signals = self.signals,
            log_level = %self.logging.level,
            log_format = %self.logging.format,
            "Master configuration"
        );
    }
}

fn config_overrides_from_env() -> Result<ConfigOverrides, ConfigError> {
    overrides_from_vars(|key| std::env::var(key).ok())
}

fn overrides_from_vars(
    var: impl Fn(&str) -> Option<String>,
) -> Result<ConfigOverrides, ConfigError> {
    let size = match var("SHOAL_SIZE") {
        Some(raw) => Some(raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: "SHOAL_SIZE".to_string(),
            message: format!("expected a worker count, got {raw:?}"),
        })?),
        None => None,
    };

    let (console, console_path) = match var("SHOAL_CONSOLE") {
        Some(raw) if CONSOLE_OFF.contains(&raw.to_ascii_lowercase().as_str()) => {
            (Some(false), None)
        }
        Some(raw) => (Some(true), Some(PathBuf::from(raw))),
        None => (None, None),
    };

    Ok(ConfigOverrides {
        exec: var("SHOAL_EXEC").map(PathBuf::from),
        size,
        log_level: var("SHOAL_LOG_LEVEL"),
        console,
        console_path,
        ..ConfigOverrides::default()
    })
}

fn apply_overrides(config: &mut MasterConfig, overrides: ConfigOverrides) {
    if let Some(exec) = overrides.exec {
        config.worker.exec = Some(exec);
    }
    if let Some(args) = overrides.args {
        config.worker.args = args;
    }
    if let Some(size) = overrides.size {
        config.worker.size = Some(size);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    if let Some(format) = overrides.log_format {
        config.logging.format = format;
    }
    if let Some(enabled) = overrides.console {
        config.console.enabled = enabled;
    }
    if let Some(path) = overrides.console_path {
        config.console.path = path;
    }
}

fn validate(config: &MasterConfig) -> Result<(), ConfigError> {
    let exec_missing = config
        .worker
        .exec
        .as_ref()
        .map_or(true, |exec| exec.as_os_str().is_empty());
    if exec_missing {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["worker.exec".to_string()],
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.console.enabled && config.console.path.as_os_str().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "console.path".to_string(),
            message: "must not be empty while the console is enabled".to_string(),
        });
    }

    if let Some(name) = config
        .worker
        .env
        .keys()
        .find(|k| k.is_empty() || k.contains('='))
    {
        return Err(ConfigError::InvalidValue {
            field: format!("worker.env.{name}"),
            message: "variable names must be non-empty and must not contain '='".to_string(),
        });
    }

    Ok(())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<MasterConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<MasterConfig, ConfigError> {
    let mut config: MasterConfig = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}
