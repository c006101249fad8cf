use serde::Serialize;
use std::time::Duration;

/// Resolved wrapper settings. Every field can be overridden from the
/// command line or the matching `MCWRAP_*` environment variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WrapperConfig {
    pub shutdown: ShutdownConfig,
    pub notify: NotifyConfig,
}

/// Settings consumed by the shutdown escalator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownConfig {
    /// Console command written to the child on the first stage.
    pub command: String,
    /// Seconds to wait after the console command before sending SIGTERM.
    pub wait_secs: u64,
    /// Seconds to wait after SIGTERM before sending SIGKILL.
    pub term_wait_secs: u64,
}

/// Settings consumed by the notification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyConfig {
    /// Command template; the first `%d` receives the countdown in seconds.
    pub command: String,
    /// Countdown before the first shutdown stage begins.
    pub wait_secs: u64,
}

/// Values supplied on the command line or through the environment.
/// `None` means "keep the default".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub shutdown_cmd: Option<String>,
    pub shutdown_wait: Option<u64>,
    pub term_wait: Option<u64>,
    pub notify_cmd: Option<String>,
    pub notify_wait: Option<u64>,
}

/// Errors produced while validating the resolved configuration.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A console command resolved to an empty string.
    EmptyCommand { option: &'static str },
    /// A console command contains a line break and would be split in two.
    MultilineCommand { option: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EmptyCommand { option } => {
                write!(f, "{option} must not be empty")
            }
            ConfigError::MultilineCommand { option } => {
                write!(f, "{option} must be a single line")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl WrapperConfig {
    /// Apply overrides on top of the defaults and validate the result.
    ///
    /// The terminate wait falls back to the resolved graceful-stop wait, so
    /// overriding only `shutdown_wait` moves both stages.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let shutdown_wait = overrides
            .shutdown_wait
            .unwrap_or(defaults.shutdown.wait_secs);
        let shutdown = ShutdownConfig {
            command: overrides
                .shutdown_cmd
                .unwrap_or(defaults.shutdown.command),
            wait_secs: shutdown_wait,
            term_wait_secs: overrides.term_wait.unwrap_or(shutdown_wait),
        };
        let notify = NotifyConfig {
            command: overrides.notify_cmd.unwrap_or(defaults.notify.command),
            wait_secs: overrides.notify_wait.unwrap_or(defaults.notify.wait_secs),
        };

        validate_command("shutdown command", &shutdown.command)?;
        validate_command("notify command", &notify.command)?;

        Ok(Self { shutdown, notify })
    }
}

impl ShutdownConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn term_wait(&self) -> Duration {
        Duration::from_secs(self.term_wait_secs)
    }
}

impl NotifyConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

fn validate_command(option: &'static str, command: &str) -> Result<(), ConfigError> {
    if command.trim().is_empty() {
        return Err(ConfigError::EmptyCommand { option });
    }
    if command.contains(['\n', '\r']) {
        return Err(ConfigError::MultilineCommand { option });
    }
    Ok(())
}

// --- Default implementations ---

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            command: "stop".to_string(),
            wait_secs: 30,
            term_wait_secs: 30,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: "notify_shutdown %d".to_string(),
            wait_secs: 30,
        }
    }
}
