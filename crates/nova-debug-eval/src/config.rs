use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::Layer as _;

/// Top-level settings for the debugger evaluation core.
///
/// Every section is optional in TOML; missing keys fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugEvalConfig {
    pub manager: ManagerConfig,
    pub cross_thread: CrossThreadConfig,
    pub batch: BatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// OS thread name of the command queue thread.
    pub thread_name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            thread_name: "nova-debugger-manager".to_owned(),
        }
    }
}

/// What happens to a queued command whose waiting caller gave up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelPolicy {
    /// The command still runs; its result is discarded.
    #[default]
    LetFinish,
    /// The command is skipped if the caller cancelled before it was dequeued.
    SkipIfNotStarted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossThreadConfig {
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub cancel_policy: CancelPolicy,
}

impl Default for CrossThreadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            max_polls: 200,
            cancel_policy: CancelPolicy::LetFinish,
        }
    }
}

impl CrossThreadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on how long a caller waits for a cross-thread call.
    ///
    /// Saturates at [`Duration::MAX`].
    pub fn total_wait(&self) -> Duration {
        self.poll_interval()
            .checked_mul(self.max_polls)
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Fully qualified name of the target-side rendering helper.
    pub helper_class: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            helper_class: "nova.rt.debugger.BatchEvaluatorServer".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    pub level: String,
    /// Emit logs in JSON format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn normalized_level(&self) -> String {
        let trimmed = self.level.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => "info".to_owned(),
            "warning" => "warn".to_owned(),
            level @ ("trace" | "debug" | "info" | "warn" | "error") => level.to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    /// The effective filter: the configured level with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let config_directives = self.normalized_level();
        let fallback = || {
            tracing_subscriber::EnvFilter::try_new(&config_directives).unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::default()
                    .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
            })
        };

        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                tracing_subscriber::EnvFilter::try_new(format!("{config_directives},{env_directives}"))
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(&env_directives))
                    .unwrap_or_else(|_| fallback())
            }
            None => fallback(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Toml(err.message().to_owned())
    }
}

impl DebugEvalConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cross_thread.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "cross_thread.poll_interval_ms",
                message: "must be at least 1".to_owned(),
            });
        }
        if self.cross_thread.max_polls == 0 {
            return Err(ConfigError::Invalid {
                key: "cross_thread.max_polls",
                message: "must be at least 1".to_owned(),
            });
        }
        if self.batch.helper_class.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "batch.helper_class",
                message: "must not be empty".to_owned(),
            });
        }
        if self.manager.thread_name.contains('\0') {
            return Err(ConfigError::Invalid {
                key: "manager.thread_name",
                message: "must not contain NUL bytes".to_owned(),
            });
        }
        Ok(())
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs a global `tracing` subscriber for the debugger.
///
/// Safe to call more than once; only the first call has an effect. If another
/// subscriber is already installed, this is a no-op.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();
        let layer = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        };
        let _ = tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init();
    });
}
