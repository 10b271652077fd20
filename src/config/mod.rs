//! Configuration loading for the Pulumi catalog service.
//!
//! Process settings come from layered `.env` files and environment variables
//! prefixed with `PULUMI_CATALOG_`, producing a typed [`AppConfig`]. Provider
//! definitions live in a separate hierarchical document read through
//! [`reader::ConfigReader`].

pub mod reader;
pub mod schedule;

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use reader::{ConfigReadError, ConfigReader};
pub use schedule::{ScheduleDefinition, read_schedule_definition};

const ENV_PREFIX: &str = "PULUMI_CATALOG_";

/// Application configuration derived from `PULUMI_CATALOG_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
}

/// Process-wide schedule used for providers that do not declare their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Default refresh frequency; when unset, every provider must declare a schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_frequency_seconds: Option<u64>,
    #[serde(default = "default_scheduler_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default)]
    pub default_initial_delay_seconds: u64,
}

/// Backoff applied by the task runner after a failed or timed-out cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicyConfig {
    /// Base retry interval in seconds (default: 5)
    ///
    /// Subsequent retries use exponential backoff: base_seconds * 2^(failures - 1).
    ///
    /// Environment variable: `PULUMI_CATALOG_RETRY_BASE_SECONDS`
    #[serde(default = "default_retry_base_seconds")]
    pub base_seconds: u64,

    /// Maximum retry interval in seconds (default: 900)
    ///
    /// Environment variable: `PULUMI_CATALOG_RETRY_MAX_SECONDS`
    #[serde(default = "default_retry_max_seconds")]
    pub max_seconds: u64,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    ///
    /// Environment variable: `PULUMI_CATALOG_RETRY_JITTER_FACTOR`
    #[serde(default = "default_retry_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            config_path: default_config_path(),
            http_timeout_ms: default_http_timeout_ms(),
            scheduler: SchedulerConfig::default(),
            retry_policy: RetryPolicyConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_frequency_seconds: None,
            default_timeout_seconds: default_scheduler_timeout_seconds(),
            default_initial_delay_seconds: 0,
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_retry_base_seconds(),
            max_seconds: default_retry_max_seconds(),
            jitter_factor: default_retry_jitter_factor(),
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(frequency) = self.default_frequency_seconds
            && frequency == 0
        {
            return Err(ConfigError::InvalidSchedulerFrequency { value: frequency });
        }

        if self.default_timeout_seconds == 0 {
            return Err(ConfigError::InvalidSchedulerTimeout {
                value: self.default_timeout_seconds,
            });
        }

        Ok(())
    }

    /// The process-wide default schedule, if a default frequency is configured.
    pub fn default_schedule(&self) -> Option<ScheduleDefinition> {
        self.default_frequency_seconds.map(|frequency| {
            let initial_delay = (self.default_initial_delay_seconds > 0)
                .then(|| Duration::from_secs(self.default_initial_delay_seconds));
            ScheduleDefinition {
                frequency: Duration::from_secs(frequency),
                timeout: Duration::from_secs(self.default_timeout_seconds),
                initial_delay,
            }
        })
    }
}

impl RetryPolicyConfig {
    /// Validate retry policy configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds == 0 {
            return Err(ConfigError::InvalidRetryBase {
                value: self.base_seconds,
            });
        }

        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Timeout applied to every outbound Pulumi API request.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Returns a pretty JSON representation. No secrets are held here; provider
    /// tokens live in the catalog document and are never serialized.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout_ms == 0 {
            return Err(ConfigError::InvalidHttpTimeout {
                value: self.http_timeout_ms,
            });
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.scheduler.validate()?;
        self.retry_policy.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_config_path() -> String {
    "app-config.json".to_string()
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_scheduler_timeout_seconds() -> u64 {
    180 // 3 minutes
}

fn default_retry_base_seconds() -> u64 {
    5
}

fn default_retry_max_seconds() -> u64 {
    900 // 15 minutes
}

fn default_retry_jitter_factor() -> f64 {
    0.1
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("http timeout must be positive, got {value}")]
    InvalidHttpTimeout { value: u64 },
    #[error("scheduler default frequency must be positive, got {value}")]
    InvalidSchedulerFrequency { value: u64 },
    #[error("scheduler default timeout must be positive, got {value}")]
    InvalidSchedulerTimeout { value: u64 },
    #[error("retry base seconds must be positive, got {value}")]
    InvalidRetryBase { value: u64 },
    #[error("retry base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRetryJitter { value: f64 },
}

/// Loads configuration using layered `.env` files and `PULUMI_CATALOG_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`, then the
    /// process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let config_path =
            take_string(&mut layered, "CONFIG_PATH").unwrap_or_else(default_config_path);
        let http_timeout_ms = take_parsed(&mut layered, "HTTP_TIMEOUT_MS", "milliseconds")?
            .unwrap_or_else(default_http_timeout_ms);

        let scheduler = SchedulerConfig {
            default_frequency_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_DEFAULT_FREQUENCY_SECONDS",
                "seconds",
            )?,
            default_timeout_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_DEFAULT_TIMEOUT_SECONDS",
                "seconds",
            )?
            .unwrap_or_else(default_scheduler_timeout_seconds),
            default_initial_delay_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_DEFAULT_INITIAL_DELAY_SECONDS",
                "seconds",
            )?
            .unwrap_or(0),
        };

        let retry_policy = RetryPolicyConfig {
            base_seconds: take_parsed(&mut layered, "RETRY_BASE_SECONDS", "seconds")?
                .unwrap_or_else(default_retry_base_seconds),
            max_seconds: take_parsed(&mut layered, "RETRY_MAX_SECONDS", "seconds")?
                .unwrap_or_else(default_retry_max_seconds),
            jitter_factor: take_parsed(&mut layered, "RETRY_JITTER_FACTOR", "a number")?
                .unwrap_or_else(default_retry_jitter_factor),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            config_path,
            http_timeout_ms,
            scheduler,
            retry_policy,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered.remove(key).filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
                expected,
            }),
        None => Ok(None),
    }
}
