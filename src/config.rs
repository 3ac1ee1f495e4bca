//! Configuration System using Figment
//!
//! Strongly-typed configuration for a multi reader host. Configuration is
//! loaded from:
//! 1. `config/multiread.toml` (base configuration)
//! 2. Environment variables prefixed with `DAQ_MULTIREAD_`, nested keys
//!    separated by a double underscore (`DAQ_MULTIREAD_READER__PERIOD_MS=250`)
//!
//! # Example
//! ```no_run
//! use daq_multiread::config::MultiReadConfig;
//!
//! let config = MultiReadConfig::load()?;
//! config.validate()?;
//! println!("{} sources, mode {:?}", config.reader.sources.len(), config.reader.mode);
//! # Ok::<(), daq_multiread::error::MultiReadError>(())
//! ```

use crate::error::{AppResult, MultiReadError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/multiread.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DAQ_MULTIREAD_";

/// How a coordinator sequences its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Every source refreshes on its own; no cycle semantics.
    Concurrent,
    /// Timer-paced cycles that restart automatically.
    #[default]
    Sequential,
    /// Cycles that only start on an explicit trigger.
    SequentialManual,
}

impl ReadMode {
    /// Sequential and SequentialManual share buffering and completion logic.
    pub fn is_sequential(self) -> bool {
        !matches!(self, ReadMode::Concurrent)
    }

    /// The mode actually in effect for a given period.
    ///
    /// A sequential reader without a positive period can't restart on its
    /// own, so it behaves as [`ReadMode::SequentialManual`].
    pub fn effective(self, period_ms: i64) -> ReadMode {
        match self {
            ReadMode::Sequential if period_ms <= 0 => ReadMode::SequentialManual,
            other => other,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MultiReadConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Coordinator settings
    #[serde(default)]
    pub reader: ReaderSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Read coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderSettings {
    /// Sequencing mode
    #[serde(default)]
    pub mode: ReadMode,
    /// Cycle period in milliseconds; `<= 0` requires manual triggering
    #[serde(default = "default_period")]
    pub period_ms: i64,
    /// Source names, in cycle order
    #[serde(default)]
    pub sources: Vec<String>,
    /// Shared execution-context identifier; generated when absent
    #[serde(default)]
    pub thread_token: Option<String>,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            mode: ReadMode::default(),
            period_ms: default_period(),
            sources: Vec::new(),
            thread_token: None,
        }
    }
}

fn default_name() -> String {
    "daq-multiread".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_period() -> i64 {
    1000
}

impl MultiReadConfig {
    /// Load configuration from `config/multiread.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Missing files are not an error: defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(MultiReadConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(MultiReadConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MultiReadError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut names = HashSet::new();
        for source in &self.reader.sources {
            if source.trim().is_empty() {
                return Err(MultiReadError::Configuration(
                    "Source names must not be empty".to_string(),
                ));
            }
            if !names.insert(source.as_str()) {
                return Err(MultiReadError::Configuration(format!(
                    "Duplicate source: {source}"
                )));
            }
        }

        if let Some(token) = &self.reader.thread_token {
            if token.trim().is_empty() {
                return Err(MultiReadError::Configuration(
                    "thread_token must not be blank".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Mode in effect once the period is taken into account
    pub fn effective_mode(&self) -> ReadMode {
        self.reader.mode.effective(self.reader.period_ms)
    }
}
