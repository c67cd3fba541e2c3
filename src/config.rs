use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::analytic::{ProviderConfig, DEFAULT_WINDOW_END, DEFAULT_WINDOW_START};
use crate::ephemeris::JulianDayWindow;
use crate::{HouseSystem, JulianDay};

/// Engine settings, read from `NATAL_*` environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Deployment environment, used as a metrics label (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub log_json: bool,

    /// Address for the chart read endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory holding one JSON chart per owner
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Optional orbital element table overriding the built-in one
    #[serde(default)]
    pub ephemeris_elements_path: Option<PathBuf>,

    #[serde(default = "default_window_start")]
    pub ephemeris_window_start: JulianDay,

    #[serde(default = "default_window_end")]
    pub ephemeris_window_end: JulianDay,

    /// House system used when an event does not name one
    #[serde(default)]
    pub default_house_system: HouseSystem,

    #[serde(default = "default_canary_name")]
    pub canary_name: String,

    /// Seconds between canary runs while serving; 0 disables them
    #[serde(default = "default_canary_interval_secs")]
    pub canary_interval_secs: u64,

    /// Textfile-collector path the one-shot canary writes its metrics to
    #[serde(default)]
    pub metrics_textfile: Option<PathBuf>,

    /// Upper bound on one chart computation, in seconds
    #[serde(default = "default_compute_deadline_secs")]
    pub compute_deadline_secs: u64,
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/charts")
}

fn default_window_start() -> JulianDay {
    DEFAULT_WINDOW_START
}

fn default_window_end() -> JulianDay {
    DEFAULT_WINDOW_END
}

fn default_canary_name() -> String {
    "reference-1879".to_string()
}

fn default_canary_interval_secs() -> u64 {
    300
}

fn default_compute_deadline_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            bind_addr: default_bind_addr(),
            store_path: default_store_path(),
            ephemeris_elements_path: None,
            ephemeris_window_start: default_window_start(),
            ephemeris_window_end: default_window_end(),
            default_house_system: HouseSystem::default(),
            canary_name: default_canary_name(),
            canary_interval_secs: default_canary_interval_secs(),
            metrics_textfile: None,
            compute_deadline_secs: default_compute_deadline_secs(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("NATAL"))
            .build()?
            .try_deserialize()
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            elements_path: self.ephemeris_elements_path.clone(),
            window: JulianDayWindow::new(self.ephemeris_window_start, self.ephemeris_window_end),
        }
    }
}
