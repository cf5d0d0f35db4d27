// src/config.rs
//
// Run configuration (YAML/JSON file) and process-level settings (environment
// variables).
//
// A RunConfig fully defines a reproducible recording:
// - root_seed: every random stream of the run is derived from it
// - env_id: registry key of the environment
// - episodes, max_steps_per_episode: run and episode horizons
// - policy: built-in policy spec (`random`, `sticky_dir`, `cycle:0,1`)
// - wrapper knobs: frameskip, repeat_action_probability
// - checksum_interval: full-state checksum every N steps
// - telemetry_interval_ms / telemetry_timeout_ms: collector cadence
//
// Process settings (not part of the recorded run):
// - ARCADE_REPLAY_RUNS_DIR: store root (default "runs")
// - ARCADE_REPLAY_FSYNC: "1" | "true" | "yes" forces fsync on every record
// - ARCADE_REPLAY_TELEMETRY_MODE: "off" disables the collector (default on)

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env::WrapperConfig;
use crate::policy::make_policy;
use crate::types::RunId;

pub const DEFAULT_RUNS_DIR: &str = "runs";

/// Immutable configuration of one recorded run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Explicit run id. Generated when absent.
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub root_seed: u64,
    pub env_id: String,
    pub episodes: u64,
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
    #[serde(default = "default_telemetry_timeout_ms")]
    pub telemetry_timeout_ms: u64,
    #[serde(default = "default_max_steps")]
    pub max_steps_per_episode: u64,
    #[serde(default = "default_frameskip")]
    pub frameskip: u32,
    #[serde(default)]
    pub repeat_action_probability: f64,
    #[serde(default = "default_checksum_interval")]
    pub checksum_interval: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_policy() -> String {
    "random".to_string()
}

fn default_telemetry_interval_ms() -> u64 {
    1000
}

fn default_telemetry_timeout_ms() -> u64 {
    500
}

fn default_max_steps() -> u64 {
    5000
}

fn default_frameskip() -> u32 {
    4
}

fn default_checksum_interval() -> u64 {
    100
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read run config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse run config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("run config validation error in '{field}': {message}")]
    Validation { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Validation {
            field,
            message: message.into(),
        }
    }
}

impl RunConfig {
    /// Minimal config with defaults for everything but the required fields.
    pub fn new(root_seed: u64, env_id: impl Into<String>, episodes: u64) -> Self {
        Self {
            run_id: None,
            root_seed,
            env_id: env_id.into(),
            episodes,
            policy: default_policy(),
            telemetry_interval_ms: default_telemetry_interval_ms(),
            telemetry_timeout_ms: default_telemetry_timeout_ms(),
            max_steps_per_episode: default_max_steps(),
            frameskip: default_frameskip(),
            repeat_action_probability: 0.0,
            checksum_interval: default_checksum_interval(),
            workers: default_workers(),
        }
    }

    /// Load a run config from a YAML (or JSON) file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate. JSON is accepted since it is valid YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.env_id.trim().is_empty() {
            return Err(ConfigError::invalid("env_id", "env_id cannot be empty"));
        }
        if self.episodes == 0 {
            return Err(ConfigError::invalid("episodes", "episodes must be >= 1"));
        }
        if self.max_steps_per_episode == 0 {
            return Err(ConfigError::invalid(
                "max_steps_per_episode",
                "max_steps_per_episode must be >= 1",
            ));
        }
        if self.frameskip == 0 {
            return Err(ConfigError::invalid("frameskip", "frameskip must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.repeat_action_probability) {
            return Err(ConfigError::invalid(
                "repeat_action_probability",
                format!("must be in [0, 1], got {}", self.repeat_action_probability),
            ));
        }
        if self.checksum_interval == 0 {
            return Err(ConfigError::invalid(
                "checksum_interval",
                "checksum_interval must be >= 1",
            ));
        }
        if self.telemetry_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "telemetry_interval_ms",
                "telemetry_interval_ms must be > 0",
            ));
        }
        if self.telemetry_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "telemetry_timeout_ms",
                "telemetry_timeout_ms must be > 0",
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "workers must be >= 1"));
        }
        make_policy(&self.policy).map_err(|e| ConfigError::invalid("policy", e.to_string()))?;
        Ok(())
    }

    /// The configured run id, or a freshly generated one.
    pub fn resolve_run_id(&self) -> RunId {
        self.run_id.clone().unwrap_or_else(RunId::generate)
    }

    /// Wrapper behaviour recorded with the run and reused by replay.
    pub fn wrapper_config(&self) -> WrapperConfig {
        WrapperConfig {
            frameskip: self.frameskip,
            repeat_action_probability: self.repeat_action_probability,
            max_steps_per_episode: Some(self.max_steps_per_episode),
        }
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub runs_dir: PathBuf,
    pub fsync_every_record: bool,
    pub telemetry_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from(DEFAULT_RUNS_DIR),
            fsync_every_record: false,
            telemetry_enabled: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let runs_dir = env::var("ARCADE_REPLAY_RUNS_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNS_DIR));

        let fsync_every_record = env::var("ARCADE_REPLAY_FSYNC")
            .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let telemetry_enabled = env::var("ARCADE_REPLAY_TELEMETRY_MODE")
            .map(|s| s.to_lowercase() != "off")
            .unwrap_or(true);

        Self {
            runs_dir,
            fsync_every_record,
            telemetry_enabled,
        }
    }
}
