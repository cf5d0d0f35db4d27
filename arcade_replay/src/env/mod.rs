// src/env/mod.rs
//
// Environment capability consumed by the recorder and the replay engine.
//
// Key components:
// - Environment: minimal Gym-style trait (reset(seed), step(action), optional
//   state checksum) so emulators can be swapped without touching recorder or
//   replay logic
// - DeterministicEnv: wrapper that routes all randomness through derived seeds
// - GridChase: built-in deterministic reference environment
// - registry: environment keys and the EnvFactory seam

pub mod gridchase;
pub mod registry;
pub mod wrapper;

use crate::types::{ContentDigest, Observation};

pub use gridchase::GridChase;
pub use registry::{get_env_spec, list_envs, make_env, BuiltinEnvs, EnvFactory, EnvSpec, ObsType};
pub use wrapper::{DeterministicEnv, StepOutcome, WrapperConfig};

/// Discrete action index.
pub type Action = u32;

/// Result of a single underlying environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvStep {
    pub observation: Observation,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
}

/// Errors raised by environments and the deterministic wrapper.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvError {
    #[error("environment '{env_id}' could not be initialised: {reason}")]
    EnvironmentInit { env_id: String, reason: String },
    #[error("action {action} is outside the action space (n={action_space_n})")]
    InvalidAction { action: Action, action_space_n: u32 },
    #[error("unknown environment '{key}'. Valid: {valid}")]
    UnknownEnvironment { key: String, valid: String },
    #[error("step called before reset")]
    NotReset,
    #[error("step called after the episode finished")]
    EpisodeFinished,
    #[error("environment failure: {0}")]
    Backend(String),
}

/// A (possibly nondeterministic) external environment.
///
/// Implementations must draw all internal randomness from the seed passed to
/// `reset`; the wrapper never touches process-global RNG state.
pub trait Environment: Send {
    /// Stable identifier, e.g. `GridChase-v0` or `ALE/Pacman-v5`.
    fn env_id(&self) -> &str;

    /// Size of the discrete action space.
    fn action_space_n(&self) -> u32;

    /// Human-readable action names (`UP`, `LEFT`, ...).
    fn action_meanings(&self) -> Vec<String> {
        (0..self.action_space_n()).map(|i| i.to_string()).collect()
    }

    fn reset(&mut self, seed: u64) -> Result<Observation, EnvError>;

    fn step(&mut self, action: Action) -> Result<EnvStep, EnvError>;

    /// Digest of the minimal internal state (RAM, registers, RNG position).
    /// Environments that cannot expose their state return `None`.
    fn state_checksum(&self) -> Option<ContentDigest> {
        None
    }
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn env_id(&self) -> &str {
        (**self).env_id()
    }

    fn action_space_n(&self) -> u32 {
        (**self).action_space_n()
    }

    fn action_meanings(&self) -> Vec<String> {
        (**self).action_meanings()
    }

    fn reset(&mut self, seed: u64) -> Result<Observation, EnvError> {
        (**self).reset(seed)
    }

    fn step(&mut self, action: Action) -> Result<EnvStep, EnvError> {
        (**self).step(action)
    }

    fn state_checksum(&self) -> Option<ContentDigest> {
        (**self).state_checksum()
    }
}
