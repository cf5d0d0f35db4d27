// src/env/registry.rs
//
// Environment registry: stable keys -> environment specs and constructors.
//
// Recording and replay both build environments through an EnvFactory, so a
// replay always gets a fresh instance of exactly the environment the run
// recorded with.

use serde::{Deserialize, Serialize};

use super::gridchase::GridChase;
use super::{EnvError, Environment};

/// Observation flavour exposed by an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObsType {
    /// Rendered frame.
    Pixels,
    /// RAM / internal state bytes.
    State,
}

impl ObsType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObsType::Pixels => "pixels",
            ObsType::State => "state",
        }
    }
}

/// A registered environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSpec {
    pub key: &'static str,
    pub env_id: &'static str,
    pub obs_type: ObsType,
    pub description: &'static str,
}

const ENV_SPECS: &[EnvSpec] = &[
    EnvSpec {
        key: "gridchase",
        env_id: "GridChase-v0",
        obs_type: ObsType::Pixels,
        description: "Maze chase (pixels)",
    },
    EnvSpec {
        key: "gridchase-ram",
        env_id: "GridChase-ram-v0",
        obs_type: ObsType::State,
        description: "Maze chase (RAM/state)",
    },
];

pub fn list_envs() -> &'static [EnvSpec] {
    ENV_SPECS
}

pub fn get_env_spec(key: &str) -> Result<&'static EnvSpec, EnvError> {
    ENV_SPECS
        .iter()
        .find(|spec| spec.key == key)
        .ok_or_else(|| {
            let mut keys: Vec<&str> = ENV_SPECS.iter().map(|s| s.key).collect();
            keys.sort_unstable();
            EnvError::UnknownEnvironment {
                key: key.to_string(),
                valid: keys.join(", "),
            }
        })
}

/// Build a fresh built-in environment for `key`.
pub fn make_env(key: &str) -> Result<Box<dyn Environment>, EnvError> {
    let spec = get_env_spec(key)?;
    Ok(Box::new(GridChase::new(spec.obs_type)))
}

/// Constructs a fresh environment instance per episode.
pub trait EnvFactory: Send + Sync {
    fn make(&self, env_key: &str) -> Result<Box<dyn Environment>, EnvError>;
}

impl<F> EnvFactory for F
where
    F: Fn(&str) -> Result<Box<dyn Environment>, EnvError> + Send + Sync,
{
    fn make(&self, env_key: &str) -> Result<Box<dyn Environment>, EnvError> {
        self(env_key)
    }
}

/// Factory over the built-in registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEnvs;

impl EnvFactory for BuiltinEnvs {
    fn make(&self, env_key: &str) -> Result<Box<dyn Environment>, EnvError> {
        make_env(env_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_lists_valid_keys() {
        let err = get_env_spec("pacman").unwrap_err();
        match err {
            EnvError::UnknownEnvironment { key, valid } => {
                assert_eq!(key, "pacman");
                assert_eq!(valid, "gridchase, gridchase-ram");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn builtin_factory_builds_matching_env() {
        let env = BuiltinEnvs.make("gridchase-ram").unwrap();
        assert_eq!(env.env_id(), "GridChase-ram-v0");
        assert_eq!(env.action_space_n(), 5);
    }
}
