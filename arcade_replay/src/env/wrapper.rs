// src/env/wrapper.rs
//
// Deterministic environment wrapper.
//
// Responsibilities:
// - reset(seeds): reseed the environment and the sticky-action stream
// - step(action): validate the action, apply sticky actions + frameskip,
//   enforce the per-episode step horizon
// - checksum(): content hash of the environment state plus wrapper state
//
// The wrapper exclusively owns one environment instance. It holds no shared
// state, so independent episodes run on independent wrappers.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Action, EnvError, Environment};
use crate::seed::EpisodeSeeds;
use crate::types::{ContentDigest, Observation};

const STATE_DOMAIN: &[u8] = b"arcade-replay/state/v1";

/// Wrapper behaviour shared by recording and replay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WrapperConfig {
    /// Number of emulator frames each action is repeated for.
    pub frameskip: u32,
    /// Probability of repeating the previous action instead of the chosen one
    /// on each frame ("sticky actions").
    pub repeat_action_probability: f64,
    /// Steps after which the episode is truncated.
    pub max_steps_per_episode: Option<u64>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            frameskip: 4,
            repeat_action_probability: 0.0,
            max_steps_per_episode: None,
        }
    }
}

/// Outcome of one wrapper step (possibly spanning several frames).
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observation: Observation,
    /// Reward summed over the skipped frames.
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    /// Action actually applied on the last frame (differs from the requested
    /// action when a sticky repeat fired).
    pub applied_action: Action,
}

impl StepOutcome {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Makes a wrapped environment deterministic under derived seeds.
pub struct DeterministicEnv<E> {
    env: E,
    config: WrapperConfig,
    action_space_n: u32,
    sticky_rng: ChaCha8Rng,
    prev_action: Action,
    steps: u64,
    last_obs_digest: Option<ContentDigest>,
    seeds: Option<EpisodeSeeds>,
    done: bool,
}

impl<E: Environment> DeterministicEnv<E> {
    pub fn new(env: E, config: WrapperConfig) -> Self {
        let action_space_n = env.action_space_n();
        Self {
            env,
            config,
            action_space_n,
            sticky_rng: ChaCha8Rng::seed_from_u64(0),
            prev_action: 0,
            steps: 0,
            last_obs_digest: None,
            seeds: None,
            done: false,
        }
    }

    /// Re-initialise all randomness from `seeds` and return the first observation.
    pub fn reset(&mut self, seeds: &EpisodeSeeds) -> Result<Observation, EnvError> {
        let obs = match self.env.reset(seeds.env) {
            Ok(obs) => obs,
            Err(e @ EnvError::EnvironmentInit { .. }) => return Err(e),
            Err(other) => {
                return Err(EnvError::EnvironmentInit {
                    env_id: self.env.env_id().to_string(),
                    reason: other.to_string(),
                })
            }
        };

        self.sticky_rng = ChaCha8Rng::seed_from_u64(seeds.sticky);
        self.prev_action = 0;
        self.steps = 0;
        self.done = false;
        self.seeds = Some(*seeds);
        self.last_obs_digest = Some(obs.digest());
        Ok(obs)
    }

    pub fn step(&mut self, action: Action) -> Result<StepOutcome, EnvError> {
        if self.seeds.is_none() {
            return Err(EnvError::NotReset);
        }
        if self.done {
            return Err(EnvError::EpisodeFinished);
        }
        if action >= self.action_space_n {
            return Err(EnvError::InvalidAction {
                action,
                action_space_n: self.action_space_n,
            });
        }

        let frames = self.config.frameskip.max(1);
        let sticky_p = self.config.repeat_action_probability;

        let mut reward = 0.0;
        let mut terminated = false;
        let mut truncated = false;
        let mut observation = None;
        let mut applied = action;

        for _ in 0..frames {
            applied = if sticky_p > 0.0 && self.sticky_rng.gen::<f64>() < sticky_p {
                self.prev_action
            } else {
                action
            };
            self.prev_action = applied;

            let frame = self.env.step(applied)?;
            reward += frame.reward;
            terminated |= frame.terminated;
            truncated |= frame.truncated;
            observation = Some(frame.observation);
            if terminated || truncated {
                break;
            }
        }

        self.steps += 1;
        if let Some(max_steps) = self.config.max_steps_per_episode {
            if !terminated && self.steps >= max_steps {
                truncated = true;
            }
        }
        self.done = terminated || truncated;

        // frames >= 1, so at least one frame ran.
        let observation =
            observation.ok_or_else(|| EnvError::Backend("no frame executed".into()))?;
        self.last_obs_digest = Some(observation.digest());

        Ok(StepOutcome {
            observation,
            reward,
            terminated,
            truncated,
            applied_action: applied,
        })
    }

    /// Content hash of the state needed to prove determinism.
    ///
    /// Uses the environment's own state checksum when available, otherwise
    /// the digest of the last observation. Wrapper state (step count, previous
    /// action, sticky stream position) is always included.
    pub fn checksum(&self) -> ContentDigest {
        let mut hasher = Sha256::new();
        hasher.update(STATE_DOMAIN);
        match self.env.state_checksum() {
            Some(env_digest) => {
                hasher.update([1u8]);
                hasher.update(env_digest.as_bytes());
            }
            None => {
                hasher.update([0u8]);
                if let Some(d) = &self.last_obs_digest {
                    hasher.update(d.as_bytes());
                }
            }
        }
        hasher.update(self.steps.to_le_bytes());
        hasher.update(self.prev_action.to_le_bytes());
        hasher.update(self.sticky_rng.get_word_pos().to_le_bytes());
        hasher.update([self.done as u8]);
        ContentDigest::from_bytes(hasher.finalize().into())
    }

    pub fn action_space_n(&self) -> u32 {
        self.action_space_n
    }

    pub fn action_meanings(&self) -> Vec<String> {
        self.env.action_meanings()
    }

    pub fn env_id(&self) -> &str {
        self.env.env_id()
    }

    /// Steps taken since the last reset.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    pub fn into_inner(self) -> E {
        self.env
    }
}
