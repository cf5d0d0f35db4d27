// src/policy.rs
//
// Policy capability consumed by the run loop, plus built-in policies.
//
// Policies may be stochastic, but every random draw comes from the seed given
// to `reset` (derived per episode by the SeedManager), so a run is fully
// reproducible from its root seed.
//
// Built-ins:
// - random:     uniform over the action space
// - sticky_dir: keep a direction, rotate when no reward for a while, jitter
// - cycle:      fixed repeating action sequence (`cycle:0,1,2`), default 0,1

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::env::Action;
use crate::types::Observation;

/// Action-selection capability.
pub trait Policy: Send {
    fn name(&self) -> &str;

    /// Prepare for a new episode. Must reseed all internal randomness.
    fn reset(&mut self, seed: u64, action_space_n: u32, action_meanings: &[String]);

    /// Choose the action for step `step` given the latest observation and the
    /// reward received for the previous step.
    fn select_action(&mut self, step: u64, observation: &Observation, last_reward: f64) -> Action;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown policy '{name}'. Valid: {valid}")]
    UnknownPolicy { name: String, valid: String },
    #[error("invalid policy spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
}

/// Uniformly random actions.
#[derive(Debug, Clone)]
pub struct RandomPolicy {
    rng: ChaCha8Rng,
    n: u32,
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(0),
            n: 1,
        }
    }
}

impl Policy for RandomPolicy {
    fn name(&self) -> &str {
        "random"
    }

    fn reset(&mut self, seed: u64, action_space_n: u32, _action_meanings: &[String]) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.n = action_space_n.max(1);
    }

    fn select_action(&mut self, _step: u64, _observation: &Observation, _last_reward: f64) -> Action {
        self.rng.gen_range(0..self.n)
    }
}

/// Scripted directional policy that is more structured than random:
///
/// - prefer a directional action (UP/RIGHT/DOWN/LEFT) when the environment
///   names them, otherwise the first four actions
/// - keep the current direction
/// - rotate after `stuck_window` steps without positive reward
/// - occasionally jump to a random direction (`jitter_prob`)
#[derive(Debug, Clone)]
pub struct StickyDirectionalPolicy {
    pub stuck_window: u32,
    pub jitter_prob: f64,
    rng: ChaCha8Rng,
    dir_actions: Vec<Action>,
    cur_idx: usize,
    since_progress: u32,
}

impl Default for StickyDirectionalPolicy {
    fn default() -> Self {
        Self {
            stuck_window: 30,
            jitter_prob: 0.02,
            rng: ChaCha8Rng::seed_from_u64(0),
            dir_actions: vec![0],
            cur_idx: 0,
            since_progress: 0,
        }
    }
}

impl StickyDirectionalPolicy {
    fn current(&self) -> Action {
        self.dir_actions[self.cur_idx]
    }
}

impl Policy for StickyDirectionalPolicy {
    fn name(&self) -> &str {
        "sticky_dir"
    }

    fn reset(&mut self, seed: u64, action_space_n: u32, action_meanings: &[String]) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.dir_actions = ["UP", "RIGHT", "DOWN", "LEFT"]
            .iter()
            .filter_map(|dir| {
                action_meanings
                    .iter()
                    .position(|m| m == dir)
                    .map(|i| i as Action)
            })
            .collect();
        if self.dir_actions.is_empty() {
            self.dir_actions = (0..action_space_n.clamp(1, 4)).collect();
        }
        self.cur_idx = 0;
        self.since_progress = 0;
    }

    fn select_action(&mut self, _step: u64, _observation: &Observation, last_reward: f64) -> Action {
        if last_reward > 0.0 {
            self.since_progress = 0;
        } else {
            self.since_progress += 1;
        }

        if self.rng.gen::<f64>() < self.jitter_prob {
            self.cur_idx = self.rng.gen_range(0..self.dir_actions.len());
            self.since_progress = 0;
            return self.current();
        }

        if self.since_progress >= self.stuck_window {
            self.cur_idx = (self.cur_idx + 1) % self.dir_actions.len();
            self.since_progress = 0;
        }

        self.current()
    }
}

/// Repeats a fixed action sequence: `sequence[step % len]`.
///
/// Actions are not clamped to the action space; an out-of-range entry
/// surfaces as an invalid-action failure of the episode.
#[derive(Debug, Clone)]
pub struct CyclicPolicy {
    sequence: Vec<Action>,
}

impl CyclicPolicy {
    pub fn new(sequence: Vec<Action>) -> Self {
        let sequence = if sequence.is_empty() { vec![0] } else { sequence };
        Self { sequence }
    }

    pub fn sequence(&self) -> &[Action] {
        &self.sequence
    }
}

impl Default for CyclicPolicy {
    fn default() -> Self {
        Self::new(vec![0, 1])
    }
}

impl Policy for CyclicPolicy {
    fn name(&self) -> &str {
        "cycle"
    }

    fn reset(&mut self, _seed: u64, _action_space_n: u32, _action_meanings: &[String]) {}

    fn select_action(&mut self, step: u64, _observation: &Observation, _last_reward: f64) -> Action {
        self.sequence[(step % self.sequence.len() as u64) as usize]
    }
}

const POLICY_NAMES: [&str; 3] = ["cycle", "random", "sticky_dir"];

pub fn list_policies() -> &'static [&'static str] {
    &POLICY_NAMES
}

/// Build a fresh policy from a spec string (`random`, `sticky_dir`, `cycle`,
/// or `cycle:<a>,<b>,...`).
pub fn make_policy(spec: &str) -> Result<Box<dyn Policy>, PolicyError> {
    let (name, args) = match spec.split_once(':') {
        Some((name, args)) => (name.trim(), Some(args)),
        None => (spec.trim(), None),
    };

    match (name, args) {
        ("random", None) => Ok(Box::<RandomPolicy>::default()),
        ("sticky_dir", None) => Ok(Box::<StickyDirectionalPolicy>::default()),
        ("cycle", None) => Ok(Box::<CyclicPolicy>::default()),
        ("cycle", Some(args)) => {
            let sequence = args
                .split(',')
                .map(|a| a.trim().parse::<Action>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| PolicyError::InvalidSpec {
                    spec: spec.to_string(),
                    reason: e.to_string(),
                })?;
            if sequence.is_empty() {
                return Err(PolicyError::InvalidSpec {
                    spec: spec.to_string(),
                    reason: "empty action sequence".to_string(),
                });
            }
            Ok(Box::new(CyclicPolicy::new(sequence)))
        }
        (known, Some(_)) if POLICY_NAMES.contains(&known) => Err(PolicyError::InvalidSpec {
            spec: spec.to_string(),
            reason: format!("policy '{known}' takes no arguments"),
        }),
        _ => Err(PolicyError::UnknownPolicy {
            name: name.to_string(),
            valid: POLICY_NAMES.join(", "),
        }),
    }
}
