// tests/common/mod.rs
//
// Shared fixtures for integration tests:
// - CounterEnv: deterministic LCG environment with fractional rewards and an
//   optional termination horizon
// - DriftEnv: identical to CounterEnv in observations and rewards, but hidden
//   state drifts from a given step on instances after the first
// - NondetEnv: rewards depend on a process-global counter, so no two
//   instances agree
// - store helpers and a trajectory corruption helper

#![allow(dead_code)]

use std::fs;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arcade_replay::config::RunConfig;
use arcade_replay::env::{Action, EnvError, EnvStep, Environment};
use arcade_replay::store::TelemetryStore;
use arcade_replay::types::{ContentDigest, EpisodeId, Observation, RunId};
use tempfile::TempDir;

pub const COUNTER_ACTIONS: u32 = 4;

fn lcg(state: u64, action: Action) -> u64 {
    state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(u64::from(action) * 2 + 1442695040888963407)
}

fn reward_of(state: u64) -> f64 {
    (state >> 44) as f64 / 1024.0
}

fn obs_of(state: u64) -> Observation {
    Observation::new(vec![8], state.to_le_bytes().to_vec())
}

/// Deterministic environment: state follows an LCG of (state, action).
pub struct CounterEnv {
    state: u64,
    t: u64,
    horizon: Option<u64>,
    fail_at: Option<u64>,
    infinite_at: Option<u64>,
    steps_taken: Arc<AtomicU64>,
}

impl CounterEnv {
    pub fn new(horizon: Option<u64>) -> Self {
        Self {
            state: 0,
            t: 0,
            horizon,
            fail_at: None,
            infinite_at: None,
            steps_taken: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fail with a backend error on frame `t`.
    pub fn failing_at(mut self, t: u64) -> Self {
        self.fail_at = Some(t);
        self
    }

    /// Return an infinite reward on frame `t`.
    pub fn infinite_reward_at(mut self, t: u64) -> Self {
        self.infinite_at = Some(t);
        self
    }

    /// Count every underlying frame into `counter`.
    pub fn with_step_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.steps_taken = counter;
        self
    }
}

impl Environment for CounterEnv {
    fn env_id(&self) -> &str {
        "Counter-v0"
    }

    fn action_space_n(&self) -> u32 {
        COUNTER_ACTIONS
    }

    fn reset(&mut self, seed: u64) -> Result<Observation, EnvError> {
        self.state = seed;
        self.t = 0;
        Ok(obs_of(self.state))
    }

    fn step(&mut self, action: Action) -> Result<EnvStep, EnvError> {
        self.steps_taken.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(self.t) {
            return Err(EnvError::Backend("emulator fault".to_string()));
        }
        let infinite = self.infinite_at == Some(self.t);
        self.state = lcg(self.state, action);
        self.t += 1;
        Ok(EnvStep {
            observation: obs_of(self.state),
            reward: if infinite { f64::INFINITY } else { reward_of(self.state) },
            terminated: self.horizon.is_some_and(|h| self.t >= h),
            truncated: false,
        })
    }

    fn state_checksum(&self) -> Option<ContentDigest> {
        let mut bytes = self.state.to_le_bytes().to_vec();
        bytes.extend_from_slice(&self.t.to_le_bytes());
        Some(ContentDigest::of(&bytes))
    }
}

/// Same observable behaviour as CounterEnv; a hidden counter diverges from
/// `drift_from` on when `drifting` is set.
pub struct DriftEnv {
    inner: CounterEnv,
    hidden: u64,
    drift_from: u64,
    drifting: bool,
}

impl Environment for DriftEnv {
    fn env_id(&self) -> &str {
        "Drift-v0"
    }

    fn action_space_n(&self) -> u32 {
        COUNTER_ACTIONS
    }

    fn reset(&mut self, seed: u64) -> Result<Observation, EnvError> {
        self.hidden = 0;
        self.inner.reset(seed)
    }

    fn step(&mut self, action: Action) -> Result<EnvStep, EnvError> {
        if self.drifting && self.inner.t >= self.drift_from {
            self.hidden += 1;
        }
        self.inner.step(action)
    }

    fn state_checksum(&self) -> Option<ContentDigest> {
        let mut bytes = self.inner.state.to_le_bytes().to_vec();
        bytes.extend_from_slice(&self.inner.t.to_le_bytes());
        bytes.extend_from_slice(&self.hidden.to_le_bytes());
        Some(ContentDigest::of(&bytes))
    }
}

static NONDET_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Rewards drawn from process-global state instead of the reset seed.
pub struct NondetEnv {
    inner: CounterEnv,
}

impl Environment for NondetEnv {
    fn env_id(&self) -> &str {
        "Nondet-v0"
    }

    fn action_space_n(&self) -> u32 {
        COUNTER_ACTIONS
    }

    fn reset(&mut self, seed: u64) -> Result<Observation, EnvError> {
        self.inner.reset(seed)
    }

    fn step(&mut self, action: Action) -> Result<EnvStep, EnvError> {
        let mut step = self.inner.step(action)?;
        step.reward += NONDET_COUNTER.fetch_add(1, Ordering::SeqCst) as f64;
        Ok(step)
    }
}

/// Factory for `counter` (never terminates on its own), `counter-20`
/// (terminates after 20 frames), `counter-fail-5` (backend error on frame 5),
/// `counter-inf-3` (infinite reward on frame 3) and `nondet`.
pub fn counter_factory(key: &str) -> Result<Box<dyn Environment>, EnvError> {
    match key {
        "counter" => Ok(Box::new(CounterEnv::new(None))),
        "counter-20" => Ok(Box::new(CounterEnv::new(Some(20)))),
        "counter-fail-5" => Ok(Box::new(CounterEnv::new(None).failing_at(5))),
        "counter-inf-3" => Ok(Box::new(CounterEnv::new(None).infinite_reward_at(3))),
        "nondet" => Ok(Box::new(NondetEnv {
            inner: CounterEnv::new(None),
        })),
        other => Err(EnvError::UnknownEnvironment {
            key: other.to_string(),
            valid: "counter, counter-20, counter-fail-5, counter-inf-3, nondet".to_string(),
        }),
    }
}

/// Factory whose first instance is faithful and every later instance
/// drifts in hidden state from `drift_from` on.
pub fn drift_factory(
    drift_from: u64,
) -> impl Fn(&str) -> Result<Box<dyn Environment>, EnvError> + Send + Sync {
    let instances = AtomicUsize::new(0);
    move |_key: &str| {
        let n = instances.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DriftEnv {
            inner: CounterEnv::new(None),
            hidden: 0,
            drift_from,
            drifting: n > 0,
        }) as Box<dyn Environment>)
    }
}

pub fn temp_store() -> (TempDir, Arc<TelemetryStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TelemetryStore::open(dir.path()).unwrap());
    (dir, store)
}

pub fn run_id(s: &str) -> RunId {
    s.parse().unwrap()
}

/// Single-worker config with frameskip 1 and no sticky actions.
pub fn test_config(env_id: &str, episodes: u64, max_steps: u64) -> RunConfig {
    let mut cfg = RunConfig::new(42, env_id, episodes);
    cfg.policy = "cycle:0,1".to_string();
    cfg.max_steps_per_episode = max_steps;
    cfg.frameskip = 1;
    cfg.checksum_interval = 10;
    cfg
}

/// Rewrite one field of a recorded step in place.
pub fn corrupt_step(
    store: &TelemetryStore,
    run_id: &RunId,
    episode_id: EpisodeId,
    step_index: u64,
    field: &str,
    value: serde_json::Value,
) {
    let path = store.episode_path(run_id, episode_id);
    let text = fs::read_to_string(&path).unwrap();
    let mut out = String::new();
    let mut hit = false;
    for line in text.lines() {
        let mut entry: serde_json::Value = serde_json::from_str(line).unwrap();
        if entry["kind"] == "step" && entry["step_index"] == step_index {
            entry[field] = value.clone();
            hit = true;
        }
        out.push_str(&serde_json::to_string(&entry).unwrap());
        out.push('\n');
    }
    assert!(hit, "step {step_index} not found in {}", path.display());
    fs::write(&path, out).unwrap();
}
