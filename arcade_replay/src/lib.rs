//! Arcade Replay core library.
//!
//! Deterministic capture and replay of Atari-style RL environment episodes,
//! with out-of-band telemetry. The binary (`src/main.rs`) is a thin CLI over
//! these components.
//!
//! # Architecture
//!
//! - **Seeds** (`seed`): every random stream of a run is derived from one
//!   root seed by a stable hash, so recordings reproduce across machines.
//!
//! - **Environments** (`env`): the `Environment` capability, the
//!   `DeterministicEnv` wrapper (frameskip, sticky actions, horizon,
//!   checksums) and a registry of built-in environments.
//!
//! - **Recording** (`recorder`, `runner`, `policy`): step loops drive a policy
//!   against a wrapped environment and append every step to the store before
//!   the next one begins.
//!
//! - **Store** (`store`, `trajectory`): append-only JSONL trajectories and
//!   telemetry per run, with torn-tail recovery after a crash.
//!
//! - **Replay** (`replay`): re-executes recorded episodes and reports MATCH,
//!   DIVERGED (with the first divergent step) or ERROR.
//!
//! - **Telemetry** (`telemetry`, `metrics`): a background collector samples
//!   throughput, latency, process and GPU metrics without blocking step
//!   loops.

pub mod config;
pub mod env;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod recorder;
pub mod replay;
pub mod runner;
pub mod seed;
pub mod store;
pub mod telemetry;
pub mod trajectory;
pub mod types;

pub use config::{ConfigError, RunConfig, Settings};
pub use env::{
    get_env_spec, list_envs, make_env, Action, BuiltinEnvs, DeterministicEnv, EnvError,
    EnvFactory, EnvStep, Environment, StepOutcome, WrapperConfig,
};
pub use metrics::{MetricSummary, OnlineStats, TelemetrySummary};
pub use policy::{list_policies, make_policy, Policy, PolicyError};
pub use recorder::{RecorderError, StepInput, TrajectoryRecorder};
pub use replay::{
    Divergence, DivergenceField, ReplayEngine, ReplayError, ReplayVerdict, RunVerification,
    VerdictResult,
};
pub use runner::{run_episode, CancelFlag, EpisodeOutcome, EpisodeSpec, RunError, RunSummary, Runner};
pub use seed::{derive_seed, EpisodeSeeds, SeedManager, SeedPurpose};
pub use store::{Durability, RunManifest, RunStatus, StoreError, TelemetryStore};
pub use telemetry::{
    CollectorConfig, MetricSource, ProgressSender, TelemetryCollector, TelemetryHandle,
    TelemetryRecord,
};
pub use trajectory::{EpisodeEnd, EpisodeHeader, StepRecord, TerminalStatus, TrajectoryEntry};
pub use types::{ContentDigest, EpisodeId, Observation, RunId};
