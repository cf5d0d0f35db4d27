// src/runner.rs
//
// Episode and run driver.
//
// Responsibilities:
// - run_episode: reset -> (select action -> step -> record) loop for one
//   episode on one DeterministicEnv, with cancellation checked between steps
// - Runner::record_run: create the run, partition episodes across worker
//   units (scoped threads), finalise the manifest
//
// Failure policy:
// - environment failures (init, invalid action, backend) end the episode as
//   `failed` and the run continues
// - a non-finite reward is an environment failure: it cannot be stored
//   losslessly as JSON
// - store, recorder and telemetry write failures abort the run and are
//   returned to the caller
// - cancellation marks the episode in progress `truncated` and starts no new
//   episodes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::config::{ConfigError, RunConfig};
use crate::env::{DeterministicEnv, EnvFactory, Environment, WrapperConfig};
use crate::metrics::OnlineStats;
use crate::policy::{make_policy, Policy, PolicyError};
use crate::recorder::{RecorderError, StepInput, TrajectoryRecorder};
use crate::seed::{EpisodeSeeds, SeedManager};
use crate::store::{EpisodeCounts, RunManifest, RunStatus, StoreError, TelemetryStore};
use crate::telemetry::ProgressSender;
use crate::trajectory::TerminalStatus;
use crate::types::{now_ms, ContentDigest, EpisodeId, RunId};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("telemetry write failed: {0}")]
    Telemetry(String),
    #[error("worker unit {0} panicked")]
    WorkerPanicked(usize),
}

/// Cooperative cancellation shared between the caller and worker units.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeOutcome {
    pub episode_id: EpisodeId,
    pub status: TerminalStatus,
    pub steps: u64,
    pub total_reward: f64,
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub counts: EpisodeCounts,
    /// Sorted by episode id.
    pub episodes: Vec<EpisodeOutcome>,
}

impl RunSummary {
    pub fn total_steps(&self) -> u64 {
        self.episodes.iter().map(|e| e.steps).sum()
    }

    pub fn return_stats(&self) -> OnlineStats {
        let mut stats = OnlineStats::default();
        for e in &self.episodes {
            stats.add(e.total_reward);
        }
        stats
    }
}

/// Per-episode inputs for `run_episode`.
pub struct EpisodeSpec<'a> {
    pub run_id: &'a RunId,
    pub env_key: &'a str,
    pub episode_index: u64,
    pub seeds: EpisodeSeeds,
}

/// Run one episode to completion, truncation, failure or cancellation,
/// recording every step as it happens.
pub fn run_episode<E: Environment>(
    env: &mut DeterministicEnv<E>,
    policy: &mut dyn Policy,
    recorder: &TrajectoryRecorder,
    spec: &EpisodeSpec<'_>,
    progress: &ProgressSender,
    cancel: &CancelFlag,
) -> Result<EpisodeOutcome, RecorderError> {
    let reset = env.reset(&spec.seeds);
    let initial_digest = reset.as_ref().ok().map(|obs| obs.digest());
    let env_id = env.env_id().to_string();
    let episode_id = recorder.begin_episode(
        spec.run_id,
        spec.episode_index,
        spec.env_key,
        &env_id,
        spec.seeds,
        initial_digest,
    )?;

    let mut observation = match reset {
        Ok(obs) => obs,
        Err(e) => {
            tracing::warn!(run_id = %spec.run_id, episode = %episode_id, error = %e, "environment reset failed");
            return finish(recorder, progress, episode_id, TerminalStatus::Failed, None, Some(e.to_string()));
        }
    };
    policy.reset(spec.seeds.policy, env.action_space_n(), &env.action_meanings());

    let mut last_reward = 0.0;
    let mut failure = None;
    let status = loop {
        if cancel.is_cancelled() {
            tracing::info!(run_id = %spec.run_id, episode = %episode_id, step = env.steps(), "cancelled, truncating episode");
            break TerminalStatus::Truncated;
        }
        if let Some(reason) = progress.fault() {
            tracing::warn!(run_id = %spec.run_id, episode = %episode_id, step = env.steps(), reason, "telemetry failed, truncating episode");
            break TerminalStatus::Truncated;
        }

        let step_index = env.steps();
        let action = policy.select_action(step_index, &observation, last_reward);
        let started = Instant::now();
        let outcome = match env.step(action) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(run_id = %spec.run_id, episode = %episode_id, step = step_index, error = %e, "episode failed");
                failure = Some(e.to_string());
                break TerminalStatus::Failed;
            }
        };
        let latency = started.elapsed();
        if !outcome.reward.is_finite() {
            tracing::warn!(run_id = %spec.run_id, episode = %episode_id, step = step_index, reward = outcome.reward, "episode failed");
            failure = Some(format!("non-finite reward {} at step {step_index}", outcome.reward));
            break TerminalStatus::Failed;
        }

        let done = outcome.done();
        let checksum = recorder
            .should_checksum(step_index, done)
            .then(|| env.checksum());
        recorder.record_step(
            episode_id,
            StepInput {
                step_index,
                action,
                reward: outcome.reward,
                observation_digest: outcome.observation.digest(),
                terminated: outcome.terminated,
                truncated: outcome.truncated,
                checksum,
            },
        )?;
        progress.step_completed(episode_id, step_index, latency);

        last_reward = outcome.reward;
        observation = outcome.observation;
        if outcome.terminated {
            break TerminalStatus::Completed;
        }
        if outcome.truncated {
            break TerminalStatus::Truncated;
        }
    };

    // A failed step may have advanced the wrapper part-way, so only the
    // recorded prefix is verifiable.
    let final_checksum = (status != TerminalStatus::Failed).then(|| env.checksum());
    finish(recorder, progress, episode_id, status, final_checksum, failure)
}

fn finish(
    recorder: &TrajectoryRecorder,
    progress: &ProgressSender,
    episode_id: EpisodeId,
    status: TerminalStatus,
    final_checksum: Option<ContentDigest>,
    failure: Option<String>,
) -> Result<EpisodeOutcome, RecorderError> {
    let end = recorder.end_episode(episode_id, status, final_checksum, failure)?;
    progress.episode_finished(episode_id, end.steps, end.total_reward, status);
    Ok(EpisodeOutcome {
        episode_id,
        status,
        steps: end.steps,
        total_reward: end.total_reward,
        failure: end.failure,
    })
}

/// Records runs against a store.
pub struct Runner<F> {
    store: Arc<TelemetryStore>,
    factory: F,
    cancel: CancelFlag,
    progress: ProgressSender,
}

impl<F: EnvFactory> Runner<F> {
    pub fn new(store: Arc<TelemetryStore>, factory: F) -> Self {
        Self {
            store,
            factory,
            cancel: CancelFlag::new(),
            progress: ProgressSender::disabled(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Record every episode of `config` under `run_id`.
    pub fn record_run(&self, run_id: &RunId, config: &RunConfig) -> Result<RunSummary, RunError> {
        config.validate()?;

        let mut manifest = RunManifest::new(run_id.clone(), config.clone(), now_ms());
        self.store.create_run(&manifest)?;
        tracing::info!(
            run_id = %run_id,
            env = %config.env_id,
            episodes = config.episodes,
            workers = config.workers,
            root_seed = config.root_seed,
            "run started"
        );

        let recorder = TrajectoryRecorder::new(Arc::clone(&self.store), config.checksum_interval);
        let seeds = SeedManager::new(config.root_seed);
        let wrapper = config.wrapper_config();
        let workers = config.workers.min(config.episodes as usize).max(1);
        let abort = AtomicBool::new(false);

        let results: Vec<Result<Vec<EpisodeOutcome>, RunError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let unit = WorkerUnit {
                        worker,
                        workers,
                        run_id,
                        config,
                        wrapper,
                        seeds,
                        recorder: &recorder,
                        factory: &self.factory,
                        progress: self.progress.clone(),
                        cancel: &self.cancel,
                        abort: &abort,
                    };
                    scope.spawn(move || unit.run())
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(worker, h)| h.join().unwrap_or(Err(RunError::WorkerPanicked(worker))))
                .collect()
        });

        let mut episodes = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcomes) => episodes.extend(outcomes),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        episodes.sort_by_key(|e| e.episode_id);
        if first_error.is_none() {
            if let Some(reason) = self.progress.fault() {
                first_error = Some(RunError::Telemetry(reason.to_string()));
            }
        }

        let mut counts = EpisodeCounts::default();
        for e in &episodes {
            match e.status {
                TerminalStatus::Completed => counts.completed += 1,
                TerminalStatus::Truncated => counts.truncated += 1,
                TerminalStatus::Failed => counts.failed += 1,
            }
        }
        let status = if first_error.is_some() {
            RunStatus::Aborted
        } else if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        manifest.status = status;
        manifest.finished_at_ms = Some(now_ms());
        manifest.episodes = counts;
        let finalised = self.store.write_manifest(&manifest);

        if let Some(e) = first_error {
            tracing::error!(run_id = %run_id, error = %e, "run aborted");
            return Err(e);
        }
        finalised?;

        tracing::info!(
            run_id = %run_id,
            status = ?status,
            completed = counts.completed,
            truncated = counts.truncated,
            failed = counts.failed,
            "run finished"
        );
        Ok(RunSummary {
            run_id: run_id.clone(),
            status,
            counts,
            episodes,
        })
    }
}

/// One worker: episodes `worker, worker + workers, ...`.
struct WorkerUnit<'a, F> {
    worker: usize,
    workers: usize,
    run_id: &'a RunId,
    config: &'a RunConfig,
    wrapper: WrapperConfig,
    seeds: SeedManager,
    recorder: &'a TrajectoryRecorder,
    factory: &'a F,
    progress: ProgressSender,
    cancel: &'a CancelFlag,
    abort: &'a AtomicBool,
}

impl<F: EnvFactory> WorkerUnit<'_, F> {
    fn run(self) -> Result<Vec<EpisodeOutcome>, RunError> {
        let mut outcomes = Vec::new();
        let indices = (self.worker as u64..self.config.episodes).step_by(self.workers);
        for episode_index in indices {
            if self.cancel.is_cancelled()
                || self.abort.load(Ordering::SeqCst)
                || self.progress.fault().is_some()
            {
                break;
            }
            match self.episode(episode_index) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    self.abort.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }

    fn episode(&self, episode_index: u64) -> Result<EpisodeOutcome, RunError> {
        let seeds = self.seeds.episode_seeds(episode_index);
        let spec = EpisodeSpec {
            run_id: self.run_id,
            env_key: &self.config.env_id,
            episode_index,
            seeds,
        };

        let env = match self.factory.make(&self.config.env_id) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, episode = episode_index, error = %e, "environment construction failed");
                let episode_id = self.recorder.begin_episode(
                    self.run_id,
                    episode_index,
                    &self.config.env_id,
                    &self.config.env_id,
                    seeds,
                    None,
                )?;
                return Ok(finish(
                    self.recorder,
                    &self.progress,
                    episode_id,
                    TerminalStatus::Failed,
                    None,
                    Some(e.to_string()),
                )?);
            }
        };
        let mut env = DeterministicEnv::new(env, self.wrapper);
        let mut policy = make_policy(&self.config.policy)?;

        let outcome = run_episode(
            &mut env,
            policy.as_mut(),
            self.recorder,
            &spec,
            &self.progress,
            self.cancel,
        )?;
        tracing::info!(
            run_id = %self.run_id,
            episode = %outcome.episode_id,
            worker = self.worker,
            status = outcome.status.as_str(),
            steps = outcome.steps,
            total_reward = outcome.total_reward,
            "episode recorded"
        );
        Ok(outcome)
    }
}
