// src/replay.rs
//
// Replay engine: re-execute a stored episode and verify it bit for bit.
//
// Procedure per episode:
// 1. Load the run manifest (wrapper settings) and the episode summary; an
//    episode without a durable end record is rejected as incomplete.
// 2. Build a fresh environment through the same factory and reset it with
//    the recorded derived seeds.
// 3. Stream the recorded steps, apply each recorded action and compare
//    flags, reward (bit-exact), observation digest and sampled checksums.
// 4. Compare the final checksum.
//
// The first mismatch yields DIVERGED with its step index; an environment
// failure yields ERROR with the captured message. Replay never writes to the
// trajectory, so replaying twice gives the same verdict.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::env::{DeterministicEnv, EnvFactory};
use crate::store::{StoreError, TelemetryStore};
use crate::trajectory::{StepRecord, TrajectoryEntry};
use crate::types::{now_ms, ContentDigest, EpisodeId, RunId, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictResult {
    Match,
    Diverged,
    Error,
}

impl VerdictResult {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictResult::Match => "MATCH",
            VerdictResult::Diverged => "DIVERGED",
            VerdictResult::Error => "ERROR",
        }
    }
}

/// Which recorded value disagreed with the replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceField {
    InitialObservation,
    Terminated,
    Truncated,
    Reward,
    ObservationDigest,
    Checksum,
    FinalChecksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub step_index: u64,
    pub field: DivergenceField,
    pub expected: String,
    pub actual: String,
}

impl Divergence {
    fn new(step_index: u64, field: DivergenceField, expected: impl ToString, actual: impl ToString) -> Self {
        Self {
            step_index,
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Outcome of verifying one episode. Stored separately from the trajectory
/// and replaced on re-verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayVerdict {
    pub run_id: RunId,
    pub episode_id: EpisodeId,
    pub result: VerdictResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_divergent_step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divergence: Option<Divergence>,
    pub steps_replayed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub verified_at_ms: TimestampMs,
}

impl ReplayVerdict {
    fn new(run_id: &RunId, episode_id: EpisodeId, steps_replayed: u64) -> Self {
        Self {
            run_id: run_id.clone(),
            episode_id,
            result: VerdictResult::Match,
            first_divergent_step: None,
            divergence: None,
            steps_replayed,
            error: None,
            verified_at_ms: now_ms(),
        }
    }

    fn diverged(mut self, divergence: Divergence) -> Self {
        self.result = VerdictResult::Diverged;
        self.first_divergent_step = Some(divergence.step_index);
        self.divergence = Some(divergence);
        self
    }

    fn error(mut self, message: String) -> Self {
        self.result = VerdictResult::Error;
        self.error = Some(message);
        self
    }

    pub fn is_match(&self) -> bool {
        self.result == VerdictResult::Match
    }
}

impl fmt::Display for ReplayVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run={} episode={} result={} steps_replayed={}",
            self.run_id,
            self.episode_id,
            self.result.as_str(),
            self.steps_replayed
        )?;
        if let Some(d) = &self.divergence {
            write!(
                f,
                " first_divergent_step={} field={:?} expected={} actual={}",
                d.step_index, d.field, d.expected, d.actual
            )?;
        }
        if let Some(e) = &self.error {
            write!(f, " error=\"{e}\"")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("episode {episode_id} of run '{run_id}' has no durable end record and cannot be replayed")]
    IncompleteEpisode { run_id: RunId, episode_id: EpisodeId },
    #[error("invalid trajectory for episode {episode_id} of run '{run_id}': {reason}")]
    InvalidTrajectory {
        run_id: RunId,
        episode_id: EpisodeId,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Verdicts for every episode of a run.
#[derive(Debug, Clone, Default)]
pub struct RunVerification {
    pub verdicts: Vec<ReplayVerdict>,
    /// Episodes skipped because they have no end record.
    pub incomplete: Vec<EpisodeId>,
}

impl RunVerification {
    pub fn count(&self, result: VerdictResult) -> usize {
        self.verdicts.iter().filter(|v| v.result == result).count()
    }

    pub fn all_match(&self) -> bool {
        self.incomplete.is_empty() && self.verdicts.iter().all(ReplayVerdict::is_match)
    }
}

/// Re-executes recorded episodes against fresh environments.
pub struct ReplayEngine<F> {
    store: Arc<TelemetryStore>,
    factory: F,
}

impl<F: EnvFactory> ReplayEngine<F> {
    pub fn new(store: Arc<TelemetryStore>, factory: F) -> Self {
        Self { store, factory }
    }

    /// Replay one episode and return its verdict without storing it.
    pub fn replay_episode(
        &self,
        run_id: &RunId,
        episode_id: EpisodeId,
    ) -> Result<ReplayVerdict, ReplayError> {
        let manifest = self.store.load_manifest(run_id)?;
        let summary = self.store.episode_summary(run_id, episode_id)?;
        let Some(end) = summary.end else {
            return Err(ReplayError::IncompleteEpisode {
                run_id: run_id.clone(),
                episode_id,
            });
        };
        let header = summary.header;
        let invalid = |reason: String| ReplayError::InvalidTrajectory {
            run_id: run_id.clone(),
            episode_id,
            reason,
        };

        let verdict = ReplayVerdict::new(run_id, episode_id, 0);
        let env = match self.factory.make(&header.env_key) {
            Ok(env) => env,
            Err(e) => return Ok(verdict.error(e.to_string())),
        };
        let mut env = DeterministicEnv::new(env, manifest.config.wrapper_config());
        let initial = match env.reset(&header.seeds) {
            Ok(obs) => obs.digest(),
            Err(e) => return Ok(verdict.error(e.to_string())),
        };
        if header.initial_observation_digest != Some(initial) {
            let expected = header
                .initial_observation_digest
                .map_or_else(|| "none".to_string(), |d| d.to_hex());
            return Ok(verdict.diverged(Divergence::new(
                0,
                DivergenceField::InitialObservation,
                expected,
                initial,
            )));
        }

        let mut replayed = 0u64;
        for entry in self.store.read_trajectory(run_id, episode_id)? {
            let recorded = match entry? {
                TrajectoryEntry::Step(step) => step,
                TrajectoryEntry::EpisodeBegin(_) | TrajectoryEntry::EpisodeEnd(_) => continue,
            };
            if recorded.step_index != replayed {
                return Err(invalid(format!(
                    "expected step {replayed}, found step {}",
                    recorded.step_index
                )));
            }

            let outcome = match env.step(recorded.action) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let mut verdict = verdict.error(e.to_string());
                    verdict.steps_replayed = replayed;
                    return Ok(verdict);
                }
            };
            replayed += 1;

            let actual_checksum = recorded.checksum.map(|_| env.checksum());
            if let Some(divergence) = compare_step(
                &recorded,
                outcome.reward,
                outcome.terminated,
                outcome.truncated,
                outcome.observation.digest(),
                actual_checksum,
            ) {
                tracing::info!(run_id = %run_id, episode = %episode_id, step = divergence.step_index, field = ?divergence.field, "replay diverged");
                let mut verdict = verdict.diverged(divergence);
                verdict.steps_replayed = replayed;
                return Ok(verdict);
            }
        }

        if replayed != end.steps {
            return Err(invalid(format!(
                "end record claims {} steps, trajectory holds {replayed}",
                end.steps
            )));
        }

        let mut verdict = verdict;
        verdict.steps_replayed = replayed;
        if let Some(expected) = end.final_checksum {
            let actual = env.checksum();
            if actual != expected {
                let step = replayed.saturating_sub(1);
                return Ok(verdict.diverged(Divergence::new(
                    step,
                    DivergenceField::FinalChecksum,
                    expected,
                    actual,
                )));
            }
        }
        Ok(verdict)
    }

    /// Replay one episode and store the verdict, replacing any earlier one.
    pub fn verify_episode(
        &self,
        run_id: &RunId,
        episode_id: EpisodeId,
    ) -> Result<ReplayVerdict, ReplayError> {
        let verdict = self.replay_episode(run_id, episode_id)?;
        self.store.write_verdict(&verdict)?;
        tracing::info!(
            run_id = %run_id,
            episode = %episode_id,
            result = verdict.result.as_str(),
            steps = verdict.steps_replayed,
            "episode verified"
        );
        Ok(verdict)
    }

    /// Verify every complete episode of a run. Incomplete episodes are
    /// reported, not replayed.
    pub fn verify_run(&self, run_id: &RunId) -> Result<RunVerification, ReplayError> {
        let mut out = RunVerification::default();
        for episode_id in self.store.list_episodes(run_id)? {
            match self.verify_episode(run_id, episode_id) {
                Ok(verdict) => out.verdicts.push(verdict),
                Err(ReplayError::IncompleteEpisode { .. }) => {
                    tracing::warn!(run_id = %run_id, episode = %episode_id, "skipping incomplete episode");
                    out.incomplete.push(episode_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn compare_step(
    recorded: &StepRecord,
    reward: f64,
    terminated: bool,
    truncated: bool,
    observation_digest: ContentDigest,
    checksum: Option<ContentDigest>,
) -> Option<Divergence> {
    let step = recorded.step_index;
    if recorded.terminated != terminated {
        return Some(Divergence::new(step, DivergenceField::Terminated, recorded.terminated, terminated));
    }
    if recorded.truncated != truncated {
        return Some(Divergence::new(step, DivergenceField::Truncated, recorded.truncated, truncated));
    }
    if recorded.reward.to_bits() != reward.to_bits() {
        return Some(Divergence::new(step, DivergenceField::Reward, recorded.reward, reward));
    }
    if recorded.observation_digest != observation_digest {
        return Some(Divergence::new(
            step,
            DivergenceField::ObservationDigest,
            recorded.observation_digest,
            observation_digest,
        ));
    }
    match (recorded.checksum, checksum) {
        (Some(expected), Some(actual)) if expected != actual => {
            Some(Divergence::new(step, DivergenceField::Checksum, expected, actual))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reward: f64) -> StepRecord {
        StepRecord {
            episode_id: EpisodeId(0),
            step_index: 7,
            action: 1,
            reward,
            cumulative_reward: reward,
            observation_digest: ContentDigest::of(b"a"),
            terminated: false,
            truncated: false,
            checksum: Some(ContentDigest::of(b"c")),
        }
    }

    #[test]
    fn reward_compared_bit_exact() {
        let rec = record(0.1);
        let next = f64::from_bits(0.1_f64.to_bits() + 1);
        let d = compare_step(&rec, next, false, false, ContentDigest::of(b"a"), None).unwrap();
        assert_eq!(d.field, DivergenceField::Reward);
        assert_eq!(d.step_index, 7);
        assert!(compare_step(&rec, 0.1, false, false, ContentDigest::of(b"a"), None).is_none());
    }

    #[test]
    fn termination_mismatch_is_a_divergence() {
        let rec = record(1.0);
        let d = compare_step(&rec, 1.0, true, false, ContentDigest::of(b"a"), None).unwrap();
        assert_eq!(d.field, DivergenceField::Terminated);
        assert_eq!((d.expected.as_str(), d.actual.as_str()), ("false", "true"));
    }

    #[test]
    fn sampled_checksum_mismatch_is_a_divergence() {
        let rec = record(1.0);
        let d = compare_step(
            &rec,
            1.0,
            false,
            false,
            ContentDigest::of(b"a"),
            Some(ContentDigest::of(b"other")),
        )
        .unwrap();
        assert_eq!(d.field, DivergenceField::Checksum);
    }

    #[test]
    fn verdict_serializes_result_in_caps() {
        let run: RunId = "r".parse().unwrap();
        let v = ReplayVerdict::new(&run, EpisodeId(1), 3).diverged(Divergence::new(
            2,
            DivergenceField::Reward,
            1.0,
            2.0,
        ));
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["result"], "DIVERGED");
        assert_eq!(json["first_divergent_step"], 2);
        assert_eq!(json["divergence"]["field"], "reward");
    }
}
