// src/recorder.rs
//
// Trajectory recorder.
//
// Captures per-step records (observation digest, action, reward, flags,
// sampled checksum) and episode boundaries, appending each record to the store
// as it is produced.
//
// Invariants enforced here:
// - step indices are contiguous from 0 within an episode
// - each (run, episode, step) is written at most once
// - nothing is accepted for an episode after its end record
// - rewards and running returns are finite, so every record reads back
// - one recorder serves one run; episode ids are only unique within a run
//
// The recorder only observes: it never alters the step loop's control flow.
// Calls for the same episode are serialised by a per-episode mutex; different
// episodes proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::env::Action;
use crate::seed::EpisodeSeeds;
use crate::store::{Durability, StoreError, TelemetryStore};
use crate::trajectory::{
    EpisodeEnd, EpisodeHeader, StepRecord, TerminalStatus, TrajectoryEntry, TRAJECTORY_VERSION,
};
use crate::types::{now_ms, ContentDigest, EpisodeId, RunId};

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("out-of-order step for episode {episode_id}: expected {expected}, got {got}")]
    OutOfOrderStep {
        episode_id: EpisodeId,
        expected: u64,
        got: u64,
    },
    #[error("episode {0} is not being recorded")]
    UnknownEpisode(EpisodeId),
    #[error("episode {0} was already recorded or is in progress")]
    EpisodeAlreadyStarted(EpisodeId),
    #[error("non-finite reward {reward} at step {step_index} of episode {episode_id}")]
    NonFiniteReward {
        episode_id: EpisodeId,
        step_index: u64,
        reward: f64,
    },
    #[error("recorder belongs to run '{expected}', not '{got}'")]
    ForeignRun { expected: RunId, got: RunId },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One recorded step, as passed to `record_step`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInput {
    pub step_index: u64,
    pub action: Action,
    pub reward: f64,
    pub observation_digest: ContentDigest,
    pub terminated: bool,
    pub truncated: bool,
    pub checksum: Option<ContentDigest>,
}

#[derive(Debug)]
struct EpisodeProgress {
    run_id: RunId,
    next_step: u64,
    cumulative_reward: f64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Records the episodes of one run into a store. The run is fixed by the
/// first `begin_episode`; use a fresh recorder per run.
pub struct TrajectoryRecorder {
    store: Arc<TelemetryStore>,
    checksum_interval: u64,
    run_id: OnceLock<RunId>,
    episodes: Mutex<HashMap<EpisodeId, Arc<Mutex<EpisodeProgress>>>>,
}

impl TrajectoryRecorder {
    pub fn new(store: Arc<TelemetryStore>, checksum_interval: u64) -> Self {
        Self {
            store,
            checksum_interval: checksum_interval.max(1),
            run_id: OnceLock::new(),
            episodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn checksum_interval(&self) -> u64 {
        self.checksum_interval
    }

    /// Whether the step at `step_index` carries a full-state checksum: every
    /// Nth step, plus the step that ends the episode.
    pub fn should_checksum(&self, step_index: u64, done: bool) -> bool {
        done || (step_index + 1) % self.checksum_interval == 0
    }

    /// Start an episode. The header is synced before returning.
    pub fn begin_episode(
        &self,
        run_id: &RunId,
        episode_index: u64,
        env_key: &str,
        env_id: &str,
        seeds: EpisodeSeeds,
        initial_observation_digest: Option<ContentDigest>,
    ) -> Result<EpisodeId, RecorderError> {
        let bound = self.run_id.get_or_init(|| run_id.clone());
        if bound != run_id {
            return Err(RecorderError::ForeignRun {
                expected: bound.clone(),
                got: run_id.clone(),
            });
        }
        let episode_id = EpisodeId(episode_index);
        let progress = {
            let mut episodes = lock(&self.episodes);
            if episodes.contains_key(&episode_id) || self.store.episode_exists(run_id, episode_id) {
                return Err(RecorderError::EpisodeAlreadyStarted(episode_id));
            }
            let progress = Arc::new(Mutex::new(EpisodeProgress {
                run_id: run_id.clone(),
                next_step: 0,
                cumulative_reward: 0.0,
            }));
            episodes.insert(episode_id, Arc::clone(&progress));
            progress
        };
        let _guard = lock(&progress);

        let header = EpisodeHeader {
            format_version: TRAJECTORY_VERSION,
            run_id: run_id.clone(),
            episode_id,
            env_key: env_key.to_string(),
            env_id: env_id.to_string(),
            seeds,
            initial_observation_digest,
            started_at_ms: now_ms(),
        };
        let appended = self.store.append_trajectory(
            run_id,
            episode_id,
            &TrajectoryEntry::EpisodeBegin(header),
            Durability::Synced,
        );
        if let Err(e) = appended {
            lock(&self.episodes).remove(&episode_id);
            return Err(e.into());
        }

        tracing::debug!(run_id = %run_id, episode = %episode_id, env_seed = seeds.env, "episode started");
        Ok(episode_id)
    }

    /// Append one step. Returns the cumulative reward after this step.
    pub fn record_step(&self, episode_id: EpisodeId, step: StepInput) -> Result<f64, RecorderError> {
        let progress = self.progress(episode_id)?;
        let mut progress = lock(&progress);

        if step.step_index != progress.next_step {
            return Err(RecorderError::OutOfOrderStep {
                episode_id,
                expected: progress.next_step,
                got: step.step_index,
            });
        }

        let cumulative_reward = progress.cumulative_reward + step.reward;
        if !cumulative_reward.is_finite() {
            return Err(RecorderError::NonFiniteReward {
                episode_id,
                step_index: step.step_index,
                reward: step.reward,
            });
        }
        let record = StepRecord {
            episode_id,
            step_index: step.step_index,
            action: step.action,
            reward: step.reward,
            cumulative_reward,
            observation_digest: step.observation_digest,
            terminated: step.terminated,
            truncated: step.truncated,
            checksum: step.checksum,
        };
        self.store.append_trajectory(
            &progress.run_id,
            episode_id,
            &TrajectoryEntry::Step(record),
            Durability::Written,
        )?;

        progress.next_step += 1;
        progress.cumulative_reward = cumulative_reward;
        tracing::trace!(episode = %episode_id, step = step.step_index, reward = step.reward, "step recorded");
        Ok(cumulative_reward)
    }

    /// Close an episode. The end record is synced before returning; after it
    /// the episode accepts no more records.
    pub fn end_episode(
        &self,
        episode_id: EpisodeId,
        status: TerminalStatus,
        final_checksum: Option<ContentDigest>,
        failure: Option<String>,
    ) -> Result<EpisodeEnd, RecorderError> {
        let progress = self.progress(episode_id)?;
        let progress = lock(&progress);

        let end = EpisodeEnd {
            episode_id,
            status,
            steps: progress.next_step,
            total_reward: progress.cumulative_reward,
            final_checksum,
            failure,
            ended_at_ms: now_ms(),
        };
        self.store.append_trajectory(
            &progress.run_id,
            episode_id,
            &TrajectoryEntry::EpisodeEnd(end.clone()),
            Durability::Synced,
        )?;
        self.store.close_episode(&progress.run_id, episode_id);
        lock(&self.episodes).remove(&episode_id);

        tracing::debug!(
            run_id = %progress.run_id,
            episode = %episode_id,
            status = status.as_str(),
            steps = end.steps,
            total_reward = end.total_reward,
            "episode ended"
        );
        Ok(end)
    }

    /// Episodes begun but not yet ended.
    pub fn open_episodes(&self) -> Vec<EpisodeId> {
        let mut ids: Vec<EpisodeId> = lock(&self.episodes).keys().copied().collect();
        ids.sort();
        ids
    }

    fn progress(&self, episode_id: EpisodeId) -> Result<Arc<Mutex<EpisodeProgress>>, RecorderError> {
        lock(&self.episodes)
            .get(&episode_id)
            .cloned()
            .ok_or(RecorderError::UnknownEpisode(episode_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::seed::SeedManager;
    use crate::store::RunManifest;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<TelemetryStore>, RunId) {
        let dir = tempdir().unwrap();
        let store = Arc::new(TelemetryStore::open(dir.path()).unwrap());
        let run_id: RunId = "rec-test".parse().unwrap();
        store
            .create_run(&RunManifest::new(run_id.clone(), RunConfig::new(1, "gridchase", 1), 0))
            .unwrap();
        (dir, store, run_id)
    }

    fn step(i: u64, reward: f64) -> StepInput {
        StepInput {
            step_index: i,
            action: 0,
            reward,
            observation_digest: ContentDigest::of(&i.to_le_bytes()),
            terminated: false,
            truncated: false,
            checksum: None,
        }
    }

    #[test]
    fn checksum_sampling_every_nth_and_terminal() {
        let (_dir, store, _) = setup();
        let rec = TrajectoryRecorder::new(store, 10);
        let sampled: Vec<u64> = (0..30).filter(|&i| rec.should_checksum(i, false)).collect();
        assert_eq!(sampled, vec![9, 19, 29]);
        assert!(rec.should_checksum(3, true));
    }

    #[test]
    fn out_of_order_and_duplicate_steps_are_rejected() {
        let (_dir, store, run_id) = setup();
        let rec = TrajectoryRecorder::new(Arc::clone(&store), 100);
        let seeds = SeedManager::new(1).episode_seeds(0);
        let ep = rec
            .begin_episode(&run_id, 0, "gridchase", "GridChase-v0", seeds, Some(ContentDigest::of(b"o")))
            .unwrap();

        assert_eq!(rec.record_step(ep, step(0, 1.0)).unwrap(), 1.0);
        assert!(matches!(
            rec.record_step(ep, step(0, 1.0)),
            Err(RecorderError::OutOfOrderStep { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            rec.record_step(ep, step(2, 1.0)),
            Err(RecorderError::OutOfOrderStep { expected: 1, got: 2, .. })
        ));
        assert_eq!(rec.record_step(ep, step(1, 0.5)).unwrap(), 1.5);

        let end = rec
            .end_episode(ep, TerminalStatus::Truncated, None, None)
            .unwrap();
        assert_eq!(end.steps, 2);
        assert_eq!(end.total_reward, 1.5);
        assert!(matches!(
            rec.record_step(ep, step(2, 0.0)),
            Err(RecorderError::UnknownEpisode(_))
        ));

        let summary = store.episode_summary(&run_id, ep).unwrap();
        assert_eq!(summary.steps_recorded, 2);
        assert_eq!(summary.status(), Some(TerminalStatus::Truncated));
    }

    #[test]
    fn episode_cannot_begin_twice_while_open() {
        let (_dir, store, run_id) = setup();
        let rec = TrajectoryRecorder::new(store, 100);
        let seeds = SeedManager::new(1).episode_seeds(4);
        let digest = Some(ContentDigest::of(b"o"));
        rec.begin_episode(&run_id, 4, "gridchase", "GridChase-v0", seeds, digest)
            .unwrap();
        assert!(matches!(
            rec.begin_episode(&run_id, 4, "gridchase", "GridChase-v0", seeds, digest),
            Err(RecorderError::EpisodeAlreadyStarted(EpisodeId(4)))
        ));
        assert_eq!(rec.open_episodes(), vec![EpisodeId(4)]);

        rec.end_episode(EpisodeId(4), TerminalStatus::Completed, None, None)
            .unwrap();
        assert!(matches!(
            rec.begin_episode(&run_id, 4, "gridchase", "GridChase-v0", seeds, digest),
            Err(RecorderError::EpisodeAlreadyStarted(EpisodeId(4)))
        ));
    }

    #[test]
    fn non_finite_rewards_are_rejected_before_writing() {
        let (_dir, store, run_id) = setup();
        let rec = TrajectoryRecorder::new(Arc::clone(&store), 100);
        let ep = rec
            .begin_episode(&run_id, 0, "gridchase", "GridChase-v0", SeedManager::new(1).episode_seeds(0), None)
            .unwrap();
        rec.record_step(ep, step(0, 1.0)).unwrap();

        for bad in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            assert!(matches!(
                rec.record_step(ep, step(1, bad)),
                Err(RecorderError::NonFiniteReward { step_index: 1, .. })
            ));
        }
        // Finite rewards whose running sum overflows are rejected too.
        rec.record_step(ep, step(1, f64::MAX)).unwrap();
        assert!(matches!(
            rec.record_step(ep, step(2, f64::MAX)),
            Err(RecorderError::NonFiniteReward { step_index: 2, .. })
        ));

        rec.end_episode(ep, TerminalStatus::Failed, None, Some("bad reward".into()))
            .unwrap();
        let summary = store.episode_summary(&run_id, ep).unwrap();
        assert_eq!(summary.steps_recorded, 2);
        assert_eq!(summary.status(), Some(TerminalStatus::Failed));
    }

    #[test]
    fn recorder_is_bound_to_its_first_run() {
        let (_dir, store, run_id) = setup();
        let other: RunId = "rec-other".parse().unwrap();
        store
            .create_run(&RunManifest::new(other.clone(), RunConfig::new(1, "gridchase", 1), 0))
            .unwrap();
        let rec = TrajectoryRecorder::new(Arc::clone(&store), 100);
        let seeds = SeedManager::new(1).episode_seeds(0);
        rec.begin_episode(&run_id, 0, "gridchase", "GridChase-v0", seeds, None)
            .unwrap();

        match rec.begin_episode(&other, 0, "gridchase", "GridChase-v0", seeds, None) {
            Err(RecorderError::ForeignRun { expected, got }) => {
                assert_eq!(expected, run_id);
                assert_eq!(got, other);
            }
            result => panic!("unexpected result {result:?}"),
        }
        assert!(!store.episode_exists(&other, EpisodeId(0)));
        assert_eq!(rec.open_episodes(), vec![EpisodeId(0)]);
    }
}
