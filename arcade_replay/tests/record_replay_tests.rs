// tests/record_replay_tests.rs
//
// End-to-end record -> replay scenarios against the store.
//
// These tests verify:
// - a 50-step [0,1,0,1,...] episode replays as MATCH and the verdict is stored
// - a corrupted reward is reported as DIVERGED at exactly that step
// - hidden-state drift is caught by the first sampled checksum after it
// - a nondeterministic environment is flagged on the first step
// - failed episodes replay their recorded prefix; construction failures
//   yield ERROR verdicts
// - an infinite reward fails the episode instead of writing an unreadable
//   record
// - incomplete episodes are refused
// - the worker count does not change what gets recorded

mod common;

use std::sync::Arc;

use arcade_replay::replay::{DivergenceField, ReplayEngine, ReplayError, VerdictResult};
use arcade_replay::runner::{RunError, Runner};
use arcade_replay::store::{RunStatus, StoreError, TelemetryStore};
use arcade_replay::trajectory::{StepRecord, TerminalStatus, TrajectoryEntry};
use arcade_replay::types::{EpisodeId, RunId};

use common::{corrupt_step, counter_factory, drift_factory, run_id, temp_store, test_config};

fn steps_of(store: &TelemetryStore, run: &RunId, episode: u64) -> Vec<StepRecord> {
    store
        .read_trajectory(run, EpisodeId(episode))
        .unwrap()
        .map(|e| e.unwrap())
        .filter_map(|e| match e {
            TrajectoryEntry::Step(s) => Some(s),
            _ => None,
        })
        .collect()
}

#[test]
fn fifty_step_alternating_episode_replays_as_match() {
    let (_dir, store) = temp_store();
    let run = run_id("alternating-50");
    let cfg = test_config("counter", 1, 50);

    let summary = Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &cfg)
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.truncated, 1);
    assert_eq!(summary.episodes[0].steps, 50);

    let steps = steps_of(&store, &run, 0);
    let actions: Vec<u32> = steps.iter().map(|s| s.action).collect();
    let expected: Vec<u32> = (0..50).map(|i| i % 2).collect();
    assert_eq!(actions, expected);
    assert!(steps[..49].iter().all(|s| !s.terminated && !s.truncated));
    assert!(steps[49].truncated);

    let sampled: Vec<u64> = steps
        .iter()
        .filter(|s| s.checksum.is_some())
        .map(|s| s.step_index)
        .collect();
    assert_eq!(sampled, vec![9, 19, 29, 39, 49]);

    let engine = ReplayEngine::new(Arc::clone(&store), counter_factory);
    let verdict = engine.verify_episode(&run, EpisodeId(0)).unwrap();
    assert_eq!(verdict.result, VerdictResult::Match, "{verdict}");
    assert_eq!(verdict.steps_replayed, 50);
    assert!(verdict.first_divergent_step.is_none());
    assert_eq!(store.read_verdict(&run, EpisodeId(0)).unwrap(), Some(verdict.clone()));

    // Replay is read-only, so a second pass agrees.
    let again = engine.replay_episode(&run, EpisodeId(0)).unwrap();
    assert_eq!(again.result, VerdictResult::Match);
    assert_eq!(steps_of(&store, &run, 0), steps);
}

#[test]
fn corrupted_reward_diverges_at_that_step() {
    let (_dir, store) = temp_store();
    let run = run_id("corrupt-reward");
    Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &test_config("counter", 1, 50))
        .unwrap();

    let original = steps_of(&store, &run, 0)[17].reward;
    corrupt_step(
        &store,
        &run,
        EpisodeId(0),
        17,
        "reward",
        serde_json::json!(original + 0.5),
    );

    let verdict = ReplayEngine::new(Arc::clone(&store), counter_factory)
        .verify_episode(&run, EpisodeId(0))
        .unwrap();
    assert_eq!(verdict.result, VerdictResult::Diverged);
    assert_eq!(verdict.first_divergent_step, Some(17));
    assert_eq!(verdict.steps_replayed, 18);
    let divergence = verdict.divergence.unwrap();
    assert_eq!(divergence.field, DivergenceField::Reward);
    assert_eq!(divergence.actual, original.to_string());
}

#[test]
fn hidden_drift_is_caught_by_the_next_sampled_checksum() {
    let (_dir, store) = temp_store();
    let run = run_id("hidden-drift");
    let factory = drift_factory(13);

    Runner::new(Arc::clone(&store), &factory)
        .record_run(&run, &test_config("drift", 1, 50))
        .unwrap();
    let verdict = ReplayEngine::new(Arc::clone(&store), &factory)
        .verify_episode(&run, EpisodeId(0))
        .unwrap();

    assert_eq!(verdict.result, VerdictResult::Diverged);
    let step = verdict.first_divergent_step.unwrap();
    assert_eq!(step, 19);
    assert!((13..13 + 10).contains(&step));
    assert_eq!(verdict.divergence.unwrap().field, DivergenceField::Checksum);
}

#[test]
fn checksum_every_step_pins_the_exact_drift_step() {
    let (_dir, store) = temp_store();
    let run = run_id("hidden-drift-dense");
    let factory = drift_factory(13);
    let mut cfg = test_config("drift", 1, 50);
    cfg.checksum_interval = 1;

    Runner::new(Arc::clone(&store), &factory)
        .record_run(&run, &cfg)
        .unwrap();
    let verdict = ReplayEngine::new(Arc::clone(&store), &factory)
        .verify_episode(&run, EpisodeId(0))
        .unwrap();
    assert_eq!(verdict.first_divergent_step, Some(13));
}

#[test]
fn nondeterministic_environment_is_flagged_on_first_step() {
    let (_dir, store) = temp_store();
    let run = run_id("nondet");
    Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &test_config("nondet", 1, 20))
        .unwrap();

    let verdict = ReplayEngine::new(Arc::clone(&store), counter_factory)
        .verify_episode(&run, EpisodeId(0))
        .unwrap();
    assert_eq!(verdict.result, VerdictResult::Diverged);
    assert_eq!(verdict.first_divergent_step, Some(0));
    assert_eq!(verdict.divergence.unwrap().field, DivergenceField::Reward);
}

#[test]
fn terminated_episode_completes_and_matches() {
    let (_dir, store) = temp_store();
    let run = run_id("terminates");
    let summary = Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &test_config("counter-20", 2, 50))
        .unwrap();
    assert_eq!(summary.counts.completed, 2);
    assert!(summary.episodes.iter().all(|e| e.steps == 20));

    let steps = steps_of(&store, &run, 1);
    assert!(steps[19].terminated);
    assert!(steps[19].checksum.is_some());

    let verification = ReplayEngine::new(Arc::clone(&store), counter_factory)
        .verify_run(&run)
        .unwrap();
    assert_eq!(verification.count(VerdictResult::Match), 2);
    assert!(verification.all_match());
}

#[test]
fn mid_episode_failure_is_recorded_and_prefix_replays() {
    let (_dir, store) = temp_store();
    let run = run_id("fails-at-5");
    let summary = Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &test_config("counter-fail-5", 2, 50))
        .unwrap();

    // Episode failures do not stop the run.
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.failed, 2);
    let outcome = &summary.episodes[0];
    assert_eq!(outcome.status, TerminalStatus::Failed);
    assert_eq!(outcome.steps, 5);
    assert!(outcome.failure.as_deref().unwrap().contains("emulator fault"));

    let end = store.episode_summary(&run, EpisodeId(0)).unwrap().end.unwrap();
    assert_eq!(end.status, TerminalStatus::Failed);
    assert!(end.final_checksum.is_none());

    let verdict = ReplayEngine::new(Arc::clone(&store), counter_factory)
        .verify_episode(&run, EpisodeId(0))
        .unwrap();
    assert_eq!(verdict.result, VerdictResult::Match, "{verdict}");
    assert_eq!(verdict.steps_replayed, 5);
}

#[test]
fn infinite_reward_fails_the_episode_and_keeps_the_log_readable() {
    let (_dir, store) = temp_store();
    let run = run_id("infinite-reward");
    let summary = Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &test_config("counter-inf-3", 1, 50))
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    let outcome = &summary.episodes[0];
    assert_eq!(outcome.status, TerminalStatus::Failed);
    assert_eq!(outcome.steps, 3);
    assert!(outcome.total_reward.is_finite());
    assert!(outcome.failure.as_deref().unwrap().contains("non-finite reward"));

    let episode = store.episode_summary(&run, EpisodeId(0)).unwrap();
    assert_eq!(episode.steps_recorded, 3);
    assert_eq!(episode.end.unwrap().status, TerminalStatus::Failed);
    assert!(steps_of(&store, &run, 0).iter().all(|s| s.reward.is_finite()));

    let verdict = ReplayEngine::new(Arc::clone(&store), counter_factory)
        .verify_episode(&run, EpisodeId(0))
        .unwrap();
    assert_eq!(verdict.result, VerdictResult::Match, "{verdict}");
    assert_eq!(verdict.steps_replayed, 3);
}

#[test]
fn unknown_environment_fails_episodes_and_replays_as_error() {
    let (_dir, store) = temp_store();
    let run = run_id("no-such-env");
    let summary = Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &test_config("pong", 2, 10))
        .unwrap();
    assert_eq!(summary.counts.failed, 2);
    assert_eq!(summary.total_steps(), 0);

    let header = store.episode_summary(&run, EpisodeId(1)).unwrap().header;
    assert!(header.initial_observation_digest.is_none());

    let verification = ReplayEngine::new(Arc::clone(&store), counter_factory)
        .verify_run(&run)
        .unwrap();
    assert_eq!(verification.count(VerdictResult::Error), 2);
    let message = verification.verdicts[0].error.as_deref().unwrap();
    assert!(message.contains("pong"), "{message}");
}

#[test]
fn incomplete_episode_is_not_replayed() {
    let (_dir, store) = temp_store();
    let run = run_id("incomplete");
    Runner::new(Arc::clone(&store), counter_factory)
        .record_run(&run, &test_config("counter", 2, 30))
        .unwrap();

    // Simulate a crash before the end record of episode 1 became durable.
    let path = store.episode_path(&run, EpisodeId(1));
    let text = std::fs::read_to_string(&path).unwrap();
    let kept: Vec<&str> = text.lines().filter(|l| !l.contains("\"episode_end\"")).collect();
    std::fs::write(&path, format!("{}\n", kept.join("\n"))).unwrap();

    let engine = ReplayEngine::new(Arc::clone(&store), counter_factory);
    let err = engine.verify_episode(&run, EpisodeId(1)).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::IncompleteEpisode { episode_id: EpisodeId(1), .. }
    ));

    let verification = engine.verify_run(&run).unwrap();
    assert_eq!(verification.incomplete, vec![EpisodeId(1)]);
    assert_eq!(verification.count(VerdictResult::Match), 1);
    assert!(!verification.all_match());
}

#[test]
fn worker_count_does_not_change_recorded_trajectories() {
    let (_a, serial) = temp_store();
    let (_b, parallel) = temp_store();
    let run = run_id("workers");
    let mut cfg = test_config("counter", 5, 30);
    cfg.policy = "random".to_string();
    cfg.repeat_action_probability = 0.25;

    Runner::new(Arc::clone(&serial), counter_factory)
        .record_run(&run, &cfg)
        .unwrap();
    cfg.workers = 3;
    let summary = Runner::new(Arc::clone(&parallel), counter_factory)
        .record_run(&run, &cfg)
        .unwrap();
    assert_eq!(summary.counts.total(), 5);

    for episode in 0..5 {
        assert_eq!(
            steps_of(&serial, &run, episode),
            steps_of(&parallel, &run, episode),
            "episode {episode}"
        );
        let a = serial.episode_summary(&run, EpisodeId(episode)).unwrap();
        let b = parallel.episode_summary(&run, EpisodeId(episode)).unwrap();
        assert_eq!(a.header.seeds, b.header.seeds);
        assert_eq!(a.end.unwrap().final_checksum, b.end.unwrap().final_checksum);
    }

    let verification = ReplayEngine::new(Arc::clone(&parallel), counter_factory)
        .verify_run(&run)
        .unwrap();
    assert!(verification.all_match());
}

#[test]
fn recording_the_same_run_id_twice_is_rejected() {
    let (_dir, store) = temp_store();
    let run = run_id("twice");
    let runner = Runner::new(Arc::clone(&store), counter_factory);
    runner.record_run(&run, &test_config("counter", 1, 5)).unwrap();

    let err = runner
        .record_run(&run, &test_config("counter", 1, 5))
        .unwrap_err();
    assert!(matches!(err, RunError::Store(StoreError::RunExists(_))));
}
