// src/trajectory.rs
//
// Recorded trajectory data model.
//
// An episode is stored as one JSONL stream of tagged entries:
// - episode_begin: header (derived seeds, initial observation digest)
// - step:          one record per wrapper step, contiguous from 0
// - episode_end:   terminal status, totals, final checksum
//
// Full observations are never stored, only their digests. An episode without
// an episode_end entry is incomplete and cannot be replayed.

use serde::{Deserialize, Serialize};

use crate::env::Action;
use crate::seed::EpisodeSeeds;
use crate::types::{ContentDigest, EpisodeId, RunId, TimestampMs};

/// Current trajectory format version.
/// Increment when changing the record schema.
pub const TRAJECTORY_VERSION: u32 = 1;

/// How an episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// The environment reported termination.
    Completed,
    /// Step horizon reached, or the run was cancelled mid-episode.
    Truncated,
    /// Environment or policy failure ended the episode early.
    Failed,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Truncated => "truncated",
            TerminalStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeHeader {
    pub format_version: u32,
    pub run_id: RunId,
    pub episode_id: EpisodeId,
    /// Registry key used to build the environment.
    pub env_key: String,
    /// Identifier reported by the environment itself.
    pub env_id: String,
    pub seeds: EpisodeSeeds,
    /// `None` when the environment could not be reset.
    pub initial_observation_digest: Option<ContentDigest>,
    pub started_at_ms: TimestampMs,
}

impl EpisodeHeader {
    /// The environment reset seed, i.e. the episode's derived seed.
    pub fn derived_seed(&self) -> u64 {
        self.seeds.env
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub episode_id: EpisodeId,
    pub step_index: u64,
    pub action: Action,
    pub reward: f64,
    pub cumulative_reward: f64,
    pub observation_digest: ContentDigest,
    pub terminated: bool,
    pub truncated: bool,
    /// Full-state checksum, present on sampled steps only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ContentDigest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeEnd {
    pub episode_id: EpisodeId,
    pub status: TerminalStatus,
    pub steps: u64,
    pub total_reward: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_checksum: Option<ContentDigest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub ended_at_ms: TimestampMs,
}

/// One line of an episode's trajectory stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrajectoryEntry {
    EpisodeBegin(EpisodeHeader),
    Step(StepRecord),
    EpisodeEnd(EpisodeEnd),
}

/// Header plus end record of a stored episode (steps are not loaded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub header: EpisodeHeader,
    pub steps_recorded: u64,
    /// `None` while the episode is still being recorded or after a crash.
    pub end: Option<EpisodeEnd>,
}

impl EpisodeSummary {
    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    pub fn status(&self) -> Option<TerminalStatus> {
        self.end.as_ref().map(|e| e.status)
    }
}
