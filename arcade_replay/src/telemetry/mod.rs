// src/telemetry/mod.rs
//
// Telemetry records and the background collector.
//
// Records are append-only JSONL lines keyed by run id. Step-loop progress
// crosses into the collector through a non-blocking channel; process and GPU
// readings come from MetricSource implementations sampled on a wall-clock
// interval. A failed or slow reading becomes a `metric_unavailable` marker
// instead of an error.

pub mod collector;
pub mod sources;

use serde::{Deserialize, Serialize};

use crate::types::{now_ms, EpisodeId, RunId, TimestampMs};

pub use collector::{
    CollectorConfig, CollectorError, CollectorStats, EpisodeReport, ProgressSender,
    TelemetryCollector, TelemetryFault, TelemetryHandle,
};
pub use sources::{MetricSource, NvidiaSmiGpu, ProcessMetrics, Sample, SourceError};

/// Metric names written by the collector.
pub mod metric {
    pub const STEPS_PER_SECOND: &str = "steps_per_second";
    pub const STEP_LATENCY_MS_MEAN: &str = "step_latency_ms_mean";
    pub const PROCESS_CPU_PERCENT: &str = "process_cpu_percent";
    pub const PROCESS_RSS_BYTES: &str = "process_rss_bytes";
    pub const GPU_UTILIZATION_PERCENT: &str = "gpu_utilization_percent";
    pub const GPU_MEMORY_USED_MIB: &str = "gpu_memory_used_mib";
    pub const EPISODE_RETURN: &str = "episode_return";
    pub const EPISODE_LENGTH: &str = "episode_length";
    /// Marker: a reading failed or timed out. `detail` names the metric.
    pub const METRIC_UNAVAILABLE: &str = "metric_unavailable";
}

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<EpisodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u64>,
    pub metric_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp_ms: TimestampMs,
}

impl TelemetryRecord {
    pub fn new(run_id: RunId, metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            run_id,
            episode_id: None,
            step_index: None,
            metric_name: metric_name.into(),
            value: Some(value),
            detail: None,
            timestamp_ms: now_ms(),
        }
    }

    /// Marker for a metric that could not be read this tick.
    pub fn unavailable(run_id: RunId, metric_name: &str, reason: &str) -> Self {
        Self {
            run_id,
            episode_id: None,
            step_index: None,
            metric_name: metric::METRIC_UNAVAILABLE.to_string(),
            value: None,
            detail: Some(format!("{metric_name}: {reason}")),
            timestamp_ms: now_ms(),
        }
    }

    pub fn at(mut self, episode_id: Option<EpisodeId>, step_index: Option<u64>) -> Self {
        self.episode_id = episode_id;
        self.step_index = step_index;
        self
    }

    pub fn is_unavailable(&self) -> bool {
        self.metric_name == metric::METRIC_UNAVAILABLE
    }
}
