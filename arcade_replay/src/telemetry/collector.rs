// src/telemetry/collector.rs
//
// Background telemetry collector.
//
// Runs as an independent tokio task on a wall-clock interval (missed ticks
// are skipped, never bunched). Each tick it:
// 1. takes the step window (step count, latency stats, last position) that
//    step loops update in place, and drains finished-episode reports
// 2. derives throughput, mean step latency and per-episode return/length
// 3. samples every metric source on the blocking pool under a timeout; a
//    source whose previous read is still running is skipped this tick
// 4. appends the resulting records to the store
//
// Failed, slow or skipped reads become `metric_unavailable` markers. Step
// progress is coalesced into one shared window, so memory stays constant
// however long the collector stalls; only episode reports are queued, at most
// one per episode of the run.
//
// A failed append is fatal for the run: the first failure is raised on the
// shared `TelemetryFault`, step loops stop at their next step and
// `TelemetryHandle::shutdown` returns the error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::sources::{MetricSource, NvidiaSmiGpu, ProcessMetrics, SourceError};
use super::{metric, TelemetryRecord};
use crate::config::RunConfig;
use crate::metrics::OnlineStats;
use crate::store::TelemetryStore;
use crate::trajectory::TerminalStatus;
use crate::types::{EpisodeId, RunId};

/// End of one episode, as reported by the step loop.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeReport {
    pub episode_id: EpisodeId,
    pub steps: u64,
    pub total_return: f64,
    pub status: TerminalStatus,
}

/// Step-loop progress accumulated between ticks.
#[derive(Debug, Default)]
struct StepWindow {
    steps: u64,
    latency_ms: OnlineStats,
    last_episode: Option<EpisodeId>,
    last_step: Option<u64>,
}

/// First telemetry write failure of a run, shared by the collector and the
/// step loops.
#[derive(Debug, Clone, Default)]
pub struct TelemetryFault(Arc<OnceLock<String>>);

impl TelemetryFault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` unless a failure is already set. Returns true if this
    /// call set it.
    pub fn raise(&self, reason: impl Into<String>) -> bool {
        self.0.set(reason.into()).is_ok()
    }

    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

/// Cheap, cloneable, never-blocking handle used by step loops.
#[derive(Debug, Clone, Default)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<EpisodeReport>>,
    window: Option<Arc<Mutex<StepWindow>>>,
    fault: TelemetryFault,
}

impl ProgressSender {
    /// A sender that drops all progress (telemetry disabled).
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// The telemetry failure that should stop the run, if any.
    pub fn fault(&self) -> Option<&str> {
        self.fault.get()
    }

    pub fn step_completed(&self, episode_id: EpisodeId, step_index: u64, latency: Duration) {
        let Some(window) = &self.window else {
            return;
        };
        // The collector holds the lock only to swap the window out.
        if let Ok(mut w) = window.lock() {
            w.steps += 1;
            w.latency_ms.add(latency.as_secs_f64() * 1000.0);
            w.last_episode = Some(episode_id);
            w.last_step = Some(step_index);
        }
    }

    pub fn episode_finished(
        &self,
        episode_id: EpisodeId,
        steps: u64,
        total_return: f64,
        status: TerminalStatus,
    ) {
        if let Some(tx) = &self.tx {
            // Collector gone means telemetry stopped; the step loop carries on.
            let _ = tx.send(EpisodeReport {
                episode_id,
                steps,
                total_return,
                status,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    pub interval: Duration,
    pub read_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            read_timeout: Duration::from_millis(500),
        }
    }
}

impl From<&RunConfig> for CollectorConfig {
    fn from(cfg: &RunConfig) -> Self {
        Self {
            interval: Duration::from_millis(cfg.telemetry_interval_ms),
            read_timeout: Duration::from_millis(cfg.telemetry_timeout_ms),
        }
    }
}

/// Counters returned when the collector stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub ticks: u64,
    pub records_written: u64,
    pub unavailable: u64,
    pub write_errors: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("telemetry write failed ({} failed writes): {reason}", stats.write_errors)]
    WriteFailed { reason: String, stats: CollectorStats },
    #[error("telemetry collector task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct SourceSlot {
    label: String,
    metric_names: Vec<&'static str>,
    source: Arc<Mutex<Box<dyn MetricSource>>>,
    busy: Arc<AtomicBool>,
}

pub struct TelemetryCollector {
    run_id: RunId,
    store: Arc<TelemetryStore>,
    config: CollectorConfig,
    sources: Vec<SourceSlot>,
    window: Arc<Mutex<StepWindow>>,
    fault: TelemetryFault,
}

impl TelemetryCollector {
    pub fn new(run_id: RunId, store: Arc<TelemetryStore>, config: CollectorConfig) -> Self {
        Self {
            run_id,
            store,
            config,
            sources: Vec::new(),
            window: Arc::new(Mutex::new(StepWindow::default())),
            fault: TelemetryFault::new(),
        }
    }

    pub fn with_source<S: MetricSource>(mut self, source: S) -> Self {
        self.sources.push(SourceSlot {
            label: source.name().to_string(),
            metric_names: source.metric_names(),
            source: Arc::new(Mutex::new(Box::new(source))),
            busy: Arc::new(AtomicBool::new(false)),
        });
        self
    }

    /// Process CPU/RSS plus GPU 0 through nvidia-smi.
    pub fn with_default_sources(self) -> Self {
        self.with_source(ProcessMetrics::new())
            .with_source(NvidiaSmiGpu::default())
    }

    /// Start the collector on the current tokio runtime.
    pub fn spawn(self) -> (ProgressSender, TelemetryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tracing::debug!(
            run_id = %self.run_id,
            interval_ms = self.config.interval.as_millis() as u64,
            sources = self.sources.len(),
            "telemetry collector started"
        );
        let progress = ProgressSender {
            tx: Some(tx),
            window: Some(Arc::clone(&self.window)),
            fault: self.fault.clone(),
        };
        let fault = self.fault.clone();
        let task = tokio::spawn(self.run(rx, shutdown_rx));
        (
            progress,
            TelemetryHandle {
                shutdown: Some(shutdown_tx),
                task,
                fault,
            },
        )
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<EpisodeReport>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> CollectorStats {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut stats = CollectorStats::default();
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut rx, &mut last_tick, &mut stats, true).await;
                }
                _ = &mut shutdown => {
                    // Final drain so no step-loop progress is lost.
                    self.tick(&mut rx, &mut last_tick, &mut stats, false).await;
                    break;
                }
            }
        }

        tracing::debug!(run_id = %self.run_id, ticks = stats.ticks, records = stats.records_written, "telemetry collector stopped");
        stats
    }

    /// Take the step window, leaving the last position for idle ticks.
    fn take_window(&self) -> StepWindow {
        match self.window.lock() {
            Ok(mut w) => {
                let taken = StepWindow {
                    steps: w.steps,
                    latency_ms: w.latency_ms,
                    last_episode: w.last_episode,
                    last_step: w.last_step,
                };
                w.steps = 0;
                w.latency_ms = OnlineStats::default();
                taken
            }
            Err(_) => StepWindow::default(),
        }
    }

    async fn tick(
        &self,
        rx: &mut mpsc::UnboundedReceiver<EpisodeReport>,
        last_tick: &mut Instant,
        stats: &mut CollectorStats,
        sample_sources: bool,
    ) {
        stats.ticks += 1;
        let mut records = Vec::new();

        while let Ok(report) = rx.try_recv() {
            let at = |name: &'static str, value: f64| {
                let mut rec = TelemetryRecord::new(self.run_id.clone(), name, value)
                    .at(Some(report.episode_id), Some(report.steps));
                rec.detail = Some(report.status.as_str().to_string());
                rec
            };
            records.push(at(metric::EPISODE_RETURN, report.total_return));
            records.push(at(metric::EPISODE_LENGTH, report.steps as f64));
        }

        let window = self.take_window();
        let now = Instant::now();
        let elapsed = now.duration_since(*last_tick).as_secs_f64();
        *last_tick = now;
        let (episode, step) = (window.last_episode, window.last_step);
        if elapsed > 0.0 {
            records.push(
                TelemetryRecord::new(
                    self.run_id.clone(),
                    metric::STEPS_PER_SECOND,
                    window.steps as f64 / elapsed,
                )
                .at(episode, step),
            );
        }
        if !window.latency_ms.is_empty() {
            records.push(
                TelemetryRecord::new(
                    self.run_id.clone(),
                    metric::STEP_LATENCY_MS_MEAN,
                    window.latency_ms.mean(),
                )
                .at(episode, step),
            );
        }

        if sample_sources {
            for slot in &self.sources {
                records.extend(
                    self.sample_slot(slot)
                        .await
                        .into_iter()
                        .map(|r| r.at(episode, step)),
                );
            }
        }

        let unavailable = records.iter().filter(|r| r.is_unavailable()).count() as u64;
        let count = records.len() as u64;
        let store = Arc::clone(&self.store);
        let run_id = self.run_id.clone();
        let written =
            tokio::task::spawn_blocking(move || store.append_telemetry(&run_id, &records)).await;
        match written {
            Ok(Ok(())) => {
                stats.records_written += count;
                stats.unavailable += unavailable;
            }
            Ok(Err(e)) => self.write_failed(stats, e.to_string()),
            Err(e) => self.write_failed(stats, format!("write task failed: {e}")),
        }
    }

    fn write_failed(&self, stats: &mut CollectorStats, reason: String) {
        stats.write_errors += 1;
        if self.fault.raise(reason.as_str()) {
            tracing::error!(run_id = %self.run_id, error = %reason, "telemetry write failed, aborting run");
        } else {
            tracing::debug!(run_id = %self.run_id, error = %reason, "telemetry write failed again");
        }
    }

    async fn sample_slot(&self, slot: &SourceSlot) -> Vec<TelemetryRecord> {
        let unavailable = |reason: &str| -> Vec<TelemetryRecord> {
            slot.metric_names
                .iter()
                .map(|name| TelemetryRecord::unavailable(self.run_id.clone(), name, reason))
                .collect()
        };

        if slot.busy.swap(true, Ordering::AcqRel) {
            tracing::debug!(source = %slot.label, "previous read still running, skipping");
            return unavailable("previous read still running");
        }

        let source = Arc::clone(&slot.source);
        let busy = Arc::clone(&slot.busy);
        let read = tokio::task::spawn_blocking(move || {
            let result = source
                .lock()
                .map_err(|_| SourceError::Unavailable("source poisoned".into()))
                .and_then(|mut s| s.sample());
            busy.store(false, Ordering::Release);
            result
        });

        match tokio::time::timeout(self.config.read_timeout, read).await {
            Ok(Ok(Ok(samples))) => samples
                .into_iter()
                .map(|s| TelemetryRecord::new(self.run_id.clone(), s.metric_name, s.value))
                .collect(),
            Ok(Ok(Err(e))) => {
                tracing::debug!(source = %slot.label, error = %e, "metric read failed");
                unavailable(&e.to_string())
            }
            Ok(Err(join)) => {
                slot.busy.store(false, Ordering::Release);
                unavailable(&format!("read panicked: {join}"))
            }
            Err(_) => {
                tracing::debug!(source = %slot.label, timeout_ms = self.config.read_timeout.as_millis() as u64, "metric read timed out");
                unavailable(&format!(
                    "timed out after {}ms",
                    self.config.read_timeout.as_millis()
                ))
            }
        }
    }
}

/// Owner handle for a running collector.
pub struct TelemetryHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<CollectorStats>,
    fault: TelemetryFault,
}

impl TelemetryHandle {
    /// The first write failure, once one has happened.
    pub fn fault(&self) -> Option<&str> {
        self.fault.get()
    }

    /// Stop the collector after a final drain and return its counters, or
    /// the first write failure if any append was lost.
    pub async fn shutdown(mut self) -> Result<CollectorStats, CollectorError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let stats = (&mut self.task).await?;
        match self.fault.get() {
            Some(reason) => Err(CollectorError::WriteFailed {
                reason: reason.to_string(),
                stats,
            }),
            None => Ok(stats),
        }
    }
}
