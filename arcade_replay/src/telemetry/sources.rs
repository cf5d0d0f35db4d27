// src/telemetry/sources.rs
//
// Metric sources sampled by the collector.
//
// Sources do blocking work (process table refresh, spawning nvidia-smi), so
// the collector always calls `sample` on the blocking pool under a timeout.

use std::path::PathBuf;
use std::process::Command;

use sysinfo::{Pid, System};

use super::metric;

/// One reading from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric_name: &'static str,
    pub value: f64,
}

impl Sample {
    pub fn new(metric_name: &'static str, value: f64) -> Self {
        Self { metric_name, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Unavailable(String),
    #[error("unparseable output: {0}")]
    Parse(String),
}

/// A blocking provider of one or more metrics.
pub trait MetricSource: Send + 'static {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Metrics this source reports; used to name `metric_unavailable`
    /// markers when a read fails.
    fn metric_names(&self) -> Vec<&'static str>;

    fn sample(&mut self) -> Result<Vec<Sample>, SourceError>;
}

/// CPU and resident memory of the current process (sysinfo).
pub struct ProcessMetrics {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMetrics {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for ProcessMetrics {
    fn name(&self) -> &str {
        "process"
    }

    fn metric_names(&self) -> Vec<&'static str> {
        vec![metric::PROCESS_CPU_PERCENT, metric::PROCESS_RSS_BYTES]
    }

    fn sample(&mut self) -> Result<Vec<Sample>, SourceError> {
        let pid = self
            .pid
            .ok_or_else(|| SourceError::Unavailable("current pid unknown".into()))?;
        if !self.system.refresh_process(pid) {
            return Err(SourceError::Unavailable(format!("process {pid} not found")));
        }
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| SourceError::Unavailable(format!("process {pid} not found")))?;
        // The first refresh has no previous sample, so CPU reads 0 until the
        // second tick.
        Ok(vec![
            Sample::new(metric::PROCESS_CPU_PERCENT, process.cpu_usage() as f64),
            Sample::new(metric::PROCESS_RSS_BYTES, process.memory() as f64),
        ])
    }
}

/// GPU utilisation and memory via `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiGpu {
    binary: PathBuf,
    gpu_index: u32,
}

impl NvidiaSmiGpu {
    pub fn new(gpu_index: u32) -> Self {
        Self {
            binary: PathBuf::from("nvidia-smi"),
            gpu_index,
        }
    }

    /// Use a different executable (tests, non-standard installs).
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }
}

impl Default for NvidiaSmiGpu {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Parse `utilization.gpu, memory.used` from
/// `--format=csv,noheader,nounits` output (first line only).
pub fn parse_nvidia_smi_csv(output: &str) -> Result<(f64, f64), SourceError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| SourceError::Parse("empty output".into()))?;
    let mut fields = line.split(',').map(str::trim);
    let mut next = |name: &str| -> Result<f64, SourceError> {
        let raw = fields
            .next()
            .ok_or_else(|| SourceError::Parse(format!("missing {name} in '{line}'")))?;
        raw.parse::<f64>()
            .map_err(|_| SourceError::Parse(format!("bad {name} '{raw}'")))
    };
    let util = next("utilization.gpu")?;
    let mem = next("memory.used")?;
    Ok((util, mem))
}

impl MetricSource for NvidiaSmiGpu {
    fn name(&self) -> &str {
        "nvidia-smi"
    }

    fn metric_names(&self) -> Vec<&'static str> {
        vec![metric::GPU_UTILIZATION_PERCENT, metric::GPU_MEMORY_USED_MIB]
    }

    fn sample(&mut self) -> Result<Vec<Sample>, SourceError> {
        let output = Command::new(&self.binary)
            .args([
                "--query-gpu=utilization.gpu,memory.used",
                "--format=csv,noheader,nounits",
                "-i",
                &self.gpu_index.to_string(),
            ])
            .output()
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", self.binary.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Unavailable(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }
        let (util, mem) = parse_nvidia_smi_csv(&String::from_utf8_lossy(&output.stdout))?;
        Ok(vec![
            Sample::new(metric::GPU_UTILIZATION_PERCENT, util),
            Sample::new(metric::GPU_MEMORY_USED_MIB, mem),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_line() {
        assert_eq!(parse_nvidia_smi_csv("35, 1234\n").unwrap(), (35.0, 1234.0));
        assert_eq!(parse_nvidia_smi_csv("\n  7 ,  0 \n1, 1\n").unwrap(), (7.0, 0.0));
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(matches!(parse_nvidia_smi_csv(""), Err(SourceError::Parse(_))));
        assert!(matches!(parse_nvidia_smi_csv("[N/A], 12"), Err(SourceError::Parse(_))));
        assert!(matches!(parse_nvidia_smi_csv("12"), Err(SourceError::Parse(_))));
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let mut gpu = NvidiaSmiGpu::new(0).with_binary("/nonexistent/nvidia-smi-arcade");
        assert!(matches!(gpu.sample(), Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn process_metrics_report_memory() {
        let mut src = ProcessMetrics::new();
        let samples = src.sample().unwrap();
        let rss = samples
            .iter()
            .find(|s| s.metric_name == metric::PROCESS_RSS_BYTES)
            .unwrap();
        assert!(rss.value > 0.0);
    }
}
