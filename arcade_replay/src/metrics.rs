// src/metrics.rs
//
// Online statistics and telemetry summaries.
// - OnlineStats: Welford running mean/variance + min/max
// - TelemetrySummary: per-metric stats over a telemetry stream, plus counts
//   of `metric_unavailable` markers per metric

use std::collections::BTreeMap;

use serde::Serialize;

use crate::telemetry::TelemetryRecord;

#[derive(Debug, Clone, Copy)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for OnlineStats {
    fn default() -> Self {
        Self {
            n: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl OnlineStats {
    /// Adds a sample if finite. Non-finite samples are ignored.
    pub fn add(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }

        self.n += 1;
        self.min = self.min.min(x);
        self.max = self.max.max(x);

        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.mean
        }
    }

    pub fn min(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// Sample standard deviation (n-1).
    pub fn stddev(&self) -> f64 {
        if self.n <= 1 {
            0.0
        } else {
            (self.m2 / ((self.n as f64) - 1.0)).sqrt()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub metric_name: String,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub last: f64,
}

/// Aggregate view of a run's telemetry.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySummary {
    stats: BTreeMap<String, (OnlineStats, f64)>,
    unavailable: BTreeMap<String, u64>,
    records: u64,
}

impl TelemetrySummary {
    pub fn add(&mut self, record: &TelemetryRecord) {
        self.records += 1;
        if record.is_unavailable() {
            let metric = record
                .detail
                .as_deref()
                .and_then(|d| d.split_once(':').map(|(m, _)| m.trim()))
                .unwrap_or("unknown");
            *self.unavailable.entry(metric.to_string()).or_default() += 1;
            return;
        }
        if let Some(value) = record.value {
            let entry = self
                .stats
                .entry(record.metric_name.clone())
                .or_insert((OnlineStats::default(), value));
            entry.0.add(value);
            entry.1 = value;
        }
    }

    /// Fold a fallible record stream, such as `TelemetryStore::read_telemetry`,
    /// one record at a time. Stops at the first error.
    pub fn from_stream<E, I>(records: I) -> Result<Self, E>
    where
        I: IntoIterator<Item = Result<TelemetryRecord, E>>,
    {
        let mut summary = TelemetrySummary::default();
        for record in records {
            summary.add(&record?);
        }
        Ok(summary)
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn metrics(&self) -> Vec<MetricSummary> {
        self.stats
            .iter()
            .map(|(name, (s, last))| MetricSummary {
                metric_name: name.clone(),
                count: s.n(),
                mean: s.mean(),
                min: s.min(),
                max: s.max(),
                stddev: s.stddev(),
                last: *last,
            })
            .collect()
    }

    /// `metric -> number of unavailable markers`.
    pub fn unavailable(&self) -> &BTreeMap<String, u64> {
        &self.unavailable
    }
}

impl<'a> FromIterator<&'a TelemetryRecord> for TelemetrySummary {
    fn from_iter<I: IntoIterator<Item = &'a TelemetryRecord>>(iter: I) -> Self {
        let mut summary = TelemetrySummary::default();
        for record in iter {
            summary.add(record);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::metric;
    use crate::types::RunId;

    #[test]
    fn online_stats_mean_and_stddev() {
        let mut s = OnlineStats::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0, f64::NAN] {
            s.add(x);
        }
        assert_eq!(s.n(), 8);
        assert!((s.mean() - 5.0).abs() < 1e-12);
        assert!((s.stddev() - (32.0_f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!((s.min(), s.max()), (2.0, 9.0));
    }

    #[test]
    fn summary_counts_unavailable_per_metric() {
        let run: RunId = "r".parse().unwrap();
        let records = vec![
            TelemetryRecord::new(run.clone(), metric::STEPS_PER_SECOND, 10.0),
            TelemetryRecord::new(run.clone(), metric::STEPS_PER_SECOND, 20.0),
            TelemetryRecord::unavailable(run.clone(), metric::GPU_UTILIZATION_PERCENT, "timed out"),
            TelemetryRecord::unavailable(run, metric::GPU_UTILIZATION_PERCENT, "timed out"),
        ];
        let summary: TelemetrySummary = records.iter().collect();
        assert_eq!(summary.records(), 4);
        let metrics = summary.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].mean, 15.0);
        assert_eq!(metrics[0].last, 20.0);
        assert_eq!(summary.unavailable()[metric::GPU_UTILIZATION_PERCENT], 2);
    }

    #[test]
    fn stream_fold_stops_at_first_error() {
        let run: RunId = "r".parse().unwrap();
        let ok = |v: f64| Ok::<_, String>(TelemetryRecord::new(run.clone(), metric::STEPS_PER_SECOND, v));

        let summary = TelemetrySummary::from_stream(vec![ok(1.0), ok(3.0)]).unwrap();
        assert_eq!(summary.records(), 2);
        assert_eq!(summary.metrics()[0].mean, 2.0);

        let failed = TelemetrySummary::from_stream(vec![ok(1.0), Err("line 2".to_string()), ok(3.0)]);
        assert_eq!(failed.unwrap_err(), "line 2");
    }
}
