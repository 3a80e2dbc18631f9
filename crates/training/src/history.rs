use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Per-step loss sum for the epoch in progress.
#[derive(Debug, Default, Clone)]
pub struct EpochAccumulator {
    loss_sum: f32,
    steps: usize,
}

impl EpochAccumulator {
    pub fn add(&mut self, loss: f32) {
        self.loss_sum += loss;
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn average(&self) -> f32 {
        if self.steps == 0 {
            0.0
        } else {
            self.loss_sum / self.steps as f32
        }
    }
}

/// Loss per epoch and Dice per validation round.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TrainingHistory {
    pub epoch_loss: Vec<f32>,
    pub metric_values: Vec<f32>,
    pub metric_values_tc: Vec<f32>,
    pub metric_values_wt: Vec<f32>,
    pub metric_values_et: Vec<f32>,
}

impl TrainingHistory {
    pub fn record_loss(&mut self, loss: f32) {
        self.epoch_loss.push(loss);
    }

    /// `regions` in [TC, WT, ET] order; missing entries are recorded as 0.
    pub fn record_validation(&mut self, mean: f32, regions: &[f32]) {
        let at = |i: usize| regions.get(i).copied().unwrap_or(0.0);
        self.metric_values.push(mean);
        self.metric_values_tc.push(at(0));
        self.metric_values_wt.push(at(1));
        self.metric_values_et.push(at(2));
    }
}

/// Best validation Dice seen so far and every improvement on the way there.
#[derive(Debug, Clone, Serialize)]
pub struct BestMetricTracker {
    pub best_metric: f32,
    /// 1-based epoch of `best_metric`; `None` until the first improvement.
    pub best_epoch: Option<usize>,
    pub best_metrics: Vec<f32>,
    pub best_epochs: Vec<usize>,
    pub best_times: Vec<f64>,
}

impl Default for BestMetricTracker {
    fn default() -> Self {
        Self {
            best_metric: -1.0,
            best_epoch: None,
            best_metrics: Vec::new(),
            best_epochs: Vec::new(),
            best_times: Vec::new(),
        }
    }
}

impl BestMetricTracker {
    /// Record `metric` when it beats the best so far; returns whether it did.
    pub fn update(&mut self, metric: f32, epoch: usize, elapsed_secs: f64) -> bool {
        if metric <= self.best_metric {
            return false;
        }
        self.best_metric = metric;
        self.best_epoch = Some(epoch);
        self.best_metrics.push(metric);
        self.best_epochs.push(epoch);
        self.best_times.push(elapsed_secs);
        true
    }
}

/// Append-only JSONL file, one object per validation round.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, line: &serde_json::Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_records_only_improvements() {
        let mut tracker = BestMetricTracker::default();
        let improved: Vec<bool> = [0.1, 0.5, 0.3, 0.7, 0.6]
            .iter()
            .enumerate()
            .map(|(i, m)| tracker.update(*m, i + 1, i as f64 * 10.0))
            .collect();
        assert_eq!(improved, vec![true, true, false, true, false]);
        assert_eq!(tracker.best_metrics, vec![0.1, 0.5, 0.7]);
        assert_eq!(tracker.best_epochs, vec![1, 2, 4]);
        assert_eq!(tracker.best_times, vec![0.0, 10.0, 30.0]);
        assert_eq!(tracker.best_epoch, Some(4));
        assert_eq!(tracker.best_metric, 0.7);
    }

    #[test]
    fn tracker_ignores_ties_and_starts_below_zero() {
        let mut tracker = BestMetricTracker::default();
        assert!(tracker.update(0.0, 1, 0.0));
        assert!(!tracker.update(0.0, 2, 1.0));
        assert_eq!(tracker.best_epochs, vec![1]);
    }

    #[test]
    fn accumulator_averages_steps() {
        let mut acc = EpochAccumulator::default();
        assert_eq!(acc.average(), 0.0);
        acc.add(1.0);
        acc.add(0.5);
        assert_eq!(acc.steps(), 2);
        assert!((acc.average() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn history_keeps_region_sequences_aligned() {
        let mut history = TrainingHistory::default();
        history.record_loss(0.9);
        history.record_validation(0.4, &[0.3, 0.6, 0.3]);
        history.record_validation(0.5, &[0.5]);
        assert_eq!(history.metric_values, vec![0.4, 0.5]);
        assert_eq!(history.metric_values_tc, vec![0.3, 0.5]);
        assert_eq!(history.metric_values_et, vec![0.3, 0.0]);
        assert_eq!(history.epoch_loss, vec![0.9]);
    }

    #[test]
    fn metrics_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("logs/metrics.jsonl"));
        log.append(&serde_json::json!({"epoch": 1, "mean_dice": 0.25}))
            .unwrap();
        log.append(&serde_json::json!({"epoch": 2, "mean_dice": 0.5}))
            .unwrap();
        let raw = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 2);
    }
}
