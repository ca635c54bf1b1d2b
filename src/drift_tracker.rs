//! Baseline-vs-recent drift scoring over telemetry features.
//!
//! Each feature keeps a long baseline window and a short recent window.
//! Score = 0.6 × |mean shift| in baseline standard deviations + 0.4 × a
//! quartile-based stability index. The per-event drift score fed into the
//! performance snapshot is the worst score across ready features.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::logging::{self, v_num, v_str, Domain};
use crate::market::TelemetryEvent;
use crate::stats;

pub const DRIFT_FEATURES: [&str; 3] = ["reward", "roi", "slippage_bps"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    Low,
    Moderate,
    Severe,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub feature: String,
    /// 0 = no drift, >= 4 = critical
    pub score: f64,
    pub severity: DriftSeverity,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    pub recent_mean: f64,
    pub recent_std: f64,
    pub mean_shift_z: f64,
    pub psi: f64,
}

/// Fixed-size window with O(1) running mean/variance (Welford, with removal).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    max_size: usize,
    values: VecDeque<f64>,
    mean: f64,
    m2: f64,
}

impl RollingWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            values: VecDeque::with_capacity(max_size),
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() >= self.max_size {
            if let Some(old) = self.values.pop_front() {
                self.remove(old);
            }
        }
        self.values.push_back(value);
        let n = self.values.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    fn remove(&mut self, value: f64) {
        // values already holds n - 1 elements here
        let n = self.values.len() as f64;
        if n == 0.0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let delta = value - self.mean;
        self.mean = (self.mean * (n + 1.0) - value) / n;
        self.m2 = (self.m2 - delta * (value - self.mean)).max(0.0);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() >= self.max_size
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        let n = self.values.len();
        if n > 1 {
            (self.m2 / (n as f64 - 1.0)).sqrt()
        } else {
            0.0
        }
    }

    pub fn percentile(&self, q: f64) -> f64 {
        let v: Vec<f64> = self.values.iter().copied().collect();
        stats::percentile(&v, q)
    }
}

#[derive(Debug, Clone)]
pub struct DriftThresholds {
    pub low: f64,
    pub moderate: f64,
    pub severe: f64,
    pub critical: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self { low: 1.0, moderate: 2.0, severe: 3.0, critical: 4.0 }
    }
}

impl DriftThresholds {
    pub fn classify(&self, score: f64) -> DriftSeverity {
        if score >= self.critical {
            DriftSeverity::Critical
        } else if score >= self.severe {
            DriftSeverity::Severe
        } else if score >= self.moderate {
            DriftSeverity::Moderate
        } else if score >= self.low {
            DriftSeverity::Low
        } else {
            DriftSeverity::None
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureTracker {
    name: String,
    baseline: RollingWindow,
    recent: RollingWindow,
}

impl FeatureTracker {
    pub fn new(name: &str, baseline_size: usize, recent_size: usize) -> Self {
        Self {
            name: name.to_string(),
            baseline: RollingWindow::new(baseline_size),
            recent: RollingWindow::new(recent_size),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, value: f64) {
        if value.is_finite() {
            self.baseline.push(value);
            self.recent.push(value);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.baseline.is_full() && self.recent.is_full()
    }

    pub fn report(&self, thresholds: &DriftThresholds) -> DriftReport {
        let baseline_mean = self.baseline.mean();
        let baseline_std = self.baseline.std();
        let recent_mean = self.recent.mean();
        let mean_shift_z = if baseline_std > 1e-9 {
            (recent_mean - baseline_mean).abs() / baseline_std
        } else {
            0.0
        };
        let psi = self.quartile_psi();
        let score = stats::finite_or_zero(mean_shift_z * 0.6 + psi * 0.4);
        DriftReport {
            feature: self.name.clone(),
            score,
            severity: thresholds.classify(score),
            baseline_mean,
            baseline_std,
            recent_mean,
            recent_std: self.recent.std(),
            mean_shift_z,
            psi,
        }
    }

    /// Quartile-ratio stand-in for a binned population stability index.
    fn quartile_psi(&self) -> f64 {
        if !self.is_ready() {
            return 0.0;
        }
        [0.25, 0.5, 0.75]
            .iter()
            .filter_map(|q| {
                let base = self.baseline.percentile(*q);
                let recent = self.recent.percentile(*q);
                if base.abs() <= 1e-9 {
                    return None;
                }
                let rel = ((recent - base) / base.abs()).abs();
                let ratio = recent / base;
                // a quartile that crossed zero has no log ratio; weigh it by the size of the move
                let log_term = if ratio > 0.0 { ratio.ln().abs() } else { rel.ln_1p() };
                Some(rel * log_term)
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct DriftTracker {
    features: Vec<FeatureTracker>,
    thresholds: DriftThresholds,
    pub overall_severity: DriftSeverity,
    pub last_update_ts: u64,
}

impl Default for DriftTracker {
    fn default() -> Self {
        Self::new(100, 20)
    }
}

impl DriftTracker {
    pub fn new(baseline_size: usize, recent_size: usize) -> Self {
        Self {
            features: DRIFT_FEATURES
                .iter()
                .map(|f| FeatureTracker::new(f, baseline_size, recent_size))
                .collect(),
            thresholds: DriftThresholds::default(),
            overall_severity: DriftSeverity::None,
            last_update_ts: 0,
        }
    }

    pub fn push(&mut self, feature: &str, value: f64, ts: u64) {
        if let Some(t) = self.features.iter_mut().find(|t| t.name() == feature) {
            t.push(value);
        }
        self.last_update_ts = ts;
    }

    /// Feed one telemetry event and return the current drift score.
    pub fn observe(&mut self, event: &TelemetryEvent) -> f64 {
        self.push("reward", event.reward, event.timestamp);
        if let Some(trade) = &event.trade {
            self.push("roi", trade.roi, event.timestamp);
            self.push("slippage_bps", trade.slippage_bps, event.timestamp);
        }
        self.score()
    }

    pub fn reports(&self) -> Vec<DriftReport> {
        self.features
            .iter()
            .filter(|f| f.is_ready())
            .map(|f| f.report(&self.thresholds))
            .collect()
    }

    /// Worst score across ready features; 0 until any feature is ready.
    pub fn score(&self) -> f64 {
        self.reports().iter().map(|r| r.score).fold(0.0, f64::max)
    }

    pub fn compute_overall(&mut self) -> DriftSeverity {
        let reports = self.reports();
        let severity = reports.iter().map(|r| r.severity).max().unwrap_or(DriftSeverity::None);
        if severity != self.overall_severity && severity >= DriftSeverity::Moderate {
            let worst = reports
                .iter()
                .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
            logging::warn(
                Domain::Training,
                "drift",
                &[
                    ("severity", v_str(&format!("{:?}", severity).to_lowercase())),
                    ("feature", worst.map(|r| v_str(&r.feature)).unwrap_or(serde_json::Value::Null)),
                    ("score", v_num(worst.map(|r| r.score).unwrap_or(0.0))),
                ],
            );
        }
        self.overall_severity = severity;
        severity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::TradeOutcome;

    #[test]
    fn test_rolling_window_evicts_and_tracks_mean() {
        let mut w = RollingWindow::new(5);
        for i in 1..=5 {
            w.push(i as f64);
        }
        assert!((w.mean() - 3.0).abs() < 1e-9);
        assert!((w.std() - stats::std_dev(&[1.0, 2.0, 3.0, 4.0, 5.0])).abs() < 1e-9);
        w.push(10.0);
        w.push(10.0);
        assert_eq!(w.len(), 5);
        // window is now 3, 4, 5, 10, 10
        assert!((w.mean() - 6.4).abs() < 1e-9);
        assert!((w.std() - stats::std_dev(&[3.0, 4.0, 5.0, 10.0, 10.0])).abs() < 1e-9);
    }

    #[test]
    fn test_stable_feature_has_no_drift() {
        let mut t = FeatureTracker::new("reward", 50, 10);
        for i in 0..100 {
            t.push(1.0 + ((i % 4) as f64 - 1.5) * 0.01);
        }
        let r = t.report(&DriftThresholds::default());
        assert!(r.severity <= DriftSeverity::Low, "{:?}", r);
    }

    #[test]
    fn test_shifted_feature_drifts() {
        let mut t = FeatureTracker::new("reward", 100, 10);
        for i in 0..100 {
            t.push(100.0 + (i % 5) as f64 - 2.5);
        }
        for _ in 0..10 {
            t.push(200.0);
        }
        let r = t.report(&DriftThresholds::default());
        assert!(r.recent_mean > 180.0);
        assert!(r.score > 1.0, "score={}", r.score);
    }

    #[test]
    fn test_sign_flip_counts_toward_psi() {
        let mut t = FeatureTracker::new("reward", 100, 10);
        for i in 0..100 {
            t.push(0.5 + ((i % 5) as f64 - 2.0) * 0.05);
        }
        for _ in 0..10 {
            t.push(-0.5);
        }
        let r = t.report(&DriftThresholds::default());
        assert!(r.recent_mean < 0.0 && r.baseline_mean > 0.0);
        assert!(r.psi > 1.0, "psi={}", r.psi);
        assert!(r.score >= 0.4 * r.psi);
    }

    #[test]
    fn test_observe_uses_trade_features() {
        let mut tracker = DriftTracker::new(20, 5);
        for i in 0..30u64 {
            let event = TelemetryEvent {
                timestamp: i,
                reward: 0.1,
                event_type: "trade".into(),
                session_id: None,
                trade: Some(TradeOutcome { roi: 0.01, notional: 1000.0, slippage_bps: 2.0 }),
                portfolio_state: None,
            };
            assert_eq!(tracker.observe(&event), 0.0);
        }
        assert_eq!(tracker.reports().len(), 3);
        assert_eq!(tracker.compute_overall(), DriftSeverity::None);

        let spike = TelemetryEvent {
            timestamp: 31,
            reward: 5.0,
            event_type: "trade".into(),
            session_id: None,
            trade: None,
            portfolio_state: None,
        };
        // constant baseline has zero std, so the mean shift cannot be scored
        assert!(tracker.observe(&spike).is_finite());
        assert_eq!(tracker.last_update_ts, 31);
    }
}
