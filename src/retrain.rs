//! Drift-triggered retraining decisions.
//!
//! Pure decision over a `PerformanceSnapshot` and a cooldown clock. All
//! matching reasons are reported together; after a trigger nothing fires
//! again until the cooldown has elapsed, whatever the severity.

use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::logging;
use crate::training::PerformanceSnapshot;

pub const REASON_REWARD: &str = "reward_below_threshold";
pub const REASON_WIN_RATE: &str = "win_rate_below_threshold";
pub const REASON_DRIFT: &str = "drift_above_threshold";
pub const REASON_BUFFER: &str = "buffer_below_minimum";

#[derive(Debug, Clone, PartialEq)]
pub struct RetrainThresholds {
    pub min_reward_avg: f64,
    pub min_win_rate: f64,
    pub max_drift_score: f64,
    pub min_buffer_size: usize,
}

impl From<&SchedulerConfig> for RetrainThresholds {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            min_reward_avg: cfg.min_reward_avg,
            min_win_rate: cfg.min_win_rate,
            max_drift_score: cfg.max_drift_score,
            min_buffer_size: cfg.min_buffer_size,
        }
    }
}

impl RetrainThresholds {
    pub fn violations(&self, s: &PerformanceSnapshot) -> Vec<String> {
        let mut reasons = Vec::new();
        if s.reward_avg < self.min_reward_avg {
            reasons.push(REASON_REWARD.to_string());
        }
        if s.win_rate < self.min_win_rate {
            reasons.push(REASON_WIN_RATE.to_string());
        }
        if s.drift_score > self.max_drift_score {
            reasons.push(REASON_DRIFT.to_string());
        }
        if s.buffer_size < self.min_buffer_size {
            reasons.push(REASON_BUFFER.to_string());
        }
        reasons
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainDecision {
    pub triggered: bool,
    /// Every threshold the snapshot violated
    pub reasons: Vec<String>,
    /// Violations existed but the cooldown held the trigger back
    pub suppressed: bool,
    pub timestamp: u64,
}

impl RetrainDecision {
    pub fn reason(&self) -> String {
        self.reasons.join(",")
    }
}

pub type RetrainCallback = Box<dyn FnMut(&RetrainDecision, &PerformanceSnapshot) + Send>;

pub struct AutoRetrainScheduler {
    thresholds: RetrainThresholds,
    cooldown_ms: u64,
    last_trigger: Option<u64>,
    callback: Option<RetrainCallback>,
    triggers: u64,
}

impl AutoRetrainScheduler {
    pub fn new(cfg: &SchedulerConfig) -> Self {
        Self {
            thresholds: cfg.into(),
            cooldown_ms: cfg.cooldown_minutes.saturating_mul(60_000),
            last_trigger: None,
            callback: None,
            triggers: 0,
        }
    }

    pub fn on_retrain(&mut self, callback: RetrainCallback) {
        self.callback = Some(callback);
    }

    pub fn thresholds(&self) -> &RetrainThresholds {
        &self.thresholds
    }

    pub fn trigger_count(&self) -> u64 {
        self.triggers
    }

    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        self.last_trigger
            .map(|t| now_ms < t.saturating_add(self.cooldown_ms))
            .unwrap_or(false)
    }

    /// Decide for one snapshot. The callback receives the decision and the
    /// snapshot together, and only when a retrain actually triggers.
    pub fn evaluate(&mut self, snapshot: &PerformanceSnapshot, now_ms: u64) -> RetrainDecision {
        let reasons = self.thresholds.violations(snapshot);
        let cooling = self.in_cooldown(now_ms);
        let decision = RetrainDecision {
            triggered: !reasons.is_empty() && !cooling,
            suppressed: !reasons.is_empty() && cooling,
            reasons,
            timestamp: now_ms,
        };
        logging::log_retrain(decision.triggered, &decision.reasons, snapshot.policy_version);

        if decision.triggered {
            self.last_trigger = Some(now_ms);
            self.triggers += 1;
            if let Some(cb) = self.callback.as_mut() {
                cb(&decision, snapshot);
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn healthy() -> PerformanceSnapshot {
        PerformanceSnapshot {
            reward_avg: 0.2,
            win_rate: 0.6,
            drift_score: 0.5,
            buffer_size: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_healthy_snapshot_does_not_trigger() {
        let mut s = AutoRetrainScheduler::new(&SchedulerConfig::default());
        let d = s.evaluate(&healthy(), 0);
        assert!(!d.triggered);
        assert!(!d.suppressed);
        assert!(d.reasons.is_empty());
    }

    #[test]
    fn test_all_reasons_reported_jointly() {
        let mut s = AutoRetrainScheduler::new(&SchedulerConfig::default());
        let bad = PerformanceSnapshot {
            reward_avg: -0.1,
            win_rate: 0.2,
            drift_score: 5.0,
            buffer_size: 3,
            ..Default::default()
        };
        let d = s.evaluate(&bad, 1_000);
        assert!(d.triggered);
        assert_eq!(d.reasons, vec![REASON_REWARD, REASON_WIN_RATE, REASON_DRIFT, REASON_BUFFER]);
        assert_eq!(d.reason(), "reward_below_threshold,win_rate_below_threshold,drift_above_threshold,buffer_below_minimum");
    }

    #[test]
    fn test_cooldown_allows_exactly_one_trigger() {
        let cfg = SchedulerConfig { cooldown_minutes: 10, ..Default::default() };
        let mut s = AutoRetrainScheduler::new(&cfg);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        s.on_retrain(Box::new(move |d: &RetrainDecision, snap: &PerformanceSnapshot| {
            sink.lock().unwrap().push((d.clone(), snap.drift_score));
        }));

        let bad = PerformanceSnapshot { drift_score: 9.0, ..healthy() };
        assert!(s.evaluate(&bad, 0).triggered);
        let second = s.evaluate(&bad, 5 * 60_000);
        assert!(!second.triggered);
        assert!(second.suppressed);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].1, 9.0);

        // cooldown elapsed
        assert!(s.evaluate(&bad, 10 * 60_000).triggered);
        assert_eq!(s.trigger_count(), 2);
    }
}
