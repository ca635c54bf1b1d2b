//! Per-asset trading signals and their cross-strategy combination.
//!
//! Combination is order-dependent (running averages), so callers feed
//! strategies in a fixed order: alphabetical by strategy id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub asset: String,
    /// -1 = full short conviction, +1 = full long conviction
    pub direction: f64,
    pub confidence: f64,
    pub size: f64,
    pub strategy_id: String,
    pub hold_days: u32,
}

impl TradingSignal {
    pub fn new(asset: &str, direction: f64, confidence: f64, size: f64, strategy_id: &str, hold_days: u32) -> Self {
        Self {
            asset: asset.to_string(),
            direction: clamp_or_zero(direction, -1.0, 1.0),
            confidence: clamp_or_zero(confidence, 0.0, 1.0),
            size: clamp_or_zero(size, 0.0, f64::MAX),
            strategy_id: strategy_id.to_string(),
            hold_days,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.direction != 0.0 && self.confidence > 0.0 && self.size > 0.0
    }
}

fn clamp_or_zero(x: f64, lo: f64, hi: f64) -> f64 {
    if x.is_finite() {
        x.clamp(lo, hi)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedSignal {
    pub direction: f64,
    pub size: f64,
    pub confidence: f64,
    /// Accumulated combination weight
    pub weight: f64,
    pub strategies: Vec<String>,
}

/// Accumulates weighted signals per asset:
/// - direction: running weighted average
/// - size: weighted sum
/// - confidence: running weighted sum capped at 1
#[derive(Debug, Clone, Default)]
pub struct SignalCombiner {
    by_asset: BTreeMap<String, CombinedSignal>,
}

impl SignalCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, signal: &TradingSignal, weight: f64) {
        if !(weight.is_finite() && weight > 0.0) || !signal.is_actionable() {
            return;
        }
        let entry = self.by_asset.entry(signal.asset.clone()).or_default();
        let total = entry.weight + weight;
        entry.direction = (entry.direction * entry.weight + signal.direction * weight) / total;
        entry.weight = total;
        entry.size += weight * signal.size;
        entry.confidence = (entry.confidence + weight * signal.confidence).min(1.0);
        if !entry.strategies.contains(&signal.strategy_id) {
            entry.strategies.push(signal.strategy_id.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_asset.is_empty()
    }

    pub fn finish(self) -> BTreeMap<String, CombinedSignal> {
        self.by_asset
    }
}
