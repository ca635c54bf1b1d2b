//! Ensemble regime detection.
//!
//! Independent classifiers each vote a label from the same `MarketState`;
//! the majority wins and ties go to the label of the earliest-registered
//! classifier that voted for one of the tied labels. A classifier missing
//! its inputs votes `Ranging` instead of failing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::logging;
use crate::market::MarketState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    TrendingBull,
    TrendingBear,
    Ranging,
    HighVolatility,
    LowVolatility,
    Crash,
    Rally,
}

impl Regime {
    pub const ALL: [Regime; 7] = [
        Regime::TrendingBull,
        Regime::TrendingBear,
        Regime::Ranging,
        Regime::HighVolatility,
        Regime::LowVolatility,
        Regime::Crash,
        Regime::Rally,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::TrendingBull => "trending_bull",
            Regime::TrendingBear => "trending_bear",
            Regime::Ranging => "ranging",
            Regime::HighVolatility => "high_volatility",
            Regime::LowVolatility => "low_volatility",
            Regime::Crash => "crash",
            Regime::Rally => "rally",
        }
    }

    pub fn parse(s: &str) -> Option<Regime> {
        Regime::ALL.iter().copied().find(|r| r.as_str() == s)
    }

    pub fn is_trending(&self) -> bool {
        matches!(self, Regime::TrendingBull | Regime::TrendingBear)
    }

    pub fn is_stressed(&self) -> bool {
        matches!(self, Regime::HighVolatility | Regime::Crash)
    }

    /// Normalized health contribution in [0, 1], 1 = benign.
    pub fn health_score(&self) -> f64 {
        match self {
            Regime::TrendingBull => 0.9,
            Regime::Rally => 0.8,
            Regime::LowVolatility => 0.8,
            Regime::Ranging => 0.6,
            Regime::TrendingBear => 0.4,
            Regime::HighVolatility => 0.3,
            Regime::Crash => 0.1,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Classifiers
// =============================================================================

/// Cumulative short-window return beyond which a volatile move is read as
/// a crash or rally.
const TREND_SHOCK: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub enum RegimeClassifier {
    /// Short-vs-long realized volatility ratio.
    VolatilityRatio { high: f64, low: f64 },
    /// Average pairwise cross-asset correlation.
    Correlation { high: f64, low: f64 },
    /// Signs of growth and inflation proxies.
    Macro,
}

impl RegimeClassifier {
    pub fn name(&self) -> &'static str {
        match self {
            RegimeClassifier::VolatilityRatio { .. } => "volatility_ratio",
            RegimeClassifier::Correlation { .. } => "correlation",
            RegimeClassifier::Macro => "macro",
        }
    }

    /// Whether the state carries the inputs this classifier needs.
    pub fn is_capable(&self, state: &MarketState) -> bool {
        match self {
            RegimeClassifier::VolatilityRatio { .. } => state.feature("vol_ratio").is_some(),
            RegimeClassifier::Correlation { .. } => state.feature("avg_correlation").is_some(),
            RegimeClassifier::Macro => {
                state.feature("growth").is_some() && state.feature("inflation").is_some()
            }
        }
    }

    pub fn classify(&self, state: &MarketState) -> Regime {
        if !self.is_capable(state) {
            return Regime::Ranging;
        }
        let trend = state.feature("trend").unwrap_or(0.0);
        match self {
            RegimeClassifier::VolatilityRatio { high, low } => {
                let ratio = state.feature("vol_ratio").unwrap_or(1.0);
                if ratio > *high {
                    if trend < -TREND_SHOCK {
                        Regime::Crash
                    } else if trend > TREND_SHOCK {
                        Regime::Rally
                    } else {
                        Regime::HighVolatility
                    }
                } else if ratio < *low {
                    Regime::LowVolatility
                } else {
                    Regime::Ranging
                }
            }
            RegimeClassifier::Correlation { high, low } => {
                let corr = state.feature("avg_correlation").unwrap_or(0.0);
                if corr > *high {
                    if trend < 0.0 {
                        Regime::TrendingBear
                    } else {
                        Regime::TrendingBull
                    }
                } else if corr < *low {
                    Regime::LowVolatility
                } else {
                    Regime::Ranging
                }
            }
            RegimeClassifier::Macro => {
                let growth = state.feature("growth").unwrap_or(0.0);
                let inflation = state.feature("inflation").unwrap_or(0.0);
                if growth > 0.0 {
                    Regime::TrendingBull
                } else if growth < 0.0 && inflation > 0.0 {
                    Regime::HighVolatility
                } else if growth < 0.0 {
                    Regime::TrendingBear
                } else {
                    Regime::Ranging
                }
            }
        }
    }
}

// =============================================================================
// Detector
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeVote {
    pub classifier: String,
    pub regime: Regime,
    pub capable: bool,
}

#[derive(Debug, Clone)]
pub struct RegimeDetector {
    classifiers: Vec<RegimeClassifier>,
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new(vec![
            RegimeClassifier::VolatilityRatio { high: 1.5, low: 0.5 },
            RegimeClassifier::Correlation { high: 0.7, low: 0.2 },
            RegimeClassifier::Macro,
        ])
    }
}

impl RegimeDetector {
    pub fn new(classifiers: Vec<RegimeClassifier>) -> Self {
        Self { classifiers }
    }

    pub fn classifiers(&self) -> &[RegimeClassifier] {
        &self.classifiers
    }

    pub fn votes(&self, state: &MarketState) -> Vec<RegimeVote> {
        self.classifiers
            .iter()
            .map(|c| RegimeVote {
                classifier: c.name().to_string(),
                regime: c.classify(state),
                capable: c.is_capable(state),
            })
            .collect()
    }

    pub fn classify(&self, state: &MarketState) -> Regime {
        self.classify_with_votes(state).0
    }

    /// One pass over the classifiers: the majority label plus the ballots behind it.
    pub fn classify_with_votes(&self, state: &MarketState) -> (Regime, Vec<RegimeVote>) {
        let votes = self.votes(state);
        let regime = majority(&votes);
        let pairs: Vec<(&str, &str)> = votes
            .iter()
            .map(|v| (v.classifier.as_str(), v.regime.as_str()))
            .collect();
        logging::log_regime_vote(regime.as_str(), &pairs);
        (regime, votes)
    }
}

/// Majority label; ties resolved by first appearance in registration order.
pub fn majority(votes: &[RegimeVote]) -> Regime {
    let mut tally: Vec<(Regime, usize)> = Vec::new();
    for v in votes {
        match tally.iter_mut().find(|(r, _)| *r == v.regime) {
            Some((_, n)) => *n += 1,
            None => tally.push((v.regime, 1)),
        }
    }
    let mut best: Option<(Regime, usize)> = None;
    for (regime, n) in tally {
        // strict > keeps the earliest-registered label on ties
        if best.map_or(true, |(_, b)| n > b) {
            best = Some((regime, n));
        }
    }
    best.map(|(r, _)| r).unwrap_or(Regime::Ranging)
}
