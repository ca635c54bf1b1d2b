//! Cross-module aggregation: insight rules, composite market health,
//! rolling meta-confidence and the unified signal view.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::modules::{FundingOpportunity, RiskPosture};
use super::{ModuleOutput, ModuleResult};
use crate::config::OrchestratorConfig;
use crate::regime::Regime;
use crate::stats;

/// Meta-confidence assigned to a module that errored or timed out.
pub const FAILED_CONFIDENCE: f64 = 0.1;
const MIN_CONFIDENCE: f64 = 0.05;

/// Health sub-score used for a component whose module did not report.
const MISSING_COMPONENT: f64 = 0.5;

const HEALTH_WEIGHTS: [(&str, f64); 4] = [
    ("volatility", 0.30),
    ("correlation", 0.25),
    ("regime", 0.25),
    ("liquidity", 0.20),
];

fn output<'a>(results: &'a BTreeMap<String, ModuleResult>, module: &str) -> Option<&'a ModuleOutput> {
    results.get(module).and_then(|r| r.output())
}

// =============================================================================
// Insights
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: String,
    pub action: String,
    pub modules: Vec<String>,
    pub detail: String,
}

impl Insight {
    fn new(kind: &str, action: &str, modules: &[&str], detail: String) -> Self {
        Self {
            kind: kind.to_string(),
            action: action.to_string(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
            detail,
        }
    }
}

/// Deterministic threshold rules over pairs of module outputs. Rules whose
/// inputs are missing simply do not fire.
pub fn derive_insights(results: &BTreeMap<String, ModuleResult>) -> Vec<Insight> {
    let vol = match output(results, "volatility") {
        Some(ModuleOutput::Volatility(v)) => Some(v),
        _ => None,
    };
    let corr = match output(results, "correlation") {
        Some(ModuleOutput::Correlation(c)) => Some(c),
        _ => None,
    };
    let regime = match output(results, "regime") {
        Some(ModuleOutput::Regime(r)) => Some(r.regime),
        _ => None,
    };
    let liq = match output(results, "liquidity") {
        Some(ModuleOutput::Liquidity(l)) => Some(l),
        _ => None,
    };
    let funding = match output(results, "funding") {
        Some(ModuleOutput::Funding(f)) => Some(f),
        _ => None,
    };
    let risk = match output(results, "risk") {
        Some(ModuleOutput::Risk(r)) => Some(r),
        _ => None,
    };

    let mut out = Vec::new();

    if let (Some(v), Some(c)) = (vol, corr) {
        if v.high_volatility && c.unstable {
            out.push(Insight::new(
                "market_stress_signal",
                "reduce_exposure",
                &["volatility", "correlation"],
                format!("vol ratio {:.2} with correlation stability {:.2}", v.vol_ratio, c.stability),
            ));
        }
    }

    if let (Some(r), Some(v)) = (regime, vol) {
        if r.is_trending() && !v.high_volatility {
            out.push(Insight::new(
                "trend_continuation",
                "follow_trend",
                &["regime", "volatility"],
                format!("{} under {} volatility", r, v.regime),
            ));
        }
    }

    if let (Some(f), Some(l)) = (funding, liq) {
        if !f.opportunities.is_empty() && l.label != "thin" {
            out.push(Insight::new(
                "carry_opportunity",
                "harvest_funding",
                &["funding", "liquidity"],
                format!("{} funding opportunities, spreads {:.1}bps", f.opportunities.len(), l.avg_spread_bps),
            ));
        }
    }

    if let (Some(l), Some(v)) = (liq, vol) {
        if l.label == "thin" && v.high_volatility {
            out.push(Insight::new(
                "liquidity_risk",
                "tighten_limits",
                &["liquidity", "volatility"],
                format!("thin book ({:.1}bps) during a volatility spike", l.avg_spread_bps),
            ));
        }
    }

    if let (Some(c), Some(r)) = (corr, regime) {
        if c.average < 0.3 && !r.is_stressed() {
            out.push(Insight::new(
                "diversification_opportunity",
                "rebalance",
                &["correlation", "regime"],
                format!("average correlation {:.2} in {}", c.average, r),
            ));
        }
    }

    if let (Some(p), Some(r)) = (risk, regime) {
        if p.posture == "defensive" && r.is_stressed() {
            out.push(Insight::new(
                "capital_preservation",
                "de_risk",
                &["risk", "regime"],
                format!("defensive posture (var95 {:.4}) in {}", p.var_95, r),
            ));
        }
    }

    out
}

// =============================================================================
// Market health
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBucket {
    Healthy,
    Moderate,
    Stressed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketHealth {
    pub score: f64,
    pub bucket: HealthBucket,
    pub components: BTreeMap<String, f64>,
}

fn health_component(results: &BTreeMap<String, ModuleResult>, module: &str) -> f64 {
    match output(results, module) {
        Some(ModuleOutput::Volatility(v)) => match v.regime.as_str() {
            "high" => 0.2,
            "low" => 0.9,
            _ => 0.7,
        },
        Some(ModuleOutput::Correlation(c)) => c.stability,
        Some(ModuleOutput::Regime(r)) => r.regime.health_score(),
        Some(ModuleOutput::Liquidity(l)) => l.score,
        _ => MISSING_COMPONENT,
    }
}

pub fn market_health(results: &BTreeMap<String, ModuleResult>, cfg: &OrchestratorConfig) -> MarketHealth {
    let components: BTreeMap<String, f64> = HEALTH_WEIGHTS
        .iter()
        .map(|(module, _)| (module.to_string(), health_component(results, module).clamp(0.0, 1.0)))
        .collect();
    let score: f64 = HEALTH_WEIGHTS
        .iter()
        .map(|(module, w)| w * components.get(*module).copied().unwrap_or(MISSING_COMPONENT))
        .sum();
    let bucket = if score >= cfg.healthy_threshold {
        HealthBucket::Healthy
    } else if score >= cfg.moderate_threshold {
        HealthBucket::Moderate
    } else {
        HealthBucket::Stressed
    };
    MarketHealth { score, bucket, components }
}

// =============================================================================
// Meta-confidence
// =============================================================================

/// Per-module success history; stability is the success fraction of the
/// retained window.
#[derive(Debug, Clone)]
pub struct MetaConfidenceTracker {
    capacity: usize,
    outcomes: BTreeMap<String, VecDeque<bool>>,
    scores: BTreeMap<String, VecDeque<f64>>,
}

impl MetaConfidenceTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: BTreeMap::new(),
            scores: BTreeMap::new(),
        }
    }

    pub fn stability(&self, module: &str) -> f64 {
        match self.outcomes.get(module) {
            Some(h) if !h.is_empty() => h.iter().filter(|ok| **ok).count() as f64 / h.len() as f64,
            _ => 1.0,
        }
    }

    pub fn history(&self, module: &str) -> Vec<f64> {
        self.scores.get(module).map(|h| h.iter().copied().collect()).unwrap_or_default()
    }

    /// Record this cycle's outcomes and return the per-module confidence.
    pub fn update(&mut self, results: &BTreeMap<String, ModuleResult>) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (module, result) in results {
            let outcomes = self.outcomes.entry(module.clone()).or_default();
            if outcomes.len() >= self.capacity {
                outcomes.pop_front();
            }
            outcomes.push_back(result.is_ok());

            let confidence = if result.is_ok() {
                (self.stability(module) * result.data_quality()).clamp(MIN_CONFIDENCE, 1.0)
            } else {
                FAILED_CONFIDENCE
            };

            let scores = self.scores.entry(module.clone()).or_default();
            if scores.len() >= self.capacity {
                scores.pop_front();
            }
            scores.push_back(confidence);
            out.insert(module.clone(), confidence);
        }
        out
    }
}

// =============================================================================
// Unified signals
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedSignals {
    pub regime: Option<Regime>,
    pub high_volatility: bool,
    pub funding_opportunities: Vec<FundingOpportunity>,
    pub risk: Option<RiskPosture>,
    /// Mean meta-confidence across modules
    pub overall_confidence: f64,
}

pub fn unify(results: &BTreeMap<String, ModuleResult>, meta: &BTreeMap<String, f64>) -> UnifiedSignals {
    let mut unified = UnifiedSignals::default();
    for result in results.values() {
        match result.output() {
            Some(ModuleOutput::Regime(r)) => unified.regime = Some(r.regime),
            Some(ModuleOutput::Volatility(v)) => unified.high_volatility = v.high_volatility,
            Some(ModuleOutput::Funding(f)) => unified.funding_opportunities = f.opportunities.clone(),
            Some(ModuleOutput::Risk(p)) => unified.risk = Some(p.clone()),
            _ => {}
        }
    }
    let confidences: Vec<f64> = meta.values().copied().collect();
    unified.overall_confidence = stats::mean(&confidences);
    unified
}
