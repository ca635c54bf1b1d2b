//! Built-in analysis modules. Each reads one slice of the market data and
//! reports a typed output plus how much of its expected input it actually
//! had (`data_quality`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::registry::IntelligenceModule;
use super::{ModuleAnalysis, ModuleOutput};
use crate::config::RiskConfig;
use crate::error::{PipelineError, Result};
use crate::market::{MarketData, MarketState, LONG_WINDOW, SHORT_WINDOW};
use crate::regime::{Regime, RegimeDetector, RegimeVote};
use crate::risk::RiskMetricsEngine;
use crate::stats;

// =============================================================================
// Volatility
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityReport {
    /// Annualized realized volatility per asset
    pub per_asset: BTreeMap<String, f64>,
    pub short_vol: f64,
    pub long_vol: f64,
    pub vol_ratio: f64,
    /// "low" | "normal" | "high"
    pub regime: String,
    pub high_volatility: bool,
}

#[derive(Debug, Clone)]
pub struct VolatilityModule {
    pub high_ratio: f64,
    pub low_ratio: f64,
}

impl Default for VolatilityModule {
    fn default() -> Self {
        Self { high_ratio: 1.5, low_ratio: 0.5 }
    }
}

#[async_trait]
impl IntelligenceModule for VolatilityModule {
    fn name(&self) -> &str {
        "volatility"
    }

    async fn analyze(&self, data: &MarketData) -> Result<ModuleAnalysis> {
        let with_history = data.returns.values().filter(|r| r.len() >= 2).count();
        if with_history == 0 {
            return Err(PipelineError::DataUnavailable("no asset return history".into()));
        }
        let per_asset = data.realized_vols();
        let composite = data.composite_returns();
        let short_vol = stats::annualized_vol(stats::tail(&composite, SHORT_WINDOW));
        let long_vol = stats::annualized_vol(stats::tail(&composite, LONG_WINDOW));
        let vol_ratio = if long_vol > 1e-12 { short_vol / long_vol } else { 1.0 };
        let regime = if vol_ratio > self.high_ratio {
            "high"
        } else if vol_ratio < self.low_ratio {
            "low"
        } else {
            "normal"
        };
        let full = data.returns.values().filter(|r| r.len() >= SHORT_WINDOW).count();
        let data_quality = full as f64 / data.returns.len().max(1) as f64;

        Ok(ModuleAnalysis {
            output: ModuleOutput::Volatility(VolatilityReport {
                per_asset,
                short_vol,
                long_vol,
                vol_ratio,
                regime: regime.to_string(),
                high_volatility: vol_ratio > self.high_ratio,
            }),
            data_quality,
        })
    }
}

// =============================================================================
// Correlation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    /// Average pairwise correlation over the long window
    pub average: f64,
    /// Average pairwise correlation over the short window
    pub recent: f64,
    /// 1 - |recent - average|, in [0, 1]
    pub stability: f64,
    pub unstable: bool,
    pub pairs: usize,
}

#[derive(Debug, Clone)]
pub struct CorrelationModule {
    /// Stability below which the structure is flagged unstable
    pub min_stability: f64,
}

impl Default for CorrelationModule {
    fn default() -> Self {
        Self { min_stability: 0.7 }
    }
}

#[async_trait]
impl IntelligenceModule for CorrelationModule {
    fn name(&self) -> &str {
        "correlation"
    }

    async fn analyze(&self, data: &MarketData) -> Result<ModuleAnalysis> {
        let long: Vec<&[f64]> = data.returns.values().map(|r| stats::tail(r, LONG_WINDOW)).collect();
        let short: Vec<&[f64]> = data.returns.values().map(|r| stats::tail(r, SHORT_WINDOW)).collect();
        let average = stats::average_pairwise_correlation(&long)
            .ok_or_else(|| PipelineError::DataUnavailable("need two assets with overlapping returns".into()))?;
        let recent = stats::average_pairwise_correlation(&short).unwrap_or(average);
        let stability = (1.0 - (recent - average).abs()).clamp(0.0, 1.0);
        let n = data.returns.len();
        let pairs = n * n.saturating_sub(1) / 2;
        let deep = data.returns.values().filter(|r| r.len() >= LONG_WINDOW).count();

        Ok(ModuleAnalysis {
            output: ModuleOutput::Correlation(CorrelationReport {
                average,
                recent,
                stability,
                unstable: stability < self.min_stability,
                pairs,
            }),
            data_quality: (deep as f64 / n.max(1) as f64).max(0.5),
        })
    }
}

// =============================================================================
// Regime
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeReport {
    pub regime: Regime,
    pub votes: Vec<RegimeVote>,
}

#[derive(Debug, Clone, Default)]
pub struct RegimeModule {
    detector: RegimeDetector,
}

impl RegimeModule {
    pub fn new(detector: RegimeDetector) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl IntelligenceModule for RegimeModule {
    fn name(&self) -> &str {
        "regime"
    }

    async fn analyze(&self, data: &MarketData) -> Result<ModuleAnalysis> {
        let state = MarketState::from_market(data);
        let (regime, votes) = self.detector.classify_with_votes(&state);
        let capable = votes.iter().filter(|v| v.capable).count();
        let data_quality = capable as f64 / votes.len().max(1) as f64;
        Ok(ModuleAnalysis {
            output: ModuleOutput::Regime(RegimeReport { regime, votes }),
            data_quality,
        })
    }
}

// =============================================================================
// Liquidity
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityReport {
    /// 1 = deep, 0 = no liquidity
    pub score: f64,
    pub avg_spread_bps: f64,
    pub total_volume: f64,
    /// "deep" | "normal" | "thin"
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct LiquidityModule {
    /// Spread at which the per-asset score reaches zero
    pub max_spread_bps: f64,
}

impl Default for LiquidityModule {
    fn default() -> Self {
        Self { max_spread_bps: 100.0 }
    }
}

#[async_trait]
impl IntelligenceModule for LiquidityModule {
    fn name(&self) -> &str {
        "liquidity"
    }

    async fn analyze(&self, data: &MarketData) -> Result<ModuleAnalysis> {
        let spreads: Vec<f64> = data
            .spreads_bps
            .values()
            .copied()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .collect();
        if spreads.is_empty() {
            return Err(PipelineError::DataUnavailable("no spread data".into()));
        }
        let avg_spread_bps = stats::mean(&spreads);
        let score = stats::mean(
            &spreads
                .iter()
                .map(|s| (1.0 - s / self.max_spread_bps).clamp(0.0, 1.0))
                .collect::<Vec<_>>(),
        );
        let label = if avg_spread_bps < 10.0 {
            "deep"
        } else if avg_spread_bps < 50.0 {
            "normal"
        } else {
            "thin"
        };
        let assets = data.assets().len().max(spreads.len());
        Ok(ModuleAnalysis {
            output: ModuleOutput::Liquidity(LiquidityReport {
                score,
                avg_spread_bps,
                total_volume: data.volumes.values().filter(|v| v.is_finite()).sum(),
                label: label.to_string(),
            }),
            data_quality: spreads.len() as f64 / assets as f64,
        })
    }
}

// =============================================================================
// Funding
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingOpportunity {
    pub asset: String,
    pub rate: f64,
    /// "short_perp" when longs pay, "long_perp" when shorts pay
    pub side: String,
    /// Rate × 3 fundings/day × 365
    pub annualized: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingReport {
    pub opportunities: Vec<FundingOpportunity>,
    pub mean_rate: f64,
}

#[derive(Debug, Clone)]
pub struct FundingModule {
    threshold: f64,
}

impl FundingModule {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl IntelligenceModule for FundingModule {
    fn name(&self) -> &str {
        "funding"
    }

    async fn analyze(&self, data: &MarketData) -> Result<ModuleAnalysis> {
        let rates: Vec<(&String, f64)> = data
            .funding_rates
            .iter()
            .filter(|(_, r)| r.is_finite())
            .map(|(a, r)| (a, *r))
            .collect();
        if rates.is_empty() {
            return Err(PipelineError::DataUnavailable("no funding rates".into()));
        }
        let opportunities = rates
            .iter()
            .filter(|(_, r)| r.abs() >= self.threshold)
            .map(|(asset, rate)| FundingOpportunity {
                asset: asset.to_string(),
                rate: *rate,
                side: if *rate > 0.0 { "short_perp" } else { "long_perp" }.to_string(),
                annualized: rate * 3.0 * 365.0,
            })
            .collect();
        let mean_rate = rates.iter().map(|(_, r)| r).sum::<f64>() / rates.len() as f64;
        Ok(ModuleAnalysis {
            output: ModuleOutput::Funding(FundingReport { opportunities, mean_rate }),
            data_quality: 1.0,
        })
    }
}

// =============================================================================
// Risk
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPosture {
    pub var_95: f64,
    pub cvar_95: f64,
    pub cvar_99: f64,
    pub volatility: f64,
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub herfindahl: Option<f64>,
    pub observations: usize,
    /// "defensive" | "neutral" | "aggressive"
    pub posture: String,
}

/// Owns the pipeline-side RiskMetricsEngine; the mutex is the single-writer
/// boundary since the module runs inside a spawned task.
#[derive(Debug)]
pub struct RiskModule {
    engine: Mutex<RiskMetricsEngine>,
    target_var: f64,
    drawdown_limit: f64,
}

impl RiskModule {
    pub fn new(cfg: RiskConfig, target_var: f64, drawdown_limit: f64) -> Self {
        Self {
            engine: Mutex::new(RiskMetricsEngine::new(cfg)),
            target_var,
            drawdown_limit,
        }
    }
}

#[async_trait]
impl IntelligenceModule for RiskModule {
    fn name(&self) -> &str {
        "risk"
    }

    async fn analyze(&self, data: &MarketData) -> Result<ModuleAnalysis> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| PipelineError::module("risk", "risk engine lock poisoned"))?;
        engine.ingest(data);
        if engine.observations() == 0 {
            return Err(PipelineError::DataUnavailable("no portfolio returns".into()));
        }
        let snap = engine.snapshot(
            data.leverage.unwrap_or(1.0),
            data.positions.as_ref(),
            data.portfolio_value,
        );
        let posture = if snap.max_drawdown.abs() > self.drawdown_limit || snap.var_95.abs() > self.target_var {
            "defensive"
        } else if snap.sharpe > 1.0 {
            "aggressive"
        } else {
            "neutral"
        };
        let data_quality = (snap.observations as f64 / LONG_WINDOW as f64).min(1.0);
        Ok(ModuleAnalysis {
            output: ModuleOutput::Risk(RiskPosture {
                var_95: snap.var_95,
                cvar_95: snap.cvar_95,
                cvar_99: snap.cvar_99,
                volatility: snap.volatility,
                current_drawdown: snap.current_drawdown,
                max_drawdown: snap.max_drawdown,
                sharpe: snap.sharpe,
                herfindahl: snap.concentration.map(|c| c.herfindahl),
                observations: snap.observations,
                posture: posture.to_string(),
            }),
            data_quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_market() -> MarketData {
        let mut data = MarketData { timestamp: 1, ..Default::default() };
        let a: Vec<f64> = (0..80).map(|i| ((i * 7 % 11) as f64 - 5.0) / 500.0).collect();
        let b: Vec<f64> = a.iter().map(|x| x * 0.8 + 0.0005).collect();
        data.returns.insert("A".into(), a);
        data.returns.insert("B".into(), b);
        data.spreads_bps.insert("A".into(), 5.0);
        data.spreads_bps.insert("B".into(), 15.0);
        data.funding_rates.insert("A".into(), 0.0004);
        data.funding_rates.insert("B".into(), 0.00002);
        data.portfolio_returns = (0..30).map(|i| if i % 3 == 0 { -0.01 } else { 0.006 }).collect();
        data
    }

    #[tokio::test]
    async fn test_volatility_module_reports_ratio() {
        let out = VolatilityModule::default().analyze(&sample_market()).await.unwrap();
        match out.output {
            ModuleOutput::Volatility(v) => {
                assert_eq!(v.per_asset.len(), 2);
                assert!(v.vol_ratio > 0.0);
            }
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(out.data_quality, 1.0);
    }

    #[tokio::test]
    async fn test_volatility_module_without_returns_fails() {
        let err = VolatilityModule::default().analyze(&MarketData::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_correlation_of_linked_assets_is_high() {
        let out = CorrelationModule::default().analyze(&sample_market()).await.unwrap();
        match out.output {
            ModuleOutput::Correlation(c) => {
                assert!(c.average > 0.99, "avg={}", c.average);
                assert!(!c.unstable);
                assert_eq!(c.pairs, 1);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_liquidity_score_and_label() {
        let out = LiquidityModule::default().analyze(&sample_market()).await.unwrap();
        match out.output {
            ModuleOutput::Liquidity(l) => {
                assert!((l.avg_spread_bps - 10.0).abs() < 1e-12);
                assert!((l.score - 0.9).abs() < 1e-12);
                assert_eq!(l.label, "normal");
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_funding_flags_only_large_rates() {
        let out = FundingModule::new(0.0001).analyze(&sample_market()).await.unwrap();
        match out.output {
            ModuleOutput::Funding(f) => {
                assert_eq!(f.opportunities.len(), 1);
                assert_eq!(f.opportunities[0].asset, "A");
                assert_eq!(f.opportunities[0].side, "short_perp");
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_regime_module_label_matches_its_votes() {
        let mut data = sample_market();
        data.macro_indicators = Some(crate::market::MacroIndicators { growth: 1.0, inflation: 0.5 });
        let out = RegimeModule::default().analyze(&data).await.unwrap();
        match out.output {
            ModuleOutput::Regime(r) => {
                assert_eq!(r.votes.len(), 3);
                assert_eq!(r.regime, crate::regime::majority(&r.votes));
                assert!(r.votes.iter().any(|v| v.classifier == "macro" && v.regime == Regime::TrendingBull));
            }
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(out.data_quality, 1.0);
    }

    #[tokio::test]
    async fn test_risk_module_accumulates_history() {
        let module = RiskModule::new(RiskConfig::default(), 0.02, 0.2);
        let mut data = sample_market();
        module.analyze(&data).await.unwrap();
        data.timestamp = 2;
        data.portfolio_returns.push(0.004);
        let out = module.analyze(&data).await.unwrap();
        match out.output {
            ModuleOutput::Risk(r) => {
                assert_eq!(r.observations, 31);
                assert!(r.cvar_95 <= r.var_95);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }
}
