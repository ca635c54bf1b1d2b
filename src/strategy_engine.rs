//! Regime-aware portfolio construction.
//!
//! Pipeline per call:
//! 1. Regime from the bundle, else the detector
//! 2. Confidence multiplier per strategy from its driver module
//! 3. Combine suitable strategies' signals (alphabetical by id)
//! 4. Risk scale from VaR / CVaR / drawdown budgets
//! 5. Raw positions
//! 6. Inverse-volatility reallocation
//! 7. Leverage and VaR shrink
//! 8. Hard position limits from the risk engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{RiskConfig, StrategyEngineConfig};
use crate::intel::IntelligenceBundle;
use crate::logging::{self, v_num, v_str, Domain};
use crate::market::{MarketData, MarketState};
use crate::regime::{Regime, RegimeDetector};
use crate::risk::RiskMetricsEngine;
use crate::signals::SignalCombiner;
use crate::strategies::{StrategyAllocator, StrategyUniverse};

const MIN_RISK_SCALE: f64 = 0.05;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetadata {
    pub regime: Option<Regime>,
    /// "intelligence" or "detector"
    pub regime_source: String,
    pub strategy_weights: BTreeMap<String, f64>,
    pub confidence_multipliers: BTreeMap<String, f64>,
    pub global_confidence: f64,
    pub risk_scale: f64,
    pub gross_exposure: f64,
    pub leverage_scaled: bool,
    pub var_scaled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub positions: BTreeMap<String, f64>,
    pub metadata: PortfolioMetadata,
}

impl Portfolio {
    pub fn gross_exposure(&self) -> f64 {
        self.positions.values().map(|w| w.abs()).sum()
    }
}

/// min over the VaR, CVaR and drawdown budgets, clamped to [0.05, 1].
pub fn risk_scale(var_95: f64, cvar_99: f64, max_drawdown: f64, cfg: &StrategyEngineConfig) -> f64 {
    let mut scale: f64 = 1.0;
    if var_95.abs() > 1e-12 {
        scale = scale.min(cfg.target_var / var_95.abs());
    }
    if cvar_99.abs() > 1e-12 {
        scale = scale.min(1.5 * cfg.target_var / cvar_99.abs());
    }
    if max_drawdown.abs() > cfg.drawdown_limit {
        scale = scale.min(cfg.drawdown_limit / max_drawdown.abs());
    }
    if scale.is_finite() {
        scale.clamp(MIN_RISK_SCALE, 1.0)
    } else {
        1.0
    }
}

pub struct StrategyEngine {
    cfg: StrategyEngineConfig,
    detector: RegimeDetector,
    universe: StrategyUniverse,
    allocator: StrategyAllocator,
    risk: RiskMetricsEngine,
}

impl StrategyEngine {
    pub fn new(cfg: StrategyEngineConfig, risk_cfg: RiskConfig) -> Self {
        Self {
            cfg,
            detector: RegimeDetector::default(),
            universe: StrategyUniverse::default(),
            allocator: StrategyAllocator::default(),
            risk: RiskMetricsEngine::new(risk_cfg),
        }
    }

    pub fn with_universe(mut self, universe: StrategyUniverse) -> Self {
        self.universe = universe;
        self
    }

    pub fn with_allocator(mut self, allocator: StrategyAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_detector(mut self, detector: RegimeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn risk_engine(&self) -> &RiskMetricsEngine {
        &self.risk
    }

    pub fn generate_portfolio(&mut self, data: &MarketData, bundle: Option<&IntelligenceBundle>) -> Portfolio {
        self.risk.ingest(data);

        let (regime, regime_source) = match bundle.and_then(|b| b.regime()) {
            Some(r) => (r, "intelligence"),
            None => (self.detector.classify(&MarketState::from_market(data)), "detector"),
        };
        let mut metadata = PortfolioMetadata {
            regime: Some(regime),
            regime_source: regime_source.to_string(),
            ..Default::default()
        };

        let global = match bundle {
            Some(b) => b.unified.overall_confidence.clamp(MIN_RISK_SCALE, 1.0),
            None => self.cfg.default_confidence,
        };
        metadata.global_confidence = global;

        let suitable = self.universe.suitable(regime);
        if suitable.is_empty() {
            logging::info(Domain::Strategy, "no_suitable_strategies", &[("regime", v_str(regime.as_str()))]);
            return Portfolio { positions: BTreeMap::new(), metadata };
        }

        // allocation weight × driver confidence, renormalized
        let alloc = self.allocator.allocate(regime, &suitable);
        let mut weights: Vec<_> = suitable
            .iter()
            .map(|s| {
                let multiplier = bundle
                    .and_then(|b| b.confidence(s.driver_module()))
                    .unwrap_or(global)
                    .clamp(MIN_RISK_SCALE, 1.0);
                metadata.confidence_multipliers.insert(s.id().to_string(), multiplier);
                (*s, alloc.get(s).copied().unwrap_or(0.0) * multiplier)
            })
            .collect();
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if total > 0.0 {
            for (_, w) in weights.iter_mut() {
                *w /= total;
            }
        }

        let mut combiner = SignalCombiner::new();
        for (strategy, weight) in &weights {
            metadata.strategy_weights.insert(strategy.id().to_string(), *weight);
            for signal in strategy.generate(data, &self.universe.config) {
                combiner.add(&signal, *weight);
            }
        }
        if combiner.is_empty() {
            logging::debug(Domain::Strategy, "no_signals", &[("regime", v_str(regime.as_str()))]);
            return Portfolio { positions: BTreeMap::new(), metadata };
        }

        let scale = match bundle.and_then(|b| b.unified.risk.as_ref()) {
            Some(p) => risk_scale(p.var_95, p.cvar_99, p.max_drawdown, &self.cfg),
            None => {
                let snap = self.risk.latest();
                risk_scale(snap.var_95, snap.cvar_99, snap.max_drawdown, &self.cfg)
            }
        };
        metadata.risk_scale = scale;

        let raw: BTreeMap<String, f64> = combiner
            .finish()
            .into_iter()
            .map(|(asset, c)| (asset, c.size * c.direction * c.confidence * global * scale))
            .filter(|(_, w)| w.is_finite() && *w != 0.0)
            .collect();

        let mut positions = self.risk_parity(&raw, data, bundle);

        let gross: f64 = positions.values().map(|w| w.abs()).sum();
        if gross > self.cfg.max_leverage {
            shrink(&mut positions, self.cfg.max_leverage / gross);
            metadata.leverage_scaled = true;
        }
        // daily VaR against the annualized target: only extreme tails trip this
        let var_95 = self.risk.latest().var_95.abs();
        if var_95 > self.cfg.target_volatility {
            shrink(&mut positions, self.cfg.target_volatility / var_95);
            metadata.var_scaled = true;
        }

        self.risk.position_limits().apply(&mut positions);
        positions.retain(|_, w| *w != 0.0);
        metadata.gross_exposure = positions.values().map(|w| w.abs()).sum();

        logging::info(
            Domain::Strategy,
            "portfolio",
            &[
                ("regime", v_str(regime.as_str())),
                ("positions", v_num(positions.len() as f64)),
                ("gross", v_num(metadata.gross_exposure)),
                ("risk_scale", v_num(scale)),
                ("confidence", v_num(global)),
            ],
        );

        Portfolio { positions, metadata }
    }

    /// Redistribute total raw exposure in proportion to 1/vol, keeping each
    /// asset's sign and clipping to ±max_allocation.
    fn risk_parity(
        &self,
        raw: &BTreeMap<String, f64>,
        data: &MarketData,
        bundle: Option<&IntelligenceBundle>,
    ) -> BTreeMap<String, f64> {
        let intel_vols = bundle.and_then(|b| b.volatility()).map(|v| &v.per_asset);
        let market_vols = data.realized_vols();
        let vol_of = |asset: &str| -> f64 {
            intel_vols
                .and_then(|v| v.get(asset))
                .or_else(|| market_vols.get(asset))
                .copied()
                .filter(|v| v.is_finite() && *v > 1e-9)
                .unwrap_or(self.cfg.default_volatility)
        };

        let total_raw: f64 = raw.values().map(|w| w.abs()).sum();
        let inv: BTreeMap<&String, f64> = raw.keys().map(|a| (a, 1.0 / vol_of(a))).collect();
        let inv_sum: f64 = inv.values().sum();
        if inv_sum <= 0.0 {
            return raw.clone();
        }
        raw.iter()
            .map(|(asset, w)| {
                let share = inv.get(asset).copied().unwrap_or(0.0) / inv_sum;
                let target = (share * total_raw * w.signum()).clamp(-self.cfg.max_allocation, self.cfg.max_allocation);
                (asset.clone(), target)
            })
            .collect()
    }
}

fn shrink(positions: &mut BTreeMap<String, f64>, k: f64) {
    for w in positions.values_mut() {
        *w *= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MacroIndicators;
    use crate::strategies::{StrategyConfig, StrategyKind};

    fn engine() -> StrategyEngine {
        StrategyEngine::new(StrategyEngineConfig::default(), RiskConfig::default())
    }

    fn bull_market() -> MarketData {
        let wiggle = |drift: f64| -> Vec<f64> {
            (0..60).map(|i| drift + if i % 2 == 0 { 0.002 } else { -0.002 }).collect()
        };
        let mut data = MarketData {
            timestamp: 10,
            macro_indicators: Some(MacroIndicators { growth: 1.0, inflation: 0.5 }),
            ..Default::default()
        };
        data.returns.insert("A".into(), wiggle(0.01));
        data.returns.insert("B".into(), wiggle(0.008));
        data
    }

    #[test]
    fn test_no_suitable_strategy_gives_empty_map() {
        let mut e = engine().with_universe(StrategyUniverse::new(vec![StrategyKind::Defensive], StrategyConfig::default()));
        // no inputs -> every classifier votes ranging; defensive does not trade ranging
        let p = e.generate_portfolio(&MarketData::default(), None);
        assert!(p.positions.is_empty());
        assert_eq!(p.metadata.regime, Some(Regime::Ranging));
        assert_eq!(p.metadata.regime_source, "detector");
    }

    #[test]
    fn test_bull_market_goes_long_within_limits() {
        let mut e = engine();
        let p = e.generate_portfolio(&bull_market(), None);
        assert_eq!(p.metadata.regime, Some(Regime::TrendingBull));
        assert_eq!(p.positions.len(), 2, "{:?}", p.positions);
        for (asset, w) in &p.positions {
            assert!(*w > 0.0, "{} -> {}", asset, w);
            assert!(*w <= StrategyEngineConfig::default().max_allocation);
        }
        assert!(p.gross_exposure() <= StrategyEngineConfig::default().max_leverage);
        let weights: f64 = p.metadata.strategy_weights.values().sum();
        assert!((weights - 1.0).abs() < 1e-9);
    }

    fn broad_bull_market(assets: usize) -> MarketData {
        let mut data = bull_market();
        data.returns.clear();
        for i in 0..assets {
            let drift = 0.01 + 0.0005 * i as f64;
            let rets = (0..60).map(|k| drift + if k % 2 == 0 { 0.002 } else { -0.002 }).collect();
            data.returns.insert(format!("A{}", i), rets);
        }
        data
    }

    #[test]
    fn test_gross_exposure_shrinks_to_leverage_cap() {
        let cfg = StrategyEngineConfig { max_leverage: 0.02, ..Default::default() };
        let mut e = StrategyEngine::new(cfg, RiskConfig::default());
        let p = e.generate_portfolio(&broad_bull_market(6), None);
        assert_eq!(p.metadata.regime, Some(Regime::TrendingBull));
        assert_eq!(p.positions.len(), 6, "{:?}", p.positions);
        assert!(p.metadata.leverage_scaled);
        assert!(!p.metadata.var_scaled);
        assert!(p.gross_exposure() <= 0.02 + 1e-12);
        assert!((p.metadata.gross_exposure - p.gross_exposure()).abs() < 1e-12);
        assert!(p.positions.values().all(|w| *w > 0.0));
    }

    #[test]
    fn test_tail_var_above_target_shrinks_positions() {
        let cfg = StrategyEngineConfig { target_volatility: 0.01, ..Default::default() };
        let mut stressed = StrategyEngine::new(cfg.clone(), RiskConfig::default());
        let tape: Vec<f64> = (0..60).map(|k| if k % 2 == 0 { 0.02 } else { -0.03 }).collect();
        stressed.risk.record_many(&tape);
        assert!(stressed.risk.latest().var_95.abs() > cfg.target_volatility);

        let p = stressed.generate_portfolio(&bull_market(), None);
        assert!(p.metadata.var_scaled);
        assert!(!p.metadata.leverage_scaled);
        assert!(!p.positions.is_empty());

        let mut calm = StrategyEngine::new(cfg, RiskConfig::default());
        let baseline = calm.generate_portfolio(&bull_market(), None);
        assert!(!baseline.metadata.var_scaled);
        assert!(p.gross_exposure() < baseline.gross_exposure());
    }

    #[test]
    fn test_risk_scale_takes_tightest_budget() {
        let cfg = StrategyEngineConfig::default();
        assert_eq!(risk_scale(0.0, 0.0, 0.0, &cfg), 1.0);
        assert!((risk_scale(-0.04, 0.0, 0.0, &cfg) - 0.5).abs() < 1e-12);
        assert!((risk_scale(-0.04, -0.1, 0.0, &cfg) - 0.3).abs() < 1e-12);
        assert!((risk_scale(0.0, 0.0, -0.4, &cfg) - 0.5).abs() < 1e-12);
        // throttled, never zeroed
        assert_eq!(risk_scale(-10.0, -10.0, -0.9, &cfg), MIN_RISK_SCALE);
    }

    #[test]
    fn test_lower_volatility_gets_larger_weight() {
        let e = engine();
        let mut data = MarketData::default();
        data.returns.insert("CALM".into(), (0..30).map(|i| if i % 2 == 0 { 0.001 } else { -0.001 }).collect());
        data.returns.insert("WILD".into(), (0..30).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }).collect());
        let raw: BTreeMap<String, f64> = [("CALM".to_string(), 0.05), ("WILD".to_string(), -0.05)].into();
        let out = e.risk_parity(&raw, &data, None);
        assert!(out["CALM"] > 0.0 && out["WILD"] < 0.0);
        assert!(out["CALM"].abs() > out["WILD"].abs());
        let gross: f64 = out.values().map(|w| w.abs()).sum();
        assert!((gross - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_missing_volatility_falls_back_to_uniform() {
        let e = engine();
        let raw: BTreeMap<String, f64> = [("X".to_string(), 0.02), ("Y".to_string(), 0.06)].into();
        let out = e.risk_parity(&raw, &MarketData::default(), None);
        assert!((out["X"] - 0.04).abs() < 1e-12);
        assert!((out["Y"] - 0.04).abs() < 1e-12);
    }
}
