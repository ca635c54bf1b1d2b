//! Strategy universe and the regime-weighted allocator.
//!
//! Each strategy is a tagged variant that knows:
//! - which regimes it is suitable for
//! - which intelligence module drives its confidence multiplier
//! - how to turn market data into per-asset signals

use std::collections::BTreeMap;

use crate::market::MarketData;
use crate::regime::Regime;
use crate::signals::TradingSignal;
use crate::stats;

// =============================================================================
// Strategy Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Base position size per signal (fraction of portfolio)
    pub base_size: f64,
    /// Lookback for trend-type signals
    pub trend_window: usize,
    /// Lookback for reversion-type signals
    pub reversion_window: usize,
    /// Minimum |z| for momentum entry
    pub momentum_z: f64,
    /// Minimum |z| for reversion entry
    pub reversion_z: f64,
    /// Short/long vol ratio for breakout entry
    pub breakout_ratio: f64,
    /// Minimum |funding| per period for carry
    pub funding_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            base_size: 0.1,
            trend_window: 20,
            reversion_window: 5,
            momentum_z: 0.5,
            reversion_z: 1.0,
            breakout_ratio: 1.2,
            funding_threshold: 0.0001,
        }
    }
}

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StrategyKind {
    Momentum,
    MeanReversion,
    VolatilityBreakout,
    FundingCarry,
    Defensive,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Momentum,
        StrategyKind::MeanReversion,
        StrategyKind::VolatilityBreakout,
        StrategyKind::FundingCarry,
        StrategyKind::Defensive,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            StrategyKind::Momentum => "momentum",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::VolatilityBreakout => "volatility_breakout",
            StrategyKind::FundingCarry => "funding_carry",
            StrategyKind::Defensive => "defensive",
        }
    }

    pub fn suitable_regimes(&self) -> &'static [Regime] {
        match self {
            StrategyKind::Momentum => &[Regime::TrendingBull, Regime::TrendingBear, Regime::Rally],
            StrategyKind::MeanReversion => &[Regime::Ranging, Regime::LowVolatility],
            StrategyKind::VolatilityBreakout => &[Regime::HighVolatility, Regime::Rally, Regime::Crash],
            StrategyKind::FundingCarry => &[Regime::Ranging, Regime::LowVolatility, Regime::TrendingBull],
            StrategyKind::Defensive => &[Regime::Crash, Regime::HighVolatility, Regime::TrendingBear],
        }
    }

    pub fn is_suitable(&self, regime: Regime) -> bool {
        self.suitable_regimes().contains(&regime)
    }

    /// Intelligence module whose meta-confidence scales this strategy.
    pub fn driver_module(&self) -> &'static str {
        match self {
            StrategyKind::Momentum => "regime",
            StrategyKind::MeanReversion => "correlation",
            StrategyKind::VolatilityBreakout => "volatility",
            StrategyKind::FundingCarry => "funding",
            StrategyKind::Defensive => "risk",
        }
    }

    pub fn hold_days(&self) -> u32 {
        match self {
            StrategyKind::Momentum => 10,
            StrategyKind::MeanReversion => 3,
            StrategyKind::VolatilityBreakout => 2,
            StrategyKind::FundingCarry => 7,
            StrategyKind::Defensive => 5,
        }
    }

    pub fn generate(&self, data: &MarketData, cfg: &StrategyConfig) -> Vec<TradingSignal> {
        match self {
            StrategyKind::Momentum => momentum(data, cfg),
            StrategyKind::MeanReversion => mean_reversion(data, cfg),
            StrategyKind::VolatilityBreakout => volatility_breakout(data, cfg),
            StrategyKind::FundingCarry => funding_carry(data, cfg),
            StrategyKind::Defensive => defensive(data, cfg),
        }
    }
}

/// z-score of the cumulative return over `window` against the per-period
/// volatility of the longer history.
fn window_z(returns: &[f64], window: usize, vol_window: usize) -> Option<f64> {
    if returns.len() < window.max(2) {
        return None;
    }
    let std = stats::std_dev(stats::tail(returns, vol_window.max(window)));
    if std <= 1e-12 {
        return None;
    }
    let cum: f64 = stats::tail(returns, window).iter().sum();
    Some(cum / (std * (window as f64).sqrt()))
}

fn momentum(data: &MarketData, cfg: &StrategyConfig) -> Vec<TradingSignal> {
    let kind = StrategyKind::Momentum;
    data.returns
        .iter()
        .filter_map(|(asset, rets)| {
            let z = window_z(rets, cfg.trend_window, cfg.trend_window)?;
            if z.abs() < cfg.momentum_z {
                return None;
            }
            Some(TradingSignal::new(asset, z.signum(), (z.abs() / 3.0).min(1.0), cfg.base_size, kind.id(), kind.hold_days()))
        })
        .collect()
}

fn mean_reversion(data: &MarketData, cfg: &StrategyConfig) -> Vec<TradingSignal> {
    let kind = StrategyKind::MeanReversion;
    data.returns
        .iter()
        .filter_map(|(asset, rets)| {
            if rets.len() < cfg.trend_window {
                return None;
            }
            let z = window_z(rets, cfg.reversion_window, cfg.trend_window)?;
            if z.abs() < cfg.reversion_z {
                return None;
            }
            let confidence = (0.2 + (z.abs() - cfg.reversion_z) / 2.0).min(1.0);
            Some(TradingSignal::new(asset, -z.signum(), confidence, cfg.base_size, kind.id(), kind.hold_days()))
        })
        .collect()
}

fn volatility_breakout(data: &MarketData, cfg: &StrategyConfig) -> Vec<TradingSignal> {
    let kind = StrategyKind::VolatilityBreakout;
    data.returns
        .iter()
        .filter_map(|(asset, rets)| {
            if rets.len() < cfg.trend_window * 2 {
                return None;
            }
            let short = stats::std_dev(stats::tail(rets, cfg.trend_window / 2));
            let long = stats::std_dev(rets);
            if long <= 1e-12 {
                return None;
            }
            let ratio = short / long;
            let push: f64 = stats::tail(rets, 3).iter().sum();
            if ratio < cfg.breakout_ratio || push == 0.0 {
                return None;
            }
            Some(TradingSignal::new(asset, push.signum(), (ratio - 1.0).min(1.0), cfg.base_size * 0.5, kind.id(), kind.hold_days()))
        })
        .collect()
}

fn funding_carry(data: &MarketData, cfg: &StrategyConfig) -> Vec<TradingSignal> {
    let kind = StrategyKind::FundingCarry;
    data.funding_rates
        .iter()
        .filter(|(_, rate)| rate.is_finite() && rate.abs() >= cfg.funding_threshold)
        .map(|(asset, rate)| {
            // positive funding: longs pay shorts, so lean short
            let confidence = (rate.abs() / (cfg.funding_threshold * 5.0)).min(1.0);
            TradingSignal::new(asset, -rate.signum(), confidence, cfg.base_size, kind.id(), kind.hold_days())
        })
        .collect()
}

fn defensive(data: &MarketData, cfg: &StrategyConfig) -> Vec<TradingSignal> {
    let kind = StrategyKind::Defensive;
    data.returns
        .iter()
        .filter_map(|(asset, rets)| {
            if rets.len() < 2 {
                return None;
            }
            let trend: f64 = stats::tail(rets, cfg.trend_window).iter().sum();
            if trend >= 0.0 {
                return None;
            }
            Some(TradingSignal::new(asset, -1.0, 0.5, cfg.base_size * 0.5, kind.id(), kind.hold_days()))
        })
        .collect()
}

// =============================================================================
// Universe + Allocator
// =============================================================================

#[derive(Debug, Clone)]
pub struct StrategyUniverse {
    strategies: Vec<StrategyKind>,
    pub config: StrategyConfig,
}

impl Default for StrategyUniverse {
    fn default() -> Self {
        Self::new(StrategyKind::ALL.to_vec(), StrategyConfig::default())
    }
}

impl StrategyUniverse {
    /// Strategies are kept sorted by id; that order drives signal combination.
    pub fn new(mut strategies: Vec<StrategyKind>, config: StrategyConfig) -> Self {
        strategies.sort_by_key(|s| s.id());
        strategies.dedup();
        Self { strategies, config }
    }

    pub fn strategies(&self) -> &[StrategyKind] {
        &self.strategies
    }

    pub fn suitable(&self, regime: Regime) -> Vec<StrategyKind> {
        self.strategies.iter().copied().filter(|s| s.is_suitable(regime)).collect()
    }
}

/// Regime → per-strategy weight table.
#[derive(Debug, Clone)]
pub struct StrategyAllocator {
    table: BTreeMap<Regime, BTreeMap<&'static str, f64>>,
}

impl Default for StrategyAllocator {
    fn default() -> Self {
        let rows: [(Regime, &[(&'static str, f64)]); 7] = [
            (Regime::TrendingBull, &[("momentum", 0.6), ("funding_carry", 0.4)]),
            (Regime::TrendingBear, &[("momentum", 0.5), ("defensive", 0.5)]),
            (Regime::Ranging, &[("mean_reversion", 0.6), ("funding_carry", 0.4)]),
            (Regime::LowVolatility, &[("mean_reversion", 0.5), ("funding_carry", 0.5)]),
            (Regime::HighVolatility, &[("volatility_breakout", 0.4), ("defensive", 0.6)]),
            (Regime::Crash, &[("defensive", 0.7), ("volatility_breakout", 0.3)]),
            (Regime::Rally, &[("momentum", 0.5), ("volatility_breakout", 0.5)]),
        ];
        let table = rows
            .iter()
            .map(|(regime, weights)| (*regime, weights.iter().copied().collect()))
            .collect();
        Self { table }
    }
}

impl StrategyAllocator {
    pub fn with_weight(mut self, regime: Regime, strategy: &'static str, weight: f64) -> Self {
        self.table.entry(regime).or_default().insert(strategy, weight);
        self
    }

    /// Raw weight; strategies missing from the table get an equal share of 1/n.
    pub fn weight(&self, regime: Regime, strategy: StrategyKind, n_suitable: usize) -> f64 {
        self.table
            .get(&regime)
            .and_then(|row| row.get(strategy.id()))
            .copied()
            .unwrap_or_else(|| if n_suitable > 0 { 1.0 / n_suitable as f64 } else { 0.0 })
    }

    /// Weights for `strategies`, renormalized to sum to 1.
    pub fn allocate(&self, regime: Regime, strategies: &[StrategyKind]) -> BTreeMap<StrategyKind, f64> {
        let raw: Vec<(StrategyKind, f64)> = strategies
            .iter()
            .map(|s| (*s, self.weight(regime, *s, strategies.len()).max(0.0)))
            .collect();
        let total: f64 = raw.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return BTreeMap::new();
        }
        raw.into_iter().map(|(s, w)| (s, w / total)).collect()
    }
}
