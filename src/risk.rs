//! Rolling risk metrics over a bounded window of portfolio returns.
//!
//! Every `record` recomputes a cached `RiskSnapshot`; readers get the cache
//! (optionally leverage-scaled and enriched with concentration/liquidity
//! metrics) so snapshot reads never touch the full history.
//!
//! Two statistical conventions coexist on purpose:
//! - multi-day VaR/CVaR compound rolling H-day windows and re-apply the
//!   empirical percentile/tail step;
//! - Sharpe/Sortino/Calmar and volatility annualize with sqrt(252).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::config::RiskConfig;
use crate::logging::{self, v_num, Domain};
use crate::market::MarketData;
use crate::stats::{self, finite_or_zero, TRADING_DAYS};

pub const HORIZONS: [usize; 3] = [1, 5, 21];

// =============================================================================
// ReturnSeries
// =============================================================================

/// Fixed-capacity ring of scalar portfolio returns; oldest evicted first.
#[derive(Debug, Clone)]
pub struct ReturnSeries {
    capacity: usize,
    values: VecDeque<f64>,
}

impl ReturnSeries {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HorizonRisk {
    pub days: usize,
    pub var_95: f64,
    pub cvar_95: f64,
    pub var_99: f64,
    pub cvar_99: f64,
    /// Tail mean beyond the 97.5% quantile
    pub expected_shortfall: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationMetrics {
    pub herfindahl: f64,
    pub effective_positions: f64,
    pub largest_weight: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LiquidityMetrics {
    pub turnover_ratio: f64,
    pub liquidity_pressure: f64,
    /// True when the position map was read as notionals rather than weights
    pub notional_basis: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub observations: usize,
    pub leverage: f64,
    /// Annualized
    pub volatility: f64,
    /// Annualized
    pub expected_return: f64,
    pub var_95: f64,
    pub cvar_95: f64,
    pub var_99: f64,
    pub cvar_99: f64,
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub downside_deviation: f64,
    pub omega: f64,
    pub horizons: Vec<HorizonRisk>,
    /// Scenario name -> return shock (negative = loss)
    pub stress: BTreeMap<String, f64>,
    pub concentration: Option<ConcentrationMetrics>,
    pub liquidity: Option<LiquidityMetrics>,
}

impl RiskSnapshot {
    /// All-neutral snapshot used below two observations.
    pub fn neutral(observations: usize) -> Self {
        Self {
            observations,
            leverage: 1.0,
            horizons: HORIZONS
                .iter()
                .map(|&days| HorizonRisk { days, ..Default::default() })
                .collect(),
            stress: stress_table(0.0, 0.0, 0.0),
            ..Default::default()
        }
    }

    pub fn horizon(&self, days: usize) -> Option<&HorizonRisk> {
        self.horizons.iter().find(|h| h.days == days)
    }

    fn scaled(&self, leverage: f64) -> Self {
        let mut out = self.clone();
        let lev = if leverage.is_finite() && leverage > 0.0 { leverage } else { 1.0 };
        out.leverage = lev;
        out.volatility = finite_or_zero(out.volatility * lev);
        out.var_95 = finite_or_zero(out.var_95 * lev);
        out.cvar_95 = finite_or_zero(out.cvar_95 * lev);
        out.var_99 = finite_or_zero(out.var_99 * lev);
        out.cvar_99 = finite_or_zero(out.cvar_99 * lev);
        for h in out.horizons.iter_mut() {
            h.var_95 = finite_or_zero(h.var_95 * lev);
            h.cvar_95 = finite_or_zero(h.cvar_95 * lev);
            h.var_99 = finite_or_zero(h.var_99 * lev);
            h.cvar_99 = finite_or_zero(h.cvar_99 * lev);
            h.expected_shortfall = finite_or_zero(h.expected_shortfall * lev);
        }
        out
    }
}

fn stress_table(vol_spike: f64, market_crash: f64, correlation_break: f64) -> BTreeMap<String, f64> {
    let mut m = BTreeMap::new();
    m.insert("vol_spike".to_string(), finite_or_zero(vol_spike));
    m.insert("market_crash".to_string(), finite_or_zero(market_crash));
    m.insert("correlation_break".to_string(), finite_or_zero(correlation_break));
    m
}

// =============================================================================
// Pure computations
// =============================================================================

/// (VaR, CVaR) at confidence `p` over an empirical sample.
pub fn var_cvar(returns: &[f64], p: f64) -> (f64, f64) {
    if returns.len() < 2 {
        return (0.0, 0.0);
    }
    let sorted = stats::sorted(returns);
    let var = stats::percentile_sorted(&sorted, 1.0 - p);
    let cvar = stats::tail_mean(&sorted, var, var);
    (finite_or_zero(var), finite_or_zero(cvar))
}

/// Compounded rolling H-day returns: (1+r1)...(1+rH) - 1.
pub fn compound_windows(returns: &[f64], days: usize) -> Vec<f64> {
    if days <= 1 {
        return returns.to_vec();
    }
    if returns.len() < days {
        return Vec::new();
    }
    returns
        .windows(days)
        .map(|w| w.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0)
        .collect()
}

pub fn horizon_risk(returns: &[f64], days: usize) -> HorizonRisk {
    let windows = compound_windows(returns, days);
    if windows.len() < 2 {
        return HorizonRisk { days, ..Default::default() };
    }
    let (var_95, cvar_95) = var_cvar(&windows, 0.95);
    let (var_99, cvar_99) = var_cvar(&windows, 0.99);
    let (_, expected_shortfall) = var_cvar(&windows, 0.975);
    HorizonRisk { days, var_95, cvar_95, var_99, cvar_99, expected_shortfall }
}

/// (current, max) drawdown of the cumulative-product equity curve.
/// Both are <= 0.
pub fn drawdowns(returns: &[f64]) -> (f64, f64) {
    let mut equity = 1.0;
    let mut peak = 1.0;
    let mut current = 0.0;
    let mut worst = 0.0;
    for r in returns {
        equity *= 1.0 + r;
        if equity > peak {
            peak = equity;
        }
        current = if peak > 0.0 { equity / peak - 1.0 } else { 0.0 };
        if current < worst {
            worst = current;
        }
    }
    (finite_or_zero(current), finite_or_zero(worst))
}

pub fn compute_snapshot(returns: &[f64]) -> RiskSnapshot {
    let n = returns.len();
    if n < 2 {
        return RiskSnapshot::neutral(n);
    }
    let ann = TRADING_DAYS.sqrt();
    let mean = stats::mean(returns);
    let std = stats::std_dev(returns);
    let downside = stats::downside_deviation(returns);
    let (var_95, cvar_95) = var_cvar(returns, 0.95);
    let (var_99, cvar_99) = var_cvar(returns, 0.99);
    let (current_dd, max_dd) = drawdowns(returns);

    let sharpe = if std > 0.0 { mean / std * ann } else { 0.0 };
    let sortino = if downside > 0.0 { mean / downside * ann } else { 0.0 };
    let annual_return = mean * TRADING_DAYS;
    let calmar = if max_dd < 0.0 { annual_return / max_dd.abs() } else { 0.0 };

    let gains: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let losses: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    let omega = if losses > 0.0 { gains / losses } else { 0.0 };

    let sorted = stats::sorted(returns);
    let p1 = stats::percentile_sorted(&sorted, 0.01);
    let p5 = stats::percentile_sorted(&sorted, 0.05);

    RiskSnapshot {
        observations: n,
        leverage: 1.0,
        volatility: finite_or_zero(std * ann),
        expected_return: finite_or_zero(annual_return),
        var_95,
        cvar_95,
        var_99,
        cvar_99,
        current_drawdown: current_dd,
        max_drawdown: max_dd,
        sharpe: finite_or_zero(sharpe),
        sortino: finite_or_zero(sortino),
        calmar: finite_or_zero(calmar),
        downside_deviation: finite_or_zero(downside),
        omega: finite_or_zero(omega),
        horizons: HORIZONS.iter().map(|&d| horizon_risk(returns, d)).collect(),
        stress: stress_table(-2.0 * std, p1, (p1 + p5) / 2.0),
        concentration: None,
        liquidity: None,
    }
}

/// Herfindahl over normalized absolute weights. `None` when the map carries
/// no exposure at all.
pub fn concentration(positions: &BTreeMap<String, f64>) -> Option<ConcentrationMetrics> {
    let gross: f64 = positions.values().filter(|w| w.is_finite()).map(|w| w.abs()).sum();
    if gross <= 0.0 {
        return None;
    }
    let mut herfindahl = 0.0;
    let mut largest: f64 = 0.0;
    for w in positions.values().filter(|w| w.is_finite()) {
        let share = w.abs() / gross;
        herfindahl += share * share;
        largest = largest.max(share);
    }
    Some(ConcentrationMetrics {
        herfindahl,
        effective_positions: 1.0 / herfindahl,
        largest_weight: largest,
    })
}

/// Gross |weight| <= 1.5 is read as fractional weights, anything larger as
/// notionals against `portfolio_value`.
pub fn liquidity(positions: &BTreeMap<String, f64>, portfolio_value: Option<f64>) -> Option<LiquidityMetrics> {
    if positions.is_empty() {
        return None;
    }
    let gross: f64 = positions.values().filter(|w| w.is_finite()).map(|w| w.abs()).sum();
    let largest = positions
        .values()
        .filter(|w| w.is_finite())
        .fold(0.0_f64, |acc, w| acc.max(w.abs()));
    if gross <= 1.5 {
        return Some(LiquidityMetrics {
            turnover_ratio: gross,
            liquidity_pressure: largest,
            notional_basis: false,
        });
    }
    let pv = portfolio_value.filter(|v| v.is_finite() && *v > 0.0);
    Some(LiquidityMetrics {
        turnover_ratio: pv.map(|v| gross / v).unwrap_or(0.0),
        liquidity_pressure: pv.map(|v| largest / v).unwrap_or(0.0),
        notional_basis: true,
    })
}

// =============================================================================
// Position limits
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionLimits {
    pub max_position: f64,
    pub max_leverage: f64,
}

impl PositionLimits {
    /// Clip each position to ±max_position, then shrink uniformly if gross
    /// exposure still exceeds max_leverage.
    pub fn apply(&self, positions: &mut BTreeMap<String, f64>) {
        for w in positions.values_mut() {
            *w = w.clamp(-self.max_position, self.max_position);
        }
        let gross: f64 = positions.values().map(|w| w.abs()).sum();
        if gross > self.max_leverage && gross > 0.0 {
            let k = self.max_leverage / gross;
            for w in positions.values_mut() {
                *w *= k;
            }
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Single-writer per process: concurrent writers need an external mutex.
#[derive(Debug, Clone)]
pub struct RiskMetricsEngine {
    cfg: RiskConfig,
    returns: ReturnSeries,
    cached: RiskSnapshot,
    history: VecDeque<RiskSnapshot>,
    last_ingest_ts: Option<u64>,
}

impl RiskMetricsEngine {
    pub fn new(cfg: RiskConfig) -> Self {
        Self {
            returns: ReturnSeries::new(cfg.return_capacity),
            history: VecDeque::with_capacity(cfg.history_capacity),
            cfg,
            cached: RiskSnapshot::neutral(0),
            last_ingest_ts: None,
        }
    }

    /// Append one return and recompute the cache. Non-finite input is dropped.
    pub fn record(&mut self, ret: f64) {
        if !ret.is_finite() {
            logging::warn(Domain::Risk, "non_finite_return", &[("value", v_num(ret))]);
            return;
        }
        self.returns.push(ret);
        self.refresh();
    }

    pub fn record_many(&mut self, rets: &[f64]) {
        let mut pushed = false;
        for r in rets.iter().filter(|r| r.is_finite()) {
            self.returns.push(*r);
            pushed = true;
        }
        if pushed {
            self.refresh();
        }
    }

    fn refresh(&mut self) {
        self.cached = compute_snapshot(&self.returns.to_vec());
        if self.history.len() >= self.cfg.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(self.cached.clone());
    }

    /// Feed the engine from a market fetch. The first fetch backfills the
    /// whole portfolio history; later fetches record only the latest return
    /// and only when the timestamp moved forward.
    pub fn ingest(&mut self, data: &MarketData) -> bool {
        if let Some(last) = self.last_ingest_ts {
            if data.timestamp <= last {
                return false;
            }
        }
        let recorded = if self.last_ingest_ts.is_none() && data.portfolio_returns.len() > 1 {
            self.record_many(&data.portfolio_returns);
            true
        } else if let Some(r) = data.latest_portfolio_return() {
            self.record(r);
            true
        } else {
            false
        };
        if recorded {
            self.last_ingest_ts = Some(data.timestamp);
        }
        recorded
    }

    pub fn observations(&self) -> usize {
        self.returns.len()
    }

    pub fn history(&self) -> impl Iterator<Item = &RiskSnapshot> {
        self.history.iter()
    }

    pub fn latest(&self) -> &RiskSnapshot {
        &self.cached
    }

    /// Cached snapshot, VaR/CVaR/volatility scaled by `leverage`, with
    /// concentration and liquidity merged when positions are supplied.
    pub fn snapshot(
        &self,
        leverage: f64,
        positions: Option<&BTreeMap<String, f64>>,
        portfolio_value: Option<f64>,
    ) -> RiskSnapshot {
        let mut snap = self.cached.scaled(leverage);
        if let Some(pos) = positions {
            snap.concentration = concentration(pos);
            snap.liquidity = liquidity(pos, portfolio_value);
        }
        snap
    }

    /// PnL per scenario: value × leverage × shock. Defaults to the derived
    /// stress scenarios.
    pub fn scenario_analysis(
        &self,
        portfolio_value: f64,
        leverage: f64,
        shocks: Option<&BTreeMap<String, f64>>,
    ) -> BTreeMap<String, f64> {
        let shocks = shocks.unwrap_or(&self.cached.stress);
        shocks
            .iter()
            .map(|(name, shock)| (name.clone(), finite_or_zero(portfolio_value * leverage * shock)))
            .collect()
    }

    /// Limits shrink proportionally when realized volatility exceeds the
    /// target, floored at a quarter of the base limits.
    pub fn position_limits(&self) -> PositionLimits {
        let vol = self.cached.volatility;
        let factor = if vol > self.cfg.target_volatility && vol > 0.0 {
            (self.cfg.target_volatility / vol).max(0.25)
        } else {
            1.0
        };
        PositionLimits {
            max_position: self.cfg.max_position * factor,
            max_leverage: self.cfg.max_leverage * factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskMetricsEngine {
        RiskMetricsEngine::new(RiskConfig::default())
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_fewer_than_two_observations_is_neutral() {
        let mut e = engine();
        let s = e.snapshot(1.0, None, None);
        assert_eq!(s.var_95, 0.0);
        assert_eq!(s.sharpe, 0.0);
        e.record(0.05);
        let s = e.snapshot(2.0, None, None);
        for v in [s.volatility, s.var_95, s.cvar_95, s.var_99, s.cvar_99, s.sharpe, s.sortino, s.calmar, s.omega] {
            assert_eq!(v, 0.0);
        }
        assert!(s.horizons.iter().all(|h| h.var_95 == 0.0 && h.cvar_99 == 0.0));
        assert!(s.stress.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_five_point_var_cvar_scenario() {
        let mut e = engine();
        let rets = [0.02, -0.03, 0.01, -0.015, 0.005];
        for r in rets {
            e.record(r);
        }
        let s = e.snapshot(1.0, None, None);
        let expected_var = stats::percentile(&rets, 0.05);
        assert!((s.var_95 - expected_var).abs() < 1e-12);
        let tail: Vec<f64> = rets.iter().copied().filter(|r| *r <= expected_var).collect();
        assert!((s.cvar_95 - stats::mean(&tail)).abs() < 1e-12);
        assert!(s.cvar_95 <= s.var_95);
    }

    #[test]
    fn test_cvar_never_above_var() {
        let rets: Vec<f64> = (0..200).map(|i| ((i * 37 % 101) as f64 - 50.0) / 1000.0).collect();
        for p in [0.9, 0.95, 0.99] {
            let (var, cvar) = var_cvar(&rets, p);
            assert!(cvar <= var, "p={} var={} cvar={}", p, var, cvar);
        }
    }

    #[test]
    fn test_leverage_scales_var_and_vol() {
        let mut e = engine();
        e.record_many(&[0.01, -0.02, 0.015, -0.005, 0.0, -0.01]);
        let base = e.snapshot(1.0, None, None);
        let lev = e.snapshot(2.0, None, None);
        assert!((lev.var_95 - 2.0 * base.var_95).abs() < 1e-12);
        assert!((lev.volatility - 2.0 * base.volatility).abs() < 1e-12);
        assert_eq!(lev.sharpe, base.sharpe);
    }

    #[test]
    fn test_horizon_var_uses_compounded_windows() {
        let rets = [0.01, -0.02, 0.03, -0.01, 0.02, -0.03, 0.01];
        let windows = compound_windows(&rets, 5);
        assert_eq!(windows.len(), 3);
        let first = (1.01 * 0.98 * 1.03 * 0.99 * 1.02) - 1.0;
        assert!((windows[0] - first).abs() < 1e-12);
        let h = horizon_risk(&rets, 5);
        assert!((h.var_95 - stats::percentile(&windows, 0.05)).abs() < 1e-12);
        // too short for a 21-day window
        assert_eq!(horizon_risk(&rets, 21).var_95, 0.0);
    }

    #[test]
    fn test_drawdown_current_and_max() {
        let (cur, max) = drawdowns(&[0.1, -0.5, 0.2]);
        // equity 1.1 -> 0.55 -> 0.66 ; peak 1.1
        assert!((max - (-0.5)).abs() < 1e-12);
        assert!((cur - (0.66 / 1.1 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_stress_scenarios_are_derived() {
        let rets: Vec<f64> = (0..100).map(|i| (i as f64 - 50.0) / 1000.0).collect();
        let s = compute_snapshot(&rets);
        let std = stats::std_dev(&rets);
        assert!((s.stress["vol_spike"] + 2.0 * std).abs() < 1e-12);
        let p1 = stats::percentile(&rets, 0.01);
        let p5 = stats::percentile(&rets, 0.05);
        assert!((s.stress["market_crash"] - p1).abs() < 1e-12);
        assert!((s.stress["correlation_break"] - (p1 + p5) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_herfindahl_bounds() {
        let single = concentration(&weights(&[("A", 1.0)])).unwrap();
        assert!((single.herfindahl - 1.0).abs() < 1e-12);
        assert!((single.effective_positions - 1.0).abs() < 1e-12);

        let spread = concentration(&weights(&[("A", 0.5), ("B", -0.3), ("C", 0.2)])).unwrap();
        assert!(spread.herfindahl > 0.0 && spread.herfindahl <= 1.0);
        assert!((spread.effective_positions * spread.herfindahl - 1.0).abs() < 1e-9);

        assert!(concentration(&weights(&[("A", 0.0)])).is_none());
    }

    #[test]
    fn test_fractional_weight_liquidity_scenario() {
        let mut e = engine();
        e.record_many(&[0.01, -0.01, 0.02]);
        let pos = weights(&[("A", 0.4), ("B", 0.35), ("C", 0.25)]);
        let s = e.snapshot(1.0, Some(&pos), Some(100_000.0));
        let liq = s.liquidity.unwrap();
        assert!(!liq.notional_basis);
        assert!((liq.turnover_ratio - 1.0).abs() < 1e-9);
        assert!((liq.liquidity_pressure - 0.4).abs() < 1e-9);
        assert!(s.concentration.is_some());
    }

    #[test]
    fn test_notional_liquidity_branch() {
        let pos = weights(&[("A", 60_000.0), ("B", 40_000.0)]);
        let liq = liquidity(&pos, Some(200_000.0)).unwrap();
        assert!(liq.notional_basis);
        assert!((liq.turnover_ratio - 0.5).abs() < 1e-12);
        assert!((liq.liquidity_pressure - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_scenario_analysis_multiplies_value() {
        let e = engine();
        let shocks = weights(&[("crash", -0.2), ("rally", 0.1)]);
        let table = e.scenario_analysis(100_000.0, 2.0, Some(&shocks));
        assert!((table["crash"] + 40_000.0).abs() < 1e-6);
        assert!((table["rally"] - 20_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut e = RiskMetricsEngine::new(RiskConfig { return_capacity: 3, ..Default::default() });
        e.record_many(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(e.observations(), 3);
        assert_eq!(e.returns.to_vec(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut e = RiskMetricsEngine::new(RiskConfig { history_capacity: 4, ..Default::default() });
        for i in 0..10 {
            e.record(i as f64 / 100.0);
        }
        assert_eq!(e.history().count(), 4);
    }

    #[test]
    fn test_ingest_is_idempotent_per_timestamp() {
        let mut e = engine();
        let mut data = MarketData { timestamp: 10, portfolio_returns: vec![0.01, -0.02, 0.03], ..Default::default() };
        assert!(e.ingest(&data));
        assert_eq!(e.observations(), 3);
        assert!(!e.ingest(&data));
        data.timestamp = 11;
        data.portfolio_returns.push(0.005);
        assert!(e.ingest(&data));
        assert_eq!(e.observations(), 4);
    }

    #[test]
    fn test_limits_shrink_with_volatility() {
        let mut e = engine();
        let calm = e.position_limits();
        assert_eq!(calm.max_position, RiskConfig::default().max_position);
        e.record_many(&[0.08, -0.09, 0.07, -0.1, 0.09, -0.08]);
        let stressed = e.position_limits();
        assert!(stressed.max_position < calm.max_position);
        assert!(stressed.max_position >= calm.max_position * 0.25 - 1e-12);
    }

    #[test]
    fn test_limits_apply_clips_and_shrinks() {
        let limits = PositionLimits { max_position: 0.5, max_leverage: 1.0 };
        let mut pos = weights(&[("A", 0.9), ("B", -0.7), ("C", 0.2)]);
        limits.apply(&mut pos);
        let gross: f64 = pos.values().map(|w| w.abs()).sum();
        assert!((gross - 1.0).abs() < 1e-12);
        assert!(pos.values().all(|w| w.abs() <= 0.5 + 1e-12));
    }
}
