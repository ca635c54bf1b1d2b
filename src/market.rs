//! Market telemetry types and the external collaborator seams.
//!
//! Data acquisition and event delivery are out of scope; the pipeline only
//! sees what `MarketDataSource::fetch` and `TelemetryStream::collect` hand it.
//! Every field may be missing and every consumer must degrade gracefully.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::regime::Regime;
use crate::stats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroIndicators {
    /// Growth proxy (e.g. PMI deviation, earnings revisions). Sign matters.
    pub growth: f64,
    /// Inflation proxy (e.g. breakeven change). Sign matters.
    pub inflation: f64,
}

/// One fetch from the market data source. Asset maps are ordered so every
/// downstream iteration is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    pub timestamp: u64,
    #[serde(default)]
    pub prices: BTreeMap<String, f64>,
    /// Per-asset return history, oldest first.
    #[serde(default)]
    pub returns: BTreeMap<String, Vec<f64>>,
    /// Portfolio-level return history, oldest first.
    #[serde(default)]
    pub portfolio_returns: Vec<f64>,
    #[serde(default)]
    pub positions: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub portfolio_value: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub funding_rates: BTreeMap<String, f64>,
    #[serde(default)]
    pub spreads_bps: BTreeMap<String, f64>,
    #[serde(default)]
    pub volumes: BTreeMap<String, f64>,
    #[serde(default)]
    pub macro_indicators: Option<MacroIndicators>,
}

impl MarketData {
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty() && self.returns.is_empty() && self.portfolio_returns.is_empty()
    }

    pub fn assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.prices.keys().cloned().collect();
        for asset in self.returns.keys() {
            if !self.prices.contains_key(asset) {
                assets.push(asset.clone());
            }
        }
        assets.sort();
        assets
    }

    /// Equal-weight cross-sectional mean of asset returns, aligned on the
    /// most recent observations. Falls back to the portfolio series.
    pub fn composite_returns(&self) -> Vec<f64> {
        let series: Vec<&Vec<f64>> = self.returns.values().filter(|r| !r.is_empty()).collect();
        if series.is_empty() {
            return self.portfolio_returns.clone();
        }
        let len = series.iter().map(|s| s.len()).min().unwrap_or(0);
        (0..len)
            .map(|k| {
                let sum: f64 = series.iter().map(|s| s[s.len() - len + k]).sum();
                sum / series.len() as f64
            })
            .collect()
    }

    /// Annualized realized volatility per asset, from the return history.
    pub fn realized_vols(&self) -> BTreeMap<String, f64> {
        self.returns
            .iter()
            .filter(|(_, r)| r.len() >= 2)
            .map(|(asset, r)| (asset.clone(), stats::annualized_vol(r)))
            .filter(|(_, v)| *v > 0.0 && v.is_finite())
            .collect()
    }

    /// The portfolio return for the latest timestamp: explicit series first,
    /// then position-weighted latest asset returns, then equal weight.
    pub fn latest_portfolio_return(&self) -> Option<f64> {
        if let Some(r) = self.portfolio_returns.last() {
            return Some(*r);
        }
        let latest: BTreeMap<&String, f64> = self
            .returns
            .iter()
            .filter_map(|(a, r)| r.last().map(|x| (a, *x)))
            .collect();
        if latest.is_empty() {
            return None;
        }
        if let Some(positions) = &self.positions {
            let gross: f64 = positions.values().map(|w| w.abs()).sum();
            if gross > 0.0 {
                let weighted: f64 = positions
                    .iter()
                    .filter_map(|(a, w)| latest.get(a).map(|r| r * w / gross))
                    .sum();
                return Some(weighted);
            }
        }
        Some(latest.values().sum::<f64>() / latest.len() as f64)
    }
}

// =============================================================================
// MarketState
// =============================================================================

pub const SHORT_WINDOW: usize = 20;
pub const LONG_WINDOW: usize = 60;

/// Per-cycle summary the regime ensemble votes on. Features are only
/// present when they could be computed; classifiers treat absence as
/// "missing input".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketState {
    pub timestamp: u64,
    pub regime: Option<Regime>,
    pub features: BTreeMap<String, f64>,
    pub volatility_label: String,
    pub liquidity_label: String,
    pub correlations: BTreeMap<String, f64>,
}

impl MarketState {
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn from_market(data: &MarketData) -> Self {
        let mut features = BTreeMap::new();
        let composite = data.composite_returns();

        if composite.len() >= SHORT_WINDOW {
            let short_vol = stats::annualized_vol(stats::tail(&composite, SHORT_WINDOW));
            let long_vol = stats::annualized_vol(stats::tail(&composite, LONG_WINDOW));
            features.insert("short_vol".to_string(), short_vol);
            features.insert("long_vol".to_string(), long_vol);
            if long_vol > 1e-12 {
                features.insert("vol_ratio".to_string(), short_vol / long_vol);
            }
            let trend: f64 = stats::tail(&composite, SHORT_WINDOW).iter().sum();
            features.insert("trend".to_string(), trend);
        }

        let mut correlations = BTreeMap::new();
        let assets: Vec<(&String, &Vec<f64>)> = data.returns.iter().collect();
        for i in 0..assets.len() {
            for j in (i + 1)..assets.len() {
                if let Some(c) = stats::correlation(
                    stats::tail(assets[i].1, LONG_WINDOW),
                    stats::tail(assets[j].1, LONG_WINDOW),
                ) {
                    correlations.insert(format!("{}/{}", assets[i].0, assets[j].0), c);
                }
            }
        }
        if !correlations.is_empty() {
            let avg = correlations.values().sum::<f64>() / correlations.len() as f64;
            features.insert("avg_correlation".to_string(), avg);
        }

        if let Some(m) = data.macro_indicators {
            features.insert("growth".to_string(), m.growth);
            features.insert("inflation".to_string(), m.inflation);
        }

        let volatility_label = match features.get("vol_ratio") {
            Some(r) if *r > 1.5 => "high",
            Some(r) if *r < 0.5 => "low",
            Some(_) => "normal",
            None => "unknown",
        }
        .to_string();

        let liquidity_label = if data.spreads_bps.is_empty() {
            "unknown"
        } else {
            let avg = data.spreads_bps.values().sum::<f64>() / data.spreads_bps.len() as f64;
            if avg < 10.0 {
                "deep"
            } else if avg < 50.0 {
                "normal"
            } else {
                "thin"
            }
        }
        .to_string();

        Self {
            timestamp: data.timestamp,
            regime: None,
            features,
            volatility_label,
            liquidity_label,
            correlations,
        }
    }
}

// =============================================================================
// Telemetry
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub roi: f64,
    pub notional: f64,
    pub slippage_bps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: u64,
    /// Reward; sources that report a `score` instead are accepted as-is.
    #[serde(alias = "score")]
    pub reward: f64,
    pub event_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub trade: Option<TradeOutcome>,
    #[serde(default)]
    pub portfolio_state: Option<BTreeMap<String, f64>>,
}

// =============================================================================
// Collaborator seams
// =============================================================================

/// Opaque market data provider. `Ok(None)` means "no data this cycle".
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch(&self) -> Result<Option<MarketData>>;
}

/// Opaque telemetry stream; `collect` drains events since the last call.
#[async_trait]
pub trait TelemetryStream: Send + Sync {
    async fn collect(&self) -> Result<Vec<TelemetryEvent>>;
}
