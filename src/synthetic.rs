//! Seeded synthetic market and telemetry for paper runs and tests.
//!
//! Prices follow independent Gaussian random walks around a shared market
//! factor; funding, spreads and macro proxies drift slowly. Telemetry
//! rewards are noisy around a configurable edge.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::market::{MacroIndicators, MarketData, MarketDataSource, TelemetryEvent, TelemetryStream, TradeOutcome};

const HISTORY: usize = 120;

fn gaussian(rng: &mut StdRng) -> f64 {
    // Box-Muller
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub assets: Vec<String>,
    /// Per-step volatility of the shared factor
    pub market_vol: f64,
    /// Per-step idiosyncratic volatility
    pub idio_vol: f64,
    /// Per-step drift
    pub drift: f64,
    /// Milliseconds advanced per fetch
    pub step_ms: u64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            assets: ["BTC", "ETH", "SOL"].iter().map(|s| s.to_string()).collect(),
            market_vol: 0.01,
            idio_vol: 0.006,
            drift: 0.0003,
            step_ms: 60_000,
            seed: 42,
        }
    }
}

#[derive(Debug)]
struct MarketSim {
    rng: StdRng,
    timestamp: u64,
    prices: BTreeMap<String, f64>,
    returns: BTreeMap<String, Vec<f64>>,
    portfolio: Vec<f64>,
    funding: BTreeMap<String, f64>,
    macro_state: MacroIndicators,
}

pub struct SyntheticMarket {
    cfg: SyntheticConfig,
    sim: Mutex<MarketSim>,
}

impl SyntheticMarket {
    pub fn new(cfg: SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let prices = cfg.assets.iter().map(|a| (a.clone(), 100.0)).collect();
        let funding = cfg
            .assets
            .iter()
            .map(|a| (a.clone(), rng.gen_range(-0.0003..0.0003)))
            .collect();
        let sim = MarketSim {
            rng,
            timestamp: 1_700_000_000_000,
            prices,
            returns: BTreeMap::new(),
            portfolio: Vec::new(),
            funding,
            macro_state: MacroIndicators::default(),
        };
        Self { cfg, sim: Mutex::new(sim) }
    }

    /// Advance `n` steps without producing a fetch; used to warm history.
    pub fn warm_up(&self, n: usize) -> Result<()> {
        let mut sim = self.sim.lock().map_err(|_| anyhow!("market sim lock poisoned"))?;
        for _ in 0..n {
            self.step(&mut sim);
        }
        Ok(())
    }

    fn step(&self, sim: &mut MarketSim) {
        let factor = gaussian(&mut sim.rng) * self.cfg.market_vol;
        let mut sum = 0.0;
        for asset in &self.cfg.assets {
            let r = self.cfg.drift + factor + gaussian(&mut sim.rng) * self.cfg.idio_vol;
            sum += r;
            if let Some(p) = sim.prices.get_mut(asset) {
                *p *= 1.0 + r;
            }
            let hist = sim.returns.entry(asset.clone()).or_default();
            hist.push(r);
            if hist.len() > HISTORY {
                hist.remove(0);
            }
        }
        sim.portfolio.push(sum / self.cfg.assets.len().max(1) as f64);
        if sim.portfolio.len() > HISTORY {
            sim.portfolio.remove(0);
        }
        for rate in sim.funding.values_mut() {
            *rate = (*rate + gaussian(&mut sim.rng) * 0.00002).clamp(-0.001, 0.001);
        }
        sim.macro_state.growth += gaussian(&mut sim.rng) * 0.05;
        sim.macro_state.inflation += gaussian(&mut sim.rng) * 0.05;
        sim.timestamp += self.cfg.step_ms;
    }
}

#[async_trait]
impl MarketDataSource for SyntheticMarket {
    async fn fetch(&self) -> Result<Option<MarketData>> {
        let mut sim = self.sim.lock().map_err(|_| anyhow!("market sim lock poisoned"))?;
        self.step(&mut sim);
        let spreads = self
            .cfg
            .assets
            .iter()
            .map(|a| (a.clone(), 2.0 + sim.rng.gen_range(0.0..8.0)))
            .collect();
        let volumes = self
            .cfg
            .assets
            .iter()
            .map(|a| (a.clone(), sim.rng.gen_range(1e6..5e6)))
            .collect();
        Ok(Some(MarketData {
            timestamp: sim.timestamp,
            prices: sim.prices.clone(),
            returns: sim.returns.clone(),
            portfolio_returns: sim.portfolio.clone(),
            positions: None,
            portfolio_value: Some(100_000.0),
            leverage: Some(1.0),
            funding_rates: sim.funding.clone(),
            spreads_bps: spreads,
            volumes,
            macro_indicators: Some(sim.macro_state),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub events_per_collect: usize,
    /// Mean reward
    pub edge: f64,
    pub noise: f64,
    pub seed: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { events_per_collect: 8, edge: 0.02, noise: 0.1, seed: 7 }
    }
}

pub struct SyntheticTelemetry {
    cfg: TelemetryConfig,
    state: Mutex<(StdRng, u64)>,
}

impl SyntheticTelemetry {
    pub fn new(cfg: TelemetryConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self { cfg, state: Mutex::new((rng, 0)) }
    }
}

#[async_trait]
impl TelemetryStream for SyntheticTelemetry {
    async fn collect(&self) -> Result<Vec<TelemetryEvent>> {
        let mut guard = self.state.lock().map_err(|_| anyhow!("telemetry lock poisoned"))?;
        let (rng, counter) = &mut *guard;
        let now = crate::logging::ts_epoch_ms();
        let events = (0..self.cfg.events_per_collect)
            .map(|_| {
                *counter += 1;
                let reward = self.cfg.edge + gaussian(rng) * self.cfg.noise;
                TelemetryEvent {
                    timestamp: now,
                    reward,
                    event_type: "trade".to_string(),
                    session_id: Some(format!("paper-{}", *counter / 100)),
                    trade: Some(TradeOutcome {
                        roi: reward / 10.0,
                        notional: rng.gen_range(1_000.0..10_000.0),
                        slippage_bps: rng.gen_range(0.0..5.0),
                    }),
                    portfolio_state: None,
                }
            })
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_is_seeded_and_advances() {
        let a = SyntheticMarket::new(SyntheticConfig::default());
        let b = SyntheticMarket::new(SyntheticConfig::default());
        let da = a.fetch().await.unwrap().unwrap();
        let db = b.fetch().await.unwrap().unwrap();
        assert_eq!(da.prices, db.prices);
        let next = a.fetch().await.unwrap().unwrap();
        assert!(next.timestamp > da.timestamp);
        assert_eq!(next.returns["BTC"].len(), 2);
    }

    #[tokio::test]
    async fn test_warm_up_caps_history() {
        let m = SyntheticMarket::new(SyntheticConfig::default());
        m.warm_up(500).unwrap();
        let d = m.fetch().await.unwrap().unwrap();
        assert_eq!(d.returns["ETH"].len(), HISTORY);
        assert_eq!(d.portfolio_returns.len(), HISTORY);
    }

    #[tokio::test]
    async fn test_telemetry_batch_size() {
        let t = SyntheticTelemetry::new(TelemetryConfig { events_per_collect: 5, ..Default::default() });
        let events = t.collect().await.unwrap();
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.trade.is_some()));
    }
}
