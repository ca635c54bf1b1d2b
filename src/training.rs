//! Periodic training loop.
//!
//! One cycle:
//! 1. fetch market data (none -> skip)
//! 2. generate the intelligence bundle
//! 3. optionally drive the strategy engine with it
//! 4. collect telemetry (none -> skip)
//! 5. encode one experience per event, bulk insert
//! 6. sample extra replay, train the policy
//! 7. build the performance snapshot, hand it to the retrain scheduler
//!
//! A failed cycle is logged and followed by a longer backoff; the loop
//! itself never exits until the stop flag is set.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::TrainingConfig;
use crate::drift_tracker::DriftTracker;
use crate::experience::{ExperienceBuffer, ExperienceRecord, StateVector};
use crate::intel::{IntelligenceBundle, IntelligenceOrchestrator};
use crate::knowledge::KnowledgeStore;
use crate::logging::{self, v_num, v_str, Domain, ProfileScope};
use crate::market::{MarketDataSource, TelemetryEvent, TelemetryStream};
use crate::regime::Regime;
use crate::retrain::{AutoRetrainScheduler, RetrainDecision};
use crate::stats;
use crate::strategy_engine::{Portfolio, StrategyEngine};

// =============================================================================
// Policy
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub loss: f64,
    pub samples: usize,
    pub version: u64,
}

/// Opaque learner. The loop only needs `train` and `infer`.
pub trait Policy: Send {
    fn version(&self) -> u64;
    fn train(&mut self, batch: &[ExperienceRecord]) -> Result<TrainMetrics>;
    fn infer(&self, state: &StateVector) -> f64;
}

/// Linear value estimate of reward from the state, updated by one SGD pass
/// over each batch. Weights grow to fit the widest state seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearPolicy {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub learning_rate: f64,
    pub version: u64,
}

impl Default for LinearPolicy {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl LinearPolicy {
    pub fn new(learning_rate: f64) -> Self {
        Self { weights: Vec::new(), bias: 0.0, learning_rate, version: 0 }
    }
}

impl Policy for LinearPolicy {
    fn version(&self) -> u64 {
        self.version
    }

    fn train(&mut self, batch: &[ExperienceRecord]) -> Result<TrainMetrics> {
        if batch.is_empty() {
            return Ok(TrainMetrics { loss: 0.0, samples: 0, version: self.version });
        }
        // the pass runs on a copy; a diverged batch leaves the policy as it was
        let width = batch.iter().map(|r| r.state.len()).max().unwrap_or(0);
        let mut weights = self.weights.clone();
        if weights.len() < width {
            weights.resize(width, 0.0);
        }
        let mut bias = self.bias;
        let mut sq_err = 0.0;
        for record in batch {
            let predicted = bias
                + weights
                    .iter()
                    .zip(&record.state.data)
                    .map(|(w, x)| w * x)
                    .sum::<f64>();
            let err = predicted - record.reward;
            sq_err += err * err;
            let step = self.learning_rate * err;
            for (w, x) in weights.iter_mut().zip(&record.state.data) {
                *w -= step * x;
            }
            bias -= step;
        }
        if weights.iter().any(|w| !w.is_finite()) || !bias.is_finite() || !sq_err.is_finite() {
            anyhow::bail!("policy diverged at version {}", self.version);
        }
        self.weights = weights;
        self.bias = bias;
        self.version += 1;
        Ok(TrainMetrics {
            loss: sq_err / batch.len() as f64,
            samples: batch.len(),
            version: self.version,
        })
    }

    fn infer(&self, state: &StateVector) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(&state.data)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }
}

// =============================================================================
// Feature encoding
// =============================================================================

pub trait FeatureEncoder: Send + Sync {
    fn encode(&self, event: &TelemetryEvent, bundle: &IntelligenceBundle) -> StateVector;
}

/// Bundle context (confidence, health, risk) + trade outcome + one-hot regime.
#[derive(Debug, Clone, Default)]
pub struct StandardEncoder;

impl StandardEncoder {
    pub const WIDTH: usize = 7 + Regime::ALL.len();
}

impl FeatureEncoder for StandardEncoder {
    fn encode(&self, event: &TelemetryEvent, bundle: &IntelligenceBundle) -> StateVector {
        let risk = bundle.unified.risk.as_ref();
        let trade = event.trade.unwrap_or_default();
        let mut data = vec![
            bundle.unified.overall_confidence,
            bundle.market_health.score,
            if bundle.unified.high_volatility { 1.0 } else { 0.0 },
            risk.map(|r| r.var_95).unwrap_or(0.0),
            risk.map(|r| r.current_drawdown).unwrap_or(0.0),
            // clipped so one extreme fill cannot blow up the learner
            trade.roi.clamp(-1.0, 1.0),
            (trade.slippage_bps / 100.0).clamp(-1.0, 1.0),
        ];
        let regime = bundle.regime();
        data.extend(Regime::ALL.iter().map(|r| if Some(*r) == regime { 1.0 } else { 0.0 }));
        StateVector::flat(data.into_iter().map(stats::finite_or_zero).collect())
    }
}

// =============================================================================
// Performance snapshot
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: u64,
    pub policy_version: u64,
    pub reward_avg: f64,
    /// Mean trade ROI over events that carried a trade
    pub rolling_roi: f64,
    /// Fraction of events with reward > 0
    pub win_rate: f64,
    /// Best reward in the cycle minus the mean
    pub regret: f64,
    /// Bundle processing time
    pub latency_ms: f64,
    pub experience_count: usize,
    pub buffer_size: usize,
    pub drift_score: f64,
}

impl PerformanceSnapshot {
    pub fn from_cycle(
        events: &[TelemetryEvent],
        drift_scores: &[f64],
        bundle_latency_ms: f64,
        policy_version: u64,
        buffer_size: usize,
        timestamp: u64,
    ) -> Self {
        let rewards: Vec<f64> = events.iter().map(|e| stats::finite_or_zero(e.reward)).collect();
        let rois: Vec<f64> = events.iter().filter_map(|e| e.trade.map(|t| t.roi)).collect();
        let reward_avg = stats::mean(&rewards);
        let best = rewards.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            timestamp,
            policy_version,
            reward_avg,
            rolling_roi: stats::mean(&rois),
            win_rate: if rewards.is_empty() {
                0.0
            } else {
                rewards.iter().filter(|r| **r > 0.0).count() as f64 / rewards.len() as f64
            },
            regret: if rewards.is_empty() { 0.0 } else { best - reward_avg },
            latency_ms: bundle_latency_ms,
            experience_count: events.len(),
            buffer_size,
            drift_score: stats::mean(drift_scores),
        }
    }
}

// =============================================================================
// Loop
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoMarketData,
    NoTelemetry,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoMarketData => "no_market_data",
            SkipReason::NoTelemetry => "no_telemetry",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Completed {
        snapshot: PerformanceSnapshot,
        decision: RetrainDecision,
        portfolio: Option<Portfolio>,
    },
}

pub struct TrainingLoop {
    cfg: TrainingConfig,
    source: Arc<dyn MarketDataSource>,
    telemetry: Arc<dyn TelemetryStream>,
    orchestrator: IntelligenceOrchestrator,
    buffer: ExperienceBuffer,
    policy: Box<dyn Policy>,
    encoder: Box<dyn FeatureEncoder>,
    scheduler: AutoRetrainScheduler,
    drift: DriftTracker,
    engine: Option<StrategyEngine>,
    store: Option<Box<dyn KnowledgeStore>>,
    cycles: u64,
}

impl TrainingLoop {
    pub fn new(
        cfg: TrainingConfig,
        source: Arc<dyn MarketDataSource>,
        telemetry: Arc<dyn TelemetryStream>,
        orchestrator: IntelligenceOrchestrator,
        buffer: ExperienceBuffer,
        policy: Box<dyn Policy>,
        scheduler: AutoRetrainScheduler,
    ) -> Self {
        Self {
            cfg,
            source,
            telemetry,
            orchestrator,
            buffer,
            policy,
            encoder: Box::new(StandardEncoder),
            scheduler,
            drift: DriftTracker::default(),
            engine: None,
            store: None,
            cycles: 0,
        }
    }

    pub fn with_encoder(mut self, encoder: Box<dyn FeatureEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_strategy_engine(mut self, engine: StrategyEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_store(mut self, store: Box<dyn KnowledgeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn buffer(&self) -> &ExperienceBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut ExperienceBuffer {
        &mut self.buffer
    }

    pub fn scheduler_mut(&mut self) -> &mut AutoRetrainScheduler {
        &mut self.scheduler
    }

    pub fn policy_version(&self) -> u64 {
        self.policy.version()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.cycles += 1;
        let cycle = self.cycles;
        let _prof = ProfileScope::with_context("training_cycle", &[("cycle", json!(cycle))]);

        let data = match self.source.fetch().await? {
            Some(d) if !d.is_empty() => d,
            _ => return Ok(self.skip(SkipReason::NoMarketData)),
        };

        let bundle = self.orchestrator.generate(&data).await;
        let portfolio = self
            .engine
            .as_mut()
            .map(|engine| engine.generate_portfolio(&data, Some(&bundle)));

        let events = self.telemetry.collect().await?;
        if events.is_empty() {
            return Ok(self.skip(SkipReason::NoTelemetry));
        }

        let mut drift_scores = Vec::with_capacity(events.len());
        let mut fresh = Vec::with_capacity(events.len());
        for event in &events {
            let drift = self.drift.observe(event);
            drift_scores.push(drift);
            let mut record = ExperienceRecord::new(self.encoder.encode(event, &bundle), event.reward, event.timestamp)
                .with_meta("event_type", v_str(&event.event_type))
                .with_meta("drift", v_num(drift))
                .with_meta("cycle", json!(cycle));
            if let Some(session) = &event.session_id {
                record = record.with_meta("session_id", v_str(session));
            }
            fresh.push(record);
        }
        self.drift.compute_overall();
        self.buffer.add_many(fresh.iter().cloned());

        let mut batch = fresh;
        if self.cfg.replay_sample > 0 {
            batch.extend(self.buffer.sample(self.cfg.replay_sample, self.cfg.weighted_sampling));
        }
        let metrics = self.policy.train(&batch)?;

        let now = logging::ts_epoch_ms();
        let snapshot = PerformanceSnapshot::from_cycle(
            &events,
            &drift_scores,
            bundle.latency_ms,
            metrics.version,
            self.buffer.size(),
            now,
        );
        let decision = self.scheduler.evaluate(&snapshot, now);
        if decision.triggered {
            self.retrain()?;
        }

        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.record_snapshot(&snapshot) {
                logging::log_persistence_failure("record_snapshot", "knowledge", &e.to_string());
            }
        }

        logging::info(
            Domain::Training,
            "cycle",
            &[
                ("cycle", json!(cycle)),
                ("events", v_num(events.len() as f64)),
                ("batch", v_num(metrics.samples as f64)),
                ("loss", v_num(metrics.loss)),
                ("reward_avg", v_num(snapshot.reward_avg)),
                ("win_rate", v_num(snapshot.win_rate)),
                ("drift", v_num(snapshot.drift_score)),
                ("buffer", v_num(snapshot.buffer_size as f64)),
                ("policy_version", json!(snapshot.policy_version)),
            ],
        );
        if let Some(p) = &portfolio {
            logging::info(
                Domain::Strategy,
                "targets",
                &[("cycle", json!(cycle)), ("positions", json!(p.positions))],
            );
        }

        Ok(CycleOutcome::Completed { snapshot, decision, portfolio })
    }

    /// Full replay pass after a scheduler trigger.
    fn retrain(&mut self) -> Result<()> {
        let n = self.cfg.replay_sample.max(1) * 4;
        let batch = self.buffer.sample(n, self.cfg.weighted_sampling);
        let metrics = self.policy.train(&batch)?;
        logging::info(
            Domain::Retrain,
            "retrained",
            &[
                ("samples", v_num(metrics.samples as f64)),
                ("loss", v_num(metrics.loss)),
                ("policy_version", json!(metrics.version)),
            ],
        );
        Ok(())
    }

    fn skip(&self, reason: SkipReason) -> CycleOutcome {
        logging::info(
            Domain::Training,
            "cycle_skipped",
            &[("cycle", json!(self.cycles)), ("reason", v_str(reason.as_str()))],
        );
        CycleOutcome::Skipped(reason)
    }

    /// Run cycles until `stop` is set. The flag is checked between cycles
    /// and while sleeping.
    pub async fn run(&mut self, stop: Arc<AtomicBool>) {
        let interval = Duration::from_secs(self.cfg.interval_secs);
        let backoff = Duration::from_secs(self.cfg.error_backoff_secs);
        while !stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            let pause = match self.run_cycle().await {
                Ok(_) => interval.saturating_sub(started.elapsed()),
                Err(e) => {
                    logging::error(
                        Domain::Training,
                        "cycle_failed",
                        &[("cycle", json!(self.cycles)), ("error", v_str(&e.to_string()))],
                    );
                    backoff
                }
            };
            sleep_unless_stopped(pause, &stop).await;
        }
        logging::info(Domain::Training, "stopped", &[("cycles", json!(self.cycles))]);
    }
}

async fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(250);
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        tokio::time::sleep(left.min(slice)).await;
    }
}
