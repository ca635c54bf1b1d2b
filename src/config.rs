//! Environment-driven configuration.
//!
//! Every knob has a typed default; `Config::validate` is the single place
//! malformed thresholds are rejected and must be called before anything runs.

use crate::error::{PipelineError, Result};
use crate::intel::registry::BUILTIN_MODULES;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// ReturnSeries ring capacity
    pub return_capacity: usize,
    /// Bounded RiskSnapshot history
    pub history_capacity: usize,
    /// Base single-position limit (fraction of portfolio)
    pub max_position: f64,
    /// Base gross leverage limit
    pub max_leverage: f64,
    /// Annualized volatility above which limits shrink
    pub target_volatility: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            return_capacity: 252,
            history_capacity: 365,
            max_position: 0.25,
            max_leverage: 1.5,
            target_volatility: 0.15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyEngineConfig {
    pub max_allocation: f64,
    pub max_leverage: f64,
    pub target_volatility: f64,
    /// Daily VaR budget used for the risk scale
    pub target_var: f64,
    pub drawdown_limit: f64,
    /// Global confidence when no bundle is available
    pub default_confidence: f64,
    /// Volatility assumed when neither intelligence nor market data has one
    pub default_volatility: f64,
}

impl Default for StrategyEngineConfig {
    fn default() -> Self {
        Self {
            max_allocation: 0.25,
            max_leverage: 1.5,
            target_volatility: 0.15,
            target_var: 0.02,
            drawdown_limit: 0.20,
            default_confidence: 0.5,
            default_volatility: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub modules: Vec<String>,
    pub module_timeout_ms: u64,
    pub meta_history: usize,
    pub healthy_threshold: f64,
    pub moderate_threshold: f64,
    /// Minimum |funding rate| per period to flag an arbitrage opportunity
    pub funding_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            modules: BUILTIN_MODULES.iter().map(|m| m.to_string()).collect(),
            module_timeout_ms: 30_000,
            meta_history: 200,
            healthy_threshold: 0.7,
            moderate_threshold: 0.4,
            funding_threshold: 0.0001,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub capacity: usize,
    pub ttl_secs: Option<u64>,
    pub epsilon: f64,
    pub snapshot_path: String,
    pub seed: Option<u64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: None,
            epsilon: 1e-3,
            snapshot_path: "./experience.jsonl".to_string(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub interval_secs: u64,
    pub error_backoff_secs: u64,
    /// Extra replay records sampled on top of the fresh ones (0 = none)
    pub replay_sample: usize,
    pub weighted_sampling: bool,
    pub sqlite_path: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            error_backoff_secs: 300,
            replay_sample: 64,
            weighted_sampling: true,
            sqlite_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub min_reward_avg: f64,
    pub min_win_rate: f64,
    pub max_drift_score: f64,
    pub min_buffer_size: usize,
    pub cooldown_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_reward_avg: 0.0,
            min_win_rate: 0.45,
            max_drift_score: 2.0,
            min_buffer_size: 100,
            cooldown_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub risk: RiskConfig,
    pub strategy: StrategyEngineConfig,
    pub orchestrator: OrchestratorConfig,
    pub buffer: BufferConfig,
    pub training: TrainingConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            risk: RiskConfig {
                return_capacity: env_or("RISK_RETURN_CAPACITY", d.risk.return_capacity),
                history_capacity: env_or("RISK_HISTORY_CAPACITY", d.risk.history_capacity),
                max_position: env_or("RISK_MAX_POSITION", d.risk.max_position),
                max_leverage: env_or("RISK_MAX_LEVERAGE", d.risk.max_leverage),
                target_volatility: env_or("RISK_TARGET_VOL", d.risk.target_volatility),
            },
            strategy: StrategyEngineConfig {
                max_allocation: env_or("MAX_ALLOCATION", d.strategy.max_allocation),
                max_leverage: env_or("MAX_LEVERAGE", d.strategy.max_leverage),
                target_volatility: env_or("TARGET_VOL", d.strategy.target_volatility),
                target_var: env_or("TARGET_VAR", d.strategy.target_var),
                drawdown_limit: env_or("DRAWDOWN_LIMIT", d.strategy.drawdown_limit),
                default_confidence: env_or("DEFAULT_CONFIDENCE", d.strategy.default_confidence),
                default_volatility: env_or("DEFAULT_VOL", d.strategy.default_volatility),
            },
            orchestrator: OrchestratorConfig {
                modules: std::env::var("INTEL_MODULES")
                    .map(|v| {
                        v.split(',')
                            .map(|m| m.trim().to_string())
                            .filter(|m| !m.is_empty())
                            .collect()
                    })
                    .unwrap_or(d.orchestrator.modules),
                module_timeout_ms: env_or("MODULE_TIMEOUT_MS", d.orchestrator.module_timeout_ms),
                meta_history: env_or("META_HISTORY", d.orchestrator.meta_history),
                healthy_threshold: env_or("HEALTHY_TH", d.orchestrator.healthy_threshold),
                moderate_threshold: env_or("MODERATE_TH", d.orchestrator.moderate_threshold),
                funding_threshold: env_or("FUNDING_TH", d.orchestrator.funding_threshold),
            },
            buffer: BufferConfig {
                capacity: env_or("BUFFER_CAPACITY", d.buffer.capacity),
                ttl_secs: env_opt("BUFFER_TTL_SECS"),
                epsilon: env_or("BUFFER_EPSILON", d.buffer.epsilon),
                snapshot_path: std::env::var("BUFFER_SNAPSHOT")
                    .unwrap_or(d.buffer.snapshot_path),
                seed: env_opt("BUFFER_SEED"),
            },
            training: TrainingConfig {
                interval_secs: env_or("TRAIN_INTERVAL_SECS", d.training.interval_secs),
                error_backoff_secs: env_or("TRAIN_BACKOFF_SECS", d.training.error_backoff_secs),
                replay_sample: env_or("REPLAY_SAMPLE", d.training.replay_sample),
                weighted_sampling: env_flag("REPLAY_WEIGHTED", d.training.weighted_sampling),
                sqlite_path: std::env::var("SQLITE_PATH").ok(),
            },
            scheduler: SchedulerConfig {
                min_reward_avg: env_or("RETRAIN_MIN_REWARD", d.scheduler.min_reward_avg),
                min_win_rate: env_or("RETRAIN_MIN_WIN_RATE", d.scheduler.min_win_rate),
                max_drift_score: env_or("RETRAIN_MAX_DRIFT", d.scheduler.max_drift_score),
                min_buffer_size: env_or("RETRAIN_MIN_BUFFER", d.scheduler.min_buffer_size),
                cooldown_minutes: env_or("RETRAIN_COOLDOWN_MIN", d.scheduler.cooldown_minutes),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.risk.validate()?;
        self.strategy.validate()?;
        self.orchestrator.validate()?;
        self.buffer.validate()?;
        self.training.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

fn check_positive(name: &str, v: f64) -> Result<()> {
    if !v.is_finite() || v <= 0.0 {
        return Err(PipelineError::config(format!("{} must be positive and finite, got {}", name, v)));
    }
    Ok(())
}

fn check_unit(name: &str, v: f64) -> Result<()> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(PipelineError::config(format!("{} must be in [0, 1], got {}", name, v)));
    }
    Ok(())
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.return_capacity < 2 {
            return Err(PipelineError::config("return_capacity must be at least 2"));
        }
        if self.history_capacity == 0 {
            return Err(PipelineError::config("history_capacity must be positive"));
        }
        check_positive("risk.max_position", self.max_position)?;
        check_positive("risk.max_leverage", self.max_leverage)?;
        check_positive("risk.target_volatility", self.target_volatility)
    }
}

impl StrategyEngineConfig {
    pub fn validate(&self) -> Result<()> {
        check_positive("max_allocation", self.max_allocation)?;
        check_positive("max_leverage", self.max_leverage)?;
        check_positive("target_volatility", self.target_volatility)?;
        check_positive("target_var", self.target_var)?;
        check_positive("drawdown_limit", self.drawdown_limit)?;
        check_positive("default_volatility", self.default_volatility)?;
        check_unit("default_confidence", self.default_confidence)
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.module_timeout_ms == 0 {
            return Err(PipelineError::config("module_timeout_ms must be positive"));
        }
        if self.meta_history == 0 {
            return Err(PipelineError::config("meta_history must be positive"));
        }
        check_unit("healthy_threshold", self.healthy_threshold)?;
        check_unit("moderate_threshold", self.moderate_threshold)?;
        if self.moderate_threshold >= self.healthy_threshold {
            return Err(PipelineError::config(
                "moderate_threshold must be below healthy_threshold",
            ));
        }
        if !self.funding_threshold.is_finite() || self.funding_threshold < 0.0 {
            return Err(PipelineError::config("funding_threshold must be non-negative"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in &self.modules {
            if !BUILTIN_MODULES.contains(&name.as_str()) {
                return Err(PipelineError::config(format!("unknown intelligence module '{}'", name)));
            }
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::config(format!("intelligence module '{}' listed twice", name)));
            }
        }
        Ok(())
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(PipelineError::config("buffer capacity must be positive"));
        }
        if self.ttl_secs == Some(0) {
            return Err(PipelineError::config("buffer ttl must be positive when set"));
        }
        check_positive("buffer.epsilon", self.epsilon)
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(PipelineError::config("training interval must be positive"));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.min_reward_avg.is_finite() {
            return Err(PipelineError::config("min_reward_avg must be finite"));
        }
        check_unit("min_win_rate", self.min_win_rate)?;
        check_positive("max_drift_score", self.max_drift_score)
    }
}
