//! Intelligence fan-out and aggregation.
//!
//! Every configured module runs as its own task against a shared snapshot
//! of the market data. The orchestrator waits on one deadline for all of
//! them; whatever has not finished by then is aborted and reported as
//! `timeout`. Failures and panics become error-tagged results, so a single
//! bad module never costs the cycle.

pub mod aggregate;
pub mod modules;
pub mod registry;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::logging::{self, v_num, Domain, ProfileScope};
use crate::market::MarketData;
use crate::regime::Regime;

use aggregate::{derive_insights, market_health, unify, Insight, MarketHealth, MetaConfidenceTracker, UnifiedSignals};
use modules::{CorrelationReport, FundingReport, LiquidityReport, RegimeReport, RiskPosture, VolatilityReport};
use registry::{IntelligenceModule, ModuleContext, ModuleRegistry};

pub const TIMEOUT_ERROR: &str = "timeout";

// =============================================================================
// Module results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleOutput {
    Volatility(VolatilityReport),
    Correlation(CorrelationReport),
    Regime(RegimeReport),
    Liquidity(LiquidityReport),
    Funding(FundingReport),
    Risk(RiskPosture),
}

/// What a module returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleAnalysis {
    pub output: ModuleOutput,
    /// Fraction of the expected input the module actually had, in [0, 1]
    pub data_quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleStatus {
    Ok { output: ModuleOutput, data_quality: f64 },
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module: String,
    #[serde(flatten)]
    pub status: ModuleStatus,
    pub processing_ms: f64,
}

impl ModuleResult {
    pub fn ok(module: &str, analysis: ModuleAnalysis, processing_ms: f64) -> Self {
        Self {
            module: module.to_string(),
            status: ModuleStatus::Ok {
                output: analysis.output,
                data_quality: analysis.data_quality.clamp(0.0, 1.0),
            },
            processing_ms,
        }
    }

    pub fn failed(module: &str, error: impl Into<String>, processing_ms: f64) -> Self {
        Self {
            module: module.to_string(),
            status: ModuleStatus::Error { error: error.into() },
            processing_ms,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            ModuleStatus::Error { error } => Some(error),
            ModuleStatus::Ok { .. } => None,
        }
    }

    pub fn output(&self) -> Option<&ModuleOutput> {
        match &self.status {
            ModuleStatus::Ok { output, .. } => Some(output),
            ModuleStatus::Error { .. } => None,
        }
    }

    pub fn data_quality(&self) -> f64 {
        match &self.status {
            ModuleStatus::Ok { data_quality, .. } => *data_quality,
            ModuleStatus::Error { .. } => 0.0,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, ModuleStatus::Ok { .. })
    }
}

// =============================================================================
// Bundle
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligenceBundle {
    pub timestamp: u64,
    pub results: BTreeMap<String, ModuleResult>,
    pub insights: Vec<Insight>,
    pub meta_confidence: BTreeMap<String, f64>,
    pub market_health: MarketHealth,
    pub unified: UnifiedSignals,
    /// Wall time of the whole fan-out plus aggregation
    pub latency_ms: f64,
}

impl IntelligenceBundle {
    pub fn result(&self, module: &str) -> Option<&ModuleResult> {
        self.results.get(module)
    }

    pub fn regime(&self) -> Option<Regime> {
        self.unified.regime
    }

    pub fn confidence(&self, module: &str) -> Option<f64> {
        self.meta_confidence.get(module).copied()
    }

    pub fn failed_modules(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|r| !r.is_ok())
            .map(|r| r.module.as_str())
            .collect()
    }

    pub fn volatility(&self) -> Option<&VolatilityReport> {
        match self.result("volatility")?.output()? {
            ModuleOutput::Volatility(v) => Some(v),
            _ => None,
        }
    }

    pub fn correlation(&self) -> Option<&CorrelationReport> {
        match self.result("correlation")?.output()? {
            ModuleOutput::Correlation(c) => Some(c),
            _ => None,
        }
    }

    pub fn regime_report(&self) -> Option<&RegimeReport> {
        match self.result("regime")?.output()? {
            ModuleOutput::Regime(r) => Some(r),
            _ => None,
        }
    }

    pub fn liquidity(&self) -> Option<&LiquidityReport> {
        match self.result("liquidity")?.output()? {
            ModuleOutput::Liquidity(l) => Some(l),
            _ => None,
        }
    }

    pub fn funding(&self) -> Option<&FundingReport> {
        match self.result("funding")?.output()? {
            ModuleOutput::Funding(f) => Some(f),
            _ => None,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct IntelligenceOrchestrator {
    modules: Vec<Arc<dyn IntelligenceModule>>,
    cfg: OrchestratorConfig,
    meta: MetaConfidenceTracker,
}

impl IntelligenceOrchestrator {
    pub fn new(modules: Vec<Arc<dyn IntelligenceModule>>, cfg: OrchestratorConfig) -> Self {
        let meta = MetaConfidenceTracker::new(cfg.meta_history);
        Self { modules, cfg, meta }
    }

    /// Build the configured module list through the registry. Unknown names
    /// fail here, before any cycle runs.
    pub fn from_config(registry: &ModuleRegistry, ctx: &ModuleContext) -> Result<Self> {
        let modules = registry.build(&ctx.orchestrator.modules, ctx)?;
        Ok(Self::new(modules, ctx.orchestrator.clone()))
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn meta_tracker(&self) -> &MetaConfidenceTracker {
        &self.meta
    }

    pub async fn generate(&mut self, data: &MarketData) -> IntelligenceBundle {
        let _prof = ProfileScope::with_context("intel_generate", &[("modules", v_num(self.modules.len() as f64))]);
        let started = Instant::now();
        let results = self.fan_out(data).await;

        let insights = derive_insights(&results);
        let meta_confidence = self.meta.update(&results);
        let market_health = market_health(&results, &self.cfg);
        let unified = unify(&results, &meta_confidence);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        logging::info(
            Domain::Intel,
            "bundle",
            &[
                ("modules", v_num(results.len() as f64)),
                ("failed", v_num(results.values().filter(|r| !r.is_ok()).count() as f64)),
                ("insights", v_num(insights.len() as f64)),
                ("health", v_num(market_health.score)),
                ("confidence", v_num(unified.overall_confidence)),
                ("latency_ms", v_num(latency_ms)),
            ],
        );

        IntelligenceBundle {
            timestamp: data.timestamp,
            results,
            insights,
            meta_confidence,
            market_health,
            unified,
            latency_ms,
        }
    }

    async fn fan_out(&self, data: &MarketData) -> BTreeMap<String, ModuleResult> {
        let shared = Arc::new(data.clone());
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.cfg.module_timeout_ms);

        let mut pending = FuturesUnordered::new();
        let mut aborts = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let name = module.name().to_string();
            let module = Arc::clone(module);
            let data = Arc::clone(&shared);
            let handle = tokio::spawn(async move {
                let t0 = Instant::now();
                let outcome = module.analyze(&data).await;
                (outcome, t0.elapsed().as_secs_f64() * 1000.0)
            });
            aborts.push((name.clone(), handle.abort_handle()));
            pending.push(async move { (name, handle.await) });
        }

        let mut results = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((name, joined))) => {
                    let result = match joined {
                        Ok((Ok(analysis), ms)) => ModuleResult::ok(&name, analysis, ms),
                        Ok((Err(e), ms)) => ModuleResult::failed(&name, e.to_string(), ms),
                        Err(join_err) => ModuleResult::failed(
                            &name,
                            format!("module panicked: {}", join_err),
                            started.elapsed().as_secs_f64() * 1000.0,
                        ),
                    };
                    logging::log_module_result(&name, result.is_ok(), result.processing_ms, result.error());
                    results.insert(name, result);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        drop(pending);

        for (name, abort) in aborts {
            if results.contains_key(&name) {
                continue;
            }
            abort.abort();
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            logging::log_module_result(&name, false, elapsed, Some(TIMEOUT_ERROR));
            results.insert(name.clone(), ModuleResult::failed(&name, TIMEOUT_ERROR, elapsed));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use async_trait::async_trait;
    use modules::VolatilityModule;

    struct Sleepy(u64);

    #[async_trait]
    impl IntelligenceModule for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn analyze(&self, _data: &MarketData) -> Result<ModuleAnalysis> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            Err(PipelineError::DataUnavailable("never reached in time".into()))
        }
    }

    struct Broken;

    #[async_trait]
    impl IntelligenceModule for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn analyze(&self, _data: &MarketData) -> Result<ModuleAnalysis> {
            Err(PipelineError::module("broken", "bad input"))
        }
    }

    struct Panicky;

    #[async_trait]
    impl IntelligenceModule for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn analyze(&self, _data: &MarketData) -> Result<ModuleAnalysis> {
            panic!("boom")
        }
    }

    fn cfg(timeout_ms: u64) -> OrchestratorConfig {
        OrchestratorConfig { module_timeout_ms: timeout_ms, ..Default::default() }
    }

    fn market() -> MarketData {
        let mut data = MarketData { timestamp: 42, ..Default::default() };
        data.returns.insert("BTC".into(), (0..40).map(|i| ((i % 5) as f64 - 2.0) / 100.0).collect());
        data
    }

    #[tokio::test]
    async fn test_slow_module_times_out_without_blocking_others() {
        let modules: Vec<Arc<dyn IntelligenceModule>> =
            vec![Arc::new(Sleepy(10_000)), Arc::new(VolatilityModule::default())];
        let mut orch = IntelligenceOrchestrator::new(modules, cfg(150));
        let t0 = Instant::now();
        let bundle = orch.generate(&market()).await;
        assert!(t0.elapsed() < Duration::from_secs(2), "took {:?}", t0.elapsed());
        assert_eq!(bundle.result("sleepy").and_then(|r| r.error()), Some(TIMEOUT_ERROR));
        assert!(bundle.result("volatility").map(|r| r.is_ok()).unwrap_or(false));
        assert_eq!(bundle.confidence("sleepy"), Some(0.1));
        assert_eq!(bundle.timestamp, 42);
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_isolated() {
        let modules: Vec<Arc<dyn IntelligenceModule>> =
            vec![Arc::new(Broken), Arc::new(Panicky), Arc::new(VolatilityModule::default())];
        let mut orch = IntelligenceOrchestrator::new(modules, cfg(1_000));
        let bundle = orch.generate(&market()).await;
        assert_eq!(bundle.results.len(), 3);
        let broken = bundle.result("broken").and_then(|r| r.error()).unwrap_or_default();
        assert!(broken.contains("bad input"), "{}", broken);
        let panicky = bundle.result("panicky").and_then(|r| r.error()).unwrap_or_default();
        assert!(panicky.contains("panicked"), "{}", panicky);
        let mut failed = bundle.failed_modules();
        failed.sort();
        assert_eq!(failed, vec!["broken", "panicky"]);
        assert!(bundle.volatility().is_some());
    }

    #[tokio::test]
    async fn test_from_config_builds_builtins() {
        let ctx = ModuleContext::default();
        let orch = IntelligenceOrchestrator::from_config(&ModuleRegistry::with_builtins(), &ctx).unwrap();
        assert_eq!(orch.module_names().len(), 6);
    }

    #[tokio::test]
    async fn test_empty_market_degrades_every_module() {
        let ctx = ModuleContext::default();
        let mut orch = IntelligenceOrchestrator::from_config(&ModuleRegistry::with_builtins(), &ctx).unwrap();
        let bundle = orch.generate(&MarketData::default()).await;
        assert_eq!(bundle.results.len(), 6);
        // regime always answers: missing inputs vote ranging
        assert_eq!(bundle.regime(), Some(Regime::Ranging));
        assert!(bundle.result("volatility").and_then(|r| r.error()).is_some());
        for (module, conf) in &bundle.meta_confidence {
            assert!((0.05..=1.0).contains(conf), "{} -> {}", module, conf);
        }
    }

    #[test]
    fn test_module_result_serializes_flat() {
        let r = ModuleResult::failed("funding", TIMEOUT_ERROR, 12.0);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["module"], "funding");
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"], "timeout");
    }
}
