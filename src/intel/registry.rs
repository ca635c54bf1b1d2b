//! Module interface and the startup-time name → factory registry.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::modules::{
    CorrelationModule, FundingModule, LiquidityModule, RegimeModule, RiskModule, VolatilityModule,
};
use super::ModuleAnalysis;
use crate::config::{OrchestratorConfig, RiskConfig, StrategyEngineConfig};
use crate::error::{PipelineError, Result};
use crate::market::MarketData;

pub const BUILTIN_MODULES: [&str; 6] = ["volatility", "correlation", "regime", "liquidity", "funding", "risk"];

#[async_trait]
pub trait IntelligenceModule: Send + Sync {
    fn name(&self) -> &str;
    async fn analyze(&self, data: &MarketData) -> Result<ModuleAnalysis>;
}

/// Everything a factory may need to configure its module.
#[derive(Debug, Clone, Default)]
pub struct ModuleContext {
    pub orchestrator: OrchestratorConfig,
    pub risk: RiskConfig,
    pub strategy: StrategyEngineConfig,
}

pub type ModuleFactory = Box<dyn Fn(&ModuleContext) -> Arc<dyn IntelligenceModule> + Send + Sync>;

pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ModuleRegistry {
    pub fn empty() -> Self {
        Self { factories: BTreeMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register("volatility", Box::new(|_| Arc::new(VolatilityModule::default())));
        reg.register("correlation", Box::new(|_| Arc::new(CorrelationModule::default())));
        reg.register("regime", Box::new(|_| Arc::new(RegimeModule::default())));
        reg.register("liquidity", Box::new(|_| Arc::new(LiquidityModule::default())));
        reg.register(
            "funding",
            Box::new(|ctx| Arc::new(FundingModule::new(ctx.orchestrator.funding_threshold))),
        );
        reg.register(
            "risk",
            Box::new(|ctx| {
                Arc::new(RiskModule::new(
                    ctx.risk.clone(),
                    ctx.strategy.target_var,
                    ctx.strategy.drawdown_limit,
                ))
            }),
        );
        reg
    }

    pub fn register(&mut self, name: &str, factory: ModuleFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Instantiate the named modules in the given order. An unknown name is
    /// a configuration error, never a runtime one.
    pub fn build(&self, names: &[String], ctx: &ModuleContext) -> Result<Vec<Arc<dyn IntelligenceModule>>> {
        names
            .iter()
            .map(|name| {
                self.factories
                    .get(name)
                    .map(|factory| factory(ctx))
                    .ok_or_else(|| PipelineError::config(format!("no intelligence module registered as '{}'", name)))
            })
            .collect()
    }
}
