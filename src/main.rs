use anyhow::Result;
use fusionfx::config::Config;
use fusionfx::experience::ExperienceBuffer;
use fusionfx::intel::registry::{ModuleContext, ModuleRegistry};
use fusionfx::intel::IntelligenceOrchestrator;
use fusionfx::logging::{self, v_num, v_str, Domain};
use fusionfx::retrain::{AutoRetrainScheduler, RetrainDecision};
use fusionfx::storage::SqliteStore;
use fusionfx::strategy_engine::StrategyEngine;
use fusionfx::synthetic::{SyntheticConfig, SyntheticMarket, SyntheticTelemetry, TelemetryConfig};
use fusionfx::training::{LinearPolicy, PerformanceSnapshot, TrainingLoop};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    // configuration errors are the only ones allowed to stop startup
    cfg.validate()?;

    logging::info(
        Domain::System,
        "startup",
        &[
            ("modules", json!(cfg.orchestrator.modules)),
            ("module_timeout_ms", json!(cfg.orchestrator.module_timeout_ms)),
            ("interval_secs", json!(cfg.training.interval_secs)),
            ("buffer_capacity", json!(cfg.buffer.capacity)),
        ],
    );

    let ctx = ModuleContext {
        orchestrator: cfg.orchestrator.clone(),
        risk: cfg.risk.clone(),
        strategy: cfg.strategy.clone(),
    };
    let orchestrator = IntelligenceOrchestrator::from_config(&ModuleRegistry::with_builtins(), &ctx)?;

    let mut buffer = ExperienceBuffer::new(cfg.buffer.clone());
    let snapshot_path = cfg.buffer.snapshot_path.clone();
    if Path::new(&snapshot_path).exists() {
        // a bad snapshot is logged inside and treated as "no snapshot"
        let _ = buffer.load_snapshot(Path::new(&snapshot_path));
    }

    let mut scheduler = AutoRetrainScheduler::new(&cfg.scheduler);
    scheduler.on_retrain(Box::new(|decision: &RetrainDecision, snapshot: &PerformanceSnapshot| {
        logging::warn(
            Domain::Retrain,
            "retrain_triggered",
            &[
                ("reason", v_str(&decision.reason())),
                ("reward_avg", v_num(snapshot.reward_avg)),
                ("win_rate", v_num(snapshot.win_rate)),
                ("drift", v_num(snapshot.drift_score)),
            ],
        );
    }));

    let market = SyntheticMarket::new(SyntheticConfig { seed: cfg.buffer.seed.unwrap_or(42), ..Default::default() });
    market.warm_up(60)?;
    let telemetry = SyntheticTelemetry::new(TelemetryConfig::default());

    let mut training = TrainingLoop::new(
        cfg.training.clone(),
        Arc::new(market),
        Arc::new(telemetry),
        orchestrator,
        buffer,
        Box::new(LinearPolicy::default()),
        scheduler,
    )
    .with_strategy_engine(StrategyEngine::new(cfg.strategy.clone(), cfg.risk.clone()));

    if let Some(path) = &cfg.training.sqlite_path {
        match SqliteStore::open(path) {
            Ok(store) => training = training.with_store(Box::new(store)),
            Err(e) => logging::log_persistence_failure("open", path, &e.to_string()),
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logging::info(Domain::System, "stop_requested", &[]);
            flag.store(true, Ordering::SeqCst);
        }
    });

    training.run(Arc::clone(&stop)).await;

    let _ = training.buffer().save_snapshot(Some(Path::new(&snapshot_path)));
    logging::info(
        Domain::System,
        "shutdown",
        &[
            ("cycles", json!(training.cycles())),
            ("policy_version", json!(training.policy_version())),
            ("buffer", v_num(training.buffer().len() as f64)),
        ],
    );
    Ok(())
}
