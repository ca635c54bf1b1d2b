//! Decision-support pipeline: concurrent market intelligence, rolling risk
//! metrics, regime-weighted strategy allocation and replay-driven policy
//! retraining.

pub mod config;
pub mod drift_tracker;
pub mod error;
pub mod experience;
pub mod intel;
pub mod knowledge;
pub mod logging;
pub mod market;
pub mod regime;
pub mod retrain;
pub mod risk;
pub mod signals;
pub mod stats;
pub mod storage;
pub mod strategies;
pub mod strategy_engine;
pub mod synthetic;
pub mod training;
