//! Reference scenarios for the risk engine and the replay buffer, checked
//! through the public API the way the training loop drives them.

use std::collections::BTreeMap;
use std::fs;

use fusionfx::config::{BufferConfig, RiskConfig};
use fusionfx::experience::{ExperienceBuffer, ExperienceRecord, StateVector};
use fusionfx::risk::RiskMetricsEngine;

fn quiet() {
    std::env::set_var("LOG_DIR", "none");
    std::env::set_var("LOG_STDOUT", "0");
}

fn record(reward: f64, ts: u64) -> ExperienceRecord {
    ExperienceRecord::new(StateVector::flat(vec![reward, 1.0]), reward, ts)
}

#[test]
fn test_five_day_tape_tail_risk() {
    quiet();
    let mut engine = RiskMetricsEngine::new(RiskConfig::default());
    engine.record_many(&[0.02, -0.03, 0.01, -0.015, 0.005]);
    let snap = engine.latest();

    // 5th percentile interpolates between the two worst days
    assert!((snap.var_95 - (-0.027)).abs() < 1e-12, "var_95={}", snap.var_95);
    // only the -3% day sits at or below it
    assert!((snap.cvar_95 - (-0.03)).abs() < 1e-12, "cvar_95={}", snap.cvar_95);
    assert!(snap.cvar_95 <= snap.var_95);
    assert!(snap.max_drawdown < 0.0 && snap.max_drawdown >= -1.0);
    assert_eq!(snap.observations, 5);
}

#[test]
fn test_weight_book_liquidity_and_concentration() {
    quiet();
    let mut engine = RiskMetricsEngine::new(RiskConfig::default());
    engine.record_many(&[0.01, -0.01, 0.005]);
    let book: BTreeMap<String, f64> = [("A", 0.4), ("B", 0.35), ("C", 0.25)]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();

    let snap = engine.snapshot(1.0, Some(&book), Some(1_000_000.0));
    let liq = snap.liquidity.unwrap();
    assert!(!liq.notional_basis);
    assert!((liq.turnover_ratio - 1.0).abs() < 1e-12);
    assert!((liq.liquidity_pressure - 0.4).abs() < 1e-12);

    let conc = snap.concentration.unwrap();
    let expected = 0.4f64.powi(2) + 0.35f64.powi(2) + 0.25f64.powi(2);
    assert!((conc.herfindahl - expected).abs() < 1e-12);
    assert!((conc.largest_weight - 0.4).abs() < 1e-12);
}

#[test]
fn test_leverage_scales_tail_metrics() {
    quiet();
    let mut engine = RiskMetricsEngine::new(RiskConfig::default());
    engine.record_many(&[0.02, -0.03, 0.01, -0.015, 0.005]);
    let base = engine.snapshot(1.0, None, None);
    let levered = engine.snapshot(2.0, None, None);
    assert!((levered.var_95 - 2.0 * base.var_95).abs() < 1e-12);
    assert!((levered.cvar_99 - 2.0 * base.cvar_99).abs() < 1e-12);
    assert_eq!(levered.leverage, 2.0);
}

#[test]
fn test_full_buffer_keeps_highest_priorities() {
    quiet();
    let mut buffer = ExperienceBuffer::new(BufferConfig { capacity: 4, seed: Some(1), ..Default::default() });
    for (i, reward) in [0.9, -0.05, 0.4, 0.01, -0.7, 0.2].iter().enumerate() {
        buffer.add(record(*reward, i as u64), None);
    }
    assert_eq!(buffer.len(), 4);
    let mut kept: Vec<f64> = buffer.records().map(|r| r.reward).collect();
    kept.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(kept, vec![-0.7, 0.2, 0.4, 0.9]);
}

#[test]
fn test_snapshot_survives_restart_into_smaller_buffer() {
    quiet();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay").join("buffer.jsonl");

    let mut first = ExperienceBuffer::new(BufferConfig { capacity: 50, seed: Some(2), ..Default::default() });
    for i in 0..10u64 {
        first.add(record(0.1 * i as f64, 1_000 + i).with_meta("cycle", serde_json::json!(i)), None);
    }
    assert_eq!(first.save_snapshot(Some(&path)).unwrap(), 10);
    let lines = fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().count(), 10);
    assert!(lines.lines().all(|l| l.contains("\"kind\":\"experience\"")));

    let mut second = ExperienceBuffer::new(BufferConfig { capacity: 3, seed: Some(2), ..Default::default() });
    assert_eq!(second.load_snapshot(&path).unwrap(), 3);
    let stamps: Vec<u64> = second.records().map(|r| r.timestamp).collect();
    assert_eq!(stamps, vec![1_007, 1_008, 1_009]);
    let newest = second.records().last().unwrap();
    assert_eq!(newest.metadata.get("cycle"), Some(&serde_json::json!(9)));
    assert!(newest.priority > 0.0);
}

#[test]
fn test_missing_snapshot_leaves_buffer_intact() {
    quiet();
    let dir = tempfile::tempdir().unwrap();
    let mut buffer = ExperienceBuffer::new(BufferConfig { capacity: 10, seed: Some(5), ..Default::default() });
    buffer.add(record(0.5, 1), None);
    let err = buffer.load_snapshot(&dir.path().join("absent.jsonl")).unwrap_err();
    assert_eq!(err.kind(), "persistence");
    assert_eq!(buffer.len(), 1);
}
