//! Structured logging for the decision pipeline.
//!
//! Every record is one JSON object per line with a run id, a monotonic
//! sequence number, level, domain and free-form data. Records land in the
//! run directory (`events.jsonl` for info and above, `trace.jsonl` for
//! trace/debug) and are echoed to stdout unless `LOG_STDOUT=0`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    const ALL: [Level; 5] = [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error];

    pub fn parse(s: &str) -> Option<Level> {
        Self::ALL.into_iter().find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// `LOG_LEVEL`, read once per process; unknown values mean info.
    pub fn threshold() -> Level {
        static THRESHOLD: OnceLock<Level> = OnceLock::new();
        *THRESHOLD.get_or_init(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|v| Level::parse(&v))
                .unwrap_or(Level::Info)
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,   // Data source fetches, telemetry
    Risk,     // Rolling risk metrics, limits
    Regime,   // Ensemble votes
    Strategy, // Signal combination, target positions
    Intel,    // Module fan-out and aggregation
    Buffer,   // Experience store, snapshots
    Training, // Cycles, policy updates
    Retrain,  // Scheduler decisions
    System,   // Startup, shutdown, config
    Profile,  // Timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Risk => "risk",
            Domain::Regime => "regime",
            Domain::Strategy => "strategy",
            Domain::Intel => "intel",
            Domain::Buffer => "buffer",
            Domain::Training => "training",
            Domain::Retrain => "retrain",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
    stdout: bool,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.to_string_lossy(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let stdout = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));
        // LOG_DIR=none keeps everything on stdout only
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        if base == "none" {
            return RunContext { run_id, events: None, trace: None, stdout };
        }
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, events: None, trace: None, stdout };
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
            stdout,
        }
    })
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["module", "strategy_id", "cycle", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::threshold() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.stdout {
        println!("{}", line);
    }
}

pub fn info(domain: Domain, event: &str, fields: &[(&str, Value)]) {
    log(Level::Info, domain, event, obj(fields));
}

pub fn warn(domain: Domain, event: &str, fields: &[(&str, Value)]) {
    log(Level::Warn, domain, event, obj(fields));
}

pub fn debug(domain: Domain, event: &str, fields: &[(&str, Value)]) {
    log(Level::Debug, domain, event, obj(fields));
}

pub fn error(domain: Domain, event: &str, fields: &[(&str, Value)]) {
    log(Level::Error, domain, event, obj(fields));
}

// =============================================================================
// Domain-Specific Helpers
// =============================================================================

/// A module finished, failed or timed out inside the fan-out.
pub fn log_module_result(module: &str, ok: bool, processing_ms: f64, error: Option<&str>) {
    let level = if ok { Level::Debug } else { Level::Warn };
    log(
        level,
        Domain::Intel,
        "module_result",
        obj(&[
            ("module", v_str(module)),
            ("ok", Value::Bool(ok)),
            ("processing_ms", v_num(processing_ms)),
            ("error", error.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_regime_vote(regime: &str, votes: &[(&str, &str)]) {
    let votes: Vec<Value> = votes
        .iter()
        .map(|(classifier, label)| json!({"classifier": classifier, "label": label}))
        .collect();
    log(
        Level::Debug,
        Domain::Regime,
        "vote",
        obj(&[("regime", v_str(regime)), ("votes", Value::Array(votes))]),
    );
}

pub fn log_persistence_failure(op: &str, path: &str, err: &str) {
    log(
        Level::Warn,
        Domain::Buffer,
        "persistence_failure",
        obj(&[
            ("op", v_str(op)),
            ("path", v_str(path)),
            ("error", v_str(err)),
        ]),
    );
}

pub fn log_retrain(triggered: bool, reasons: &[String], policy_version: u64) {
    let level = if triggered { Level::Warn } else { Level::Debug };
    log(
        level,
        Domain::Retrain,
        "decision",
        obj(&[
            ("triggered", Value::Bool(triggered)),
            (
                "reasons",
                Value::Array(reasons.iter().map(|r| v_str(r)).collect()),
            ),
            ("policy_version", json!(policy_version)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

/// Non-finite numbers become null rather than breaking the JSON line.
pub fn v_num(n: f64) -> Value {
    if n.is_finite() {
        json!(n)
    } else {
        Value::Null
    }
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits a trace record with elapsed milliseconds when dropped.
/// `PROFILE_SAMPLE` in [0, 1] keeps roughly that share of scopes.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            label,
            context: sampled().then(|| obj(fields)),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

fn sampled() -> bool {
    let rate = std::env::var("PROFILE_SAMPLE")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(1.0);
    if rate >= 1.0 {
        return true;
    }
    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
    ((seq % 10_000) as f64) < rate * 10_000.0
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let Some(mut fields) = self.context.take() else {
            return;
        };
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(self.elapsed_ms()));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_and_order() {
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse(" debug "), Some(Level::Debug));
        assert_eq!(Level::parse("verbose"), None);
        assert!(Level::Trace < Level::Debug && Level::Warn < Level::Error);
    }

    #[test]
    fn test_profile_scope_records_context() {
        let scope = ProfileScope::with_context("unit", &[("cycle", json!(3))]);
        if let Some(ctx) = &scope.context {
            assert_eq!(ctx.get("cycle"), Some(&json!(3)));
        }
        assert!(scope.elapsed_ms() >= 0.0);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_non_finite_numbers_are_null() {
        assert_eq!(v_num(f64::NAN), Value::Null);
        assert_eq!(v_num(f64::INFINITY), Value::Null);
    }

    #[test]
    fn test_split_fields_lifts_module() {
        let (top, data) = split_fields(obj(&[("module", v_str("risk")), ("x", v_num(1.0))]));
        assert_eq!(top.get("module").unwrap(), "risk");
        assert!(data.contains_key("x"));
        assert!(!data.contains_key("module"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
