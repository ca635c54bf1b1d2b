//! Prioritized, TTL-bounded experience replay store.
//!
//! Capacity eviction drops the lowest (priority, insertion order) record,
//! so high-reward experiences outlive merely recent ones. TTL pruning is
//! lazy and runs before `size` and `sample`.
//!
//! Snapshots are JSON lines, one self-describing record per line:
//! `{"kind":"experience","state":{"shape":[..],"data":[..]},"reward":..,...}`

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::BufferConfig;
use crate::error::{PipelineError, Result};
use crate::logging::{self, v_num, v_str, Domain};
use crate::stats;

const RECORD_KIND: &str = "experience";

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl StateVector {
    pub fn flat(data: Vec<f64>) -> Self {
        Self { shape: vec![data.len()], data }
    }

    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let v = Self { shape, data };
        if !v.is_consistent() {
            return Err(PipelineError::config(format!(
                "state shape {:?} does not match {} values",
                v.shape,
                v.data.len()
            )));
        }
        Ok(v)
    }

    pub fn is_consistent(&self) -> bool {
        self.shape.iter().product::<usize>() == self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceRecord {
    pub state: StateVector,
    pub reward: f64,
    /// 0 means "use the default |reward| + epsilon"
    #[serde(default)]
    pub priority: f64,
    /// Epoch milliseconds
    pub timestamp: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ExperienceRecord {
    pub fn new(state: StateVector, reward: f64, timestamp: u64) -> Self {
        Self {
            state,
            reward,
            priority: 0.0,
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[derive(Serialize)]
struct SnapshotLineRef<'a> {
    kind: &'a str,
    #[serde(flatten)]
    record: &'a ExperienceRecord,
}

#[derive(Deserialize)]
struct SnapshotLine {
    kind: String,
    #[serde(flatten)]
    record: ExperienceRecord,
}

// =============================================================================
// Buffer
// =============================================================================

/// Resolved priorities are always finite, so `total_cmp` is a true order here.
#[derive(Debug, Clone, Copy)]
struct PriorityKey(f64);

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Single-writer per process.
#[derive(Debug)]
pub struct ExperienceBuffer {
    cfg: BufferConfig,
    /// Keyed by insertion sequence, so iteration is insertion order.
    slots: BTreeMap<u64, ExperienceRecord>,
    /// Eviction order: lowest priority first, oldest first among equals.
    by_priority: BTreeSet<(PriorityKey, u64)>,
    next_seq: u64,
    rng: StdRng,
}

impl ExperienceBuffer {
    pub fn new(cfg: BufferConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            slots: BTreeMap::new(),
            by_priority: BTreeSet::new(),
            cfg,
            next_seq: 0,
            rng,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    pub fn default_priority(&self, reward: f64) -> f64 {
        reward.abs() + self.cfg.epsilon
    }

    /// Explicit argument, then the record's own positive priority, then
    /// |reward| + epsilon.
    fn resolve_priority(&self, explicit: Option<f64>, record: &ExperienceRecord) -> f64 {
        explicit
            .filter(|p| p.is_finite() && *p > 0.0)
            .or_else(|| Some(record.priority).filter(|p| p.is_finite() && *p > 0.0))
            .unwrap_or_else(|| self.default_priority(stats::finite_or_zero(record.reward)))
    }

    fn insert_slot(&mut self, record: ExperienceRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_priority.insert((PriorityKey(record.priority), seq));
        self.slots.insert(seq, record);
    }

    /// Insert one record, evicting the lowest-priority ones past capacity.
    pub fn add(&mut self, mut record: ExperienceRecord, priority: Option<f64>) {
        record.priority = self.resolve_priority(priority, &record);
        self.insert_slot(record);
        while self.slots.len() > self.cfg.capacity {
            self.evict_lowest();
        }
    }

    pub fn add_many(&mut self, records: impl IntoIterator<Item = ExperienceRecord>) {
        let before = self.next_seq;
        for r in records {
            self.add(r, None);
        }
        logging::debug(
            Domain::Buffer,
            "add_many",
            &[
                ("added", v_num((self.next_seq - before) as f64)),
                ("size", v_num(self.slots.len() as f64)),
            ],
        );
    }

    fn evict_lowest(&mut self) {
        if let Some((_, seq)) = self.by_priority.pop_first() {
            self.slots.remove(&seq);
        }
    }

    /// Drop records older than `now_ms - ttl`. Returns how many were dropped.
    pub fn prune_expired_at(&mut self, now_ms: u64) -> usize {
        let Some(ttl) = self.cfg.ttl_secs else {
            return 0;
        };
        let cutoff = now_ms.saturating_sub(ttl.saturating_mul(1000));
        let expired: Vec<(PriorityKey, u64)> = self
            .slots
            .iter()
            .filter(|(_, r)| r.timestamp < cutoff)
            .map(|(seq, r)| (PriorityKey(r.priority), *seq))
            .collect();
        for key in &expired {
            self.slots.remove(&key.1);
            self.by_priority.remove(key);
        }
        let dropped = expired.len();
        if dropped > 0 {
            logging::debug(Domain::Buffer, "ttl_evicted", &[("dropped", v_num(dropped as f64))]);
        }
        dropped
    }

    pub fn size(&mut self) -> usize {
        self.prune_expired_at(logging::ts_epoch_ms());
        self.slots.len()
    }

    /// Size without TTL pruning.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &ExperienceRecord> {
        self.slots.values()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_priority.clear();
    }

    /// Weighted: priority-proportional with replacement. Otherwise uniform
    /// without replacement. `n` is clamped to the buffer size.
    pub fn sample(&mut self, n: usize, weighted: bool) -> Vec<ExperienceRecord> {
        let size = self.size();
        let n = n.min(size);
        if n == 0 {
            return Vec::new();
        }
        let pool: Vec<&ExperienceRecord> = self.slots.values().collect();
        if weighted {
            let weights: Vec<f64> = pool.iter().map(|r| r.priority.max(0.0)).collect();
            if let Ok(dist) = WeightedIndex::new(&weights) {
                return (0..n).map(|_| pool[dist.sample(&mut self.rng)].clone()).collect();
            }
        }
        pool.choose_multiple(&mut self.rng, n).map(|r| (*r).clone()).collect()
    }

    fn resolve_path(&self, path: Option<&Path>) -> PathBuf {
        path.map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.cfg.snapshot_path))
    }

    /// Write every record as one JSON line. Written to a sibling temp file
    /// first and renamed into place.
    pub fn save_snapshot(&self, path: Option<&Path>) -> Result<usize> {
        let path = self.resolve_path(path);
        let result = self.write_lines(&path);
        match &result {
            Ok(n) => logging::info(
                Domain::Buffer,
                "snapshot_saved",
                &[("path", v_str(&path.display().to_string())), ("records", v_num(*n as f64))],
            ),
            Err(e) => logging::log_persistence_failure("save", &path.display().to_string(), &e.to_string()),
        }
        result
    }

    fn write_lines(&self, path: &Path) -> Result<usize> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in self.slots.values() {
                let line = serde_json::to_string(&SnapshotLineRef { kind: RECORD_KIND, record })
                    .map_err(|e| PipelineError::Persistence(e.to_string()))?;
                writeln!(out, "{}", line)?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(self.slots.len())
    }

    /// Replace the store with the snapshot's records, truncated to capacity
    /// keeping the newest, oldest first. Priorities resolve as in `add`.
    /// On I/O failure the store is left untouched. Malformed lines are skipped.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<usize> {
        let records = match read_lines(path) {
            Ok(r) => r,
            Err(e) => {
                logging::log_persistence_failure("load", &path.display().to_string(), &e.to_string());
                return Err(e);
            }
        };
        let mut records = records;
        records.sort_by_key(|r| r.timestamp);
        let skip = records.len().saturating_sub(self.cfg.capacity);

        self.clear();
        for mut record in records.into_iter().skip(skip) {
            record.priority = self.resolve_priority(None, &record);
            self.insert_slot(record);
        }
        logging::info(
            Domain::Buffer,
            "snapshot_loaded",
            &[
                ("path", v_str(&path.display().to_string())),
                ("records", v_num(self.slots.len() as f64)),
                ("truncated", v_num(skip as f64)),
            ],
        );
        Ok(self.slots.len())
    }
}

fn read_lines(path: &Path) -> Result<Vec<ExperienceRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SnapshotLine>(&line) {
            Ok(parsed) if parsed.kind == RECORD_KIND && parsed.record.state.is_consistent() => {
                out.push(parsed.record)
            }
            Ok(_) => logging::warn(
                Domain::Buffer,
                "snapshot_line_skipped",
                &[("line", v_num((lineno + 1) as f64)), ("reason", v_str("unexpected kind or shape"))],
            ),
            Err(e) => logging::warn(
                Domain::Buffer,
                "snapshot_line_skipped",
                &[("line", v_num((lineno + 1) as f64)), ("reason", v_str(&e.to_string()))],
            ),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buffer(capacity: usize) -> ExperienceBuffer {
        ExperienceBuffer::new(BufferConfig {
            capacity,
            seed: Some(7),
            ..Default::default()
        })
    }

    fn record(reward: f64, ts: u64) -> ExperienceRecord {
        ExperienceRecord::new(StateVector::flat(vec![reward, 1.0]), reward, ts)
    }

    #[test]
    fn test_default_priority_is_abs_reward_plus_epsilon() {
        let mut b = buffer(10);
        b.add(record(-0.5, 1), None);
        b.add(record(0.2, 2), Some(3.0));
        let prios: Vec<f64> = b.records().map(|r| r.priority).collect();
        assert!((prios[0] - 0.501).abs() < 1e-12);
        assert_eq!(prios[1], 3.0);
    }

    #[test]
    fn test_capacity_keeps_highest_priority() {
        let mut b = buffer(5);
        b.add_many((0..20).map(|i| record(i as f64, i)));
        assert_eq!(b.len(), 5);
        let rewards: Vec<f64> = b.records().map(|r| r.reward).collect();
        assert_eq!(rewards, vec![15.0, 16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn test_equal_priority_evicts_oldest() {
        let mut b = buffer(2);
        for ts in 0..4 {
            b.add(record(1.0, ts), None);
        }
        let ts: Vec<u64> = b.records().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![2, 3]);
    }

    #[test]
    fn test_low_priority_newcomer_is_dropped() {
        let mut b = buffer(2);
        b.add(record(5.0, 1), None);
        b.add(record(4.0, 2), None);
        b.add(record(0.1, 3), None);
        let rewards: Vec<f64> = b.records().map(|r| r.reward).collect();
        assert_eq!(rewards, vec![5.0, 4.0]);
    }

    #[test]
    fn test_ttl_prunes_old_records() {
        let mut b = ExperienceBuffer::new(BufferConfig { ttl_secs: Some(10), ..Default::default() });
        b.add(record(1.0, 1_000), None);
        b.add(record(1.0, 15_000), None);
        assert_eq!(b.prune_expired_at(20_000), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(b.prune_expired_at(20_000), 0);
    }

    #[test]
    fn test_expired_records_never_reach_size_or_sample() {
        let mut b = ExperienceBuffer::new(BufferConfig { ttl_secs: Some(1), seed: Some(3), ..Default::default() });
        b.add_many((0..4).map(|i| record(1.0 + i as f64, 1_000)));
        assert_eq!(b.len(), 4);
        assert_eq!(b.size(), 0);
        assert!(b.sample(5, true).is_empty());

        let now = logging::ts_epoch_ms();
        b.add(record(9.0, 1_000), None);
        b.add(record(0.2, now), None);
        let batch = b.sample(5, true);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].reward, 0.2);
        b.add(record(9.0, 1_000), None);
        let batch = b.sample(5, false);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].timestamp, now);
    }

    #[test]
    fn test_eviction_index_tracks_ttl_pruning() {
        let mut b = ExperienceBuffer::new(BufferConfig { capacity: 2, ttl_secs: Some(10), ..Default::default() });
        b.add(record(1.0, 1_000), Some(50.0));
        b.add(record(0.5, 15_000), None);
        assert_eq!(b.prune_expired_at(20_000), 1);
        assert_eq!(b.by_priority.len(), b.slots.len());

        b.add(record(0.3, 16_000), None);
        b.add(record(0.4, 17_000), None);
        let rewards: Vec<f64> = b.records().map(|r| r.reward).collect();
        assert_eq!(rewards, vec![0.5, 0.4]);
        assert_eq!(b.by_priority.len(), 2);
    }

    #[test]
    fn test_sample_clamps_batch_size() {
        let mut b = buffer(10);
        let now = logging::ts_epoch_ms();
        b.add_many((0..3).map(|i| record(i as f64, now)));
        assert_eq!(b.sample(10, false).len(), 3);
        assert_eq!(b.sample(10, true).len(), 3);
        assert!(buffer(10).sample(4, true).is_empty());
    }

    #[test]
    fn test_uniform_sample_has_no_repeats() {
        let mut b = buffer(50);
        let now = logging::ts_epoch_ms();
        b.add_many((0..50).map(|i| record(i as f64, now)));
        let mut rewards: Vec<f64> = b.sample(50, false).iter().map(|r| r.reward).collect();
        rewards.sort_by(|a, b| a.partial_cmp(b).unwrap());
        rewards.dedup();
        assert_eq!(rewards.len(), 50);
    }

    #[test]
    fn test_weighted_sample_prefers_high_priority() {
        let mut b = buffer(10);
        let now = logging::ts_epoch_ms();
        b.add(record(0.0, now), Some(0.001));
        b.add(record(1.0, now), Some(1000.0));
        let batch = b.sample(200, true);
        // clamped to buffer size, drawn with replacement
        assert_eq!(batch.len(), 2);
        let heavy = (0..100)
            .flat_map(|_| b.sample(2, true))
            .filter(|r| r.reward == 1.0)
            .count();
        assert!(heavy > 190, "heavy={}", heavy);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.jsonl");
        let mut b = buffer(10);
        b.add(
            ExperienceRecord::new(StateVector::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(), 0.5, 1)
                .with_meta("session", json!("s1")),
            None,
        );
        b.add(record(-0.25, 2), None);
        assert_eq!(b.save_snapshot(Some(&path)).unwrap(), 2);

        let mut fresh = buffer(10);
        assert_eq!(fresh.load_snapshot(&path).unwrap(), 2);
        let loaded: Vec<&ExperienceRecord> = fresh.records().collect();
        assert_eq!(loaded[0].state.shape, vec![2, 2]);
        assert_eq!(loaded[0].reward, 0.5);
        assert_eq!(loaded[0].metadata["session"], json!("s1"));
        assert_eq!(loaded[1].state.shape, vec![2]);
        assert_eq!(loaded[1].reward, -0.25);
    }

    #[test]
    fn test_load_truncates_to_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.jsonl");
        let mut big = buffer(10);
        big.add_many((0..6).map(|i| record(1.0, 100 - i)));
        big.save_snapshot(Some(&path)).unwrap();

        let mut small = buffer(3);
        small.load_snapshot(&path).unwrap();
        let ts: Vec<u64> = small.records().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![98, 99, 100]);
    }

    #[test]
    fn test_missing_snapshot_leaves_buffer_intact() {
        let mut b = buffer(10);
        b.add(record(1.0, 1), None);
        let err = b.load_snapshot(Path::new("/nonexistent/dir/buf.jsonl")).unwrap_err();
        assert_eq!(err.kind(), "persistence");
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_loaded_records_resolve_priority_like_add() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.jsonl");
        let bare = r#"{"kind":"experience","state":{"shape":[1],"data":[0.5]},"reward":0.4,"timestamp":5}"#;
        let pinned = r#"{"kind":"experience","state":{"shape":[1],"data":[0.5]},"reward":0.1,"priority":2.0,"timestamp":6}"#;
        fs::write(&path, format!("{}\n{}\n", bare, pinned)).unwrap();

        let mut b = buffer(2);
        assert_eq!(b.load_snapshot(&path).unwrap(), 2);
        let prios: Vec<f64> = b.records().map(|r| r.priority).collect();
        assert!((prios[0] - 0.401).abs() < 1e-12, "{:?}", prios);
        assert_eq!(prios[1], 2.0);

        // the loaded records take part in eviction like added ones
        b.add(record(1.0, 7), None);
        let ts: Vec<u64> = b.records().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![6, 7]);
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.jsonl");
        let good = serde_json::to_string(&SnapshotLineRef { kind: RECORD_KIND, record: &record(0.3, 5) }).unwrap();
        let bad_shape = r#"{"kind":"experience","state":{"shape":[3],"data":[1.0]},"reward":1.0,"timestamp":1}"#;
        fs::write(&path, format!("{}\nnot json\n{}\n", good, bad_shape)).unwrap();
        let mut b = buffer(10);
        assert_eq!(b.load_snapshot(&path).unwrap(), 1);
    }
}
