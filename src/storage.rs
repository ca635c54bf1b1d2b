use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::knowledge::{KnowledgeStore, LATEST_SNAPSHOT_KEY};
use crate::training::PerformanceSnapshot;

/// SQLite-backed knowledge store with an append-only snapshot history.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS knowledge (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS performance_snapshots (
                ts INTEGER NOT NULL,
                policy_version INTEGER NOT NULL,
                reward_avg REAL NOT NULL,
                rolling_roi REAL NOT NULL,
                win_rate REAL NOT NULL,
                regret REAL NOT NULL,
                latency_ms REAL NOT NULL,
                experience_count INTEGER NOT NULL,
                buffer_size INTEGER NOT NULL,
                drift_score REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn append_snapshot(&mut self, s: &PerformanceSnapshot) -> Result<()> {
        self.conn.execute(
            "INSERT INTO performance_snapshots
                (ts, policy_version, reward_avg, rolling_roi, win_rate, regret,
                 latency_ms, experience_count, buffer_size, drift_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                s.timestamp as i64,
                s.policy_version as i64,
                s.reward_avg,
                s.rolling_roi,
                s.win_rate,
                s.regret,
                s.latency_ms,
                s.experience_count as i64,
                s.buffer_size as i64,
                s.drift_score
            ],
        )?;
        Ok(())
    }

    /// Most recent snapshots, newest first.
    pub fn recent_snapshots(&self, limit: usize) -> Result<Vec<PerformanceSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, policy_version, reward_avg, rolling_roi, win_rate, regret,
                    latency_ms, experience_count, buffer_size, drift_score
             FROM performance_snapshots ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(PerformanceSnapshot {
                timestamp: row.get::<_, i64>(0)? as u64,
                policy_version: row.get::<_, i64>(1)? as u64,
                reward_avg: row.get(2)?,
                rolling_roi: row.get(3)?,
                win_rate: row.get(4)?,
                regret: row.get(5)?,
                latency_ms: row.get(6)?,
                experience_count: row.get::<_, i64>(7)? as usize,
                buffer_size: row.get::<_, i64>(8)? as usize,
                drift_score: row.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl KnowledgeStore for SqliteStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM knowledge WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO knowledge (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value.to_string(), crate::logging::ts_epoch_ms() as i64],
        )?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM knowledge ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn record_snapshot(&mut self, snapshot: &PerformanceSnapshot) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO knowledge (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                LATEST_SNAPSHOT_KEY,
                serde_json::to_string(snapshot)?,
                snapshot.timestamp as i64
            ],
        )?;
        tx.commit()?;
        self.append_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::load_as;
    use serde_json::json;

    #[test]
    fn test_save_overwrites_key() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.save("policy/weights", &json!([1.0])).unwrap();
        store.save("policy/weights", &json!([2.0])).unwrap();
        assert_eq!(store.load("policy/weights").unwrap(), Some(json!([2.0])));
        assert_eq!(store.keys().unwrap(), vec!["policy/weights".to_string()]);
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_snapshots_append_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.db");
        let mut store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        for i in 0..3u64 {
            let snap = PerformanceSnapshot {
                timestamp: 1_000 + i,
                policy_version: i,
                win_rate: 0.1 * i as f64,
                ..Default::default()
            };
            store.record_snapshot(&snap).unwrap();
        }
        let recent = store.recent_snapshots(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].policy_version, 2);
        assert_eq!(recent[1].policy_version, 1);
        let latest: PerformanceSnapshot = load_as(&store, LATEST_SNAPSHOT_KEY).unwrap().unwrap();
        assert_eq!(latest.timestamp, 1_002);
    }
}
