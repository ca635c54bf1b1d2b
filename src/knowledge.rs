//! Key/value knowledge repository. Components persist learned state through
//! this interface and never hold file handles themselves.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::training::PerformanceSnapshot;

pub const LATEST_SNAPSHOT_KEY: &str = "performance/latest";

pub trait KnowledgeStore: Send {
    fn load(&self, key: &str) -> Result<Option<Value>>;
    fn save(&mut self, key: &str, value: &Value) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Persist the latest snapshot. Stores with history override this to
    /// also append.
    fn record_snapshot(&mut self, snapshot: &PerformanceSnapshot) -> Result<()> {
        self.save(LATEST_SNAPSHOT_KEY, &serde_json::to_value(snapshot)?)
    }
}

pub fn load_as<T: DeserializeOwned>(store: &dyn KnowledgeStore, key: &str) -> Result<Option<T>> {
    match store.load(key)? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

pub fn save_as<T: Serialize>(store: &mut dyn KnowledgeStore, key: &str, value: &T) -> Result<()> {
    store.save(key, &serde_json::to_value(value)?)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KnowledgeStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryStore::new();
        assert!(store.load("missing").unwrap().is_none());
        store.save("weights", &json!([0.1, 0.2])).unwrap();
        assert_eq!(store.load("weights").unwrap(), Some(json!([0.1, 0.2])));
        assert_eq!(store.keys().unwrap(), vec!["weights".to_string()]);
    }

    #[test]
    fn test_record_snapshot_saves_latest() {
        let mut store = MemoryStore::new();
        let snap = PerformanceSnapshot { policy_version: 3, win_rate: 0.5, ..Default::default() };
        store.record_snapshot(&snap).unwrap();
        let back: PerformanceSnapshot = load_as(&store, LATEST_SNAPSHOT_KEY).unwrap().unwrap();
        assert_eq!(back, snap);
    }
}
