//! redb-backed implementation of the [`Store`] contract.
//!
//! A single string-keyed table holds every record as JSON bytes. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, TableDefinition};
use serde_json::Value;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::query::{compare_values, extract_path, render_group_key};
use crate::store::{Store, ValueVisitor};

/// redb table for all records: key = record key, value = JSON bytes.
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe JSON store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_table()?;
        debug!(?path, "store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_table()?;
        debug!("in-memory store opened");
        Ok(store)
    }

    /// Create the records table if it doesn't exist yet.
    fn ensure_table(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RECORDS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Collect `(key, value)` pairs under `prefix`, in key order.
    fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let json: Value =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value().to_string(), json));
        }
        Ok(results)
    }

    /// Shared body of the two sorted queries.
    fn sorted_n(
        &self,
        prefix: &str,
        path: &str,
        n: i64,
        descending: bool,
        visit: &mut ValueVisitor,
    ) -> StoreResult<()> {
        let mut extracted: Vec<(String, Value)> = self
            .scan(prefix)?
            .into_iter()
            .filter_map(|(key, value)| {
                extract_path(&value, path).map(|v| (key, v.clone()))
            })
            .collect();
        extracted.sort_by(|a, b| {
            let ord = compare_values(&a.1, &b.1);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        let take = if n < 0 { extracted.len() } else { n as usize };
        for (key, value) in extracted.into_iter().take(take) {
            visit(&key, &value)?;
        }
        Ok(())
    }
}

impl Store for RedbStore {
    fn save_json(&self, key: &str, value: &Value) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn load_json(&self, key: &str) -> StoreResult<Value> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(StoreError::KeyNotFound(key.to_string())),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
            table.remove(key).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let keys = self.load_keys(prefix)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%prefix, removed = keys.len(), "prefix deleted");
        Ok(())
    }

    fn load_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn load_values(&self, prefix: &str, visit: &mut ValueVisitor) -> StoreResult<()> {
        for (key, value) in self.scan(prefix)? {
            visit(&key, &value)?;
        }
        Ok(())
    }

    fn query_json_path(
        &self,
        prefix: &str,
        path: &str,
        visit: &mut ValueVisitor,
    ) -> StoreResult<()> {
        for (key, value) in self.scan(prefix)? {
            if let Some(extracted) = extract_path(&value, path) {
                visit(&key, extracted)?;
            }
        }
        Ok(())
    }

    fn count_json_path(
        &self,
        prefix: &str,
        path: &str,
        visit: &mut ValueVisitor,
    ) -> StoreResult<()> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for (_, value) in self.scan(prefix)? {
            if let Some(extracted) = extract_path(&value, path) {
                *counts.entry(render_group_key(extracted)).or_default() += 1;
            }
        }
        for (group, count) in counts {
            visit(&group, &Value::from(count))?;
        }
        Ok(())
    }

    fn sorted_asc_n(
        &self,
        prefix: &str,
        path: &str,
        n: i64,
        visit: &mut ValueVisitor,
    ) -> StoreResult<()> {
        self.sorted_n(prefix, path, n, false, visit)
    }

    fn sorted_desc_n(
        &self,
        prefix: &str,
        path: &str,
        n: i64,
        visit: &mut ValueVisitor,
    ) -> StoreResult<()> {
        self.sorted_n(prefix, path, n, true, visit)
    }

    fn count(&self, prefix: &str) -> StoreResult<u64> {
        Ok(self.load_keys(prefix)?.len() as u64)
    }

    fn close(&self) -> StoreResult<()> {
        // redb durably commits every write transaction; the database
        // file is released when the last clone drops.
        Ok(())
    }
}
