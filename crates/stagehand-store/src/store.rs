//! The persistence contract the rollout engine depends on.
//!
//! Implementations store JSON values under flat string keys and must
//! iterate keys in sorted order so that prefix scans are deterministic
//! across processes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Callback receiving `(key, value)` pairs during iteration. Returning
/// an error aborts the scan and surfaces to the caller.
pub type ValueVisitor<'a> = dyn FnMut(&str, &Value) -> StoreResult<()> + 'a;

/// Key/JSON value store with prefix, path-query, and sort operations.
///
/// All operations take `&self`; implementations are internally
/// synchronized and shared behind `Arc<dyn Store>`.
pub trait Store: Send + Sync {
    /// Store `value` under `key`, overwriting any existing value.
    fn save_json(&self, key: &str, value: &Value) -> StoreResult<()>;

    /// Load the value stored under `key`.
    ///
    /// Fails with [`StoreError::KeyNotFound`] if the key is absent.
    fn load_json(&self, key: &str) -> StoreResult<Value>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Remove every key starting with `prefix`.
    fn delete_prefix(&self, prefix: &str) -> StoreResult<()>;

    /// List all keys starting with `prefix`, in sorted order.
    fn load_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Visit every `(key, value)` under `prefix`, in key order.
    fn load_values(&self, prefix: &str, visit: &mut ValueVisitor) -> StoreResult<()>;

    /// For each value under `prefix`, extract the dotted `path`
    /// (`$.a.b`) and visit `(key, extracted)`. Values missing the path
    /// are skipped.
    fn query_json_path(&self, prefix: &str, path: &str, visit: &mut ValueVisitor)
        -> StoreResult<()>;

    /// Count values under `prefix` grouped by the extracted `path`
    /// value; visits `(rendered_value, count)` per distinct value.
    fn count_json_path(&self, prefix: &str, path: &str, visit: &mut ValueVisitor)
        -> StoreResult<()>;

    /// Visit the `n` entries under `prefix` with the smallest extracted
    /// `path` values, ascending. `n < 0` means all entries.
    fn sorted_asc_n(
        &self,
        prefix: &str,
        path: &str,
        n: i64,
        visit: &mut ValueVisitor,
    ) -> StoreResult<()>;

    /// Like [`Store::sorted_asc_n`], descending.
    fn sorted_desc_n(
        &self,
        prefix: &str,
        path: &str,
        n: i64,
        visit: &mut ValueVisitor,
    ) -> StoreResult<()>;

    /// Number of keys under `prefix`.
    fn count(&self, prefix: &str) -> StoreResult<u64>;

    /// Release underlying resources. Idempotent.
    fn close(&self) -> StoreResult<()>;
}

/// Typed convenience layer over the JSON entry points.
pub trait StoreExt: Store {
    /// Serialize `value` and store it under `key`.
    fn save<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let json =
            serde_json::to_value(value).map_err(|e| StoreError::Serialize(e.to_string()))?;
        self.save_json(key, &json)
    }

    /// Load and deserialize the value under `key`.
    fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<T> {
        let json = self.load_json(key)?;
        serde_json::from_value(json).map_err(|e| StoreError::Deserialize(e.to_string()))
    }

    /// Load the value under `key`, mapping a miss to `None`.
    fn load_optional<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.load::<T>(key) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
