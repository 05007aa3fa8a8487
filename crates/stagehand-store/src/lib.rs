//! stagehand-store — key/JSON persistence for the rollout engine.
//!
//! The engine talks to persistence exclusively through the [`Store`]
//! trait: flat string keys, JSON values, prefix scans, and a small set
//! of dotted-path query operations (extract, count-by, top-n sort).
//! [`RedbStore`] is the shipped implementation, backed by
//! [redb](https://docs.rs/redb) with both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Values are JSON-serialized into a single string-keyed redb table.
//! Hierarchical keys (`rollout/{ns}/{entity}`,
//! `entity-target/{ns}/{entity}/{group}/{name}`) make prefix scans
//! cheap because redb iterates keys in sorted order.

pub mod error;
pub mod query;
pub mod redb_store;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use redb_store::RedbStore;
pub use store::{Store, StoreExt, ValueVisitor};
