//! stagehand-core — rollout orchestration engine.
//!
//! Given a fleet of named targets at some version and a desired target
//! version, the engine advances the fleet in controlled batches,
//! monitors per-target success and failure, and automatically rolls
//! back to the last known good version when the new version proves
//! bad. It is a control loop driven by periodic status reports: the
//! engine holds authoritative state but never performs upgrades — each
//! tick returns, per target, the version the caller should drive it
//! to.
//!
//! # Components
//!
//! - **`types`** — wire-level shapes shared with callers and webhooks
//! - **`target`** — persisted per-target records and observation merge
//! - **`rollout`** — the per-entity rollout state machine
//! - **`controller`** — pluggable selection/approval/monitoring/removal
//!   hooks and the controller registry
//! - **`webhook`** — HTTP variants of both controller kinds
//! - **`entity`** / **`namespace`** — the hierarchical container model
//! - **`engine`** — the facade plus per-entity async status workers
//!
//! Persistence goes through the `Store` contract from
//! [`stagehand_store`]; every decision is written back per step, so a
//! restarted engine resumes an in-flight rollout from the store.

pub mod controller;
pub mod engine;
pub mod entity;
pub mod error;
pub mod namespace;
pub mod rollout;
pub mod target;
pub mod types;
pub mod webhook;

pub use controller::{
    ControllerBinding, ControllerRegistry, MonitoringBinding, MonitoringController,
    MonitoringVerdict, NoOpTargetController, TargetController,
};
pub use engine::{Engine, STATUS_TICK_INTERVAL};
pub use error::{EngineError, EngineResult};
pub use rollout::{Rollout, RolloutState};
pub use target::EntityTarget;
pub use types::{ClientState, EntityTargetVersion, RolloutInfo, RolloutOptions};
pub use webhook::{WebhookMonitoringEndpoint, WebhookTargetEndpoints};
