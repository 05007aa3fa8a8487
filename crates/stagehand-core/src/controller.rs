//! Pluggable target and monitoring controller hooks.
//!
//! Controllers own the judgment calls the engine delegates: which
//! targets enter the next batch, whether they are approved, whether a
//! target or the whole in-rollout set looks healthy from the outside,
//! and which targets a blue/green scale-down drops.
//!
//! Bindings are persisted on the rollout record as tagged enums and
//! resolved per tick through the engine's [`ControllerRegistry`], so a
//! restarted process rehydrates custom controllers by name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::ClientState;
use crate::webhook::{WebhookMonitoringController, WebhookMonitoringEndpoint, WebhookTargetController, WebhookTargetEndpoints};

/// Health verdict from a monitoring hook. A transport failure is an
/// error and aborts the tick; a well-formed "error" status is this
/// verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringVerdict {
    Ok,
    Failing,
}

impl MonitoringVerdict {
    pub fn is_ok(self) -> bool {
        self == MonitoringVerdict::Ok
    }
}

/// Capability hooks consulted while driving a rollout.
#[async_trait]
pub trait TargetController: Send + Sync {
    /// Pick up to `selection` targets for the next batch. May return
    /// targets not in `targets` at all: the engine creates records for
    /// them (blue/green scale-up).
    async fn target_selection(
        &self,
        targets: Vec<ClientState>,
        selection: usize,
    ) -> EngineResult<Vec<ClientState>>;

    /// Approve a subset of the selected targets for rollout.
    async fn target_approval(
        &self,
        targets: Vec<ClientState>,
    ) -> EngineResult<Vec<ClientState>>;

    /// Health verdict for a single in-rollout target.
    async fn target_monitoring(&self, target: &ClientState) -> EngineResult<MonitoringVerdict>;

    /// Pick up to `selection` targets to drop from the entity.
    async fn target_removal(
        &self,
        targets: Vec<ClientState>,
        selection: usize,
    ) -> EngineResult<Vec<ClientState>>;
}

/// External (fleet-level) monitoring hook.
#[async_trait]
pub trait MonitoringController: Send + Sync {
    /// Verdict over the whole in-rollout set; `Failing` marks every
    /// in-rollout target as failing for the current tick.
    async fn external_monitoring(
        &self,
        targets: &[ClientState],
    ) -> EngineResult<MonitoringVerdict>;
}

/// Default controller: first-n selection, approve everything, always
/// healthy, never removes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTargetController;

#[async_trait]
impl TargetController for NoOpTargetController {
    async fn target_selection(
        &self,
        targets: Vec<ClientState>,
        selection: usize,
    ) -> EngineResult<Vec<ClientState>> {
        Ok(targets.into_iter().take(selection).collect())
    }

    async fn target_approval(
        &self,
        targets: Vec<ClientState>,
    ) -> EngineResult<Vec<ClientState>> {
        Ok(targets)
    }

    async fn target_monitoring(&self, _target: &ClientState) -> EngineResult<MonitoringVerdict> {
        Ok(MonitoringVerdict::Ok)
    }

    async fn target_removal(
        &self,
        _targets: Vec<ClientState>,
        _selection: usize,
    ) -> EngineResult<Vec<ClientState>> {
        Ok(Vec::new())
    }
}

/// Persisted binding of an entity to its target controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerBinding {
    /// Built-in no-op behavior.
    #[default]
    NoOp,
    /// HTTP webhook controller with per-hook endpoints.
    Webhook(WebhookTargetEndpoints),
    /// Custom controller registered on the engine under `name`.
    Registered { name: String },
}

/// Persisted binding of an entity to its external monitoring hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitoringBinding {
    /// No external monitoring: always ok.
    #[default]
    Disabled,
    /// HTTP webhook monitoring endpoint.
    Webhook(WebhookMonitoringEndpoint),
    /// Custom controller registered on the engine under `name`.
    Registered { name: String },
}

/// Append-only name → controller map owned by the engine.
///
/// Custom controllers must be registered before the first tick that
/// resolves them; re-registering a name replaces the entry (latest
/// wins), which tests use to swap behavior between phases.
#[derive(Default)]
pub struct ControllerRegistry {
    targets: RwLock<HashMap<String, Arc<dyn TargetController>>>,
    monitors: RwLock<HashMap<String, Arc<dyn MonitoringController>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom target controller under `name`.
    pub fn register_target(&self, name: &str, controller: Arc<dyn TargetController>) {
        self.targets
            .write()
            .expect("controller registry poisoned")
            .insert(name.to_string(), controller);
    }

    /// Register a custom monitoring controller under `name`.
    pub fn register_monitoring(&self, name: &str, controller: Arc<dyn MonitoringController>) {
        self.monitors
            .write()
            .expect("controller registry poisoned")
            .insert(name.to_string(), controller);
    }

    /// Resolve a persisted binding to a live controller.
    pub fn resolve_target(
        &self,
        binding: &ControllerBinding,
    ) -> EngineResult<Arc<dyn TargetController>> {
        match binding {
            ControllerBinding::NoOp => Ok(Arc::new(NoOpTargetController)),
            ControllerBinding::Webhook(endpoints) => {
                Ok(Arc::new(WebhookTargetController::new(endpoints.clone())))
            }
            ControllerBinding::Registered { name } => self
                .targets
                .read()
                .expect("controller registry poisoned")
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Controller(format!("no target controller registered as '{name}'"))
                }),
        }
    }

    /// Resolve a persisted monitoring binding; `None` means always ok.
    pub fn resolve_monitoring(
        &self,
        binding: &MonitoringBinding,
    ) -> EngineResult<Option<Arc<dyn MonitoringController>>> {
        match binding {
            MonitoringBinding::Disabled => Ok(None),
            MonitoringBinding::Webhook(endpoint) => Ok(Some(Arc::new(
                WebhookMonitoringController::new(endpoint.clone()),
            ))),
            MonitoringBinding::Registered { name } => self
                .monitors
                .read()
                .expect("controller registry poisoned")
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    EngineError::Controller(format!(
                        "no monitoring controller registered as '{name}'"
                    ))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<ClientState> {
        (0..n)
            .map(|i| ClientState {
                name: format!("target{i}"),
                version: "v1".into(),
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn noop_selects_first_n() {
        let ctrl = NoOpTargetController;
        let selected = ctrl.target_selection(targets(5), 2).await.unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name, "target0");
        assert_eq!(selected[1].name, "target1");
    }

    #[tokio::test]
    async fn noop_approves_everything_and_removes_nothing() {
        let ctrl = NoOpTargetController;
        assert_eq!(ctrl.target_approval(targets(3)).await.unwrap().len(), 3);
        assert!(ctrl.target_removal(targets(3), 2).await.unwrap().is_empty());
        assert!(ctrl
            .target_monitoring(&targets(1)[0])
            .await
            .unwrap()
            .is_ok());
    }

    #[test]
    fn binding_serializes_tagged() {
        let json = serde_json::to_value(ControllerBinding::NoOp).unwrap();
        assert_eq!(json["kind"], "no_op");

        let json = serde_json::to_value(ControllerBinding::Registered {
            name: "bluegreen".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "registered");
        assert_eq!(json["name"], "bluegreen");
    }

    #[test]
    fn registry_resolves_registered_controllers() {
        let registry = ControllerRegistry::new();
        registry.register_target("custom", Arc::new(NoOpTargetController));

        assert!(registry
            .resolve_target(&ControllerBinding::Registered {
                name: "custom".into()
            })
            .is_ok());
        assert!(registry
            .resolve_target(&ControllerBinding::Registered {
                name: "missing".into()
            })
            .is_err());
        assert!(registry
            .resolve_monitoring(&MonitoringBinding::Disabled)
            .unwrap()
            .is_none());
    }
}
