//! Per-entity orchestration: target records, the rollout record, and
//! the tick driver.
//!
//! All store access for an entity funnels through here. A tick holds
//! the entity mutex for its whole duration, so ticks against one
//! entity are fully ordered while other entities proceed in parallel.
//! Every mutation compares before writing; a tick that changes nothing
//! writes nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use stagehand_store::{Store, StoreExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::controller::{ControllerBinding, ControllerRegistry, MonitoringBinding, TargetController};
use crate::error::{EngineError, EngineResult};
use crate::rollout::{Rollout, TickBuckets};
use crate::target::EntityTarget;
use crate::types::{ClientState, RolloutInfo, RolloutOptions};

/// A rollout unit within a namespace. Holds no target state itself;
/// everything lives in the store under this entity's key prefixes.
pub struct Entity {
    namespace: String,
    name: String,
    store: Arc<dyn Store>,
    /// Serializes ticks and setting operations against this entity.
    tick_lock: Mutex<()>,
}

impl Entity {
    pub fn new(namespace: &str, name: &str, store: Arc<dyn Store>) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            store,
            tick_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn rollout_key(&self) -> String {
        format!("rollout/{}/{}", self.namespace, self.name)
    }

    fn target_prefix(&self) -> String {
        format!("entity-target/{}/{}/", self.namespace, self.name)
    }

    fn target_key(&self, group: &str, name: &str) -> String {
        format!("{}{}/{}", self.target_prefix(), group, name)
    }

    // ── Rollout record ─────────────────────────────────────────────

    /// Load the entity's rollout record, creating and persisting a
    /// default one on first reference.
    pub fn find_or_create_rollout(&self) -> EngineResult<Rollout> {
        let key = self.rollout_key();
        if let Some(rollout) = self.store.load_optional::<Rollout>(&key)? {
            return Ok(rollout);
        }
        let rollout = Rollout::default();
        self.store.save(&key, &rollout)?;
        debug!(entity = %self.name, "rollout record created");
        Ok(rollout)
    }

    fn save_rollout(&self, rollout: &Rollout) -> EngineResult<()> {
        self.store.save(&self.rollout_key(), rollout)?;
        Ok(())
    }

    pub async fn set_rollout_options(&self, options: &RolloutOptions) -> EngineResult<()> {
        let _tick = self.tick_lock.lock().await;
        let mut rollout = self.find_or_create_rollout()?;
        if rollout.set_options(options)? {
            self.save_rollout(&rollout)?;
        }
        Ok(())
    }

    pub async fn set_target_version(&self, version: &str, force: bool) -> EngineResult<()> {
        let _tick = self.tick_lock.lock().await;
        let mut rollout = self.find_or_create_rollout()?;
        if rollout.set_target_version(version, force)? {
            self.save_rollout(&rollout)?;
        }
        Ok(())
    }

    pub async fn set_target_controller(&self, binding: ControllerBinding) -> EngineResult<()> {
        let _tick = self.tick_lock.lock().await;
        let mut rollout = self.find_or_create_rollout()?;
        if rollout.target_controller != binding {
            rollout.target_controller = binding;
            self.save_rollout(&rollout)?;
        }
        Ok(())
    }

    pub async fn set_monitoring_controller(
        &self,
        binding: MonitoringBinding,
    ) -> EngineResult<()> {
        let _tick = self.tick_lock.lock().await;
        let mut rollout = self.find_or_create_rollout()?;
        if rollout.monitoring_controller != binding {
            rollout.monitoring_controller = binding;
            self.save_rollout(&rollout)?;
        }
        Ok(())
    }

    pub fn rollout_info(&self) -> EngineResult<RolloutInfo> {
        Ok(self.find_or_create_rollout()?.info())
    }

    // ── Target records ─────────────────────────────────────────────

    /// All of this entity's targets, in key (group, then name) order.
    pub fn get_entity_targets(&self) -> EngineResult<Vec<EntityTarget>> {
        let mut targets = Vec::new();
        self.store
            .load_values(&self.target_prefix(), &mut |_, value| {
                let target = serde_json::from_value::<EntityTarget>(value.clone())
                    .map_err(|e| stagehand_store::StoreError::Deserialize(e.to_string()))?;
                targets.push(target);
                Ok(())
            })?;
        Ok(targets)
    }

    /// Merge caller reports into target records, creating records on
    /// first observation. Identical reports write nothing.
    pub fn update_entity_targets(
        &self,
        reports: &[ClientState],
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        for report in reports {
            if report.name.is_empty() {
                return Err(EngineError::InvalidInput(
                    "client state has an empty name".into(),
                ));
            }
            let key = self.target_key(&report.group, &report.name);
            match self.store.load_optional::<EntityTarget>(&key)? {
                Some(mut target) => {
                    if target.observe(report, now) {
                        self.store.save(&key, &target)?;
                    }
                }
                None => {
                    let target = EntityTarget::from_report(report, now);
                    self.store.save(&key, &target)?;
                    debug!(target = %report.name, group = %report.group, "target first observed");
                }
            }
        }
        Ok(())
    }

    /// Expected state for every target, optionally filtered by group.
    pub fn client_states(&self, group: Option<&str>) -> EngineResult<Vec<ClientState>> {
        let prefix = match group {
            Some(group) => format!("{}{}/", self.target_prefix(), group),
            None => self.target_prefix(),
        };
        let mut states = Vec::new();
        self.store.load_values(&prefix, &mut |_, value| {
            let target = serde_json::from_value::<EntityTarget>(value.clone())
                .map_err(|e| stagehand_store::StoreError::Deserialize(e.to_string()))?;
            states.push(target.expected_state());
            Ok(())
        })?;
        Ok(states)
    }

    // ── The tick ───────────────────────────────────────────────────

    /// Run one orchestration tick: merge observations, bucket, monitor,
    /// update markers, advance the rolling version, select the next
    /// batch, drop excess targets, and return the expected state.
    pub async fn orchestrate(
        &self,
        registry: &ControllerRegistry,
        reports: &[ClientState],
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<ClientState>> {
        let _tick = self.tick_lock.lock().await;

        self.update_entity_targets(reports, now)?;
        let mut rollout = self.find_or_create_rollout()?;
        let targets = self.get_entity_targets()?;
        let target_controller = registry.resolve_target(&rollout.target_controller)?;
        let monitoring_controller =
            registry.resolve_monitoring(&rollout.monitoring_controller)?;

        let mut buckets = rollout.determine_current_state(&targets);
        rollout
            .monitor_targets(
                &targets,
                &mut buckets,
                now,
                target_controller.as_ref(),
                monitoring_controller.as_deref(),
            )
            .await?;

        let mut dirty = rollout.record_observed(&targets, &buckets);
        dirty |= rollout.update_last_known_versions(&targets, &buckets);
        dirty |= rollout.update_rolling_version(now);
        if dirty {
            self.save_rollout(&rollout)?;
        }

        self.rollout_new_batch(&rollout, &targets, &buckets, target_controller.as_ref(), now)
            .await?;
        self.remove_excess_targets(&targets, &buckets, target_controller.as_ref())
            .await?;

        self.client_states(None)
    }

    /// Fill the in-rollout set up to the batch size from the available
    /// candidates, via controller selection and approval. The next
    /// batch only opens once the current batch's success ratio clears
    /// `success_percent`. Approved targets the controller invented are
    /// created on the spot (blue/green scale-up).
    async fn rollout_new_batch(
        &self,
        rollout: &Rollout,
        targets: &[EntityTarget],
        buckets: &TickBuckets,
        controller: &dyn TargetController,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let rolling = rollout.state.rolling_version.clone();
        if rolling.is_empty() || buckets.available.is_empty() {
            return Ok(());
        }
        let batch = rollout.batch_size(targets.len());
        if buckets.in_rollout.len() >= batch {
            return Ok(());
        }
        if !rollout.batch_success_reached(buckets) {
            debug!(
                entity = %self.name,
                success = buckets.success.len(),
                failed = buckets.failed.len(),
                "batch success ratio below threshold, holding the next batch"
            );
            return Ok(());
        }
        let want = batch - buckets.in_rollout.len();

        let candidates: Vec<ClientState> = buckets
            .available
            .iter()
            .map(|&i| targets[i].reported_state())
            .collect();
        let selected = controller.target_selection(candidates, want).await?;
        if selected.is_empty() {
            return Ok(());
        }
        let approved = controller.target_approval(selected).await?;

        for client in approved {
            let key = self.target_key(&client.group, &client.name);
            let (mut target, created) = match self.store.load_optional::<EntityTarget>(&key)? {
                Some(target) => (target, false),
                None => (EntityTarget::from_report(&client, now), true),
            };
            if created || target.state.target_version.version != rolling {
                target.state.target_version.version = rolling.clone();
                self.store.save(&key, &target)?;
                info!(
                    target = %target.name,
                    version = %rolling,
                    created,
                    "target entering rollout"
                );
            }
        }
        Ok(())
    }

    /// Let the controller drop targets beyond the settled set
    /// (blue/green scale-down). The no-op controller never removes
    /// anything.
    async fn remove_excess_targets(
        &self,
        targets: &[EntityTarget],
        buckets: &TickBuckets,
        controller: &dyn TargetController,
    ) -> EngineResult<()> {
        let settled =
            buckets.success.len() + buckets.in_rollout.len() + buckets.failed.len();
        let excess = targets.len().saturating_sub(settled);
        if excess == 0 {
            return Ok(());
        }

        let candidates: Vec<ClientState> =
            targets.iter().map(|t| t.reported_state()).collect();
        let victims = controller.target_removal(candidates, excess).await?;
        for victim in &victims {
            self.store
                .delete(&self.target_key(&victim.group, &victim.name))?;
            info!(target = %victim.name, group = %victim.group, "target removed");
        }
        Ok(())
    }
}
