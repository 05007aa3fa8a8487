//! The per-entity rollout state machine.
//!
//! Each tick partitions the entity's targets into buckets (available /
//! in-rollout / success / failed), converts in-rollout targets through
//! monitoring, maintains the last-known-good and last-known-bad
//! markers, and advances the rolling version when the current phase is
//! settled. Bucketing always happens against the rolling version as of
//! the start of the tick, so a tick that swaps the rolling version
//! selects its first batch on the next tick.
//!
//! The machine itself never touches the store; [`crate::entity`] owns
//! persistence and batch/removal execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::{ControllerBinding, MonitoringBinding, MonitoringController, TargetController};
use crate::error::{EngineError, EngineResult};
use crate::target::EntityTarget;
use crate::types::{ClientState, RolloutInfo, RolloutOptions};

/// Bucket membership for one tick. Indices refer to the name-sorted
/// target slice the tick operates on; the slice itself is the total
/// set.
#[derive(Debug, Default)]
pub struct TickBuckets {
    /// Candidates for the next batch (target version differs from the
    /// rolling version). Deliberately includes erroring targets: a
    /// rollback must be able to re-point targets failing on the bad
    /// version.
    pub available: Vec<usize>,
    /// Told to move to the rolling version, outcome pending.
    pub in_rollout: Vec<usize>,
    /// Converged on the rolling version.
    pub success: Vec<usize>,
    /// Judged failing on the rolling version.
    pub failed: Vec<usize>,
}

/// Previous tick's bucket contents, persisted for change detection.
/// Ticks that observe the identical partition write nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    pub available: Vec<String>,
    pub in_rollout: Vec<String>,
    pub success: Vec<String>,
    pub failed: Vec<String>,
}

/// Mutable rollout bookkeeping, persisted per entity at
/// `rollout/{ns}/{entity}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutState {
    /// The caller's desired version.
    pub target_version: String,
    /// The version currently being pushed out; may lag `target_version`
    /// and equals the last known good when at rest.
    pub rolling_version: String,
    pub last_known_good_version: String,
    pub last_known_bad_version: String,
    pub options: RolloutOptions,
    /// When `rolling_version` was last (re)assigned.
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_observed: ObservedState,
}

/// Persisted rollout record: bookkeeping plus controller bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub state: RolloutState,
    #[serde(default)]
    pub target_controller: ControllerBinding,
    #[serde(default)]
    pub monitoring_controller: MonitoringBinding,
}

impl Rollout {
    /// Snapshot for the info endpoint.
    pub fn info(&self) -> RolloutInfo {
        RolloutInfo {
            target_version: self.state.target_version.clone(),
            rolling_version: self.state.rolling_version.clone(),
            last_known_good_version: self.state.last_known_good_version.clone(),
            last_known_bad_version: self.state.last_known_bad_version.clone(),
        }
    }

    /// Set the desired version. With `force`, an in-flight rolling
    /// version is first marked last known bad so the fleet abandons it;
    /// a forced retarget onto the current last known bad clears the
    /// marker instead. Returns whether anything changed.
    pub fn set_target_version(&mut self, version: &str, force: bool) -> EngineResult<bool> {
        if version.is_empty() {
            return Err(EngineError::InvalidInput("target version is empty".into()));
        }
        let state = &mut self.state;
        if !force && !state.last_known_bad_version.is_empty()
            && version == state.last_known_bad_version
        {
            return Err(EngineError::Conflict(version.to_string()));
        }

        let mut changed = state.target_version != version;
        if force {
            let rolling = state.rolling_version.clone();
            if !rolling.is_empty()
                && rolling != version
                && rolling != state.last_known_good_version
                && rolling != state.last_known_bad_version
            {
                warn!(%rolling, target = %version, "force retarget: abandoning in-flight rolling version");
                state.last_known_bad_version = rolling;
                changed = true;
            }
            if state.last_known_bad_version == version {
                state.last_known_bad_version.clear();
                changed = true;
            }
        }
        if state.target_version != version {
            info!(from = %state.target_version, to = %version, "target version set");
            state.target_version = version.to_string();
        }
        Ok(changed)
    }

    /// Replace the rollout options. Returns whether anything changed.
    pub fn set_options(&mut self, options: &RolloutOptions) -> EngineResult<bool> {
        options
            .validate()
            .map_err(EngineError::InvalidInput)?;
        if self.state.options == *options {
            return Ok(false);
        }
        self.state.options = *options;
        Ok(true)
    }

    /// Batch size for the current options: at least one target, integer
    /// share of the fleet otherwise.
    pub fn batch_size(&self, total: usize) -> usize {
        (total * self.state.options.batch_percent as usize / 100).max(1)
    }

    /// Whether the current batch's success ratio clears
    /// `success_percent`, allowing the next batch to be selected.
    ///
    /// The ratio is computed over the batch's settled outcomes
    /// (successes and failures). Targets still in rollout are already
    /// held back by the batch size cap, so they don't count against
    /// the ratio, and an untouched batch gates nothing.
    pub fn batch_success_reached(&self, buckets: &TickBuckets) -> bool {
        let settled = buckets.success.len() + buckets.failed.len();
        if settled == 0 {
            return true;
        }
        buckets.success.len() * 100 / settled >= self.state.options.success_percent as usize
    }

    /// Partition targets against the current rolling version.
    ///
    /// When the rolling version itself is the last known bad, every
    /// target is in rollout: the whole fleet has to be driven off it.
    pub fn determine_current_state(&self, targets: &[EntityTarget]) -> TickBuckets {
        let rolling = &self.state.rolling_version;
        let rolling_is_bad =
            !rolling.is_empty() && *rolling == self.state.last_known_bad_version;

        let mut buckets = TickBuckets::default();
        for (i, target) in targets.iter().enumerate() {
            if rolling_is_bad
                || (!rolling.is_empty() && target.state.target_version.version == *rolling)
            {
                buckets.in_rollout.push(i);
            } else {
                buckets.available.push(i);
            }
        }
        buckets
    }

    /// Convert in-rollout targets to success or failure.
    ///
    /// A target succeeds once it runs the rolling version, reports no
    /// error, its monitoring verdicts are ok, and its last message has
    /// been stable for the success timeout. It fails once it is judged
    /// erroring (own report, per-target monitoring, or fleet-level
    /// external monitoring) and the phase is older than the duration
    /// timeout — a zero timeout fails erroring targets on the spot.
    pub async fn monitor_targets(
        &self,
        targets: &[EntityTarget],
        buckets: &mut TickBuckets,
        now: DateTime<Utc>,
        target_controller: &dyn TargetController,
        monitoring_controller: Option<&dyn MonitoringController>,
    ) -> EngineResult<()> {
        if buckets.in_rollout.is_empty() {
            return Ok(());
        }

        let fleet_failing = match monitoring_controller {
            Some(controller) => {
                let in_rollout: Vec<ClientState> = buckets
                    .in_rollout
                    .iter()
                    .map(|&i| targets[i].reported_state())
                    .collect();
                let verdict = controller.external_monitoring(&in_rollout).await?;
                if !verdict.is_ok() {
                    warn!("external monitoring reports the in-rollout set failing");
                }
                !verdict.is_ok()
            }
            None => false,
        };

        let mut remaining = Vec::new();
        for &i in &buckets.in_rollout {
            let target = &targets[i];
            let verdict = target_controller
                .target_monitoring(&target.reported_state())
                .await?;
            let erroring = target.is_erroring() || fleet_failing || !verdict.is_ok();
            let arrived =
                target.state.current_version.version == self.state.rolling_version;

            if arrived && !erroring && self.quiet_long_enough(target, now) {
                debug!(target = %target.name, version = %self.state.rolling_version, "target succeeded");
                buckets.success.push(i);
            } else if erroring && self.phase_expired(now) {
                warn!(target = %target.name, version = %self.state.rolling_version, "target failed");
                buckets.failed.push(i);
            } else {
                remaining.push(i);
            }
        }
        buckets.in_rollout = remaining;
        Ok(())
    }

    fn quiet_long_enough(&self, target: &EntityTarget, now: DateTime<Utc>) -> bool {
        let quiet_for = now - target.state.current_version.last_message.timestamp;
        quiet_for.num_seconds() >= self.state.options.success_timeout_secs as i64
    }

    fn phase_expired(&self, now: DateTime<Utc>) -> bool {
        match self.state.start_timestamp {
            Some(start) => {
                (now - start).num_seconds() >= self.state.options.duration_timeout_secs as i64
            }
            None => true,
        }
    }

    /// Update the last-known markers from the bucketed view. Returns
    /// whether anything changed.
    ///
    /// The rolling version is proven good once the entire total set has
    /// succeeded, and proven bad once failures push the reachable
    /// success share under `success_percent`.
    pub fn update_last_known_versions(
        &mut self,
        targets: &[EntityTarget],
        buckets: &TickBuckets,
    ) -> bool {
        let total = targets.len();
        let rolling = self.state.rolling_version.clone();
        if total == 0 || rolling.is_empty() {
            return false;
        }

        let mut changed = false;
        let converged = buckets.failed.is_empty()
            && buckets.in_rollout.is_empty()
            && buckets.success.len() == total;

        if converged && self.state.last_known_good_version != rolling {
            info!(version = %rolling, "rolling version proven good");
            self.state.last_known_good_version = rolling.clone();
            if self.state.last_known_bad_version == rolling {
                self.state.last_known_bad_version.clear();
            }
            changed = true;
        } else if !buckets.failed.is_empty()
            && self.state.last_known_good_version != rolling
            && self.state.last_known_bad_version != rolling
        {
            let reachable = (total - buckets.failed.len()) * 100 / total;
            if reachable < self.state.options.success_percent as usize {
                warn!(
                    version = %rolling,
                    failed = buckets.failed.len(),
                    reachable,
                    required = self.state.options.success_percent,
                    "rolling version proven bad"
                );
                self.state.last_known_bad_version = rolling;
                changed = true;
            }
        }

        let lkg = &self.state.last_known_good_version;
        let lkb = &self.state.last_known_bad_version;
        if !lkg.is_empty() && lkg == lkb {
            panic!("rollout state corrupted: {lkg} is both last known good and last known bad");
        }

        changed
    }

    /// Advance the rolling version toward the effective goal when the
    /// current phase is settled. Returns whether it advanced.
    ///
    /// The goal is the last known good when the desired version is the
    /// last known bad (rollback), the desired version otherwise. A
    /// phase is settled when the rolling version is empty (first tick
    /// with targets), proven good, or proven bad.
    pub fn update_rolling_version(&mut self, now: DateTime<Utc>) -> bool {
        let state = &mut self.state;
        let goal = if !state.last_known_bad_version.is_empty()
            && state.target_version == state.last_known_bad_version
        {
            state.last_known_good_version.clone()
        } else {
            state.target_version.clone()
        };

        if goal.is_empty() || state.rolling_version == goal {
            return false;
        }
        let settled = state.rolling_version.is_empty()
            || state.rolling_version == state.last_known_good_version
            || state.rolling_version == state.last_known_bad_version;
        if !settled {
            return false;
        }

        info!(from = %state.rolling_version, to = %goal, "advancing rolling version");
        state.rolling_version = goal;
        state.start_timestamp = Some(now);
        true
    }

    /// Record the bucket partition for change detection. Returns
    /// whether it differs from the previous tick's.
    pub fn record_observed(
        &mut self,
        targets: &[EntityTarget],
        buckets: &TickBuckets,
    ) -> bool {
        let names = |indices: &[usize]| -> Vec<String> {
            indices.iter().map(|&i| targets[i].name.clone()).collect()
        };
        let observed = ObservedState {
            available: names(&buckets.available),
            in_rollout: names(&buckets.in_rollout),
            success: names(&buckets.success),
            failed: names(&buckets.failed),
        };
        if self.state.last_observed == observed {
            return false;
        }
        debug!(
            available = observed.available.len(),
            in_rollout = observed.in_rollout.len(),
            success = observed.success.len(),
            failed = observed.failed.len(),
            "rollout state changed"
        );
        self.state.last_observed = observed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NoOpTargetController;
    use chrono::Duration;

    fn make_targets(count: usize, version: &str) -> Vec<EntityTarget> {
        let created = Utc::now() - Duration::seconds(60);
        (0..count)
            .map(|i| {
                EntityTarget::from_report(
                    &ClientState {
                        name: format!("target{i}"),
                        version: version.into(),
                        message: "running".into(),
                        ..Default::default()
                    },
                    created,
                )
            })
            .collect()
    }

    fn rollout_with(rolling: &str, lkg: &str, lkb: &str) -> Rollout {
        let mut rollout = Rollout::default();
        rollout.state.rolling_version = rolling.into();
        rollout.state.last_known_good_version = lkg.into();
        rollout.state.last_known_bad_version = lkb.into();
        rollout
    }

    async fn monitor(
        rollout: &Rollout,
        targets: &[EntityTarget],
        buckets: &mut TickBuckets,
        now: DateTime<Utc>,
    ) {
        rollout
            .monitor_targets(targets, buckets, now, &NoOpTargetController, None)
            .await
            .unwrap();
    }

    #[test]
    fn targets_on_other_versions_are_available() {
        let targets = make_targets(10, "v1");
        let rollout = rollout_with("v5", "v1", "");

        let buckets = rollout.determine_current_state(&targets);
        assert_eq!(buckets.available.len(), 10);
        assert!(buckets.in_rollout.is_empty());
    }

    #[test]
    fn bad_rolling_version_puts_everything_in_rollout() {
        let targets = make_targets(10, "v1");
        let rollout = rollout_with("v5", "v1", "v5");

        let buckets = rollout.determine_current_state(&targets);
        assert!(buckets.available.is_empty());
        assert_eq!(buckets.in_rollout.len(), 10);
    }

    #[test]
    fn targets_told_the_rolling_version_are_in_rollout() {
        let mut targets = make_targets(4, "v1");
        targets[0].state.target_version.version = "v2".into();
        targets[1].state.target_version.version = "v2".into();
        let rollout = rollout_with("v2", "v1", "");

        let buckets = rollout.determine_current_state(&targets);
        assert_eq!(buckets.in_rollout, vec![0, 1]);
        assert_eq!(buckets.available, vec![2, 3]);
    }

    #[tokio::test]
    async fn monitor_converts_arrived_targets_to_success() {
        let targets = make_targets(10, "v1");
        let mut rollout = rollout_with("v1", "v1", "");
        rollout.state.options.success_timeout_secs = 0;

        let mut buckets = rollout.determine_current_state(&targets);
        assert_eq!(buckets.in_rollout.len(), 10);

        monitor(&rollout, &targets, &mut buckets, Utc::now()).await;
        assert!(buckets.in_rollout.is_empty());
        assert_eq!(buckets.success.len(), 10);
    }

    #[tokio::test]
    async fn monitor_waits_out_the_success_timeout() {
        let targets = make_targets(3, "v1");
        let mut rollout = rollout_with("v1", "v1", "");
        rollout.state.options.success_timeout_secs = 900;
        rollout.state.options.duration_timeout_secs = 3600;
        rollout.state.start_timestamp = Some(Utc::now());

        let mut buckets = rollout.determine_current_state(&targets);
        monitor(&rollout, &targets, &mut buckets, Utc::now()).await;

        // Messages are only a minute old: neither success nor failure.
        assert_eq!(buckets.in_rollout.len(), 3);
        assert!(buckets.success.is_empty());
        assert!(buckets.failed.is_empty());
    }

    #[tokio::test]
    async fn monitor_fails_erroring_targets_once_the_phase_expires() {
        let mut targets = make_targets(5, "v1");
        let now = Utc::now();
        for target in &mut targets {
            target.observe(
                &ClientState {
                    name: target.name.clone(),
                    version: "v1".into(),
                    message: "simulating failure".into(),
                    is_error: true,
                    ..Default::default()
                },
                now,
            );
        }
        let mut rollout = rollout_with("v1", "", "");
        rollout.state.options.success_timeout_secs = 900;
        rollout.state.options.duration_timeout_secs = 0;

        let mut buckets = rollout.determine_current_state(&targets);
        monitor(&rollout, &targets, &mut buckets, now).await;

        assert!(buckets.success.is_empty());
        assert_eq!(buckets.failed.len(), 5);
    }

    #[tokio::test]
    async fn monitor_spares_erroring_targets_inside_the_duration_window() {
        let mut targets = make_targets(2, "v1");
        let now = Utc::now();
        targets[0].observe(
            &ClientState {
                name: "target0".into(),
                version: "v1".into(),
                message: "flaking".into(),
                is_error: true,
                ..Default::default()
            },
            now,
        );
        let mut rollout = rollout_with("v1", "", "");
        rollout.state.options.success_timeout_secs = 0;
        rollout.state.options.duration_timeout_secs = 600;
        rollout.state.start_timestamp = Some(now - Duration::seconds(30));

        let mut buckets = rollout.determine_current_state(&targets);
        monitor(&rollout, &targets, &mut buckets, now).await;

        // The healthy target converts; the erroring one is still inside
        // the duration window.
        assert!(buckets.failed.is_empty());
        assert_eq!(buckets.success.len(), 1);
        assert_eq!(buckets.in_rollout.len(), 1);
    }

    #[test]
    fn full_convergence_moves_last_known_good() {
        let targets = make_targets(10, "v2");
        let mut rollout = rollout_with("v2", "v1", "");

        let buckets = TickBuckets {
            success: (0..10).collect(),
            ..Default::default()
        };
        assert!(rollout.update_last_known_versions(&targets, &buckets));
        assert_eq!(rollout.state.last_known_good_version, "v2");
        assert_eq!(rollout.state.last_known_bad_version, "");
    }

    #[test]
    fn failures_under_threshold_mark_last_known_bad() {
        let targets = make_targets(10, "v2");
        let mut rollout = rollout_with("v2", "v1", "");
        rollout.state.options.success_percent = 95;

        let buckets = TickBuckets {
            failed: (0..10).collect(),
            ..Default::default()
        };
        assert!(rollout.update_last_known_versions(&targets, &buckets));
        assert_eq!(rollout.state.last_known_good_version, "v1");
        assert_eq!(rollout.state.last_known_bad_version, "v2");
    }

    #[test]
    fn partial_failure_within_tolerance_changes_nothing() {
        let targets = make_targets(10, "v2");
        let mut rollout = rollout_with("v2", "v1", "");
        rollout.state.options.success_percent = 50;

        // 2 of 10 failed: 80% can still succeed, 50% required.
        let buckets = TickBuckets {
            failed: vec![0, 1],
            success: vec![2, 3],
            in_rollout: vec![4, 5],
            available: vec![6, 7, 8, 9],
        };
        assert!(!rollout.update_last_known_versions(&targets, &buckets));
        assert_eq!(rollout.state.last_known_bad_version, "");
    }

    #[test]
    fn proving_the_bad_version_good_clears_the_marker() {
        let targets = make_targets(4, "v3");
        let mut rollout = rollout_with("v3", "v1", "v3");

        let buckets = TickBuckets {
            success: (0..4).collect(),
            ..Default::default()
        };
        assert!(rollout.update_last_known_versions(&targets, &buckets));
        assert_eq!(rollout.state.last_known_good_version, "v3");
        assert_eq!(rollout.state.last_known_bad_version, "");
    }

    #[test]
    fn settled_phase_advances_toward_the_target() {
        let mut rollout = rollout_with("v1", "v1", "");
        rollout.state.target_version = "v2".into();

        assert!(rollout.update_rolling_version(Utc::now()));
        assert_eq!(rollout.state.rolling_version, "v2");
        assert!(rollout.state.start_timestamp.is_some());
    }

    #[test]
    fn unsettled_phase_does_not_advance() {
        let mut rollout = rollout_with("v2", "v1", "");
        rollout.state.target_version = "v3".into();

        assert!(!rollout.update_rolling_version(Utc::now()));
        assert_eq!(rollout.state.rolling_version, "v2");
    }

    #[test]
    fn bad_target_version_rolls_back_to_last_known_good() {
        let mut rollout = rollout_with("v2", "v1", "v2");
        rollout.state.target_version = "v2".into();

        assert!(rollout.update_rolling_version(Utc::now()));
        assert_eq!(rollout.state.rolling_version, "v1");
    }

    #[test]
    fn first_tick_adopts_the_target_version() {
        let mut rollout = Rollout::default();
        rollout.state.target_version = "v1".into();

        assert!(rollout.update_rolling_version(Utc::now()));
        assert_eq!(rollout.state.rolling_version, "v1");
    }

    #[test]
    fn force_retarget_abandons_the_rolling_version() {
        let mut rollout = rollout_with("v1", "v0", "");

        rollout.set_target_version("v2", true).unwrap();
        assert_eq!(rollout.state.last_known_bad_version, "v1");

        assert!(rollout.update_rolling_version(Utc::now()));
        assert_eq!(rollout.state.rolling_version, "v2");
    }

    #[test]
    fn retargeting_the_bad_version_needs_force() {
        let mut rollout = rollout_with("v1", "v1", "v2");

        let err = rollout.set_target_version("v2", false).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        rollout.set_target_version("v2", true).unwrap();
        assert_eq!(rollout.state.target_version, "v2");
        assert_eq!(rollout.state.last_known_bad_version, "");
    }

    #[test]
    fn empty_target_version_is_invalid() {
        let mut rollout = Rollout::default();
        assert!(matches!(
            rollout.set_target_version("", false),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn batch_size_truncates_and_floors_at_one() {
        let mut rollout = Rollout::default();
        rollout.state.options.batch_percent = 34;
        assert_eq!(rollout.batch_size(3), 1);

        rollout.state.options.batch_percent = 50;
        assert_eq!(rollout.batch_size(10), 5);

        rollout.state.options.batch_percent = 5;
        assert_eq!(rollout.batch_size(10), 1);

        rollout.state.options.batch_percent = 100;
        assert_eq!(rollout.batch_size(7), 7);
    }

    #[test]
    fn batch_advancement_gates_on_the_success_ratio() {
        let mut rollout = rollout_with("v2", "v1", "");
        rollout.state.options.success_percent = 50;

        // Nothing settled yet: nothing to gate.
        assert!(rollout.batch_success_reached(&TickBuckets::default()));

        // A pending target doesn't count against the ratio.
        let buckets = TickBuckets {
            in_rollout: vec![0],
            ..Default::default()
        };
        assert!(rollout.batch_success_reached(&buckets));

        // One failure, no successes: 0% < 50%.
        let buckets = TickBuckets {
            failed: vec![0],
            in_rollout: vec![1],
            ..Default::default()
        };
        assert!(!rollout.batch_success_reached(&buckets));

        // One of each: exactly 50%.
        let buckets = TickBuckets {
            success: vec![0],
            failed: vec![1],
            ..Default::default()
        };
        assert!(rollout.batch_success_reached(&buckets));
        rollout.state.options.success_percent = 51;
        assert!(!rollout.batch_success_reached(&buckets));

        // A zero threshold never blocks.
        rollout.state.options.success_percent = 0;
        let buckets = TickBuckets {
            failed: vec![0, 1],
            ..Default::default()
        };
        assert!(rollout.batch_success_reached(&buckets));
    }

    #[test]
    fn record_observed_detects_changes() {
        let targets = make_targets(10, "v1");
        let mut rollout = rollout_with("v2", "v1", "");

        let buckets = TickBuckets {
            success: (0..10).collect(),
            ..Default::default()
        };
        assert!(rollout.record_observed(&targets, &buckets));
        // Identical partition: unchanged.
        assert!(!rollout.record_observed(&targets, &buckets));

        let buckets = TickBuckets {
            failed: (0..10).collect(),
            ..Default::default()
        };
        assert!(rollout.record_observed(&targets, &buckets));
    }

    #[test]
    #[should_panic(expected = "rollout state corrupted")]
    fn matching_good_and_bad_markers_panic() {
        let targets = make_targets(2, "v1");
        let mut rollout = rollout_with("v9", "v1", "v1");
        let buckets = TickBuckets::default();
        rollout.update_last_known_versions(&targets, &buckets);
    }
}
