//! Wire-level types shared between the engine and its callers.
//!
//! These serialize with PascalCase field names: they are the stable
//! contract with status-reporting clients and webhook controllers.
//! Persisted records (see [`crate::target`] and [`crate::rollout`])
//! use snake_case and are internal.

use serde::{Deserialize, Serialize};

/// One target's state as reported by the caller.
///
/// `version` is the version the target is observed running. The same
/// shape comes back from [`crate::engine::Engine::orchestrate`] with
/// `version` set to the version the caller should drive the target to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientState {
    /// Unique per group within an entity.
    pub name: String,
    /// Optional partition of targets within an entity.
    pub group: String,
    /// Observed version, case-sensitive.
    pub version: String,
    /// Free-text status message.
    pub message: String,
    /// Whether the target is reporting an error.
    pub is_error: bool,
}

/// Rollout pacing and failure-detection knobs, persisted per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RolloutOptions {
    /// Share of the fleet to have in rollout at once, 0-100. A batch is
    /// never smaller than one target.
    pub batch_percent: u32,
    /// Minimum share of targets that must still be able to succeed
    /// before the rolling version is declared bad, 0-100.
    pub success_percent: u32,
    /// Seconds a target must report non-error before it counts as
    /// succeeded. Zero counts a target on its first healthy report.
    pub success_timeout_secs: u64,
    /// Seconds after the phase start before an erroring target counts
    /// as failed. Zero fails an erroring target immediately.
    pub duration_timeout_secs: u64,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            batch_percent: 5,
            success_percent: 95,
            success_timeout_secs: 300,
            duration_timeout_secs: 3600,
        }
    }
}

impl RolloutOptions {
    /// Validate percentage bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_percent > 100 {
            return Err(format!(
                "batch percent must be 0-100, got {}",
                self.batch_percent
            ));
        }
        if self.success_percent > 100 {
            return Err(format!(
                "success percent must be 0-100, got {}",
                self.success_percent
            ));
        }
        Ok(())
    }
}

/// Desired version for an entity, as submitted by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EntityTargetVersion {
    pub version: String,
    /// Abandon an in-flight rolling version by marking it last known
    /// bad before retargeting.
    pub force: bool,
}

/// Snapshot of an entity's rollout bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RolloutInfo {
    pub target_version: String,
    pub rolling_version: String,
    pub last_known_good_version: String,
    pub last_known_bad_version: String,
}
