//! Persisted per-target records and the observation-merge rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ClientState;

/// Most recent status message from a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub message: String,
    pub is_error: bool,
    /// Advances only when `message` or `is_error` changes.
    pub timestamp: DateTime<Utc>,
}

/// The version a target is observed running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentVersion {
    pub version: String,
    /// Advances only when `version` actually changes.
    pub change_timestamp: DateTime<Utc>,
    pub last_message: LastMessage,
}

/// The version a target has been told to move to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetVersion {
    pub version: String,
}

/// Observed plus expected state for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    pub current_version: CurrentVersion,
    pub target_version: TargetVersion,
}

/// Persisted record for one target, keyed by
/// `entity-target/{ns}/{entity}/{group}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTarget {
    pub name: String,
    pub group: String,
    pub state: TargetState,
}

impl EntityTarget {
    /// Create a record from a first observation.
    ///
    /// A brand-new target starts with `target_version` equal to what it
    /// reported: it is immediately in rollout toward its own version
    /// until the engine assigns it elsewhere.
    pub fn from_report(report: &ClientState, now: DateTime<Utc>) -> Self {
        Self {
            name: report.name.clone(),
            group: report.group.clone(),
            state: TargetState {
                current_version: CurrentVersion {
                    version: report.version.clone(),
                    change_timestamp: now,
                    last_message: LastMessage {
                        message: report.message.clone(),
                        is_error: report.is_error,
                        timestamp: now,
                    },
                },
                target_version: TargetVersion {
                    version: report.version.clone(),
                },
            },
        }
    }

    /// Merge a new observation into this record.
    ///
    /// Returns whether anything changed; identical reports are no-ops
    /// so callers can skip the store write.
    pub fn observe(&mut self, report: &ClientState, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        let current = &mut self.state.current_version;

        if current.version != report.version {
            current.version = report.version.clone();
            current.change_timestamp = now;
            changed = true;
        }

        let last = &mut current.last_message;
        if last.message != report.message || last.is_error != report.is_error {
            last.message = report.message.clone();
            last.is_error = report.is_error;
            last.timestamp = now;
            changed = true;
        }

        changed
    }

    /// Whether the target's latest report is an error.
    pub fn is_erroring(&self) -> bool {
        self.state.current_version.last_message.is_error
    }

    /// View of this target as observed by the caller; controllers see
    /// this shape.
    pub fn reported_state(&self) -> ClientState {
        ClientState {
            name: self.name.clone(),
            group: self.group.clone(),
            version: self.state.current_version.version.clone(),
            message: self.state.current_version.last_message.message.clone(),
            is_error: self.state.current_version.last_message.is_error,
        }
    }

    /// View of this target as the caller should act on it: `version` is
    /// the expected (target) version.
    pub fn expected_state(&self) -> ClientState {
        ClientState {
            version: self.state.target_version.version.clone(),
            ..self.reported_state()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn report(version: &str, message: &str, is_error: bool) -> ClientState {
        ClientState {
            name: "host-0".into(),
            group: String::new(),
            version: version.into(),
            message: message.into(),
            is_error,
        }
    }

    #[test]
    fn new_target_rolls_toward_its_reported_version() {
        let now = Utc::now();
        let target = EntityTarget::from_report(&report("v1", "up", false), now);
        assert_eq!(target.state.current_version.version, "v1");
        assert_eq!(target.state.target_version.version, "v1");
        assert_eq!(target.state.current_version.change_timestamp, now);
    }

    #[test]
    fn identical_report_changes_nothing() {
        let created = Utc::now();
        let mut target = EntityTarget::from_report(&report("v1", "up", false), created);

        let later = created + Duration::seconds(5);
        assert!(!target.observe(&report("v1", "up", false), later));
        assert_eq!(target.state.current_version.change_timestamp, created);
        assert_eq!(target.state.current_version.last_message.timestamp, created);
    }

    #[test]
    fn version_change_advances_change_timestamp_only() {
        let created = Utc::now();
        let mut target = EntityTarget::from_report(&report("v1", "up", false), created);

        let later = created + Duration::seconds(5);
        assert!(target.observe(&report("v2", "up", false), later));
        assert_eq!(target.state.current_version.version, "v2");
        assert_eq!(target.state.current_version.change_timestamp, later);
        assert_eq!(target.state.current_version.last_message.timestamp, created);
    }

    #[test]
    fn error_flip_advances_message_timestamp_only() {
        let created = Utc::now();
        let mut target = EntityTarget::from_report(&report("v1", "up", false), created);

        let later = created + Duration::seconds(5);
        assert!(target.observe(&report("v1", "up", true), later));
        assert_eq!(target.state.current_version.change_timestamp, created);
        assert_eq!(target.state.current_version.last_message.timestamp, later);
        assert!(target.is_erroring());
    }

    #[test]
    fn expected_state_carries_target_version() {
        let now = Utc::now();
        let mut target = EntityTarget::from_report(&report("v1", "up", false), now);
        target.state.target_version.version = "v2".into();

        assert_eq!(target.reported_state().version, "v1");
        assert_eq!(target.expected_state().version, "v2");
    }
}
