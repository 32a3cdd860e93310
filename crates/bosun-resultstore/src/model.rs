//! The invocation model: the top-level uploaded record and its children.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Final state of an invocation or one of its configured targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    /// Work is still running.
    Building,
    /// Everything passed.
    Passed,
    /// At least one target failed.
    Failed,
    /// The run exceeded its deadline.
    TimedOut,
    /// The run was cancelled.
    Cancelled,
    /// State could not be determined.
    Unknown,
}

/// Wall-clock timing of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// When the run started.
    pub start: DateTime<Utc>,
    /// How long it ran.
    pub duration: Duration,
}

/// A file attached to an invocation or action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    /// Identifier unique within the owning resource.
    pub uid: String,
    /// Where the file lives (e.g. a `gs://` object path).
    pub uri: String,
    /// Size in bytes, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    /// MIME content type, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Free-form description and labels attached to an invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationAttributes {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Search labels.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// The top-level uploaded record for a single job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Invocation identifier.
    pub id: Uuid,
    /// Final status.
    pub status: InvocationStatus,
    /// Run timing.
    pub timing: Timing,
    /// Description and labels.
    #[serde(default)]
    pub attributes: InvocationAttributes,
    /// Attached files. UIDs must be unique within the invocation.
    #[serde(default)]
    pub files: Vec<FileRef>,
}

impl Invocation {
    /// Check invocation-level invariants (unique file UIDs).
    pub fn validate(&self) -> Result<(), DuplicateUid> {
        let mut seen = HashSet::new();
        for file in &self.files {
            if !seen.insert(file.uid.as_str()) {
                return Err(DuplicateUid {
                    kind: "file",
                    uid: file.uid.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Two sibling resources carried the same UID.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("duplicate {kind} uid {uid:?}")]
pub struct DuplicateUid {
    /// Resource kind.
    pub kind: &'static str,
    /// The duplicated identifier.
    pub uid: String,
}

/// A build/test configuration an invocation ran under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Identifier unique among the invocation's configurations.
    pub uid: String,
    /// Display name shown in result browsers.
    #[serde(default)]
    pub display_name: String,
    /// Free-form configuration properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A buildable/testable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Identifier unique among the invocation's targets.
    pub uid: String,
    /// Display name shown in result browsers.
    #[serde(default)]
    pub display_name: String,
}

/// A target paired with the configuration it ran under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredTarget {
    /// Identifier unique among the invocation's configured targets.
    pub uid: String,
    /// UID of the target.
    pub target_uid: String,
    /// UID of the configuration.
    pub configuration_uid: String,
    /// Outcome for this pairing.
    pub status: InvocationStatus,
}

/// One executed step of a configured target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Identifier unique among its configured target's actions.
    pub uid: String,
    /// UID of the configured target this action belongs to.
    pub configured_target_uid: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Action timing.
    pub timing: Timing,
    /// Files the action produced.
    #[serde(default)]
    pub files: Vec<FileRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation_with_files(uids: &[&str]) -> Invocation {
        Invocation {
            id: Uuid::new_v4(),
            status: InvocationStatus::Passed,
            timing: Timing {
                start: Utc::now(),
                duration: Duration::from_secs(60),
            },
            attributes: InvocationAttributes::default(),
            files: uids
                .iter()
                .map(|uid| FileRef {
                    uid: (*uid).to_owned(),
                    uri: format!("gs://bucket/{uid}"),
                    length: None,
                    content_type: None,
                })
                .collect(),
        }
    }

    #[test]
    fn unique_file_uids_pass_validation() {
        assert!(invocation_with_files(&["build.log", "finished.json"])
            .validate()
            .is_ok());
    }

    #[test]
    fn duplicate_file_uids_are_rejected() {
        let err = invocation_with_files(&["build.log", "build.log"])
            .validate()
            .unwrap_err();
        assert_eq!(err.uid, "build.log");
    }
}
