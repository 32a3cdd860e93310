//! Job configuration artifacts and their defaulting/validation pass.
//!
//! The cache stores artifacts exactly as the resolver returned them;
//! [`default_and_validate`] runs on every cache return so defaulting stays a
//! pure function of the stored artifact and is idempotent.

use serde::{Deserialize, Serialize};

/// Agent assigned to jobs that do not name one.
pub const DEFAULT_AGENT: &str = "kubernetes";
/// Cluster assigned to jobs that do not name one.
pub const DEFAULT_CLUSTER: &str = "default";

/// Fields shared by all job descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobBase {
    /// Unique job name within its kind.
    pub name: String,
    /// Execution agent; defaulted to [`DEFAULT_AGENT`].
    #[serde(default)]
    pub agent: String,
    /// Build cluster; defaulted to [`DEFAULT_CLUSTER`].
    #[serde(default)]
    pub cluster: String,
    /// Maximum concurrently running instances; zero means unbounded.
    #[serde(default)]
    pub max_concurrency: u32,
}

/// A job run against proposed changes before merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presubmit {
    /// Shared descriptor fields.
    #[serde(flatten)]
    pub base: JobBase,
    /// Run on every change without an explicit trigger.
    #[serde(default)]
    pub always_run: bool,
    /// Failures do not block merging.
    #[serde(default)]
    pub optional: bool,
    /// Comment command that triggers the job; defaulted from the name.
    #[serde(default)]
    pub trigger: String,
    /// Comment command echoed to users to rerun; defaulted from the trigger.
    #[serde(default)]
    pub rerun_command: String,
    /// Status context reported for the job; defaulted from the name.
    #[serde(default)]
    pub context: String,
}

/// A job run against a branch after merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Postsubmit {
    /// Shared descriptor fields.
    #[serde(flatten)]
    pub base: JobBase,
    /// Branches the job runs on; empty means all.
    #[serde(default)]
    pub branches: Vec<String>,
}

/// Resolved job configuration for one revision set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArtifact {
    /// Presubmit job descriptors.
    #[serde(default)]
    pub presubmits: Vec<Presubmit>,
    /// Postsubmit job descriptors.
    #[serde(default)]
    pub postsubmits: Vec<Postsubmit>,
}

/// Rejections from the validation pass.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    /// A job descriptor had no name.
    #[error("{kind} job with empty name")]
    EmptyName {
        /// Job kind, `presubmit` or `postsubmit`.
        kind: &'static str,
    },
    /// Two descriptors of the same kind share a name.
    #[error("duplicate {kind} job name {name:?}")]
    DuplicateName {
        /// Job kind, `presubmit` or `postsubmit`.
        kind: &'static str,
        /// The duplicated name.
        name: String,
    },
}

fn default_base(base: &mut JobBase) {
    if base.agent.is_empty() {
        base.agent = DEFAULT_AGENT.to_owned();
    }
    if base.cluster.is_empty() {
        base.cluster = DEFAULT_CLUSTER.to_owned();
    }
}

fn check_names<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if name.is_empty() {
            return Err(ValidationError::EmptyName { kind });
        }
        if !seen.insert(name) {
            return Err(ValidationError::DuplicateName {
                kind,
                name: name.to_owned(),
            });
        }
    }
    Ok(())
}

/// Fill unset fields and reject malformed artifacts, returning the defaulted
/// copy. The input is left untouched so the cached form stays pre-defaulting.
pub fn default_and_validate(artifact: &JobArtifact) -> Result<JobArtifact, ValidationError> {
    check_names("presubmit", artifact.presubmits.iter().map(|p| p.base.name.as_str()))?;
    check_names(
        "postsubmit",
        artifact.postsubmits.iter().map(|p| p.base.name.as_str()),
    )?;

    let mut out = artifact.clone();
    for presubmit in &mut out.presubmits {
        default_base(&mut presubmit.base);
        if presubmit.context.is_empty() {
            presubmit.context = format!("ci/{}", presubmit.base.name);
        }
        if presubmit.trigger.is_empty() {
            presubmit.trigger = format!("/test {}", presubmit.base.name);
        }
        if presubmit.rerun_command.is_empty() {
            presubmit.rerun_command = presubmit.trigger.clone();
        }
    }
    for postsubmit in &mut out.postsubmits {
        default_base(&mut postsubmit.base);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presubmit(name: &str) -> Presubmit {
        Presubmit {
            base: JobBase {
                name: name.to_owned(),
                ..JobBase::default()
            },
            ..Presubmit::default()
        }
    }

    #[test]
    fn defaulting_fills_unset_fields_only() {
        let artifact = JobArtifact {
            presubmits: vec![Presubmit {
                trigger: "/test custom".to_owned(),
                ..presubmit("unit")
            }],
            postsubmits: vec![Postsubmit {
                base: JobBase {
                    name: "deploy".to_owned(),
                    cluster: "build01".to_owned(),
                    ..JobBase::default()
                },
                branches: vec!["main".to_owned()],
            }],
        };

        let defaulted = default_and_validate(&artifact).unwrap();
        let unit = &defaulted.presubmits[0];
        assert_eq!(unit.base.agent, "kubernetes");
        assert_eq!(unit.base.cluster, "default");
        assert_eq!(unit.trigger, "/test custom");
        assert_eq!(unit.rerun_command, "/test custom");
        assert_eq!(unit.context, "ci/unit");
        assert_eq!(defaulted.postsubmits[0].base.cluster, "build01");

        // The input artifact is untouched.
        assert_eq!(artifact.presubmits[0].base.agent, "");
    }

    #[test]
    fn defaulting_is_idempotent() {
        let artifact = JobArtifact {
            presubmits: vec![presubmit("unit")],
            ..JobArtifact::default()
        };
        let once = default_and_validate(&artifact).unwrap();
        let twice = default_and_validate(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_empty_and_duplicate_names() {
        let artifact = JobArtifact {
            presubmits: vec![presubmit("")],
            ..JobArtifact::default()
        };
        assert_eq!(
            default_and_validate(&artifact).unwrap_err(),
            ValidationError::EmptyName { kind: "presubmit" }
        );

        let artifact = JobArtifact {
            presubmits: vec![presubmit("unit"), presubmit("unit")],
            ..JobArtifact::default()
        };
        assert_eq!(
            default_and_validate(&artifact).unwrap_err(),
            ValidationError::DuplicateName {
                kind: "presubmit",
                name: "unit".to_owned()
            }
        );
    }
}
