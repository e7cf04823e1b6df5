//! Retention policies and prune tasks.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use super::endpoint::Endpoint;
use crate::core::event_store::hash_input;
use crate::core::safety::RelativePath;

/// What kind of data a file is, for retention purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Detector output as acquired
    #[default]
    Raw,

    /// Reconstructions and other products computed from raw data
    Derived,
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Derived => f.write_str("derived"),
        }
    }
}

/// Per-endpoint rule: delete copies of a category after N days
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub endpoint: String,

    #[serde(default)]
    pub applies_to: DataCategory,

    pub delete_after_days: u32,
}

/// All configured policies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionPolicies(Vec<RetentionPolicy>);

impl RetentionPolicies {
    pub fn new(policies: Vec<RetentionPolicy>) -> Self {
        Self(policies)
    }

    /// Policy for an endpoint and category, if one is configured
    pub fn lookup(&self, endpoint: &str, category: DataCategory) -> Option<&RetentionPolicy> {
        self.0
            .iter()
            .find(|p| p.endpoint == endpoint && p.applies_to == category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetentionPolicy> {
        self.0.iter()
    }
}

/// Glob patterns that decide whether a path is derived data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRules {
    #[serde(default = "default_derived_patterns")]
    pub derived: Vec<String>,
}

fn default_derived_patterns() -> Vec<String> {
    vec![
        "**/rec*/**".to_string(),
        "**/rec*/".to_string(),
        "**/*.zarr/**".to_string(),
        "**/*.zarr/".to_string(),
    ]
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self {
            derived: default_derived_patterns(),
        }
    }
}

impl CategoryRules {
    /// Classify a path; anything not matching a derived pattern is raw
    pub fn classify(&self, path: &RelativePath) -> DataCategory {
        let matched = self
            .derived
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|p| p.matches(path.as_str()));

        if matched {
            DataCategory::Derived
        } else {
            DataCategory::Raw
        }
    }
}

/// A deferred deletion of one file on one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneTask {
    /// Deterministic from endpoint and path
    pub id: String,

    pub endpoint: Endpoint,
    pub path: RelativePath,
    pub eligible_at: DateTime<Utc>,

    /// Re-checked at execution time; the source is kept if the copy is gone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_exists_at: Option<Endpoint>,

    pub created_at: DateTime<Utc>,
}

impl PruneTask {
    /// Create a task eligible `after_days` days from `now`
    pub fn new(
        endpoint: Endpoint,
        path: RelativePath,
        after_days: u32,
        verify_exists_at: Option<Endpoint>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: prune_task_id(&endpoint.name, &path),
            endpoint,
            path,
            eligible_at: now + Duration::days(i64::from(after_days)),
            verify_exists_at,
            created_at: now,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.eligible_at
    }
}

/// Deterministic prune task id: "prune-{hash16}" of endpoint and path
pub fn prune_task_id(endpoint: &str, path: &RelativePath) -> String {
    format!("prune-{}", hash_input(&format!("{}:{}", endpoint, path)))
}

/// Returned by scheduling, used for cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneTaskHandle {
    pub task_id: String,
    pub eligible_at: DateTime<Utc>,
}

/// What executing a prune task did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PruneOutcome {
    NotYetEligible,
    /// The downstream copy was missing; nothing was deleted
    VerificationFailed { endpoint: String },
    AlreadyAbsent,
    Deleted,
    Failed { error: String },
    Cancelled,
}

impl PruneOutcome {
    /// Success in the idempotent sense: the file is gone from the source
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Deleted | Self::AlreadyAbsent)
    }
}

impl fmt::Display for PruneOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotYetEligible => f.write_str("not yet eligible"),
            Self::VerificationFailed { endpoint } => {
                write!(f, "verification failed: missing at {}", endpoint)
            }
            Self::AlreadyAbsent => f.write_str("already absent"),
            Self::Deleted => f.write_str("deleted"),
            Self::Failed { error } => write!(f, "failed: {}", error),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Report of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReport {
    pub task_id: String,
    pub endpoint: String,
    pub path: String,
    pub outcome: PruneOutcome,
    pub executed_at: DateTime<Utc>,
}

impl PruneReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EndpointKind;

    #[test]
    fn test_policy_lookup_by_category() {
        let policies = RetentionPolicies::new(vec![
            RetentionPolicy {
                endpoint: "data832".to_string(),
                applies_to: DataCategory::Raw,
                delete_after_days: 180,
            },
            RetentionPolicy {
                endpoint: "data832".to_string(),
                applies_to: DataCategory::Derived,
                delete_after_days: 30,
            },
        ]);

        assert_eq!(
            policies.lookup("data832", DataCategory::Derived).map(|p| p.delete_after_days),
            Some(30)
        );
        assert!(policies.lookup("spot832", DataCategory::Raw).is_none());
    }

    #[test]
    fn test_category_rules() {
        let rules = CategoryRules::default();
        let raw = RelativePath::parse("user/scan_001.h5").unwrap();
        let tiff = RelativePath::parse("user/recscan_001/").unwrap();
        let zarr = RelativePath::parse("user/recscan_001.zarr/").unwrap();

        assert_eq!(rules.classify(&raw), DataCategory::Raw);
        assert_eq!(rules.classify(&tiff), DataCategory::Derived);
        assert_eq!(rules.classify(&zarr), DataCategory::Derived);
    }

    #[test]
    fn test_task_id_is_deterministic() {
        let path = RelativePath::parse("user/scan.h5").unwrap();
        let other = RelativePath::parse("user/scan2.h5").unwrap();

        assert_eq!(prune_task_id("spot832", &path), prune_task_id("spot832", &path));
        assert_ne!(prune_task_id("spot832", &path), prune_task_id("data832", &path));
        assert_ne!(prune_task_id("spot832", &path), prune_task_id("spot832", &other));
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        let task = PruneTask::new(
            Endpoint::new("spot832", "/raw", EndpointKind::Filesystem),
            RelativePath::parse("scan.h5").unwrap(),
            2,
            None,
            now,
        );

        assert!(!task.is_eligible(now + Duration::days(1)));
        assert!(task.is_eligible(now + Duration::days(2)));
    }

    #[test]
    fn test_zero_days_is_immediately_eligible() {
        let now = Utc::now();
        let task = PruneTask::new(
            Endpoint::new("scratch", "/scratch", EndpointKind::RemoteFilesystem),
            RelativePath::parse("rec/").unwrap(),
            0,
            None,
            now,
        );
        assert!(task.is_eligible(now));
    }
}
