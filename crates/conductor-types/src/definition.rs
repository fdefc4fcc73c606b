//! Workflow definitions and their immutable, numbered versions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsl::WorkflowDsl;

/// Maximum length of a definition code.
pub const MAX_CODE_LEN: usize = 128;

/// A named business process. Only its versions carry a step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    /// Unique human-readable process name (e.g. "OrderFulfillment").
    pub code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Lifecycle of a definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Published,
    Deprecated,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Published => "published",
            VersionStatus::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(VersionStatus::Draft),
            "published" => Ok(VersionStatus::Published),
            "deprecated" => Ok(VersionStatus::Deprecated),
            other => Err(format!("invalid version status: '{other}'")),
        }
    }
}

/// One numbered version of a definition. The DSL is frozen once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionVersion {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_code: String,
    /// Monotonic within the definition, starting at 1.
    pub version_number: u32,
    /// Format version of the DSL document.
    pub schema_version: u32,
    pub status: VersionStatus,
    pub dsl: WorkflowDsl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl WorkflowDefinitionVersion {
    /// Whether a run may be started on this version.
    pub fn is_startable(&self, allow_draft: bool) -> bool {
        match self.status {
            VersionStatus::Published => true,
            VersionStatus::Draft => allow_draft,
            VersionStatus::Deprecated => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_status_roundtrip() {
        for status in [
            VersionStatus::Draft,
            VersionStatus::Published,
            VersionStatus::Deprecated,
        ] {
            assert_eq!(status.as_str().parse::<VersionStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("retired".parse::<VersionStatus>().is_err());
    }

    #[test]
    fn test_startable_respects_debug_override() {
        let now = Utc::now();
        let mut version = WorkflowDefinitionVersion {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_code: "OrderFulfillment".to_string(),
            version_number: 1,
            schema_version: 1,
            status: VersionStatus::Draft,
            dsl: WorkflowDsl {
                schema_version: 1,
                start_at: "a".to_string(),
                steps: vec![],
                output_keys: vec![],
            },
            changelog: None,
            published_at: None,
            created_at: now,
            created_by: "test".to_string(),
            updated_at: now,
            updated_by: "test".to_string(),
        };
        assert!(!version.is_startable(false));
        assert!(version.is_startable(true));

        version.status = VersionStatus::Published;
        assert!(version.is_startable(false));

        version.status = VersionStatus::Deprecated;
        assert!(!version.is_startable(true));
    }
}
