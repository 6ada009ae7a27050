use crate::retrieval::{BuildStatus, EngineState};
use crate::storage::ArtifactReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    /// Degraded but serving correct results
    Warning,
    /// Results may be wrong or missing until the index is rebuilt
    Critical,
}

/// One failed check and what to do about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    /// Short machine-readable name of the check
    pub check: String,
    pub severity: IssueSeverity,
    pub message: String,
    pub recommendation: String,
}

impl HealthIssue {
    pub fn critical(check: &str, message: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity: IssueSeverity::Critical,
            message: message.into(),
            recommendation: recommendation.into(),
        }
    }

    pub fn warning(check: &str, message: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity: IssueSeverity::Warning,
            message: message.into(),
            recommendation: recommendation.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuesSummary {
    /// Total issues found
    pub total_issues: usize,
    /// Critical issues requiring immediate attention
    pub critical_issues: usize,
    /// Warning issues that should be addressed
    pub warning_issues: usize,
}

/// Index health check information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHealth {
    /// True when no check reported an issue
    pub healthy: bool,
    pub overall_status: HealthStatus,
    pub state: EngineState,
    pub issues: Vec<HealthIssue>,
    /// Distinct recommendations, most severe issues first
    pub recommendations: Vec<String>,
    pub summary: IssuesSummary,
    /// What was found on disk for each artifact
    pub artifacts: Vec<ArtifactReport>,
    pub embedding_backend_reachable: bool,
    pub checked_at: DateTime<Utc>,
}

/// Comprehensive index statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub state: EngineState,
    /// Documents with at least one live chunk
    pub total_documents: usize,
    /// Physical rows, including tombstoned ones
    pub total_chunks: usize,
    pub live_chunks: usize,
    pub tombstoned_chunks: usize,
    /// Vector dimension of the loaded index, or of the provider when none is loaded
    pub dimension: usize,
    pub model_name: String,
    pub provider_name: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub index_type: Option<String>,
    pub generation: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    /// Live chunks per source dataset
    pub chunks_by_dataset: BTreeMap<String, usize>,
    pub last_build: BuildStatus,
    /// Approximate in-memory footprint of the loaded index
    pub memory_bytes: usize,
    /// Combined size of the persisted artifacts
    pub disk_bytes: Option<u64>,
    pub index_dir: PathBuf,
}
