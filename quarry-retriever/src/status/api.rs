use super::types::*;
use crate::error::Result;
use crate::retrieval::{EngineState, RetrievalEngine};
use crate::storage::{ArtifactKind, ArtifactReport, IndexSnapshot};
use chrono::Utc;
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const REBUILD: &str = "Rebuild the index (build_index with force_rebuild) to resync metadata with vectors";
const UNSPECIFIED_DATASET: &str = "unspecified";

/// Main status API implementation
pub struct StatusApi;

impl StatusApi {
    /// Get index health check information
    pub async fn get_index_health(engine: &RetrievalEngine) -> Result<IndexHealth> {
        let state = engine.state();
        let snapshot = engine.snapshot().await;
        let artifacts = engine.store().inspect().await;
        let provider = engine.provider();

        let mut issues = Vec::new();
        if let Some(snapshot) = &snapshot {
            issues.extend(check_snapshot(snapshot, provider.embedding_dimension()));
        }
        issues.extend(check_artifacts(&artifacts, snapshot.as_deref()));

        match state {
            EngineState::Failed => {
                let reason = engine
                    .build_status()
                    .error
                    .unwrap_or_else(|| "unknown error".to_string());
                issues.push(HealthIssue::critical(
                    "engine_state",
                    format!("Last build failed: {reason}"),
                    "Fix the reported error, then run build_index again",
                ));
            }
            EngineState::Unbuilt if snapshot.is_none() && artifacts.iter().all(|a| !a.present) => {
                issues.push(HealthIssue::warning(
                    "index_missing",
                    "No index has been built yet; queries return no results",
                    "Run build_index to create the index",
                ));
            }
            _ => {}
        }

        let answer = tokio::time::timeout(engine.config().embed_timeout(), provider.health_check()).await;
        let embedding_backend_reachable = match answer {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                issues.push(backend_issue(&e.to_string()));
                false
            }
            Err(_) => {
                issues.push(backend_issue(&format!(
                    "no answer within {:?}",
                    engine.config().embed_timeout()
                )));
                false
            }
        };

        let health = assemble(issues, state, artifacts, embedding_backend_reachable);
        if health.healthy {
            debug!("Index health: healthy");
        } else {
            warn!(
                "Index health {:?}: {} issues",
                health.overall_status, health.summary.total_issues
            );
        }
        Ok(health)
    }

    /// Get comprehensive index statistics
    pub async fn get_index_statistics(engine: &RetrievalEngine) -> Result<IndexStatistics> {
        let snapshot = engine.snapshot().await;
        let artifacts = engine.store().inspect().await;
        let provider = engine.provider();

        let disk_bytes = artifacts
            .iter()
            .filter_map(|a| a.size_bytes)
            .fold(None, |total: Option<u64>, size| Some(total.unwrap_or(0) + size));

        let mut statistics = IndexStatistics {
            state: engine.state(),
            total_documents: 0,
            total_chunks: 0,
            live_chunks: 0,
            tombstoned_chunks: 0,
            dimension: provider.embedding_dimension(),
            model_name: provider.model_name().to_string(),
            provider_name: provider.provider_name().to_string(),
            chunk_size: engine.config().chunk_size,
            chunk_overlap: engine.config().chunk_overlap,
            index_type: None,
            generation: None,
            created_at: None,
            chunks_by_dataset: BTreeMap::new(),
            last_build: engine.build_status(),
            memory_bytes: 0,
            disk_bytes,
            index_dir: engine.store().location().to_path_buf(),
        };

        if let Some(snapshot) = snapshot {
            let config = &snapshot.config;
            statistics.total_documents = snapshot.live_document_count();
            statistics.total_chunks = snapshot.index.len();
            statistics.live_chunks = snapshot.index.live_len();
            statistics.tombstoned_chunks = snapshot.index.tombstone_count();
            statistics.dimension = config.dimension;
            statistics.model_name = config.model_name.clone();
            statistics.chunk_size = config.chunk_size;
            statistics.chunk_overlap = config.chunk_overlap;
            statistics.index_type = Some(config.index_type.clone());
            statistics.generation = Some(config.generation);
            statistics.created_at = Some(config.created_at);
            statistics.chunks_by_dataset = chunks_by_dataset(&snapshot);
            statistics.memory_bytes = snapshot.memory_bytes();
        }

        Ok(statistics)
    }
}

fn backend_issue(reason: &str) -> HealthIssue {
    HealthIssue::warning(
        "embedding_backend",
        format!("Embedding backend is unreachable: {reason}"),
        "Check the embedding service; queries use lexical matching and writes fail until it recovers",
    )
}

fn chunks_by_dataset(snapshot: &IndexSnapshot) -> BTreeMap<String, usize> {
    snapshot
        .metadata
        .iter()
        .enumerate()
        .filter(|(position, _)| snapshot.index.is_live(*position))
        .map(|(_, meta)| {
            meta.source_dataset
                .clone()
                .unwrap_or_else(|| UNSPECIFIED_DATASET.to_string())
        })
        .counts()
        .into_iter()
        .collect()
}

/// Checks on the loaded generation.
pub fn check_snapshot(snapshot: &IndexSnapshot, provider_dimension: usize) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    if let Err(e) = snapshot.check_invariant() {
        issues.push(HealthIssue::critical("invariant", e.to_string(), REBUILD));
    }

    if snapshot.config.dimension != provider_dimension {
        issues.push(HealthIssue::critical(
            "dimension",
            format!(
                "Index dimension {} differs from embedding provider dimension {}",
                snapshot.config.dimension, provider_dimension
            ),
            "Use the embedding model the index was built with, or force a rebuild with the new one",
        ));
    }

    if snapshot.config.num_chunks != snapshot.index.live_len() {
        issues.push(HealthIssue::warning(
            "config_counts",
            format!(
                "Config records {} chunks, index holds {} live chunks",
                snapshot.config.num_chunks,
                snapshot.index.live_len()
            ),
            REBUILD,
        ));
    }

    let rows = snapshot.index.len();
    if rows > 0 && snapshot.index.tombstone_count() * 2 > rows {
        issues.push(HealthIssue::warning(
            "tombstones",
            format!(
                "{} of {} rows are deleted",
                snapshot.index.tombstone_count(),
                rows
            ),
            "Force a rebuild to compact deleted chunks",
        ));
    }

    issues
}

/// Checks on the persisted artifacts, against the loaded generation when there is one.
pub fn check_artifacts(reports: &[ArtifactReport], loaded: Option<&IndexSnapshot>) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    let missing: Vec<&ArtifactReport> = reports.iter().filter(|r| !r.present).collect();

    if missing.len() == reports.len() {
        if loaded.is_some() {
            issues.push(HealthIssue::critical(
                "artifacts_missing",
                "The loaded index has no persisted artifacts",
                REBUILD,
            ));
        }
        return issues;
    }

    if !missing.is_empty() {
        issues.push(HealthIssue::critical(
            "partial_artifacts",
            format!(
                "Missing artifacts: {}",
                missing.iter().map(|r| r.kind.file_name()).join(", ")
            ),
            REBUILD,
        ));
    }

    for report in reports.iter().filter(|r| r.error.is_some()) {
        issues.push(HealthIssue::critical(
            "corrupt_artifact",
            format!(
                "{} cannot be read: {}",
                report.kind,
                report.error.as_deref().unwrap_or_default()
            ),
            REBUILD,
        ));
    }

    let generations: Vec<u64> = reports.iter().filter_map(|r| r.generation).unique().collect();
    if generations.len() > 1 {
        issues.push(HealthIssue::critical(
            "generation_mismatch",
            format!(
                "Artifacts belong to different generations ({}); a write was interrupted",
                generations.iter().join(", ")
            ),
            REBUILD,
        ));
    }

    let count = |kind: ArtifactKind| {
        reports
            .iter()
            .find(|r| r.kind == kind)
            .and_then(|r| r.record_count)
    };
    if let (Some(vectors), Some(chunks), Some(metadata)) = (
        count(ArtifactKind::Index),
        count(ArtifactKind::Chunks),
        count(ArtifactKind::Metadata),
    ) {
        if vectors != chunks || chunks != metadata {
            issues.push(HealthIssue::critical(
                "length_mismatch",
                format!(
                    "Persisted lengths disagree: {vectors} vectors, {chunks} chunks, {metadata} metadata records"
                ),
                REBUILD,
            ));
        }
    }

    if let Some(snapshot) = loaded {
        let on_disk = reports
            .iter()
            .find(|r| r.kind == ArtifactKind::Config)
            .and_then(|r| r.generation);
        if let Some(on_disk) = on_disk {
            if on_disk != snapshot.config.generation {
                issues.push(HealthIssue::warning(
                    "stale_snapshot",
                    format!(
                        "Disk holds generation {on_disk}, memory holds {}",
                        snapshot.config.generation
                    ),
                    "Run build_index to load the persisted generation",
                ));
            }
        }
    }

    issues
}

fn assemble(
    mut issues: Vec<HealthIssue>,
    state: EngineState,
    artifacts: Vec<ArtifactReport>,
    embedding_backend_reachable: bool,
) -> IndexHealth {
    // Critical first.
    issues.sort_by_key(|issue| issue.severity != IssueSeverity::Critical);

    let critical_issues = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Critical)
        .count();
    let warning_issues = issues.len() - critical_issues;
    let overall_status = if critical_issues > 0 {
        HealthStatus::Critical
    } else if warning_issues > 0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    let recommendations = issues
        .iter()
        .map(|i| i.recommendation.clone())
        .unique()
        .collect();

    IndexHealth {
        healthy: issues.is_empty(),
        overall_status,
        state,
        summary: IssuesSummary {
            total_issues: issues.len(),
            critical_issues,
            warning_issues,
        },
        issues,
        recommendations,
        artifacts,
        embedding_backend_reachable,
        checked_at: Utc::now(),
    }
}
