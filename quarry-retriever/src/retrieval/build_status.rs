//! Engine lifecycle state and build progress reporting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Lifecycle state of a [`RetrievalEngine`](super::engine::RetrievalEngine).
///
/// `Unbuilt → Building → Ready`, `Ready → Building` on rebuild, and any state
/// to `Failed` on an unrecoverable load or build error. `Failed` is left by a
/// successful `build_index`, or by an incremental write that persists a new
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Unbuilt,
    Building,
    Ready,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unbuilt => "unbuilt",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Step of the build pipeline currently executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Idle,
    LoadingPersisted,
    LoadingDocuments,
    Chunking,
    Embedding,
    Indexing,
    Persisting,
    Completed,
    Cancelled,
    Failed,
}

impl BuildPhase {
    pub fn is_running(&self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Completed | Self::Cancelled | Self::Failed
        )
    }
}

/// Progress of the current (or most recent) build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub phase: BuildPhase,
    /// Fraction of the pipeline completed, 0.0 to 1.0
    pub progress: f32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub documents: usize,
    pub chunks_total: usize,
    pub chunks_embedded: usize,
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self {
            phase: BuildPhase::Idle,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            error: None,
            documents: 0,
            chunks_total: 0,
            chunks_embedded: 0,
        }
    }
}

impl BuildStatus {
    pub fn started() -> Self {
        Self {
            phase: BuildPhase::LoadingPersisted,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_running()
    }

    /// Mark the build finished in `phase`
    pub fn finish(&mut self, phase: BuildPhase, error: Option<String>) {
        self.phase = phase;
        self.completed_at = Some(Utc::now());
        if phase == BuildPhase::Completed {
            self.progress = 1.0;
        }
        self.error = error;
    }

    /// Record embedding progress; embedding spans progress 0.1 to 0.9
    pub fn record_embedded(&mut self, embedded: usize) {
        self.chunks_embedded = embedded;
        if self.chunks_total > 0 {
            self.progress = 0.1 + 0.8 * (embedded as f32 / self.chunks_total as f32);
        }
    }
}

/// Outcome of a successful `build_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    /// A valid persisted index was loaded; nothing was recomputed
    Loaded,
    /// The full pipeline ran and a new generation was persisted
    Built,
}

/// Summary returned by `build_index`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    pub documents: usize,
    pub chunks: usize,
    pub generation: u64,
    pub elapsed_ms: u64,
}

/// Exclusive claim on the build slot, released on drop.
///
/// Once [`begin`](Self::begin) has published `Building`, dropping the guard
/// without [`settle`](Self::settle) restores the prior engine state and marks
/// the build cancelled. This covers a build future dropped mid-flight.
pub(crate) struct BuildGuard<'a> {
    flag: &'a AtomicBool,
    restore: Option<Restore<'a>>,
}

struct Restore<'a> {
    status: &'a watch::Sender<BuildStatus>,
    state: &'a watch::Sender<EngineState>,
    previous: EngineState,
}

impl<'a> BuildGuard<'a> {
    /// Claim the slot, or `None` when a build is already running.
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, restore: None })
    }

    /// Publish a fresh build and return the state it replaced.
    pub(crate) fn begin(
        &mut self,
        status: &'a watch::Sender<BuildStatus>,
        state: &'a watch::Sender<EngineState>,
    ) -> EngineState {
        let previous = *state.borrow();
        status.send_replace(BuildStatus::started());
        state.send_replace(EngineState::Building);
        self.restore = Some(Restore { status, state, previous });
        previous
    }

    /// The caller has published the build's final state itself.
    pub(crate) fn settle(&mut self) {
        self.restore = None;
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore.state.send_replace(restore.previous);
            restore.status.send_modify(|s| {
                s.finish(BuildPhase::Cancelled, Some("build abandoned before completion".to_string()))
            });
            tracing::warn!("Index build dropped before completion; restored state {}", restore.previous);
        }
        self.flag.store(false, Ordering::Release);
    }
}
