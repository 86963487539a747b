//! Progress and terminal events emitted by the changeset controller.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use assetcat_shared::{ChangesetId, ChangesetStats, ChangesetStatus};

/// Pipeline position reported in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "index", rename_all = "snake_case")]
pub enum StageMarker {
    /// Source facts for a discovered asset.
    Ingest,
    /// A processing stage, zero-based.
    Processing(usize),
    /// Marking unseen assets as lost.
    LostMarking,
}

impl std::fmt::Display for StageMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingest => f.write_str("ingest"),
            Self::Processing(i) => write!(f, "stage {i}"),
            Self::LostMarking => f.write_str("lost-marking"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub changeset_id: ChangesetId,
    pub assets_seen: u64,
    pub assets_updated: u64,
    pub current_stage: StageMarker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub changeset_id: ChangesetId,
    pub status: ChangesetStatus,
    pub stats: ChangesetStats,
}

/// Observability sink for changeset runs.
pub trait EventSink: Send + Sync {
    /// Called at stage boundaries.
    fn progress(&self, event: &ProgressEvent);
    /// Called once when a changeset reaches a terminal status.
    fn finished(&self, event: &TerminalEvent);
}

/// No-op sink for headless/test usage.
pub struct SilentEvents;

impl EventSink for SilentEvents {
    fn progress(&self, _event: &ProgressEvent) {}
    fn finished(&self, _event: &TerminalEvent) {}
}

/// Sink that forwards events to `tracing`.
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn progress(&self, event: &ProgressEvent) {
        debug!(
            changeset_id = %event.changeset_id,
            assets_seen = event.assets_seen,
            assets_updated = event.assets_updated,
            stage = %event.current_stage,
            "changeset progress"
        );
    }

    fn finished(&self, event: &TerminalEvent) {
        let stats = &event.stats;
        match event.status {
            ChangesetStatus::Completed => info!(
                changeset_id = %event.changeset_id,
                seen = stats.assets_seen,
                added = stats.assets_added,
                updated = stats.assets_updated,
                lost = stats.assets_lost,
                unit_errors = stats.unit_errors.len(),
                "changeset completed"
            ),
            status => warn!(
                changeset_id = %event.changeset_id,
                status = status.as_str(),
                seen = stats.assets_seen,
                scan_errors = stats.scan_errors.len(),
                unit_errors = stats.unit_errors.len(),
                "changeset finished early"
            ),
        }
    }
}
