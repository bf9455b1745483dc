use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CanvasError {
    /// Malformed or out-of-range request; nothing was mutated.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The packed grid could not be read or written. Safe to retry.
    #[error("canvas store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    /// A derived view (snapshot or heatmap) could not be produced.
    #[error("{effect} failed: {source}")]
    DegradedEffect {
        effect: Effect,
        #[source]
        source: StoreError,
    },
    /// A clear only partially succeeded; the canvas must be re-initialized.
    #[error("canvas is inconsistent after a partial clear ({failed:?} not deleted); re-initialize it")]
    Inconsistent { failed: Vec<String> },
}

impl CanvasError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CanvasError::InvalidInput(message.into())
    }

    pub(crate) fn degraded(effect: Effect, source: StoreError) -> Self {
        CanvasError::DegradedEffect { effect, source }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CanvasError::StoreUnavailable(_) | CanvasError::DegradedEffect { .. }
        )
    }
}

/// Side effects of a write that may fail without failing the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    Index,
    ZoneActivity,
    SnapshotRebuild,
    SnapshotCache,
    HeatmapCache,
    Publish,
    PlacementLog,
    Observer,
    ConsistencyMarker,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::Index => "index",
            Effect::ZoneActivity => "zone_activity",
            Effect::SnapshotRebuild => "snapshot_rebuild",
            Effect::SnapshotCache => "snapshot_cache",
            Effect::HeatmapCache => "heatmap_cache",
            Effect::Publish => "publish",
            Effect::PlacementLog => "placement_log",
            Effect::Observer => "observer",
            Effect::ConsistencyMarker => "consistency_marker",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log and count a swallowed effect failure.
pub(crate) fn record_degraded(effect: Effect, err: &dyn std::error::Error) {
    metrics::counter!("canvas_degraded_effects_total", 1, "effect" => effect.as_str());
    tracing::warn!(effect = %effect, error = %err, "degraded effect");
}
