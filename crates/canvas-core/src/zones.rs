use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addressing::{CellCoord, GridSize};
use crate::error::{record_degraded, CanvasError, Effect};
use crate::keys::KeyLayout;
use crate::store::{DocumentStore, StoreError, StoreResult, TimeSeriesStore};

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Longest heatmap window accepted (one year).
pub const MAX_WINDOW_HOURS: u32 = 24 * 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeatmapEntry {
    /// Zone column.
    pub x: u32,
    /// Zone row.
    pub y: u32,
    pub intensity: u64,
}

#[derive(Debug, Clone)]
pub struct ZoneSettings {
    pub zone_size: u32,
    pub cache_ttl: Duration,
    pub retention: Duration,
}

/// Per-zone activity counts over time and the cached heatmaps derived from
/// them.
#[derive(Clone)]
pub struct ZoneActivity {
    series: Arc<dyn TimeSeriesStore>,
    documents: Arc<dyn DocumentStore>,
    grid: GridSize,
    settings: ZoneSettings,
    keys: KeyLayout,
}

impl ZoneActivity {
    pub fn new(
        series: Arc<dyn TimeSeriesStore>,
        documents: Arc<dyn DocumentStore>,
        grid: GridSize,
        settings: ZoneSettings,
        keys: KeyLayout,
    ) -> Self {
        Self {
            series,
            documents,
            grid,
            settings,
            keys,
        }
    }

    pub fn zone_of(&self, coord: CellCoord) -> (u32, u32) {
        (
            coord.x / self.settings.zone_size,
            coord.y / self.settings.zone_size,
        )
    }

    /// Zone columns and rows; partial edge tiles count as zones.
    pub fn zone_grid(&self) -> (u32, u32) {
        let z = self.settings.zone_size;
        (self.grid.width.div_ceil(z), self.grid.height.div_ceil(z))
    }

    /// Append one unit event at `timestamp_ms` to the zone covering `coord`,
    /// creating the series and retrying once if it does not exist yet.
    pub async fn record_activity(&self, coord: CellCoord, timestamp_ms: i64) -> StoreResult<()> {
        let (zx, zy) = self.zone_of(coord);
        let key = self.keys.zone(zx, zy);
        match self.series.append(&key, timestamp_ms, 1.0).await {
            Err(StoreError::MissingSeries(_)) => {
                debug!(zone = %key, "creating zone series");
                self.series.create(&key, self.settings.retention).await?;
                self.series.append(&key, timestamp_ms, 1.0).await
            }
            other => other,
        }
    }

    pub async fn get_heatmap(
        &self,
        window_hours: u32,
        bypass_cache: bool,
    ) -> Result<Vec<HeatmapEntry>, CanvasError> {
        if window_hours == 0 || window_hours > MAX_WINDOW_HOURS {
            return Err(CanvasError::invalid(format!(
                "window must be between 1 and {MAX_WINDOW_HOURS} hours"
            )));
        }
        let cache_key = self.keys.heatmap(window_hours);

        if !bypass_cache {
            if let Some(cached) = self.cached(&cache_key).await {
                return Ok(cached);
            }
        }

        let entries = self.aggregate(window_hours).await;

        match serde_json::to_string(&entries) {
            Ok(json) => {
                if let Err(err) = self
                    .documents
                    .set(&cache_key, json, Some(self.settings.cache_ttl))
                    .await
                {
                    record_degraded(Effect::HeatmapCache, &err);
                }
            }
            Err(err) => record_degraded(Effect::HeatmapCache, &err),
        }
        Ok(entries)
    }

    async fn cached(&self, cache_key: &str) -> Option<Vec<HeatmapEntry>> {
        match self.documents.get(cache_key).await {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(err) => {
                record_degraded(Effect::HeatmapCache, &err);
                None
            }
        }
    }

    /// Query every zone concurrently. A zone whose query fails counts as idle.
    async fn aggregate(&self, window_hours: u32) -> Vec<HeatmapEntry> {
        let from_ms = chrono::Utc::now().timestamp_millis() - window_hours as i64 * HOUR_MS;
        let (columns, rows) = self.zone_grid();
        let queries = (0..rows).flat_map(|zy| (0..columns).map(move |zx| (zx, zy))).map(
            |(zx, zy)| async move {
                let key = self.keys.zone(zx, zy);
                let intensity = match self.series.range_sum(&key, from_ms).await {
                    Ok(sum) => sum.max(0.0).round() as u64,
                    Err(StoreError::MissingSeries(_)) => 0,
                    Err(err) => {
                        debug!(zone = %key, error = %err, "zone query failed; reporting zero");
                        0
                    }
                };
                HeatmapEntry {
                    x: zx,
                    y: zy,
                    intensity,
                }
            },
        );
        join_all(queries).await
    }
}
