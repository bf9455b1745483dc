use std::sync::Arc;
use std::time::{Duration, Instant};

use canvas_bus::{Bus, BusEvent};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::addressing::{CellCoord, Color, GridSize, COLOR_COUNT};
use crate::error::{record_degraded, CanvasError, Effect};
use crate::events::{PixelUpdate, PlacementObserver, PlacementRecord};
use crate::keys::KeyLayout;
use crate::memory::MemoryStore;
use crate::pixels::PixelStore;
use crate::placed::PlacedIndex;
use crate::snapshot::{RebuildQueue, RebuildReason, Snapshot, SnapshotMaterializer};
use crate::store::{ActivityLog, DocumentStore, PackedFieldStore, SetStore, TimeSeriesStore};
use crate::tracker::InFlight;
use crate::zones::{HeatmapEntry, ZoneActivity, ZoneSettings};

/// Most placement records returned by a single history read.
pub const MAX_HISTORY: usize = 1000;

const MAX_ACTOR_LEN: usize = 128;

/// Deployment constants. Fixed for the lifetime of a canvas.
#[derive(Debug, Clone)]
pub struct CanvasConfig {
    pub grid: GridSize,
    pub zone_size: u32,
    pub heatmap_ttl: Duration,
    pub zone_retention: Duration,
    pub keys: KeyLayout,
    /// How long a read of the shared inconsistency marker is trusted before
    /// the store is asked again.
    pub consistency_recheck: Duration,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            grid: GridSize::new(1000, 1000),
            zone_size: 50,
            heatmap_ttl: Duration::from_secs(5 * 60),
            zone_retention: Duration::from_secs(7 * 24 * 60 * 60),
            keys: KeyLayout::default(),
            consistency_recheck: Duration::from_secs(1),
        }
    }
}

impl CanvasConfig {
    pub fn validate(&self) -> Result<(), CanvasError> {
        if self.grid.width == 0 || self.grid.height == 0 {
            return Err(CanvasError::invalid("canvas dimensions must be positive"));
        }
        if self.zone_size == 0 {
            return Err(CanvasError::invalid("zone size must be positive"));
        }
        Ok(())
    }
}

/// Storage and transport the canvas runs on.
#[derive(Clone)]
pub struct Backends {
    pub fields: Arc<dyn PackedFieldStore>,
    pub sets: Arc<dyn SetStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub series: Arc<dyn TimeSeriesStore>,
    pub log: Arc<dyn ActivityLog>,
    pub bus: Arc<dyn Bus>,
}

impl Backends {
    /// Every store capability served by one in-memory store.
    pub fn in_memory(store: Arc<MemoryStore>, bus: Arc<dyn Bus>) -> Self {
        Self {
            fields: store.clone(),
            sets: store.clone(),
            documents: store.clone(),
            series: store.clone(),
            log: store,
            bus,
        }
    }
}

/// The canvas engine: validated writes, cell reads, snapshots, heatmaps and
/// change notifications. Cheap to clone.
#[derive(Clone)]
pub struct Canvas {
    inner: Arc<Inner>,
}

struct Inner {
    config: CanvasConfig,
    pixels: PixelStore,
    placed: PlacedIndex,
    snapshots: SnapshotMaterializer,
    rebuilds: RebuildQueue,
    rebuild_worker: JoinHandle<()>,
    zones: ZoneActivity,
    bus: Arc<dyn Bus>,
    log: Arc<dyn ActivityLog>,
    documents: Arc<dyn DocumentStore>,
    observers: RwLock<Vec<Arc<dyn PlacementObserver>>>,
    followups: InFlight,
    consistency: Mutex<Consistency>,
}

/// Parts a failed clear left behind. `shared` is the last read of the
/// marker any instance may have written; `unshared` holds a failure this
/// instance could not record in the marker.
#[derive(Default)]
struct Consistency {
    unshared: Option<Vec<String>>,
    shared: Option<Vec<String>>,
    checked_at: Option<Instant>,
}

impl Consistency {
    fn failed(&self) -> Option<Vec<String>> {
        self.unshared.clone().or_else(|| self.shared.clone())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rebuild_worker.abort();
    }
}

impl Canvas {
    /// Must be called within a Tokio runtime; the snapshot rebuild worker is
    /// spawned immediately.
    pub fn new(config: CanvasConfig, backends: Backends) -> Result<Self, CanvasError> {
        config.validate()?;
        let keys = config.keys.clone();
        let pixels = PixelStore::new(backends.fields, config.grid, keys.pixels());
        let placed = PlacedIndex::new(backends.sets, keys.placed());
        let snapshots = SnapshotMaterializer::new(
            pixels.clone(),
            placed.clone(),
            backends.documents.clone(),
            keys.snapshot(),
        );
        let (rebuilds, rebuild_worker) = RebuildQueue::spawn(snapshots.clone());
        let zones = ZoneActivity::new(
            backends.series,
            backends.documents.clone(),
            config.grid,
            ZoneSettings {
                zone_size: config.zone_size,
                cache_ttl: config.heatmap_ttl,
                retention: config.zone_retention,
            },
            keys,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pixels,
                placed,
                snapshots,
                rebuilds,
                rebuild_worker,
                zones,
                bus: backends.bus,
                log: backends.log,
                documents: backends.documents,
                observers: RwLock::new(Vec::new()),
                followups: InFlight::default(),
                consistency: Mutex::new(Consistency::default()),
            }),
        })
    }

    pub fn config(&self) -> &CanvasConfig {
        &self.inner.config
    }

    pub fn grid(&self) -> GridSize {
        self.inner.config.grid
    }

    pub fn updates_topic(&self) -> String {
        self.inner.config.keys.updates_topic()
    }

    pub fn add_observer(&self, observer: Arc<dyn PlacementObserver>) {
        self.inner.observers.write().push(observer);
    }

    pub fn rebuild_queue(&self) -> &RebuildQueue {
        &self.inner.rebuilds
    }

    pub fn zones(&self) -> &ZoneActivity {
        &self.inner.zones
    }

    async fn ensure_consistent(&self) -> Result<(), CanvasError> {
        match self.inconsistent_parts().await {
            Some(failed) => Err(CanvasError::Inconsistent { failed }),
            None => Ok(()),
        }
    }

    /// False while any instance sharing this store has an unrepaired partial
    /// clear.
    pub async fn is_consistent(&self) -> bool {
        self.inconsistent_parts().await.is_none()
    }

    async fn inconsistent_parts(&self) -> Option<Vec<String>> {
        let inner = &self.inner;
        {
            let state = inner.consistency.lock();
            let fresh = state
                .checked_at
                .is_some_and(|at| at.elapsed() < inner.config.consistency_recheck);
            if fresh || state.unshared.is_some() {
                return state.failed();
            }
        }
        let marker = inner.config.keys.inconsistent();
        match inner.documents.get(&marker).await {
            Ok(raw) => {
                let mut state = inner.consistency.lock();
                state.shared = raw.map(|raw| parse_marker(&raw));
                state.checked_at = Some(Instant::now());
                state.failed()
            }
            Err(err) => {
                record_degraded(Effect::ConsistencyMarker, &err);
                inner.consistency.lock().failed()
            }
        }
    }

    /// Refuse reads and writes here, and on every instance that sees the
    /// marker, until a successful [`Canvas::initialize`].
    async fn mark_inconsistent(&self, failed: &[String]) {
        let inner = &self.inner;
        {
            let mut state = inner.consistency.lock();
            state.shared = Some(failed.to_vec());
            state.checked_at = Some(Instant::now());
        }
        let marker = inner.config.keys.inconsistent();
        let shared = match serde_json::to_string(failed) {
            Ok(encoded) => inner.documents.set(&marker, encoded, None).await.map_err(|err| {
                error!(error = %err, "failed to share inconsistency marker");
                record_degraded(Effect::ConsistencyMarker, &err);
            }),
            Err(err) => {
                record_degraded(Effect::ConsistencyMarker, &err);
                Err(())
            }
        };
        if shared.is_err() {
            inner.consistency.lock().unshared = Some(failed.to_vec());
        }
    }

    /// Attempt all three deletions and name the ones that failed.
    async fn delete_all(&self) -> Vec<String> {
        let inner = &self.inner;
        let (grid, index, snapshot) = tokio::join!(
            inner.pixels.delete(),
            inner.placed.delete(),
            inner.snapshots.delete()
        );
        let mut failed = Vec::new();
        for (part, result) in [("grid", grid), ("index", index), ("snapshot", snapshot)] {
            if let Err(err) = result {
                error!(part, error = %err, "canvas delete failed");
                failed.push(part.to_string());
            }
        }
        failed
    }

    fn validate(&self, x: i64, y: i64, color: i64, actor: &str) -> Result<(CellCoord, Color), CanvasError> {
        let grid = self.grid();
        let coord = grid.coord(x, y).ok_or_else(|| {
            CanvasError::invalid(format!(
                "cell ({x}, {y}) is outside the {}x{} canvas",
                grid.width, grid.height
            ))
        })?;
        let color = Color::new(color).ok_or_else(|| {
            CanvasError::invalid(format!("color {color} is outside [0, {})", COLOR_COUNT))
        })?;
        if actor.is_empty() || actor.len() > MAX_ACTOR_LEN {
            return Err(CanvasError::invalid(format!(
                "actor id must be 1..={MAX_ACTOR_LEN} bytes"
            )));
        }
        Ok((coord, color))
    }

    /// Validate, apply, then run the write's side effects. Only validation
    /// and the grid write can fail the call.
    pub async fn place_cell(
        &self,
        x: i64,
        y: i64,
        color: i64,
        actor: &str,
    ) -> Result<PixelUpdate, CanvasError> {
        self.ensure_consistent().await?;
        let (coord, color) = self.validate(x, y, color, actor)?;
        let inner = &self.inner;

        if let Err(err) = inner.pixels.write(coord, color).await {
            error!(x = coord.x, y = coord.y, error = %err, "pixel write failed");
            return Err(CanvasError::StoreUnavailable(err));
        }
        let timestamp = chrono::Utc::now().timestamp_millis();

        if let Err(err) = inner.placed.mark_placed(coord).await {
            record_degraded(Effect::Index, &err);
        }
        if let Err(err) = inner.zones.record_activity(coord, timestamp).await {
            record_degraded(Effect::ZoneActivity, &err);
        }
        inner.rebuilds.schedule(RebuildReason::Placement);

        let update = PixelUpdate {
            x: coord.x,
            y: coord.y,
            color: color.value(),
            actor: actor.to_string(),
            timestamp,
        };
        self.publish(&update).await;
        self.spawn_followups(update.clone());

        metrics::counter!("canvas_pixels_placed_total", 1);
        debug!(x = coord.x, y = coord.y, color = color.value(), %actor, "pixel placed");
        Ok(update)
    }

    async fn publish(&self, update: &PixelUpdate) {
        let payload = match update.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                record_degraded(Effect::Publish, &err);
                return;
            }
        };
        if let Err(err) = self.inner.bus.publish(&self.updates_topic(), payload).await {
            record_degraded(Effect::Publish, &err);
        }
    }

    /// Placement log append and observer notification, detached from the
    /// caller.
    fn spawn_followups(&self, update: PixelUpdate) {
        let inner = Arc::clone(&self.inner);
        inner.followups.begin();
        tokio::spawn(async move {
            match serde_json::to_string(&update) {
                Ok(payload) => {
                    let log_key = inner.config.keys.placements();
                    if let Err(err) = inner.log.append(&log_key, payload).await {
                        record_degraded(Effect::PlacementLog, &err);
                    }
                }
                Err(err) => record_degraded(Effect::PlacementLog, &err),
            }

            let observers: Vec<_> = inner.observers.read().clone();
            for observer in observers {
                if let Err(err) = observer.on_placement(&update).await {
                    debug!(observer = observer.name(), "placement observer failed");
                    record_degraded(Effect::Observer, &*err);
                }
            }
            inner.followups.finish();
        });
    }

    /// Current color of a cell; coordinates outside the canvas read as 0.
    pub async fn get_cell(&self, x: i64, y: i64) -> Result<u8, CanvasError> {
        self.ensure_consistent().await?;
        self.inner
            .pixels
            .get_color(x, y)
            .await
            .map_err(CanvasError::StoreUnavailable)
    }

    pub async fn get_snapshot(&self) -> Result<Snapshot, CanvasError> {
        self.ensure_consistent().await?;
        self.inner.snapshots.get_snapshot().await
    }

    pub async fn get_heatmap(
        &self,
        window_hours: u32,
        bypass_cache: bool,
    ) -> Result<Vec<HeatmapEntry>, CanvasError> {
        self.inner.zones.get_heatmap(window_hours, bypass_cache).await
    }

    /// Most recent placements, newest first.
    pub async fn recent_placements(&self, limit: usize) -> Result<Vec<PlacementRecord>, CanvasError> {
        let limit = limit.min(MAX_HISTORY);
        let entries = self
            .inner
            .log
            .recent(&self.inner.config.keys.placements(), limit)
            .await
            .map_err(|err| CanvasError::degraded(Effect::PlacementLog, err))?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_str::<PixelUpdate>(&entry.payload) {
                Ok(update) => Some(PlacementRecord {
                    id: entry.id,
                    update,
                }),
                Err(err) => {
                    warn!(id = %entry.id, error = %err, "skipping unreadable placement record");
                    None
                }
            })
            .collect())
    }

    pub async fn placed_count(&self) -> Result<u64, CanvasError> {
        self.inner
            .placed
            .len()
            .await
            .map_err(|err| CanvasError::degraded(Effect::Index, err))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.bus.subscribe(&self.updates_topic())
    }

    /// Allocate the grid and seed an empty snapshot if needed. A canvas left
    /// inconsistent by a partial clear, here or on another instance, has all
    /// three deletions retried first; if any still fails it stays
    /// inconsistent.
    pub async fn initialize(&self) -> Result<(), CanvasError> {
        let inner = &self.inner;
        let marker = inner.config.keys.inconsistent();
        let shared = inner
            .documents
            .get(&marker)
            .await
            .map_err(|err| CanvasError::degraded(Effect::ConsistencyMarker, err))?;
        let recovering = shared.is_some() || inner.consistency.lock().failed().is_some();

        if recovering {
            let failed = self.delete_all().await;
            if !failed.is_empty() {
                self.mark_inconsistent(&failed).await;
                return Err(CanvasError::Inconsistent { failed });
            }
            info!("retried canvas clear after a partial failure");
        }

        let allocated = inner
            .pixels
            .initialize()
            .await
            .map_err(CanvasError::StoreUnavailable)?;
        inner
            .snapshots
            .initialize()
            .await
            .map_err(|err| CanvasError::degraded(Effect::SnapshotCache, err))?;

        if recovering {
            inner
                .documents
                .delete(&marker)
                .await
                .map_err(|err| CanvasError::degraded(Effect::ConsistencyMarker, err))?;
            *inner.consistency.lock() = Consistency {
                checked_at: Some(Instant::now()),
                ..Consistency::default()
            };
            info!("canvas re-initialized after inconsistent clear");
        }
        info!(allocated, "canvas initialized");
        Ok(())
    }

    /// Delete the grid, the placed index and the cached snapshot. All three
    /// deletions are attempted; if any fails the canvas refuses reads and
    /// writes on every instance until [`Canvas::initialize`] succeeds.
    pub async fn clear_canvas(&self) -> Result<(), CanvasError> {
        let failed = self.delete_all().await;
        if failed.is_empty() {
            info!("canvas cleared");
            return Ok(());
        }
        self.mark_inconsistent(&failed).await;
        Err(CanvasError::Inconsistent { failed })
    }

    /// Enqueue a rebuild every `period` so index/snapshot drift heals
    /// without waiting for a write.
    pub fn spawn_periodic_refresh(&self, period: Duration) -> JoinHandle<()> {
        let rebuilds = self.inner.rebuilds.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                rebuilds.schedule(RebuildReason::Periodic);
            }
        })
    }

    /// Wait for detached follow-ups and scheduled rebuilds to finish.
    pub async fn settle(&self) {
        self.inner.followups.wait_idle().await;
        self.inner.rebuilds.wait_idle().await;
    }
}

fn parse_marker(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|_| vec![raw.to_string()])
}
