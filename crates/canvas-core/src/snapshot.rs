use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::addressing::GridSize;
use crate::error::{record_degraded, CanvasError, Effect};
use crate::pixels::PixelStore;
use crate::placed::PlacedIndex;
use crate::store::{DocumentStore, StoreResult};
use crate::tracker::InFlight;

/// One painted cell, serialized as `[x, y, color]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotCell(pub u32, pub u32, pub u8);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cells: Vec<SnapshotCell>,
    /// Generation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub width: u32,
    pub height: u32,
}

impl Snapshot {
    pub fn empty(grid: GridSize) -> Self {
        Self {
            cells: Vec::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            width: grid.width,
            height: grid.height,
        }
    }
}

/// Builds the painted-cell list from the placed index and keeps the latest
/// completed build in a single cache slot.
///
/// Builds are not linearizable: a scan observes each cell at a different
/// instant, and a slow build may overwrite a newer cached one. Both are
/// tolerated because every write schedules another build.
#[derive(Clone)]
pub struct SnapshotMaterializer {
    pixels: PixelStore,
    placed: PlacedIndex,
    documents: Arc<dyn DocumentStore>,
    key: String,
}

impl SnapshotMaterializer {
    pub fn new(
        pixels: PixelStore,
        placed: PlacedIndex,
        documents: Arc<dyn DocumentStore>,
        key: String,
    ) -> Self {
        Self {
            pixels,
            placed,
            documents,
            key,
        }
    }

    /// Scan the index and read each cell; background cells are left out.
    pub async fn build(&self) -> Result<Snapshot, CanvasError> {
        let started = Instant::now();
        let grid = self.pixels.grid();
        let mut cells = Vec::new();
        let mut placed = self.placed.all_placed();
        while let Some(item) = placed.next().await {
            let coord = item.map_err(|err| CanvasError::degraded(Effect::SnapshotRebuild, err))?;
            if !grid.contains(coord) {
                continue;
            }
            let color = self
                .pixels
                .read(coord)
                .await
                .map_err(CanvasError::StoreUnavailable)?;
            if color != 0 {
                cells.push(SnapshotCell(coord.x, coord.y, color));
            }
        }
        metrics::histogram!(
            "canvas_snapshot_rebuild_seconds",
            started.elapsed().as_secs_f64()
        );
        Ok(Snapshot {
            cells,
            timestamp: chrono::Utc::now().timestamp_millis(),
            width: grid.width,
            height: grid.height,
        })
    }

    async fn store(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let json = serde_json::to_string(snapshot)?;
        self.documents.set(&self.key, json, None).await
    }

    /// Build and replace the cached snapshot.
    pub async fn rebuild(&self) -> Result<Snapshot, CanvasError> {
        let snapshot = self.build().await?;
        self.store(&snapshot)
            .await
            .map_err(|err| CanvasError::degraded(Effect::SnapshotCache, err))?;
        Ok(snapshot)
    }

    async fn cached(&self) -> Option<Snapshot> {
        match self.documents.get(&self.key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable cached snapshot");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                record_degraded(Effect::SnapshotCache, &err);
                None
            }
        }
    }

    /// Cached snapshot if present, otherwise a complete fresh build. A build
    /// that cannot be cached is still returned.
    pub async fn get_snapshot(&self) -> Result<Snapshot, CanvasError> {
        if let Some(snapshot) = self.cached().await {
            return Ok(snapshot);
        }
        let snapshot = self.build().await?;
        if let Err(err) = self.store(&snapshot).await {
            record_degraded(Effect::SnapshotCache, &err);
        }
        Ok(snapshot)
    }

    /// Seed an empty snapshot unless one is already cached.
    pub async fn initialize(&self) -> StoreResult<()> {
        if self.documents.get(&self.key).await?.is_some() {
            return Ok(());
        }
        self.store(&Snapshot::empty(self.pixels.grid())).await
    }

    pub(crate) async fn delete(&self) -> StoreResult<()> {
        self.documents.delete(&self.key).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    Placement,
    Periodic,
    Manual,
}

/// Fire-and-forget rebuild scheduling. Every request runs its own rebuild;
/// overlapping rebuilds are allowed and the last to finish owns the cache.
#[derive(Clone)]
pub struct RebuildQueue {
    tx: mpsc::UnboundedSender<RebuildReason>,
    in_flight: Arc<InFlight>,
}

impl RebuildQueue {
    /// Start the worker on the current Tokio runtime.
    pub fn spawn(materializer: SnapshotMaterializer) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RebuildReason>();
        let in_flight = Arc::new(InFlight::default());
        let worker_in_flight = Arc::clone(&in_flight);
        let worker = tokio::spawn(async move {
            while let Some(reason) = rx.recv().await {
                let materializer = materializer.clone();
                let in_flight = Arc::clone(&worker_in_flight);
                tokio::spawn(async move {
                    match materializer.rebuild().await {
                        Ok(snapshot) => {
                            debug!(?reason, cells = snapshot.cells.len(), "snapshot rebuilt")
                        }
                        Err(err) => record_degraded(Effect::SnapshotRebuild, &err),
                    }
                    in_flight.finish();
                });
            }
            debug!("snapshot rebuild worker stopped");
        });
        (Self { tx, in_flight }, worker)
    }

    /// Enqueue a rebuild without waiting for it.
    pub fn schedule(&self, reason: RebuildReason) {
        self.in_flight.begin();
        if self.tx.send(reason).is_err() {
            warn!(?reason, "snapshot rebuild worker is gone; dropping request");
            self.in_flight.finish();
        }
    }

    pub fn pending(&self) -> usize {
        self.in_flight.pending()
    }

    /// Resolve once every scheduled rebuild has completed.
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::CellCoord;
    use crate::memory::{Fault, MemoryStore};

    fn materializer(memory: &Arc<MemoryStore>, grid: GridSize) -> SnapshotMaterializer {
        let pixels = PixelStore::new(memory.clone(), grid, "t:pixels".into());
        let placed = PlacedIndex::new(memory.clone(), "t:placed".into());
        SnapshotMaterializer::new(pixels, placed, memory.clone(), "t:snapshot".into())
    }

    async fn paint(memory: &Arc<MemoryStore>, grid: GridSize, x: u32, y: u32, color: i64) {
        let pixels = PixelStore::new(memory.clone(), grid, "t:pixels".into());
        let placed = PlacedIndex::new(memory.clone(), "t:placed".into());
        pixels.set_color(x as i64, y as i64, color).await.unwrap();
        placed.mark_placed(CellCoord::new(x, y)).await.unwrap();
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn rebuild_lists_only_painted_cells() {
        let memory = MemoryStore::new();
        let grid = GridSize::new(4, 4);
        paint(&memory, grid, 1, 1, 5).await;
        paint(&memory, grid, 3, 3, 9).await;
        paint(&memory, grid, 2, 0, 4).await;
        paint(&memory, grid, 2, 0, 0).await;

        let snapshot = materializer(&memory, grid).rebuild().await.unwrap();
        let mut cells = snapshot.cells.clone();
        cells.sort();
        assert_eq!(cells, vec![SnapshotCell(1, 1, 5), SnapshotCell(3, 3, 9)]);
        assert_eq!((snapshot.width, snapshot.height), (4, 4));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn get_snapshot_serves_cache_until_rebuilt() {
        let memory = MemoryStore::new();
        let grid = GridSize::new(4, 4);
        let materializer = materializer(&memory, grid);
        paint(&memory, grid, 0, 1, 2).await;

        let first = materializer.get_snapshot().await.unwrap();
        assert_eq!(first.cells, vec![SnapshotCell(0, 1, 2)]);

        paint(&memory, grid, 1, 0, 3).await;
        assert_eq!(materializer.get_snapshot().await.unwrap(), first);

        let rebuilt = materializer.rebuild().await.unwrap();
        assert_eq!(rebuilt.cells.len(), 2);
        assert_eq!(materializer.get_snapshot().await.unwrap(), rebuilt);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn serialized_cells_are_triples() {
        let snapshot = Snapshot {
            cells: vec![SnapshotCell(1, 2, 3)],
            timestamp: 42,
            width: 4,
            height: 4,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["cells"], serde_json::json!([[1, 2, 3]]));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn uncached_build_is_returned_when_cache_write_fails() {
        let memory = MemoryStore::new();
        let grid = GridSize::new(4, 4);
        paint(&memory, grid, 3, 2, 1).await;
        memory.fail(Fault::Documents);
        let snapshot = materializer(&memory, grid).get_snapshot().await.unwrap();
        assert_eq!(snapshot.cells, vec![SnapshotCell(3, 2, 1)]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn failed_rebuild_leaves_previous_cache() {
        let memory = MemoryStore::new();
        let grid = GridSize::new(4, 4);
        let materializer = materializer(&memory, grid);
        paint(&memory, grid, 1, 1, 1).await;
        let cached = materializer.rebuild().await.unwrap();

        memory.fail(Fault::Sets);
        assert!(materializer.rebuild().await.is_err());
        memory.heal(Fault::Sets);
        assert_eq!(materializer.get_snapshot().await.unwrap(), cached);
    }

    #[test_timeout::tokio_timeout_test(5, worker_threads = 2)]
    async fn queue_runs_every_request_and_goes_idle() {
        let memory = MemoryStore::new();
        let grid = GridSize::new(4, 4);
        let materializer = materializer(&memory, grid);
        let (queue, _worker) = RebuildQueue::spawn(materializer.clone());

        paint(&memory, grid, 2, 2, 7).await;
        for _ in 0..5 {
            queue.schedule(RebuildReason::Manual);
        }
        queue.wait_idle().await;
        assert_eq!(queue.pending(), 0);
        assert_eq!(
            materializer.get_snapshot().await.unwrap().cells,
            vec![SnapshotCell(2, 2, 7)]
        );
    }
}
