use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tracing::warn;

use crate::addressing::CellCoord;
use crate::store::{SetStore, StoreResult};

/// Set of every coordinate that has ever been painted. Grows only; a cell
/// repainted to background stays a member.
#[derive(Clone)]
pub struct PlacedIndex {
    sets: Arc<dyn SetStore>,
    key: String,
}

impl PlacedIndex {
    pub fn new(sets: Arc<dyn SetStore>, key: String) -> Self {
        Self { sets, key }
    }

    pub async fn mark_placed(&self, coord: CellCoord) -> StoreResult<bool> {
        self.sets.add(&self.key, &coord.key()).await
    }

    /// Lazily enumerate indexed coordinates. Members that do not parse as a
    /// coordinate key are skipped.
    pub fn all_placed(&self) -> BoxStream<'static, StoreResult<CellCoord>> {
        self.sets
            .members(&self.key)
            .filter_map(|member| async move {
                match member {
                    Ok(key) => match CellCoord::parse_key(&key) {
                        Some(coord) => Some(Ok(coord)),
                        None => {
                            warn!(%key, "skipping malformed placed-cell key");
                            None
                        }
                    },
                    Err(err) => Some(Err(err)),
                }
            })
            .boxed()
    }

    pub async fn len(&self) -> StoreResult<u64> {
        self.sets.count(&self.key).await
    }

    pub(crate) async fn delete(&self) -> StoreResult<()> {
        self.sets.delete(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test_timeout::tokio_timeout_test(5)]
    async fn marking_is_idempotent() {
        let memory = MemoryStore::new();
        let index = PlacedIndex::new(memory.clone(), "test:placed".into());
        assert!(index.mark_placed(CellCoord::new(2, 3)).await.unwrap());
        assert!(!index.mark_placed(CellCoord::new(2, 3)).await.unwrap());
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn enumerates_all_and_skips_garbage() {
        let memory = MemoryStore::new();
        let index = PlacedIndex::new(memory.clone(), "test:placed".into());
        index.mark_placed(CellCoord::new(1, 1)).await.unwrap();
        index.mark_placed(CellCoord::new(3, 0)).await.unwrap();
        memory.add("test:placed", "not-a-key").await.unwrap();

        let mut coords: Vec<CellCoord> = index
            .all_placed()
            .map(|item| item.unwrap())
            .collect()
            .await;
        coords.sort();
        assert_eq!(coords, vec![CellCoord::new(1, 1), CellCoord::new(3, 0)]);
    }
}
