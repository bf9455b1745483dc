//! Shared pixel canvas engine.
//!
//! A fixed grid of 16-color cells packed at four bits per cell, an index of
//! every cell ever painted, a cached snapshot derived from the two, per-zone
//! activity series feeding a heatmap, and the write path tying them together
//! with change notifications over a [`canvas_bus::Bus`].
//!
//! Storage is reached through the capability traits in [`store`]; an
//! in-process [`memory::MemoryStore`] implements all of them.

pub mod addressing;
pub mod canvas;
pub mod error;
pub mod events;
pub mod keys;
pub mod memory;
pub mod pixels;
pub mod placed;
pub mod snapshot;
pub mod store;
mod tracker;
pub mod zones;

pub use addressing::{CellCoord, Color, GridSize, COLOR_COUNT, PALETTE};
pub use canvas::{Backends, Canvas, CanvasConfig, MAX_HISTORY};
pub use error::{CanvasError, Effect};
pub use events::{ObserverError, PixelUpdate, PlacementObserver, PlacementRecord};
pub use keys::KeyLayout;
pub use memory::{Fault, MemoryStore};
pub use snapshot::{RebuildReason, Snapshot, SnapshotCell};
pub use store::StoreError;
pub use zones::{HeatmapEntry, MAX_WINDOW_HOURS};
