use std::sync::Arc;

use thiserror::Error;

use crate::addressing::{CellCoord, Color, GridSize};
use crate::store::{PackedFieldStore, StoreError, StoreResult};

/// Width of one packed cell.
pub const BITS_PER_CELL: u8 = 4;

#[derive(Debug, Error)]
pub enum PixelError {
    #[error("cell ({x}, {y}) is outside the canvas")]
    OutOfBounds { x: i64, y: i64 },
    #[error("color {0} is outside the 16-color palette")]
    InvalidColor(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sole owner of the packed color region. Nothing else computes bit offsets.
#[derive(Clone)]
pub struct PixelStore {
    fields: Arc<dyn PackedFieldStore>,
    grid: GridSize,
    region: String,
}

impl PixelStore {
    pub fn new(fields: Arc<dyn PackedFieldStore>, grid: GridSize, region: String) -> Self {
        Self {
            fields,
            grid,
            region,
        }
    }

    pub fn grid(&self) -> GridSize {
        self.grid
    }

    fn bit_offset(&self, coord: CellCoord) -> u64 {
        self.grid.to_index(coord) * BITS_PER_CELL as u64
    }

    pub async fn set_color(&self, x: i64, y: i64, color: i64) -> Result<(), PixelError> {
        let coord = self.grid.coord(x, y).ok_or(PixelError::OutOfBounds { x, y })?;
        let color = Color::new(color).ok_or(PixelError::InvalidColor(color))?;
        self.write(coord, color).await?;
        Ok(())
    }

    /// Write an already validated cell.
    pub(crate) async fn write(&self, coord: CellCoord, color: Color) -> StoreResult<()> {
        self.fields
            .set_field(
                &self.region,
                BITS_PER_CELL,
                self.bit_offset(coord),
                color.value() as u64,
            )
            .await
    }

    /// Out-of-range coordinates read as background.
    pub async fn get_color(&self, x: i64, y: i64) -> StoreResult<u8> {
        match self.grid.coord(x, y) {
            Some(coord) => self.read(coord).await,
            None => Ok(Color::BACKGROUND.value()),
        }
    }

    pub(crate) async fn read(&self, coord: CellCoord) -> StoreResult<u8> {
        let raw = self
            .fields
            .get_field(&self.region, BITS_PER_CELL, self.bit_offset(coord))
            .await?;
        Ok((raw & 0xF) as u8)
    }

    pub async fn exists(&self) -> StoreResult<bool> {
        self.fields.exists(&self.region).await
    }

    /// Forces allocation of the region by writing background to (0, 0) when
    /// it has never been touched. Existing content is left as is.
    pub async fn initialize(&self) -> StoreResult<bool> {
        if self.exists().await? {
            return Ok(false);
        }
        self.write(CellCoord::new(0, 0), Color::BACKGROUND).await?;
        Ok(true)
    }

    pub(crate) async fn delete(&self) -> StoreResult<()> {
        self.fields.delete(&self.region).await
    }
}
