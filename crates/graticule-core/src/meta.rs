//! Meta-tile grids.
//!
//! A meta-tile is a rectangular block of adjacent tiles rendered in one
//! upstream call, optionally extended by a pixel buffer so labels and
//! symbols crossing tile edges render identically in every tile. Meta-tiles
//! are aligned to the tile grid; blocks at the grid edge are clipped.

use std::sync::Arc;

use crate::bbox::BBox;
use crate::error::Result;
use crate::grid::{GridOrigin, TileCoord, TileGrid};

/// Groups tiles of a [`TileGrid`] into aligned meta-tiles.
#[derive(Debug, Clone)]
pub struct MetaGrid {
    grid: Arc<TileGrid>,
    meta_size: (u32, u32),
    meta_buffer: u32,
}

impl MetaGrid {
    pub fn new(grid: Arc<TileGrid>, meta_size: (u32, u32), meta_buffer: u32) -> Self {
        Self {
            grid,
            meta_size: (meta_size.0.max(1), meta_size.1.max(1)),
            meta_buffer,
        }
    }

    pub fn meta_size(&self) -> (u32, u32) {
        self.meta_size
    }

    pub fn meta_buffer(&self) -> u32 {
        self.meta_buffer
    }

    /// Anchor coordinate of the meta-tile containing `coord`. Stable for
    /// every tile in the block, which makes it the lock key.
    pub fn main_tile(&self, coord: TileCoord) -> TileCoord {
        TileCoord::new(
            coord.z,
            coord.x - coord.x % self.meta_size.0,
            coord.y - coord.y % self.meta_size.1,
        )
    }

    /// The aligned meta-tile containing `coord`, clipped to the grid.
    pub fn meta_tile(&self, coord: TileCoord) -> Result<MetaTile> {
        let anchor = self.main_tile(coord);
        let (gw, gh) = self.grid.grid_size(coord.z)?;
        let x1 = (anchor.x + self.meta_size.0 - 1).min(gw - 1);
        let y1 = (anchor.y + self.meta_size.1 - 1).min(gh - 1);
        self.build(anchor.z, anchor.x, anchor.y, x1, y1)
    }

    /// The minimal rectangle of tiles covering `coords`, plus buffer. All
    /// coordinates must share one level.
    pub fn minimal_meta_tile(&self, coords: &[TileCoord]) -> Result<MetaTile> {
        debug_assert!(!coords.is_empty());
        let z = coords[0].z;
        let x0 = coords.iter().map(|c| c.x).min().unwrap_or(0);
        let x1 = coords.iter().map(|c| c.x).max().unwrap_or(0);
        let y0 = coords.iter().map(|c| c.y).min().unwrap_or(0);
        let y1 = coords.iter().map(|c| c.y).max().unwrap_or(0);
        self.build(z, x0, y0, x1, y1)
    }

    fn build(&self, z: u8, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<MetaTile> {
        let res = self.grid.resolution(z)?;
        let (tw, th) = self.grid.tile_size();

        let sw = self.grid.tile_bbox(TileCoord::new(z, x0, y0))?;
        let ne = self.grid.tile_bbox(TileCoord::new(z, x1, y1))?;
        let inner = BBox::from_corners(
            (sw.min_x.min(ne.min_x), sw.min_y.min(ne.min_y)),
            (sw.max_x.max(ne.max_x), sw.max_y.max(ne.max_y)),
        );

        // Buffer in map units, clipped at the grid edge so the rendered
        // image never reaches outside the world extent.
        let buffered = inner
            .buffered(self.meta_buffer as f64 * res)
            .intersection(self.grid.bbox())
            .unwrap_or(inner);

        let buf_left = ((inner.min_x - buffered.min_x) / res).round() as u32;
        let buf_top = ((buffered.max_y - inner.max_y) / res).round() as u32;

        let size = (
            (buffered.width() / res).round() as u32,
            (buffered.height() / res).round() as u32,
        );

        let mut tiles = Vec::with_capacity(((x1 - x0 + 1) * (y1 - y0 + 1)) as usize);
        for y in y0..=y1 {
            for x in x0..=x1 {
                tiles.push(TileCoord::new(z, x, y));
            }
        }

        Ok(MetaTile {
            anchor: TileCoord::new(z, x0, y0),
            grid_size: (x1 - x0 + 1, y1 - y0 + 1),
            bbox: buffered,
            size,
            buf_left,
            buf_top,
            tile_size: (tw, th),
            origin: self.grid.origin(),
            y1,
            tiles,
        })
    }
}

/// One aligned block of tiles with its render extent and pixel layout.
#[derive(Debug, Clone)]
pub struct MetaTile {
    anchor: TileCoord,
    grid_size: (u32, u32),
    bbox: BBox,
    size: (u32, u32),
    buf_left: u32,
    buf_top: u32,
    tile_size: (u32, u32),
    origin: GridOrigin,
    y1: u32,
    tiles: Vec<TileCoord>,
}

impl MetaTile {
    /// Anchor (minimum x/y) tile; used as the lock key for the block.
    pub fn anchor(&self) -> TileCoord {
        self.anchor
    }

    /// Block dimensions in tiles `(mx, my)`
    pub fn grid_size(&self) -> (u32, u32) {
        self.grid_size
    }

    /// Render extent including buffer
    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    /// Render size in pixels including buffer
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Contained tile coordinates, row-major from the anchor
    pub fn tiles(&self) -> &[TileCoord] {
        &self.tiles
    }

    /// Pixel offset of a tile's top-left corner inside the rendered meta
    /// image (row 0 is the north edge).
    pub fn tile_pixel_offset(&self, coord: TileCoord) -> (u32, u32) {
        debug_assert!(self.tiles.contains(&coord));
        let px = self.buf_left + (coord.x - self.anchor.x) * self.tile_size.0;
        let row = match self.origin {
            // South-west counting: larger y is further north, nearer row 0.
            GridOrigin::SouthWest => self.y1 - coord.y,
            GridOrigin::NorthWest => coord.y - self.anchor.y,
        };
        let py = self.buf_top + row * self.tile_size.1;
        (px, py)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridOrigin;
    use approx::assert_relative_eq;

    fn meta_grid(buffer: u32) -> MetaGrid {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        MetaGrid::new(grid, (2, 2), buffer)
    }

    #[test]
    fn test_main_tile_is_stable_across_block() {
        let mg = meta_grid(0);
        let anchor = mg.main_tile(TileCoord::new(3, 5, 7));
        assert_eq!(anchor, TileCoord::new(3, 4, 6));
        assert_eq!(mg.main_tile(TileCoord::new(3, 4, 6)), anchor);
        assert_eq!(mg.main_tile(TileCoord::new(3, 5, 6)), anchor);
    }

    #[test]
    fn test_meta_tile_covers_block() {
        let mg = meta_grid(0);
        let meta = mg.meta_tile(TileCoord::new(2, 0, 0)).unwrap();
        assert_eq!(meta.grid_size(), (2, 2));
        assert_eq!(meta.size(), (512, 512));
        assert_eq!(meta.tiles().len(), 4);
        // 2x2 block of the 4x4 level-2 grid: the south-west quadrant.
        let bbox = meta.bbox();
        assert_relative_eq!(bbox.max_x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(bbox.max_y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_meta_tile_clipped_at_grid_edge() {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        let mg = MetaGrid::new(grid, (4, 4), 0);
        // Level 1 only has 2x2 tiles; the 4x4 block must clip.
        let meta = mg.meta_tile(TileCoord::new(1, 0, 0)).unwrap();
        assert_eq!(meta.grid_size(), (2, 2));
        assert_eq!(meta.size(), (512, 512));
    }

    #[test]
    fn test_buffer_expands_bbox_but_clips_at_world_edge() {
        let mg = meta_grid(10);
        let meta = mg.meta_tile(TileCoord::new(3, 2, 2)).unwrap();
        // Interior block: buffer on all four edges.
        assert_eq!(meta.size(), (512 + 20, 512 + 20));

        let edge = mg.meta_tile(TileCoord::new(3, 0, 0)).unwrap();
        // West and south edges are at the world boundary.
        assert_eq!(edge.size(), (512 + 10, 512 + 10));
    }

    #[test]
    fn test_tile_pixel_offsets_sw_origin() {
        let mg = meta_grid(0);
        let meta = mg.meta_tile(TileCoord::new(2, 0, 0)).unwrap();
        // Row 0 of the image is the north edge: the y=1 tiles sit on top.
        assert_eq!(meta.tile_pixel_offset(TileCoord::new(2, 0, 1)), (0, 0));
        assert_eq!(meta.tile_pixel_offset(TileCoord::new(2, 1, 1)), (256, 0));
        assert_eq!(meta.tile_pixel_offset(TileCoord::new(2, 0, 0)), (0, 256));
        assert_eq!(meta.tile_pixel_offset(TileCoord::new(2, 1, 0)), (256, 256));
    }

    #[test]
    fn test_buffered_offsets() {
        let mg = meta_grid(10);
        let meta = mg.meta_tile(TileCoord::new(3, 2, 2)).unwrap();
        assert_eq!(meta.tile_pixel_offset(TileCoord::new(3, 2, 3)), (10, 10));
    }

    #[test]
    fn test_minimal_meta_tile() {
        let mg = meta_grid(0);
        let coords = [TileCoord::new(3, 4, 6), TileCoord::new(3, 5, 6)];
        let meta = mg.minimal_meta_tile(&coords).unwrap();
        assert_eq!(meta.grid_size(), (2, 1));
        assert_eq!(meta.size(), (512, 256));
        assert_eq!(meta.tiles().len(), 2);
    }
}
