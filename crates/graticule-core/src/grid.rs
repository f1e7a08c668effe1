//! Tile grids.
//!
//! A grid is a named resolution ladder over a world extent in one SRS. It
//! owns the deterministic mapping between `(z, x, y)` coordinates and
//! geographic bounding boxes, including the origin convention (tiles counted
//! from the south-west or the north-west corner).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bbox::BBox;
use crate::error::{CoreError, Result};
use crate::srs::{Srs, MERCATOR_EXTENT};

/// Relative tolerance for snapping bbox edges onto tile boundaries.
const EDGE_EPSILON: f64 = 1e-9;

/// A tile coordinate on a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    /// Zoom level
    pub z: u8,
    /// Column
    pub x: u32,
    /// Row, counted from the grid origin
    pub y: u32,
}

impl TileCoord {
    /// Create a new tile coordinate
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Quadkey digits for this coordinate, top-left row counting.
    pub fn to_quadkey(&self) -> String {
        let mut quadkey = String::new();
        for i in (0..self.z).rev() {
            let mut digit = 0;
            let mask = 1u32 << i;
            if (self.x & mask) != 0 {
                digit += 1;
            }
            if (self.y & mask) != 0 {
                digit += 2;
            }
            quadkey.push_str(&digit.to_string());
        }
        quadkey
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Which corner row 0 is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridOrigin {
    /// Row 0 at the top (XYZ / slippy-map convention)
    #[serde(rename = "nw")]
    NorthWest,
    /// Row 0 at the bottom (TMS convention)
    #[serde(rename = "sw")]
    SouthWest,
}

/// A named tile grid: SRS, extent, tile size, origin, and a strictly
/// decreasing resolution ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileGrid {
    name: String,
    srs: Srs,
    bbox: BBox,
    tile_size: (u32, u32),
    resolutions: Vec<f64>,
    origin: GridOrigin,
}

impl TileGrid {
    /// Create a grid. The resolution ladder must be non-empty and strictly
    /// decreasing.
    pub fn new(
        name: impl Into<String>,
        srs: Srs,
        bbox: BBox,
        tile_size: (u32, u32),
        resolutions: Vec<f64>,
        origin: GridOrigin,
    ) -> Result<Self> {
        if resolutions.is_empty() {
            return Err(CoreError::InvalidGrid("empty resolution ladder".to_string()));
        }
        if resolutions.windows(2).any(|w| w[1] >= w[0]) {
            return Err(CoreError::InvalidGrid(
                "resolutions must be strictly decreasing".to_string(),
            ));
        }
        if resolutions.iter().any(|r| *r <= 0.0 || !r.is_finite()) {
            return Err(CoreError::InvalidGrid(
                "resolutions must be positive and finite".to_string(),
            ));
        }
        if tile_size.0 == 0 || tile_size.1 == 0 {
            return Err(CoreError::InvalidGrid("zero tile size".to_string()));
        }
        Ok(Self {
            name: name.into(),
            srs,
            bbox,
            tile_size,
            resolutions,
            origin,
        })
    }

    /// The global spherical-mercator grid (`GLOBAL_MERCATOR`), 256px tiles,
    /// resolutions halving from one world-covering tile at level 0.
    pub fn web_mercator(num_levels: usize, origin: GridOrigin) -> Self {
        let bbox = BBox::new_unchecked(
            -MERCATOR_EXTENT,
            -MERCATOR_EXTENT,
            MERCATOR_EXTENT,
            MERCATOR_EXTENT,
        );
        let res0 = bbox.width() / 256.0;
        let resolutions = (0..num_levels.max(1))
            .map(|z| res0 / (1u64 << z) as f64)
            .collect();
        Self {
            name: "GLOBAL_MERCATOR".to_string(),
            srs: Srs::WEB_MERCATOR_LEGACY,
            bbox,
            tile_size: (256, 256),
            resolutions,
            origin,
        }
    }

    /// The global geodetic grid (`GLOBAL_GEODETIC`), two 256px tiles wide at
    /// level 0.
    pub fn geodetic(num_levels: usize, origin: GridOrigin) -> Self {
        let bbox = BBox::new_unchecked(-180.0, -90.0, 180.0, 90.0);
        let res0 = 180.0 / 256.0;
        let resolutions = (0..num_levels.max(1))
            .map(|z| res0 / (1u64 << z) as f64)
            .collect();
        Self {
            name: "GLOBAL_GEODETIC".to_string(),
            srs: Srs::WGS84,
            bbox,
            tile_size: (256, 256),
            resolutions,
            origin,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn srs(&self) -> Srs {
        self.srs
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn tile_size(&self) -> (u32, u32) {
        self.tile_size
    }

    pub fn origin(&self) -> GridOrigin {
        self.origin
    }

    /// Number of levels in the ladder
    pub fn levels(&self) -> usize {
        self.resolutions.len()
    }

    pub fn resolutions(&self) -> &[f64] {
        &self.resolutions
    }

    /// Resolution at `z` in units per pixel
    pub fn resolution(&self, z: u8) -> Result<f64> {
        self.resolutions
            .get(z as usize)
            .copied()
            .ok_or(CoreError::InvalidLevel {
                level: z,
                levels: self.resolutions.len(),
            })
    }

    /// Width and height of one tile in map units at `z`
    fn tile_units(&self, z: u8) -> Result<(f64, f64)> {
        let res = self.resolution(z)?;
        Ok((
            res * self.tile_size.0 as f64,
            res * self.tile_size.1 as f64,
        ))
    }

    /// Number of tiles along each axis at `z`
    pub fn grid_size(&self, z: u8) -> Result<(u32, u32)> {
        let (uw, uh) = self.tile_units(z)?;
        let w = (self.bbox.width() / uw - EDGE_EPSILON).ceil().max(1.0) as u32;
        let h = (self.bbox.height() / uh - EDGE_EPSILON).ceil().max(1.0) as u32;
        Ok((w, h))
    }

    /// Whether the coordinate addresses a tile inside the grid extent
    pub fn is_valid(&self, coord: TileCoord) -> bool {
        match self.grid_size(coord.z) {
            Ok((w, h)) => coord.x < w && coord.y < h,
            Err(_) => false,
        }
    }

    /// Flip a row between NW and SW counting at the coordinate's level.
    pub fn flip_y(&self, coord: TileCoord) -> Result<TileCoord> {
        let (_, h) = self.grid_size(coord.z)?;
        Ok(TileCoord::new(coord.z, coord.x, h - 1 - coord.y))
    }

    /// Geographic extent of one tile. Pure: the same coordinate always maps
    /// to the same bbox.
    pub fn tile_bbox(&self, coord: TileCoord) -> Result<BBox> {
        if !self.is_valid(coord) {
            return Err(CoreError::TileOutOfBounds {
                z: coord.z,
                x: coord.x,
                y: coord.y,
            });
        }
        let (uw, uh) = self.tile_units(coord.z)?;
        let min_x = self.bbox.min_x + coord.x as f64 * uw;
        let (min_y, max_y) = match self.origin {
            GridOrigin::SouthWest => {
                let min_y = self.bbox.min_y + coord.y as f64 * uh;
                (min_y, min_y + uh)
            }
            GridOrigin::NorthWest => {
                let max_y = self.bbox.max_y - coord.y as f64 * uh;
                (max_y - uh, max_y)
            }
        };
        BBox::new(min_x, min_y, min_x + uw, max_y)
    }

    /// All tiles at `z` touching `bbox`. Half-open on the east/north edges:
    /// a bbox ending exactly on a tile boundary does not pull in the next
    /// tile column/row.
    pub fn tiles_for_bbox(&self, bbox: &BBox, z: u8) -> Result<TileRange> {
        let (uw, uh) = self.tile_units(z)?;
        let (gw, gh) = self.grid_size(z)?;

        let clipped = bbox.intersection(&self.bbox).ok_or_else(|| {
            CoreError::InvalidBBox(format!("bbox {} outside grid extent", bbox))
        })?;

        let span = |lo: f64, hi: f64, unit: f64| -> (u32, u32) {
            let first = (lo / unit + EDGE_EPSILON).floor().max(0.0) as u32;
            let last = ((hi / unit - EDGE_EPSILON).ceil() as i64 - 1).max(first as i64) as u32;
            (first, last)
        };

        let (x0, x1) = span(clipped.min_x - self.bbox.min_x, clipped.max_x - self.bbox.min_x, uw);
        let (y0, y1) = match self.origin {
            GridOrigin::SouthWest => span(
                clipped.min_y - self.bbox.min_y,
                clipped.max_y - self.bbox.min_y,
                uh,
            ),
            GridOrigin::NorthWest => span(
                self.bbox.max_y - clipped.max_y,
                self.bbox.max_y - clipped.min_y,
                uh,
            ),
        };

        Ok(TileRange {
            z,
            x0,
            y0,
            x1: x1.min(gw - 1),
            y1: y1.min(gh - 1),
        })
    }

    /// Level whose resolution is nearest to `res` on a log scale. On an
    /// exact tie the higher resolution (deeper level) wins.
    pub fn closest_level(&self, res: f64) -> u8 {
        let target = res.max(f64::MIN_POSITIVE).ln();
        let mut best = 0u8;
        let mut best_dist = f64::INFINITY;
        for (z, r) in self.resolutions.iter().enumerate() {
            let dist = (target - r.ln()).abs();
            if dist <= best_dist {
                best_dist = dist;
                best = z as u8;
            }
        }
        best
    }

    /// Whether every tile of `self`, at every level, has a bit-identical
    /// bbox in `other`.
    pub fn is_subset_of(&self, other: &TileGrid) -> bool {
        if !self.srs.is_equivalent(&other.srs) || self.tile_size != other.tile_size {
            return false;
        }
        if !other.bbox.contains(&self.bbox) {
            return false;
        }
        let aligned = |offset: f64, unit: f64| -> bool {
            let ratio = offset / unit;
            (ratio - ratio.round()).abs() < EDGE_EPSILON * ratio.abs().max(1.0)
        };
        for res in &self.resolutions {
            let matching = other
                .resolutions
                .iter()
                .any(|r| ((r - res) / res).abs() < EDGE_EPSILON);
            if !matching {
                return false;
            }
            let unit_x = res * self.tile_size.0 as f64;
            let unit_y = res * self.tile_size.1 as f64;
            if !aligned(self.bbox.min_x - other.bbox.min_x, unit_x) {
                return false;
            }
            // Row edges are anchored at the grid's own origin corner; both
            // corners must land on the other grid's row lattice.
            let other_anchor = match other.origin {
                GridOrigin::SouthWest => other.bbox.min_y,
                GridOrigin::NorthWest => other.bbox.max_y,
            };
            let self_anchor = match self.origin {
                GridOrigin::SouthWest => self.bbox.min_y,
                GridOrigin::NorthWest => self.bbox.max_y,
            };
            if !aligned(self_anchor - other_anchor, unit_y) {
                return false;
            }
        }
        true
    }
}

/// An inclusive rectangular range of tiles at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub z: u8,
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileRange {
    /// Number of tiles in the range
    pub fn len(&self) -> u64 {
        (self.x1 - self.x0 + 1) as u64 * (self.y1 - self.y0 + 1) as u64
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Tiles per axis `(width, height)`
    pub fn size(&self) -> (u32, u32) {
        (self.x1 - self.x0 + 1, self.y1 - self.y0 + 1)
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        coord.z == self.z
            && coord.x >= self.x0
            && coord.x <= self.x1
            && coord.y >= self.y0
            && coord.y <= self.y1
    }

    /// Iterate row by row, west to east. For a south-west origin grid the
    /// first row is the southernmost.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let z = self.z;
        let (x0, x1) = (self.x0, self.x1);
        (self.y0..=self.y1).flat_map(move |y| (x0..=x1).map(move |x| TileCoord::new(z, x, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mercator() -> TileGrid {
        TileGrid::web_mercator(20, GridOrigin::SouthWest)
    }

    #[test]
    fn test_level0_is_world() {
        let grid = mercator();
        assert_eq!(grid.grid_size(0).unwrap(), (1, 1));
        let bbox = grid.tile_bbox(TileCoord::new(0, 0, 0)).unwrap();
        assert!(bbox.approx_eq(grid.bbox(), 1e-12));
    }

    #[test]
    fn test_tile_bbox_sw_quadrant() {
        let grid = mercator();
        let bbox = grid.tile_bbox(TileCoord::new(1, 0, 0)).unwrap();
        assert_relative_eq!(bbox.min_x, -MERCATOR_EXTENT, epsilon = 1e-6);
        assert_relative_eq!(bbox.min_y, -MERCATOR_EXTENT, epsilon = 1e-6);
        assert_relative_eq!(bbox.max_x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(bbox.max_y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_nw_origin_flips_rows() {
        let sw = TileGrid::web_mercator(20, GridOrigin::SouthWest);
        let nw = TileGrid::web_mercator(20, GridOrigin::NorthWest);
        let a = sw.tile_bbox(TileCoord::new(1, 0, 0)).unwrap();
        let b = nw.tile_bbox(TileCoord::new(1, 0, 1)).unwrap();
        assert!(a.approx_eq(&b, 1e-12));
    }

    #[test]
    fn test_tile_bbox_is_pure() {
        let grid = mercator();
        let coord = TileCoord::new(7, 33, 98);
        assert_eq!(
            grid.tile_bbox(coord).unwrap(),
            grid.tile_bbox(coord).unwrap()
        );
    }

    #[test]
    fn test_tiles_for_bbox_covers_query() {
        let grid = mercator();
        let query = BBox::new(-1_000_000.0, -2_000_000.0, 3_000_000.0, 500_000.0).unwrap();
        let range = grid.tiles_for_bbox(&query, 5).unwrap();
        let mut union: Option<BBox> = None;
        for coord in range.iter() {
            let b = grid.tile_bbox(coord).unwrap();
            union = Some(match union {
                None => b,
                Some(u) => BBox::from_corners(
                    (u.min_x.min(b.min_x), u.min_y.min(b.min_y)),
                    (u.max_x.max(b.max_x), u.max_y.max(b.max_y)),
                ),
            });
        }
        assert!(union.unwrap().contains(&query));
    }

    #[test]
    fn test_tiles_for_bbox_half_open_edges() {
        let grid = mercator();
        // Exactly one tile at level 2: the edge at x=0 must not pull in the
        // next column.
        let tile = grid.tile_bbox(TileCoord::new(2, 1, 1)).unwrap();
        let range = grid.tiles_for_bbox(&tile, 2).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range.x0, 1);
        assert_eq!(range.y0, 1);
    }

    #[test]
    fn test_closest_level() {
        let grid = mercator();
        let res5 = grid.resolution(5).unwrap();
        assert_eq!(grid.closest_level(res5), 5);
        assert_eq!(grid.closest_level(res5 * 1.05), 5);
        assert_eq!(grid.closest_level(res5 * 3.0), 3);
    }

    #[test]
    fn test_closest_level_tie_prefers_higher_resolution() {
        let grid = mercator();
        let res5 = grid.resolution(5).unwrap();
        let res6 = grid.resolution(6).unwrap();
        // Log-scale midpoint between two halving levels.
        let mid = (res5 * res6).sqrt();
        assert_eq!(grid.closest_level(mid), 6);
    }

    #[test]
    fn test_is_subset_of_self_and_truncated() {
        let grid = mercator();
        assert!(grid.is_subset_of(&grid));

        let shallow = TileGrid::web_mercator(10, GridOrigin::SouthWest);
        assert!(shallow.is_subset_of(&grid));
        assert!(!grid.is_subset_of(&shallow));
    }

    #[test]
    fn test_subset_rejects_shifted_extent() {
        let grid = mercator();
        let shifted = TileGrid::new(
            "shifted",
            grid.srs(),
            BBox::new(-MERCATOR_EXTENT + 1000.0, -MERCATOR_EXTENT, MERCATOR_EXTENT, MERCATOR_EXTENT)
                .unwrap(),
            (256, 256),
            grid.resolutions().to_vec(),
            GridOrigin::SouthWest,
        )
        .unwrap();
        assert!(!shifted.is_subset_of(&grid));
    }

    #[test]
    fn test_geodetic_level0() {
        let grid = TileGrid::geodetic(18, GridOrigin::SouthWest);
        assert_eq!(grid.grid_size(0).unwrap(), (2, 1));
    }

    #[test]
    fn test_quadkey() {
        assert_eq!(TileCoord::new(3, 3, 5).to_quadkey(), "213");
        assert_eq!(TileCoord::new(1, 0, 0).to_quadkey(), "0");
    }

    #[test]
    fn test_strictly_decreasing_enforced() {
        let result = TileGrid::new(
            "bad",
            Srs::WEB_MERCATOR,
            BBox::new(0.0, 0.0, 100.0, 100.0).unwrap(),
            (256, 256),
            vec![10.0, 10.0, 5.0],
            GridOrigin::SouthWest,
        );
        assert!(result.is_err());
    }
}
