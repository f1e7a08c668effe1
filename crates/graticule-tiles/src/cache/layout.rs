//! Directory layouts.
//!
//! The same key schemes are used by the filesystem cache and the object
//! stores (S3, Azure): only the separator target differs. Row counting per
//! scheme follows its native convention; coordinates are converted from the
//! grid's origin as needed.

use graticule_core::{GridOrigin, TileCoord, TileGrid};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Key scheme mapping a tile coordinate to a relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryLayout {
    /// TileCache: `zz/xxx/xxx/xxx/yyy/yyy/yyy.ext`, rows from the south
    Tc,
    /// Split-index: `zz/xxxx/xxxx/yyyy/yyyy.ext`, rows from the south
    Mp,
    /// `z/x/y.ext`, rows from the south
    Tms,
    /// `z/x/y.ext`, rows from the north (slippy-map)
    ReverseTms,
    /// Bing-style quadkey digits, rows from the north
    Quadkey,
    /// ArcGIS exploded cache: `Lzz/Rrrrrrrrr/Ccccccccc.ext` in hex, rows
    /// from the north
    Arcgis,
}

impl DirectoryLayout {
    /// Row index counted from the south, per the grid origin.
    fn south_row(coord: TileCoord, grid: &TileGrid) -> Result<u32> {
        Ok(match grid.origin() {
            GridOrigin::SouthWest => coord.y,
            GridOrigin::NorthWest => grid.flip_y(coord)?.y,
        })
    }

    /// Row index counted from the north.
    fn north_row(coord: TileCoord, grid: &TileGrid) -> Result<u32> {
        Ok(match grid.origin() {
            GridOrigin::NorthWest => coord.y,
            GridOrigin::SouthWest => grid.flip_y(coord)?.y,
        })
    }

    /// Relative key for a tile, using `/` separators.
    pub fn tile_key(&self, coord: TileCoord, grid: &TileGrid, extension: &str) -> Result<String> {
        let key = match self {
            DirectoryLayout::Tc => {
                let y = Self::south_row(coord, grid)?;
                format!(
                    "{:02}/{:03}/{:03}/{:03}/{:03}/{:03}/{:03}.{}",
                    coord.z,
                    coord.x / 1_000_000,
                    (coord.x / 1_000) % 1_000,
                    coord.x % 1_000,
                    y / 1_000_000,
                    (y / 1_000) % 1_000,
                    y % 1_000,
                    extension
                )
            }
            DirectoryLayout::Mp => {
                let y = Self::south_row(coord, grid)?;
                format!(
                    "{:02}/{:04}/{:04}/{:04}/{:04}.{}",
                    coord.z,
                    coord.x / 10_000,
                    coord.x % 10_000,
                    y / 10_000,
                    y % 10_000,
                    extension
                )
            }
            DirectoryLayout::Tms => {
                let y = Self::south_row(coord, grid)?;
                format!("{}/{}/{}.{}", coord.z, coord.x, y, extension)
            }
            DirectoryLayout::ReverseTms => {
                let y = Self::north_row(coord, grid)?;
                format!("{}/{}/{}.{}", coord.z, coord.x, y, extension)
            }
            DirectoryLayout::Quadkey => {
                let y = Self::north_row(coord, grid)?;
                format!(
                    "{}.{}",
                    TileCoord::new(coord.z, coord.x, y).to_quadkey(),
                    extension
                )
            }
            DirectoryLayout::Arcgis => {
                let y = Self::north_row(coord, grid)?;
                format!("L{:02}/R{:08x}/C{:08x}.{}", coord.z, y, coord.x, extension)
            }
        };
        Ok(key)
    }
}
