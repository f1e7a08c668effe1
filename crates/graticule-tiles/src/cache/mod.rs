//! Cache backends.
//!
//! All backends speak the same narrow contract: load, store, remove, and
//! probe tiles keyed by `(grid, z, x, y)`. Loads never fail on a missing
//! tile; they answer `false`. Stores are atomic per tile, and batched
//! stores are transactional where the substrate supports it.

pub mod azure;
pub mod compact;
pub mod couchdb;
pub mod dummy;
pub mod file;
pub mod geopackage;
pub mod layout;
pub mod mbtiles;
pub mod redis;
pub mod s3;

pub use dummy::DummyStore;
pub use file::FileStore;
pub use layout::DirectoryLayout;
pub use mbtiles::{MBTilesLevelStore, MBTilesStore};

use async_trait::async_trait;
use graticule_core::{Coverage, TileCoord};
use std::collections::BTreeMap;

use crate::error::{Result, TileError};
use crate::tile::Tile;

/// Extra cache key dimensions (e.g. `time`, `elevation`). Only level-split
/// SQLite backends support them.
pub type Dimensions = BTreeMap<String, String>;

/// Stable filename fragment for a dimension set.
pub fn dimensions_key(dimensions: &Dimensions) -> String {
    dimensions
        .iter()
        .map(|(k, v)| format!("{}-{}", k, v))
        .collect::<Vec<_>>()
        .join("_")
}

/// Uniform contract for tile persistence.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Opaque id identifying this backend instance for locking purposes.
    fn lock_cache_id(&self) -> &str;

    /// Whether cache dimensions are honored.
    fn supports_dimensions(&self) -> bool {
        false
    }

    /// Mask restricting where tiles exist; checked by the manager.
    fn coverage(&self) -> Option<&Coverage> {
        None
    }

    /// Load payload (and timestamp/size) into the tile. Answers `false` on
    /// a missing tile without error.
    async fn load_tile(
        &self,
        tile: &mut Tile,
        with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool>;

    /// Load several tiles. Backends batch where the substrate supports it.
    async fn load_tiles(
        &self,
        tiles: &mut [Tile],
        with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<()> {
        for tile in tiles.iter_mut() {
            self.load_tile(tile, with_metadata, dimensions).await?;
        }
        Ok(())
    }

    /// Persist one tile. Must not leave a partial write behind.
    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()>;

    /// Persist a batch, transactionally where possible.
    async fn store_tiles(&self, tiles: &[Tile], dimensions: Option<&Dimensions>) -> Result<()> {
        for tile in tiles {
            self.store_tile(tile, dimensions).await?;
        }
        Ok(())
    }

    /// Remove a tile; removing a missing tile is not an error.
    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()>;

    /// Whether a tile is present.
    async fn is_cached(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<bool> {
        let mut tile = Tile::new(coord);
        self.load_tile_metadata(&mut tile, dimensions).await
    }

    /// Load only timestamp and size.
    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool>;
}

/// Reject dimensions on backends that cannot key by them.
pub(crate) fn reject_dimensions(
    store: &str,
    dimensions: Option<&Dimensions>,
) -> Result<()> {
    match dimensions {
        Some(d) if !d.is_empty() => Err(TileError::config(format!(
            "{} cache does not support dimensions",
            store
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_key_is_sorted_and_stable() {
        let mut dims = Dimensions::new();
        dims.insert("time".to_string(), "2024-01-01".to_string());
        dims.insert("elevation".to_string(), "100".to_string());
        assert_eq!(dimensions_key(&dims), "elevation-100_time-2024-01-01");
    }

    #[test]
    fn test_reject_dimensions() {
        assert!(reject_dimensions("file", None).is_ok());
        let mut dims = Dimensions::new();
        dims.insert("time".to_string(), "t".to_string());
        assert!(reject_dimensions("file", Some(&dims)).is_err());
    }
}
