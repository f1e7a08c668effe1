//! # Graticule Tiles
//!
//! Tile cache engine for the Graticule accelerating map proxy.
//!
//! Upstream map servers are slow, rate-limited, or expensive; this crate
//! sits between clients and upstreams and turns arbitrary map requests into
//! cached, grid-aligned tiles:
//!
//! - **Cache backends**: filesystem, MBTiles, GeoPackage, S3, Azure Blob,
//!   Redis, CouchDB, compact bundles, and a no-op store
//! - **Tile locking**: cross-process single-writer per meta-tile, plus
//!   per-upstream concurrency limiting
//! - **Source adapters**: WMS, ArcGIS REST, tile services, MapServer,
//!   Mapnik, and stacked caches
//! - **Tile manager**: meta-tile batching, freshness/refresh handling,
//!   rescaling from neighboring levels, band merging, watermarking, and
//!   batched write-back
//! - **Map layers**: non-grid-aligned requests served by resampling and
//!   reprojecting cached tiles, with SRS- and resolution-based routing
//!
//! ## Example
//!
//! ```no_run
//! use graticule_tiles::cache::{DirectoryLayout, FileStore};
//! use graticule_tiles::image::ImageOptions;
//! use graticule_tiles::lock::FileLocker;
//! use graticule_tiles::manager::{TileManager, TileManagerConfig};
//! use graticule_core::{GridOrigin, TileCoord, TileGrid};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(source: Arc<dyn graticule_tiles::source::Source>) -> graticule_tiles::Result<()> {
//! let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
//! let store = Arc::new(FileStore::new(
//!     "/var/cache/tiles/osm_EPSG900913",
//!     DirectoryLayout::Tc,
//!     grid.clone(),
//!     ImageOptions::default(),
//! ));
//! let locker = Arc::new(FileLocker::new(
//!     "/var/cache/tiles/tile_locks",
//!     Duration::from_secs(60),
//! ));
//! let manager = TileManager::new(
//!     "osm_webmercator",
//!     grid,
//!     store,
//!     locker,
//!     vec![source],
//!     ImageOptions::default(),
//!     TileManagerConfig::default(),
//! );
//! let tile = manager.load_tile_coord(TileCoord::new(3, 1, 2), None, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod image;
pub mod layer;
pub mod lock;
pub mod manager;
pub mod renderd;
pub mod source;
pub mod tile;

// Re-export commonly used types
pub use error::{Result, TileError};
pub use image::{ImageOptions, TileFormat, TileImage};
pub use layer::{CacheMapLayer, MapLayer, MapQuery};
pub use manager::{TileManager, TileManagerConfig};
pub use tile::Tile;

/// Current version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of concurrent tile creators per request
pub const DEFAULT_CONCURRENT_TILE_CREATORS: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_CONCURRENT_TILE_CREATORS, 2);
        assert!(!VERSION.is_empty());
    }
}
