//! No-op cache backend.
//!
//! Always misses; stores vanish. Used when storage is disabled for a cache
//! (`disable_storage`), which turns the manager into a pure render
//! pass-through.

use async_trait::async_trait;
use graticule_core::TileCoord;

use crate::cache::{Dimensions, TileStore};
use crate::error::Result;
use crate::tile::Tile;

/// Always-miss tile store.
#[derive(Debug, Default)]
pub struct DummyStore;

#[async_trait]
impl TileStore for DummyStore {
    fn lock_cache_id(&self) -> &str {
        "dummy"
    }

    async fn load_tile(
        &self,
        _tile: &mut Tile,
        _with_metadata: bool,
        _dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn store_tile(&self, _tile: &Tile, _dimensions: Option<&Dimensions>) -> Result<()> {
        Ok(())
    }

    async fn remove_tile(&self, _coord: TileCoord, _dimensions: Option<&Dimensions>) -> Result<()> {
        Ok(())
    }

    async fn load_tile_metadata(
        &self,
        _tile: &mut Tile,
        _dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TileImage;

    #[tokio::test]
    async fn test_always_misses() {
        let store = DummyStore;
        let coord = TileCoord::new(2, 1, 1);
        let tile = Tile::with_image(coord, TileImage::solid((4, 4), [1, 1, 1, 255]));
        store.store_tile(&tile, None).await.unwrap();

        let mut probe = Tile::new(coord);
        assert!(!store.load_tile(&mut probe, false, None).await.unwrap());
        assert!(!store.is_cached(coord, None).await.unwrap());
    }
}
