//! Redis cache backend.
//!
//! Binary-safe values under `<prefix>:<z>:<x>:<y>`, with an optional TTL
//! per key. Meant for short-lived caches in front of slow upstreams rather
//! than long-term tile storage.

use async_trait::async_trait;
use graticule_core::TileCoord;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use crate::cache::{reject_dimensions, Dimensions, TileStore};
use crate::error::{Result, TileError};
use crate::image::{ImageOptions, TileFormat};
use crate::tile::{Tile, TileData};

/// Redis tile store.
pub struct RedisStore {
    manager: ConnectionManager,
    prefix: String,
    ttl: Option<Duration>,
    format: TileFormat,
    image_opts: ImageOptions,
    lock_cache_id: String,
}

impl RedisStore {
    /// Connect to a Redis instance. `prefix` namespaces this cache+grid.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        ttl: Option<Duration>,
        image_opts: ImageOptions,
    ) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TileError::config(format!("redis url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| TileError::cache(format!("redis connect: {}", e)))?;
        let prefix = prefix.into();
        let lock_cache_id = format!("{:x}", md5::compute(format!("{}:{}", url, prefix)));
        let format = image_opts.format;
        Ok(Self {
            manager,
            prefix,
            ttl,
            format,
            image_opts,
            lock_cache_id,
        })
    }

    fn tile_key(&self, coord: TileCoord) -> String {
        format!("{}:{}:{}:{}", self.prefix, coord.z, coord.x, coord.y)
    }
}

#[async_trait]
impl TileStore for RedisStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        _with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("redis", dimensions)?;
        let mut con = self.manager.clone();
        let data: Option<Vec<u8>> = con
            .get(self.tile_key(tile.coord))
            .await
            .map_err(|e| TileError::cache(format!("redis get: {}", e)))?;
        match data {
            Some(bytes) => {
                tile.size = Some(bytes.len() as u64);
                tile.data = Some(TileData::Encoded {
                    bytes: bytes.into(),
                    format: self.format,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("redis", dimensions)?;
        let bytes = tile.to_buffer(&self.image_opts)?;
        let key = self.tile_key(tile.coord);
        let mut con = self.manager.clone();
        let result: redis::RedisResult<()> = match self.ttl {
            Some(ttl) => {
                redis::cmd("SETEX")
                    .arg(&key)
                    .arg(ttl.as_secs())
                    .arg(bytes.as_ref())
                    .query_async(&mut con)
                    .await
            }
            None => {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(bytes.as_ref())
                    .query_async(&mut con)
                    .await
            }
        };
        result.map_err(|e| TileError::cache(format!("redis set: {}", e)))
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("redis", dimensions)?;
        let mut con = self.manager.clone();
        let _: () = con
            .del(self.tile_key(coord))
            .await
            .map_err(|e| TileError::cache(format!("redis del: {}", e)))?;
        Ok(())
    }

    async fn is_cached(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<bool> {
        reject_dimensions("redis", dimensions)?;
        let mut con = self.manager.clone();
        con.exists(self.tile_key(coord))
            .await
            .map_err(|e| TileError::cache(format!("redis exists: {}", e)))
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("redis", dimensions)?;
        let mut con = self.manager.clone();
        let len: u64 = con
            .strlen(self.tile_key(tile.coord))
            .await
            .map_err(|e| TileError::cache(format!("redis strlen: {}", e)))?;
        if len == 0 {
            return Ok(false);
        }
        tile.size = Some(len);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_key_layout() {
        // Key layout only; live Redis is exercised by integration setups.
        let coord = TileCoord::new(7, 21, 45);
        let key = format!("{}:{}:{}:{}", "osm:webmercator", coord.z, coord.x, coord.y);
        assert_eq!(key, "osm:webmercator:7:21:45");
    }
}
