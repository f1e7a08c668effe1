//! S3 cache backend.
//!
//! Object keys reuse the directory layouts under
//! `<base_path>/<cache>/<grid>/…`, so an S3 cache can be mirrored to or
//! from a filesystem cache without rekeying.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graticule_core::{TileCoord, TileGrid};
use rusoto_core::Region;
use rusoto_s3::{
    DeleteObjectRequest, GetObjectRequest, HeadObjectRequest, PutObjectRequest, S3Client, S3,
};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::cache::{reject_dimensions, Dimensions, DirectoryLayout, TileStore};
use crate::error::{Result, TileError};
use crate::image::{ImageOptions, TileFormat};
use crate::tile::{Tile, TileData};

/// S3 cache configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// Key prefix, typically `<base_path>/<cache>/<grid>`
    pub base_path: String,
    /// AWS region name
    pub region: String,
    /// Key scheme below the prefix
    pub layout: DirectoryLayout,
    /// Canned ACL applied to stored tiles
    pub acl: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            base_path: String::new(),
            region: "us-east-1".to_string(),
            layout: DirectoryLayout::Tms,
            acl: None,
        }
    }
}

/// S3 tile store.
pub struct S3Store {
    client: S3Client,
    config: S3Config,
    grid: Arc<TileGrid>,
    format: TileFormat,
    image_opts: ImageOptions,
    lock_cache_id: String,
}

impl S3Store {
    pub fn new(config: S3Config, grid: Arc<TileGrid>, image_opts: ImageOptions) -> Result<Self> {
        let region = Region::from_str(&config.region)
            .map_err(|e| TileError::config(format!("invalid S3 region: {}", e)))?;
        let client = S3Client::new(region);
        let lock_cache_id = format!(
            "{:x}",
            md5::compute(format!("s3://{}/{}", config.bucket, config.base_path).as_bytes())
        );
        let format = image_opts.format;
        Ok(Self {
            client,
            config,
            grid,
            format,
            image_opts,
            lock_cache_id,
        })
    }

    fn tile_key(&self, coord: TileCoord) -> Result<String> {
        let key = self
            .config
            .layout
            .tile_key(coord, &self.grid, self.format.extension())?;
        if self.config.base_path.is_empty() {
            Ok(key)
        } else {
            Ok(format!("{}/{}", self.config.base_path.trim_end_matches('/'), key))
        }
    }
}

#[async_trait]
impl TileStore for S3Store {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("s3", dimensions)?;
        let request = GetObjectRequest {
            bucket: self.config.bucket.clone(),
            key: self.tile_key(tile.coord)?,
            ..Default::default()
        };

        let output = match self.client.get_object(request).await {
            Ok(output) => output,
            Err(rusoto_core::RusotoError::Service(rusoto_s3::GetObjectError::NoSuchKey(_))) => {
                return Ok(false)
            }
            Err(e) => return Err(TileError::cache(format!("s3 get: {}", e))),
        };

        if with_metadata {
            if let Some(lm) = output.last_modified.as_deref() {
                if let Ok(ts) = DateTime::parse_from_rfc2822(lm) {
                    tile.timestamp = Some(ts.with_timezone(&Utc));
                }
            }
        }

        let mut data = Vec::new();
        if let Some(body) = output.body {
            body.into_async_read().read_to_end(&mut data).await?;
        }
        tile.size = Some(data.len() as u64);
        tile.data = Some(TileData::Encoded {
            bytes: data.into(),
            format: self.format,
        });
        Ok(true)
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("s3", dimensions)?;
        let bytes = tile.to_buffer(&self.image_opts)?;
        let request = PutObjectRequest {
            bucket: self.config.bucket.clone(),
            key: self.tile_key(tile.coord)?,
            body: Some(bytes.to_vec().into()),
            content_type: Some(self.format.mime_type().to_string()),
            acl: self.config.acl.clone(),
            ..Default::default()
        };
        self.client
            .put_object(request)
            .await
            .map_err(|e| TileError::cache(format!("s3 put: {}", e)))?;
        Ok(())
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("s3", dimensions)?;
        let request = DeleteObjectRequest {
            bucket: self.config.bucket.clone(),
            key: self.tile_key(coord)?,
            ..Default::default()
        };
        self.client
            .delete_object(request)
            .await
            .map_err(|e| TileError::cache(format!("s3 delete: {}", e)))?;
        Ok(())
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("s3", dimensions)?;
        let request = HeadObjectRequest {
            bucket: self.config.bucket.clone(),
            key: self.tile_key(tile.coord)?,
            ..Default::default()
        };
        match self.client.head_object(request).await {
            Ok(output) => {
                tile.size = output.content_length.map(|l| l as u64);
                if let Some(lm) = output.last_modified.as_deref() {
                    if let Ok(ts) = DateTime::parse_from_rfc2822(lm) {
                        tile.timestamp = Some(ts.with_timezone(&Utc));
                    }
                }
                Ok(true)
            }
            Err(rusoto_core::RusotoError::Unknown(resp)) if resp.status.as_u16() == 404 => {
                Ok(false)
            }
            Err(rusoto_core::RusotoError::Service(rusoto_s3::HeadObjectError::NoSuchKey(_))) => {
                Ok(false)
            }
            Err(e) => Err(TileError::cache(format!("s3 head: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graticule_core::GridOrigin;

    #[test]
    fn test_tile_key_includes_base_path() {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        let store = S3Store::new(
            S3Config {
                bucket: "tiles".to_string(),
                base_path: "caches/osm/webmercator".to_string(),
                ..Default::default()
            },
            grid,
            ImageOptions::default(),
        )
        .unwrap();
        let key = store.tile_key(TileCoord::new(3, 1, 2)).unwrap();
        assert_eq!(key, "caches/osm/webmercator/3/1/2.png");
    }

    #[test]
    fn test_invalid_region_rejected() {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        let result = S3Store::new(
            S3Config {
                region: "not-a-region".to_string(),
                ..Default::default()
            },
            grid,
            ImageOptions::default(),
        );
        assert!(result.is_err());
    }
}
