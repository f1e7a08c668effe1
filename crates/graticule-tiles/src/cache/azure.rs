//! Azure Blob Storage cache backend.
//!
//! Same key scheme as the S3 backend: directory layout below
//! `<base_path>/<cache>/<grid>`.

use async_trait::async_trait;
use azure_core::error::ErrorKind;
use azure_core::StatusCode;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use chrono::{DateTime, Utc};
use graticule_core::{TileCoord, TileGrid};
use std::sync::Arc;

use crate::cache::{reject_dimensions, Dimensions, DirectoryLayout, TileStore};
use crate::error::{Result, TileError};
use crate::image::{ImageOptions, TileFormat};
use crate::tile::{Tile, TileData};

/// Azure Blob cache configuration
#[derive(Debug, Clone)]
pub struct AzureConfig {
    /// Storage account name
    pub account: String,
    /// Container holding the tiles
    pub container: String,
    /// Shared access key
    pub access_key: String,
    /// Key prefix, typically `<base_path>/<cache>/<grid>`
    pub base_path: String,
    /// Key scheme below the prefix
    pub layout: DirectoryLayout,
}

/// Azure Blob tile store.
pub struct AzureStore {
    client: ContainerClient,
    base_path: String,
    layout: DirectoryLayout,
    grid: Arc<TileGrid>,
    format: TileFormat,
    image_opts: ImageOptions,
    lock_cache_id: String,
}

impl AzureStore {
    pub fn new(config: AzureConfig, grid: Arc<TileGrid>, image_opts: ImageOptions) -> Self {
        let credentials =
            StorageCredentials::access_key(config.account.clone(), config.access_key.clone());
        let client = BlobServiceClient::new(config.account.clone(), credentials)
            .container_client(&config.container);
        let lock_cache_id = format!(
            "{:x}",
            md5::compute(
                format!(
                    "azure://{}/{}/{}",
                    config.account, config.container, config.base_path
                )
                .as_bytes()
            )
        );
        let format = image_opts.format;
        Self {
            client,
            base_path: config.base_path,
            layout: config.layout,
            grid,
            format,
            image_opts,
            lock_cache_id,
        }
    }

    fn tile_key(&self, coord: TileCoord) -> Result<String> {
        let key = self
            .layout
            .tile_key(coord, &self.grid, self.format.extension())?;
        if self.base_path.is_empty() {
            Ok(key)
        } else {
            Ok(format!("{}/{}", self.base_path.trim_end_matches('/'), key))
        }
    }

    fn is_not_found(err: &azure_core::error::Error) -> bool {
        matches!(
            err.kind(),
            ErrorKind::HttpResponse { status: StatusCode::NotFound, .. }
        )
    }
}

#[async_trait]
impl TileStore for AzureStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        _with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("azureblob", dimensions)?;
        let blob = self.client.blob_client(self.tile_key(tile.coord)?);
        match blob.get_content().await {
            Ok(bytes) => {
                tile.size = Some(bytes.len() as u64);
                tile.data = Some(TileData::Encoded {
                    bytes: bytes.into(),
                    format: self.format,
                });
                Ok(true)
            }
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(TileError::cache(format!("azure get: {}", e))),
        }
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("azureblob", dimensions)?;
        let bytes = tile.to_buffer(&self.image_opts)?;
        let blob = self.client.blob_client(self.tile_key(tile.coord)?);
        blob.put_block_blob(bytes.to_vec())
            .content_type(self.format.mime_type().to_string())
            .await
            .map_err(|e| TileError::cache(format!("azure put: {}", e)))?;
        Ok(())
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("azureblob", dimensions)?;
        let blob = self.client.blob_client(self.tile_key(coord)?);
        match blob.delete().await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(TileError::cache(format!("azure delete: {}", e))),
        }
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("azureblob", dimensions)?;
        let blob = self.client.blob_client(self.tile_key(tile.coord)?);
        match blob.get_properties().await {
            Ok(response) => {
                let props = &response.blob.properties;
                tile.size = Some(props.content_length);
                let ts = props.last_modified;
                tile.timestamp =
                    DateTime::<Utc>::from_timestamp(ts.unix_timestamp(), ts.nanosecond());
                Ok(true)
            }
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(TileError::cache(format!("azure head: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graticule_core::GridOrigin;

    #[test]
    fn test_tile_key() {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        let store = AzureStore::new(
            AzureConfig {
                account: "acct".to_string(),
                container: "tiles".to_string(),
                access_key: "a2V5".to_string(),
                base_path: "caches/osm/webmercator".to_string(),
                layout: DirectoryLayout::ReverseTms,
            },
            grid,
            ImageOptions::default(),
        );
        // SW row 2 at level 2 is row 1 from the north.
        let key = store.tile_key(TileCoord::new(2, 3, 2)).unwrap();
        assert_eq!(key, "caches/osm/webmercator/2/3/1.png");
    }
}
