//! CouchDB cache backend.
//!
//! One document per tile, id `<z>-<x>-<y>`, with the encoded tile as an
//! inline `tile` attachment and the store timestamp in the document body.
//! Conflicting writes fetch the current revision and retry once; the last
//! writer wins, which is fine under the single-writer lock the manager
//! holds during renders.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use graticule_core::TileCoord;
use reqwest::StatusCode;

use crate::cache::{reject_dimensions, Dimensions, TileStore};
use crate::error::{Result, TileError};
use crate::image::{ImageOptions, TileFormat};
use crate::tile::{Tile, TileData};

/// CouchDB tile store.
pub struct CouchDbStore {
    client: reqwest::Client,
    /// Database URL, e.g. `http://127.0.0.1:5984/osm_tiles`
    db_url: String,
    format: TileFormat,
    image_opts: ImageOptions,
    lock_cache_id: String,
}

impl CouchDbStore {
    pub fn new(client: reqwest::Client, db_url: impl Into<String>, image_opts: ImageOptions) -> Self {
        let db_url = db_url.into().trim_end_matches('/').to_string();
        let lock_cache_id = format!("{:x}", md5::compute(db_url.as_bytes()));
        let format = image_opts.format;
        Self {
            client,
            db_url,
            format,
            image_opts,
            lock_cache_id,
        }
    }

    /// Create the database if it does not exist yet.
    pub async fn ensure_db(&self) -> Result<()> {
        let resp = self
            .client
            .put(&self.db_url)
            .send()
            .await
            .map_err(|e| TileError::cache(format!("couchdb create db: {}", e)))?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::PRECONDITION_FAILED => Ok(()),
            status => Err(TileError::cache(format!(
                "couchdb create db: unexpected status {}",
                status
            ))),
        }
    }

    fn doc_url(&self, coord: TileCoord) -> String {
        format!("{}/{}-{}-{}", self.db_url, coord.z, coord.x, coord.y)
    }

    async fn current_rev(&self, coord: TileCoord) -> Result<Option<String>> {
        let resp = self
            .client
            .get(self.doc_url(coord))
            .send()
            .await
            .map_err(|e| TileError::cache(format!("couchdb get doc: {}", e)))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TileError::cache(format!("couchdb doc body: {}", e)))?;
        Ok(doc.get("_rev").and_then(|r| r.as_str()).map(String::from))
    }

    async fn put_doc(&self, coord: TileCoord, doc: &serde_json::Value, rev: Option<&str>) -> Result<StatusCode> {
        let mut request = self.client.put(self.doc_url(coord)).json(doc);
        if let Some(rev) = rev {
            request = request.query(&[("rev", rev)]);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| TileError::cache(format!("couchdb put: {}", e)))?;
        Ok(resp.status())
    }
}

#[async_trait]
impl TileStore for CouchDbStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("couchdb", dimensions)?;
        if with_metadata {
            self.load_tile_metadata(tile, None).await?;
        }
        let resp = self
            .client
            .get(format!("{}/tile", self.doc_url(tile.coord)))
            .send()
            .await
            .map_err(|e| TileError::cache(format!("couchdb get tile: {}", e)))?;
        match resp.status() {
            StatusCode::OK => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| TileError::cache(format!("couchdb body: {}", e)))?;
                tile.size = Some(bytes.len() as u64);
                tile.data = Some(TileData::Encoded {
                    bytes,
                    format: self.format,
                });
                Ok(true)
            }
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(TileError::cache(format!(
                "couchdb get tile: unexpected status {}",
                status
            ))),
        }
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("couchdb", dimensions)?;
        let bytes = tile.to_buffer(&self.image_opts)?;
        let doc = serde_json::json!({
            "timestamp": Utc::now().timestamp(),
            "_attachments": {
                "tile": {
                    "content_type": self.format.mime_type(),
                    "data": BASE64.encode(&bytes),
                }
            }
        });

        match self.put_doc(tile.coord, &doc, None).await? {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => {
                let rev = self.current_rev(tile.coord).await?;
                match self.put_doc(tile.coord, &doc, rev.as_deref()).await? {
                    StatusCode::CREATED | StatusCode::OK => Ok(()),
                    status => Err(TileError::cache(format!(
                        "couchdb store: unexpected status {}",
                        status
                    ))),
                }
            }
            status => Err(TileError::cache(format!(
                "couchdb store: unexpected status {}",
                status
            ))),
        }
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("couchdb", dimensions)?;
        let Some(rev) = self.current_rev(coord).await? else {
            return Ok(());
        };
        let resp = self
            .client
            .delete(self.doc_url(coord))
            .query(&[("rev", rev.as_str())])
            .send()
            .await
            .map_err(|e| TileError::cache(format!("couchdb delete: {}", e)))?;
        match resp.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(TileError::cache(format!(
                "couchdb delete: unexpected status {}",
                status
            ))),
        }
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("couchdb", dimensions)?;
        let resp = self
            .client
            .get(self.doc_url(tile.coord))
            .send()
            .await
            .map_err(|e| TileError::cache(format!("couchdb get doc: {}", e)))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let doc: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TileError::cache(format!("couchdb doc body: {}", e)))?;
        if let Some(ts) = doc.get("timestamp").and_then(|t| t.as_i64()) {
            tile.timestamp = DateTime::<Utc>::from_timestamp(ts, 0);
        }
        tile.size = doc
            .pointer("/_attachments/tile/length")
            .and_then(|l| l.as_u64());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_url() {
        let store = CouchDbStore::new(
            reqwest::Client::new(),
            "http://127.0.0.1:5984/osm_tiles/",
            ImageOptions::default(),
        );
        assert_eq!(
            store.doc_url(TileCoord::new(3, 1, 2)),
            "http://127.0.0.1:5984/osm_tiles/3-1-2"
        );
    }
}
