//! Renderd client.
//!
//! Talks to an external tile-creator service over JSON/HTTP. The manager
//! can delegate meta-tile rendering to renderd; after a successful request
//! the tiles are expected to be in the shared cache.

use graticule_core::TileCoord;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::client::HttpClient;
use crate::error::{Result, TileError};

/// Priority for tiles requested on demand by a waiting client.
pub const PRIORITY_ON_DEMAND: u32 = 100;
/// Priority for tiles requested by the seeder.
pub const PRIORITY_SEED: u32 = 10;

/// Stable task id for a tile render request. Identical across processes so
/// renderd can coalesce duplicate requests.
pub fn task_id(cache_identifier: &str, coord: TileCoord) -> String {
    let mut hasher = Sha1::new();
    hasher.update(cache_identifier.as_bytes());
    hasher.update(b":");
    hasher.update(format!("{}/{}/{}", coord.z, coord.x, coord.y).as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize)]
struct RenderdRequest<'a> {
    command: &'a str,
    id: String,
    tiles: Vec<[u32; 3]>,
    cache_identifier: &'a str,
    priority: u32,
}

#[derive(Debug, Deserialize)]
struct RenderdResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

/// Client for one renderd endpoint.
pub struct RenderdClient {
    client: HttpClient,
    address: String,
    priority: u32,
}

impl RenderdClient {
    pub fn new(client: HttpClient, address: impl Into<String>, priority: u32) -> Self {
        Self {
            client,
            address: address.into(),
            priority,
        }
    }

    /// Ask renderd to render `coords` into the cache identified by
    /// `cache_identifier`. Blocks until renderd confirms.
    pub async fn request_tiles(
        &self,
        cache_identifier: &str,
        coords: &[TileCoord],
    ) -> Result<()> {
        let Some(first) = coords.first() else {
            return Ok(());
        };
        let request = RenderdRequest {
            command: "tile",
            id: task_id(cache_identifier, *first),
            tiles: coords.iter().map(|c| [c.x, c.y, c.z as u32]).collect(),
            cache_identifier,
            priority: self.priority,
        };
        debug!(id = %request.id, tiles = coords.len(), "renderd request");

        let body = serde_json::to_value(&request)?;
        let response = self.client.post_json(&self.address, &body).await?;
        let response: RenderdResponse = serde_json::from_value(response)?;
        if response.status != "ok" {
            return Err(TileError::Renderd(
                response
                    .error_message
                    .unwrap_or_else(|| "unknown renderd error".to_string()),
            ));
        }
        Ok(())
    }
}
