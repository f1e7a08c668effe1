//! Tile service source adapter.
//!
//! Fetches pre-cut tiles from an upstream tile server via a URL template.
//! Only grid-aligned single-tile queries are answered; anything else is the
//! job of a cache layer on top.

use async_trait::async_trait;
use graticule_core::{Coverage, GridOrigin, ResolutionRange, Srs, TileCoord, TileGrid};
use std::sync::Arc;
use tracing::debug;

use crate::client::{HttpClient, HttpOptions};
use crate::error::{Result, TileError};
use crate::image::TileFormat;
use crate::source::{
    decode_image_response, HttpErrorHandler, MapResult, Source, SourceQuery,
};

/// Tile source configuration
#[derive(Debug, Clone)]
pub struct TiledSourceConfig {
    /// URL template with `{z}`, `{x}`, `{y}` (grid rows), `{tms_y}` (rows
    /// from the south), `{xyz_y}` (rows from the north), or `{quadkey}`
    pub url_template: String,
    pub format: TileFormat,
    pub http: HttpOptions,
    pub seed_only: bool,
}

/// Upstream tile service bound to one grid.
pub struct TiledSource {
    config: TiledSourceConfig,
    grid: Arc<TileGrid>,
    srs: [Srs; 1],
    client: HttpClient,
    error_handler: HttpErrorHandler,
    coverage: Option<Coverage>,
    res_range: Option<ResolutionRange>,
}

impl TiledSource {
    pub fn new(config: TiledSourceConfig, grid: Arc<TileGrid>) -> Result<Self> {
        let client = HttpClient::new(&config.http)?;
        let srs = [grid.srs()];
        Ok(Self {
            config,
            grid,
            srs,
            client,
            error_handler: HttpErrorHandler::default(),
            coverage: None,
            res_range: None,
        })
    }

    pub fn with_error_handler(mut self, handler: HttpErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn with_res_range(mut self, res_range: ResolutionRange) -> Self {
        self.res_range = Some(res_range);
        self
    }

    pub fn grid(&self) -> &Arc<TileGrid> {
        &self.grid
    }

    /// Expand the URL template for one tile.
    pub fn tile_url(&self, coord: TileCoord) -> Result<String> {
        let south = match self.grid.origin() {
            GridOrigin::SouthWest => coord.y,
            GridOrigin::NorthWest => self.grid.flip_y(coord)?.y,
        };
        let north = match self.grid.origin() {
            GridOrigin::NorthWest => coord.y,
            GridOrigin::SouthWest => self.grid.flip_y(coord)?.y,
        };
        let quadkey = TileCoord::new(coord.z, coord.x, north).to_quadkey();
        Ok(self
            .config
            .url_template
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string())
            .replace("{tms_y}", &south.to_string())
            .replace("{xyz_y}", &north.to_string())
            .replace("{quadkey}", &quadkey))
    }

    /// Map a query back to the single grid tile it must cover.
    fn query_coord(&self, query: &SourceQuery) -> Result<TileCoord> {
        let res = query.bbox.resolution(query.size);
        let z = self.grid.closest_level(res);
        let range = self.grid.tiles_for_bbox(&query.bbox, z)?;
        if range.len() != 1 {
            return Err(TileError::Unsupported(format!(
                "tile source needs grid-aligned queries, got {} tiles",
                range.len()
            )));
        }
        let coord = TileCoord::new(z, range.x0, range.y0);
        let tile_bbox = self.grid.tile_bbox(coord)?;
        if !tile_bbox.approx_eq(&query.bbox, 1e-6) {
            return Err(TileError::Unsupported(
                "tile source needs grid-aligned queries".to_string(),
            ));
        }
        Ok(coord)
    }
}

#[async_trait]
impl Source for TiledSource {
    async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
        if !query.srs.is_equivalent(&self.grid.srs()) {
            return Err(TileError::Unsupported(format!(
                "tile source serves {} only",
                self.grid.srs()
            )));
        }
        let coord = self.query_coord(query)?;
        let url = self.tile_url(coord)?;
        debug!(url, "tile request");

        let response = self.client.get_raw(&url).await?;
        if !response.is_success() {
            let snippet = String::from_utf8_lossy(
                &response.body[..response.body.len().min(200)],
            )
            .into_owned();
            return match self
                .error_handler
                .handle(response.status, query.size, snippet)?
            {
                Some(result) => Ok(result),
                None => Err(TileError::SourceResponse("empty error response".into())),
            };
        }
        Ok(MapResult::new(decode_image_response(&response)?))
    }

    fn supported_srs(&self) -> &[Srs] {
        &self.srs
    }

    fn coverage(&self) -> Option<&Coverage> {
        self.coverage.as_ref()
    }

    fn res_range(&self) -> Option<&ResolutionRange> {
        self.res_range.as_ref()
    }

    fn is_seed_only(&self) -> bool {
        self.config.seed_only
    }

    fn is_tiled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graticule_core::BBox;

    fn source(template: &str) -> TiledSource {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        TiledSource::new(
            TiledSourceConfig {
                url_template: template.to_string(),
                format: TileFormat::Png,
                http: HttpOptions::default(),
                seed_only: false,
            },
            grid,
        )
        .unwrap()
    }

    #[test]
    fn test_template_expansion() {
        let source = source("http://tiles.example.org/{z}/{x}/{y}.png");
        let url = source.tile_url(TileCoord::new(2, 1, 3)).unwrap();
        assert_eq!(url, "http://tiles.example.org/2/1/3.png");
    }

    #[test]
    fn test_xyz_row_flip() {
        let source = source("http://tiles.example.org/{z}/{x}/{xyz_y}.png");
        // SW row 3 at level 2 is row 0 from the north.
        let url = source.tile_url(TileCoord::new(2, 1, 3)).unwrap();
        assert_eq!(url, "http://tiles.example.org/2/1/0.png");
    }

    #[test]
    fn test_quadkey_template() {
        let source = source("http://tiles.example.org/{quadkey}.png");
        let url = source.tile_url(TileCoord::new(1, 0, 0)).unwrap();
        assert_eq!(url, "http://tiles.example.org/2.png");
    }

    #[test]
    fn test_query_must_be_aligned() {
        let source = source("http://tiles.example.org/{z}/{x}/{y}.png");
        let grid = source.grid().clone();
        let aligned = grid.tile_bbox(TileCoord::new(3, 2, 5)).unwrap();
        let query = SourceQuery {
            bbox: aligned,
            size: (256, 256),
            srs: grid.srs(),
            format: TileFormat::Png,
        };
        assert_eq!(source.query_coord(&query).unwrap(), TileCoord::new(3, 2, 5));

        let shifted = BBox::new(
            aligned.min_x + 10.0,
            aligned.min_y,
            aligned.max_x + 10.0,
            aligned.max_y,
        )
        .unwrap();
        let query = SourceQuery { bbox: shifted, ..query };
        assert!(source.query_coord(&query).is_err());
    }
}
