//! Upstream source adapters.
//!
//! A source produces a georeferenced image for an arbitrary bbox and pixel
//! size. Adapters advertise which reference systems and formats they speak;
//! the manager and the conditional layers pick sources accordingly.

pub mod arcgis;
pub mod cached;
pub mod mapnik;
pub mod mapserver;
pub mod tile;
pub mod wms;

pub use arcgis::ArcGisSource;
pub use tile::TiledSource;
pub use wms::WmsSource;

use async_trait::async_trait;
use graticule_core::{BBox, Coverage, ResolutionRange, Srs};
use std::collections::HashMap;

use crate::client::HttpResponse;
use crate::error::{Result, TileError};
use crate::image::{TileFormat, TileImage};

/// One map request against a source.
#[derive(Debug, Clone)]
pub struct SourceQuery {
    pub bbox: BBox,
    pub size: (u32, u32),
    pub srs: Srs,
    pub format: TileFormat,
}

/// Feature-info request at a pixel position within a map query.
#[derive(Debug, Clone)]
pub struct InfoQuery {
    pub bbox: BBox,
    pub size: (u32, u32),
    pub srs: Srs,
    /// Query position in pixels from the north-west corner
    pub pos: (u32, u32),
    pub info_format: String,
}

/// Result of a map request.
#[derive(Debug)]
pub struct MapResult {
    pub image: TileImage,
    /// False for synthesized error responses that must not be persisted
    pub cacheable: bool,
}

impl MapResult {
    pub fn new(image: TileImage) -> Self {
        Self { image, cacheable: true }
    }
}

/// An upstream producer of map imagery.
#[async_trait]
pub trait Source: Send + Sync {
    /// Render the query. Implementations may answer in a supported SRS and
    /// warp, or refuse with [`TileError::Unsupported`].
    async fn get_map(&self, query: &SourceQuery) -> Result<MapResult>;

    /// Reference systems this source answers natively; empty means any.
    fn supported_srs(&self) -> &[Srs] {
        &[]
    }

    fn supports_srs(&self, srs: Srs) -> bool {
        let supported = self.supported_srs();
        supported.is_empty() || supported.iter().any(|s| s.is_equivalent(&srs))
    }

    /// Formats this source can deliver; empty means any.
    fn supported_formats(&self) -> &[TileFormat] {
        &[]
    }

    /// Mask limiting where this source has data.
    fn coverage(&self) -> Option<&Coverage> {
        None
    }

    /// Resolution window this source answers for.
    fn res_range(&self) -> Option<&ResolutionRange> {
        None
    }

    /// Excluded from on-demand rendering; only the seeder may call it.
    fn is_seed_only(&self) -> bool {
        false
    }

    /// Whether the source serves pre-cut tiles (enables bulk meta mode).
    fn is_tiled(&self) -> bool {
        false
    }

    /// Feature info lookup; absent on most sources.
    async fn get_info(&self, _query: &InfoQuery) -> Result<Option<String>> {
        Ok(None)
    }

    /// Legend image; absent on most sources.
    async fn get_legend(&self, _format: TileFormat) -> Result<Option<TileImage>> {
        Ok(None)
    }
}

/// Synthetic response for one upstream status code.
#[derive(Debug, Clone)]
pub struct ErrorRule {
    /// Fill color; `None` renders transparent
    pub color: Option<[u8; 4]>,
    /// Whether the synthetic tile may be cached
    pub cacheable: bool,
    /// Whether a stale cached tile may be served instead
    pub authorize_stale: bool,
}

/// Maps upstream HTTP status codes to synthetic responses. Codes without a
/// rule propagate as errors.
#[derive(Debug, Clone, Default)]
pub struct HttpErrorHandler {
    rules: HashMap<u16, ErrorRule>,
    other: Option<ErrorRule>,
}

impl HttpErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(mut self, status: u16, rule: ErrorRule) -> Self {
        self.rules.insert(status, rule);
        self
    }

    /// Fallback for any unmapped status code.
    pub fn with_other(mut self, rule: ErrorRule) -> Self {
        self.other = Some(rule);
        self
    }

    pub fn lookup(&self, status: u16) -> Option<&ErrorRule> {
        self.rules.get(&status).or(self.other.as_ref())
    }

    /// Apply the table to a failed response. `Ok(Some(..))` is a synthetic
    /// tile, `Err` propagates, honoring `authorize_stale` by keeping the
    /// error retryable.
    pub fn handle(
        &self,
        status: u16,
        size: (u32, u32),
        message: String,
    ) -> Result<Option<MapResult>> {
        match self.lookup(status) {
            Some(rule) => {
                let image = match rule.color {
                    Some(color) => TileImage::solid(size, color),
                    None => TileImage::transparent(size),
                };
                Ok(Some(MapResult {
                    image,
                    cacheable: rule.cacheable,
                }))
            }
            None => Err(TileError::SourceHttp { status, message }),
        }
    }
}

/// Decode an image body, rejecting non-image payloads (e.g. an XML service
/// exception served with status 200).
pub(crate) fn decode_image_response(response: &HttpResponse) -> Result<TileImage> {
    if let Some(content_type) = &response.content_type {
        if !content_type.starts_with("image/") {
            let snippet =
                String::from_utf8_lossy(&response.body[..response.body.len().min(200)]);
            return Err(TileError::SourceResponse(format!(
                "expected image, got {}: {}",
                content_type, snippet
            )));
        }
    }
    TileImage::from_bytes(&response.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_error_handler_synthesizes() {
        let handler = HttpErrorHandler::new().add_rule(
            404,
            ErrorRule {
                color: None,
                cacheable: true,
                authorize_stale: false,
            },
        );
        let result = handler.handle(404, (4, 4), "not found".into()).unwrap();
        let result = result.unwrap();
        assert!(result.cacheable);
        assert_eq!(result.image.single_color(), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_error_handler_propagates_unmapped() {
        let handler = HttpErrorHandler::new();
        let err = handler.handle(500, (4, 4), "boom".into()).unwrap_err();
        assert!(matches!(err, TileError::SourceHttp { status: 500, .. }));
    }

    #[test]
    fn test_error_handler_other_fallback() {
        let handler = HttpErrorHandler::new().with_other(ErrorRule {
            color: Some([255, 0, 0, 255]),
            cacheable: false,
            authorize_stale: true,
        });
        let result = handler.handle(503, (2, 2), "".into()).unwrap().unwrap();
        assert!(!result.cacheable);
        assert_eq!(result.image.single_color(), Some([255, 0, 0, 255]));
    }

    #[test]
    fn test_decode_rejects_xml_with_200() {
        let response = HttpResponse {
            status: 200,
            content_type: Some("application/vnd.ogc.se_xml".to_string()),
            body: Bytes::from_static(b"<ServiceException>boom</ServiceException>"),
        };
        assert!(decode_image_response(&response).is_err());
    }
}
