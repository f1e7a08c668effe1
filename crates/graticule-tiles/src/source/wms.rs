//! WMS source adapter.
//!
//! Encodes map queries as WMS GetMap GET requests (1.1.1 or 1.3.0,
//! including the 1.3.0 axis-order rules for geographic systems), optionally
//! throttled by a per-host semaphore. Upstream errors run through the
//! configured `on_error` table before they propagate.

use async_trait::async_trait;
use graticule_core::{BBox, Coverage, ResolutionRange, Srs};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::client::{HttpClient, HttpOptions};
use crate::error::{Result, TileError};
use crate::image::{transform, Resampling, TileFormat, TileImage};
use crate::lock::SemaphoreLocker;
use crate::source::{
    decode_image_response, HttpErrorHandler, InfoQuery, MapResult, Source, SourceQuery,
};

/// WMS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WmsVersion {
    V111,
    V130,
}

impl WmsVersion {
    fn as_str(&self) -> &'static str {
        match self {
            WmsVersion::V111 => "1.1.1",
            WmsVersion::V130 => "1.3.0",
        }
    }

    fn srs_param(&self) -> &'static str {
        match self {
            WmsVersion::V111 => "SRS",
            WmsVersion::V130 => "CRS",
        }
    }
}

/// WMS source configuration
#[derive(Debug, Clone)]
pub struct WmsSourceConfig {
    /// GetMap endpoint, extra query parameters are preserved
    pub url: String,
    /// Upstream layer names (a tagged source restricts these)
    pub layers: Vec<String>,
    pub styles: Option<String>,
    pub version: WmsVersion,
    pub transparent: bool,
    /// Reference systems the upstream accepts; empty means any
    pub supported_srs: Vec<Srs>,
    /// Formats the upstream accepts; empty means any
    pub supported_formats: Vec<TileFormat>,
    /// Concurrent request cap against this upstream
    pub concurrent_requests: Option<usize>,
    pub http: HttpOptions,
    pub seed_only: bool,
    /// Resampling used when answering in a non-native SRS
    pub resampling: Resampling,
}

impl Default for WmsSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            layers: Vec::new(),
            styles: None,
            version: WmsVersion::V111,
            transparent: true,
            supported_srs: Vec::new(),
            supported_formats: Vec::new(),
            concurrent_requests: None,
            http: HttpOptions::default(),
            seed_only: false,
            resampling: Resampling::Bilinear,
        }
    }
}

/// WMS source adapter.
pub struct WmsSource {
    config: WmsSourceConfig,
    client: HttpClient,
    error_handler: HttpErrorHandler,
    coverage: Option<Coverage>,
    res_range: Option<ResolutionRange>,
    semaphore: Option<Arc<SemaphoreLocker>>,
    host_key: String,
}

impl WmsSource {
    pub fn new(config: WmsSourceConfig) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| TileError::config(format!("wms url {}: {}", config.url, e)))?;
        let host_key = format!(
            "{:x}",
            md5::compute(url.host_str().unwrap_or("").as_bytes())
        );
        let client = HttpClient::new(&config.http)?;
        let semaphore = config.concurrent_requests.map(|permits| {
            Arc::new(SemaphoreLocker::new(
                permits,
                config.http.timeout.max(Duration::from_secs(1)),
            ))
        });
        Ok(Self {
            config,
            client,
            error_handler: HttpErrorHandler::default(),
            coverage: None,
            res_range: None,
            semaphore,
            host_key,
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

    /// Format a bbox per version and axis order.
    fn format_bbox(&self, bbox: &BBox, srs: Srs) -> String {
        if self.config.version == WmsVersion::V130 && srs.is_axis_order_ne() {
            format!("{},{},{},{}", bbox.min_y, bbox.min_x, bbox.max_y, bbox.max_x)
        } else {
            format!("{},{},{},{}", bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y)
        }
    }

    /// Build the GetMap URL for a query already in a supported SRS.
    fn map_url(&self, bbox: &BBox, size: (u32, u32), srs: Srs, format: TileFormat) -> Result<String> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| TileError::config(format!("wms url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("SERVICE", "WMS")
            .append_pair("REQUEST", "GetMap")
            .append_pair("VERSION", self.config.version.as_str())
            .append_pair("LAYERS", &self.config.layers.join(","))
            .append_pair("STYLES", self.config.styles.as_deref().unwrap_or(""))
            .append_pair("FORMAT", format.mime_type())
            .append_pair(
                "TRANSPARENT",
                if self.config.transparent { "true" } else { "false" },
            )
            .append_pair("WIDTH", &size.0.to_string())
            .append_pair("HEIGHT", &size.1.to_string())
            .append_pair(self.config.version.srs_param(), &srs.to_string())
            .append_pair("BBOX", &self.format_bbox(bbox, srs));
        Ok(url.to_string())
    }

    /// The SRS the upstream request is made in.
    fn request_srs(&self, query_srs: Srs) -> Srs {
        if self.supports_srs(query_srs) {
            query_srs
        } else {
            self.config.supported_srs[0]
        }
    }

    fn request_format(&self, query_format: TileFormat) -> TileFormat {
        let supported = &self.config.supported_formats;
        if supported.is_empty() || supported.contains(&query_format) {
            query_format
        } else {
            supported[0]
        }
    }

    async fn fetch_map(&self, url: &str, size: (u32, u32)) -> Result<MapResult> {
        let _permit = match &self.semaphore {
            Some(semaphore) => Some(semaphore.acquire_key(&self.host_key).await?),
            None => None,
        };
        debug!(url, "wms request");
        let response = self.client.get_raw(url).await?;
        if !response.is_success() {
            let snippet = String::from_utf8_lossy(
                &response.body[..response.body.len().min(200)],
            )
            .into_owned();
            return match self.error_handler.handle(response.status, size, snippet)? {
                Some(result) => Ok(result),
                // Unreachable: handle() errors when no rule matches.
                None => Err(TileError::SourceResponse("empty error response".into())),
            };
        }
        Ok(MapResult::new(decode_image_response(&response)?))
    }
}

#[async_trait]
impl Source for WmsSource {
    async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
        let req_srs = self.request_srs(query.srs);
        let req_format = self.request_format(query.format);

        if req_srs.is_equivalent(&query.srs) {
            let url = self.map_url(&query.bbox, query.size, req_srs, req_format)?;
            return self.fetch_map(&url, query.size).await;
        }

        // Answer in a supported SRS and warp back to the query.
        let src_bbox = query.srs.transform_bbox(&req_srs, &query.bbox)?;
        let url = self.map_url(&src_bbox, query.size, req_srs, req_format)?;
        let result = self.fetch_map(&url, query.size).await?;
        let warped = transform::warp(
            &result.image,
            &src_bbox,
            req_srs,
            &query.bbox,
            query.srs,
            query.size,
            self.config.resampling,
        )?;
        Ok(MapResult {
            image: warped,
            cacheable: result.cacheable,
        })
    }

    fn supported_srs(&self) -> &[Srs] {
        &self.config.supported_srs
    }

    fn supported_formats(&self) -> &[TileFormat] {
        &self.config.supported_formats
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

    async fn get_info(&self, query: &InfoQuery) -> Result<Option<String>> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| TileError::config(format!("wms url: {}", e)))?;
        let (x_param, y_param) = match self.config.version {
            WmsVersion::V111 => ("X", "Y"),
            WmsVersion::V130 => ("I", "J"),
        };
        url.query_pairs_mut()
            .append_pair("SERVICE", "WMS")
            .append_pair("REQUEST", "GetFeatureInfo")
            .append_pair("VERSION", self.config.version.as_str())
            .append_pair("LAYERS", &self.config.layers.join(","))
            .append_pair("QUERY_LAYERS", &self.config.layers.join(","))
            .append_pair("STYLES", "")
            .append_pair("INFO_FORMAT", &query.info_format)
            .append_pair("WIDTH", &query.size.0.to_string())
            .append_pair("HEIGHT", &query.size.1.to_string())
            .append_pair(self.config.version.srs_param(), &query.srs.to_string())
            .append_pair("BBOX", &self.format_bbox(&query.bbox, query.srs))
            .append_pair(x_param, &query.pos.0.to_string())
            .append_pair(y_param, &query.pos.1.to_string());

        let response = self.client.get_bytes(url.as_str()).await?;
        Ok(Some(String::from_utf8_lossy(&response.body).into_owned()))
    }

    async fn get_legend(&self, format: TileFormat) -> Result<Option<TileImage>> {
        let Some(layer) = self.config.layers.first() else {
            return Ok(None);
        };
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| TileError::config(format!("wms url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("SERVICE", "WMS")
            .append_pair("REQUEST", "GetLegendGraphic")
            .append_pair("VERSION", self.config.version.as_str())
            .append_pair("LAYER", layer)
            .append_pair("FORMAT", format.mime_type());
        let response = self.client.get_bytes(url.as_str()).await?;
        Ok(Some(decode_image_response(&response)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(version: WmsVersion, layers: &[&str]) -> WmsSource {
        WmsSource::new(WmsSourceConfig {
            url: "http://example.org/service?map=test".to_string(),
            layers: layers.iter().map(|s| s.to_string()).collect(),
            version,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_map_url_111() {
        let source = source(WmsVersion::V111, &["base", "roads"]);
        let bbox = BBox::new(-20037508.3428, -20037508.3428, 0.0, 0.0).unwrap();
        let url = source
            .map_url(&bbox, (512, 512), Srs(900913), TileFormat::Jpeg)
            .unwrap();
        assert!(url.contains("map=test"));
        assert!(url.contains("LAYERS=base%2Croads"));
        assert!(url.contains("SRS=EPSG%3A900913"));
        assert!(url.contains("WIDTH=512"));
        assert!(url.contains("BBOX=-20037508.3428%2C-20037508.3428%2C0%2C0"));
    }

    #[test]
    fn test_130_geographic_axis_order() {
        let source = source(WmsVersion::V130, &["base"]);
        let bbox = BBox::new(-180.0, -90.0, 180.0, 90.0).unwrap();
        let url = source
            .map_url(&bbox, (256, 128), Srs::WGS84, TileFormat::Png)
            .unwrap();
        assert!(url.contains("CRS=EPSG%3A4326"));
        // Lat/lon order: -90,-180,90,180
        assert!(url.contains("BBOX=-90%2C-180%2C90%2C180"));
    }

    #[test]
    fn test_130_projected_keeps_xy_order() {
        let source = source(WmsVersion::V130, &["base"]);
        let bbox = BBox::new(1.0, 2.0, 3.0, 4.0).unwrap();
        let url = source
            .map_url(&bbox, (256, 256), Srs::WEB_MERCATOR, TileFormat::Png)
            .unwrap();
        assert!(url.contains("BBOX=1%2C2%2C3%2C4"));
    }

    #[test]
    fn test_request_srs_falls_back_to_supported() {
        let mut config = WmsSourceConfig {
            url: "http://example.org/service".to_string(),
            layers: vec!["base".to_string()],
            ..Default::default()
        };
        config.supported_srs = vec![Srs::WGS84];
        let source = WmsSource::new(config).unwrap();
        assert_eq!(source.request_srs(Srs::WEB_MERCATOR), Srs::WGS84);
        assert_eq!(source.request_srs(Srs::WGS84), Srs::WGS84);
    }
}
