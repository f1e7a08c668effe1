//! ArcGIS REST source adapter.
//!
//! Talks to MapServer/ImageServer `export` endpoints with `f=image`, which
//! answers with the rendered image directly.

use async_trait::async_trait;
use graticule_core::{Coverage, ResolutionRange, Srs};
use tracing::debug;
use url::Url;

use crate::client::{HttpClient, HttpOptions};
use crate::error::{Result, TileError};
use crate::image::TileFormat;
use crate::source::{
    decode_image_response, HttpErrorHandler, MapResult, Source, SourceQuery,
};

/// ArcGIS REST source configuration
#[derive(Debug, Clone)]
pub struct ArcGisSourceConfig {
    /// Service URL ending in `/MapServer` or `/ImageServer`
    pub url: String,
    /// Visible layer ids, rendered as `show:<ids>`
    pub layers: Vec<String>,
    pub transparent: bool,
    pub supported_srs: Vec<Srs>,
    pub http: HttpOptions,
    pub seed_only: bool,
}

impl Default for ArcGisSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            layers: Vec::new(),
            transparent: true,
            supported_srs: Vec::new(),
            http: HttpOptions::default(),
            seed_only: false,
        }
    }
}

/// ArcGIS REST export adapter.
pub struct ArcGisSource {
    config: ArcGisSourceConfig,
    client: HttpClient,
    error_handler: HttpErrorHandler,
    coverage: Option<Coverage>,
    res_range: Option<ResolutionRange>,
}

impl ArcGisSource {
    pub fn new(config: ArcGisSourceConfig) -> Result<Self> {
        let client = HttpClient::new(&config.http)?;
        Ok(Self {
            config,
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

    fn export_format(format: TileFormat) -> &'static str {
        match format {
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpg",
            TileFormat::Tiff => "tiff",
        }
    }

    fn export_url(&self, query: &SourceQuery) -> Result<String> {
        let base = format!("{}/export", self.config.url.trim_end_matches('/'));
        let mut url = Url::parse(&base)
            .map_err(|e| TileError::config(format!("arcgis url {}: {}", base, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("f", "image")
                .append_pair("bbox", &query.bbox.to_string())
                .append_pair("bboxSR", &query.srs.code().to_string())
                .append_pair("imageSR", &query.srs.code().to_string())
                .append_pair("size", &format!("{},{}", query.size.0, query.size.1))
                .append_pair("format", Self::export_format(query.format))
                .append_pair(
                    "transparent",
                    if self.config.transparent { "true" } else { "false" },
                );
            if !self.config.layers.is_empty() {
                pairs.append_pair("layers", &format!("show:{}", self.config.layers.join(",")));
            }
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl Source for ArcGisSource {
    async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
        if !self.supports_srs(query.srs) {
            return Err(TileError::Unsupported(format!(
                "arcgis source does not serve {}",
                query.srs
            )));
        }
        let url = self.export_url(query)?;
        debug!(url, "arcgis request");
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
        &self.config.supported_srs
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
}
