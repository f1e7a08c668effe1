//! MapServer CGI source adapter.
//!
//! Runs the `mapserv` binary per request with the WMS query in
//! `QUERY_STRING`, the way MapServer expects to be driven as a CGI program,
//! and parses the CGI response (headers, blank line, image body).

use async_trait::async_trait;
use graticule_core::{Coverage, ResolutionRange, Srs};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;
use url::form_urlencoded;

use crate::error::{Result, TileError};
use crate::image::{TileFormat, TileImage};
use crate::source::{MapResult, Source, SourceQuery};

/// MapServer source configuration
#[derive(Debug, Clone)]
pub struct MapServerSourceConfig {
    /// Path to the `mapserv` executable
    pub binary: PathBuf,
    /// Mapfile passed via `MS_MAPFILE`
    pub mapfile: PathBuf,
    /// Working directory for the CGI process
    pub working_dir: Option<PathBuf>,
    /// Mapfile layer names
    pub layers: Vec<String>,
    pub transparent: bool,
    pub supported_srs: Vec<Srs>,
    pub seed_only: bool,
}

impl Default for MapServerSourceConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mapserv"),
            mapfile: PathBuf::new(),
            working_dir: None,
            layers: Vec::new(),
            transparent: true,
            supported_srs: Vec::new(),
            seed_only: false,
        }
    }
}

/// MapServer CGI adapter.
pub struct MapServerSource {
    config: MapServerSourceConfig,
    coverage: Option<Coverage>,
    res_range: Option<ResolutionRange>,
}

impl MapServerSource {
    pub fn new(config: MapServerSourceConfig) -> Self {
        Self {
            config,
            coverage: None,
            res_range: None,
        }
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn with_res_range(mut self, res_range: ResolutionRange) -> Self {
        self.res_range = Some(res_range);
        self
    }

    fn query_string(&self, query: &SourceQuery) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("SERVICE", "WMS")
            .append_pair("REQUEST", "GetMap")
            .append_pair("VERSION", "1.1.1")
            .append_pair("LAYERS", &self.config.layers.join(","))
            .append_pair("STYLES", "")
            .append_pair("FORMAT", query.format.mime_type())
            .append_pair(
                "TRANSPARENT",
                if self.config.transparent { "true" } else { "false" },
            )
            .append_pair("WIDTH", &query.size.0.to_string())
            .append_pair("HEIGHT", &query.size.1.to_string())
            .append_pair("SRS", &query.srs.to_string())
            .append_pair("BBOX", &query.bbox.to_string())
            .finish()
    }

    /// Split a CGI response into headers and body.
    fn parse_cgi_output(output: &[u8]) -> Result<(String, &[u8])> {
        for separator in [&b"\r\n\r\n"[..], &b"\n\n"[..]] {
            if let Some(pos) = output
                .windows(separator.len())
                .position(|window| window == separator)
            {
                let headers = String::from_utf8_lossy(&output[..pos]).into_owned();
                return Ok((headers, &output[pos + separator.len()..]));
            }
        }
        Err(TileError::SourceResponse(
            "mapserv produced no CGI header block".to_string(),
        ))
    }
}

#[async_trait]
impl Source for MapServerSource {
    async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
        if !self.supports_srs(query.srs) {
            return Err(TileError::Unsupported(format!(
                "mapserver source does not serve {}",
                query.srs
            )));
        }
        let query_string = self.query_string(query);
        debug!(%query_string, "mapserv request");

        let mut command = Command::new(&self.config.binary);
        command
            .env("QUERY_STRING", &query_string)
            .env("REQUEST_METHOD", "GET")
            .env("MS_MAPFILE", &self.config.mapfile)
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| TileError::SourceResponse(format!("mapserv spawn: {}", e)))?;
        if !output.status.success() {
            return Err(TileError::SourceResponse(format!(
                "mapserv exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let (headers, body) = Self::parse_cgi_output(&output.stdout)?;
        if !headers.to_ascii_lowercase().contains("content-type: image/") {
            return Err(TileError::SourceResponse(format!(
                "mapserv error: {}",
                String::from_utf8_lossy(&body[..body.len().min(200)])
            )));
        }
        Ok(MapResult::new(TileImage::from_bytes(body)?))
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
