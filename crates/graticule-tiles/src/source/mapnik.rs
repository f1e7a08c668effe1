//! Mapnik source adapter.
//!
//! Mapnik has no stable C ABI to link against here, so rendering is
//! delegated to an external render command (e.g. a thin mapnik CLI) that
//! takes the mapfile, extent, size, and SRS as arguments and writes the
//! encoded image to stdout.

use async_trait::async_trait;
use graticule_core::{Coverage, ResolutionRange, Srs};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, TileError};
use crate::image::{TileFormat, TileImage};
use crate::source::{MapResult, Source, SourceQuery};

/// Mapnik source configuration
#[derive(Debug, Clone)]
pub struct MapnikSourceConfig {
    /// Render command invoked per request
    pub command: PathBuf,
    /// Mapnik XML mapfile
    pub mapfile: PathBuf,
    pub supported_srs: Vec<Srs>,
    pub seed_only: bool,
}

/// Mapnik render-command adapter.
///
/// Invocation: `<command> <mapfile> --bbox <minx,miny,maxx,maxy>
/// --size <w>x<h> --srs <epsg> --format <png|jpeg|tiff>`, image on stdout.
pub struct MapnikSource {
    config: MapnikSourceConfig,
    coverage: Option<Coverage>,
    res_range: Option<ResolutionRange>,
}

impl MapnikSource {
    pub fn new(config: MapnikSourceConfig) -> Self {
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

    fn format_arg(format: TileFormat) -> &'static str {
        match format {
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpeg",
            TileFormat::Tiff => "tiff",
        }
    }
}

#[async_trait]
impl Source for MapnikSource {
    async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
        if !self.supports_srs(query.srs) {
            return Err(TileError::Unsupported(format!(
                "mapnik source does not serve {}",
                query.srs
            )));
        }
        debug!(mapfile = %self.config.mapfile.display(), "mapnik render");

        let output = Command::new(&self.config.command)
            .arg(&self.config.mapfile)
            .arg("--bbox")
            .arg(query.bbox.to_string())
            .arg("--size")
            .arg(format!("{}x{}", query.size.0, query.size.1))
            .arg("--srs")
            .arg(query.srs.to_string())
            .arg("--format")
            .arg(Self::format_arg(query.format))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TileError::SourceResponse(format!("mapnik spawn: {}", e)))?;

        if !output.status.success() {
            return Err(TileError::SourceResponse(format!(
                "mapnik render exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(MapResult::new(TileImage::from_bytes(&output.stdout)?))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_args() {
        assert_eq!(MapnikSource::format_arg(TileFormat::Png), "png");
        assert_eq!(MapnikSource::format_arg(TileFormat::Jpeg), "jpeg");
    }

    #[tokio::test]
    async fn test_missing_command_errors() {
        let source = MapnikSource::new(MapnikSourceConfig {
            command: PathBuf::from("/nonexistent/mapnik-render"),
            mapfile: PathBuf::from("map.xml"),
            supported_srs: Vec::new(),
            seed_only: false,
        });
        let query = SourceQuery {
            bbox: graticule_core::BBox::new(0.0, 0.0, 1.0, 1.0).unwrap(),
            size: (16, 16),
            srs: Srs::WEB_MERCATOR,
            format: TileFormat::Png,
        };
        let err = source.get_map(&query).await.unwrap_err();
        assert!(matches!(err, TileError::SourceResponse(_)));
    }
}
