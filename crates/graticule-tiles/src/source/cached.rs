//! Cache-as-source.
//!
//! Lets one cache feed another: the wrapped cache layer answers arbitrary
//! map queries from its tile manager, so a stacking cache can treat it like
//! any other upstream. Reports itself as tiled, which lets the consuming
//! manager use bulk meta mode instead of oversized block requests.

use async_trait::async_trait;
use graticule_core::{Coverage, ResolutionRange, Srs};
use std::sync::Arc;

use crate::error::Result;
use crate::image::TileFormat;
use crate::layer::{CacheMapLayer, MapLayer, MapQuery};
use crate::source::{MapResult, Source, SourceQuery};

/// A cache exposed as a source for another cache.
pub struct CacheSource {
    layer: Arc<CacheMapLayer>,
    coverage: Option<Coverage>,
    res_range: Option<ResolutionRange>,
    seed_only: bool,
}

impl CacheSource {
    pub fn new(layer: Arc<CacheMapLayer>) -> Self {
        Self {
            layer,
            coverage: None,
            res_range: None,
            seed_only: false,
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

    pub fn seed_only(mut self, seed_only: bool) -> Self {
        self.seed_only = seed_only;
        self
    }

    /// Identifier of the manager feeding this source, for dependency
    /// validation.
    pub fn manager_identifier(&self) -> &str {
        self.layer.manager().identifier()
    }
}

#[async_trait]
impl Source for CacheSource {
    async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
        let image = self
            .layer
            .get_map(&MapQuery {
                bbox: query.bbox,
                size: query.size,
                srs: query.srs,
                format: query.format,
            })
            .await?;
        Ok(MapResult::new(image))
    }

    fn supported_srs(&self) -> &[Srs] {
        // The cache layer reprojects, so any known SRS works.
        &[]
    }

    fn coverage(&self) -> Option<&Coverage> {
        self.coverage.as_ref()
    }

    fn res_range(&self) -> Option<&ResolutionRange> {
        self.res_range.as_ref()
    }

    fn is_seed_only(&self) -> bool {
        self.seed_only
    }

    fn is_tiled(&self) -> bool {
        true
    }
}
