//! Map layers over the tile cache.
//!
//! [`CacheMapLayer`] answers arbitrary (non-grid-aligned) map requests from
//! a tile manager by choosing a level, assembling the covering tiles onto a
//! canvas, and warping the canvas into the requested extent and SRS. The
//! conditional layers route requests to the best cache by SRS or hand them
//! past the cache entirely above a resolution threshold.

use async_trait::async_trait;
use graticule_core::{BBox, ResolutionRange, Srs, TileGrid};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, TileError};
use crate::image::{transform, ImageOptions, TileFormat, TileImage};
use crate::manager::TileManager;
use crate::source::{Source, SourceQuery};

/// An arbitrary map request: any bbox, any size, any known SRS.
#[derive(Debug, Clone)]
pub struct MapQuery {
    pub bbox: BBox,
    pub size: (u32, u32),
    pub srs: Srs,
    pub format: TileFormat,
}

impl MapQuery {
    /// Requested resolution in units per pixel.
    pub fn resolution(&self) -> f64 {
        self.bbox.resolution(self.size)
    }
}

/// Anything that can answer a map request with an image.
#[async_trait]
pub trait MapLayer: Send + Sync {
    async fn get_map(&self, query: &MapQuery) -> Result<TileImage>;

    fn res_range(&self) -> Option<&ResolutionRange> {
        None
    }
}

/// Serves map requests from a tile manager.
pub struct CacheMapLayer {
    manager: Arc<TileManager>,
    image_opts: ImageOptions,
    /// Hard cap on tiles touched by one request
    max_tile_limit: u64,
    /// How far a coarser level may be stretched before stepping deeper
    stretch_factor: f64,
    /// Give up (transparent) when only levels coarser than this remain
    max_shrink_factor: f64,
    res_range: Option<ResolutionRange>,
}

impl CacheMapLayer {
    pub fn new(manager: Arc<TileManager>, image_opts: ImageOptions) -> Self {
        Self {
            manager,
            image_opts,
            max_tile_limit: 500,
            stretch_factor: 1.15,
            max_shrink_factor: 4.0,
            res_range: None,
        }
    }

    pub fn with_max_tile_limit(mut self, limit: u64) -> Self {
        self.max_tile_limit = limit;
        self
    }

    pub fn with_stretch_factor(mut self, stretch: f64) -> Self {
        self.stretch_factor = stretch;
        self
    }

    pub fn with_max_shrink_factor(mut self, shrink: f64) -> Self {
        self.max_shrink_factor = shrink;
        self
    }

    pub fn with_res_range(mut self, res_range: ResolutionRange) -> Self {
        self.res_range = Some(res_range);
        self
    }

    pub fn manager(&self) -> &Arc<TileManager> {
        &self.manager
    }

    fn grid(&self) -> &Arc<TileGrid> {
        self.manager.grid()
    }

    fn transparent(&self, size: (u32, u32)) -> TileImage {
        TileImage::blank(size, &self.image_opts)
    }
}

#[async_trait]
impl MapLayer for CacheMapLayer {
    async fn get_map(&self, query: &MapQuery) -> Result<TileImage> {
        let grid = self.grid().clone();

        if let Some(range) = &self.res_range {
            if !range.contains(query.resolution()) {
                return Ok(self.transparent(query.size));
            }
        }

        // Work in the grid SRS from here on.
        let grid_bbox = query.srs.transform_bbox(&grid.srs(), &query.bbox)?;
        let grid_res = grid_bbox.resolution(query.size);

        let level = grid.closest_level(grid_res * self.stretch_factor);
        let level_res = grid.resolution(level)?;
        if level_res / grid_res > self.max_shrink_factor {
            debug!(level, "best level too coarse, returning transparent");
            return Ok(self.transparent(query.size));
        }

        // One extra pixel around the query so edge resampling has data.
        let expanded = grid_bbox.buffered(level_res);
        let range = match grid.tiles_for_bbox(&expanded, level) {
            Ok(range) => range,
            // Entirely outside the grid extent.
            Err(_) => return Ok(self.transparent(query.size)),
        };
        if range.len() > self.max_tile_limit {
            return Err(TileError::RequestTooLarge {
                tiles: range.len(),
                limit: self.max_tile_limit,
            });
        }

        let coords: Vec<_> = range.iter().collect();
        let tiles = self.manager.load_tile_coords(&coords, None, false).await?;

        // Paste the tiles onto one canvas covering the range.
        let (tw, th) = grid.tile_size();
        let (cols, rows) = range.size();
        let mut canvas = TileImage::transparent((cols * tw, rows * th));
        let mut canvas_bbox: Option<BBox> = None;
        for tile in &tiles {
            let bbox = grid.tile_bbox(tile.coord)?;
            canvas_bbox = Some(match canvas_bbox {
                None => bbox,
                Some(b) => BBox::from_corners(
                    (b.min_x.min(bbox.min_x), b.min_y.min(bbox.min_y)),
                    (b.max_x.max(bbox.max_x), b.max_y.max(bbox.max_y)),
                ),
            });
        }
        let Some(canvas_bbox) = canvas_bbox else {
            return Ok(self.transparent(query.size));
        };
        for tile in &tiles {
            let Some(image) = tile.to_image()? else { continue };
            let bbox = grid.tile_bbox(tile.coord)?;
            let px = ((bbox.min_x - canvas_bbox.min_x) / level_res).round() as u32;
            let py = ((canvas_bbox.max_y - bbox.max_y) / level_res).round() as u32;
            canvas.paste(&image, px, py);
        }

        // Reproject/resample into the request.
        transform::warp(
            &canvas,
            &canvas_bbox,
            grid.srs(),
            &query.bbox,
            query.srs,
            query.size,
            self.image_opts.resampling,
        )
    }

    fn res_range(&self) -> Option<&ResolutionRange> {
        self.res_range.as_ref()
    }
}

/// Serves map requests straight from a source, bypassing any cache.
pub struct DirectMapLayer {
    source: Arc<dyn Source>,
}

impl DirectMapLayer {
    pub fn new(source: Arc<dyn Source>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl MapLayer for DirectMapLayer {
    async fn get_map(&self, query: &MapQuery) -> Result<TileImage> {
        let result = self
            .source
            .get_map(&SourceQuery {
                bbox: query.bbox,
                size: query.size,
                srs: query.srs,
                format: query.format,
            })
            .await?;
        Ok(result.image)
    }
}

/// Routes each request to the cache whose SRS fits best.
pub struct SrsConditional {
    layers: Vec<(Arc<dyn MapLayer>, Vec<Srs>)>,
    /// Explicit preference: request SRS to ordered candidate SRS
    preferred: HashMap<Srs, Vec<Srs>>,
}

impl SrsConditional {
    pub fn new(layers: Vec<(Arc<dyn MapLayer>, Vec<Srs>)>) -> Self {
        Self {
            layers,
            preferred: HashMap::new(),
        }
    }

    pub fn with_preferred(mut self, preferred: HashMap<Srs, Vec<Srs>>) -> Self {
        self.preferred = preferred;
        self
    }

    /// Pick the layer for a request SRS: exact match, then the preference
    /// table, then any layer of the same kind (geographic/projected), then
    /// the first layer.
    pub fn select(&self, srs: Srs) -> &Arc<dyn MapLayer> {
        for (layer, supported) in &self.layers {
            if supported.iter().any(|s| s.is_equivalent(&srs)) {
                return layer;
            }
        }
        if let Some(candidates) = self.preferred.get(&srs) {
            for candidate in candidates {
                for (layer, supported) in &self.layers {
                    if supported.iter().any(|s| s.is_equivalent(candidate)) {
                        return layer;
                    }
                }
            }
        }
        for (layer, supported) in &self.layers {
            if supported.iter().any(|s| s.is_geographic() == srs.is_geographic()) {
                return layer;
            }
        }
        &self.layers[0].0
    }
}

#[async_trait]
impl MapLayer for SrsConditional {
    async fn get_map(&self, query: &MapQuery) -> Result<TileImage> {
        self.select(query.srs).get_map(query).await
    }
}

/// Routes past the cache to a direct source at high zoom, where caching is
/// uneconomical. Requests finer than `threshold_res` (in `srs` units per
/// pixel) bypass the cache.
pub struct ResolutionConditional {
    cache: Arc<dyn MapLayer>,
    direct: Arc<dyn MapLayer>,
    threshold_res: f64,
    srs: Srs,
}

impl ResolutionConditional {
    pub fn new(
        cache: Arc<dyn MapLayer>,
        direct: Arc<dyn MapLayer>,
        threshold_res: f64,
        srs: Srs,
    ) -> Self {
        Self {
            cache,
            direct,
            threshold_res,
            srs,
        }
    }

    fn uses_direct(&self, query: &MapQuery) -> Result<bool> {
        let bbox = query.srs.transform_bbox(&self.srs, &query.bbox)?;
        let res = bbox.resolution(query.size);
        Ok(res < self.threshold_res)
    }
}

#[async_trait]
impl MapLayer for ResolutionConditional {
    async fn get_map(&self, query: &MapQuery) -> Result<TileImage> {
        if self.uses_direct(query)? {
            debug!("resolution below threshold, bypassing cache");
            self.direct.get_map(query).await
        } else {
            self.cache.get_map(query).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DirectoryLayout, FileStore};
    use crate::lock::DummyLocker;
    use crate::manager::TileManagerConfig;
    use crate::source::MapResult;
    use graticule_core::GridOrigin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct SolidSource([u8; 4]);

    #[async_trait]
    impl Source for SolidSource {
        async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
            Ok(MapResult::new(TileImage::solid(query.size, self.0)))
        }
    }

    fn cache_layer(dir: &TempDir) -> CacheMapLayer {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        let store = Arc::new(FileStore::new(
            dir.path().join("cache"),
            DirectoryLayout::Tc,
            grid.clone(),
            ImageOptions::default(),
        ));
        let manager = Arc::new(TileManager::new(
            "test_cache_webmercator",
            grid,
            store,
            Arc::new(DummyLocker),
            vec![Arc::new(SolidSource([80, 90, 100, 255])) as Arc<dyn Source>],
            ImageOptions::default(),
            TileManagerConfig {
                meta_size: (2, 2),
                ..Default::default()
            },
        ));
        CacheMapLayer::new(manager, ImageOptions::default())
    }

    #[tokio::test]
    async fn test_unaligned_request_resamples_tiles() {
        let dir = TempDir::new().unwrap();
        let layer = cache_layer(&dir);
        // An off-grid bbox near the equator.
        let query = MapQuery {
            bbox: BBox::new(-1_234_567.0, -765_432.0, 1_111_111.0, 999_999.0).unwrap(),
            size: (300, 200),
            srs: Srs::WEB_MERCATOR_LEGACY,
            format: TileFormat::Png,
        };
        let image = layer.get_map(&query).await.unwrap();
        assert_eq!(image.size(), (300, 200));
        assert_eq!(image.single_color(), Some([80, 90, 100, 255]));
    }

    #[tokio::test]
    async fn test_cross_srs_request() {
        let dir = TempDir::new().unwrap();
        let layer = cache_layer(&dir);
        let query = MapQuery {
            bbox: BBox::new(-10.0, -10.0, 10.0, 10.0).unwrap(),
            size: (128, 128),
            srs: Srs::WGS84,
            format: TileFormat::Png,
        };
        let image = layer.get_map(&query).await.unwrap();
        assert_eq!(image.size(), (128, 128));
        assert_eq!(image.single_color(), Some([80, 90, 100, 255]));
    }

    #[tokio::test]
    async fn test_max_tile_limit() {
        let dir = TempDir::new().unwrap();
        let layer = cache_layer(&dir).with_max_tile_limit(4);
        // A huge request at a deep level touches far more than 4 tiles.
        let query = MapQuery {
            bbox: BBox::new(-20_000_000.0, -20_000_000.0, 20_000_000.0, 20_000_000.0).unwrap(),
            size: (4096, 4096),
            srs: Srs::WEB_MERCATOR_LEGACY,
            format: TileFormat::Png,
        };
        let err = layer.get_map(&query).await.unwrap_err();
        assert!(matches!(err, TileError::RequestTooLarge { limit: 4, .. }));
    }

    #[tokio::test]
    async fn test_res_range_returns_transparent() {
        let dir = TempDir::new().unwrap();
        let layer = cache_layer(&dir).with_res_range(ResolutionRange::new(Some(100.0), None));
        // Requested resolution is far coarser than min_res.
        let query = MapQuery {
            bbox: BBox::new(-20_000_000.0, -20_000_000.0, 20_000_000.0, 20_000_000.0).unwrap(),
            size: (256, 256),
            srs: Srs::WEB_MERCATOR_LEGACY,
            format: TileFormat::Png,
        };
        let image = layer.get_map(&query).await.unwrap();
        assert_eq!(image.single_color(), Some([0, 0, 0, 0]));
    }

    struct CountingLayer {
        calls: AtomicUsize,
        color: [u8; 4],
    }

    impl CountingLayer {
        fn new(color: [u8; 4]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                color,
            })
        }
    }

    #[async_trait]
    impl MapLayer for CountingLayer {
        async fn get_map(&self, query: &MapQuery) -> Result<TileImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TileImage::solid(query.size, self.color))
        }
    }

    #[test]
    fn test_srs_conditional_selection() {
        let mercator = CountingLayer::new([1, 0, 0, 255]);
        let geodetic = CountingLayer::new([2, 0, 0, 255]);
        let conditional = SrsConditional::new(vec![
            (mercator.clone() as Arc<dyn MapLayer>, vec![Srs::WEB_MERCATOR]),
            (geodetic.clone() as Arc<dyn MapLayer>, vec![Srs::WGS84]),
        ]);

        // Exact matches.
        assert!(Arc::ptr_eq(
            &(mercator.clone() as Arc<dyn MapLayer>),
            conditional.select(Srs::WEB_MERCATOR_LEGACY)
        ));
        assert!(Arc::ptr_eq(
            &(geodetic.clone() as Arc<dyn MapLayer>),
            conditional.select(Srs::WGS84)
        ));
        // Unknown geographic SRS prefers the geographic cache.
        assert!(Arc::ptr_eq(
            &(geodetic.clone() as Arc<dyn MapLayer>),
            conditional.select(Srs(4258))
        ));
        // Unknown projected SRS prefers the projected cache.
        assert!(Arc::ptr_eq(
            &(mercator.clone() as Arc<dyn MapLayer>),
            conditional.select(Srs(25832))
        ));
    }

    #[test]
    fn test_srs_conditional_preferred_table() {
        let a = CountingLayer::new([1, 0, 0, 255]);
        let b = CountingLayer::new([2, 0, 0, 255]);
        let mut preferred = HashMap::new();
        preferred.insert(Srs(25832), vec![Srs::WGS84]);
        let conditional = SrsConditional::new(vec![
            (a.clone() as Arc<dyn MapLayer>, vec![Srs::WEB_MERCATOR]),
            (b.clone() as Arc<dyn MapLayer>, vec![Srs::WGS84]),
        ])
        .with_preferred(preferred);

        assert!(Arc::ptr_eq(
            &(b as Arc<dyn MapLayer>),
            conditional.select(Srs(25832))
        ));
    }

    #[tokio::test]
    async fn test_resolution_conditional_routes() {
        let cache = CountingLayer::new([1, 0, 0, 255]);
        let direct = CountingLayer::new([2, 0, 0, 255]);
        let conditional = ResolutionConditional::new(
            cache.clone(),
            direct.clone(),
            10.0,
            Srs::WEB_MERCATOR,
        );

        // Coarse request (res 100): cached.
        let query = MapQuery {
            bbox: BBox::new(0.0, 0.0, 25_600.0, 25_600.0).unwrap(),
            size: (256, 256),
            srs: Srs::WEB_MERCATOR,
            format: TileFormat::Png,
        };
        conditional.get_map(&query).await.unwrap();
        assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 0);

        // Fine request (res 1): direct.
        let query = MapQuery {
            bbox: BBox::new(0.0, 0.0, 256.0, 256.0).unwrap(),
            size: (256, 256),
            srs: Srs::WEB_MERCATOR,
            format: TileFormat::Png,
        };
        conditional.get_map(&query).await.unwrap();
        assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
    }
}
