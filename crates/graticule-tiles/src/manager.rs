//! The tile manager.
//!
//! Orchestrates everything between a tile request and its bytes: cache
//! probes, freshness classification, rescaling from neighboring levels,
//! meta-tile batching, cross-process locking with post-acquire re-checks,
//! parallel source fan-out, band merging, splitting, filters, and the
//! batched write-back. One manager owns one cache backend, one locker, and
//! one source list for its lifetime.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::future;
use graticule_core::{MetaGrid, MetaTile, TileCoord, TileGrid};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{Dimensions, TileStore};
use crate::error::{Result, TileError};
use crate::image::{split::split_meta_tile, transform, BandMerger, ImageOptions, TileFilter, TileFormat, TileImage};
use crate::lock::Locker;
use crate::renderd::RenderdClient;
use crate::source::{Source, SourceQuery};
use crate::tile::Tile;

/// When a stored tile stops being fresh.
#[derive(Debug, Clone)]
pub enum RefreshPolicy {
    /// Tiles stored before this instant are stale
    Before(DateTime<Utc>),
    /// Tiles older than this age are stale
    Age(chrono::Duration),
    /// Tiles older than this file's mtime are stale
    MTime(PathBuf),
}

impl RefreshPolicy {
    /// The current cutoff; tiles stored before it are stale.
    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        match self {
            RefreshPolicy::Before(t) => Some(*t),
            RefreshPolicy::Age(age) => Some(Utc::now() - *age),
            RefreshPolicy::MTime(path) => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from),
        }
    }
}

/// Behavioral knobs of one manager, fixed at construction.
#[derive(Debug, Clone)]
pub struct TileManagerConfig {
    /// Meta-tile block size in tiles
    pub meta_size: (u32, u32),
    /// Render buffer around the block, in pixels
    pub meta_buffer: u32,
    /// Shrink meta-tiles to the missing coords instead of full blocks
    pub minimize_meta_requests: bool,
    /// Fetch child tiles individually when all sources are tiled
    pub bulk_meta_tiles: bool,
    /// Concurrent meta-tile renders within one request
    pub concurrent_tile_creators: usize,
    /// `> 0`: fill misses from `z + n` (downscale); `< 0`: from `z - n`
    /// (upscale); `0`: disabled
    pub rescale_tiles: i32,
    /// Persist rescaled tiles instead of treating them as ephemeral
    pub cache_rescaled_tiles: bool,
    /// Format requested from sources
    pub request_format: TileFormat,
    pub refresh_before: Option<RefreshPolicy>,
}

impl Default for TileManagerConfig {
    fn default() -> Self {
        Self {
            meta_size: (4, 4),
            meta_buffer: 0,
            minimize_meta_requests: false,
            bulk_meta_tiles: false,
            concurrent_tile_creators: 2,
            rescale_tiles: 0,
            cache_rescaled_tiles: false,
            request_format: TileFormat::Png,
            refresh_before: None,
        }
    }
}

/// Orchestrator for one cache+grid pair.
pub struct TileManager {
    identifier: String,
    grid: Arc<TileGrid>,
    store: Arc<dyn TileStore>,
    locker: Arc<dyn Locker>,
    sources: Vec<Arc<dyn Source>>,
    meta_grid: MetaGrid,
    image_opts: ImageOptions,
    filters: Vec<Arc<dyn TileFilter>>,
    band_merger: Option<BandMerger>,
    renderd: Option<RenderdClient>,
    config: TileManagerConfig,
}

impl std::fmt::Debug for TileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileManager")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

impl TileManager {
    pub fn new(
        identifier: impl Into<String>,
        grid: Arc<TileGrid>,
        store: Arc<dyn TileStore>,
        locker: Arc<dyn Locker>,
        sources: Vec<Arc<dyn Source>>,
        image_opts: ImageOptions,
        config: TileManagerConfig,
    ) -> Self {
        let meta_grid = MetaGrid::new(grid.clone(), config.meta_size, config.meta_buffer);
        Self {
            identifier: identifier.into(),
            grid,
            store,
            locker,
            sources,
            meta_grid,
            image_opts,
            filters: Vec::new(),
            band_merger: None,
            renderd: None,
            config,
        }
    }

    pub fn with_filters(mut self, filters: Vec<Arc<dyn TileFilter>>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_band_merger(mut self, merger: BandMerger) -> Self {
        self.band_merger = Some(merger);
        self
    }

    pub fn with_renderd(mut self, renderd: RenderdClient) -> Self {
        self.renderd = Some(renderd);
        self
    }

    /// `<cache_name>_<grid_name>`, stable across processes.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn grid(&self) -> &Arc<TileGrid> {
        &self.grid
    }

    pub fn store(&self) -> &Arc<dyn TileStore> {
        &self.store
    }

    pub fn image_opts(&self) -> &ImageOptions {
        &self.image_opts
    }

    pub fn config(&self) -> &TileManagerConfig {
        &self.config
    }

    /// The instant before which a stored tile counts as stale.
    pub fn expire_timestamp(&self, _tile: &Tile) -> Option<DateTime<Utc>> {
        self.config.refresh_before.as_ref().and_then(|p| p.cutoff())
    }

    pub async fn is_cached(
        &self,
        coord: TileCoord,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        if !self.grid.is_valid(coord) {
            return Ok(false);
        }
        self.store.is_cached(coord, dimensions).await
    }

    /// Run the pre-store filters over a tile.
    pub fn apply_tile_filters(&self, mut tile: Tile) -> Result<Tile> {
        for filter in &self.filters {
            tile = filter.apply(tile, &self.image_opts)?;
        }
        Ok(tile)
    }

    pub async fn load_tile_coord(
        &self,
        coord: TileCoord,
        dimensions: Option<&Dimensions>,
        with_metadata: bool,
    ) -> Result<Tile> {
        let mut tiles = self
            .load_tile_coords(&[coord], dimensions, with_metadata)
            .await?;
        Ok(tiles.remove(0))
    }

    /// Load tiles, rendering misses. Tiles come back in input order; tiles
    /// that could not be produced carry a payload of transparency and an
    /// error note rather than vanishing.
    pub async fn load_tile_coords(
        &self,
        coords: &[TileCoord],
        dimensions: Option<&Dimensions>,
        with_metadata: bool,
    ) -> Result<Vec<Tile>> {
        self.load_inner(coords, dimensions, with_metadata, true, true)
            .await
    }

    pub async fn remove_tile_coords(
        &self,
        coords: &[TileCoord],
        dimensions: Option<&Dimensions>,
    ) -> Result<()> {
        for &coord in coords {
            self.store.remove_tile(coord, dimensions).await?;
        }
        Ok(())
    }

    fn blank_tile(&self, coord: TileCoord, error: Option<String>) -> Tile {
        let mut tile = Tile::with_image(
            coord,
            TileImage::blank(self.grid.tile_size(), &self.image_opts),
        );
        tile.cacheable = false;
        tile.error = error;
        tile
    }

    fn is_fresh(&self, tile: &Tile, cutoff: Option<DateTime<Utc>>) -> bool {
        if tile.is_missing() {
            return false;
        }
        match (cutoff, tile.timestamp) {
            (Some(cutoff), Some(timestamp)) => timestamp >= cutoff,
            // Backends without timestamps cannot be refreshed.
            _ => true,
        }
    }

    /// Whether the tile's extent is inside the cache coverage (if any).
    async fn in_coverage(&self, coord: TileCoord) -> Result<bool> {
        let Some(coverage) = self.store.coverage() else {
            return Ok(true);
        };
        let bbox = self.grid.tile_bbox(coord)?;
        Ok(coverage.intersects(&bbox, self.grid.srs())?)
    }

    async fn load_inner(
        &self,
        coords: &[TileCoord],
        dimensions: Option<&Dimensions>,
        with_metadata: bool,
        allow_rescale: bool,
        render: bool,
    ) -> Result<Vec<Tile>> {
        let cutoff = self.config.refresh_before.as_ref().and_then(|p| p.cutoff());
        let want_metadata = with_metadata || cutoff.is_some();

        // Cache probe, batched. Coordinates outside the grid or the cache
        // coverage short-circuit to transparent tiles.
        let mut probes: Vec<Tile> = Vec::with_capacity(coords.len());
        let mut out_of_bounds = vec![false; coords.len()];
        for (i, &coord) in coords.iter().enumerate() {
            if !self.grid.is_valid(coord) || !self.in_coverage(coord).await? {
                out_of_bounds[i] = true;
            }
            probes.push(Tile::new(coord));
        }
        {
            let mut in_bounds: Vec<&mut Tile> = probes
                .iter_mut()
                .zip(&out_of_bounds)
                .filter(|(_, oob)| !**oob)
                .map(|(t, _)| t)
                .collect();
            // load_tiles works on a contiguous slice; rebuild one.
            let mut loadable: Vec<Tile> = in_bounds.iter().map(|t| Tile::new(t.coord)).collect();
            self.store
                .load_tiles(&mut loadable, want_metadata, dimensions)
                .await?;
            for (slot, loaded) in in_bounds.iter_mut().zip(loadable) {
                **slot = loaded;
            }
        }

        let mut stale: HashMap<TileCoord, Tile> = HashMap::new();
        let mut to_create: Vec<TileCoord> = Vec::new();
        for (i, tile) in probes.iter().enumerate() {
            if out_of_bounds[i] {
                continue;
            }
            if !self.is_fresh(tile, cutoff) {
                if !tile.is_missing() {
                    stale.insert(tile.coord, tile.clone());
                }
                if !to_create.contains(&tile.coord) {
                    to_create.push(tile.coord);
                }
            }
        }

        // Everything fresh: done.
        if to_create.is_empty() && !out_of_bounds.iter().any(|oob| *oob) {
            return Ok(probes);
        }

        // Rescale attempt for misses before any upstream work.
        let mut rendered: HashMap<TileCoord, Tile> = HashMap::new();
        if allow_rescale && self.config.rescale_tiles != 0 {
            let mut still_missing = Vec::new();
            for coord in to_create.drain(..) {
                if stale.contains_key(&coord) {
                    // A stale copy exists; prefer a real re-render.
                    still_missing.push(coord);
                    continue;
                }
                match self.rescale_tile(coord, dimensions).await? {
                    Some(tile) => {
                        rendered.insert(coord, tile);
                    }
                    None => still_missing.push(coord),
                }
            }
            to_create = still_missing;
        }

        // Group remaining work into meta-tiles and render them, capped by
        // concurrent_tile_creators.
        if !to_create.is_empty() && render {
            let groups = self.group_meta_tiles(&to_create)?;
            let tasks = groups.into_iter().map(|(meta, needed)| async move {
                let result = self.create_meta_tile(&meta, &needed, dimensions).await;
                (needed, result)
            });
            let results: Vec<_> = stream::iter(tasks)
                .buffer_unordered(self.config.concurrent_tile_creators.max(1))
                .collect()
                .await;

            for (needed, result) in results {
                match result {
                    Ok(tiles) => {
                        for tile in tiles {
                            rendered.insert(tile.coord, tile);
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        warn!("meta tile render failed ({}), falling back", e);
                        for coord in needed {
                            let tile = match stale.get(&coord) {
                                Some(old) => {
                                    let mut old = old.clone();
                                    old.stale = true;
                                    old
                                }
                                None => self.blank_tile(coord, Some(e.to_string())),
                            };
                            rendered.insert(coord, tile);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Assemble in input order.
        let mut out = Vec::with_capacity(coords.len());
        for (i, probe) in probes.into_iter().enumerate() {
            if out_of_bounds[i] {
                out.push(self.blank_tile(probe.coord, None));
            } else if let Some(tile) = rendered.get(&probe.coord) {
                out.push(tile.clone());
            } else {
                out.push(probe);
            }
        }
        Ok(out)
    }

    /// Fill one missing tile by resampling the level `rescale_tiles` away.
    /// Cached neighbor-level tiles are used directly; rendering the
    /// neighbor level happens only when the requested level has no usable
    /// source of its own. The recursive lookup runs with rescaling
    /// disabled, so the recursion depth is one by construction.
    async fn rescale_tile(
        &self,
        coord: TileCoord,
        dimensions: Option<&Dimensions>,
    ) -> Result<Option<Tile>> {
        let target_z = coord.z as i32 + self.config.rescale_tiles;
        if target_z < 0 || target_z >= self.grid.levels() as i32 {
            return Ok(None);
        }
        let target_z = target_z as u8;
        let bbox = self.grid.tile_bbox(coord)?;
        let range = self.grid.tiles_for_bbox(&bbox, target_z)?;
        let source_coords: Vec<TileCoord> = range.iter().collect();

        // Cache-only probe first.
        let cached = Box::pin(self.load_inner(&source_coords, dimensions, false, false, false))
            .await?;
        let source_tiles = if cached.iter().all(|t| !t.is_missing()) {
            cached
        } else {
            // Neighbor level not cached: only render it when this level
            // cannot be rendered directly.
            let res = self.grid.resolution(coord.z)?;
            if !self.usable_sources(&bbox, res)?.is_empty() {
                return Ok(None);
            }
            Box::pin(self.load_inner(&source_coords, dimensions, false, false, true)).await?
        };
        if source_tiles.iter().all(|t| t.is_missing() || t.error.is_some()) {
            return Ok(None);
        }

        // Paste the covering tiles onto one canvas, then cut the target
        // extent out of it.
        let (tw, th) = self.grid.tile_size();
        let (cols, rows) = range.size();
        let mut canvas = TileImage::transparent((cols * tw, rows * th));
        let mut canvas_bbox: Option<graticule_core::BBox> = None;
        for tile in &source_tiles {
            let tile_bbox = self.grid.tile_bbox(tile.coord)?;
            canvas_bbox = Some(match canvas_bbox {
                None => tile_bbox,
                Some(b) => graticule_core::BBox::from_corners(
                    (b.min_x.min(tile_bbox.min_x), b.min_y.min(tile_bbox.min_y)),
                    (b.max_x.max(tile_bbox.max_x), b.max_y.max(tile_bbox.max_y)),
                ),
            });
        }
        let canvas_bbox = match canvas_bbox {
            Some(b) => b,
            None => return Ok(None),
        };
        for tile in &source_tiles {
            let Some(image) = tile.to_image()? else { continue };
            let tile_bbox = self.grid.tile_bbox(tile.coord)?;
            let res = self.grid.resolution(target_z)?;
            let px = ((tile_bbox.min_x - canvas_bbox.min_x) / res).round() as u32;
            let py = ((canvas_bbox.max_y - tile_bbox.max_y) / res).round() as u32;
            canvas.paste(&image, px, py);
        }

        let image = transform::extract_bbox(
            &canvas,
            &canvas_bbox,
            &bbox,
            self.grid.tile_size(),
            self.image_opts.resampling,
        )?;

        debug!(%coord, target_z, "tile rescaled");
        let mut tile = Tile::with_image(coord, image);
        tile.timestamp = Some(Utc::now());
        tile.cacheable = self.config.cache_rescaled_tiles;
        if self.config.cache_rescaled_tiles {
            let tile = self.apply_tile_filters(tile)?;
            self.store.store_tile(&tile, dimensions).await?;
            return Ok(Some(tile));
        }
        Ok(Some(tile))
    }

    /// Group coords into aligned meta-tiles (or minimal rectangles).
    fn group_meta_tiles(&self, coords: &[TileCoord]) -> Result<Vec<(MetaTile, Vec<TileCoord>)>> {
        let mut groups: Vec<(TileCoord, Vec<TileCoord>)> = Vec::new();
        for &coord in coords {
            let anchor = self.meta_grid.main_tile(coord);
            match groups.iter_mut().find(|(a, _)| *a == anchor) {
                Some((_, list)) => list.push(coord),
                None => groups.push((anchor, vec![coord])),
            }
        }
        groups
            .into_iter()
            .map(|(anchor, needed)| {
                let meta = if self.config.minimize_meta_requests {
                    self.meta_grid.minimal_meta_tile(&needed)?
                } else {
                    self.meta_grid.meta_tile(anchor)?
                };
                Ok((meta, needed))
            })
            .collect()
    }

    /// Sources eligible for a render at this extent and resolution.
    fn usable_sources(&self, bbox: &graticule_core::BBox, res: f64) -> Result<Vec<&Arc<dyn Source>>> {
        let mut usable = Vec::new();
        for source in &self.sources {
            if source.is_seed_only() {
                continue;
            }
            if let Some(range) = source.res_range() {
                if !range.contains(res) {
                    continue;
                }
            }
            if let Some(coverage) = source.coverage() {
                if !coverage.intersects(bbox, self.grid.srs())? {
                    continue;
                }
            }
            usable.push(source);
        }
        Ok(usable)
    }

    /// Render one meta-tile under the tile lock. Returns every tile of the
    /// block that ended up with a payload.
    async fn create_meta_tile(
        &self,
        meta: &MetaTile,
        needed: &[TileCoord],
        dimensions: Option<&Dimensions>,
    ) -> Result<Vec<Tile>> {
        let lock_id = self.store.lock_cache_id();
        let anchor = meta.anchor();

        // One retry on lock timeout, then propagate.
        let _guard = match self.locker.acquire(lock_id, anchor).await {
            Ok(guard) => guard,
            Err(TileError::LockTimeout(msg)) => {
                debug!("lock timeout on {}, retrying once", msg);
                self.locker.acquire(lock_id, anchor).await?
            }
            Err(e) => return Err(e),
        };

        // Another writer may have rendered the block while we waited.
        let cutoff = self.config.refresh_before.as_ref().and_then(|p| p.cutoff());
        let mut recheck: Vec<Tile> = needed.iter().map(|&c| Tile::new(c)).collect();
        self.store
            .load_tiles(&mut recheck, cutoff.is_some(), dimensions)
            .await?;
        if recheck.iter().all(|t| self.is_fresh(t, cutoff)) {
            debug!(%anchor, "meta tile filled by concurrent writer");
            return Ok(recheck);
        }

        // Renderd delegation: the external creator writes into the shared
        // cache; afterwards the tiles must be there.
        if let Some(renderd) = &self.renderd {
            renderd.request_tiles(&self.identifier, needed).await?;
            let mut tiles: Vec<Tile> = needed.iter().map(|&c| Tile::new(c)).collect();
            self.store.load_tiles(&mut tiles, false, dimensions).await?;
            if let Some(missing) = tiles.iter().find(|t| t.is_missing()) {
                return Err(TileError::Renderd(format!(
                    "tile {} not in cache after renderd request",
                    missing.coord
                )));
            }
            return Ok(tiles);
        }

        let res = self.grid.resolution(anchor.z)?;
        let sources = self.usable_sources(meta.bbox(), res)?;
        if sources.is_empty() {
            debug!(%anchor, "no usable source, returning transparent tiles");
            return Ok(needed
                .iter()
                .map(|&c| self.blank_tile(c, None))
                .collect());
        }

        let tiles = if self.config.bulk_meta_tiles && sources.iter().all(|s| s.is_tiled()) {
            self.render_bulk(meta, &sources).await?
        } else {
            self.render_meta(meta, &sources).await?
        };

        let mut finished = Vec::with_capacity(tiles.len());
        for tile in tiles {
            finished.push(self.apply_tile_filters(tile)?);
        }

        let storable: Vec<Tile> = finished.iter().filter(|t| t.cacheable).cloned().collect();
        if !storable.is_empty() {
            self.store.store_tiles(&storable, dimensions).await?;
        }
        Ok(finished)
    }

    /// One upstream request for the whole block, then split.
    async fn render_meta(
        &self,
        meta: &MetaTile,
        sources: &[&Arc<dyn Source>],
    ) -> Result<Vec<Tile>> {
        let query = SourceQuery {
            bbox: *meta.bbox(),
            size: meta.size(),
            srs: self.grid.srs(),
            format: self.config.request_format,
        };

        let results = future::join_all(sources.iter().map(|s| s.get_map(&query))).await;
        let mut images = Vec::with_capacity(results.len());
        let mut cacheable = true;
        for result in results {
            let result = result?;
            cacheable &= result.cacheable;
            images.push(result.image);
        }

        let image = match &self.band_merger {
            Some(merger) => merger.merge(&images)?,
            None => images.swap_remove(0),
        };

        let split = split_meta_tile(&image, meta, self.grid.tile_size(), &self.image_opts)?;
        let now = Utc::now();
        Ok(split
            .into_iter()
            .map(|(coord, img)| {
                let mut tile = Tile::with_image(coord, img);
                tile.timestamp = Some(now);
                tile.cacheable = cacheable;
                tile
            })
            .collect())
    }

    /// Per-tile upstream requests; used when the upstream is itself tiled.
    async fn render_bulk(
        &self,
        meta: &MetaTile,
        sources: &[&Arc<dyn Source>],
    ) -> Result<Vec<Tile>> {
        let coords: Vec<TileCoord> = meta.tiles().to_vec();
        let tasks = coords.into_iter().map(|coord: TileCoord| async move {
            let bbox = self.grid.tile_bbox(coord)?;
            let query = SourceQuery {
                bbox,
                size: self.grid.tile_size(),
                srs: self.grid.srs(),
                format: self.config.request_format,
            };
            let results = future::join_all(sources.iter().map(|s| s.get_map(&query))).await;
            let mut images = Vec::with_capacity(results.len());
            let mut cacheable = true;
            for result in results {
                let result = result?;
                cacheable &= result.cacheable;
                images.push(result.image);
            }
            let image = match &self.band_merger {
                Some(merger) => merger.merge(&images)?,
                None => images.swap_remove(0),
            };
            let mut tile = Tile::with_image(coord, image);
            tile.timestamp = Some(Utc::now());
            tile.cacheable = cacheable;
            Ok::<Tile, TileError>(tile)
        });
        stream::iter(tasks)
            .buffered(self.config.concurrent_tile_creators.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DirectoryLayout, FileStore};
    use crate::lock::{DummyLocker, FileLocker};
    use crate::source::MapResult;
    use async_trait::async_trait;
    use graticule_core::{BBox, Coverage, GridOrigin, Srs};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Upstream double: counts requests, records queries, optional failure.
    struct MockSource {
        calls: AtomicUsize,
        queries: Mutex<Vec<SourceQuery>>,
        color: [u8; 4],
        fail_status: Option<u16>,
        tiled: bool,
        coverage: Option<Coverage>,
    }

    impl MockSource {
        fn new(color: [u8; 4]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
                color,
                fail_status: None,
                tiled: false,
                coverage: None,
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                fail_status: Some(status),
                ..Self::new([0, 0, 0, 255])
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Source for MockSource {
        async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.clone());
            if let Some(status) = self.fail_status {
                return Err(TileError::SourceHttp {
                    status,
                    message: "mock failure".to_string(),
                });
            }
            Ok(MapResult::new(TileImage::solid(query.size, self.color)))
        }

        fn is_tiled(&self) -> bool {
            self.tiled
        }

        fn coverage(&self) -> Option<&Coverage> {
            self.coverage.as_ref()
        }
    }

    struct Fixture {
        _dir: TempDir,
        manager: Arc<TileManager>,
        source: Arc<MockSource>,
        store: Arc<FileStore>,
    }

    fn fixture_with(config: TileManagerConfig, source: MockSource) -> Fixture {
        let dir = TempDir::new().unwrap();
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        let store = Arc::new(FileStore::new(
            dir.path().join("cache"),
            DirectoryLayout::Tc,
            grid.clone(),
            ImageOptions::default(),
        ));
        let locker = Arc::new(FileLocker::new(
            dir.path().join("tile_locks"),
            Duration::from_secs(5),
        ));
        let source = Arc::new(source);
        let manager = Arc::new(TileManager::new(
            "wms_cache_webmercator",
            grid,
            store.clone(),
            locker,
            vec![source.clone() as Arc<dyn Source>],
            ImageOptions::default(),
            config,
        ));
        Fixture { _dir: dir, manager, source, store }
    }

    fn fixture(config: TileManagerConfig) -> Fixture {
        fixture_with(config, MockSource::new([50, 100, 150, 255]))
    }

    #[tokio::test]
    async fn test_meta_tile_miss_renders_block_once() {
        let fx = fixture(TileManagerConfig {
            meta_size: (2, 2),
            ..Default::default()
        });

        let tile = fx
            .manager
            .load_tile_coord(TileCoord::new(2, 0, 0), None, false)
            .await
            .unwrap();
        assert!(!tile.is_missing());
        assert_eq!(fx.source.calls(), 1);

        // The one upstream query covers the whole 2x2 block.
        let queries = fx.source.queries.lock();
        assert_eq!(queries[0].size, (512, 512));
        let expected = BBox::new(-20037508.342789244, -20037508.342789244, 0.0, 0.0).unwrap();
        assert!(queries[0].bbox.approx_eq(&expected, 1e-9));
        drop(queries);

        // All four tiles of the block are now cached.
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            assert!(fx
                .store
                .is_cached(TileCoord::new(2, x, y), None)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_source() {
        let fx = fixture(TileManagerConfig::default());
        let coord = TileCoord::new(3, 1, 1);
        fx.manager.load_tile_coord(coord, None, false).await.unwrap();
        let calls = fx.source.calls();

        let tile = fx.manager.load_tile_coord(coord, None, false).await.unwrap();
        assert!(!tile.is_missing());
        assert_eq!(fx.source.calls(), calls);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let fx = fixture(TileManagerConfig {
            meta_size: (1, 1),
            ..Default::default()
        });
        let coord = TileCoord::new(4, 3, 5);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = fx.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.load_tile_coord(coord, None, false).await
            }));
        }
        let mut bodies = Vec::new();
        for handle in handles {
            let tile = handle.await.unwrap().unwrap();
            bodies.push(tile.to_buffer(fx.manager.image_opts()).unwrap());
        }

        assert_eq!(fx.source.calls(), 1);
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_out_of_bounds_is_transparent() {
        let fx = fixture(TileManagerConfig::default());
        // x=9 does not exist at level 2 (4x4 grid).
        let tile = fx
            .manager
            .load_tile_coord(TileCoord::new(2, 9, 0), None, false)
            .await
            .unwrap();
        assert!(!tile.cacheable);
        let img = tile.to_image().unwrap().unwrap();
        assert_eq!(img.single_color(), Some([0, 0, 0, 0]));
        assert_eq!(fx.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_upscale_rescales_without_upstream() {
        let fx = fixture(TileManagerConfig {
            meta_size: (1, 1),
            rescale_tiles: -1,
            cache_rescaled_tiles: true,
            ..Default::default()
        });

        // Seed the parent level directly.
        let parent = Tile::with_image(
            TileCoord::new(1, 0, 0),
            TileImage::solid((256, 256), [200, 10, 10, 255]),
        );
        fx.store.store_tile(&parent, None).await.unwrap();

        // The child tile is produced by resampling, not by the source.
        let tile = fx
            .manager
            .load_tile_coord(TileCoord::new(2, 0, 0), None, false)
            .await
            .unwrap();
        assert_eq!(fx.source.calls(), 0);
        let img = tile.to_image().unwrap().unwrap();
        assert_eq!(img.single_color(), Some([200, 10, 10, 255]));

        // cache_rescaled_tiles persists the result.
        assert!(fx
            .store
            .is_cached(TileCoord::new(2, 0, 0), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rescale_miss_falls_through_to_render() {
        let fx = fixture(TileManagerConfig {
            meta_size: (1, 1),
            rescale_tiles: -1,
            ..Default::default()
        });
        // Nothing cached anywhere and the source serves this level: the
        // tile renders directly instead of via the parent.
        let tile = fx
            .manager
            .load_tile_coord(TileCoord::new(2, 0, 0), None, false)
            .await
            .unwrap();
        assert!(!tile.is_missing());
        assert_eq!(fx.source.calls(), 1);
        let queries = fx.source.queries.lock();
        // Query extent is the level-2 tile, not the level-1 parent.
        let expected = fx
            .manager
            .grid()
            .tile_bbox(TileCoord::new(2, 0, 0))
            .unwrap();
        assert!(queries[0].bbox.approx_eq(&expected, 1e-9));
    }

    #[tokio::test]
    async fn test_rescale_renders_neighbor_level_when_source_excluded() {
        use graticule_core::ResolutionRange;

        struct RangedSource {
            inner: MockSource,
            range: ResolutionRange,
        }

        #[async_trait]
        impl Source for RangedSource {
            async fn get_map(&self, query: &SourceQuery) -> Result<MapResult> {
                self.inner.get_map(query).await
            }
            fn res_range(&self) -> Option<&ResolutionRange> {
                Some(&self.range)
            }
        }

        let dir = TempDir::new().unwrap();
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        // Source only answers down to level 1 resolutions.
        let range = ResolutionRange::new(None, Some(grid.resolution(1).unwrap()));
        let source = Arc::new(RangedSource {
            inner: MockSource::new([30, 30, 30, 255]),
            range,
        });
        let store = Arc::new(FileStore::new(
            dir.path().join("cache"),
            DirectoryLayout::Tc,
            grid.clone(),
            ImageOptions::default(),
        ));
        let manager = TileManager::new(
            "wms_cache_webmercator",
            grid,
            store,
            Arc::new(DummyLocker),
            vec![source.clone() as Arc<dyn Source>],
            ImageOptions::default(),
            TileManagerConfig {
                meta_size: (1, 1),
                rescale_tiles: -1,
                ..Default::default()
            },
        );

        // Level 2 has no usable source, so the parent renders and the tile
        // is produced by upscaling it.
        let tile = manager
            .load_tile_coord(TileCoord::new(2, 0, 0), None, false)
            .await
            .unwrap();
        assert!(!tile.is_missing());
        assert_eq!(source.inner.calls(), 1);
        let queries = source.inner.queries.lock();
        let parent = manager.grid().tile_bbox(TileCoord::new(1, 0, 0)).unwrap();
        assert!(queries[0].bbox.approx_eq(&parent, 1e-9));
    }

    #[tokio::test]
    async fn test_stale_tile_rerendered() {
        let fx = fixture(TileManagerConfig {
            meta_size: (1, 1),
            ..Default::default()
        });
        let coord = TileCoord::new(5, 4, 4);
        fx.manager.load_tile_coord(coord, None, false).await.unwrap();
        assert_eq!(fx.source.calls(), 1);

        // Same manager config but with a cutoff in the future: everything
        // stored so far is stale.
        let stale_fx = Fixture {
            manager: Arc::new(TileManager::new(
                "wms_cache_webmercator",
                fx.manager.grid().clone(),
                fx.store.clone(),
                Arc::new(DummyLocker),
                vec![fx.source.clone() as Arc<dyn Source>],
                ImageOptions::default(),
                TileManagerConfig {
                    meta_size: (1, 1),
                    refresh_before: Some(RefreshPolicy::Before(Utc::now() + chrono::Duration::hours(1))),
                    ..Default::default()
                },
            )),
            source: fx.source.clone(),
            store: fx.store.clone(),
            _dir: fx._dir,
        };

        stale_fx
            .manager
            .load_tile_coord(coord, None, false)
            .await
            .unwrap();
        assert_eq!(stale_fx.source.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_served_when_rerender_fails() {
        let dir = TempDir::new().unwrap();
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        let store = Arc::new(FileStore::new(
            dir.path().join("cache"),
            DirectoryLayout::Tc,
            grid.clone(),
            ImageOptions::default(),
        ));
        let coord = TileCoord::new(5, 4, 4);
        let old = Tile::with_image(coord, TileImage::solid((256, 256), [1, 2, 3, 255]));
        store.store_tile(&old, None).await.unwrap();

        let manager = TileManager::new(
            "wms_cache_webmercator",
            grid,
            store,
            Arc::new(DummyLocker),
            vec![Arc::new(MockSource::failing(503)) as Arc<dyn Source>],
            ImageOptions::default(),
            TileManagerConfig {
                meta_size: (1, 1),
                refresh_before: Some(RefreshPolicy::Before(Utc::now() + chrono::Duration::hours(1))),
                ..Default::default()
            },
        );

        let tile = manager.load_tile_coord(coord, None, false).await.unwrap();
        assert!(tile.stale);
        let img = tile.to_image().unwrap().unwrap();
        assert_eq!(img.single_color(), Some([1, 2, 3, 255]));
    }

    #[tokio::test]
    async fn test_error_tile_when_nothing_to_serve() {
        let fx = fixture_with(
            TileManagerConfig {
                meta_size: (1, 1),
                ..Default::default()
            },
            MockSource::failing(503),
        );
        let tile = fx
            .manager
            .load_tile_coord(TileCoord::new(3, 0, 0), None, false)
            .await
            .unwrap();
        assert!(tile.error.is_some());
        assert!(!tile.cacheable);
        let img = tile.to_image().unwrap().unwrap();
        assert_eq!(img.single_color(), Some([0, 0, 0, 0]));
    }

    #[tokio::test]
    async fn test_nonretryable_failure_propagates() {
        let fx = fixture_with(
            TileManagerConfig {
                meta_size: (1, 1),
                ..Default::default()
            },
            MockSource::failing(404),
        );
        let result = fx
            .manager
            .load_tile_coord(TileCoord::new(3, 0, 0), None, false)
            .await;
        assert!(matches!(
            result,
            Err(TileError::SourceHttp { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_minimize_meta_requests_shrinks_query() {
        let fx = fixture(TileManagerConfig {
            meta_size: (4, 4),
            minimize_meta_requests: true,
            ..Default::default()
        });
        fx.manager
            .load_tile_coord(TileCoord::new(4, 5, 5), None, false)
            .await
            .unwrap();
        let queries = fx.source.queries.lock();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].size, (256, 256));
    }

    #[tokio::test]
    async fn test_bulk_meta_tiles_fetches_per_tile() {
        let mut source = MockSource::new([9, 9, 9, 255]);
        source.tiled = true;
        let fx = fixture_with(
            TileManagerConfig {
                meta_size: (2, 2),
                bulk_meta_tiles: true,
                ..Default::default()
            },
            source,
        );
        fx.manager
            .load_tile_coord(TileCoord::new(2, 0, 0), None, false)
            .await
            .unwrap();
        // Four per-tile queries instead of one 512x512 block.
        assert_eq!(fx.source.calls(), 4);
        let queries = fx.source.queries.lock();
        assert!(queries.iter().all(|q| q.size == (256, 256)));
    }

    #[tokio::test]
    async fn test_source_coverage_excludes_render() {
        let mut source = MockSource::new([9, 9, 9, 255]);
        // Coverage far away from the requested tile.
        source.coverage = Some(Coverage::from_bbox(
            BBox::new(10_000_000.0, 10_000_000.0, 11_000_000.0, 11_000_000.0).unwrap(),
            Srs::WEB_MERCATOR,
        ));
        let fx = fixture_with(
            TileManagerConfig {
                meta_size: (1, 1),
                ..Default::default()
            },
            source,
        );
        // South-west quadrant tile: outside the coverage.
        let tile = fx
            .manager
            .load_tile_coord(TileCoord::new(2, 0, 0), None, false)
            .await
            .unwrap();
        assert_eq!(fx.source.calls(), 0);
        let img = tile.to_image().unwrap().unwrap();
        assert_eq!(img.single_color(), Some([0, 0, 0, 0]));
    }

    #[tokio::test]
    async fn test_input_order_preserved() {
        let fx = fixture(TileManagerConfig {
            meta_size: (2, 2),
            ..Default::default()
        });
        let coords = [
            TileCoord::new(3, 5, 2),
            TileCoord::new(3, 0, 0),
            TileCoord::new(3, 5, 3),
        ];
        let tiles = fx
            .manager
            .load_tile_coords(&coords, None, false)
            .await
            .unwrap();
        let out: Vec<TileCoord> = tiles.iter().map(|t| t.coord).collect();
        assert_eq!(out, coords);
        assert!(tiles.iter().all(|t| !t.is_missing()));
    }

    #[test]
    fn test_refresh_policy_age() {
        let policy = RefreshPolicy::Age(chrono::Duration::seconds(60));
        let cutoff = policy.cutoff().unwrap();
        let now = Utc::now();
        assert!(cutoff <= now);
        assert!(now - cutoff < chrono::Duration::seconds(62));
    }

    #[tokio::test]
    async fn test_refresh_law_fresh_before_cutoff() {
        // A tile stored now is fresh for cutoff = now - 1h and stale for
        // cutoff = now + 1h.
        let fx = fixture(TileManagerConfig {
            meta_size: (1, 1),
            refresh_before: Some(RefreshPolicy::Before(Utc::now() - chrono::Duration::hours(1))),
            ..Default::default()
        });
        let coord = TileCoord::new(6, 1, 1);
        fx.manager.load_tile_coord(coord, None, false).await.unwrap();
        assert_eq!(fx.source.calls(), 1);
        fx.manager.load_tile_coord(coord, None, false).await.unwrap();
        assert_eq!(fx.source.calls(), 1);
    }
}
