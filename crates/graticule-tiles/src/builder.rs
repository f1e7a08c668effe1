//! Assembly of managers and layers from configuration.
//!
//! The builder resolves names to built objects, memoizes shared grids and
//! managers, and validates the cache-source dependency graph: a cache may
//! consume another cache as a source, but the references must form a DAG.
//! Cycles are rejected with a configuration error naming the chain.

use graticule_core::{BBox, GridOrigin, Srs, TileGrid};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache::azure::{AzureConfig, AzureStore};
use crate::cache::compact::{CompactStore, CompactVersion};
use crate::cache::couchdb::CouchDbStore;
use crate::cache::geopackage::{GeoPackageLevelStore, GeoPackageStore};
use crate::cache::mbtiles::SqliteOptions;
use crate::cache::redis::RedisStore;
use crate::cache::s3::{S3Config, S3Store};
use crate::cache::{
    DirectoryLayout, DummyStore, FileStore, MBTilesLevelStore, MBTilesStore, TileStore,
};
use crate::client::{HttpClient, HttpOptions};
use crate::config::{
    error_handler_from, image_options_for, CacheConfig, CacheStoreConfig, GlobalsConfig,
    GridConfig, SourceConfig,
};
use crate::error::{Result, TileError};
use crate::image::filter::{WatermarkFilter, WatermarkSpacing};
use crate::image::{ImageOptions, TileFilter, TileFormat};
use crate::layer::{CacheMapLayer, DirectMapLayer, MapLayer, ResolutionConditional};
use crate::lock::{DummyLocker, FileLocker, Locker};
use crate::manager::{TileManager, TileManagerConfig};
use crate::source::cached::CacheSource;
use crate::source::mapnik::{MapnikSource, MapnikSourceConfig};
use crate::source::mapserver::{MapServerSource, MapServerSourceConfig};
use crate::source::tile::TiledSourceConfig;
use crate::source::wms::{WmsSourceConfig, WmsVersion};
use crate::source::{ArcGisSource, Source, TiledSource, WmsSource};
use crate::source::arcgis::ArcGisSourceConfig;

/// The named configuration universe the builder resolves against.
#[derive(Debug, Clone)]
pub struct Registry {
    pub grids: HashMap<String, GridConfig>,
    pub caches: HashMap<String, CacheConfig>,
    pub sources: HashMap<String, SourceConfig>,
    pub globals: GlobalsConfig,
}

/// Split a source reference into its name and optional layer tags
/// (`osm:base,roads`).
pub(crate) fn split_source_ref(reference: &str) -> (&str, Option<Vec<String>>) {
    match reference.split_once(':') {
        Some((name, tags)) if !tags.is_empty() => (
            name,
            Some(tags.split(',').map(|t| t.trim().to_string()).collect()),
        ),
        _ => (reference, None),
    }
}

/// Builds and memoizes grids, managers, and layers from a [`Registry`].
pub struct Builder {
    registry: Registry,
    grids: HashMap<String, Arc<TileGrid>>,
    managers: HashMap<String, Arc<TileManager>>,
    layers: HashMap<String, Arc<CacheMapLayer>>,
    /// Cache names currently being built; a repeat means a cycle.
    building: Vec<String>,
}

impl Builder {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            grids: HashMap::new(),
            managers: HashMap::new(),
            layers: HashMap::new(),
            building: Vec::new(),
        }
    }

    /// Resolve a grid by name; `GLOBAL_MERCATOR` and `GLOBAL_GEODETIC` are
    /// builtin.
    pub fn grid(&mut self, name: &str) -> Result<Arc<TileGrid>> {
        if let Some(grid) = self.grids.get(name) {
            return Ok(grid.clone());
        }
        let grid = match self.registry.grids.get(name) {
            Some(config) => Arc::new(Self::build_grid(name, config)?),
            None => match name {
                "GLOBAL_MERCATOR" => {
                    Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest))
                }
                "GLOBAL_GEODETIC" => Arc::new(TileGrid::geodetic(20, GridOrigin::SouthWest)),
                _ => {
                    return Err(TileError::config(format!("unknown grid {:?}", name)));
                }
            },
        };
        self.grids.insert(name.to_string(), grid.clone());
        Ok(grid)
    }

    fn build_grid(name: &str, config: &GridConfig) -> Result<TileGrid> {
        let srs = Srs::parse(&config.srs).map_err(TileError::from)?;
        let tile_size = config
            .tile_size
            .map(|[w, h]| (w, h))
            .unwrap_or((256, 256));
        let bbox = match config.bbox {
            Some([min_x, min_y, max_x, max_y]) => BBox::new(min_x, min_y, max_x, max_y)?,
            None if srs.is_geographic() => BBox::new(-180.0, -90.0, 180.0, 90.0)?,
            None => {
                let extent = graticule_core::srs::MERCATOR_EXTENT;
                BBox::new(-extent, -extent, extent, extent)?
            }
        };
        let resolutions = match &config.res {
            Some(res) => res.clone(),
            None => {
                let levels = config.num_levels.unwrap_or(20);
                let res0 = bbox.width() / tile_size.0 as f64;
                (0..levels.max(1))
                    .map(|z| res0 / (1u64 << z) as f64)
                    .collect()
            }
        };
        let origin = match config.origin.as_deref() {
            None | Some("sw") => GridOrigin::SouthWest,
            Some("nw") => GridOrigin::NorthWest,
            Some(other) => {
                return Err(TileError::config(format!(
                    "invalid grid origin {:?}",
                    other
                )))
            }
        };
        Ok(TileGrid::new(name, srs, bbox, tile_size, resolutions, origin)?)
    }

    /// The map layer serving a cache, including the `use_direct_from_*`
    /// bypass when configured.
    pub async fn map_layer(&mut self, cache_name: &str) -> Result<Arc<dyn MapLayer>> {
        let cache_config = self.cache_config(cache_name)?.clone();
        let layer = self.cache_map_layer(cache_name).await?;

        let threshold = match (
            cache_config.use_direct_from_res,
            cache_config.use_direct_from_level,
        ) {
            (Some(res), _) => Some(res),
            (None, Some(level)) => {
                let grid = self.grid(&cache_config.grids[0])?;
                Some(grid.resolution(level)?)
            }
            (None, None) => None,
        };

        match threshold {
            Some(threshold_res) => {
                let grid = self.grid(&cache_config.grids[0])?;
                let first_source = cache_config.sources.first().ok_or_else(|| {
                    TileError::config(format!("cache {:?} has no sources", cache_name))
                })?;
                let direct = self.source(first_source, &grid).await?;
                Ok(Arc::new(ResolutionConditional::new(
                    layer,
                    Arc::new(DirectMapLayer::new(direct)),
                    threshold_res,
                    grid.srs(),
                )))
            }
            None => Ok(layer),
        }
    }

    /// The cache layer (manager + warp) for a cache's first grid.
    pub async fn cache_map_layer(&mut self, cache_name: &str) -> Result<Arc<CacheMapLayer>> {
        if let Some(layer) = self.layers.get(cache_name) {
            return Ok(layer.clone());
        }
        let manager = self.tile_manager(cache_name).await?;
        let image_opts = manager.image_opts().clone();
        let layer = Arc::new(CacheMapLayer::new(manager, image_opts));
        self.layers.insert(cache_name.to_string(), layer.clone());
        Ok(layer)
    }

    fn cache_config(&self, cache_name: &str) -> Result<&CacheConfig> {
        self.registry
            .caches
            .get(cache_name)
            .ok_or_else(|| TileError::config(format!("unknown cache {:?}", cache_name)))
    }

    /// Build the tile manager for a cache's first grid. Managers are
    /// shared: repeated references resolve to the same instance.
    pub async fn tile_manager(&mut self, cache_name: &str) -> Result<Arc<TileManager>> {
        if let Some(manager) = self.managers.get(cache_name) {
            return Ok(manager.clone());
        }
        if self.building.iter().any(|n| n == cache_name) {
            return Err(TileError::config(format!(
                "circular cache source: {} -> {}",
                self.building.join(" -> "),
                cache_name
            )));
        }
        self.building.push(cache_name.to_string());
        let result = self.build_tile_manager(cache_name).await;
        self.building.pop();
        let manager = result?;
        self.managers
            .insert(cache_name.to_string(), manager.clone());
        Ok(manager)
    }

    async fn build_tile_manager(&mut self, cache_name: &str) -> Result<Arc<TileManager>> {
        let config = self.cache_config(cache_name)?.clone();
        if config.grids.is_empty() {
            return Err(TileError::config(format!(
                "cache {:?} has no grids",
                cache_name
            )));
        }
        if config.upscale_tiles > 0 && config.downscale_tiles > 0 {
            return Err(TileError::config(
                "cannot use both upscale_tiles and downscale_tiles".to_string(),
            ));
        }

        let grid = self.grid(&config.grids[0])?;
        let image_opts = image_options_for(&config)?;
        let identifier = format!("{}_{}", cache_name, grid.name());

        let mut sources: Vec<Arc<dyn Source>> = Vec::new();
        for reference in &config.sources {
            sources.push(self.source(reference, &grid).await?);
        }

        let store = self
            .build_store(cache_name, &config, &grid, &image_opts)
            .await?;
        let locker: Arc<dyn Locker> = if config.disable_storage {
            Arc::new(DummyLocker)
        } else {
            Arc::new(FileLocker::new(
                self.registry.globals.lock_dir(),
                Duration::from_secs_f64(self.registry.globals.lock_timeout),
            ))
        };

        let mut filters: Vec<Arc<dyn TileFilter>> = Vec::new();
        if let Some(watermark) = &config.watermark {
            let font_data = std::fs::read(&watermark.font_file).map_err(|e| {
                TileError::config(format!(
                    "watermark font {:?}: {}",
                    watermark.font_file, e
                ))
            })?;
            let spacing = match watermark.spacing.as_deref() {
                None => WatermarkSpacing::Every,
                Some("wide") => WatermarkSpacing::Wide,
                Some(other) => {
                    return Err(TileError::config(format!(
                        "invalid watermark spacing {:?}",
                        other
                    )))
                }
            };
            filters.push(Arc::new(WatermarkFilter::new(
                watermark.text.clone(),
                font_data,
                watermark.font_size,
                watermark.color,
                watermark.opacity,
                spacing,
            )?));
        }

        // upscale reaches to shallower levels, downscale to deeper ones.
        let rescale_tiles = if config.upscale_tiles > 0 {
            -(config.upscale_tiles as i32)
        } else {
            config.downscale_tiles as i32
        };

        let request_format = match config.request_format.as_deref().or(config.format.as_deref())
        {
            Some(mime) => TileFormat::from_mime(mime)
                .ok_or_else(|| TileError::config(format!("unknown format {:?}", mime)))?,
            None => image_opts.format,
        };

        let manager_config = TileManagerConfig {
            meta_size: config.meta_size.map(|[w, h]| (w, h)).unwrap_or((4, 4)),
            meta_buffer: config.meta_buffer.unwrap_or(0),
            minimize_meta_requests: config.minimize_meta_requests,
            bulk_meta_tiles: config.bulk_meta_tiles,
            concurrent_tile_creators: config.concurrent_tile_creators.unwrap_or(2),
            rescale_tiles,
            cache_rescaled_tiles: config.cache_rescaled_tiles,
            request_format,
            refresh_before: config.refresh_before.as_ref().map(|r| r.to_policy()),
        };

        info!(cache = cache_name, grid = grid.name(), "building tile manager");
        let manager = Arc::new(
            TileManager::new(
                identifier,
                grid,
                store,
                locker,
                sources,
                image_opts,
                manager_config,
            )
            .with_filters(filters),
        );
        Ok(manager)
    }

    async fn build_store(
        &mut self,
        cache_name: &str,
        config: &CacheConfig,
        grid: &Arc<TileGrid>,
        image_opts: &ImageOptions,
    ) -> Result<Arc<dyn TileStore>> {
        if config.disable_storage {
            return Ok(Arc::new(DummyStore));
        }
        let base = &self.registry.globals.cache_dir;
        // Default on-disk location: <base>/<cache>_<srs>.
        let default_dir = || -> PathBuf {
            base.join(format!("{}_EPSG{}", cache_name, grid.srs().code()))
        };

        let store_config = config.cache.clone().unwrap_or(CacheStoreConfig::File {
            directory: None,
            directory_layout: None,
        });

        let store: Arc<dyn TileStore> = match store_config {
            CacheStoreConfig::File {
                directory,
                directory_layout,
            } => {
                let mut store = FileStore::new(
                    directory.unwrap_or_else(default_dir),
                    directory_layout.unwrap_or(DirectoryLayout::Tc),
                    grid.clone(),
                    image_opts.clone(),
                );
                if let Some(mode) = config.link_single_color_images.mode() {
                    store = store.with_single_color_links(mode);
                }
                Arc::new(store)
            }
            CacheStoreConfig::Sqlite {
                directory,
                wal,
                timeout,
            } => Arc::new(MBTilesLevelStore::new(
                directory.unwrap_or_else(default_dir),
                grid.clone(),
                image_opts.clone(),
                sqlite_options(wal, timeout),
            )),
            CacheStoreConfig::Mbtiles {
                filename,
                wal,
                timeout,
            } => Arc::new(MBTilesStore::open(
                filename.unwrap_or_else(|| base.join(format!("{}.mbtiles", cache_name))),
                grid.clone(),
                image_opts.clone(),
                &sqlite_options(wal, timeout),
            )?),
            CacheStoreConfig::Geopackage {
                filename,
                table_name,
                levels,
                wal,
                timeout,
            } => {
                let table = table_name.unwrap_or_else(|| cache_name.to_string());
                if levels {
                    Arc::new(GeoPackageLevelStore::new(
                        filename.unwrap_or_else(default_dir),
                        table,
                        grid.clone(),
                        image_opts.clone(),
                        sqlite_options(wal, timeout),
                    ))
                } else {
                    Arc::new(GeoPackageStore::open(
                        filename.unwrap_or_else(|| base.join(format!("{}.gpkg", cache_name))),
                        table,
                        grid.clone(),
                        image_opts.clone(),
                        &sqlite_options(wal, timeout),
                    )?)
                }
            }
            CacheStoreConfig::Couchdb { url, db_name } => {
                let db = db_name
                    .unwrap_or_else(|| format!("{}_{}", cache_name, grid.name().to_lowercase()));
                let client = HttpClient::new(&HttpOptions::default())?;
                Arc::new(CouchDbStore::new(
                    client.inner().clone(),
                    format!("{}/{}", url.trim_end_matches('/'), db),
                    image_opts.clone(),
                ))
            }
            CacheStoreConfig::S3 {
                bucket_name,
                base_path,
                region,
                directory_layout,
                acl,
            } => Arc::new(S3Store::new(
                S3Config {
                    bucket: bucket_name,
                    base_path: base_path
                        .unwrap_or_else(|| format!("{}/{}", cache_name, grid.name())),
                    region: region.unwrap_or_else(|| "us-east-1".to_string()),
                    layout: directory_layout.unwrap_or(DirectoryLayout::Tms),
                    acl,
                },
                grid.clone(),
                image_opts.clone(),
            )?),
            CacheStoreConfig::Redis {
                url,
                prefix,
                default_ttl,
            } => Arc::new(
                RedisStore::connect(
                    url.as_deref().unwrap_or("redis://127.0.0.1:6379"),
                    prefix.unwrap_or_else(|| format!("{}_{}", cache_name, grid.name())),
                    default_ttl.map(Duration::from_secs),
                    image_opts.clone(),
                )
                .await?,
            ),
            CacheStoreConfig::Compact { directory, version } => {
                let version = match version {
                    1 => CompactVersion::V1,
                    2 => CompactVersion::V2,
                    other => {
                        return Err(TileError::config(format!(
                            "unsupported compact cache version {}",
                            other
                        )))
                    }
                };
                Arc::new(CompactStore::new(
                    directory.unwrap_or_else(default_dir),
                    version,
                    grid.clone(),
                    image_opts.clone(),
                ))
            }
            CacheStoreConfig::Azureblob {
                account,
                container,
                access_key,
                base_path,
                directory_layout,
            } => Arc::new(AzureStore::new(
                AzureConfig {
                    account,
                    container,
                    access_key,
                    base_path: base_path
                        .unwrap_or_else(|| format!("{}/{}", cache_name, grid.name())),
                    layout: directory_layout.unwrap_or(DirectoryLayout::Tms),
                },
                grid.clone(),
                image_opts.clone(),
            )),
        };
        Ok(store)
    }

    /// Resolve a source reference: a configured source (optionally with
    /// layer tags) or another cache.
    pub async fn source(
        &mut self,
        reference: &str,
        grid: &Arc<TileGrid>,
    ) -> Result<Arc<dyn Source>> {
        let (name, tags) = split_source_ref(reference);

        if let Some(config) = self.registry.sources.get(name).cloned() {
            return self.build_source(name, &config, tags, grid).await;
        }

        if self.registry.caches.contains_key(name) {
            if tags.is_some() {
                return Err(TileError::config(format!(
                    "cache source {:?} does not take layer tags",
                    name
                )));
            }
            let layer = Box::pin(self.cache_map_layer(name)).await?;
            return Ok(Arc::new(CacheSource::new(layer)));
        }

        Err(TileError::config(format!("unknown source {:?}", name)))
    }

    async fn build_source(
        &mut self,
        name: &str,
        config: &SourceConfig,
        tags: Option<Vec<String>>,
        _grid: &Arc<TileGrid>,
    ) -> Result<Arc<dyn Source>> {
        if tags.is_some() && !matches!(config, SourceConfig::Wms { .. }) {
            return Err(TileError::config(format!(
                "source {:?} does not take layer tags",
                name
            )));
        }
        let parse_srs = |codes: &[String]| -> Result<Vec<Srs>> {
            codes
                .iter()
                .map(|c| Srs::parse(c).map_err(TileError::from))
                .collect()
        };

        let source: Arc<dyn Source> = match config {
            SourceConfig::Wms {
                req,
                supported_srs,
                supported_formats,
                concurrent_requests,
                http,
                on_error,
                wms_opts,
                seed_only,
                min_res,
                max_res,
            } => {
                let layers = match tags {
                    Some(tags) => tags,
                    None => req
                        .layers
                        .split(',')
                        .filter(|l| !l.is_empty())
                        .map(String::from)
                        .collect(),
                };
                let version = match wms_opts.version.as_deref() {
                    None | Some("1.1.1") => WmsVersion::V111,
                    Some("1.3.0") => WmsVersion::V130,
                    Some(other) => {
                        return Err(TileError::config(format!(
                            "unsupported WMS version {:?}",
                            other
                        )))
                    }
                };
                let formats = supported_formats
                    .iter()
                    .map(|m| {
                        TileFormat::from_mime(m).ok_or_else(|| {
                            TileError::config(format!("unknown format {:?}", m))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut source = WmsSource::new(WmsSourceConfig {
                    url: req.url.clone(),
                    layers,
                    styles: req.styles.clone(),
                    version,
                    transparent: req.transparent,
                    supported_srs: parse_srs(supported_srs)?,
                    supported_formats: formats,
                    concurrent_requests: *concurrent_requests,
                    http: http.to_options(),
                    seed_only: *seed_only,
                    ..Default::default()
                })?
                .with_error_handler(error_handler_from(on_error)?);
                if min_res.is_some() || max_res.is_some() {
                    source = source.with_res_range(graticule_core::ResolutionRange::new(
                        *min_res, *max_res,
                    ));
                }
                Arc::new(source)
            }
            SourceConfig::Arcgis {
                req,
                supported_srs,
                http,
                on_error,
                seed_only,
            } => Arc::new(
                ArcGisSource::new(ArcGisSourceConfig {
                    url: req.url.clone(),
                    layers: req
                        .layers
                        .split(',')
                        .filter(|l| !l.is_empty())
                        .map(String::from)
                        .collect(),
                    transparent: req.transparent,
                    supported_srs: parse_srs(supported_srs)?,
                    http: http.to_options(),
                    seed_only: *seed_only,
                })?
                .with_error_handler(error_handler_from(on_error)?),
            ),
            SourceConfig::Tile {
                url,
                grid,
                format,
                http,
                on_error,
                seed_only,
            } => {
                let tile_grid = self.grid(grid)?;
                let format = match format.as_deref() {
                    Some(mime) => TileFormat::from_mime(mime).ok_or_else(|| {
                        TileError::config(format!("unknown format {:?}", mime))
                    })?,
                    None => TileFormat::Png,
                };
                Arc::new(
                    TiledSource::new(
                        TiledSourceConfig {
                            url_template: url.clone(),
                            format,
                            http: http.to_options(),
                            seed_only: *seed_only,
                        },
                        tile_grid,
                    )?
                    .with_error_handler(error_handler_from(on_error)?),
                )
            }
            SourceConfig::Mapserver {
                req,
                mapfile,
                binary,
                working_dir,
                supported_srs,
                seed_only: _,
            } => Arc::new(MapServerSource::new(MapServerSourceConfig {
                binary: binary.clone().unwrap_or_else(|| PathBuf::from("mapserv")),
                mapfile: mapfile.clone(),
                working_dir: working_dir.clone(),
                layers: req
                    .layers
                    .split(',')
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect(),
                transparent: req.transparent,
                supported_srs: parse_srs(supported_srs)?,
                seed_only: false,
            })),
            SourceConfig::Mapnik {
                mapfile,
                command,
                supported_srs,
                seed_only,
            } => Arc::new(MapnikSource::new(MapnikSourceConfig {
                command: command
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("mapnik-render")),
                mapfile: mapfile.clone(),
                supported_srs: parse_srs(supported_srs)?,
                seed_only: *seed_only,
            })),
        };
        Ok(source)
    }
}

fn sqlite_options(wal: bool, timeout: Option<f64>) -> SqliteOptions {
    SqliteOptions {
        wal,
        timeout_ms: timeout.map(|t| (t * 1000.0) as u32).unwrap_or(30_000),
    }
}
