//! Engine configuration types.
//!
//! The external configuration loader deserializes its document into these
//! structs; the [`builder`](crate::builder) turns them into wired managers
//! and layers. Validation that needs cross-references (unknown grid names,
//! circular cache sources) happens in the builder.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::file::LinkMode;
use crate::cache::DirectoryLayout;
use crate::client::HttpOptions;
use crate::error::{Result, TileError};
use crate::image::{ImageMode, ImageOptions, Resampling, TileFormat};
use crate::manager::RefreshPolicy;
use crate::source::{ErrorRule, HttpErrorHandler};

/// Grid definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    pub srs: String,
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    /// `nw` or `sw`; unset means `sw`
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub res: Option<Vec<f64>>,
    #[serde(default)]
    pub num_levels: Option<usize>,
    #[serde(default)]
    pub tile_size: Option<[u32; 2]>,
}

/// Cache definition.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub sources: Vec<String>,
    pub grids: Vec<String>,
    #[serde(default)]
    pub cache: Option<CacheStoreConfig>,
    /// Stored tile format (MIME)
    #[serde(default)]
    pub format: Option<String>,
    /// Format requested from sources (MIME); defaults to `format`
    #[serde(default)]
    pub request_format: Option<String>,
    #[serde(default)]
    pub meta_size: Option<[u32; 2]>,
    #[serde(default)]
    pub meta_buffer: Option<u32>,
    #[serde(default)]
    pub minimize_meta_requests: bool,
    #[serde(default)]
    pub bulk_meta_tiles: bool,
    #[serde(default)]
    pub disable_storage: bool,
    #[serde(default)]
    pub link_single_color_images: LinkImagesConfig,
    #[serde(default)]
    pub upscale_tiles: u32,
    #[serde(default)]
    pub downscale_tiles: u32,
    #[serde(default)]
    pub cache_rescaled_tiles: bool,
    #[serde(default)]
    pub refresh_before: Option<RefreshConfig>,
    #[serde(default)]
    pub watermark: Option<WatermarkConfig>,
    #[serde(default)]
    pub use_direct_from_res: Option<f64>,
    #[serde(default)]
    pub use_direct_from_level: Option<u8>,
    #[serde(default)]
    pub concurrent_tile_creators: Option<usize>,
}

/// `link_single_color_images: true | "symlink" | "hardlink"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LinkImagesConfig {
    Flag(bool),
    Mode(LinkMode),
}

impl Default for LinkImagesConfig {
    fn default() -> Self {
        LinkImagesConfig::Flag(false)
    }
}

impl LinkImagesConfig {
    pub fn mode(&self) -> Option<LinkMode> {
        match self {
            LinkImagesConfig::Flag(false) => None,
            LinkImagesConfig::Flag(true) => Some(LinkMode::Symlink),
            LinkImagesConfig::Mode(mode) => Some(*mode),
        }
    }
}

/// Storage backend selection, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheStoreConfig {
    /// One file per tile
    File {
        #[serde(default)]
        directory: Option<PathBuf>,
        #[serde(default)]
        directory_layout: Option<DirectoryLayout>,
    },
    /// One MBTiles database per zoom level
    Sqlite {
        #[serde(default)]
        directory: Option<PathBuf>,
        #[serde(default)]
        wal: bool,
        #[serde(default)]
        timeout: Option<f64>,
    },
    /// One MBTiles database
    Mbtiles {
        #[serde(default)]
        filename: Option<PathBuf>,
        #[serde(default)]
        wal: bool,
        #[serde(default)]
        timeout: Option<f64>,
    },
    /// OGC GeoPackage; `levels` splits the cache into one file per zoom
    Geopackage {
        #[serde(default)]
        filename: Option<PathBuf>,
        #[serde(default)]
        table_name: Option<String>,
        #[serde(default)]
        levels: bool,
        #[serde(default)]
        wal: bool,
        #[serde(default)]
        timeout: Option<f64>,
    },
    Couchdb {
        url: String,
        #[serde(default)]
        db_name: Option<String>,
    },
    S3 {
        bucket_name: String,
        #[serde(default)]
        base_path: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        directory_layout: Option<DirectoryLayout>,
        #[serde(default)]
        acl: Option<String>,
    },
    Redis {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        default_ttl: Option<u64>,
    },
    /// ArcGIS compact bundles
    Compact {
        #[serde(default)]
        directory: Option<PathBuf>,
        version: u8,
    },
    Azureblob {
        account: String,
        container: String,
        access_key: String,
        #[serde(default)]
        base_path: Option<String>,
        #[serde(default)]
        directory_layout: Option<DirectoryLayout>,
    },
}

/// `refresh_before` in one of its spellings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshConfig {
    Seconds(f64),
    Minutes(f64),
    Hours(f64),
    Days(f64),
    Weeks(f64),
    /// Absolute instant
    Time(DateTime<Utc>),
    /// Reference file; its mtime is the cutoff
    Mtime(PathBuf),
}

impl RefreshConfig {
    pub fn to_policy(&self) -> RefreshPolicy {
        let age = |seconds: f64| {
            RefreshPolicy::Age(chrono::Duration::seconds(seconds.max(0.0) as i64))
        };
        match self {
            RefreshConfig::Seconds(s) => age(*s),
            RefreshConfig::Minutes(m) => age(m * 60.0),
            RefreshConfig::Hours(h) => age(h * 3600.0),
            RefreshConfig::Days(d) => age(d * 86400.0),
            RefreshConfig::Weeks(w) => age(w * 604800.0),
            RefreshConfig::Time(t) => RefreshPolicy::Before(*t),
            RefreshConfig::Mtime(path) => RefreshPolicy::MTime(path.clone()),
        }
    }
}

/// Watermark filter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WatermarkConfig {
    pub text: String,
    /// TTF/OTF file used to rasterize the text
    pub font_file: PathBuf,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_watermark_color")]
    pub color: [u8; 3],
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    /// `wide` marks every other tile
    #[serde(default)]
    pub spacing: Option<String>,
}

fn default_font_size() -> f32 {
    13.0
}

fn default_watermark_color() -> [u8; 3] {
    [128, 128, 128]
}

fn default_opacity() -> f32 {
    0.25
}

/// Per-source HTTP settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    /// Seconds
    #[serde(default)]
    pub client_timeout: Option<f64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub ssl_ca_certs: Option<PathBuf>,
}

impl HttpConfig {
    pub fn to_options(&self) -> HttpOptions {
        let mut options = HttpOptions::default();
        if let Some(timeout) = self.client_timeout {
            options.timeout = Duration::from_secs_f64(timeout.max(0.001));
        }
        options.username = self.username.clone();
        options.password = self.password.clone();
        options.headers = self.headers.clone();
        options.ssl_ca_cert = self.ssl_ca_certs.clone();
        options
    }
}

/// `on_error` entry: `response` is `transparent` or a color.
#[derive(Debug, Clone, Deserialize)]
pub struct OnErrorRule {
    pub response: OnErrorResponse,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub authorize_stale: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OnErrorResponse {
    Keyword(String),
    Rgb([u8; 3]),
    Rgba([u8; 4]),
}

/// Build an [`HttpErrorHandler`] from `on_error` entries keyed by status
/// code or `other`.
pub fn error_handler_from(rules: &HashMap<String, OnErrorRule>) -> Result<HttpErrorHandler> {
    let mut handler = HttpErrorHandler::new();
    for (key, rule) in rules {
        let color = match &rule.response {
            OnErrorResponse::Keyword(k) if k == "transparent" => None,
            OnErrorResponse::Keyword(k) => {
                return Err(TileError::config(format!(
                    "invalid on_error response {:?}",
                    k
                )))
            }
            OnErrorResponse::Rgb([r, g, b]) => Some([*r, *g, *b, 255]),
            OnErrorResponse::Rgba(rgba) => Some(*rgba),
        };
        let entry = ErrorRule {
            color,
            cacheable: rule.cache,
            authorize_stale: rule.authorize_stale,
        };
        if key == "other" {
            handler = handler.with_other(entry);
        } else {
            let status: u16 = key.parse().map_err(|_| {
                TileError::config(format!("invalid error code {:?} in on_error", key))
            })?;
            handler = handler.add_rule(status, entry);
        }
    }
    Ok(handler)
}

/// Source definition, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Wms {
        req: WmsReq,
        #[serde(default)]
        supported_srs: Vec<String>,
        #[serde(default)]
        supported_formats: Vec<String>,
        #[serde(default)]
        concurrent_requests: Option<usize>,
        #[serde(default)]
        http: HttpConfig,
        #[serde(default)]
        on_error: HashMap<String, OnErrorRule>,
        #[serde(default)]
        wms_opts: WmsOpts,
        #[serde(default)]
        seed_only: bool,
        #[serde(default)]
        min_res: Option<f64>,
        #[serde(default)]
        max_res: Option<f64>,
    },
    Arcgis {
        req: ArcGisReq,
        #[serde(default)]
        supported_srs: Vec<String>,
        #[serde(default)]
        http: HttpConfig,
        #[serde(default)]
        on_error: HashMap<String, OnErrorRule>,
        #[serde(default)]
        seed_only: bool,
    },
    Tile {
        url: String,
        grid: String,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        http: HttpConfig,
        #[serde(default)]
        on_error: HashMap<String, OnErrorRule>,
        #[serde(default)]
        seed_only: bool,
    },
    Mapserver {
        req: WmsReq,
        mapfile: PathBuf,
        #[serde(default)]
        binary: Option<PathBuf>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default)]
        supported_srs: Vec<String>,
        #[serde(default)]
        seed_only: bool,
    },
    Mapnik {
        mapfile: PathBuf,
        #[serde(default)]
        command: Option<PathBuf>,
        #[serde(default)]
        supported_srs: Vec<String>,
        #[serde(default)]
        seed_only: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WmsReq {
    pub url: String,
    /// Comma-separated upstream layer names
    #[serde(default)]
    pub layers: String,
    #[serde(default)]
    pub styles: Option<String>,
    #[serde(default = "default_true")]
    pub transparent: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArcGisReq {
    pub url: String,
    #[serde(default)]
    pub layers: String,
    #[serde(default = "default_true")]
    pub transparent: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WmsOpts {
    #[serde(default)]
    pub version: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Process-wide defaults consumed by the builder.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalsConfig {
    /// Cache base directory
    pub cache_dir: PathBuf,
    /// Lock directory; defaults to `<cache_dir>/tile_locks`
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    /// Lock and upstream-wait timeout in seconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: f64,
}

fn default_lock_timeout() -> f64 {
    60.0
}

impl GlobalsConfig {
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("tile_locks"))
    }
}

/// Resolve the stored-image options of a cache.
pub fn image_options_for(config: &CacheConfig) -> Result<ImageOptions> {
    let mut opts = ImageOptions::default();
    if let Some(mime) = &config.format {
        opts.format = TileFormat::from_mime(mime)
            .ok_or_else(|| TileError::config(format!("unknown format {:?}", mime)))?;
    }
    if opts.format == TileFormat::Jpeg {
        opts.mode = ImageMode::Rgb;
        opts.transparent = false;
    }
    opts.resampling = Resampling::Bicubic;
    Ok(opts)
}
