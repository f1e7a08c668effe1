//! Filesystem cache backend.
//!
//! One file per tile under a configurable directory layout. Stores write to
//! a temporary name in the target directory and rename into place, so
//! readers never observe a partial tile. Optionally, tiles consisting of a
//! single color are deduplicated into `single_color_tiles/` and linked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graticule_core::{Coverage, TileCoord, TileGrid};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use crate::cache::{reject_dimensions, Dimensions, DirectoryLayout, TileStore};
use crate::error::{Result, TileError};
use crate::image::{ImageOptions, TileFormat};
use crate::tile::Tile;

/// How duplicate single-color tiles reference the canonical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Symlink,
    Hardlink,
}

/// Filesystem tile store.
pub struct FileStore {
    base_dir: PathBuf,
    layout: DirectoryLayout,
    grid: Arc<TileGrid>,
    format: TileFormat,
    image_opts: ImageOptions,
    link_single_color: Option<LinkMode>,
    coverage: Option<Coverage>,
    lock_cache_id: String,
}

impl FileStore {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        layout: DirectoryLayout,
        grid: Arc<TileGrid>,
        image_opts: ImageOptions,
    ) -> Self {
        let base_dir = base_dir.into();
        let lock_cache_id = format!("{:x}", md5::compute(base_dir.to_string_lossy().as_bytes()));
        let format = image_opts.format;
        Self {
            base_dir,
            layout,
            grid,
            format,
            image_opts,
            link_single_color: None,
            coverage: None,
            lock_cache_id,
        }
    }

    /// Enable single-color tile deduplication.
    pub fn with_single_color_links(mut self, mode: LinkMode) -> Self {
        self.link_single_color = Some(mode);
        self
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Absolute path of a tile file.
    pub fn tile_path(&self, coord: TileCoord) -> Result<PathBuf> {
        let key = self
            .layout
            .tile_key(coord, &self.grid, self.format.extension())?;
        Ok(self.base_dir.join(key))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes to `path` atomically via a same-directory temp file.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        Self::ensure_parent(path).await?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Store a single-color tile as a link to one canonical file. The hash
    /// covers the decoded pixel value, not encoded metadata.
    async fn store_linked(&self, path: &Path, bytes: &[u8], color: [u8; 4], mode: LinkMode) -> Result<()> {
        let digest = md5::compute(color);
        let canonical = self
            .base_dir
            .join("single_color_tiles")
            .join(format!("{:x}.{}", digest, self.format.extension()));
        if fs::metadata(&canonical).await.is_err() {
            Self::write_atomic(&canonical, bytes).await?;
        }
        Self::ensure_parent(path).await?;
        let _ = fs::remove_file(path).await;
        #[cfg(unix)]
        {
            match mode {
                LinkMode::Symlink => fs::symlink(&canonical, path).await?,
                LinkMode::Hardlink => fs::hard_link(&canonical, path).await?,
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            Self::write_atomic(path, bytes).await
        }
    }
}

#[async_trait]
impl TileStore for FileStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    fn coverage(&self) -> Option<&Coverage> {
        self.coverage.as_ref()
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("file", dimensions)?;
        let path = self.tile_path(tile.coord)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if with_metadata {
            if let Ok(meta) = fs::metadata(&path).await {
                if let Ok(mtime) = meta.modified() {
                    tile.timestamp = Some(DateTime::<Utc>::from(mtime));
                }
            }
        }
        tile.size = Some(bytes.len() as u64);
        tile.data = Some(crate::tile::TileData::Encoded {
            bytes: bytes.into(),
            format: self.format,
        });
        Ok(true)
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("file", dimensions)?;
        let path = self.tile_path(tile.coord)?;
        let bytes = tile.to_buffer(&self.image_opts)?;

        if let Some(mode) = self.link_single_color {
            if let Some(color) = tile.to_image()?.and_then(|img| img.single_color()) {
                return self.store_linked(&path, &bytes, color, mode).await;
            }
        }
        Self::write_atomic(&path, &bytes).await
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("file", dimensions)?;
        let path = self.tile_path(coord)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_cached(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<bool> {
        reject_dimensions("file", dimensions)?;
        let path = self.tile_path(coord)?;
        Ok(fs::metadata(&path).await.is_ok())
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("file", dimensions)?;
        let path = self.tile_path(tile.coord)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        tile.size = Some(meta.len());
        if let Ok(mtime) = meta.modified() {
            tile.timestamp = Some(DateTime::<Utc>::from(mtime));
        }
        Ok(true)
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("base_dir", &self.base_dir)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TileImage;
    use graticule_core::GridOrigin;
    use tempfile::tempdir;

    fn store(dir: &Path) -> FileStore {
        let grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest));
        FileStore::new(dir, DirectoryLayout::Tc, grid, ImageOptions::default())
    }

    fn solid_tile(coord: TileCoord, color: [u8; 4]) -> Tile {
        Tile::with_image(coord, TileImage::solid((16, 16), color))
    }

    #[tokio::test]
    async fn test_store_load_remove() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let coord = TileCoord::new(3, 1, 2);

        assert!(!store.is_cached(coord, None).await.unwrap());
        store.store_tile(&solid_tile(coord, [9, 9, 9, 255]), None).await.unwrap();
        assert!(store.is_cached(coord, None).await.unwrap());

        let mut tile = Tile::new(coord);
        assert!(store.load_tile(&mut tile, true, None).await.unwrap());
        assert!(tile.timestamp.is_some());
        let img = tile.to_image().unwrap().unwrap();
        assert_eq!(img.single_color(), Some([9, 9, 9, 255]));

        store.remove_tile(coord, None).await.unwrap();
        assert!(!store.is_cached(coord, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_load_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut tile = Tile::new(TileCoord::new(5, 0, 0));
        assert!(!store.load_tile(&mut tile, false, None).await.unwrap());
        assert!(tile.is_missing());
    }

    #[tokio::test]
    async fn test_tc_path_on_disk() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let coord = TileCoord::new(1, 0, 1);
        store.store_tile(&solid_tile(coord, [1, 2, 3, 255]), None).await.unwrap();
        let expected = dir.path().join("01/000/000/000/000/000/001.png");
        assert!(expected.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_color_tiles_are_linked() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).with_single_color_links(LinkMode::Symlink);

        let a = TileCoord::new(4, 0, 0);
        let b = TileCoord::new(4, 1, 0);
        store.store_tile(&solid_tile(a, [0, 0, 255, 255]), None).await.unwrap();
        store.store_tile(&solid_tile(b, [0, 0, 255, 255]), None).await.unwrap();

        let path_a = store.tile_path(a).unwrap();
        let meta = tokio::fs::symlink_metadata(&path_a).await.unwrap();
        assert!(meta.file_type().is_symlink());

        // Both resolve to the same canonical bytes.
        let mut tile = Tile::new(b);
        assert!(store.load_tile(&mut tile, false, None).await.unwrap());
        let img = tile.to_image().unwrap().unwrap();
        assert_eq!(img.single_color(), Some([0, 0, 255, 255]));
    }

    #[tokio::test]
    async fn test_dimensions_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut dims = Dimensions::new();
        dims.insert("time".into(), "now".into());
        let mut tile = Tile::new(TileCoord::new(1, 0, 0));
        assert!(store.load_tile(&mut tile, false, Some(&dims)).await.is_err());
    }
}
