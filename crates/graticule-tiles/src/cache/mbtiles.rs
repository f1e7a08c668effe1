//! MBTiles cache backend.
//!
//! One SQLite database per cache+grid with the standard MBTiles schema
//! (https://github.com/mapbox/mbtiles-spec); tile rows are stored with TMS
//! row counting. The level variant splits the cache into one database per
//! zoom level, which makes wholesale level expiry cheap and enables cache
//! dimensions (one database per dimension set).

use async_trait::async_trait;
use graticule_core::{GridOrigin, TileCoord, TileGrid};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{dimensions_key, reject_dimensions, Dimensions, TileStore};
use crate::error::{Result, TileError};
use crate::image::{ImageOptions, TileFormat};
use crate::tile::{Tile, TileData};

/// SQLite tuning shared by the MBTiles and GeoPackage backends.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Enable write-ahead logging
    pub wal: bool,
    /// Busy timeout in milliseconds
    pub timeout_ms: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self { wal: false, timeout_ms: 30_000 }
    }
}

/// MBTiles tile store backed by a single database file.
pub struct MBTilesStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    grid: Arc<TileGrid>,
    format: TileFormat,
    image_opts: ImageOptions,
    lock_cache_id: String,
}

impl MBTilesStore {
    /// Create or open an MBTiles database.
    pub fn open(
        path: impl Into<PathBuf>,
        grid: Arc<TileGrid>,
        image_opts: ImageOptions,
        options: &SqliteOptions,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(std::time::Duration::from_millis(options.timeout_ms as u64))?;
        if options.wal {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                name TEXT PRIMARY KEY,
                value TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tiles (
                zoom_level INTEGER,
                tile_column INTEGER,
                tile_row INTEGER,
                tile_data BLOB,
                PRIMARY KEY (zoom_level, tile_column, tile_row)
            )",
            [],
        )?;

        let lock_cache_id = format!("{:x}", md5::compute(path.to_string_lossy().as_bytes()));
        let format = image_opts.format;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            grid,
            format,
            image_opts,
            lock_cache_id,
        })
    }

    /// Write the standard metadata rows.
    pub fn initialize_metadata(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        for (key, value) in [
            ("name", name),
            ("type", "baselayer"),
            ("version", "1.0.0"),
            ("format", self.format.extension()),
        ] {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// MBTiles rows count from the south.
    fn tms_row(&self, coord: TileCoord) -> Result<u32> {
        Ok(match self.grid.origin() {
            GridOrigin::SouthWest => coord.y,
            GridOrigin::NorthWest => self.grid.flip_y(coord)?.y,
        })
    }
}

#[async_trait]
impl TileStore for MBTilesStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        _with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("mbtiles", dimensions)?;
        let row = self.tms_row(tile.coord)?;
        let conn = self.conn.lock();
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT tile_data FROM tiles
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![tile.coord.z, tile.coord.x, row],
                |r| r.get(0),
            )
            .optional()?;
        match data {
            Some(bytes) => {
                tile.size = Some(bytes.len() as u64);
                tile.data = Some(TileData::Encoded {
                    bytes: bytes.into(),
                    format: self.format,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_tiles(
        &self,
        tiles: &mut [Tile],
        _with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<()> {
        reject_dimensions("mbtiles", dimensions)?;
        if tiles.is_empty() {
            return Ok(());
        }
        // One batched lookup; all tiles of a meta block share the level.
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tile_data FROM tiles
             WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
        )?;
        for tile in tiles.iter_mut() {
            let row = self.tms_row(tile.coord)?;
            let data: Option<Vec<u8>> = stmt
                .query_row(params![tile.coord.z, tile.coord.x, row], |r| r.get(0))
                .optional()?;
            if let Some(bytes) = data {
                tile.size = Some(bytes.len() as u64);
                tile.data = Some(TileData::Encoded {
                    bytes: bytes.into(),
                    format: self.format,
                });
            }
        }
        Ok(())
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        self.store_tiles(std::slice::from_ref(tile), dimensions).await
    }

    async fn store_tiles(&self, tiles: &[Tile], dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("mbtiles", dimensions)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for tile in tiles {
            let row = self.tms_row(tile.coord)?;
            let bytes = tile.to_buffer(&self.image_opts)?;
            tx.execute(
                "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![tile.coord.z, tile.coord.x, row, bytes.as_ref()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("mbtiles", dimensions)?;
        let row = self.tms_row(coord)?;
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
            params![coord.z, coord.x, row],
        )?;
        Ok(())
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("mbtiles", dimensions)?;
        let row = self.tms_row(tile.coord)?;
        let conn = self.conn.lock();
        let size: Option<i64> = conn
            .query_row(
                "SELECT length(tile_data) FROM tiles
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![tile.coord.z, tile.coord.x, row],
                |r| r.get(0),
            )
            .optional()?;
        match size {
            Some(size) => {
                tile.size = Some(size as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// One MBTiles database per zoom level (and per dimension set).
pub struct MBTilesLevelStore {
    dir: PathBuf,
    grid: Arc<TileGrid>,
    image_opts: ImageOptions,
    sqlite_options: SqliteOptions,
    levels: Mutex<HashMap<String, Arc<MBTilesStore>>>,
    lock_cache_id: String,
}

impl MBTilesLevelStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        grid: Arc<TileGrid>,
        image_opts: ImageOptions,
        sqlite_options: SqliteOptions,
    ) -> Self {
        let dir = dir.into();
        let lock_cache_id = format!("{:x}", md5::compute(dir.to_string_lossy().as_bytes()));
        Self {
            dir,
            grid,
            image_opts,
            sqlite_options,
            levels: Mutex::new(HashMap::new()),
            lock_cache_id,
        }
    }

    fn level_file_name(&self, z: u8, dimensions: Option<&Dimensions>) -> String {
        match dimensions {
            Some(d) if !d.is_empty() => format!("{:02}_{}.mbtiles", z, dimensions_key(d)),
            _ => format!("{:02}.mbtiles", z),
        }
    }

    fn level_store(&self, z: u8, dimensions: Option<&Dimensions>) -> Result<Arc<MBTilesStore>> {
        let file_name = self.level_file_name(z, dimensions);
        let mut levels = self.levels.lock();
        if let Some(store) = levels.get(&file_name) {
            return Ok(store.clone());
        }
        let store = Arc::new(MBTilesStore::open(
            self.dir.join(&file_name),
            self.grid.clone(),
            self.image_opts.clone(),
            &self.sqlite_options,
        )?);
        levels.insert(file_name, store.clone());
        Ok(store)
    }

    /// Drop a whole level, including its database file.
    pub async fn remove_level(&self, z: u8, dimensions: Option<&Dimensions>) -> Result<()> {
        let file_name = self.level_file_name(z, dimensions);
        self.levels.lock().remove(&file_name);
        match tokio::fs::remove_file(self.dir.join(&file_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TileError::from(e)),
        }
    }
}

#[async_trait]
impl TileStore for MBTilesLevelStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    fn supports_dimensions(&self) -> bool {
        true
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        let store = self.level_store(tile.coord.z, dimensions)?;
        store.load_tile(tile, with_metadata, None).await
    }

    async fn load_tiles(
        &self,
        tiles: &mut [Tile],
        with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<()> {
        // Group by level so each database opens once.
        for tile in tiles.iter_mut() {
            self.load_tile(tile, with_metadata, dimensions).await?;
        }
        Ok(())
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        let store = self.level_store(tile.coord.z, dimensions)?;
        store.store_tile(tile, None).await
    }

    async fn store_tiles(&self, tiles: &[Tile], dimensions: Option<&Dimensions>) -> Result<()> {
        if let Some(first) = tiles.first() {
            // Meta-tile batches share one level; keep the store's
            // transactional path.
            if tiles.iter().all(|t| t.coord.z == first.coord.z) {
                let store = self.level_store(first.coord.z, dimensions)?;
                return store.store_tiles(tiles, None).await;
            }
        }
        for tile in tiles {
            self.store_tile(tile, dimensions).await?;
        }
        Ok(())
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        let store = self.level_store(coord.z, dimensions)?;
        store.remove_tile(coord, None).await
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        let store = self.level_store(tile.coord.z, dimensions)?;
        store.load_tile_metadata(tile, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TileImage;
    use tempfile::tempdir;

    fn grid() -> Arc<TileGrid> {
        Arc::new(TileGrid::web_mercator(20, GridOrigin::SouthWest))
    }

    fn solid_tile(coord: TileCoord) -> Tile {
        Tile::with_image(coord, TileImage::solid((8, 8), [7, 7, 7, 255]))
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempdir().unwrap();
        let store = MBTilesStore::open(
            dir.path().join("cache.mbtiles"),
            grid(),
            ImageOptions::default(),
            &SqliteOptions::default(),
        )
        .unwrap();

        let coord = TileCoord::new(4, 3, 2);
        store.store_tile(&solid_tile(coord), None).await.unwrap();

        let mut tile = Tile::new(coord);
        assert!(store.load_tile(&mut tile, false, None).await.unwrap());
        assert!(tile.size.unwrap() > 0);

        assert!(store.is_cached(coord, None).await.unwrap());
        store.remove_tile(coord, None).await.unwrap();
        assert!(!store.is_cached(coord, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_batched_store_is_transactional() {
        let dir = tempdir().unwrap();
        let store = MBTilesStore::open(
            dir.path().join("cache.mbtiles"),
            grid(),
            ImageOptions::default(),
            &SqliteOptions { wal: true, ..Default::default() },
        )
        .unwrap();

        let tiles: Vec<Tile> = (0..4)
            .map(|i| solid_tile(TileCoord::new(3, i, 0)))
            .collect();
        store.store_tiles(&tiles, None).await.unwrap();
        for tile in &tiles {
            assert!(store.is_cached(tile.coord, None).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_level_store_splits_files() {
        let dir = tempdir().unwrap();
        let store = MBTilesLevelStore::new(
            dir.path(),
            grid(),
            ImageOptions::default(),
            SqliteOptions::default(),
        );

        store.store_tile(&solid_tile(TileCoord::new(2, 0, 0)), None).await.unwrap();
        store.store_tile(&solid_tile(TileCoord::new(5, 0, 0)), None).await.unwrap();

        assert!(dir.path().join("02.mbtiles").exists());
        assert!(dir.path().join("05.mbtiles").exists());

        store.remove_level(2, None).await.unwrap();
        assert!(!dir.path().join("02.mbtiles").exists());
        assert!(!store.is_cached(TileCoord::new(2, 0, 0), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_level_store_dimensions() {
        let dir = tempdir().unwrap();
        let store = MBTilesLevelStore::new(
            dir.path(),
            grid(),
            ImageOptions::default(),
            SqliteOptions::default(),
        );
        assert!(store.supports_dimensions());

        let mut dims = Dimensions::new();
        dims.insert("time".into(), "2024-06-01".into());
        let coord = TileCoord::new(3, 1, 1);
        store.store_tile(&solid_tile(coord), Some(&dims)).await.unwrap();

        assert!(dir.path().join("03_time-2024-06-01.mbtiles").exists());
        assert!(store.is_cached(coord, Some(&dims)).await.unwrap());
        assert!(!store.is_cached(coord, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_tms_row_flipping() {
        let dir = tempdir().unwrap();
        let nw_grid = Arc::new(TileGrid::web_mercator(20, GridOrigin::NorthWest));
        let store = MBTilesStore::open(
            dir.path().join("cache.mbtiles"),
            nw_grid,
            ImageOptions::default(),
            &SqliteOptions::default(),
        )
        .unwrap();

        // NW row 0 at level 1 is TMS row 1.
        store.store_tile(&solid_tile(TileCoord::new(1, 0, 0)), None).await.unwrap();
        let conn = store.conn.lock();
        let row: u32 = conn
            .query_row("SELECT tile_row FROM tiles LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(row, 1);
    }
}
