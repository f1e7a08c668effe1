//! GeoPackage cache backend.
//!
//! Stores tiles in an OGC GeoPackage: the tile matrix set is written from
//! the grid at creation time, and tile rows use the GeoPackage top-left row
//! counting. Like MBTiles, a level-split variant exists for cheap per-level
//! expiry.

use async_trait::async_trait;
use graticule_core::{GridOrigin, TileCoord, TileGrid};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::mbtiles::SqliteOptions;
use crate::cache::{reject_dimensions, Dimensions, TileStore};
use crate::error::Result;
use crate::image::{ImageOptions, TileFormat};
use crate::tile::{Tile, TileData};

/// GeoPackage tile store.
pub struct GeoPackageStore {
    path: PathBuf,
    table: String,
    conn: Mutex<Connection>,
    grid: Arc<TileGrid>,
    format: TileFormat,
    image_opts: ImageOptions,
    lock_cache_id: String,
}

impl GeoPackageStore {
    /// Create or open a GeoPackage with one tile pyramid table.
    pub fn open(
        path: impl Into<PathBuf>,
        table: impl Into<String>,
        grid: Arc<TileGrid>,
        image_opts: ImageOptions,
        options: &SqliteOptions,
    ) -> Result<Self> {
        let path = path.into();
        let table = table.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(std::time::Duration::from_millis(options.timeout_ms as u64))?;
        if options.wal {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        Self::create_schema(&conn, &table, &grid)?;

        let lock_cache_id = format!(
            "{:x}",
            md5::compute(format!("{}:{}", path.to_string_lossy(), table).as_bytes())
        );
        let format = image_opts.format;
        Ok(Self {
            path,
            table,
            conn: Mutex::new(conn),
            grid,
            format,
            image_opts,
            lock_cache_id,
        })
    }

    fn create_schema(conn: &Connection, table: &str, grid: &TileGrid) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
                srs_name TEXT NOT NULL,
                srs_id INTEGER PRIMARY KEY,
                organization TEXT NOT NULL,
                organization_coordsys_id INTEGER NOT NULL,
                definition TEXT NOT NULL,
                description TEXT
            );
            CREATE TABLE IF NOT EXISTS gpkg_contents (
                table_name TEXT PRIMARY KEY,
                data_type TEXT NOT NULL,
                identifier TEXT UNIQUE,
                description TEXT DEFAULT '',
                last_change DATETIME DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
                srs_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS gpkg_tile_matrix_set (
                table_name TEXT PRIMARY KEY,
                srs_id INTEGER NOT NULL,
                min_x DOUBLE NOT NULL, min_y DOUBLE NOT NULL,
                max_x DOUBLE NOT NULL, max_y DOUBLE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS gpkg_tile_matrix (
                table_name TEXT NOT NULL,
                zoom_level INTEGER NOT NULL,
                matrix_width INTEGER NOT NULL,
                matrix_height INTEGER NOT NULL,
                tile_width INTEGER NOT NULL,
                tile_height INTEGER NOT NULL,
                pixel_x_size DOUBLE NOT NULL,
                pixel_y_size DOUBLE NOT NULL,
                CONSTRAINT pk_ttm PRIMARY KEY (table_name, zoom_level)
            );",
        )?;

        let srs = grid.srs();
        conn.execute(
            "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
             (srs_name, srs_id, organization, organization_coordsys_id, definition)
             VALUES (?1, ?2, 'EPSG', ?2, 'undefined')",
            params![srs.to_string(), srs.code()],
        )?;

        let bbox = grid.bbox();
        conn.execute(
            "INSERT OR IGNORE INTO gpkg_contents
             (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id)
             VALUES (?1, 'tiles', ?1, ?2, ?3, ?4, ?5, ?6)",
            params![table, bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y, srs.code()],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO gpkg_tile_matrix_set
             (table_name, srs_id, min_x, min_y, max_x, max_y)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![table, srs.code(), bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y],
        )?;

        let (tile_w, tile_h) = grid.tile_size();
        for z in 0..grid.levels() as u8 {
            let res = grid.resolution(z)?;
            let (w, h) = grid.grid_size(z)?;
            conn.execute(
                "INSERT OR IGNORE INTO gpkg_tile_matrix
                 (table_name, zoom_level, matrix_width, matrix_height,
                  tile_width, tile_height, pixel_x_size, pixel_y_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![table, z, w, h, tile_w, tile_h, res],
            )?;
        }

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    zoom_level INTEGER NOT NULL,
                    tile_column INTEGER NOT NULL,
                    tile_row INTEGER NOT NULL,
                    tile_data BLOB NOT NULL,
                    UNIQUE (zoom_level, tile_column, tile_row)
                )",
                table
            ),
            [],
        )?;
        Ok(())
    }

    /// GeoPackage rows count from the north.
    fn gpkg_row(&self, coord: TileCoord) -> Result<u32> {
        Ok(match self.grid.origin() {
            GridOrigin::NorthWest => coord.y,
            GridOrigin::SouthWest => self.grid.flip_y(coord)?.y,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl TileStore for GeoPackageStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        _with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("geopackage", dimensions)?;
        let row = self.gpkg_row(tile.coord)?;
        let conn = self.conn.lock();
        let data: Option<Vec<u8>> = conn
            .query_row(
                &format!(
                    "SELECT tile_data FROM \"{}\"
                     WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                    self.table
                ),
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

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        self.store_tiles(std::slice::from_ref(tile), dimensions).await
    }

    async fn store_tiles(&self, tiles: &[Tile], dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("geopackage", dimensions)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for tile in tiles {
            let row = self.gpkg_row(tile.coord)?;
            let bytes = tile.to_buffer(&self.image_opts)?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO \"{}\"
                     (zoom_level, tile_column, tile_row, tile_data)
                     VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ),
                params![tile.coord.z, tile.coord.x, row, bytes.as_ref()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("geopackage", dimensions)?;
        let row = self.gpkg_row(coord)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "DELETE FROM \"{}\"
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                self.table
            ),
            params![coord.z, coord.x, row],
        )?;
        Ok(())
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("geopackage", dimensions)?;
        let row = self.gpkg_row(tile.coord)?;
        let conn = self.conn.lock();
        let size: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT length(tile_data) FROM \"{}\"
                     WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                    self.table
                ),
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

/// One GeoPackage per zoom level (and per dimension set).
pub struct GeoPackageLevelStore {
    dir: PathBuf,
    table: String,
    grid: Arc<TileGrid>,
    image_opts: ImageOptions,
    sqlite_options: SqliteOptions,
    levels: Mutex<HashMap<String, Arc<GeoPackageStore>>>,
    lock_cache_id: String,
}

impl GeoPackageLevelStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        table: impl Into<String>,
        grid: Arc<TileGrid>,
        image_opts: ImageOptions,
        sqlite_options: SqliteOptions,
    ) -> Self {
        let dir = dir.into();
        let lock_cache_id = format!("{:x}", md5::compute(dir.to_string_lossy().as_bytes()));
        Self {
            dir,
            table: table.into(),
            grid,
            image_opts,
            sqlite_options,
            levels: Mutex::new(HashMap::new()),
            lock_cache_id,
        }
    }

    fn level_file_name(&self, z: u8, dimensions: Option<&Dimensions>) -> String {
        match dimensions {
            Some(d) if !d.is_empty() => {
                format!("{:02}_{}.gpkg", z, crate::cache::dimensions_key(d))
            }
            _ => format!("{:02}.gpkg", z),
        }
    }

    fn level_store(&self, z: u8, dimensions: Option<&Dimensions>) -> Result<Arc<GeoPackageStore>> {
        let file_name = self.level_file_name(z, dimensions);
        let mut levels = self.levels.lock();
        if let Some(store) = levels.get(&file_name) {
            return Ok(store.clone());
        }
        let store = Arc::new(GeoPackageStore::open(
            self.dir.join(&file_name),
            self.table.clone(),
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
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TileStore for GeoPackageLevelStore {
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

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        let store = self.level_store(tile.coord.z, dimensions)?;
        store.store_tile(tile, None).await
    }

    async fn store_tiles(&self, tiles: &[Tile], dimensions: Option<&Dimensions>) -> Result<()> {
        if let Some(first) = tiles.first() {
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

    fn open(dir: &std::path::Path) -> GeoPackageStore {
        let grid = Arc::new(TileGrid::web_mercator(10, GridOrigin::SouthWest));
        GeoPackageStore::open(
            dir.join("tiles.gpkg"),
            "osm_tiles",
            grid,
            ImageOptions::default(),
            &SqliteOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let coord = TileCoord::new(3, 2, 1);
        let tile = Tile::with_image(coord, TileImage::solid((8, 8), [1, 2, 3, 255]));

        store.store_tile(&tile, None).await.unwrap();
        let mut loaded = Tile::new(coord);
        assert!(store.load_tile(&mut loaded, false, None).await.unwrap());
        assert_eq!(
            loaded.to_image().unwrap().unwrap().single_color(),
            Some([1, 2, 3, 255])
        );

        store.remove_tile(coord, None).await.unwrap();
        assert!(!store.is_cached(coord, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_tile_matrix_written() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let conn = store.conn.lock();
        let levels: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM gpkg_tile_matrix WHERE table_name = 'osm_tiles'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(levels, 10);
        let srs: i64 = conn
            .query_row(
                "SELECT srs_id FROM gpkg_contents WHERE table_name = 'osm_tiles'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(srs, 900913);
    }

    #[tokio::test]
    async fn test_level_store_splits_files_and_takes_dimensions() {
        let dir = tempdir().unwrap();
        let grid = Arc::new(TileGrid::web_mercator(10, GridOrigin::SouthWest));
        let store = GeoPackageLevelStore::new(
            dir.path(),
            "osm_tiles",
            grid,
            ImageOptions::default(),
            SqliteOptions::default(),
        );
        assert!(store.supports_dimensions());

        let tile = Tile::with_image(
            TileCoord::new(4, 1, 1),
            TileImage::solid((8, 8), [5, 5, 5, 255]),
        );
        store.store_tile(&tile, None).await.unwrap();
        assert!(dir.path().join("04.gpkg").exists());

        let mut dims = Dimensions::new();
        dims.insert("elevation".into(), "500".into());
        store.store_tile(&tile, Some(&dims)).await.unwrap();
        assert!(dir.path().join("04_elevation-500.gpkg").exists());

        store.remove_level(4, None).await.unwrap();
        assert!(!dir.path().join("04.gpkg").exists());
        assert!(store.is_cached(tile.coord, Some(&dims)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rows_count_from_north() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        // SW row 0 at level 1 is GeoPackage row 1.
        let tile = Tile::with_image(
            TileCoord::new(1, 0, 0),
            TileImage::solid((8, 8), [0, 0, 0, 255]),
        );
        store.store_tile(&tile, None).await.unwrap();
        let conn = store.conn.lock();
        let row: u32 = conn
            .query_row("SELECT tile_row FROM \"osm_tiles\" LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(row, 1);
    }
}
