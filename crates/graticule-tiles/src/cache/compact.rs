//! Compact bundle cache backend (ArcGIS compact cache v1 and v2).
//!
//! Tiles are packed 128x128 per bundle file under `L<zz>/R<rrrr>C<cccc>`,
//! rows counted from the north. Version 1 keeps the offset index in a
//! sidecar `.bundlx` file; version 2 holds a 64-bit index inside the
//! `.bundle` itself, with the tile size packed into the upper 24 bits of
//! each entry. Writes append the blob and rewrite the index entry in place;
//! readers never see a torn tile because the entry flips only after the
//! blob is complete.

use async_trait::async_trait;
use graticule_core::{GridOrigin, TileCoord, TileGrid};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{reject_dimensions, Dimensions, TileStore};
use crate::error::{Result, TileError};
use crate::image::{ImageOptions, TileFormat};
use crate::tile::{Tile, TileData};

/// Tiles per bundle axis.
const BUNDLE_SPAN: u32 = 128;
/// Tiles per bundle file.
const TILES_PER_BUNDLE: usize = (BUNDLE_SPAN * BUNDLE_SPAN) as usize;

/// V1 sidecar index: 16-byte header, then 5-byte little-endian offsets.
const BUNDLX_HEADER: usize = 16;
const BUNDLX_MAGIC: &[u8; 8] = b"BUNDLX01";
/// V1 bundle data file header.
const BUNDLE_V1_HEADER: usize = 60;
/// V2 bundle: 64-byte header, then 8-byte entries `offset | size << 40`.
const BUNDLE_V2_HEADER: usize = 64;
const BUNDLE_V2_MAGIC: &[u8; 8] = b"BUNDLE02";

/// Bundle format generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactVersion {
    V1,
    V2,
}

/// Compact bundle tile store.
pub struct CompactStore {
    base_dir: PathBuf,
    version: CompactVersion,
    grid: Arc<TileGrid>,
    image_opts: ImageOptions,
    lock_cache_id: String,
    // One writer per process; cross-process exclusion is the tile locker's
    // job.
    io_lock: Mutex<()>,
}

impl CompactStore {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        version: CompactVersion,
        grid: Arc<TileGrid>,
        image_opts: ImageOptions,
    ) -> Self {
        let base_dir = base_dir.into();
        let lock_cache_id = format!("{:x}", md5::compute(base_dir.to_string_lossy().as_bytes()));
        Self {
            base_dir,
            version,
            grid,
            image_opts,
            lock_cache_id,
            io_lock: Mutex::new(()),
        }
    }

    /// Row counted from the north, as the bundle scheme expects.
    fn north_row(&self, coord: TileCoord) -> Result<u32> {
        Ok(match self.grid.origin() {
            GridOrigin::NorthWest => coord.y,
            GridOrigin::SouthWest => self.grid.flip_y(coord)?.y,
        })
    }

    /// Bundle file path (without extension) and the tile's index inside it.
    fn bundle_location(&self, coord: TileCoord) -> Result<(PathBuf, usize)> {
        let row = self.north_row(coord)?;
        let row_base = row - row % BUNDLE_SPAN;
        let col_base = coord.x - coord.x % BUNDLE_SPAN;
        let path = self
            .base_dir
            .join(format!("L{:02}", coord.z))
            .join(format!("R{:04x}C{:04x}", row_base, col_base));
        let index =
            ((coord.x - col_base) * BUNDLE_SPAN + (row - row_base)) as usize;
        Ok((path, index))
    }

    fn read_offset_v1(bundlx: &mut File, index: usize) -> Result<u64> {
        bundlx.seek(SeekFrom::Start((BUNDLX_HEADER + index * 5) as u64))?;
        let mut buf = [0u8; 8];
        bundlx.read_exact(&mut buf[..5])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_entry_v2(bundle: &mut File, index: usize) -> Result<u64> {
        bundle.seek(SeekFrom::Start((BUNDLE_V2_HEADER + index * 8) as u64))?;
        let mut buf = [0u8; 8];
        bundle.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn load_bytes(&self, coord: TileCoord) -> Result<Option<Vec<u8>>> {
        let (path, index) = self.bundle_location(coord)?;
        match self.version {
            CompactVersion::V1 => {
                let bundlx_path = path.with_extension("bundlx");
                let mut bundlx = match File::open(&bundlx_path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let offset = Self::read_offset_v1(&mut bundlx, index)?;
                if offset == 0 {
                    return Ok(None);
                }
                let mut bundle = File::open(path.with_extension("bundle"))?;
                bundle.seek(SeekFrom::Start(offset))?;
                let mut size_buf = [0u8; 4];
                bundle.read_exact(&mut size_buf)?;
                let size = u32::from_le_bytes(size_buf) as usize;
                if size == 0 {
                    return Ok(None);
                }
                let mut data = vec![0u8; size];
                bundle.read_exact(&mut data)?;
                Ok(Some(data))
            }
            CompactVersion::V2 => {
                let bundle_path = path.with_extension("bundle");
                let mut bundle = match File::open(&bundle_path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let entry = Self::read_entry_v2(&mut bundle, index)?;
                let size = (entry >> 40) as usize;
                let offset = entry & 0xFF_FFFF_FFFF;
                if size == 0 {
                    return Ok(None);
                }
                bundle.seek(SeekFrom::Start(offset))?;
                let mut data = vec![0u8; size];
                bundle.read_exact(&mut data)?;
                Ok(Some(data))
            }
        }
    }

    fn create_v1_files(path: &Path) -> Result<()> {
        std::fs::create_dir_all(path.parent().ok_or_else(|| {
            TileError::cache("compact bundle path has no parent".to_string())
        })?)?;
        let bundlx_path = path.with_extension("bundlx");
        if !bundlx_path.exists() {
            let mut bundlx = File::create(&bundlx_path)?;
            let mut header = [0u8; BUNDLX_HEADER];
            header[..8].copy_from_slice(BUNDLX_MAGIC);
            bundlx.write_all(&header)?;
            bundlx.write_all(&vec![0u8; TILES_PER_BUNDLE * 5])?;
        }
        let bundle_path = path.with_extension("bundle");
        if !bundle_path.exists() {
            let mut bundle = File::create(&bundle_path)?;
            bundle.write_all(&[0u8; BUNDLE_V1_HEADER])?;
        }
        Ok(())
    }

    fn create_v2_file(path: &Path) -> Result<()> {
        std::fs::create_dir_all(path.parent().ok_or_else(|| {
            TileError::cache("compact bundle path has no parent".to_string())
        })?)?;
        let bundle_path = path.with_extension("bundle");
        if !bundle_path.exists() {
            let mut bundle = File::create(&bundle_path)?;
            let mut header = [0u8; BUNDLE_V2_HEADER];
            header[..8].copy_from_slice(BUNDLE_V2_MAGIC);
            bundle.write_all(&header)?;
            bundle.write_all(&vec![0u8; TILES_PER_BUNDLE * 8])?;
        }
        Ok(())
    }

    fn store_bytes(&self, coord: TileCoord, data: &[u8]) -> Result<()> {
        let (path, index) = self.bundle_location(coord)?;
        match self.version {
            CompactVersion::V1 => {
                Self::create_v1_files(&path)?;
                let mut bundle = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path.with_extension("bundle"))?;
                let offset = bundle.seek(SeekFrom::End(0))?;
                bundle.write_all(&(data.len() as u32).to_le_bytes())?;
                bundle.write_all(data)?;
                bundle.sync_data()?;

                let mut bundlx = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path.with_extension("bundlx"))?;
                bundlx.seek(SeekFrom::Start((BUNDLX_HEADER + index * 5) as u64))?;
                bundlx.write_all(&offset.to_le_bytes()[..5])?;
                bundlx.sync_data()?;
            }
            CompactVersion::V2 => {
                Self::create_v2_file(&path)?;
                let mut bundle = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path.with_extension("bundle"))?;
                let offset = bundle.seek(SeekFrom::End(0))?;
                bundle.write_all(data)?;
                bundle.sync_data()?;

                let entry = offset | (data.len() as u64) << 40;
                bundle.seek(SeekFrom::Start((BUNDLE_V2_HEADER + index * 8) as u64))?;
                bundle.write_all(&entry.to_le_bytes())?;
                bundle.sync_data()?;
            }
        }
        Ok(())
    }

    fn remove_entry(&self, coord: TileCoord) -> Result<()> {
        let (path, index) = self.bundle_location(coord)?;
        match self.version {
            CompactVersion::V1 => {
                let bundlx_path = path.with_extension("bundlx");
                let mut bundlx = match OpenOptions::new().read(true).write(true).open(&bundlx_path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                bundlx.seek(SeekFrom::Start((BUNDLX_HEADER + index * 5) as u64))?;
                bundlx.write_all(&[0u8; 5])?;
            }
            CompactVersion::V2 => {
                let bundle_path = path.with_extension("bundle");
                let mut bundle = match OpenOptions::new().read(true).write(true).open(&bundle_path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                bundle.seek(SeekFrom::Start((BUNDLE_V2_HEADER + index * 8) as u64))?;
                bundle.write_all(&0u64.to_le_bytes())?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TileStore for CompactStore {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    async fn load_tile(
        &self,
        tile: &mut Tile,
        _with_metadata: bool,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("compact", dimensions)?;
        let format = self.image_opts.format;
        match self.load_bytes(tile.coord)? {
            Some(bytes) => {
                tile.size = Some(bytes.len() as u64);
                tile.data = Some(TileData::Encoded {
                    bytes: bytes.into(),
                    format,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn store_tile(&self, tile: &Tile, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("compact", dimensions)?;
        let bytes = tile.to_buffer(&self.image_opts)?;
        let _guard = self.io_lock.lock();
        self.store_bytes(tile.coord, &bytes)
    }

    async fn store_tiles(&self, tiles: &[Tile], dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("compact", dimensions)?;
        // Hold the writer lock across the batch so a meta-tile lands in one
        // append run.
        let encoded: Vec<_> = tiles
            .iter()
            .map(|t| t.to_buffer(&self.image_opts).map(|b| (t.coord, b)))
            .collect::<Result<_>>()?;
        let _guard = self.io_lock.lock();
        for (coord, bytes) in encoded {
            self.store_bytes(coord, &bytes)?;
        }
        Ok(())
    }

    async fn remove_tile(&self, coord: TileCoord, dimensions: Option<&Dimensions>) -> Result<()> {
        reject_dimensions("compact", dimensions)?;
        let _guard = self.io_lock.lock();
        self.remove_entry(coord)
    }

    async fn load_tile_metadata(
        &self,
        tile: &mut Tile,
        dimensions: Option<&Dimensions>,
    ) -> Result<bool> {
        reject_dimensions("compact", dimensions)?;
        match self.load_bytes(tile.coord)? {
            Some(bytes) => {
                tile.size = Some(bytes.len() as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
