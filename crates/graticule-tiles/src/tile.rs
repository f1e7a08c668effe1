//! The tile model.
//!
//! A [`Tile`] is constructed as an empty placeholder for its coordinate and
//! populated either by a cache load or by a render. The payload stays in
//! whichever representation it arrived in (encoded bytes or a decoded
//! raster) until a caller forces the other.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use graticule_core::TileCoord;

use crate::error::Result;
use crate::image::{ImageOptions, TileFormat, TileImage};

/// Tile payload in one of its two representations.
#[derive(Debug, Clone)]
pub enum TileData {
    /// Encoded bytes as stored in a cache
    Encoded { bytes: Bytes, format: TileFormat },
    /// Decoded raster as produced by a render
    Image(TileImage),
}

/// A tile on a grid, with lazy payload.
#[derive(Debug, Clone)]
pub struct Tile {
    pub coord: TileCoord,
    pub data: Option<TileData>,
    /// Whether a backend may persist this tile
    pub cacheable: bool,
    /// Storage timestamp, populated on load
    pub timestamp: Option<DateTime<Utc>>,
    /// Stored size in bytes, populated on load
    pub size: Option<u64>,
    /// Set when the payload is an expired copy served across a render
    /// failure
    pub stale: bool,
    /// Set when the tile could not be produced at all
    pub error: Option<String>,
}

impl Tile {
    /// An empty placeholder for `coord`.
    pub fn new(coord: TileCoord) -> Self {
        Self {
            coord,
            data: None,
            cacheable: true,
            timestamp: None,
            size: None,
            stale: false,
            error: None,
        }
    }

    /// A tile carrying a decoded raster.
    pub fn with_image(coord: TileCoord, image: TileImage) -> Self {
        let mut tile = Self::new(coord);
        tile.data = Some(TileData::Image(image));
        tile
    }

    /// A tile carrying encoded bytes.
    pub fn with_bytes(coord: TileCoord, bytes: Bytes, format: TileFormat) -> Self {
        let mut tile = Self::new(coord);
        tile.size = Some(bytes.len() as u64);
        tile.data = Some(TileData::Encoded { bytes, format });
        tile
    }

    /// Whether the tile still has no payload.
    pub fn is_missing(&self) -> bool {
        self.data.is_none()
    }

    /// Encoded bytes, encoding the raster on demand.
    pub fn to_buffer(&self, opts: &ImageOptions) -> Result<Bytes> {
        match &self.data {
            Some(TileData::Encoded { bytes, .. }) => Ok(bytes.clone()),
            Some(TileData::Image(img)) => img.to_bytes(opts),
            None => TileImage::blank((256, 256), opts).to_bytes(opts),
        }
    }

    /// Decoded raster, decoding the bytes on demand.
    pub fn to_image(&self) -> Result<Option<TileImage>> {
        match &self.data {
            Some(TileData::Encoded { bytes, .. }) => Ok(Some(TileImage::from_bytes(bytes)?)),
            Some(TileData::Image(img)) => Ok(Some(img.clone())),
            None => Ok(None),
        }
    }

    /// Drop the payload, keeping coordinate and metadata.
    pub fn clear(&mut self) {
        self.data = None;
        self.size = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder() {
        let tile = Tile::new(TileCoord::new(3, 1, 2));
        assert!(tile.is_missing());
        assert!(tile.cacheable);
        assert!(tile.timestamp.is_none());
    }

    #[test]
    fn test_roundtrip_through_buffer() {
        let opts = ImageOptions::default();
        let img = TileImage::solid((8, 8), [1, 2, 3, 255]);
        let tile = Tile::with_image(TileCoord::new(0, 0, 0), img);
        let bytes = tile.to_buffer(&opts).unwrap();

        let loaded = Tile::with_bytes(TileCoord::new(0, 0, 0), bytes, TileFormat::Png);
        let decoded = loaded.to_image().unwrap().unwrap();
        assert_eq!(decoded.single_color(), Some([1, 2, 3, 255]));
    }

    #[test]
    fn test_with_bytes_records_size() {
        let tile = Tile::with_bytes(
            TileCoord::new(1, 0, 0),
            Bytes::from_static(b"12345"),
            TileFormat::Png,
        );
        assert_eq!(tile.size, Some(5));
    }
}
