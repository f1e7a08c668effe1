//! Tile filters.
//!
//! Filters run on freshly rendered tiles before they are stored, so the
//! cache holds the filtered result. The only builtin filter is the
//! watermark.

use image::RgbaImage;

use crate::error::{Result, TileError};
use crate::image::ImageOptions;
use crate::tile::{Tile, TileData};

/// A transformation applied to every rendered tile before store.
pub trait TileFilter: Send + Sync {
    fn apply(&self, tile: Tile, opts: &ImageOptions) -> Result<Tile>;
}

/// Watermark placement density.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkSpacing {
    /// Watermark on every tile
    Every,
    /// Watermark on alternating tiles, checkerboard style
    Wide,
}

/// Draws translucent text across tile centers.
pub struct WatermarkFilter {
    text: String,
    font: fontdue::Font,
    font_size: f32,
    color: [u8; 3],
    opacity: f32,
    spacing: WatermarkSpacing,
}

impl WatermarkFilter {
    /// Build a watermark filter. `font_data` is the raw bytes of a TTF/OTF
    /// file.
    pub fn new(
        text: impl Into<String>,
        font_data: Vec<u8>,
        font_size: f32,
        color: [u8; 3],
        opacity: f32,
        spacing: WatermarkSpacing,
    ) -> Result<Self> {
        let font = fontdue::Font::from_bytes(font_data, fontdue::FontSettings::default())
            .map_err(|e| TileError::config(format!("watermark font: {}", e)))?;
        Ok(Self {
            text: text.into(),
            font,
            font_size,
            color,
            opacity: opacity.clamp(0.0, 1.0),
            spacing,
        })
    }

    fn draw_text(&self, raster: &mut RgbaImage) {
        let glyphs: Vec<_> = self
            .text
            .chars()
            .map(|c| self.font.rasterize(c, self.font_size))
            .collect();
        let total_width: f32 = glyphs.iter().map(|(m, _)| m.advance_width).sum();

        let origin_x = (raster.width() as f32 - total_width) / 2.0;
        let baseline = (raster.height() as f32 + self.font_size) / 2.0;

        let mut pen_x = origin_x;
        for (metrics, coverage) in &glyphs {
            let glyph_x = pen_x as i64 + metrics.xmin as i64;
            let glyph_y = baseline as i64 - metrics.height as i64 - metrics.ymin as i64;
            for row in 0..metrics.height {
                for col in 0..metrics.width {
                    let px = glyph_x + col as i64;
                    let py = glyph_y + row as i64;
                    if px < 0
                        || py < 0
                        || px >= raster.width() as i64
                        || py >= raster.height() as i64
                    {
                        continue;
                    }
                    let alpha =
                        coverage[row * metrics.width + col] as f32 / 255.0 * self.opacity;
                    if alpha <= 0.0 {
                        continue;
                    }
                    let pixel = raster.get_pixel_mut(px as u32, py as u32);
                    for band in 0..3 {
                        pixel.0[band] = (pixel.0[band] as f32 * (1.0 - alpha)
                            + self.color[band] as f32 * alpha)
                            .round() as u8;
                    }
                    pixel.0[3] = pixel.0[3].max((alpha * 255.0).round() as u8);
                }
            }
            pen_x += metrics.advance_width;
        }
    }

    /// Whether this tile gets a watermark under the configured spacing.
    fn marks_tile(&self, tile: &Tile) -> bool {
        match self.spacing {
            WatermarkSpacing::Every => true,
            WatermarkSpacing::Wide => (tile.coord.x + tile.coord.y) % 2 == 0,
        }
    }
}

impl TileFilter for WatermarkFilter {
    fn apply(&self, mut tile: Tile, _opts: &ImageOptions) -> Result<Tile> {
        if !self.marks_tile(&tile) {
            return Ok(tile);
        }
        let Some(image) = tile.to_image()? else {
            return Ok(tile);
        };
        let mut raster = image.inner().to_rgba8();
        self.draw_text(&mut raster);
        tile.data = Some(TileData::Image(crate::image::TileImage::new(
            image::DynamicImage::ImageRgba8(raster),
        )));
        Ok(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graticule_core::TileCoord;

    #[test]
    fn test_wide_spacing_checkerboard() {
        // Only the placement logic; rasterization needs a real font file.
        let marks = |x: u32, y: u32| (x + y) % 2 == 0;
        assert!(marks(0, 0));
        assert!(!marks(0, 1));
        assert!(marks(1, 1));
    }

    #[test]
    fn test_filter_passes_placeholder_through() {
        struct Noop;
        impl TileFilter for Noop {
            fn apply(&self, tile: Tile, _opts: &ImageOptions) -> Result<Tile> {
                Ok(tile)
            }
        }
        let tile = Tile::new(TileCoord::new(1, 0, 0));
        let out = Noop.apply(tile, &ImageOptions::default()).unwrap();
        assert!(out.is_missing());
    }

    #[test]
    fn test_invalid_font_rejected() {
        let result = WatermarkFilter::new(
            "(c) graticule",
            vec![0, 1, 2, 3],
            12.0,
            [0, 0, 0],
            0.3,
            WatermarkSpacing::Every,
        );
        assert!(result.is_err());
    }
}
