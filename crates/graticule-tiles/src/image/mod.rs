//! Tile images and encoding options.
//!
//! [`TileImage`] wraps a decoded raster; [`ImageOptions`] carries the
//! per-cache encoding decisions (format, mode, quality) and is immutable for
//! the lifetime of a tile manager.

pub mod filter;
pub mod merge;
pub mod split;
pub mod transform;

pub use filter::{TileFilter, WatermarkFilter};
pub use merge::{BandMerger, BandOp};

use bytes::Bytes;
use image::{imageops, DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::error::{Result, TileError};

/// Encoded tile format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Png,
    Jpeg,
    Tiff,
}

impl TileFormat {
    /// MIME type for this format
    pub fn mime_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpeg => "image/jpeg",
            TileFormat::Tiff => "image/tiff",
        }
    }

    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpeg",
            TileFormat::Tiff => "tiff",
        }
    }

    /// Parse from a MIME type such as `image/png`
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim() {
            "image/png" => Some(TileFormat::Png),
            "image/jpeg" | "image/jpg" => Some(TileFormat::Jpeg),
            "image/tiff" => Some(TileFormat::Tiff),
            _ => None,
        }
    }

    /// Whether the format carries an alpha channel
    pub fn supports_transparency(&self) -> bool {
        !matches!(self, TileFormat::Jpeg)
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// Pixel layout of produced tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageMode {
    /// 8-bit grayscale
    L,
    /// 8-bit RGB
    Rgb,
    /// 8-bit RGB with alpha
    Rgba,
}

impl ImageMode {
    /// Number of bands
    pub fn bands(&self) -> usize {
        match self {
            ImageMode::L => 1,
            ImageMode::Rgb => 3,
            ImageMode::Rgba => 4,
        }
    }
}

/// Resampling method for rescaling and warping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    Bilinear,
    Bicubic,
}

impl Resampling {
    fn filter_type(&self) -> imageops::FilterType {
        match self {
            Resampling::Nearest => imageops::FilterType::Nearest,
            Resampling::Bilinear => imageops::FilterType::Triangle,
            Resampling::Bicubic => imageops::FilterType::CatmullRom,
        }
    }
}

/// Encoding options, fixed per tile manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOptions {
    pub format: TileFormat,
    pub mode: ImageMode,
    /// Whether missing data is encoded as transparency (PNG) or bgcolor
    pub transparent: bool,
    /// Fill color for non-transparent blank tiles
    pub bgcolor: [u8; 3],
    pub resampling: Resampling,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            format: TileFormat::Png,
            mode: ImageMode::Rgba,
            transparent: true,
            bgcolor: [255, 255, 255],
            resampling: Resampling::Bicubic,
            jpeg_quality: 90,
        }
    }
}

impl ImageOptions {
    /// Options for an opaque JPEG cache
    pub fn jpeg(quality: u8) -> Self {
        Self {
            format: TileFormat::Jpeg,
            mode: ImageMode::Rgb,
            transparent: false,
            jpeg_quality: quality,
            ..Self::default()
        }
    }
}

/// A decoded tile raster.
#[derive(Debug, Clone)]
pub struct TileImage {
    img: DynamicImage,
}

impl TileImage {
    pub fn new(img: DynamicImage) -> Self {
        Self { img }
    }

    /// Decode from encoded bytes; the format is sniffed from the content.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| TileError::image(format!("decode failed: {}", e)))?;
        Ok(Self { img })
    }

    /// A fully transparent image.
    pub fn transparent(size: (u32, u32)) -> Self {
        Self {
            img: DynamicImage::ImageRgba8(RgbaImage::new(size.0, size.1)),
        }
    }

    /// A single-color image.
    pub fn solid(size: (u32, u32), color: [u8; 4]) -> Self {
        Self {
            img: DynamicImage::ImageRgba8(RgbaImage::from_pixel(size.0, size.1, Rgba(color))),
        }
    }

    /// Blank tile per the encoding options: transparent when the options
    /// allow it, otherwise the background color.
    pub fn blank(size: (u32, u32), opts: &ImageOptions) -> Self {
        if opts.transparent && opts.format.supports_transparency() {
            Self::transparent(size)
        } else {
            let [r, g, b] = opts.bgcolor;
            Self::solid(size, [r, g, b, 255])
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.img.width(), self.img.height())
    }

    pub fn inner(&self) -> &DynamicImage {
        &self.img
    }

    pub fn into_inner(self) -> DynamicImage {
        self.img
    }

    /// Crop a sub-region without touching the source.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            img: self.img.crop_imm(x, y, width, height),
        }
    }

    /// Resize to an exact pixel size.
    pub fn resize(&self, width: u32, height: u32, resampling: Resampling) -> Self {
        Self {
            img: self.img.resize_exact(width, height, resampling.filter_type()),
        }
    }

    /// Paste `other` at the pixel offset, replacing pixels.
    pub fn paste(&mut self, other: &TileImage, x: u32, y: u32) {
        imageops::replace(&mut self.img, &other.img, x as i64, y as i64);
    }

    /// If every pixel carries the same RGBA value, return it.
    pub fn single_color(&self) -> Option<[u8; 4]> {
        let rgba = self.img.to_rgba8();
        let mut pixels = rgba.pixels();
        let first = pixels.next()?.0;
        if pixels.all(|p| p.0 == first) {
            Some(first)
        } else {
            None
        }
    }

    /// Encode per the options. The mode conversion happens here; JPEG output
    /// is always flattened to RGB.
    pub fn to_bytes(&self, opts: &ImageOptions) -> Result<Bytes> {
        let img = match (opts.format, opts.mode) {
            (TileFormat::Jpeg, _) | (_, ImageMode::Rgb) => {
                DynamicImage::ImageRgb8(self.img.to_rgb8())
            }
            (_, ImageMode::L) => DynamicImage::ImageLuma8(self.img.to_luma8()),
            (_, ImageMode::Rgba) => DynamicImage::ImageRgba8(self.img.to_rgba8()),
        };
        let format = match opts.format {
            TileFormat::Png => ImageOutputFormat::Png,
            TileFormat::Jpeg => ImageOutputFormat::Jpeg(opts.jpeg_quality),
            TileFormat::Tiff => ImageOutputFormat::Tiff,
        };
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, format)
            .map_err(|e| TileError::image(format!("encode failed: {}", e)))?;
        Ok(Bytes::from(cursor.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mime() {
        assert_eq!(TileFormat::Png.mime_type(), "image/png");
        assert_eq!(TileFormat::from_mime("image/jpeg"), Some(TileFormat::Jpeg));
        assert_eq!(TileFormat::from_mime("text/html"), None);
    }

    #[test]
    fn test_blank_respects_transparency() {
        let opts = ImageOptions::default();
        let img = TileImage::blank((4, 4), &opts);
        assert_eq!(img.single_color(), Some([0, 0, 0, 0]));

        let opts = ImageOptions::jpeg(90);
        let img = TileImage::blank((4, 4), &opts);
        assert_eq!(img.single_color(), Some([255, 255, 255, 255]));
    }

    #[test]
    fn test_encode_decode_png() {
        let img = TileImage::solid((8, 8), [10, 20, 30, 255]);
        let bytes = img.to_bytes(&ImageOptions::default()).unwrap();
        let decoded = TileImage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.size(), (8, 8));
        assert_eq!(decoded.single_color(), Some([10, 20, 30, 255]));
    }

    #[test]
    fn test_crop() {
        let mut canvas = TileImage::transparent((16, 16));
        let patch = TileImage::solid((8, 8), [255, 0, 0, 255]);
        canvas.paste(&patch, 8, 8);
        let cropped = canvas.crop(8, 8, 8, 8);
        assert_eq!(cropped.single_color(), Some([255, 0, 0, 255]));
        let empty = canvas.crop(0, 0, 8, 8);
        assert_eq!(empty.single_color(), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_single_color_detects_mixed() {
        let mut img = TileImage::solid((4, 4), [1, 2, 3, 255]);
        let dot = TileImage::solid((1, 1), [9, 9, 9, 255]);
        img.paste(&dot, 2, 2);
        assert_eq!(img.single_color(), None);
    }
}
