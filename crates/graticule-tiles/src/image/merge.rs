//! Band merging.
//!
//! Composes one output image from specific bands of multiple source images.
//! Every destination band is the clamped sum of `source_band * factor`
//! terms; sources must agree on pixel size.

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

use crate::error::{Result, TileError};
use crate::image::{ImageMode, TileImage};

/// One merge term: take `src_band` of `src_image`, scale by `factor`, and
/// accumulate into `dst_band`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandOp {
    pub dst_band: usize,
    pub src_image: usize,
    pub src_band: usize,
    pub factor: f32,
}

/// Merges bands from several sources into one destination mode.
#[derive(Debug, Clone)]
pub struct BandMerger {
    mode: ImageMode,
    ops: Vec<BandOp>,
}

impl BandMerger {
    pub fn new(mode: ImageMode) -> Self {
        Self { mode, ops: Vec::new() }
    }

    /// Add a merge term.
    pub fn add_op(mut self, dst_band: usize, src_image: usize, src_band: usize, factor: f32) -> Self {
        self.ops.push(BandOp { dst_band, src_image, src_band, factor });
        self
    }

    pub fn mode(&self) -> ImageMode {
        self.mode
    }

    pub fn ops(&self) -> &[BandOp] {
        &self.ops
    }

    /// Check the op table against the destination mode and the number of
    /// source images.
    pub fn validate(&self, num_sources: usize) -> Result<()> {
        let bands = self.mode.bands();
        for band in 0..bands {
            if !self.ops.iter().any(|op| op.dst_band == band) {
                return Err(TileError::config(format!(
                    "band merge: no operation for destination band {}",
                    band
                )));
            }
        }
        for op in &self.ops {
            if op.dst_band >= bands {
                return Err(TileError::config(format!(
                    "band merge: destination band {} outside mode with {} bands",
                    op.dst_band, bands
                )));
            }
            if op.src_image >= num_sources {
                return Err(TileError::config(format!(
                    "band merge: source image {} out of range ({} sources)",
                    op.src_image, num_sources
                )));
            }
            if op.src_band > 3 {
                return Err(TileError::config(format!(
                    "band merge: source band {} out of range",
                    op.src_band
                )));
            }
        }
        Ok(())
    }

    /// Merge the sources into one image.
    pub fn merge(&self, sources: &[TileImage]) -> Result<TileImage> {
        if sources.is_empty() {
            return Err(TileError::image("band merge: no source images"));
        }
        self.validate(sources.len())?;

        let size = sources[0].size();
        for (i, src) in sources.iter().enumerate() {
            if src.size() != size {
                return Err(TileError::image(format!(
                    "band merge: source {} is {:?}, expected {:?}",
                    i,
                    src.size(),
                    size
                )));
            }
        }

        let rasters: Vec<RgbaImage> = sources.iter().map(|s| s.inner().to_rgba8()).collect();
        let pixel_count = (size.0 * size.1) as usize;
        let bands = self.mode.bands();
        let mut acc = vec![0.0f32; pixel_count * bands];

        for op in &self.ops {
            let src = &rasters[op.src_image];
            for (i, pixel) in src.pixels().enumerate() {
                acc[i * bands + op.dst_band] += pixel.0[op.src_band] as f32 * op.factor;
            }
        }

        let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
        let img = match self.mode {
            ImageMode::L => {
                let buf: Vec<u8> = acc.iter().map(|v| clamp(*v)).collect();
                DynamicImage::ImageLuma8(
                    GrayImage::from_raw(size.0, size.1, buf)
                        .ok_or_else(|| TileError::image("band merge: buffer size mismatch"))?,
                )
            }
            ImageMode::Rgb => {
                let buf: Vec<u8> = acc.iter().map(|v| clamp(*v)).collect();
                DynamicImage::ImageRgb8(
                    RgbImage::from_raw(size.0, size.1, buf)
                        .ok_or_else(|| TileError::image("band merge: buffer size mismatch"))?,
                )
            }
            ImageMode::Rgba => {
                let buf: Vec<u8> = acc.iter().map(|v| clamp(*v)).collect();
                DynamicImage::ImageRgba8(
                    RgbaImage::from_raw(size.0, size.1, buf)
                        .ok_or_else(|| TileError::image("band merge: buffer size mismatch"))?,
                )
            }
        };

        Ok(TileImage::new(img))
    }
}
