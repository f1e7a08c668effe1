//! Raster warping and resampling.
//!
//! Maps an image rendered for one extent onto a different extent, pixel
//! size, or spatial reference, using inverse per-pixel mapping with a
//! nearest, bilinear, or Catmull-Rom cubic kernel. Used for serving
//! non-grid-aligned map requests and for rescaling tiles from neighboring
//! zoom levels.

use graticule_core::{BBox, Srs};
use image::RgbaImage;

use crate::error::Result;
use crate::image::{Resampling, TileImage};

/// Warp `src`, georeferenced to `src_bbox` in `src_srs`, onto a new canvas
/// covering `dst_bbox` in `dst_srs` at `dst_size` pixels.
///
/// Destination pixels that map outside the source extent stay transparent.
pub fn warp(
    src: &TileImage,
    src_bbox: &BBox,
    src_srs: Srs,
    dst_bbox: &BBox,
    dst_srs: Srs,
    dst_size: (u32, u32),
    resampling: Resampling,
) -> Result<TileImage> {
    let src_raster = src.inner().to_rgba8();
    let (src_w, src_h) = (src_raster.width(), src_raster.height());
    let src_res_x = src_bbox.width() / src_w as f64;
    let src_res_y = src_bbox.height() / src_h as f64;
    let dst_res_x = dst_bbox.width() / dst_size.0 as f64;
    let dst_res_y = dst_bbox.height() / dst_size.1 as f64;

    let same_srs = dst_srs.is_equivalent(&src_srs);
    let mut out = RgbaImage::new(dst_size.0, dst_size.1);

    for j in 0..dst_size.1 {
        for i in 0..dst_size.0 {
            // Destination pixel center in map units.
            let dx = dst_bbox.min_x + (i as f64 + 0.5) * dst_res_x;
            let dy = dst_bbox.max_y - (j as f64 + 0.5) * dst_res_y;

            let (sx, sy) = if same_srs {
                (dx, dy)
            } else {
                dst_srs.transform_point(&src_srs, (dx, dy))?
            };

            // Fractional source pixel coordinates.
            let u = (sx - src_bbox.min_x) / src_res_x - 0.5;
            let v = (src_bbox.max_y - sy) / src_res_y - 0.5;
            if u < -0.5 || v < -0.5 || u > src_w as f64 - 0.5 || v > src_h as f64 - 0.5 {
                continue;
            }

            let pixel = match resampling {
                Resampling::Nearest => sample_nearest(&src_raster, u, v),
                Resampling::Bilinear => sample_bilinear(&src_raster, u, v),
                Resampling::Bicubic => sample_bicubic(&src_raster, u, v),
            };
            out.put_pixel(i, j, image::Rgba(pixel));
        }
    }

    Ok(TileImage::new(image::DynamicImage::ImageRgba8(out)))
}

/// Same-SRS warp: cut `dst_bbox` out of a source raster and resample it to
/// `dst_size`.
pub fn extract_bbox(
    src: &TileImage,
    src_bbox: &BBox,
    dst_bbox: &BBox,
    dst_size: (u32, u32),
    resampling: Resampling,
) -> Result<TileImage> {
    warp(
        src,
        src_bbox,
        Srs::WEB_MERCATOR,
        dst_bbox,
        Srs::WEB_MERCATOR,
        dst_size,
        resampling,
    )
}

fn clamped(raster: &RgbaImage, x: i64, y: i64) -> [u8; 4] {
    let x = x.clamp(0, raster.width() as i64 - 1) as u32;
    let y = y.clamp(0, raster.height() as i64 - 1) as u32;
    raster.get_pixel(x, y).0
}

fn sample_nearest(raster: &RgbaImage, u: f64, v: f64) -> [u8; 4] {
    clamped(raster, u.round() as i64, v.round() as i64)
}

fn sample_bilinear(raster: &RgbaImage, u: f64, v: f64) -> [u8; 4] {
    let x0 = u.floor() as i64;
    let y0 = v.floor() as i64;
    let fx = u - x0 as f64;
    let fy = v - y0 as f64;

    let mut out = [0u8; 4];
    for band in 0..4 {
        let p00 = clamped(raster, x0, y0)[band] as f64;
        let p10 = clamped(raster, x0 + 1, y0)[band] as f64;
        let p01 = clamped(raster, x0, y0 + 1)[band] as f64;
        let p11 = clamped(raster, x0 + 1, y0 + 1)[band] as f64;
        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        out[band] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

// Catmull-Rom kernel.
fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

fn sample_bicubic(raster: &RgbaImage, u: f64, v: f64) -> [u8; 4] {
    let x0 = u.floor() as i64;
    let y0 = v.floor() as i64;
    let fx = u - x0 as f64;
    let fy = v - y0 as f64;

    let mut out = [0u8; 4];
    for band in 0..4 {
        let mut acc = 0.0;
        let mut weight_sum = 0.0;
        for dy in -1..=2i64 {
            let wy = cubic_weight(dy as f64 - fy);
            for dx in -1..=2i64 {
                let w = cubic_weight(dx as f64 - fx) * wy;
                acc += clamped(raster, x0 + dx, y0 + dy)[band] as f64 * w;
                weight_sum += w;
            }
        }
        out[band] = (acc / weight_sum).round().clamp(0.0, 255.0) as u8;
    }
    out
}
