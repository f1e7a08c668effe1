//! Meta-tile splitting.
//!
//! A rendered meta-tile image is cut into per-tile sub-images at the exact
//! tile pixel size, skipping the buffer. Crops reaching outside the rendered
//! area (clipped border meta-tiles) come back transparent.

use graticule_core::{MetaTile, TileCoord};

use crate::error::Result;
use crate::image::{ImageOptions, TileImage};

/// Split a rendered meta-tile into its tiles.
///
/// Returns one `(coord, image)` pair per tile in the meta block, in the
/// block's row-major order.
pub fn split_meta_tile(
    image: &TileImage,
    meta: &MetaTile,
    tile_size: (u32, u32),
    opts: &ImageOptions,
) -> Result<Vec<(TileCoord, TileImage)>> {
    let (img_w, img_h) = image.size();
    let mut out = Vec::with_capacity(meta.tiles().len());

    for &coord in meta.tiles() {
        let (px, py) = meta.tile_pixel_offset(coord);
        let tile_img = if px + tile_size.0 <= img_w && py + tile_size.1 <= img_h {
            image.crop(px, py, tile_size.0, tile_size.1)
        } else {
            // Rendered image does not reach this far; happens when a border
            // meta-tile was clipped below the nominal block size.
            TileImage::blank(tile_size, opts)
        };
        out.push((coord, tile_img));
    }

    Ok(out)
}
