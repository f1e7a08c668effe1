//! # Graticule Core
//!
//! Spatial primitives for the Graticule tile cache engine.
//!
//! This crate provides the deterministic, I/O-free building blocks the tile
//! engine is assembled from:
//!
//! - **Bounding boxes**: axis-aligned extents with half-open range math
//! - **Spatial reference systems**: EPSG ids plus the builtin WGS84 and
//!   spherical-mercator transforms
//! - **Tile grids**: named resolution ladders mapping `(z, x, y)` to
//!   geographic extents
//! - **Meta-tile grids**: aligned blocks of adjacent tiles rendered in one
//!   upstream call
//! - **Coverages**: polygon or bbox masks restricting where tiles exist
//! - **Resolution ranges**: the zoom window a cache or source answers for
//!
//! Everything here is immutable after construction and safe to share across
//! workers.

pub mod bbox;
pub mod coverage;
pub mod error;
pub mod grid;
pub mod meta;
pub mod resolution;
pub mod srs;

pub use bbox::BBox;
pub use coverage::Coverage;
pub use error::{CoreError, Result};
pub use grid::{GridOrigin, TileCoord, TileGrid, TileRange};
pub use meta::{MetaGrid, MetaTile};
pub use resolution::ResolutionRange;
pub use srs::Srs;

/// Current version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tile size in pixels
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Maximum zoom level supported
pub const MAX_ZOOM_LEVEL: u8 = 24;
