//! Axis-aligned bounding boxes.
//!
//! All grid math in this crate is expressed through `BBox`. Containment on
//! the east/north edges is half-open so adjacent tile extents never
//! double-count a shared edge.

use geo_types::{Coord, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// An axis-aligned bounding box in 2D space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    /// Minimum x coordinate (west)
    pub min_x: f64,
    /// Minimum y coordinate (south)
    pub min_y: f64,
    /// Maximum x coordinate (east)
    pub max_x: f64,
    /// Maximum y coordinate (north)
    pub max_y: f64,
}

impl BBox {
    /// Create a new bounding box.
    ///
    /// Returns an error if min values exceed max values or any coordinate
    /// is NaN.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self> {
        if min_x.is_nan() || min_y.is_nan() || max_x.is_nan() || max_y.is_nan() {
            return Err(CoreError::InvalidBBox("coordinate is NaN".to_string()));
        }
        if min_x > max_x || min_y > max_y {
            return Err(CoreError::InvalidBBox(format!(
                "min exceeds max: ({}, {}, {}, {})",
                min_x, min_y, max_x, max_y
            )));
        }
        Ok(Self { min_x, min_y, max_x, max_y })
    }

    /// Create without validation. Callers must pass ordered coordinates.
    pub const fn new_unchecked(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Smallest box containing both corners, in any order.
    pub fn from_corners(c1: (f64, f64), c2: (f64, f64)) -> Self {
        Self {
            min_x: c1.0.min(c2.0),
            min_y: c1.1.min(c2.1),
            max_x: c1.0.max(c2.0),
            max_y: c1.1.max(c2.1),
        }
    }

    /// Width in map units
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height in map units
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Center point
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Check whether a point lies inside. Half-open: points exactly on the
    /// east or north edge are outside.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Check whether `other` lies fully inside (closed comparison).
    pub fn contains(&self, other: &BBox) -> bool {
        other.min_x >= self.min_x
            && other.min_y >= self.min_y
            && other.max_x <= self.max_x
            && other.max_y <= self.max_y
    }

    /// Check whether the two boxes share any area.
    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_x < other.max_x
            && self.max_x > other.min_x
            && self.min_y < other.max_y
            && self.max_y > other.min_y
    }

    /// Intersection of two boxes, if any.
    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }

    /// Expand every edge outward by `amount` map units.
    pub fn buffered(&self, amount: f64) -> BBox {
        BBox {
            min_x: self.min_x - amount,
            min_y: self.min_y - amount,
            max_x: self.max_x + amount,
            max_y: self.max_y + amount,
        }
    }

    /// Resolution in units per pixel when rendered at `size` pixels.
    pub fn resolution(&self, size: (u32, u32)) -> f64 {
        (self.width() / size.0 as f64).max(self.height() / size.1 as f64)
    }

    /// Approximate equality, relative to the box size.
    pub fn approx_eq(&self, other: &BBox, rel: f64) -> bool {
        let eps = (self.width().abs().max(self.height().abs()) * rel).max(f64::EPSILON);
        (self.min_x - other.min_x).abs() < eps
            && (self.min_y - other.min_y).abs() < eps
            && (self.max_x - other.max_x).abs() < eps
            && (self.max_y - other.max_y).abs() < eps
    }

    /// Convert to a geo-types rectangle.
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord { x: self.min_x, y: self.min_y },
            Coord { x: self.max_x, y: self.max_y },
        )
    }

    /// Corner and edge-midpoint sample points, used when transforming a box
    /// through a non-affine projection.
    pub fn sample_points(&self) -> [(f64, f64); 8] {
        let (cx, cy) = self.center();
        [
            (self.min_x, self.min_y),
            (self.min_x, self.max_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (cx, self.min_y),
            (cx, self.max_y),
            (self.min_x, cy),
            (self.max_x, cy),
        ]
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}
