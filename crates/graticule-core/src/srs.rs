//! Spatial reference systems.
//!
//! The engine only needs to know two things about an SRS: its identity (for
//! matching caches to requests) and, for the builtin pair of WGS84 and
//! spherical mercator, how to move coordinates between them. Anything beyond
//! that is the job of an external coordinate service wired in through
//! [`Transform`].

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

use crate::bbox::BBox;
use crate::error::{CoreError, Result};

/// Earth radius used by the spherical mercator projection, in meters.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Extent of the spherical mercator plane from the origin, in meters.
pub const MERCATOR_EXTENT: f64 = EARTH_RADIUS * PI;

/// A spatial reference system, identified by EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Srs(pub u32);

impl Srs {
    /// WGS84 geographic coordinates (EPSG:4326)
    pub const WGS84: Srs = Srs(4326);
    /// Spherical mercator (EPSG:3857)
    pub const WEB_MERCATOR: Srs = Srs(3857);
    /// Legacy spherical mercator alias (EPSG:900913)
    pub const WEB_MERCATOR_LEGACY: Srs = Srs(900913);

    /// Parse from `EPSG:nnnn`, `epsg:nnnn`, or a bare code.
    pub fn parse(s: &str) -> Result<Self> {
        let code = s
            .rsplit(':')
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| CoreError::InvalidSrs(s.to_string()))?;
        Ok(Srs(code))
    }

    /// EPSG code
    pub fn code(&self) -> u32 {
        self.0
    }

    /// Whether coordinates are degrees rather than map units.
    pub fn is_geographic(&self) -> bool {
        matches!(self.0, 4326 | 4258 | 4269)
    }

    /// Whether the axis order is latitude/longitude in WMS 1.3.0 requests.
    /// Projected systems stay x/y.
    pub fn is_axis_order_ne(&self) -> bool {
        self.is_geographic()
    }

    /// Whether two systems are interchangeable without transformation.
    pub fn is_equivalent(&self, other: &Srs) -> bool {
        if self.0 == other.0 {
            return true;
        }
        self.is_spherical_mercator() && other.is_spherical_mercator()
    }

    fn is_spherical_mercator(&self) -> bool {
        matches!(self.0, 3857 | 900913 | 102100 | 102113)
    }

    /// Transform a point into `dst`. Only the builtin WGS84 and spherical
    /// mercator pair is supported; other combinations need an external
    /// [`Transform`].
    pub fn transform_point(&self, dst: &Srs, point: (f64, f64)) -> Result<(f64, f64)> {
        if self.is_equivalent(dst) {
            return Ok(point);
        }
        if self.is_geographic() && dst.is_spherical_mercator() {
            return Ok(lon_lat_to_mercator(point.0, point.1));
        }
        if self.is_spherical_mercator() && dst.is_geographic() {
            return Ok(mercator_to_lon_lat(point.0, point.1));
        }
        Err(CoreError::UnsupportedTransform {
            from: self.0,
            to: dst.0,
        })
    }

    /// Transform a bounding box into `dst` by sampling its corners and edge
    /// midpoints and taking the enclosing box.
    pub fn transform_bbox(&self, dst: &Srs, bbox: &BBox) -> Result<BBox> {
        if self.is_equivalent(dst) {
            return Ok(*bbox);
        }
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for (x, y) in bbox.sample_points() {
            let (tx, ty) = self.transform_point(dst, (x, y))?;
            min_x = min_x.min(tx);
            min_y = min_y.min(ty);
            max_x = max_x.max(tx);
            max_y = max_y.max(ty);
        }
        BBox::new(min_x, min_y, max_x, max_y)
    }
}

impl fmt::Display for Srs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Seam for external coordinate services covering systems the builtin pair
/// does not.
pub trait Transform: Send + Sync {
    /// Transform a point from `src` to `dst`.
    fn transform(&self, src: Srs, dst: Srs, point: (f64, f64)) -> Result<(f64, f64)>;
}

/// Project lon/lat degrees onto the spherical mercator plane.
pub fn lon_lat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    // Clamp to the mercator-safe latitude band.
    let lat = lat.clamp(-85.051_128_779_806_6, 85.051_128_779_806_6);
    let x = lon.to_radians() * EARTH_RADIUS;
    let y = ((PI / 4.0) + (lat.to_radians() / 2.0)).tan().ln() * EARTH_RADIUS;
    (x, y)
}

/// Inverse of [`lon_lat_to_mercator`].
pub fn mercator_to_lon_lat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse() {
        assert_eq!(Srs::parse("EPSG:3857").unwrap(), Srs(3857));
        assert_eq!(Srs::parse("epsg:4326").unwrap(), Srs(4326));
        assert_eq!(Srs::parse("900913").unwrap(), Srs(900913));
        assert!(Srs::parse("EPSG:abc").is_err());
    }

    #[test]
    fn test_equivalence() {
        assert!(Srs(3857).is_equivalent(&Srs(900913)));
        assert!(!Srs(3857).is_equivalent(&Srs(4326)));
    }

    #[test]
    fn test_mercator_roundtrip() {
        let (x, y) = lon_lat_to_mercator(-122.4194, 37.7749);
        let (lon, lat) = mercator_to_lon_lat(x, y);
        assert_relative_eq!(lon, -122.4194, epsilon = 1e-9);
        assert_relative_eq!(lat, 37.7749, epsilon = 1e-9);
    }

    #[test]
    fn test_world_extent() {
        let (x, _) = lon_lat_to_mercator(180.0, 0.0);
        assert_relative_eq!(x, MERCATOR_EXTENT, epsilon = 1e-6);
    }

    #[test]
    fn test_transform_bbox() {
        let world = BBox::new(-180.0, -85.051_128_779_806_6, 180.0, 85.051_128_779_806_6).unwrap();
        let merc = Srs::WGS84.transform_bbox(&Srs::WEB_MERCATOR, &world).unwrap();
        assert_relative_eq!(merc.min_x, -MERCATOR_EXTENT, epsilon = 1e-6);
        assert_relative_eq!(merc.max_x, MERCATOR_EXTENT, epsilon = 1e-6);
    }

    #[test]
    fn test_unsupported_pair() {
        let err = Srs(2154).transform_point(&Srs(3857), (0.0, 0.0));
        assert!(matches!(
            err,
            Err(CoreError::UnsupportedTransform { from: 2154, to: 3857 })
        ));
    }
}
