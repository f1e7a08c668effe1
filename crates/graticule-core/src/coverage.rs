//! Coverage masks.
//!
//! A coverage restricts where tiles exist: requests outside it short-circuit
//! to transparent tiles without touching a backend or an upstream. The
//! geometry may live in a different SRS than the grid it masks; queries are
//! transformed into the coverage SRS before testing.

use geo::{Contains, Intersects};
use geo_types::{MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};

use crate::bbox::BBox;
use crate::error::Result;
use crate::srs::Srs;

/// Region geometry: a plain box or a polygon set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoverageGeometry {
    BBox(BBox),
    Polygons(MultiPolygon<f64>),
}

/// A 2D region in a named SRS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coverage {
    geometry: CoverageGeometry,
    srs: Srs,
    /// Treat tiles merely touching the boundary as inside.
    clip: bool,
}

impl Coverage {
    /// Coverage from a bounding box.
    pub fn from_bbox(bbox: BBox, srs: Srs) -> Self {
        Self {
            geometry: CoverageGeometry::BBox(bbox),
            srs,
            clip: false,
        }
    }

    /// Coverage from one polygon.
    pub fn from_polygon(polygon: Polygon<f64>, srs: Srs) -> Self {
        Self {
            geometry: CoverageGeometry::Polygons(MultiPolygon(vec![polygon])),
            srs,
            clip: false,
        }
    }

    /// Coverage from a polygon set.
    pub fn from_polygons(polygons: MultiPolygon<f64>, srs: Srs) -> Self {
        Self {
            geometry: CoverageGeometry::Polygons(polygons),
            srs,
            clip: false,
        }
    }

    pub fn srs(&self) -> Srs {
        self.srs
    }

    /// Extent of the coverage in its own SRS.
    pub fn bbox(&self) -> BBox {
        match &self.geometry {
            CoverageGeometry::BBox(b) => *b,
            CoverageGeometry::Polygons(mp) => {
                let mut min_x = f64::INFINITY;
                let mut min_y = f64::INFINITY;
                let mut max_x = f64::NEG_INFINITY;
                let mut max_y = f64::NEG_INFINITY;
                for poly in &mp.0 {
                    for c in poly.exterior().coords() {
                        min_x = min_x.min(c.x);
                        min_y = min_y.min(c.y);
                        max_x = max_x.max(c.x);
                        max_y = max_y.max(c.y);
                    }
                }
                BBox::new_unchecked(min_x, min_y, max_x, max_y)
            }
        }
    }

    /// Whether `bbox` (given in `srs`) shares any area with the coverage.
    pub fn intersects(&self, bbox: &BBox, srs: Srs) -> Result<bool> {
        let bbox = srs.transform_bbox(&self.srs, bbox)?;
        Ok(match &self.geometry {
            CoverageGeometry::BBox(b) => b.intersects(&bbox),
            CoverageGeometry::Polygons(mp) => mp.intersects(&bbox.to_rect()),
        })
    }

    /// Whether `bbox` (given in `srs`) lies entirely inside the coverage.
    pub fn contains(&self, bbox: &BBox, srs: Srs) -> Result<bool> {
        let bbox = srs.transform_bbox(&self.srs, bbox)?;
        Ok(match &self.geometry {
            CoverageGeometry::BBox(b) => b.contains(&bbox),
            CoverageGeometry::Polygons(mp) => mp.contains(&bbox.to_rect().to_polygon()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{coord, LineString};

    fn unit_coverage() -> Coverage {
        Coverage::from_bbox(
            BBox::new(0.0, 0.0, 10.0, 10.0).unwrap(),
            Srs::WEB_MERCATOR,
        )
    }

    #[test]
    fn test_bbox_intersects() {
        let cov = unit_coverage();
        let inside = BBox::new(2.0, 2.0, 4.0, 4.0).unwrap();
        let outside = BBox::new(20.0, 20.0, 30.0, 30.0).unwrap();
        assert!(cov.intersects(&inside, Srs::WEB_MERCATOR).unwrap());
        assert!(!cov.intersects(&outside, Srs::WEB_MERCATOR).unwrap());
    }

    #[test]
    fn test_bbox_contains() {
        let cov = unit_coverage();
        let inside = BBox::new(2.0, 2.0, 4.0, 4.0).unwrap();
        let partial = BBox::new(5.0, 5.0, 15.0, 15.0).unwrap();
        assert!(cov.contains(&inside, Srs::WEB_MERCATOR).unwrap());
        assert!(!cov.contains(&partial, Srs::WEB_MERCATOR).unwrap());
        assert!(cov.intersects(&partial, Srs::WEB_MERCATOR).unwrap());
    }

    #[test]
    fn test_polygon_coverage() {
        let triangle = Polygon::new(
            LineString::from(vec![
                coord! { x: 0.0, y: 0.0 },
                coord! { x: 10.0, y: 0.0 },
                coord! { x: 0.0, y: 10.0 },
                coord! { x: 0.0, y: 0.0 },
            ]),
            vec![],
        );
        let cov = Coverage::from_polygon(triangle, Srs::WEB_MERCATOR);
        let near_origin = BBox::new(1.0, 1.0, 2.0, 2.0).unwrap();
        let far_corner = BBox::new(8.0, 8.0, 9.0, 9.0).unwrap();
        assert!(cov.intersects(&near_origin, Srs::WEB_MERCATOR).unwrap());
        assert!(!cov.intersects(&far_corner, Srs::WEB_MERCATOR).unwrap());
    }

    #[test]
    fn test_cross_srs_query() {
        // Coverage in mercator, query in WGS84 degrees.
        let cov = Coverage::from_bbox(
            BBox::new(0.0, 0.0, 2_000_000.0, 2_000_000.0).unwrap(),
            Srs::WEB_MERCATOR,
        );
        let query = BBox::new(1.0, 1.0, 2.0, 2.0).unwrap();
        assert!(cov.intersects(&query, Srs::WGS84).unwrap());
    }
}
