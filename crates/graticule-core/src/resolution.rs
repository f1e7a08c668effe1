//! Resolution ranges.
//!
//! A resolution range is the zoom window a cache or source answers for.
//! `min_res` is the coarse end (large units/pixel), `max_res` the fine end;
//! both bounds are inclusive and either may be open.

use serde::{Deserialize, Serialize};

/// Inclusive `[max_res, min_res]` window in units per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResolutionRange {
    /// Coarsest resolution served (upper bound on units/pixel)
    pub min_res: Option<f64>,
    /// Finest resolution served (lower bound on units/pixel)
    pub max_res: Option<f64>,
}

/// OGC pixel size in meters, used for scale conversions.
const OGC_PIXEL_SIZE: f64 = 0.000_28;

impl ResolutionRange {
    pub fn new(min_res: Option<f64>, max_res: Option<f64>) -> Self {
        Self { min_res, max_res }
    }

    /// Build from map scale denominators (e.g. 1:50000 -> 50000.0).
    pub fn from_scale(min_scale: Option<f64>, max_scale: Option<f64>) -> Self {
        Self {
            min_res: min_scale.map(scale_to_resolution),
            max_res: max_scale.map(scale_to_resolution),
        }
    }

    /// Whether a request at `res` units/pixel falls inside the window.
    pub fn contains(&self, res: f64) -> bool {
        if let Some(min_res) = self.min_res {
            if res > min_res {
                return false;
            }
        }
        if let Some(max_res) = self.max_res {
            if res < max_res {
                return false;
            }
        }
        true
    }

    pub fn is_unbounded(&self) -> bool {
        self.min_res.is_none() && self.max_res.is_none()
    }
}

/// Convert a scale denominator to a resolution in units/pixel.
pub fn scale_to_resolution(scale: f64) -> f64 {
    scale * OGC_PIXEL_SIZE
}

/// Convert a resolution in units/pixel to a scale denominator.
pub fn resolution_to_scale(res: f64) -> f64 {
    res / OGC_PIXEL_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_contains_inclusive() {
        let range = ResolutionRange::new(Some(1000.0), Some(10.0));
        assert!(range.contains(1000.0));
        assert!(range.contains(10.0));
        assert!(range.contains(500.0));
        assert!(!range.contains(1000.1));
        assert!(!range.contains(9.9));
    }

    #[test]
    fn test_open_bounds() {
        let coarse_only = ResolutionRange::new(Some(1000.0), None);
        assert!(coarse_only.contains(0.001));
        assert!(!coarse_only.contains(2000.0));

        assert!(ResolutionRange::default().contains(123.0));
        assert!(ResolutionRange::default().is_unbounded());
    }

    #[test]
    fn test_scale_roundtrip() {
        let res = scale_to_resolution(50_000.0);
        assert_relative_eq!(res, 14.0, epsilon = 1e-9);
        assert_relative_eq!(resolution_to_scale(res), 50_000.0, epsilon = 1e-9);
    }
}
