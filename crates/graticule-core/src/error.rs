//! Error types for spatial primitives.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by grids, coverages, and transforms
#[derive(Error, Debug)]
pub enum CoreError {
    /// Grid configuration is internally inconsistent
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    /// Zoom level outside the grid's resolution ladder
    #[error("Invalid level: {level} (grid has {levels} levels)")]
    InvalidLevel { level: u8, levels: usize },

    /// Tile coordinate outside the grid extent
    #[error("Tile {z}/{x}/{y} outside grid bounds")]
    TileOutOfBounds { z: u8, x: u32, y: u32 },

    /// Bounding box error
    #[error("Invalid bounding box: {0}")]
    InvalidBBox(String),

    /// No builtin transform between the two reference systems
    #[error("No transformation from EPSG:{from} to EPSG:{to}")]
    UnsupportedTransform { from: u32, to: u32 },

    /// Invalid SRS specification
    #[error("Invalid SRS: {0}")]
    InvalidSrs(String),

    /// Coverage geometry error
    #[error("Coverage error: {0}")]
    Coverage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidLevel { level: 30, levels: 20 };
        assert_eq!(err.to_string(), "Invalid level: 30 (grid has 20 levels)");

        let err = CoreError::UnsupportedTransform { from: 4326, to: 2154 };
        assert!(err.to_string().contains("EPSG:2154"));
    }
}
