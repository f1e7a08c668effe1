//! Error types for the tile engine.

use graticule_core::CoreError;

/// Result type alias for tile engine operations
pub type Result<T> = std::result::Result<T, TileError>;

/// Tile engine error types.
///
/// Errors that may clear up on a retry (upstream hiccups, lock contention)
/// answer `true` from [`TileError::is_retryable`]; the manager serves stale
/// tiles across those where it has them.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// Invalid engine configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream HTTP error without an `on_error` mapping
    #[error("Source HTTP error {status}: {message}")]
    SourceHttp { status: u16, message: String },

    /// Upstream request timed out
    #[error("Source timeout: {0}")]
    SourceTimeout(String),

    /// Upstream response was not a usable image
    #[error("Source response error: {0}")]
    SourceResponse(String),

    /// The requested SRS or format is not supported by any source
    #[error("Unsupported request: {0}")]
    Unsupported(String),

    /// Cache backend I/O failure
    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    /// Lock not acquired within the timeout, after one retry
    #[error("Tile lock timeout: {0}")]
    LockTimeout(String),

    /// Requested tile outside the grid
    #[error("Tile outside the bounding box: {0}")]
    OutOfBounds(String),

    /// Map request would touch more tiles than allowed
    #[error("Request too large: {tiles} tiles (limit {limit})")]
    RequestTooLarge { tiles: u64, limit: u64 },

    /// Image decode, encode, or composite failure
    #[error("Image error: {0}")]
    Image(String),

    /// Renderd responded with an error status
    #[error("Renderd error: {0}")]
    Renderd(String),

    /// Spatial primitive error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TileError {
    /// Create a cache I/O error
    pub fn cache<S: Into<String>>(msg: S) -> Self {
        TileError::CacheIo(msg.into())
    }

    /// Create an image error
    pub fn image<S: Into<String>>(msg: S) -> Self {
        TileError::Image(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        TileError::Config(msg.into())
    }

    /// Whether a retry (or serving a stale tile) is reasonable.
    pub fn is_retryable(&self) -> bool {
        match self {
            TileError::SourceTimeout(_) | TileError::LockTimeout(_) => true,
            TileError::SourceHttp { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<image::ImageError> for TileError {
    fn from(err: image::ImageError) -> Self {
        TileError::Image(err.to_string())
    }
}

impl From<reqwest::Error> for TileError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TileError::SourceTimeout(err.to_string())
        } else if let Some(status) = err.status() {
            TileError::SourceHttp {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            TileError::SourceResponse(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(TileError::SourceTimeout("t".into()).is_retryable());
        assert!(TileError::SourceHttp { status: 503, message: String::new() }.is_retryable());
        assert!(!TileError::SourceHttp { status: 404, message: String::new() }.is_retryable());
        assert!(!TileError::Config("c".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = TileError::RequestTooLarge { tiles: 900, limit: 500 };
        assert_eq!(err.to_string(), "Request too large: 900 tiles (limit 500)");
    }
}
