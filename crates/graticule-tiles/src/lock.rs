//! Tile locking.
//!
//! Cross-process single-writer locks per `(cache, meta-tile)`, file-based so
//! they work between independent processes sharing a cache directory. The
//! semaphore locker bounds concurrent requests per upstream host; the dummy
//! locker pairs with the dummy cache.

use async_trait::async_trait;
use graticule_core::TileCoord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{Result, TileError};

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    File { path: PathBuf },
    Permit(#[allow(dead_code)] OwnedSemaphorePermit),
    Noop,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let GuardInner::File { path } = &self.inner {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove lock file {:?}: {}", path, e);
                }
            }
        }
    }
}

/// Mutual exclusion per `(cache, tile)` across processes.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until the lock is held or the timeout elapses.
    async fn acquire(&self, cache_id: &str, coord: TileCoord) -> Result<LockGuard>;
}

/// File-based locker. A lock is an exclusively created `.lck` file; crashed
/// holders are reclaimed once the file outlives `stale_after`.
pub struct FileLocker {
    dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    stale_after: Duration,
}

impl FileLocker {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            poll_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(300),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn lock_path(&self, cache_id: &str, coord: TileCoord) -> PathBuf {
        self.dir
            .join(format!("{}-{}-{}-{}.lck", cache_id, coord.z, coord.x, coord.y))
    }
}

#[async_trait]
impl Locker for FileLocker {
    async fn acquire(&self, cache_id: &str, coord: TileCoord) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.lock_path(cache_id, coord);
        let start = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    return Ok(LockGuard {
                        inner: GuardInner::File { path },
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Reclaim locks left behind by a crashed process.
                    if let Ok(meta) = fs::metadata(&path).await {
                        if let Ok(mtime) = meta.modified() {
                            if mtime.elapsed().unwrap_or_default() > self.stale_after {
                                warn!("reclaiming stale lock {:?}", path);
                                let _ = fs::remove_file(&path).await;
                                continue;
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= self.timeout {
                debug!("lock timeout on {:?}", path);
                return Err(TileError::LockTimeout(format!(
                    "{}-{}",
                    cache_id, coord
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Allows up to `permits` concurrent holders per key. Used to bound
/// concurrent requests against one upstream host.
pub struct SemaphoreLocker {
    permits: usize,
    timeout: Duration,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SemaphoreLocker {
    pub fn new(permits: usize, timeout: Duration) -> Self {
        Self {
            permits: permits.max(1),
            timeout,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire one slot for `key` (typically an upstream host hash).
    pub async fn acquire_key(&self, key: &str) -> Result<LockGuard> {
        let semaphore = {
            let mut map = self.semaphores.lock();
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
                .clone()
        };
        match tokio::time::timeout(self.timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(LockGuard {
                inner: GuardInner::Permit(permit),
            }),
            Ok(Err(_)) => Err(TileError::LockTimeout(format!("semaphore closed: {}", key))),
            Err(_) => Err(TileError::LockTimeout(format!(
                "waited {}ms for {}",
                self.timeout.as_millis(),
                key
            ))),
        }
    }
}

#[async_trait]
impl Locker for SemaphoreLocker {
    async fn acquire(&self, cache_id: &str, coord: TileCoord) -> Result<LockGuard> {
        self.acquire_key(&format!("{}-{}", cache_id, coord)).await
    }
}

/// Always succeeds immediately. Paired with the dummy cache.
#[derive(Debug, Default)]
pub struct DummyLocker;

#[async_trait]
impl Locker for DummyLocker {
    async fn acquire(&self, _cache_id: &str, _coord: TileCoord) -> Result<LockGuard> {
        Ok(LockGuard {
            inner: GuardInner::Noop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_exclusive_acquire_and_release() {
        let dir = tempdir().unwrap();
        let locker = FileLocker::new(dir.path(), Duration::from_millis(200));
        let coord = TileCoord::new(3, 1, 1);

        let guard = locker.acquire("cache", coord).await.unwrap();
        // Second acquire times out while the guard lives.
        let err = locker.acquire("cache", coord).await.unwrap_err();
        assert!(matches!(err, TileError::LockTimeout(_)));

        drop(guard);
        let _guard = locker.acquire("cache", coord).await.unwrap();
    }

    #[tokio::test]
    async fn test_different_coords_do_not_contend() {
        let dir = tempdir().unwrap();
        let locker = FileLocker::new(dir.path(), Duration::from_millis(200));
        let _a = locker.acquire("cache", TileCoord::new(3, 0, 0)).await.unwrap();
        let _b = locker.acquire("cache", TileCoord::new(3, 1, 0)).await.unwrap();
        let _c = locker.acquire("other", TileCoord::new(3, 0, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_reclaimed() {
        let dir = tempdir().unwrap();
        let locker = FileLocker::new(dir.path(), Duration::from_millis(500))
            .with_stale_after(Duration::from_millis(0));
        let coord = TileCoord::new(5, 2, 2);

        // Simulate a crashed holder: lock file exists, no guard.
        std::fs::write(
            dir.path().join(format!("cache-{}-{}-{}.lck", coord.z, coord.x, coord.y)),
            b"",
        )
        .unwrap();

        let _guard = locker.acquire("cache", coord).await.unwrap();
    }

    #[tokio::test]
    async fn test_semaphore_bounds_holders() {
        let locker = SemaphoreLocker::new(2, Duration::from_millis(100));
        let _a = locker.acquire_key("upstream").await.unwrap();
        let _b = locker.acquire_key("upstream").await.unwrap();
        let err = locker.acquire_key("upstream").await.unwrap_err();
        assert!(matches!(err, TileError::LockTimeout(_)));

        // Other keys are unaffected.
        let _c = locker.acquire_key("elsewhere").await.unwrap();
    }

    #[tokio::test]
    async fn test_dummy_locker_always_succeeds() {
        let locker = DummyLocker;
        let _a = locker.acquire("x", TileCoord::new(0, 0, 0)).await.unwrap();
        let _b = locker.acquire("x", TileCoord::new(0, 0, 0)).await.unwrap();
    }
}
