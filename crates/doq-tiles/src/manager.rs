//! Process-wide owner of the tile cache.
//!
//! At most one [`TileManager`] is alive per process. It owns the cache
//! directory (a temporary one when no persistent directory is configured)
//! and registers its close routine with the exit cleanup registry, so
//! [`run_exit_cleanup`] can flush the index from a signal handler.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cache::{TileCache, TileProvider};
use crate::config::CacheConfig;
use crate::decode::PixelGrid;
use crate::error::{FetchError, StoreError, TileError};
use crate::fetcher::{NetworkFetcher, TileFetch};
use crate::key::TileKey;
use crate::store::TileStore;
use crate::Result;

static INSTANCE_OPEN: AtomicBool = AtomicBool::new(false);

/// Exclusive claim on the one-manager-per-process slot.
#[derive(Debug)]
struct InstanceGuard(());

impl InstanceGuard {
    fn acquire() -> Result<Self> {
        INSTANCE_OPEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InstanceGuard(()))
            .map_err(|_| TileError::AlreadyOpen)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        INSTANCE_OPEN.store(false, Ordering::Release);
    }
}

// ============================================================================
// Exit cleanup registry
// ============================================================================

type CleanupFn = Box<dyn FnMut() + Send>;

static EXIT_CLEANUP: Mutex<Vec<(u64, CleanupFn)>> = parking_lot::const_mutex(Vec::new());
static NEXT_CLEANUP_ID: AtomicU64 = AtomicU64::new(1);

/// How long a cleanup routine waits for a manager that is mid-operation.
const CLEANUP_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn register_cleanup(routine: CleanupFn) -> u64 {
    let id = NEXT_CLEANUP_ID.fetch_add(1, Ordering::Relaxed);
    EXIT_CLEANUP.lock().push((id, routine));
    id
}

fn unregister_cleanup(id: u64) {
    EXIT_CLEANUP.lock().retain(|(n, _)| *n != id);
}

/// Run and forget every registered cleanup routine.
///
/// Safe to call more than once and from a signal handler thread. A manager
/// that is mid-operation is waited on for up to five seconds and then left
/// unclosed. [`TileCache::get_or_fetch`] sleeps between download attempts
/// (up to the alternate backend's cooldown) with the manager locked, so an
/// interrupt during a retry usually skips the close. Index records are
/// written unbuffered, so nothing already stored is lost.
pub fn run_exit_cleanup() {
    let routines = std::mem::take(&mut *EXIT_CLEANUP.lock());
    if !routines.is_empty() {
        debug!(count = routines.len(), "running exit cleanup");
    }
    for (_, mut routine) in routines {
        routine();
    }
}

// ============================================================================
// Manager
// ============================================================================

struct Shared<F> {
    cache: TileCache<F>,
    temp_dir: Option<TempDir>,
}

impl<F: TileFetch> Shared<F> {
    fn close(&mut self) -> Result<()> {
        let result = self.cache.close();
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "failed to remove temporary cache");
            } else {
                debug!(path = %path.display(), "removed temporary cache");
            }
        }
        result
    }
}

/// Owner of the tile cache for this process.
///
/// Dropping the manager closes the cache and releases the process slot.
///
/// # Example
///
/// ```no_run
/// use doq_tiles::{CacheConfig, TileKey, TileManager, AIR_1M};
///
/// let config = CacheConfig::load("doq.yaml")?;
/// let manager = TileManager::open(&config)?;
///
/// let key = TileKey::new(4321, 37654, AIR_1M, 12);
/// let grid = manager.lock().get_or_fetch(&key)?;
/// println!("tile is {}x{}", grid.width(), grid.height());
/// # Ok::<(), doq_tiles::TileError>(())
/// ```
pub struct TileManager<F: TileFetch + 'static = NetworkFetcher> {
    shared: Arc<Mutex<Shared<F>>>,
    dir: PathBuf,
    temporary: bool,
    cleanup_id: u64,
    _guard: InstanceGuard,
}

impl TileManager<NetworkFetcher> {
    /// Open the cache described by `config`, downloading from its backends.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = NetworkFetcher::new(&config.network, config.retry.alternate_cooldown());
        Self::open_with_fetcher(config, fetcher)
    }
}

impl<F: TileFetch + 'static> TileManager<F> {
    /// Open the cache described by `config` with a caller-supplied fetcher.
    ///
    /// Fails with [`TileError::AlreadyOpen`] while another manager is alive.
    pub fn open_with_fetcher(config: &CacheConfig, fetcher: F) -> Result<Self> {
        let guard = InstanceGuard::acquire()?;

        let (dir, temp_dir) = match config.cache_dir.as_deref() {
            Some(dir) if dir.is_dir() => (dir.to_path_buf(), None),
            other => {
                if let Some(dir) = other {
                    warn!(path = %dir.display(), "cache directory missing, using a temporary one");
                }
                let temp = tempfile::Builder::new()
                    .prefix("doq-cache-")
                    .tempdir()
                    .map_err(StoreError::Io)?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        let temporary = temp_dir.is_some();

        let store = TileStore::open(&dir, config.store_options())?;
        let cache = TileCache::new(store, fetcher, config.retry.policy());
        let shared = Arc::new(Mutex::new(Shared { cache, temp_dir }));

        let weak: Weak<Mutex<Shared<F>>> = Arc::downgrade(&shared);
        let cleanup_id = register_cleanup(Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let locked = shared.try_lock_for(CLEANUP_LOCK_TIMEOUT);
            match locked {
                Some(mut state) => {
                    if let Err(e) = state.close() {
                        warn!(error = %e, "exit cleanup failed to close tile cache");
                    }
                }
                None => warn!("tile cache busy, skipping exit cleanup"),
            };
        }));

        info!(dir = %dir.display(), temporary, "opened tile manager");
        Ok(Self {
            shared,
            dir,
            temporary,
            cleanup_id,
            _guard: guard,
        })
    }

    /// Exclusive access to the cache.
    ///
    /// The lock is held for the whole of a cache call, retry sleeps
    /// included.
    pub fn lock(&self) -> MappedMutexGuard<'_, TileCache<F>> {
        MutexGuard::map(self.shared.lock(), |s| &mut s.cache)
    }

    /// Directory holding the index and shards.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the directory is removed on close.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Whether some manager currently holds the process slot.
    pub fn is_open_elsewhere() -> bool {
        INSTANCE_OPEN.load(Ordering::Acquire)
    }

    /// Flush and release the cache files. Later calls do nothing.
    pub fn close(&self) -> Result<()> {
        self.shared.lock().close()
    }

    /// Whether `key` has a live stored copy.
    pub fn tile_exists(&self, key: &TileKey) -> bool {
        self.lock().store().contains(key).unwrap_or(false)
    }

    /// Copy the stored bytes for `key` into `buf`.
    ///
    /// Returns 0 on a miss or any failure. A truncated stored copy is
    /// invalidated.
    pub fn get_tile(&self, key: &TileKey, buf: &mut [u8]) -> usize {
        let mut cache = self.lock();
        match cache.store_mut().get_into(key, buf) {
            Ok(Some(n)) => n,
            Ok(None) => 0,
            Err(e @ StoreError::ShortRead { .. }) => {
                warn!(%key, error = %e, "stored tile is truncated, invalidating");
                if let Err(e) = cache.store_mut().invalidate(key) {
                    warn!(%key, error = %e, "failed to invalidate tile");
                }
                0
            }
            Err(e) => {
                warn!(%key, error = %e, "failed to read tile");
                0
            }
        }
    }

    /// Store `bytes` for `key`. Returns the number of bytes consumed.
    pub fn put_tile(&self, key: &TileKey, bytes: &[u8]) -> Result<usize> {
        Ok(self.lock().store_mut().append(key, bytes)?)
    }

    /// Invalidate the stored copy of `key`; fails if there is none.
    pub fn invalidate_tile(&self, key: &TileKey) -> Result<()> {
        if self.lock().invalidate(key)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(*key).into())
        }
    }

    /// Download `key` into `buf` without touching the store.
    ///
    /// Returns the byte count, or the negative code of the failure.
    pub fn fetch_tile_from_network(&self, key: &TileKey, buf: &mut [u8]) -> i64 {
        let result = self.lock().fetcher_mut().fetch(key);
        match result {
            Ok(bytes) if bytes.len() > buf.len() => {
                let err = FetchError::BufferTooSmall {
                    required: bytes.len(),
                    available: buf.len(),
                };
                warn!(%key, error = %err, "downloaded tile does not fit");
                err.code()
            }
            Ok(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                bytes.len() as i64
            }
            Err(e) => e.code(),
        }
    }
}

impl<F: TileFetch + 'static> TileProvider for TileManager<F> {
    fn tile(&mut self, key: &TileKey) -> Result<PixelGrid> {
        self.lock().get_or_fetch(key)
    }

    fn invalidate_tiles(&mut self, keys: &[TileKey]) -> Result<()> {
        self.lock().invalidate_region(keys).map(|_| ())
    }
}

impl<F: TileFetch + 'static> Drop for TileManager<F> {
    fn drop(&mut self) {
        unregister_cleanup(self.cleanup_id);
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close tile manager");
        }
        info!(dir = %self.dir.display(), "closed tile manager");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme::AIR_1M;
    use serial_test::serial;
    use tempfile::tempdir;

    struct Offline;

    impl TileFetch for Offline {
        fn fetch(&mut self, _key: &TileKey) -> std::result::Result<Vec<u8>, FetchError> {
            Err(FetchError::ClosedBeforeHeaders)
        }
    }

    struct Canned(Vec<u8>);

    impl TileFetch for Canned {
        fn fetch(&mut self, _key: &TileKey) -> std::result::Result<Vec<u8>, FetchError> {
            Ok(self.0.clone())
        }
    }

    fn config_in(dir: &Path) -> CacheConfig {
        CacheConfig {
            cache_dir: Some(dir.to_path_buf()),
            ..CacheConfig::default()
        }
    }

    const KEY: TileKey = TileKey::new(10, 20, AIR_1M, 12);

    #[test]
    #[serial]
    fn test_second_instance_rejected() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let first = TileManager::open_with_fetcher(&config, Offline).unwrap();
        assert!(TileManager::<Offline>::is_open_elsewhere());
        assert!(matches!(
            TileManager::open_with_fetcher(&config, Offline),
            Err(TileError::AlreadyOpen)
        ));
        drop(first);
        assert!(!TileManager::<Offline>::is_open_elsewhere());
        TileManager::open_with_fetcher(&config, Offline).unwrap();
    }

    #[test]
    #[serial]
    fn test_temporary_dir_removed_on_close() {
        let config = CacheConfig::default();
        let manager = TileManager::open_with_fetcher(&config, Offline).unwrap();
        assert!(manager.is_temporary());
        let dir = manager.dir().to_path_buf();
        assert!(dir.join("MapIndex.dat").exists());

        manager.close().unwrap();
        manager.close().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    #[serial]
    fn test_collaborator_api() {
        let dir = tempdir().unwrap();
        let manager = TileManager::open_with_fetcher(&config_in(dir.path()), Offline).unwrap();
        assert!(!manager.is_temporary());

        let payload = vec![7u8; 200];
        assert!(!manager.tile_exists(&KEY));
        assert_eq!(manager.put_tile(&KEY, &payload).unwrap(), 200);
        assert!(manager.tile_exists(&KEY));

        let mut buf = vec![0u8; 512];
        assert_eq!(manager.get_tile(&KEY, &mut buf), 200);
        assert_eq!(&buf[..200], &payload[..]);

        let mut small = vec![0u8; 10];
        assert_eq!(manager.get_tile(&KEY, &mut small), 0);

        manager.invalidate_tile(&KEY).unwrap();
        assert!(manager.invalidate_tile(&KEY).is_err());
        assert_eq!(manager.get_tile(&KEY, &mut buf), 0);
    }

    #[test]
    #[serial]
    fn test_fetch_tile_from_network_codes() {
        let dir = tempdir().unwrap();
        let manager = TileManager::open_with_fetcher(&config_in(dir.path()), Offline).unwrap();
        let mut buf = vec![0u8; 64];
        assert_eq!(manager.fetch_tile_from_network(&KEY, &mut buf), -2);
        drop(manager);

        let manager =
            TileManager::open_with_fetcher(&config_in(dir.path()), Canned(vec![1u8; 32])).unwrap();
        assert_eq!(manager.fetch_tile_from_network(&KEY, &mut buf), 32);
        let mut tiny = vec![0u8; 8];
        assert_eq!(manager.fetch_tile_from_network(&KEY, &mut tiny), -1);
        assert!(!manager.tile_exists(&KEY));
    }

    #[test]
    #[serial]
    fn test_exit_cleanup_closes_store() {
        let dir = tempdir().unwrap();
        let manager = TileManager::open_with_fetcher(&config_in(dir.path()), Offline).unwrap();
        manager.put_tile(&KEY, &[3u8; 50]).unwrap();

        run_exit_cleanup();
        assert!(!manager.lock().store().is_open());
        run_exit_cleanup();
        manager.close().unwrap();
    }
}
