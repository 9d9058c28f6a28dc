//! Get-or-fetch over the tile store.

use doq_metrics::metric_defs;
use tracing::{debug, warn};

use crate::decode::{decode_tile, PixelGrid};
use crate::error::{StoreError, TileError};
use crate::fetcher::TileFetch;
use crate::key::TileKey;
use crate::retry::{RetryPolicy, Sleeper, ThreadSleeper};
use crate::store::TileStore;
use crate::Result;

/// Something that hands out decoded tiles by key.
pub trait TileProvider {
    /// Decoded pixels for `key`.
    fn tile(&mut self, key: &TileKey) -> Result<PixelGrid>;

    /// Forget any stored copy of `keys`, so the next request refetches.
    fn invalidate_tiles(&mut self, keys: &[TileKey]) -> Result<()>;
}

/// Tile store plus a fetcher to fill misses.
pub struct TileCache<F> {
    store: TileStore,
    fetcher: F,
    policy: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
}

impl<F: TileFetch> TileCache<F> {
    pub fn new(store: TileStore, fetcher: F, policy: RetryPolicy) -> Self {
        Self {
            store,
            fetcher,
            policy,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    /// Replace the sleeper used between retries.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn store(&self) -> &TileStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TileStore {
        &mut self.store
    }

    pub fn fetcher_mut(&mut self) -> &mut F {
        &mut self.fetcher
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decoded pixels for `key`, downloading and storing them on a miss.
    ///
    /// A stored copy that cannot be read or decoded is invalidated and
    /// treated as a miss. Download and decode failures share one retry
    /// budget; exhausting it fails the whole call.
    pub fn get_or_fetch(&mut self, key: &TileKey) -> Result<PixelGrid> {
        let edge = key.theme()?.edge_px;

        match self.store.read(key) {
            Ok(Some(buf)) => match decode_tile(&buf, edge) {
                Ok(grid) => {
                    metrics::counter!(metric_defs::CACHE_HITS.name).increment(1);
                    return Ok(grid);
                }
                Err(e) => {
                    warn!(%key, error = %e, "stored tile does not decode, invalidating");
                    metrics::counter!(metric_defs::DECODE_FAILURES.name, "source" => "store")
                        .increment(1);
                    self.store.invalidate(key)?;
                }
            },
            Ok(None) => {}
            Err(e @ StoreError::ShortRead { .. }) => {
                warn!(%key, error = %e, "stored tile is truncated, invalidating");
                self.store.invalidate(key)?;
            }
            Err(e) => return Err(e.into()),
        }
        metrics::counter!(metric_defs::CACHE_MISSES.name).increment(1);

        let attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.download(key, edge) {
                Ok((raw, grid)) => {
                    self.store.append(key, &raw)?;
                    debug!(%key, attempt, "cached downloaded tile");
                    return Ok(grid);
                }
                Err(err) => err,
            };

            if attempt >= attempts {
                warn!(%key, attempts, error = %err, "giving up on tile");
                return Err(TileError::RetriesExhausted {
                    key: *key,
                    attempts,
                    last: Box::new(err),
                });
            }

            let pause = self.policy.delay_after(&err);
            debug!(%key, attempt, ?pause, error = %err, "retrying tile");
            metrics::histogram!(metric_defs::RETRY_SLEEP.name).record(pause.as_secs_f64());
            self.sleeper.sleep(pause);
        }
    }

    fn download(&mut self, key: &TileKey, edge: u32) -> Result<(Vec<u8>, PixelGrid)> {
        let raw = self.fetcher.fetch(key)?;
        match decode_tile(&raw, edge) {
            Ok(grid) => Ok((raw, grid)),
            Err(e) => {
                metrics::counter!(metric_defs::DECODE_FAILURES.name, "source" => "network")
                    .increment(1);
                Err(e.into())
            }
        }
    }

    /// Invalidate one tile. Returns whether a stored copy existed.
    pub fn invalidate(&mut self, key: &TileKey) -> Result<bool> {
        Ok(self.store.invalidate(key)?)
    }

    /// Invalidate every key in `keys`. Returns how many had stored copies.
    pub fn invalidate_region<'a>(&mut self, keys: impl IntoIterator<Item = &'a TileKey>) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.store.invalidate(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Close the underlying store. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        Ok(self.store.close()?)
    }
}

impl<F: TileFetch> TileProvider for TileCache<F> {
    fn tile(&mut self, key: &TileKey) -> Result<PixelGrid> {
        self.get_or_fetch(key)
    }

    fn invalidate_tiles(&mut self, keys: &[TileKey]) -> Result<()> {
        self.invalidate_region(keys).map(|_| ())
    }
}
