//! The tile store: index plus append-only shard files.
//!
//! A cache directory holds `MapIndex.dat` and shards `Maps0.dat`,
//! `Maps1.dat`, ... Only the last shard accepts writes; once it would grow
//! past the shard limit a new one is started. Every stored tile is preceded
//! by an ASCII header `BEGIN TILE x=<x> y=<y> z=<zone> s=<tileset> `.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use doq_metrics::metric_defs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::index::{IndexEntry, TileIndex};
use crate::key::TileKey;

/// File name of the index within a cache directory.
pub const INDEX_FILE: &str = "MapIndex.dat";

/// Default size at which a shard stops accepting writes.
pub const DEFAULT_SHARD_LIMIT: u64 = 625 * 1024 * 1024;

/// File name of shard `n`.
pub fn shard_file_name(n: usize) -> String {
    format!("Maps{}.dat", n)
}

/// ASCII header written in front of each stored tile.
pub fn tile_header(key: &TileKey) -> String {
    format!(
        "BEGIN TILE x={} y={} z={} s={} ",
        key.x, key.y, key.zone, key.tileset
    )
}

/// How tile bytes are laid out after the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    /// Header, then the complete payload. The entry points at the payload.
    #[default]
    Framed,
    /// The header replaces the first `header.len()` payload bytes, which are
    /// assumed to be leftover HTTP response headers. The entry points at the
    /// header.
    Legacy,
}

/// Store tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Byte length a shard may not exceed (unless it holds a single tile).
    pub shard_limit: u64,
    /// Payload layout for new tiles.
    pub format: StoreFormat,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            shard_limit: DEFAULT_SHARD_LIMIT,
            format: StoreFormat::Framed,
        }
    }
}

/// Size summary of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub id: usize,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Size summary of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Index records, tombstones included.
    pub entries: usize,
    /// Records not invalidated.
    pub live: usize,
    /// Invalidated or padding records.
    pub tombstones: usize,
    /// Mirror capacity in records.
    pub index_capacity: usize,
    pub shards: Vec<ShardStats>,
}

#[derive(Debug)]
struct Shard {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Shard {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { path, file, len })
    }
}

#[derive(Debug)]
struct OpenStore {
    index: TileIndex,
    shards: Vec<Shard>,
}

/// Index and shards of one cache directory.
///
/// Single writer: the store takes `&mut self` for every operation that
/// touches a file handle, and is meant to be owned by one
/// [`TileCache`](crate::TileCache).
#[derive(Debug)]
pub struct TileStore {
    dir: PathBuf,
    options: StoreOptions,
    state: Option<OpenStore>,
}

impl TileStore {
    /// Open the store in `dir`, creating the index and first shard if the
    /// directory holds no index yet.
    ///
    /// Every shard the index refers to must exist; all of them are checked
    /// before any is opened.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let (index, created) = TileIndex::open(&dir.join(INDEX_FILE))?;

        let shard_count = index
            .entries()
            .iter()
            .map(|e| e.shard)
            .max()
            .map_or(1, |max| (max.max(0) as usize) + 1);

        let paths: Vec<PathBuf> = (0..shard_count)
            .map(|n| dir.join(shard_file_name(n)))
            .collect();
        if !created {
            if let Some(missing) = paths.iter().find(|p| !p.is_file()) {
                return Err(StoreError::MissingShard(missing.clone()));
            }
        }

        let shards = paths
            .into_iter()
            .map(Shard::open)
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            dir = %dir.display(),
            entries = index.len(),
            shards = shards.len(),
            "opened tile store"
        );
        metrics::gauge!(metric_defs::STORE_SHARDS.name).set(shards.len() as f64);
        Ok(Self {
            dir,
            options,
            state: Some(OpenStore { index, shards }),
        })
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self) -> Result<&OpenStore, StoreError> {
        self.state.as_ref().ok_or(StoreError::Closed)
    }

    fn state_mut(&mut self) -> Result<&mut OpenStore, StoreError> {
        self.state.as_mut().ok_or(StoreError::Closed)
    }

    /// All index records, in insertion order.
    pub fn entries(&self) -> Result<&[IndexEntry], StoreError> {
        Ok(self.state()?.index.entries())
    }

    /// First index record for `key`.
    pub fn find(&self, key: &TileKey) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self.state()?.index.find(key).map(|(_, e)| *e))
    }

    /// Whether `key` has a live record.
    pub fn contains(&self, key: &TileKey) -> Result<bool, StoreError> {
        Ok(self.find(key)?.is_some())
    }

    /// Read the stored bytes for `key`, or `None` if it is not indexed.
    pub fn read(&mut self, key: &TileKey) -> Result<Option<Vec<u8>>, StoreError> {
        match self.find(key)? {
            Some(entry) => self.read_entry(&entry).map(Some),
            None => Ok(None),
        }
    }

    /// Copy the stored bytes for `key` into `buf`.
    ///
    /// Returns the number of bytes copied, or `None` if the key is not
    /// indexed. Fails if `buf` is smaller than the stored tile or the shard
    /// holds fewer bytes than recorded.
    pub fn get_into(&mut self, key: &TileKey, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let Some(entry) = self.find(key)? else {
            return Ok(None);
        };
        let size = entry.size.max(0) as usize;
        if buf.len() < size {
            return Err(StoreError::BufferTooSmall {
                key: *key,
                required: size,
                available: buf.len(),
            });
        }
        let bytes = self.read_entry(&entry)?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(Some(bytes.len()))
    }

    /// Read the bytes an index record points at.
    pub fn read_entry(&mut self, entry: &IndexEntry) -> Result<Vec<u8>, StoreError> {
        let state = self.state_mut()?;
        let shard = usize::try_from(entry.shard)
            .ok()
            .and_then(|n| state.shards.get_mut(n))
            .ok_or(StoreError::UnknownShard(entry.shard))?;

        let size = entry.size.max(0) as usize;
        let offset = entry.offset.max(0) as u64;
        shard.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::with_capacity(size);
        (&mut shard.file).take(size as u64).read_to_end(&mut bytes)?;
        if bytes.len() < size {
            return Err(StoreError::ShortRead {
                key: entry.key,
                expected: size,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Append a tile to the last shard and index it.
    ///
    /// Rolls over to a new shard first if the current one is non-empty and
    /// would exceed the shard limit. Returns the payload length.
    pub fn append(&mut self, key: &TileKey, payload: &[u8]) -> Result<usize, StoreError> {
        let header = tile_header(key);
        let format = self.options.format;
        let limit = self.options.shard_limit;

        let (body, min) = match format {
            StoreFormat::Framed => (payload, 0),
            StoreFormat::Legacy => (payload.get(header.len()..).unwrap_or_default(), header.len()),
        };
        if payload.len() <= min {
            return Err(StoreError::PayloadTooSmall {
                len: payload.len(),
                min,
            });
        }
        let size = i32::try_from(payload.len())
            .map_err(|_| StoreError::RecordOverflow(payload.len() as u64))?;
        let write_len = (header.len() + body.len()) as u64;

        let dir = self.dir.clone();
        let state = self.state_mut()?;

        let needs_roll = state
            .shards
            .last()
            .map_or(true, |s| s.len > 0 && s.len + write_len > limit);
        if needs_roll {
            let n = state.shards.len();
            let shard = Shard::open(dir.join(shard_file_name(n)))?;
            info!(shard = n, path = %shard.path.display(), "rolling over to new shard");
            metrics::counter!(metric_defs::SHARD_ROLLOVERS.name).increment(1);
            state.shards.push(shard);
            metrics::gauge!(metric_defs::STORE_SHARDS.name).set(state.shards.len() as f64);
        }

        let shard_id = state.shards.len() - 1;
        let shard = &mut state.shards[shard_id];
        let start = shard.len;
        let offset = match format {
            StoreFormat::Framed => start + header.len() as u64,
            StoreFormat::Legacy => start,
        };
        let offset = i32::try_from(offset).map_err(|_| StoreError::RecordOverflow(offset))?;

        shard.file.write_all(header.as_bytes())?;
        shard.file.write_all(body)?;
        shard.len += write_len;

        state.index.append(IndexEntry {
            key: *key,
            shard: shard_id as i32,
            offset: i64::from(offset),
            size,
        })?;

        debug!(%key, shard = shard_id, offset, size, "appended tile");
        metrics::counter!(metric_defs::STORE_APPENDS.name).increment(1);
        metrics::counter!(metric_defs::STORE_BYTES_WRITTEN.name).increment(write_len);
        Ok(payload.len())
    }

    /// Tombstone the first record for `key`. Shard bytes are untouched.
    ///
    /// Returns `false` if no live record matched.
    pub fn invalidate(&mut self, key: &TileKey) -> Result<bool, StoreError> {
        let removed = self.state_mut()?.index.invalidate(key)?;
        match removed {
            Some(entry) => {
                debug!(%key, shard = entry.shard, offset = entry.offset, "invalidated tile");
                metrics::counter!(metric_defs::INVALIDATIONS.name).increment(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Entry counts and shard sizes.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state()?;
        let entries = state.index.entries();
        let tombstones = entries.iter().filter(|e| e.is_tombstone()).count();
        Ok(StoreStats {
            entries: entries.len(),
            live: entries.len() - tombstones,
            tombstones,
            index_capacity: state.index.capacity(),
            shards: state
                .shards
                .iter()
                .enumerate()
                .map(|(id, s)| ShardStats {
                    id,
                    path: s.path.clone(),
                    bytes: s.len,
                })
                .collect(),
        })
    }

    /// Flush and release the index and every shard. Later calls do nothing.
    pub fn close(&mut self) -> Result<(), StoreError> {
        let Some(mut state) = self.state.take() else {
            return Ok(());
        };
        state.index.sync()?;
        for shard in &mut state.shards {
            if let Err(e) = shard.file.sync_all() {
                warn!(path = %shard.path.display(), error = %e, "failed to sync shard");
            }
        }
        info!(dir = %self.dir.display(), "closed tile store");
        Ok(())
    }
}
