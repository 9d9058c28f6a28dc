//! The binary tile index (`MapIndex.dat`).
//!
//! Layout: the 7-byte magic `INDEX32`, then a packed run of 24-byte
//! little-endian records:
//!
//! | bytes  | field              |
//! |--------|--------------------|
//! | 0..4   | x (i32)            |
//! | 4..8   | y (i32)            |
//! | 8..12  | shard (i32)        |
//! | 12..16 | offset (i32)       |
//! | 16..20 | size (i32)         |
//! | 20     | tileset (u8)       |
//! | 21     | zone (i8)          |
//! | 22..24 | padding (zero)     |
//!
//! Records are never moved or removed. Invalidation rewrites a record in
//! place with its `x`, `y` and `zone` negated.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::key::TileKey;

/// Magic bytes at the start of every index file.
pub const INDEX_MAGIC: &[u8; 7] = b"INDEX32";

/// Size of one on-disk record.
pub const RECORD_LEN: usize = 24;

/// Capacity of the in-memory mirror of a fresh index.
pub const INITIAL_CAPACITY: usize = 500;

/// Where one tile's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Tile identity (negated position and zone once invalidated).
    pub key: TileKey,
    /// Shard number (`MapsN.dat`).
    pub shard: i32,
    /// Byte offset of the stored tile within its shard.
    pub offset: i64,
    /// Stored tile length.
    pub size: i32,
}

impl IndexEntry {
    /// Record written over an incomplete trailing record.
    pub const PADDING: IndexEntry = IndexEntry {
        key: TileKey::new(-1, -1, 0, 0),
        shard: 0,
        offset: 0,
        size: 0,
    };

    /// Whether this record has been invalidated (or is padding).
    pub fn is_tombstone(&self) -> bool {
        self.key.x < 0 || self.key.y < 0 || self.key.zone < 0
    }

    /// Encode as an on-disk record.
    pub fn encode(&self) -> Result<[u8; RECORD_LEN], StoreError> {
        let offset = i32::try_from(self.offset)
            .map_err(|_| StoreError::RecordOverflow(self.offset as u64))?;
        let mut rec = [0u8; RECORD_LEN];
        rec[0..4].copy_from_slice(&self.key.x.to_le_bytes());
        rec[4..8].copy_from_slice(&self.key.y.to_le_bytes());
        rec[8..12].copy_from_slice(&self.shard.to_le_bytes());
        rec[12..16].copy_from_slice(&offset.to_le_bytes());
        rec[16..20].copy_from_slice(&self.size.to_le_bytes());
        rec[20] = self.key.tileset;
        rec[21] = self.key.zone as u8;
        Ok(rec)
    }

    /// Decode an on-disk record.
    pub fn decode(rec: &[u8; RECORD_LEN]) -> Self {
        let word = |at: usize| i32::from_le_bytes([rec[at], rec[at + 1], rec[at + 2], rec[at + 3]]);
        IndexEntry {
            key: TileKey::new(word(0), word(4), rec[20], rec[21] as i8),
            shard: word(8),
            offset: i64::from(word(12)),
            size: word(16),
        }
    }
}

/// The index file plus its full in-memory mirror.
///
/// The mirror's capacity follows the file format's growth rule: it starts at
/// [`INITIAL_CAPACITY`] slots and doubles whenever fewer than three free
/// slots remain, never shrinking.
#[derive(Debug)]
pub struct TileIndex {
    path: PathBuf,
    file: File,
    entries: Vec<IndexEntry>,
    capacity: usize,
}

impl TileIndex {
    /// Open an existing index file, or create an empty one.
    ///
    /// Returns the index and whether it was newly created. An existing file
    /// whose body is not a whole number of records has its partial tail
    /// overwritten by one [`IndexEntry::PADDING`] record.
    pub fn open(path: &Path) -> Result<(Self, bool), StoreError> {
        let created = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if created {
            file.write_all(INDEX_MAGIC)?;
            file.flush()?;
            info!(path = %path.display(), "created tile index");
            let index = Self::from_entries(path, file, Vec::new());
            return Ok((index, true));
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < INDEX_MAGIC.len() || &bytes[..INDEX_MAGIC.len()] != INDEX_MAGIC {
            return Err(StoreError::BadMagic(path.to_path_buf()));
        }

        let body = &bytes[INDEX_MAGIC.len()..];
        let mut entries: Vec<IndexEntry> = body
            .chunks_exact(RECORD_LEN)
            .filter_map(|chunk| <&[u8; RECORD_LEN]>::try_from(chunk).ok())
            .map(IndexEntry::decode)
            .collect();

        if body.len() % RECORD_LEN != 0 {
            warn!(
                path = %path.display(),
                len = bytes.len(),
                "index length is not a whole number of records, padding"
            );
            let pos = record_position(entries.len());
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&IndexEntry::PADDING.encode()?)?;
            file.set_len(pos + RECORD_LEN as u64)?;
            entries.push(IndexEntry::PADDING);
        }

        info!(path = %path.display(), entries = entries.len(), "opened tile index");
        Ok((Self::from_entries(path, file, entries), false))
    }

    fn from_entries(path: &Path, file: File, mut entries: Vec<IndexEntry>) -> Self {
        let mut capacity = INITIAL_CAPACITY;
        while entries.len() + 3 > capacity {
            capacity *= 2;
        }
        entries.reserve_exact(capacity - entries.len());
        Self {
            path: path.to_path_buf(),
            file,
            entries,
            capacity,
        }
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in insertion order, tombstones included.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current mirror capacity in records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Linear scan for the first record whose key equals `key`.
    pub fn find(&self, key: &TileKey) -> Option<(usize, &IndexEntry)> {
        self.entries.iter().enumerate().find(|(_, e)| e.key == *key)
    }

    /// Persist a new record at the end of the file, then mirror it.
    pub fn append(&mut self, entry: IndexEntry) -> Result<(), StoreError> {
        let rec = entry.encode()?;
        if self.entries.len() + 3 >= self.capacity {
            self.entries.reserve_exact(self.capacity);
            self.capacity *= 2;
            debug!(capacity = self.capacity, "grew index mirror");
        }
        self.file.seek(SeekFrom::Start(record_position(self.entries.len())))?;
        self.file.write_all(&rec)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Tombstone the first record matching `key`, rewriting only that
    /// record. Returns the entry as it was before invalidation.
    pub fn invalidate(&mut self, key: &TileKey) -> Result<Option<IndexEntry>, StoreError> {
        let Some((pos, &entry)) = self.find(key) else {
            return Ok(None);
        };
        let dead = IndexEntry {
            key: entry.key.tombstone(),
            ..entry
        };
        self.file.seek(SeekFrom::Start(record_position(pos)))?;
        self.file.write_all(&dead.encode()?)?;
        self.entries[pos] = dead;
        Ok(Some(entry))
    }

    /// Flush the index file to disk.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn record_position(i: usize) -> u64 {
    (INDEX_MAGIC.len() + i * RECORD_LEN) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(x: i32, y: i32, offset: i64) -> IndexEntry {
        IndexEntry {
            key: TileKey::new(x, y, 0, 12),
            shard: 0,
            offset,
            size: 100,
        }
    }

    #[test]
    fn test_record_layout() {
        let e = IndexEntry {
            key: TileKey::new(1, -2, 7, -12),
            shard: 3,
            offset: 0x0102_0304,
            size: 200,
        };
        let rec = e.encode().unwrap();
        assert_eq!(&rec[0..4], &1i32.to_le_bytes());
        assert_eq!(&rec[4..8], &(-2i32).to_le_bytes());
        assert_eq!(&rec[12..16], &[4, 3, 2, 1]);
        assert_eq!(rec[20], 7);
        assert_eq!(rec[21] as i8, -12);
        assert_eq!(&rec[22..], &[0, 0]);
        assert_eq!(IndexEntry::decode(&rec), e);
    }

    #[test]
    fn test_offset_overflow() {
        let e = entry(0, 0, i64::from(i32::MAX) + 1);
        assert!(matches!(e.encode(), Err(StoreError::RecordOverflow(_))));
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MapIndex.dat");
        {
            let (mut index, created) = TileIndex::open(&path).unwrap();
            assert!(created);
            index.append(entry(1, 1, 0)).unwrap();
            index.append(entry(2, 2, 100)).unwrap();
        }
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (INDEX_MAGIC.len() + 2 * RECORD_LEN) as u64
        );
        let (index, created) = TileIndex::open(&path).unwrap();
        assert!(!created);
        assert_eq!(index.entries(), &[entry(1, 1, 0), entry(2, 2, 100)]);
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MapIndex.dat");
        std::fs::write(&path, b"INDEX64garbage").unwrap();
        assert!(matches!(TileIndex::open(&path), Err(StoreError::BadMagic(_))));
    }

    #[test]
    fn test_partial_record_is_padded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MapIndex.dat");
        let mut bytes = INDEX_MAGIC.to_vec();
        bytes.extend_from_slice(&entry(5, 6, 0).encode().unwrap());
        bytes.extend_from_slice(&[0xAB; 10]);
        std::fs::write(&path, &bytes).unwrap();

        let (index, _) = TileIndex::open(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.entries()[1], IndexEntry::PADDING);
        assert!(index.entries()[1].is_tombstone());
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (INDEX_MAGIC.len() + 2 * RECORD_LEN) as u64
        );
    }

    #[test]
    fn test_find_returns_first_match() {
        let dir = tempdir().unwrap();
        let (mut index, _) = TileIndex::open(&dir.path().join("i.dat")).unwrap();
        index.append(entry(1, 1, 0)).unwrap();
        index.append(entry(1, 1, 500)).unwrap();
        let (pos, found) = index.find(&TileKey::new(1, 1, 0, 12)).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(found.offset, 0);
    }

    #[test]
    fn test_invalidate_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i.dat");
        let (mut index, _) = TileIndex::open(&path).unwrap();
        index.append(entry(1, 1, 0)).unwrap();
        index.append(entry(2, 2, 100)).unwrap();

        let key = TileKey::new(2, 2, 0, 12);
        assert!(index.invalidate(&key).unwrap().is_some());
        assert!(index.find(&key).is_none());
        assert!(index.invalidate(&key).unwrap().is_none());
        drop(index);

        let (index, _) = TileIndex::open(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.entries()[1].key, TileKey::new(-2, -2, 0, -12));
        assert_eq!(index.entries()[1].offset, 100);
    }

    #[test]
    fn test_origin_tile_tombstone() {
        let dir = tempdir().unwrap();
        let (mut index, _) = TileIndex::open(&dir.path().join("i.dat")).unwrap();
        index.append(entry(0, 0, 0)).unwrap();
        assert!(!index.entries()[0].is_tombstone());

        let key = TileKey::new(0, 0, 0, 12);
        assert!(index.invalidate(&key).unwrap().is_some());
        assert_eq!(index.entries()[0].key, TileKey::new(0, 0, 0, -12));
        assert!(index.entries()[0].is_tombstone());
        assert!(index.find(&key).is_none());
    }

    #[test]
    fn test_capacity_doubles() {
        let dir = tempdir().unwrap();
        let (mut index, _) = TileIndex::open(&dir.path().join("i.dat")).unwrap();
        assert_eq!(index.capacity(), INITIAL_CAPACITY);
        for i in 0..(INITIAL_CAPACITY as i32) {
            index.append(entry(i, i, i64::from(i))).unwrap();
        }
        assert_eq!(index.capacity(), INITIAL_CAPACITY * 2);
        for (i, e) in index.entries().iter().enumerate() {
            assert_eq!(e.key.x, i as i32);
        }
    }
}
