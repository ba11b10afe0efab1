//! Storage layer: content-addressed blob pools.

pub use self::local::LocalPool;

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::key::Key;

mod local;
mod pack;

/// Objects shorter than this many bytes are held in the pool's pack table
/// instead of individual files.
pub const PACK_LIMIT: usize = 1024;

/// A content-addressed blob store.
///
/// Keys equal the hash of the bytes they address, and once a key is
/// written the bytes at that key never change. The structure layer is
/// generic over this trait; only the local-filesystem backend persists
/// anything.
pub trait Pool {
    /// Read stream type returned by [`Pool::get`].
    type Reader: Read + Seek;

    /// Stores a byte buffer, returning its key.
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<Key>;

    /// Stores the contents of a seekable stream.
    ///
    /// The stream is rewound and hashed in a first pass; the bytes are only
    /// written out when the object is not already present.
    fn put_seekable<R: Read + Seek>(&mut self, reader: R) -> Result<Key>;

    /// Stores the contents of a non-seekable stream in a single fused
    /// hash-and-write pass.
    fn put_reader<R: Read>(&mut self, reader: R) -> Result<Key>;

    /// Returns a fresh read stream over the object, positioned at 0.
    fn get(&self, key: &Key) -> Result<Self::Reader>;

    /// Returns the size of the object in bytes, or 0 if absent.
    fn size(&self, key: &Key) -> Result<u64>;

    /// Durably persists any state held in memory.
    fn flush(&mut self) -> Result<()>;
}

/// A pool keeping every object in memory.
///
/// Useful for tests and scratch work; `flush` is a no-op.
#[derive(Debug, Default)]
pub struct MemoryPool {
    objects: BTreeMap<Key, Vec<u8>>,
}

impl MemoryPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pool for MemoryPool {
    type Reader = Cursor<Vec<u8>>;

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<Key> {
        let key = Key::of(bytes);
        self.objects.entry(key).or_insert_with(|| bytes.to_vec());
        Ok(key)
    }

    fn put_seekable<R: Read + Seek>(&mut self, mut reader: R) -> Result<Key> {
        reader.seek(SeekFrom::Start(0))?;
        self.put_reader(reader)
    }

    fn put_reader<R: Read>(&mut self, mut reader: R) -> Result<Key> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        let key = Key::of(&buf);
        self.objects.entry(key).or_insert(buf);
        Ok(key)
    }

    fn get(&self, key: &Key) -> Result<Self::Reader> {
        self.objects
            .get(key)
            .cloned()
            .map(Cursor::new)
            .ok_or(Error::NotFound(*key))
    }

    fn size(&self, key: &Key) -> Result<u64> {
        Ok(self.objects.get(key).map(|b| b.len() as u64).unwrap_or(0))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trip() {
        let mut pool = MemoryPool::new();
        let key = pool.put_bytes(b"hello").unwrap();
        assert_eq!(key, Key::of(b"hello"));

        let mut out = Vec::new();
        pool.get(&key).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(pool.size(&key).unwrap(), 5);
    }

    #[test]
    fn memory_absent_key() {
        let pool = MemoryPool::new();
        let missing = Key::of(b"nothing here");
        assert!(matches!(pool.get(&missing), Err(Error::NotFound(k)) if k == missing));
        assert_eq!(pool.size(&missing).unwrap(), 0);
    }
}
