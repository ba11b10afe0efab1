//! Content hash keys and streaming hash helpers.

use std::fmt::{self, Debug, Display, Formatter};
use std::io::Write;
use std::str::FromStr;

use sha3::{Digest, Sha3_256};

use crate::error::Error;

/// Number of bytes in a SHA3-256 digest.
pub const KEY_LEN: usize = 32;

/// Number of characters in the hex rendering of a key.
pub const KEY_HEX_LEN: usize = KEY_LEN * 2;

/// A unique cryptographic hash addressing one immutable byte sequence.
///
/// Keys render as lowercase hex and compare by their raw digest bytes,
/// which orders identically to comparing the hex strings.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// The all-zero sentinel designating a detached local root. It is not
    /// expected to exist in any pool.
    pub const ZERO: Key = Key([0u8; KEY_LEN]);

    /// Hashes `bytes` and returns the resulting key.
    pub fn of(bytes: &[u8]) -> Self {
        Key(Sha3_256::digest(bytes).into())
    }

    /// Creates a key from a raw digest.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Returns the lowercase hex rendering used on disk and in payloads.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}({})", stringify!(Key), self.to_hex())
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut buf)
            .map_err(|_| Error::InvalidStructure(format!("`{}` is not a valid key", s)))?;
        Ok(Key(buf))
    }
}

/// An incremental hasher that computes keys.
#[derive(Debug, Default)]
pub struct Hasher(Sha3_256);

impl Hasher {
    /// Constructs a new `Hasher`.
    pub fn new() -> Self {
        Hasher(Sha3_256::new())
    }

    /// Adds input bytes to the hash state. May be called any number of
    /// times.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Finalizes the hash state and returns the computed `Key`.
    pub fn finish(&self) -> Key {
        Key(self.0.clone().finalize().into())
    }
}

/// Wraps an I/O writer and hashes everything written through it.
///
/// This is the fused single-pass path: one read of the source both hashes
/// the bytes and lands them in the underlying writer.
#[derive(Debug)]
pub struct HashWriter<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> HashWriter<W> {
    /// Creates a new `HashWriter<W>` over `inner`.
    pub fn new(inner: W) -> Self {
        HashWriter {
            inner,
            hasher: Hasher::new(),
        }
    }

    /// Finalizes the hash state and returns the computed `Key`.
    pub fn key(&self) -> Key {
        self.hasher.finish()
    }

    /// Unwraps this `HashWriter<W>`, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let len = self.inner.write(buf)?;
        self.hasher.update(&buf[0..len]);
        Ok(len)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let key = Key::of(b"hello");
        let hex = key.to_hex();
        assert_eq!(hex.len(), KEY_HEX_LEN);
        assert_eq!(hex.parse::<Key>().unwrap(), key);
    }

    #[test]
    fn zero_sentinel_is_all_zero_hex() {
        assert_eq!(Key::ZERO.to_hex(), "0".repeat(KEY_HEX_LEN));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("abc".parse::<Key>().is_err());
        assert!("g".repeat(KEY_HEX_LEN).parse::<Key>().is_err());
    }

    #[test]
    fn hash_writer_matches_one_shot_hash() {
        let mut writer = HashWriter::new(std::io::sink());
        writer.write_all(b"he").unwrap();
        writer.write_all(b"llo").unwrap();
        assert_eq!(writer.key(), Key::of(b"hello"));
    }

    #[test]
    fn incremental_hasher_matches_one_shot_hash() {
        let mut hasher = Hasher::new();
        hasher.update(b"he").update(b"llo");
        assert_eq!(hasher.finish(), Key::of(b"hello"));
    }
}
