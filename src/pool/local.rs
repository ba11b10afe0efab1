//! Filesystem-backed pool implementation.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{pack, Pool, PACK_LIMIT};
use crate::error::{Error, Result};
use crate::key::{HashWriter, Key, KEY_HEX_LEN};
use crate::util::{self, Contents};

const STAGING_SUBDIR: &str = "_";
const PACK_FILE: &str = "_pack";

/// Sibling count at which a trie directory stops accepting new objects and
/// pushes them one nibble-pair deeper.
const FANOUT_LIMIT: usize = 250;

/// A pool backed by a local directory.
///
/// Objects shorter than [`PACK_LIMIT`] bytes live in an in-memory table
/// persisted to a single `_pack` file on [`flush`](Pool::flush). Larger
/// objects are written to individual files named by their key, fanned out
/// across 2-hex-character subdirectories as directories fill up, so no
/// directory grows much past 500 entries no matter how many objects the
/// pool holds.
///
/// Every file write goes through a uniquely named temp file in the `_`
/// staging directory followed by an atomic rename, so a partially written
/// object is never visible under its final name.
#[derive(Debug)]
pub struct LocalPool {
    path: PathBuf,
    staging: PathBuf,
    pack: BTreeMap<Key, Vec<u8>>,
}

impl LocalPool {
    /// Opens the pool rooted at the existing directory `path`.
    ///
    /// The staging subdirectory is created if absent and the pack table is
    /// loaded from `_pack` when present.
    ///
    /// Returns `Err` if `path` is not a directory or the pack file is
    /// corrupt.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{}` is not a pool directory", path.display()),
            )));
        }

        let staging = path.join(STAGING_SUBDIR);
        if !staging.exists() {
            fs::create_dir(&staging)?;
        }

        let pack_path = path.join(PACK_FILE);
        let pack = if pack_path.exists() {
            pack::read(fs::File::open(&pack_path)?)?
        } else {
            BTreeMap::new()
        };

        Ok(LocalPool {
            path,
            staging,
            pack,
        })
    }

    /// Creates the pool directory if needed and opens it.
    pub fn init<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        Self::open(path)
    }

    /// Returns the pool's root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Computes the on-disk location for `key` by descending the prefix
    /// trie.
    ///
    /// At each level, an existing file named by the remaining hex suffix
    /// wins. Otherwise, when the next 2-character subdirectory is missing,
    /// the object belongs in the current directory while it holds fewer
    /// than 250 entries; at 250 or more the subdirectory is created (also
    /// during lookups) and the remainder past the consumed pair names the
    /// file inside it. A given key therefore resolves to exactly one path
    /// at any point in time.
    fn locate(&self, key: &Key) -> Result<PathBuf> {
        let hex = key.to_hex();
        let mut dir = self.path.clone();

        let mut i = 0;
        while i < KEY_HEX_LEN {
            let candidate = dir.join(&hex[i..]);
            if candidate.exists() {
                return Ok(candidate);
            }
            let sub = dir.join(&hex[i..i + 2]);
            if !sub.exists() {
                if fs::read_dir(&dir)?.count() < FANOUT_LIMIT {
                    return Ok(candidate);
                }
                fs::create_dir(&sub)?;
                return Ok(sub.join(&hex[i + 2..]));
            }
            dir = sub;
            i += 2;
        }

        // Would need 32 nested full directories of 250 entries each.
        unreachable!("pool trie exhausted for {}", key)
    }

    fn stage(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(&self.staging)?)
    }

    /// Renames a finished staging file onto `dest`, tolerating a concurrent
    /// writer having landed the same object first.
    fn land(temp: NamedTempFile, dest: &Path) -> Result<()> {
        match temp.persist(dest) {
            Ok(_) => Ok(()),
            Err(_) if dest.is_file() => Ok(()),
            Err(e) => Err(Error::Io(e.error)),
        }
    }
}

impl Pool for LocalPool {
    type Reader = Contents;

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<Key> {
        let key = Key::of(bytes);

        if bytes.len() < PACK_LIMIT {
            self.pack.insert(key, bytes.to_vec());
            debug!(key = %key, len = bytes.len(), "packed object");
            return Ok(key);
        }

        let dest = self.locate(&key)?;
        if !dest.exists() {
            let mut temp = self.stage()?;
            temp.write_all(bytes)?;
            temp.flush()?;
            Self::land(temp, &dest)?;
            debug!(key = %key, len = bytes.len(), "stored object file");
        }

        Ok(key)
    }

    fn put_seekable<R: Read + Seek>(&mut self, mut reader: R) -> Result<Key> {
        reader.seek(SeekFrom::Start(0))?;
        let mut hasher = HashWriter::new(io::sink());
        util::copy_wide(&mut reader, &mut hasher)?;
        let key = hasher.key();

        let dest = self.locate(&key)?;
        if !dest.exists() {
            reader.seek(SeekFrom::Start(0))?;
            let mut temp = self.stage()?;
            util::copy_wide(&mut reader, &mut temp)?;
            temp.flush()?;
            Self::land(temp, &dest)?;
            debug!(key = %key, "stored streamed object");
        }

        Ok(key)
    }

    fn put_reader<R: Read>(&mut self, mut reader: R) -> Result<Key> {
        let mut writer = HashWriter::new(self.stage()?);
        util::copy_wide(&mut reader, &mut writer)?;
        let key = writer.key();
        let mut temp = writer.into_inner();
        temp.flush()?;

        let dest = self.locate(&key)?;
        if !dest.exists() {
            Self::land(temp, &dest)?;
            debug!(key = %key, "stored streamed object");
        }
        // Otherwise the staging file is discarded on drop.

        Ok(key)
    }

    fn get(&self, key: &Key) -> Result<Self::Reader> {
        if let Some(bytes) = self.pack.get(key) {
            return Ok(Contents::Inline(Cursor::new(bytes.clone())));
        }

        let path = self.locate(key)?;
        if !path.exists() {
            return Err(Error::NotFound(*key));
        }
        Ok(util::open_reader(&path)?)
    }

    fn size(&self, key: &Key) -> Result<u64> {
        if let Some(bytes) = self.pack.get(key) {
            return Ok(bytes.len() as u64);
        }

        let path = self.locate(key)?;
        if path.exists() {
            Ok(fs::metadata(path)?.len())
        } else {
            Ok(0)
        }
    }

    fn flush(&mut self) -> Result<()> {
        let pack_path = self.path.join(PACK_FILE);
        if pack_path.exists() {
            // Pick up packed objects landed by concurrent writers since we
            // loaded. Key collisions carry identical bytes by construction.
            let on_disk = pack::read(fs::File::open(&pack_path)?)?;
            self.pack.extend(on_disk);
        }

        let mut temp = self.stage()?;
        pack::write(&mut temp, &self.pack)?;
        temp.persist(&pack_path)?;
        debug!(entries = self.pack.len(), "flushed pack table");
        Ok(())
    }
}
