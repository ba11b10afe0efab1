//! Common utilities for working with I/O.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap::{Mmap, MmapOptions};

// 256 KiB measures fastest on both SSDs and HDDs, and is large enough for
// SIMD-friendly hashing.
const CHUNK_SIZE: usize = 256 * 1024;

/// Copies `reader` into `writer` using a large fixed-size buffer.
pub fn copy_wide<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0;
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                writer.write_all(&buffer[..n])?;
                total += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// A seekable read stream over one object's bytes.
///
/// Every handle seeks independently of any other handle over the same
/// object.
#[derive(Debug)]
pub enum Contents {
    /// Object bytes held in memory.
    Inline(Cursor<Vec<u8>>),
    /// Memory-mapped object file.
    Mapped(Cursor<Mmap>),
    /// Plain file I/O, for objects too large to map.
    File(File),
}

impl Read for Contents {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Contents::Inline(ref mut inner) => inner.read(buf),
            Contents::Mapped(ref mut inner) => inner.read(buf),
            Contents::File(ref mut inner) => inner.read(buf),
        }
    }
}

impl Seek for Contents {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match *self {
            Contents::Inline(ref mut inner) => inner.seek(pos),
            Contents::Mapped(ref mut inner) => inner.seek(pos),
            Contents::File(ref mut inner) => inner.seek(pos),
        }
    }
}

/// Opens the file at `path` with the most efficient strategy for large
/// sequential reads.
pub fn open_reader(path: &Path) -> io::Result<Contents> {
    let mut file = File::open(path)?;
    let metadata = file.metadata()?;

    if metadata.len() < 16 * 1024 {
        // Not worth it to mmap(2) small files. Load into memory instead.
        let mut buf = Vec::with_capacity(metadata.len() as usize);
        file.read_to_end(&mut buf)?;
        Ok(Contents::Inline(Cursor::new(buf)))
    } else if metadata.len() <= isize::MAX as u64 {
        // Prefer memory-mapping files wherever possible for performance.
        let map = unsafe { MmapOptions::new().len(metadata.len() as usize).map(&file)? };
        Ok(Contents::Mapped(Cursor::new(map)))
    } else {
        // Only fall back to regular file I/O if the file is too large to
        // mmap(2).
        Ok(Contents::File(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_wide_copies_everything() {
        let input = vec![7u8; CHUNK_SIZE + 13];
        let mut out = Vec::new();
        let copied = copy_wide(&mut Cursor::new(&input), &mut out).unwrap();
        assert_eq!(copied, input.len() as u64);
        assert_eq!(out, input);
    }
}
