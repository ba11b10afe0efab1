//! Binary serialization format for the packed small-object table.
//!
//! The `_pack` file begins with a magic value and a format version byte,
//! followed by one length-prefixed record per object: a big-endian `u32`
//! key length, the raw key bytes, a big-endian `u32` value length, and the
//! value bytes. Records run until end of file.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::key::{Key, KEY_LEN};

const MAGIC_VALUE: &[u8] = b"hfspack";
const FORMAT_VERSION: u8 = 1;

/// Writes the pack table to `writer`.
pub fn write<W: Write>(mut writer: W, table: &BTreeMap<Key, Vec<u8>>) -> Result<()> {
    writer.write_all(MAGIC_VALUE)?;
    writer.write_all(&[FORMAT_VERSION])?;

    for (key, value) in table {
        writer.write_all(&(KEY_LEN as u32).to_be_bytes())?;
        writer.write_all(key.as_bytes())?;
        writer.write_all(&(value.len() as u32).to_be_bytes())?;
        writer.write_all(value)?;
    }

    writer.flush()?;
    Ok(())
}

/// Reads a pack table produced by [`write`].
///
/// Returns `Err` if the magic value or version does not match, or a record
/// is truncated.
pub fn read<R: Read>(mut reader: R) -> Result<BTreeMap<Key, Vec<u8>>> {
    let mut header = [0u8; MAGIC_VALUE.len() + 1];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::InvalidStructure("not a pool pack file".into()))?;
    match &header[..] {
        [m @ .., FORMAT_VERSION] if m == MAGIC_VALUE => {}
        _ => return Err(Error::InvalidStructure("not a pool pack file".into())),
    }

    let mut table = BTreeMap::new();
    while let Some(key_len) = read_len(&mut reader)? {
        if key_len as usize != KEY_LEN {
            return Err(Error::InvalidStructure(format!(
                "bad pack key length: {}",
                key_len
            )));
        }

        let mut key = [0u8; KEY_LEN];
        read_record(&mut reader, &mut key)?;

        let value_len = read_len(&mut reader)?
            .ok_or_else(|| Error::InvalidStructure("truncated pack record".into()))?;
        let mut value = vec![0u8; value_len as usize];
        read_record(&mut reader, &mut value)?;

        table.insert(Key::from_bytes(key), value);
    }

    Ok(table)
}

/// Reads the next big-endian `u32` length prefix, or `None` at a clean end
/// of file.
fn read_len<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::InvalidStructure("truncated pack record".into())),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

fn read_record<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::InvalidStructure("truncated pack record".into()),
        _ => Error::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_table() -> BTreeMap<Key, Vec<u8>> {
        let mut table = BTreeMap::new();
        for value in [&b"hello"[..], &b""[..], &b"some longer packed value"[..]] {
            table.insert(Key::of(value), value.to_vec());
        }
        table
    }

    #[test]
    fn round_trip() {
        let table = example_table();
        let mut buf = Vec::new();
        write(&mut buf, &table).unwrap();
        assert_eq!(read(&buf[..]).unwrap(), table);
    }

    #[test]
    fn empty_table_round_trip() {
        let mut buf = Vec::new();
        write(&mut buf, &BTreeMap::new()).unwrap();
        assert!(read(&buf[..]).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let result = read(&b"definitely not a pack file"[..]);
        assert!(matches!(result, Err(Error::InvalidStructure(_))));
    }

    #[test]
    fn rejects_truncated_record() {
        let mut buf = Vec::new();
        write(&mut buf, &example_table()).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(read(&buf[..]), Err(Error::InvalidStructure(_))));
    }
}
