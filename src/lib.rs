//! Content-addressed object store layered into a hash-tree file system.
//!
//! ```text
//!     +---------------------------------------+
//!     |        Structure layer: nodes         |
//!     +---------------------------------------+
//!     |         Storage layer: pools          |
//!     +---------------------------------------+
//!     |           Local filesystem            |
//!     +---------------------------------------+
//! ```
//!
//! The storage layer stores and loads blob objects by their hash value.
//! The structure layer builds special blob objects on top of it to
//! describe file-system shape: file metadata and directory-like
//! containers. Because every object is addressed by the hash of its
//! canonical bytes, the whole forms an immutable Merkle DAG that can be
//! walked to resolve paths, serve reads, and snapshot external directory
//! trees.
//!
//! ```
//! use hfs::{Hfs, MemoryPool};
//!
//! let mut fs = Hfs::new(MemoryPool::new());
//! let key = fs.put(&b"hello"[..])?;
//! assert_eq!(fs.get_bytes(&key)?, b"hello");
//! # Ok::<(), hfs::Error>(())
//! ```

pub use self::error::{Error, Result};
pub use self::key::{HashWriter, Hasher, Key, KEY_HEX_LEN, KEY_LEN};
pub use self::node::{Attrs, FileNode, ListNode, MapNode, Node, NodeKind, SetNode};
pub use self::pool::{LocalPool, MemoryPool, Pool, PACK_LIMIT};
pub use self::snapshot::{snapshot, DirAttr, FileAttr, Hashfile, SnapshotOptions};
pub use self::util::Contents;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek};

mod error;
mod key;
mod node;
mod pool;
mod snapshot;
mod util;

/// A value that can be put into the file system, together with its
/// canonical byte form.
///
/// Identical logical content always renders to identical bytes, so it
/// always lands under the same key.
#[derive(Debug)]
pub enum Item<'a> {
    /// Raw bytes, stored verbatim.
    Bytes(&'a [u8]),
    /// Text, encoded as UTF-8.
    Text(&'a str),
    /// Ordered lines; the author's order is significant.
    List(&'a [String]),
    /// Unordered lines, canonicalized in ascending order.
    Set(&'a BTreeSet<String>),
    /// A string mapping, one `<key>: <value>` line per entry in ascending
    /// key order.
    Map(&'a BTreeMap<String, String>),
}

impl<'a> Item<'a> {
    fn to_bytes(&self) -> Cow<'a, [u8]> {
        match *self {
            Item::Bytes(bytes) => Cow::Borrowed(bytes),
            Item::Text(text) => Cow::Borrowed(text.as_bytes()),
            Item::List(items) => {
                let mut out = String::new();
                for item in items {
                    out.push_str(item);
                    out.push('\n');
                }
                Cow::Owned(out.into_bytes())
            }
            Item::Set(items) => {
                let mut out = String::new();
                for item in items {
                    out.push_str(item);
                    out.push('\n');
                }
                Cow::Owned(out.into_bytes())
            }
            Item::Map(entries) => {
                let mut out = String::new();
                for (key, value) in entries {
                    out.push_str(key);
                    out.push_str(": ");
                    out.push_str(value);
                    out.push('\n');
                }
                Cow::Owned(out.into_bytes())
            }
        }
    }
}

impl<'a> From<&'a [u8]> for Item<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Item::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for Item<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        Item::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for Item<'a> {
    fn from(text: &'a str) -> Self {
        Item::Text(text)
    }
}

impl<'a> From<&'a [String]> for Item<'a> {
    fn from(items: &'a [String]) -> Self {
        Item::List(items)
    }
}

impl<'a> From<&'a Vec<String>> for Item<'a> {
    fn from(items: &'a Vec<String>) -> Self {
        Item::List(items)
    }
}

impl<'a> From<&'a BTreeSet<String>> for Item<'a> {
    fn from(items: &'a BTreeSet<String>) -> Self {
        Item::Set(items)
    }
}

impl<'a> From<&'a BTreeMap<String, String>> for Item<'a> {
    fn from(entries: &'a BTreeMap<String, String>) -> Self {
        Item::Map(entries)
    }
}

/// High-level file system façade binding a pool to a root node key.
///
/// This type carries no cache of its own, so several instances over the
/// same pool directory can run side by side.
#[derive(Debug)]
pub struct Hfs<P: Pool = LocalPool> {
    pool: P,
    root: Key,
}

impl<P: Pool> Hfs<P> {
    /// Creates a file system with a detached (all-zero) root.
    pub fn new(pool: P) -> Self {
        Hfs {
            pool,
            root: Key::ZERO,
        }
    }

    /// Creates a file system rooted at the node `root`.
    pub fn with_root(pool: P, root: Key) -> Self {
        Hfs { pool, root }
    }

    /// The current root node key.
    pub fn root(&self) -> Key {
        self.root
    }

    /// Points the file system at a different root node.
    pub fn set_root(&mut self, root: Key) {
        self.root = root;
    }

    /// Puts a value into the pool in its canonical byte form and returns
    /// its key.
    pub fn put<'a, I: Into<Item<'a>>>(&mut self, item: I) -> Result<Key> {
        self.pool.put_bytes(&item.into().to_bytes())
    }

    /// Commits a node, returning its envelope key.
    pub fn put_node(&mut self, node: &mut Node) -> Result<Key> {
        node.commit(self)
    }

    /// Streams a seekable source into the pool.
    pub fn put_seekable<R: Read + Seek>(&mut self, reader: R) -> Result<Key> {
        self.pool.put_seekable(reader)
    }

    /// Streams a non-seekable source into the pool in one fused
    /// hash-and-write pass.
    pub fn put_reader<R: Read>(&mut self, reader: R) -> Result<Key> {
        self.pool.put_reader(reader)
    }

    /// Returns a fresh read stream over an object.
    pub fn get(&self, key: &Key) -> Result<P::Reader> {
        self.pool.get(key)
    }

    /// Reads an object fully into memory.
    pub fn get_bytes(&self, key: &Key) -> Result<Vec<u8>> {
        let mut reader = self.pool.get(key)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Reads an object fully and decodes it as UTF-8 text.
    pub fn get_text(&self, key: &Key) -> Result<String> {
        String::from_utf8(self.get_bytes(key)?)
            .map_err(|_| Error::InvalidStructure(format!("object {} is not valid UTF-8", key)))
    }

    /// Resolves an absolute POSIX path to its node.
    ///
    /// Walks container lookups segment by segment starting from the root
    /// node. Empty segments are no-ops, so `"/"` and `""` both name the
    /// root itself. Returns `Err` if the root is absent or any segment
    /// does not resolve.
    pub fn open(&self, path: &str) -> Result<Node> {
        let mut node = Node::load(self, &self.get_text(&self.root)?)?;
        for part in path.split('/').filter(|part| !part.is_empty()) {
            let child = node.lookup(part)?;
            node = Node::load(self, &self.get_text(&child)?)?;
        }
        Ok(node)
    }

    /// Returns the size of an object in bytes, or 0 if absent.
    pub fn size(&self, key: &Key) -> Result<u64> {
        self.pool.size(key)
    }

    /// Ensures everything put so far is durably stored.
    pub fn flush(&mut self) -> Result<()> {
        self.pool.flush()
    }

    /// Consumes the façade, returning the underlying pool.
    pub fn into_pool(self) -> P {
        self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hfs() -> Hfs<MemoryPool> {
        Hfs::new(MemoryPool::new())
    }

    #[test]
    fn put_renders_canonical_forms() {
        let mut fs = hfs();

        let list = vec!["b".to_string(), "a".to_string()];
        assert_eq!(fs.put(&list).unwrap(), Key::of(b"b\na\n"));

        let set: BTreeSet<String> = list.iter().cloned().collect();
        assert_eq!(fs.put(&set).unwrap(), Key::of(b"a\nb\n"));

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "v".to_string());
        map.insert("a".to_string(), "z".to_string());
        assert_eq!(fs.put(&map).unwrap(), Key::of(b"a: z\nk: v\n"));

        assert_eq!(fs.put("héllo").unwrap(), Key::of("héllo".as_bytes()));
    }

    #[test]
    fn identical_content_identical_key() {
        let mut fs = hfs();
        let first = fs.put(&b"same bytes"[..]).unwrap();
        let second = fs.put("same bytes").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn get_text_rejects_invalid_utf8() {
        let mut fs = hfs();
        let key = fs.put(&[0xff, 0xfe][..]).unwrap();
        assert!(matches!(
            fs.get_text(&key),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn open_on_detached_root_is_not_found() {
        let fs = hfs();
        assert!(matches!(fs.open("/"), Err(Error::NotFound(k)) if k == Key::ZERO));
    }

    #[test]
    fn open_resolves_paths() {
        let mut fs = hfs();

        // A file under a map under the root map.
        let contents = fs.put(&b"data"[..]).unwrap();
        let file = Node::from(FileNode::new(contents)).commit(&mut fs).unwrap();
        let mut inner = BTreeMap::new();
        inner.insert("f".to_string(), file);
        let inner_key = Node::from(MapNode::new(inner)).commit(&mut fs).unwrap();
        let mut root = BTreeMap::new();
        root.insert("d".to_string(), inner_key);
        let root_key = Node::from(MapNode::new(root)).commit(&mut fs).unwrap();
        fs.set_root(root_key);

        assert_eq!(fs.open("/").unwrap().kind(), NodeKind::Map);
        assert_eq!(fs.open("/d").unwrap().kind(), NodeKind::Map);

        let node = fs.open("/d/f").unwrap();
        assert_eq!(node.kind(), NodeKind::File);
        assert_eq!(node.data(), Some(contents));
        assert_eq!(node.size(), 4);
        assert_eq!(node.access(), 0o100666);

        // Empty segments are no-ops.
        assert_eq!(fs.open("//d//f").unwrap().data(), Some(contents));

        assert!(fs.open("/missing").unwrap_err().is_not_found());
        assert!(fs.open("/d/f/deeper").unwrap_err().is_not_found());
    }

    #[test]
    fn open_resolves_list_indices() {
        let mut fs = hfs();

        let mut children = Vec::new();
        for text in ["A", "B", "C"] {
            let blob = fs.put(text).unwrap();
            children.push(Node::from(FileNode::new(blob)).commit(&mut fs).unwrap());
        }
        let list_key = Node::from(ListNode::new(children)).commit(&mut fs).unwrap();
        let mut root = BTreeMap::new();
        root.insert("l".to_string(), list_key);
        let root_key = Node::from(MapNode::new(root)).commit(&mut fs).unwrap();
        fs.set_root(root_key);

        let node = fs.open("/l/1").unwrap();
        assert_eq!(node.data(), Some(Key::of(b"B")));
        assert!(fs.open("/l/3").unwrap_err().is_not_found());
    }

    #[test]
    fn node_round_trip_through_facade() {
        let mut fs = hfs();
        let contents = fs.put(&b"payload"[..]).unwrap();
        let mut node = Node::from(FileNode::new(contents));
        let key = fs.put_node(&mut node).unwrap();

        let loaded = Node::load(&fs, &fs.get_text(&key).unwrap()).unwrap();
        assert_eq!(loaded.data(), Some(contents));
    }
}
