//! Structure layer: typed nodes over the blob pool.
//!
//! A node is described by its envelope, a canonical mapping blob holding
//! the node's attributes plus two reserved entries: `_data`, the key of the
//! node's payload, and `_node`, the hashed name of the node's type. The
//! node's key is the key of that envelope blob, so identical logical
//! content always commits to the same key regardless of construction
//! order.
//!
//! On commit, every attribute value is itself put into the pool and the
//! envelope records its key; on load, the values are resolved back through
//! the pool into text. Because putting is content addressed, committing a
//! loaded node reproduces the original envelope byte for byte.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::key::{Key, KEY_HEX_LEN};
use crate::pool::Pool;
use crate::{Hfs, Item};

/// Open-ended node metadata: attribute name to attribute value.
pub type Attrs = BTreeMap<String, String>;

const DATA_FIELD: &str = "_data";
const NODE_FIELD: &str = "_node";

static REGISTRY: Lazy<HashMap<String, NodeKind>> = Lazy::new(|| {
    NodeKind::iter()
        .map(|kind| (kind.tag(), kind))
        .collect()
});

/// A list specifying the concrete node types.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum NodeKind {
    /// Regular file contents plus metadata.
    File,
    /// Ordered container; entry order is significant.
    List,
    /// Unordered container of child keys.
    Set,
    /// Named container mapping arbitrary text to child keys.
    Map,
}

impl NodeKind {
    /// Enumerates all variants of `NodeKind`.
    pub fn iter() -> impl Iterator<Item = Self> {
        use std::iter::once;
        once(NodeKind::File)
            .chain(once(NodeKind::List))
            .chain(once(NodeKind::Set))
            .chain(once(NodeKind::Map))
    }

    /// Returns the fixed type name recorded in envelopes.
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::List => "list",
            NodeKind::Set => "set",
            NodeKind::Map => "map",
        }
    }

    /// Returns the envelope tag for this kind: the hex digest of its name.
    pub fn tag(self) -> String {
        Key::of(self.as_str().as_bytes()).to_hex()
    }

    /// Looks up a kind by its hashed envelope tag.
    pub fn from_tag(tag: &str) -> Option<NodeKind> {
        REGISTRY.get(tag).copied()
    }
}

/// A regular file. `_data` is the key of the contents blob.
#[derive(Clone, Debug)]
pub struct FileNode {
    contents: Key,
    attrs: Attrs,
    size: Option<u64>,
}

impl FileNode {
    /// Creates a file node over an already stored contents blob.
    pub fn new(contents: Key) -> Self {
        Self::with_attrs(contents, Attrs::new())
    }

    /// Creates a file node with the given attributes.
    pub fn with_attrs(contents: Key, attrs: Attrs) -> Self {
        FileNode {
            contents,
            attrs,
            size: None,
        }
    }
}

/// An ordered container. The payload is one child key per line, in the
/// order given by the author.
#[derive(Clone, Debug)]
pub struct ListNode {
    children: Vec<Key>,
    attrs: Attrs,
    data: Option<Key>,
    size: Option<u64>,
}

impl ListNode {
    /// Creates a list node over the given children.
    pub fn new(children: Vec<Key>) -> Self {
        Self::with_attrs(children, Attrs::new())
    }

    /// Creates a list node with the given attributes.
    pub fn with_attrs(children: Vec<Key>, attrs: Attrs) -> Self {
        ListNode {
            children,
            attrs,
            data: None,
            size: None,
        }
    }

    /// The child keys in order.
    pub fn children(&self) -> &[Key] {
        &self.children
    }
}

/// An unordered container. The payload is one child key per line in
/// ascending order.
#[derive(Clone, Debug)]
pub struct SetNode {
    children: BTreeSet<Key>,
    attrs: Attrs,
    data: Option<Key>,
    size: Option<u64>,
}

impl SetNode {
    /// Creates a set node over the given children.
    pub fn new(children: BTreeSet<Key>) -> Self {
        Self::with_attrs(children, Attrs::new())
    }

    /// Creates a set node with the given attributes.
    pub fn with_attrs(children: BTreeSet<Key>, attrs: Attrs) -> Self {
        SetNode {
            children,
            attrs,
            data: None,
            size: None,
        }
    }

    /// The child keys in ascending order.
    pub fn children(&self) -> &BTreeSet<Key> {
        &self.children
    }
}

/// A named container. Each name is stored as its own blob; the payload is
/// one `<name key><child key>` line per entry, ascending by name key, so
/// common names deduplicate and the payload stays fixed width.
#[derive(Clone, Debug)]
pub struct MapNode {
    entries: BTreeMap<String, Key>,
    attrs: Attrs,
    data: Option<Key>,
    size: Option<u64>,
}

impl MapNode {
    /// Creates a map node over the given name-to-child entries.
    pub fn new(entries: BTreeMap<String, Key>) -> Self {
        Self::with_attrs(entries, Attrs::new())
    }

    /// Creates a map node with the given attributes.
    pub fn with_attrs(entries: BTreeMap<String, Key>, attrs: Attrs) -> Self {
        MapNode {
            entries,
            attrs,
            data: None,
            size: None,
        }
    }

    /// The entries in ascending name order.
    pub fn entries(&self) -> &BTreeMap<String, Key> {
        &self.entries
    }
}

/// A structural object in the hash-tree file system.
#[derive(Clone, Debug)]
pub enum Node {
    /// Regular file contents plus metadata.
    File(FileNode),
    /// Ordered container.
    List(ListNode),
    /// Unordered container.
    Set(SetNode),
    /// Named container.
    Map(MapNode),
}

impl Node {
    /// Returns the type of this node.
    pub fn kind(&self) -> NodeKind {
        match *self {
            Node::File(_) => NodeKind::File,
            Node::List(_) => NodeKind::List,
            Node::Set(_) => NodeKind::Set,
            Node::Map(_) => NodeKind::Map,
        }
    }

    /// The node's attribute map.
    pub fn attrs(&self) -> &Attrs {
        match *self {
            Node::File(ref n) => &n.attrs,
            Node::List(ref n) => &n.attrs,
            Node::Set(ref n) => &n.attrs,
            Node::Map(ref n) => &n.attrs,
        }
    }

    /// Looks up a single attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs().get(name).map(String::as_str)
    }

    /// The key of the node's payload: file contents for a file, the
    /// canonical listing blob for containers. Containers only know it
    /// after a commit or a load.
    pub fn data(&self) -> Option<Key> {
        match *self {
            Node::File(ref n) => Some(n.contents),
            Node::List(ref n) => n.data,
            Node::Set(ref n) => n.data,
            Node::Map(ref n) => n.data,
        }
    }

    /// The size of the payload in bytes, known after a commit or a load.
    pub fn size(&self) -> u64 {
        let size = match *self {
            Node::File(ref n) => n.size,
            Node::List(ref n) => n.size,
            Node::Set(ref n) => n.size,
            Node::Map(ref n) => n.size,
        };
        size.unwrap_or(0)
    }

    /// The creation time in seconds, from the `time` attribute.
    pub fn time(&self) -> f64 {
        self.attr("time").and_then(|s| s.parse().ok()).unwrap_or(0.0)
    }

    /// The POSIX owner user id, from the `uid` attribute.
    pub fn uid(&self) -> u32 {
        self.attr("uid").and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    /// The POSIX owner group id, from the `gid` attribute.
    pub fn gid(&self) -> u32 {
        self.attr("gid").and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    /// The POSIX file type and mode.
    ///
    /// Files honor an explicit octal `access` attribute, then the `exec`
    /// marker, then default to a plain read-write file. Containers default
    /// to a world-accessible directory.
    pub fn access(&self) -> u32 {
        let explicit = self
            .attr("access")
            .and_then(|s| u32::from_str_radix(s, 8).ok());
        match *self {
            Node::File(ref n) => explicit.unwrap_or(if n.attrs.contains_key("exec") {
                0o100777
            } else {
                0o100666
            }),
            _ => explicit.unwrap_or(0o40777),
        }
    }

    /// The POSIX link count: 1 for files, entries plus `.` and `..` for
    /// containers.
    pub fn nlink(&self) -> u64 {
        match *self {
            Node::File(_) => 1,
            Node::List(ref n) => n.children.len() as u64 + 2,
            Node::Set(ref n) => n.children.len() as u64 + 2,
            Node::Map(ref n) => n.entries.len() as u64 + 2,
        }
    }

    /// The child names visible when listing this node as a directory.
    ///
    /// Lists yield their indices, sets yield the child keys themselves,
    /// maps yield the recovered names. Files have no children.
    pub fn names(&self) -> Vec<String> {
        match *self {
            Node::File(_) => Vec::new(),
            Node::List(ref n) => (0..n.children.len()).map(|i| i.to_string()).collect(),
            Node::Set(ref n) => n.children.iter().map(Key::to_hex).collect(),
            Node::Map(ref n) => n.entries.keys().cloned().collect(),
        }
    }

    /// Resolves a child name to its key.
    ///
    /// List names are decimal indices. Set names already are the child
    /// keys and resolve to themselves. Returns `Err` if the name does not
    /// resolve.
    pub fn lookup(&self, name: &str) -> Result<Key> {
        let found = match *self {
            Node::File(_) => None,
            Node::List(ref n) => name
                .parse::<usize>()
                .ok()
                .and_then(|i| n.children.get(i))
                .copied(),
            Node::Set(_) => name.parse::<Key>().ok(),
            Node::Map(ref n) => n.entries.get(name).copied(),
        };
        found.ok_or_else(|| Error::NoEntry(name.to_string()))
    }

    /// Commits this node into `fs`, returning the envelope key.
    ///
    /// The payload goes in first (committing each map name as its own
    /// blob), then each attribute value, then the envelope itself, so
    /// every key the envelope mentions resolves by the time the envelope
    /// lands.
    pub fn commit<P: Pool>(&mut self, fs: &mut Hfs<P>) -> Result<Key> {
        let data = match *self {
            Node::File(ref n) => n.contents,
            Node::List(ref n) => {
                let lines: Vec<String> = n.children.iter().map(Key::to_hex).collect();
                fs.put(Item::List(&lines))?
            }
            Node::Set(ref n) => {
                let lines: Vec<String> = n.children.iter().map(Key::to_hex).collect();
                fs.put(Item::List(&lines))?
            }
            Node::Map(ref n) => {
                let mut lines = Vec::with_capacity(n.entries.len());
                for (name, child) in &n.entries {
                    let name_key = fs.put(Item::Text(name))?;
                    lines.push(format!("{}{}", name_key.to_hex(), child.to_hex()));
                }
                lines.sort();
                fs.put(Item::List(&lines))?
            }
        };

        let mut envelope = BTreeMap::new();
        for (name, value) in self.attrs() {
            let value_key = fs.put(Item::Text(value))?;
            envelope.insert(name.clone(), value_key.to_hex());
        }
        envelope.insert(NODE_FIELD.to_string(), self.kind().tag());
        envelope.insert(DATA_FIELD.to_string(), data.to_hex());

        let size = fs.size(&data)?;
        self.record_commit(data, size);

        fs.put(Item::Map(&envelope))
    }

    fn record_commit(&mut self, data: Key, size: u64) {
        match *self {
            Node::File(ref mut n) => n.size = Some(size),
            Node::List(ref mut n) => {
                n.data = Some(data);
                n.size = Some(size);
            }
            Node::Set(ref mut n) => {
                n.data = Some(data);
                n.size = Some(size);
            }
            Node::Map(ref mut n) => {
                n.data = Some(data);
                n.size = Some(size);
            }
        }
    }

    /// Reconstructs a node from the text of its envelope blob.
    ///
    /// Dispatches on the `_node` tag through the type registry and fails
    /// closed on anything unknown. Attribute values and map names are
    /// resolved back through the pool.
    pub fn load<P: Pool>(fs: &Hfs<P>, envelope: &str) -> Result<Node> {
        let mut fields = BTreeMap::new();
        for line in envelope.lines() {
            let (name, value) = line.split_once(": ").ok_or_else(|| {
                Error::InvalidStructure(format!("malformed envelope line `{}`", line))
            })?;
            fields.insert(name.to_string(), value.to_string());
        }

        let tag = fields
            .remove(NODE_FIELD)
            .ok_or_else(|| Error::InvalidStructure("envelope missing `_node`".into()))?;
        let kind = NodeKind::from_tag(&tag)
            .ok_or_else(|| Error::InvalidStructure(format!("unknown node tag {}", tag)))?;
        let data: Key = fields
            .remove(DATA_FIELD)
            .ok_or_else(|| Error::InvalidStructure("envelope missing `_data`".into()))?
            .parse()?;

        let mut attrs = Attrs::new();
        for (name, value) in fields {
            let value_key: Key = value.parse()?;
            attrs.insert(name, fs.get_text(&value_key)?);
        }

        let size = Some(fs.size(&data)?);

        Ok(match kind {
            NodeKind::File => Node::File(FileNode {
                contents: data,
                attrs,
                size,
            }),
            NodeKind::List => Node::List(ListNode {
                children: parse_key_lines(&fs.get_text(&data)?)?,
                attrs,
                data: Some(data),
                size,
            }),
            NodeKind::Set => Node::Set(SetNode {
                children: parse_key_lines(&fs.get_text(&data)?)?.into_iter().collect(),
                attrs,
                data: Some(data),
                size,
            }),
            NodeKind::Map => Node::Map(MapNode {
                entries: parse_map_payload(fs, &fs.get_text(&data)?)?,
                attrs,
                data: Some(data),
                size,
            }),
        })
    }
}

impl From<FileNode> for Node {
    fn from(n: FileNode) -> Self {
        Node::File(n)
    }
}

impl From<ListNode> for Node {
    fn from(n: ListNode) -> Self {
        Node::List(n)
    }
}

impl From<SetNode> for Node {
    fn from(n: SetNode) -> Self {
        Node::Set(n)
    }
}

impl From<MapNode> for Node {
    fn from(n: MapNode) -> Self {
        Node::Map(n)
    }
}

fn parse_key_lines(payload: &str) -> Result<Vec<Key>> {
    payload.lines().map(str::parse).collect()
}

fn parse_map_payload<P: Pool>(fs: &Hfs<P>, payload: &str) -> Result<BTreeMap<String, Key>> {
    let mut entries = BTreeMap::new();
    for line in payload.lines() {
        let split = (line.get(..KEY_HEX_LEN), line.get(KEY_HEX_LEN..));
        let (name_hex, child_hex) = match split {
            (Some(name), Some(child)) if child.len() == KEY_HEX_LEN => (name, child),
            _ => {
                return Err(Error::InvalidStructure(format!(
                    "malformed map payload line of {} bytes",
                    line.len()
                )))
            }
        };
        let name_key: Key = name_hex.parse()?;
        let child: Key = child_hex.parse()?;
        // Duplicate name keys resolve to the same name; the last line wins.
        entries.insert(fs.get_text(&name_key)?, child);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;

    fn hfs() -> Hfs<MemoryPool> {
        Hfs::new(MemoryPool::new())
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn reload(fs: &Hfs<MemoryPool>, key: &Key) -> Node {
        Node::load(fs, &fs.get_text(key).unwrap()).unwrap()
    }

    #[test]
    fn registry_knows_all_kinds_and_nothing_else() {
        for kind in NodeKind::iter() {
            assert_eq!(NodeKind::from_tag(&kind.tag()), Some(kind));
        }
        assert_eq!(NodeKind::from_tag(&Key::of(b"dir").to_hex()), None);
    }

    #[test]
    fn file_commit_stores_attr_values_as_blobs() {
        let mut fs = hfs();
        let contents = fs.put(&b"data"[..]).unwrap();
        let mut node = Node::from(FileNode::with_attrs(contents, attrs(&[("title", "t")])));
        let key = node.commit(&mut fs).unwrap();

        let envelope = fs.get_text(&key).unwrap();
        assert!(envelope.contains(&Key::of(b"t").to_hex()));
        assert!(!envelope.contains("title: t\n"));
        assert!(envelope.contains(&format!("_data: {}", contents)));
        assert_eq!(node.size(), 4);
    }

    #[test]
    fn envelope_round_trip_is_hash_stable() {
        let mut fs = hfs();
        let contents = fs.put(&b"data"[..]).unwrap();
        let mut node = Node::from(FileNode::with_attrs(
            contents,
            attrs(&[("title", "t"), ("time", "5.5")]),
        ));
        let committed = node.commit(&mut fs).unwrap();

        let mut loaded = reload(&fs, &committed);
        assert_eq!(loaded.attr("title"), Some("t"));
        assert_eq!(loaded.time(), 5.5);
        assert_eq!(loaded.commit(&mut fs).unwrap(), committed);
    }

    #[test]
    fn map_commits_are_order_independent() {
        let mut fs = hfs();
        let a = fs.put("first child").unwrap();
        let b = fs.put("second child").unwrap();

        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), a);
        forward.insert("b".to_string(), b);
        let mut backward = BTreeMap::new();
        backward.insert("b".to_string(), b);
        backward.insert("a".to_string(), a);

        let first = Node::from(MapNode::new(forward)).commit(&mut fs).unwrap();
        let second = Node::from(MapNode::new(backward)).commit(&mut fs).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn map_round_trip_recovers_names() {
        let mut fs = hfs();
        let child = fs.put("child contents").unwrap();
        let mut entries = BTreeMap::new();
        entries.insert("some file.txt".to_string(), child);
        entries.insert("ünïcödé".to_string(), child);

        let key = Node::from(MapNode::new(entries.clone()))
            .commit(&mut fs)
            .unwrap();
        let mut loaded = reload(&fs, &key);
        match loaded {
            Node::Map(ref n) => assert_eq!(n.entries(), &entries),
            ref other => panic!("expected a map node, got {:?}", other.kind()),
        }
        assert_eq!(loaded.lookup("some file.txt").unwrap(), child);
        assert!(loaded.lookup("missing").unwrap_err().is_not_found());
        assert_eq!(loaded.commit(&mut fs).unwrap(), key);
    }

    #[test]
    fn list_round_trip_keeps_order() {
        let mut fs = hfs();
        let first = fs.put("1").unwrap();
        let second = fs.put("2").unwrap();
        let key = Node::from(ListNode::new(vec![second, first]))
            .commit(&mut fs)
            .unwrap();

        let loaded = reload(&fs, &key);
        assert_eq!(loaded.names(), ["0", "1"]);
        assert_eq!(loaded.lookup("0").unwrap(), second);
        assert_eq!(loaded.lookup("1").unwrap(), first);
        assert!(loaded.lookup("2").unwrap_err().is_not_found());
        assert!(loaded.lookup("one").unwrap_err().is_not_found());
    }

    #[test]
    fn set_lookup_returns_the_name_itself() {
        let mut fs = hfs();
        let member = fs.put("member").unwrap();
        let key = Node::from(SetNode::new([member].into_iter().collect()))
            .commit(&mut fs)
            .unwrap();

        let loaded = reload(&fs, &key);
        assert_eq!(loaded.names(), [member.to_hex()]);
        assert_eq!(loaded.lookup(&member.to_hex()).unwrap(), member);
        assert!(loaded.lookup("not a key").unwrap_err().is_not_found());
    }

    #[test]
    fn empty_containers_have_stable_distinct_keys() {
        let mut fs = hfs();
        let list = Node::from(ListNode::new(Vec::new())).commit(&mut fs).unwrap();
        let set = Node::from(SetNode::new(BTreeSet::new()))
            .commit(&mut fs)
            .unwrap();
        let map = Node::from(MapNode::new(BTreeMap::new()))
            .commit(&mut fs)
            .unwrap();

        assert_ne!(list, set);
        assert_ne!(list, map);
        assert_ne!(set, map);
        let again = Node::from(ListNode::new(Vec::new())).commit(&mut fs).unwrap();
        assert_eq!(list, again);
    }

    #[test]
    fn access_defaults() {
        let mut fs = hfs();
        let contents = fs.put(&b"x"[..]).unwrap();

        let plain = Node::from(FileNode::new(contents));
        assert_eq!(plain.access(), 0o100666);
        assert_eq!(plain.nlink(), 1);

        let exec = Node::from(FileNode::with_attrs(contents, attrs(&[("exec", "true")])));
        assert_eq!(exec.access(), 0o100777);

        let explicit = Node::from(FileNode::with_attrs(contents, attrs(&[("access", "100644")])));
        assert_eq!(explicit.access(), 0o100644);

        let child = fs.put("child").unwrap();
        let mut entries = BTreeMap::new();
        entries.insert("c".to_string(), child);
        let map = Node::from(MapNode::new(entries));
        assert_eq!(map.access(), 0o40777);
        assert_eq!(map.nlink(), 3);
    }

    #[test]
    fn uid_gid_defaults() {
        let mut fs = hfs();
        let contents = fs.put(&b"x"[..]).unwrap();
        let node = Node::from(FileNode::with_attrs(
            contents,
            attrs(&[("uid", "1000"), ("gid", "100")]),
        ));
        assert_eq!(node.uid(), 1000);
        assert_eq!(node.gid(), 100);
        assert_eq!(Node::from(FileNode::new(contents)).uid(), 0);
    }

    #[test]
    fn load_rejects_unknown_tag() {
        let fs = hfs();
        let envelope = format!(
            "_data: {}\n_node: {}\n",
            Key::of(b"payload"),
            Key::of(b"dir")
        );
        assert!(matches!(
            Node::load(&fs, &envelope),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn load_rejects_missing_fields() {
        let fs = hfs();
        let no_node = format!("_data: {}\n", Key::of(b"payload"));
        assert!(matches!(
            Node::load(&fs, &no_node),
            Err(Error::InvalidStructure(_))
        ));

        let no_data = format!("_node: {}\n", NodeKind::File.tag());
        assert!(matches!(
            Node::load(&fs, &no_data),
            Err(Error::InvalidStructure(_))
        ));

        assert!(matches!(
            Node::load(&fs, "not an envelope"),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn load_rejects_short_map_payload_line() {
        let mut fs = hfs();
        let payload = fs.put("deadbeef\n").unwrap();
        let envelope = format!("_data: {}\n_node: {}\n", payload, NodeKind::Map.tag());
        assert!(matches!(
            Node::load(&fs, &envelope),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn duplicate_map_names_last_wins() {
        let mut fs = hfs();
        let name_key = fs.put("name").unwrap();
        let first_child = fs.put("first").unwrap();
        let second_child = fs.put("second").unwrap();

        let payload = format!(
            "{}{}\n{}{}\n",
            name_key.to_hex(),
            first_child.to_hex(),
            name_key.to_hex(),
            second_child.to_hex()
        );
        let payload_key = fs.put(payload.as_str()).unwrap();
        let envelope = format!("_data: {}\n_node: {}\n", payload_key, NodeKind::Map.tag());

        let node = Node::load(&fs, &envelope).unwrap();
        assert_eq!(node.lookup("name").unwrap(), second_child);
    }
}
