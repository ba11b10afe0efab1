//! Archive an on-disk directory tree as map and file nodes.
//!
//! The walker treats symlinks as the objects they point to and skips
//! anything that is neither a directory nor a regular file. File names and
//! file metadata are considered independent of content: by default no
//! attributes are recorded, and every supported attribute must be asked
//! for explicitly.
//!
//! A directory that already carries a `.hfssnapshot` marker file is taken
//! at its word: the recorded key stands in for walking the directory
//! again. Markers can also be left behind after a walk so later runs over
//! an ancestor directory reuse the work.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::node::{Attrs, FileNode, MapNode, Node};
use crate::pool::Pool;
use crate::Hfs;

const HASHFILE_NAME: &str = ".hfssnapshot";

/// Per-file attributes the snapshot walker can record.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FileAttr {
    /// File name without its extension, as `title`.
    Title,
    /// Mark files carrying any execute bit with `exec`.
    Exec,
    /// Last modification time, as `time`.
    Time,
    /// Change time instead of modification time, as `time`.
    Ctime,
    /// POSIX `uid`, `gid`, and octal `access`.
    Mode,
}

impl FromStr for FileAttr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "title" => Ok(FileAttr::Title),
            "exec" => Ok(FileAttr::Exec),
            "time" => Ok(FileAttr::Time),
            "ctime" => Ok(FileAttr::Ctime),
            "mode" => Ok(FileAttr::Mode),
            other => Err(Error::Unsupported(format!("file attribute `{}`", other))),
        }
    }
}

/// Per-directory attributes the snapshot walker can record.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DirAttr {
    /// Directory name, as `title`.
    Title,
    /// Last modification time, as `time`.
    Time,
    /// Change time instead of modification time, as `time`.
    Ctime,
    /// POSIX `uid`, `gid`, and octal `access`.
    Mode,
}

impl FromStr for DirAttr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "title" => Ok(DirAttr::Title),
            "time" => Ok(DirAttr::Time),
            "ctime" => Ok(DirAttr::Ctime),
            "mode" => Ok(DirAttr::Mode),
            other => Err(Error::Unsupported(format!("dir attribute `{}`", other))),
        }
    }
}

/// Where to leave `.hfssnapshot` marker files after committing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Hashfile {
    /// Leave no markers.
    No,
    /// Leave a marker in the snapshot root only.
    Top,
    /// Leave a marker in every walked directory.
    Every,
}

/// Options controlling a snapshot walk.
#[derive(Clone, Debug)]
pub struct SnapshotOptions {
    /// Attributes to record on file nodes.
    pub file_attrs: BTreeSet<FileAttr>,
    /// Attributes to record on directory nodes.
    pub dir_attrs: BTreeSet<DirAttr>,
    /// Honor keys recorded in existing marker files.
    pub use_hashfile: bool,
    /// Treat marker files as ordinary files instead of skipping them.
    pub process_hashfile: bool,
    /// Marker files to leave behind.
    pub leave_hashfile: Hashfile,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        SnapshotOptions {
            file_attrs: BTreeSet::new(),
            dir_attrs: BTreeSet::new(),
            use_hashfile: true,
            process_hashfile: false,
            leave_hashfile: Hashfile::No,
        }
    }
}

/// Snapshots the file or directory at `path` into `fs`, returning the key
/// of the resulting node.
///
/// Returns `Err` if `path` does not exist, is neither a file nor a
/// directory, or the walk encounters an I/O failure.
pub fn snapshot<P: Pool>(fs: &mut Hfs<P>, path: &Path, options: &SnapshotOptions) -> Result<Key> {
    let mut walker = Walker {
        fs,
        options,
        seen: HashMap::new(),
    };
    walker.visit(path, options.leave_hashfile)?.ok_or_else(|| {
        Error::Unsupported(format!("`{}` is not a file or directory", path.display()))
    })
}

// Recursive closures are impossible, hence a struct with methods.
struct Walker<'a, P: Pool> {
    fs: &'a mut Hfs<P>,
    options: &'a SnapshotOptions,
    // Keyed by (device, inode): dedups hard links and repeated subtrees,
    // and catches symlink cycles while a directory is still being walked.
    seen: HashMap<(u64, u64), Option<Key>>,
}

impl<P: Pool> Walker<'_, P> {
    fn visit(&mut self, path: &Path, leave: Hashfile) -> Result<Option<Key>> {
        let metadata = fs::metadata(path)?;
        let inode = (metadata.dev(), metadata.ino());

        match self.seen.get(&inode) {
            Some(Some(key)) => return Ok(Some(*key)),
            Some(None) => {
                return Err(Error::InvalidStructure(format!(
                    "`{}` links back to a directory still being walked",
                    path.display()
                )))
            }
            None => {}
        }

        if metadata.is_file() {
            self.visit_file(path, &metadata, inode).map(Some)
        } else if metadata.is_dir() {
            self.visit_dir(path, &metadata, inode, leave).map(Some)
        } else {
            Ok(None)
        }
    }

    fn visit_file(
        &mut self,
        path: &Path,
        metadata: &fs::Metadata,
        inode: (u64, u64),
    ) -> Result<Key> {
        debug!(path = %path.display(), "snapshot file");

        let mut attrs = Attrs::new();
        for attr in &self.options.file_attrs {
            match attr {
                FileAttr::Title => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        attrs.insert("title".into(), stem.to_string());
                    }
                }
                FileAttr::Exec => {
                    if metadata.mode() & 0o111 != 0 {
                        attrs.insert("exec".into(), "true".into());
                    }
                }
                FileAttr::Time => {
                    attrs.insert(
                        "time".into(),
                        format_time(metadata.mtime(), metadata.mtime_nsec()),
                    );
                }
                FileAttr::Ctime => {
                    attrs.insert(
                        "time".into(),
                        format_time(metadata.ctime(), metadata.ctime_nsec()),
                    );
                }
                FileAttr::Mode => {
                    attrs.insert("uid".into(), metadata.uid().to_string());
                    attrs.insert("gid".into(), metadata.gid().to_string());
                    attrs.insert("access".into(), format!("{:o}", metadata.mode()));
                }
            }
        }

        let contents = self.fs.put_seekable(File::open(path)?)?;
        let key = Node::from(FileNode::with_attrs(contents, attrs)).commit(self.fs)?;
        self.seen.insert(inode, Some(key));
        Ok(key)
    }

    fn visit_dir(
        &mut self,
        path: &Path,
        metadata: &fs::Metadata,
        inode: (u64, u64),
        leave: Hashfile,
    ) -> Result<Key> {
        debug!(path = %path.display(), "snapshot directory");

        if self.options.use_hashfile {
            let marker = path.join(HASHFILE_NAME);
            if marker.is_file() {
                let key: Key = fs::read_to_string(&marker)?.trim().to_lowercase().parse()?;
                self.seen.insert(inode, Some(key));
                return Ok(key);
            }
        }

        self.seen.insert(inode, None);

        let child_leave = match leave {
            Hashfile::Every => Hashfile::Every,
            _ => Hashfile::No,
        };

        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().into_string().map_err(|name| {
                Error::Unsupported(format!(
                    "non-UTF-8 file name `{}`",
                    name.to_string_lossy()
                ))
            })?;
            if name == HASHFILE_NAME && !self.options.process_hashfile {
                continue;
            }
            if let Some(key) = self.visit(&entry.path(), child_leave)? {
                entries.insert(name, key);
            }
        }

        let mut attrs = Attrs::new();
        for attr in &self.options.dir_attrs {
            match attr {
                DirAttr::Title => {
                    if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                        attrs.insert("title".into(), name.to_string());
                    }
                }
                DirAttr::Time => {
                    attrs.insert(
                        "time".into(),
                        format_time(metadata.mtime(), metadata.mtime_nsec()),
                    );
                }
                DirAttr::Ctime => {
                    attrs.insert(
                        "time".into(),
                        format_time(metadata.ctime(), metadata.ctime_nsec()),
                    );
                }
                DirAttr::Mode => {
                    attrs.insert("uid".into(), metadata.uid().to_string());
                    attrs.insert("gid".into(), metadata.gid().to_string());
                    attrs.insert("access".into(), format!("{:o}", metadata.mode()));
                }
            }
        }

        let key = Node::from(MapNode::with_attrs(entries, attrs)).commit(self.fs)?;
        self.fs.flush()?;

        if leave != Hashfile::No {
            fs::write(path.join(HASHFILE_NAME), format!("{}\n", key))?;
        }

        self.seen.insert(inode, Some(key));
        Ok(key)
    }
}

/// Renders seconds plus a 9-digit fractional part, omitted when zero.
fn format_time(secs: i64, nanos: i64) -> String {
    if nanos != 0 {
        format!("{}.{:09}", secs, nanos)
    } else {
        secs.to_string()
    }
}
