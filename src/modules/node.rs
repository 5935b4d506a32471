//! Candidate sets and conflict resolution for a single path.
//!
//! For every path under a partition the merge engine gathers one
//! [`CandidateSet`]: the kind of the real node (if any) and one
//! [`ModuleEntry`] per module that has content or markers there, lowest
//! priority first. [`CandidateSet::resolve`] then decides what the final view
//! shows at that path. Resolution is pure so the rules can be tested by
//! building candidate sets by hand.

use serde::Serialize;
use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use super::constants::{REPLACE_DIR_FILE_NAME, SKIP_PREFIX, WHITEOUT_OPAQUE, WHITEOUT_PREFIX};
use super::label::{is_opaque, XattrOps};

/// Kind of filesystem node taking part in a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    /// Character device 0:0 shipped by a module to remove a path
    Whiteout,
}

impl NodeKind {
    /// Kind of a module node, `None` for node types modules cannot ship.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let file_type = metadata.file_type();
        if file_type.is_char_device() && metadata.rdev() == 0 {
            Some(NodeKind::Whiteout)
        } else if file_type.is_file() {
            Some(NodeKind::RegularFile)
        } else if file_type.is_dir() {
            Some(NodeKind::Directory)
        } else if file_type.is_symlink() {
            Some(NodeKind::Symlink)
        } else {
            None
        }
    }

    /// Kind of a node on a real partition, without following symlinks.
    ///
    /// Device nodes, sockets and fifos are mounted over like files.
    pub fn probe_real(path: &Path) -> Option<Self> {
        let metadata = fs::symlink_metadata(path).ok()?;
        let file_type = metadata.file_type();
        Some(if file_type.is_dir() {
            NodeKind::Directory
        } else if file_type.is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::RegularFile
        })
    }
}

/// A directory contributed by one module at some path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Name of the owning module
    pub module: String,
    /// Absolute path of the directory inside the module tree
    pub path: PathBuf,
}

impl Layer {
    pub fn new(module: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            module: module.into(),
            path: path.into(),
        }
    }
}

/// What one module provides at one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Name of the owning module
    pub module: String,
    /// Path of the node inside the module tree (may not exist for marker-only entries)
    pub path: PathBuf,
    /// Kind of the shipped node, `None` when the module only ships markers for the path
    pub kind: Option<NodeKind>,
    /// Directory that fully replaces lower content
    pub opaque: bool,
    /// Path must be absent from the final view
    pub remove: bool,
    /// Path must be left out of the merge
    pub skip: bool,
}

impl ModuleEntry {
    /// Inspects `name` inside the module directory `layer`.
    ///
    /// Returns `None` when the module has neither content nor markers for it.
    pub fn probe<X: XattrOps + ?Sized>(attrs: &X, layer: &Layer, name: &OsStr) -> Option<Self> {
        let path = layer.path.join(name);
        let kind = fs::symlink_metadata(&path)
            .ok()
            .and_then(|metadata| NodeKind::from_metadata(&metadata));

        let remove = kind == Some(NodeKind::Whiteout)
            || is_present(&layer.path.join(marker_name(WHITEOUT_PREFIX, name)));
        let skip = is_present(&layer.path.join(marker_name(SKIP_PREFIX, name)));

        if kind.is_none() && !remove && !skip {
            return None;
        }

        let opaque = kind == Some(NodeKind::Directory) && is_opaque(attrs, &path);

        Some(Self {
            module: layer.module.clone(),
            path,
            kind,
            opaque,
            remove,
            skip,
        })
    }
}

/// Whether a node exists at `path`. Markers count even as dangling symlinks.
pub fn is_present(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Name of a per-path marker file, e.g. `.wh.foo` for `foo`.
pub fn marker_name(prefix: &str, name: &OsStr) -> OsString {
    let mut marker = OsString::from(prefix);
    marker.push(name);
    marker
}

/// Maps a directory entry of a module tree to the merged name it speaks for.
///
/// Marker files map to the name they mark; pure directory markers map to `None`.
pub fn merged_name(entry: &OsStr) -> Option<OsString> {
    let bytes = entry.as_bytes();
    if bytes == WHITEOUT_OPAQUE.as_bytes() || bytes == REPLACE_DIR_FILE_NAME.as_bytes() {
        return None;
    }
    for prefix in [WHITEOUT_PREFIX, SKIP_PREFIX] {
        if let Some(target) = bytes.strip_prefix(prefix.as_bytes()) {
            return (!target.is_empty()).then(|| OsStr::from_bytes(target).to_os_string());
        }
    }
    Some(entry.to_os_string())
}

/// Decision for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No module touches the path
    Passthrough,
    /// The top module removes the path
    Hidden { owner: usize },
    /// The top module excludes the path from the merge
    Skipped { owner: usize },
    /// A module file or symlink wins
    Leaf { winner: usize, kind: NodeKind },
    /// A merged directory built from `layers` (ascending priority)
    Directory {
        layers: Vec<usize>,
        /// Whether the real directory still contributes children
        merge_real: bool,
        /// Whether lower layers or the real node were cut off
        opaque: bool,
    },
}

/// Every contributor at one path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    /// Kind of the real node when it takes part in the merge
    pub real: Option<NodeKind>,
    /// Module entries, lowest priority first
    pub entries: Vec<ModuleEntry>,
}

impl CandidateSet {
    /// Gathers the candidates for `name` below the directories in `layers`.
    pub fn collect<X: XattrOps + ?Sized>(
        attrs: &X,
        layers: &[Layer],
        name: &OsStr,
        real: Option<NodeKind>,
    ) -> Self {
        let entries = layers
            .iter()
            .filter_map(|layer| ModuleEntry::probe(attrs, layer, name))
            .collect();
        Self { real, entries }
    }

    /// Highest-priority module entry.
    pub fn top(&self) -> Option<&ModuleEntry> {
        self.entries.last()
    }

    /// Module that owns the outcome at this path.
    pub fn owner(&self) -> Option<&str> {
        self.top().map(|entry| entry.module.as_str())
    }

    /// Applies the override rules: remove, then skip, then the highest-priority content.
    pub fn resolve(&self) -> Resolution {
        let Some(top_index) = self.entries.len().checked_sub(1) else {
            return Resolution::Passthrough;
        };
        let top = &self.entries[top_index];

        if top.remove {
            return Resolution::Hidden { owner: top_index };
        }
        if top.skip {
            return Resolution::Skipped { owner: top_index };
        }

        match top.kind {
            Some(NodeKind::Directory) => self.resolve_directory(),
            Some(kind) => Resolution::Leaf {
                winner: top_index,
                kind,
            },
            None => Resolution::Passthrough,
        }
    }

    fn resolve_directory(&self) -> Resolution {
        let mut layers = Vec::new();
        let mut cut = false;

        for (index, entry) in self.entries.iter().enumerate().rev() {
            if entry.remove {
                cut = true;
                break;
            }
            match entry.kind {
                Some(NodeKind::Directory) => {
                    layers.push(index);
                    if entry.opaque {
                        cut = true;
                        break;
                    }
                }
                // a lower skip marker alone has no say
                None => continue,
                Some(_) => {
                    cut = true;
                    break;
                }
            }
        }

        layers.reverse();
        Resolution::Directory {
            layers,
            merge_real: !cut && self.real == Some(NodeKind::Directory),
            opaque: cut,
        }
    }
}
