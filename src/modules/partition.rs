//! Partitions taking part in the merge.

use log::{debug, warn};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use super::catalog::Module;
use super::constants::{BUILTIN_PARTITIONS, SYSTEM_PARTITION};
use super::node::Layer;

/// A real partition root and where its merged copy is staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    /// Mount point in the live tree, e.g. `/vendor`
    pub real_path: PathBuf,
    /// Counterpart under the staging root
    pub staging_path: PathBuf,
    /// Directories inside each module merged onto this partition, lowest priority first
    pub module_subdirs: Vec<PathBuf>,
    /// Top-level names this partition leaves to other partitions
    pub excluded: BTreeSet<OsString>,
}

impl Partition {
    /// Module directories contributing to this partition, lowest priority first.
    pub fn layers(&self, modules: &[Module]) -> Vec<Layer> {
        let mut layers = Vec::new();
        for module in modules {
            for subdir in &self.module_subdirs {
                let path = module.path.join(subdir);
                match fs::symlink_metadata(&path) {
                    Ok(metadata) if metadata.is_dir() => layers.push(Layer::new(&module.name, path)),
                    Ok(_) => warn!("{} is not a directory, ignored", path.display()),
                    Err(_) => {}
                }
            }
        }
        layers
    }
}

/// Resolves the partitions present under `root`.
///
/// The built-in partitions come first, followed by `extra` in the given
/// order. Duplicates and malformed names are dropped, and so is every
/// partition whose mount point is not a directory.
pub fn resolve_partitions(root: &Path, staging_root: &Path, extra: &[String]) -> Vec<Partition> {
    let mut names: Vec<String> = Vec::new();
    for name in BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).chain(extra.iter().cloned()) {
        if !is_valid_partition_name(&name) {
            warn!("ignoring partition name {:?}", name);
            continue;
        }
        if !names.contains(&name) {
            names.push(name);
        }
    }

    let system_root = root.join(SYSTEM_PARTITION);
    let mut relocated = BTreeSet::new();
    let mut partitions = Vec::new();

    for name in names {
        let real_path = root.join(&name);
        if !is_real_dir(&real_path) {
            debug!("partition {} not present", real_path.display());
            continue;
        }

        let mut module_subdirs = Vec::new();
        if name != SYSTEM_PARTITION {
            // modules ship separate partitions under system/<name> as well
            let nested = system_root.join(&name);
            let separate = match fs::symlink_metadata(&nested) {
                Ok(metadata) => metadata.file_type().is_symlink(),
                Err(_) => true,
            };
            if separate {
                module_subdirs.push(Path::new(SYSTEM_PARTITION).join(&name));
                relocated.insert(OsString::from(&name));
            }
        }
        module_subdirs.push(PathBuf::from(&name));

        partitions.push(Partition {
            staging_path: staging_root.join(&name),
            name,
            real_path,
            module_subdirs,
            excluded: BTreeSet::new(),
        });
    }

    if let Some(system) = partitions.iter_mut().find(|p| p.name == SYSTEM_PARTITION) {
        system.excluded = relocated;
    }

    partitions
}

/// Splits a comma separated partition list, e.g. `"my_custom, mi_ext"`.
pub fn parse_partition_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_valid_partition_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}
