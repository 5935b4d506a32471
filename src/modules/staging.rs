//! Scratch space the merged trees are assembled in.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::sys::statfs::statfs;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::constants::{DEFAULT_TEMP_DIR, STAGING_DIR_NAME, TMPFS_CANDIDATES};
use super::mount::MountOps;

const TMPFS_MAGIC: i64 = 0x0102_1994;

/// Picks a staging root on the first writable tmpfs among the well-known candidates.
///
/// Falls back to [`DEFAULT_TEMP_DIR`] when none qualifies.
pub fn select_staging_root() -> PathBuf {
    for candidate in TMPFS_CANDIDATES {
        let base = Path::new(candidate);
        if is_writable_tmpfs(base) {
            let selected = base.join(STAGING_DIR_NAME);
            info!("staging root selected: {} (from {})", selected.display(), candidate);
            return selected;
        }
    }

    warn!("no writable tmpfs among candidates, using {}", DEFAULT_TEMP_DIR);
    PathBuf::from(DEFAULT_TEMP_DIR)
}

fn is_writable_tmpfs(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    match statfs(dir) {
        Ok(stat) if stat.filesystem_type().0 as i64 == TMPFS_MAGIC => {}
        _ => return false,
    }

    let probe = dir.join(format!(".magic_mount_test{}", Uuid::new_v4().simple()));
    match File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(e) => {
            debug!("{} is not writable: {}", dir.display(), e);
            false
        }
    }
}

/// A private tmpfs mounted for the duration of one run.
#[derive(Debug)]
pub struct StagingRoot {
    path: PathBuf,
}

impl StagingRoot {
    /// Creates `path` and mounts a fresh tmpfs on it with `source` as its mount source.
    pub fn prepare<M: MountOps + ?Sized>(path: &Path, source: &str, ops: &mut M) -> Result<Self> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create staging root {}", path.display()))?;
        ops.mount_tmpfs(source, path)?;
        if let Err(e) = ops.make_private(path) {
            let _ = ops.detach(path);
            return Err(e);
        }

        debug!("staging root ready at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detaches the tmpfs and removes the mount point.
    ///
    /// Skeletons moved out of the staging root stay mounted.
    pub fn release<M: MountOps + ?Sized>(self, ops: &mut M) -> Result<()> {
        ops.detach(&self.path)?;
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("cannot remove {}: {}", self.path.display(), e);
        }
        Ok(())
    }
}
