//! In-memory stand-ins for the kernel seams, shared by the unit tests.

use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use super::constants::SELINUX_XATTR;
use super::label::XattrOps;
use super::mount::MountOps;

/// Extended attributes kept in a map instead of on disk.
#[derive(Debug, Default)]
pub struct MemoryXattrs {
    values: RefCell<HashMap<(PathBuf, String), Vec<u8>>>,
    read_only: RefCell<HashSet<PathBuf>>,
}

impl MemoryXattrs {
    pub fn set_label(&self, path: &Path, con: &str) {
        self.values
            .borrow_mut()
            .insert((path.to_path_buf(), SELINUX_XATTR.to_string()), con.as_bytes().to_vec());
    }

    pub fn label(&self, path: &Path) -> Option<String> {
        self.values
            .borrow()
            .get(&(path.to_path_buf(), SELINUX_XATTR.to_string()))
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }

    /// Makes every later write to `path` fail.
    pub fn fail_writes_to(&self, path: &Path) {
        self.read_only.borrow_mut().insert(path.to_path_buf());
    }
}

impl XattrOps for MemoryXattrs {
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .values
            .borrow()
            .get(&(path.to_path_buf(), name.to_string()))
            .cloned())
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        if self.read_only.borrow().contains(path) {
            return Err(io::Error::from_raw_os_error(nix::errno::Errno::EROFS as i32));
        }
        self.values
            .borrow_mut()
            .insert((path.to_path_buf(), name.to_string()), value.to_vec());
        Ok(())
    }
}

/// A mount call captured by [`RecordingMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Bind { source: PathBuf, target: PathBuf },
    Move { source: PathBuf, target: PathBuf },
    Private(PathBuf),
    ReadOnly(PathBuf),
    Tmpfs { source: String, target: PathBuf },
    Detach(PathBuf),
}

/// Records mount calls instead of performing them.
#[derive(Debug, Default)]
pub struct RecordingMounter {
    pub calls: Vec<MountCall>,
    failing: HashSet<PathBuf>,
    failing_sources: HashSet<PathBuf>,
}

impl RecordingMounter {
    /// Makes every later call targeting `path` fail.
    pub fn fail_on(&mut self, path: impl Into<PathBuf>) {
        self.failing.insert(path.into());
    }

    /// Makes every later bind from `source` fail.
    pub fn fail_binds_from(&mut self, source: impl Into<PathBuf>) {
        self.failing_sources.insert(source.into());
    }

    /// Bind calls as `(source, target)` pairs, in call order.
    pub fn binds(&self) -> Vec<(PathBuf, PathBuf)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                MountCall::Bind { source, target } => Some((source.clone(), target.clone())),
                _ => None,
            })
            .collect()
    }

    /// Source bound onto `target`, if any.
    pub fn bound_source(&self, target: &Path) -> Option<PathBuf> {
        self.binds()
            .into_iter()
            .rev()
            .find(|(_, t)| t == target)
            .map(|(source, _)| source)
    }

    /// Position of the first call matching `call`.
    pub fn position(&self, call: &MountCall) -> Option<usize> {
        self.calls.iter().position(|c| c == call)
    }

    fn check(&self, target: &Path) -> Result<()> {
        if self.failing.contains(target) {
            Err(anyhow!("injected mount failure on {}", target.display()))
        } else {
            Ok(())
        }
    }
}

impl MountOps for RecordingMounter {
    fn bind(&mut self, source: &Path, target: &Path) -> Result<()> {
        self.check(target)?;
        if self.failing_sources.contains(source) {
            return Err(anyhow!("injected bind failure from {}", source.display()));
        }
        self.calls.push(MountCall::Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn move_mount(&mut self, source: &Path, target: &Path) -> Result<()> {
        self.check(target)?;
        self.calls.push(MountCall::Move {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn make_private(&mut self, target: &Path) -> Result<()> {
        self.calls.push(MountCall::Private(target.to_path_buf()));
        Ok(())
    }

    fn remount_read_only(&mut self, target: &Path) -> Result<()> {
        self.calls.push(MountCall::ReadOnly(target.to_path_buf()));
        Ok(())
    }

    fn mount_tmpfs(&mut self, source: &str, target: &Path) -> Result<()> {
        self.check(target)?;
        self.calls.push(MountCall::Tmpfs {
            source: source.to_string(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn detach(&mut self, target: &Path) -> Result<()> {
        self.calls.push(MountCall::Detach(target.to_path_buf()));
        Ok(())
    }
}
