//! Privilege checks and mount namespace entry.
//!
//! The merge engine never switches namespaces itself. The binary calls
//! [`enter_mount_namespace`] once, before the run, so every mount the run
//! performs lands in the namespace of the target process (normally init).

use anyhow::{bail, Context, Result};
use log::debug;
use nix::sched::{setns, CloneFlags};
use nix::unistd::geteuid;
use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

/// Fails unless the process runs with an effective uid of 0.
pub fn ensure_root() -> Result<()> {
    if !geteuid().is_root() {
        bail!("magic_mount must run as root");
    }
    Ok(())
}

fn namespace_path(pid: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/mnt", pid))
}

/// Identifier of the mount namespace of `pid`, e.g. `mnt:[4026531841]`.
pub fn mount_namespace_id(pid: i32) -> Result<String> {
    let path = namespace_path(&pid.to_string());
    let link = fs::read_link(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(link.to_string_lossy().into_owned())
}

/// Whether this process already lives in the mount namespace of `pid`.
pub fn same_mount_namespace(pid: i32) -> Result<bool> {
    let own = fs::read_link(namespace_path("self")).context("Failed to read own mount namespace")?;
    Ok(own.to_string_lossy() == mount_namespace_id(pid)?)
}

/// Moves this process into the mount namespace of `pid`.
///
/// # Arguments
/// * `pid` - Process whose mount namespace is joined
///
/// # Errors
/// Returns an error if the namespace cannot be opened or joined
pub fn enter_mount_namespace(pid: i32) -> Result<()> {
    if same_mount_namespace(pid).unwrap_or(false) {
        debug!("already in the mount namespace of pid {}", pid);
        return Ok(());
    }

    let path = namespace_path(&pid.to_string());
    let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    setns(file.as_raw_fd(), CloneFlags::CLONE_NEWNS)
        .with_context(|| format!("Failed to enter mount namespace of pid {}", pid))?;

    debug!("entered mount namespace of pid {}", pid);
    Ok(())
}
