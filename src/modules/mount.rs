//! Mount table mutation.
//!
//! [`MountOps`] is the only way the crate touches the live mount table.
//! [`SyscallMounter`] performs the calls with `mount(2)`; the [`Activator`]
//! walks a staged plan produced by the merge engine and makes it visible at
//! the real paths.

use anyhow::{Context, Result};
use log::{debug, error, warn};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::Path;

use super::merge::{Placement, StageAction, StagedNode};
use super::stats::MountReport;

/// Mount operations needed to activate a merged tree.
pub trait MountOps {
    /// Binds `source` (recursively) onto `target`.
    fn bind(&mut self, source: &Path, target: &Path) -> Result<()>;

    /// Moves the mount at `source` to `target`.
    fn move_mount(&mut self, source: &Path, target: &Path) -> Result<()>;

    /// Stops mount events under `target` from propagating.
    fn make_private(&mut self, target: &Path) -> Result<()>;

    /// Remounts the bind mount at `target` read-only.
    fn remount_read_only(&mut self, target: &Path) -> Result<()>;

    /// Mounts a fresh tmpfs at `target`, recording `source` in the mount table.
    fn mount_tmpfs(&mut self, source: &str, target: &Path) -> Result<()>;

    /// Lazily detaches whatever is mounted at `target`.
    fn detach(&mut self, target: &Path) -> Result<()>;
}

/// [`MountOps`] backed by the `mount(2)` family of system calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallMounter;

impl MountOps for SyscallMounter {
    fn bind(&mut self, source: &Path, target: &Path) -> Result<()> {
        debug!("bind {} -> {}", source.display(), target.display());
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_context(|| {
            format!(
                "Failed to bind mount {} -> {}",
                source.display(),
                target.display()
            )
        })
    }

    fn move_mount(&mut self, source: &Path, target: &Path) -> Result<()> {
        debug!("move {} -> {}", source.display(), target.display());
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .with_context(|| {
            format!(
                "Failed to move mount {} -> {}",
                source.display(),
                target.display()
            )
        })
    }

    fn make_private(&mut self, target: &Path) -> Result<()> {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_context(|| format!("Failed to make {} private", target.display()))
    }

    fn remount_read_only(&mut self, target: &Path) -> Result<()> {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .with_context(|| format!("Failed to remount {} as read-only", target.display()))
    }

    fn mount_tmpfs(&mut self, source: &str, target: &Path) -> Result<()> {
        debug!("tmpfs ({}) -> {}", source, target.display());
        mount(
            Some(source),
            target,
            Some("tmpfs"),
            MsFlags::empty(),
            Some("mode=0755"),
        )
        .with_context(|| format!("Failed to mount tmpfs on {}", target.display()))
    }

    fn detach(&mut self, target: &Path) -> Result<()> {
        umount2(target, MntFlags::MNT_DETACH)
            .with_context(|| format!("Failed to unmount {}", target.display()))
    }
}

/// Second phase of a run: turns a staged plan into live mounts.
pub struct Activator<'a, M: MountOps + ?Sized> {
    ops: &'a mut M,
    report: &'a mut MountReport,
}

impl<'a, M: MountOps + ?Sized> Activator<'a, M> {
    pub fn new(ops: &'a mut M, report: &'a mut MountReport) -> Self {
        Self { ops, report }
    }

    /// Activates the plan of one partition.
    ///
    /// Parents are always mounted before anything beneath them. A failing
    /// node is recorded against its owner and its siblings carry on. A
    /// skeleton that cannot be completed is dropped, leaving the real
    /// directory in place.
    pub fn activate(&mut self, root: &StagedNode) {
        self.activate_node(root, Placement::Live);
    }

    /// Returns `false` when a staged node was left unusable, so the
    /// skeleton holding it must not be moved.
    fn activate_node(&mut self, node: &StagedNode, placement: Placement) -> bool {
        match &node.action {
            StageAction::Bind {
                source,
                from_module,
                fallback,
            } => self.activate_bind(node, source, *from_module, fallback.as_deref(), placement),
            StageAction::Symlink => {
                // created in staging during the merge, carried by its parent
                if node.tally {
                    self.report.stats.nodes_mounted += 1;
                }
                true
            }
            StageAction::MergeDir => {
                for child in &node.children {
                    self.activate_node(child, Placement::Live);
                }
                true
            }
            StageAction::StagedDir => self.activate_staged_children(node),
            StageAction::Skeleton if placement == Placement::Staged => self.activate_staged_children(node),
            StageAction::Skeleton => {
                self.activate_skeleton(node);
                true
            }
        }
    }

    fn activate_staged_children(&mut self, node: &StagedNode) -> bool {
        let mut intact = true;
        for child in &node.children {
            intact &= self.activate_node(child, Placement::Staged);
        }
        intact
    }

    fn activate_bind(
        &mut self,
        node: &StagedNode,
        source: &Path,
        from_module: bool,
        fallback: Option<&Path>,
        placement: Placement,
    ) -> bool {
        let target = node.target(placement);
        if let Err(e) = self.ops.bind(source, target) {
            error!("{:#}", e);
            self.fail(node);
            return match fallback {
                Some(real) => match self.ops.bind(real, target) {
                    Ok(()) => {
                        debug!("kept {} at {}", real.display(), node.real_path.display());
                        true
                    }
                    Err(e) => {
                        error!("{:#}", e);
                        false
                    }
                },
                // a live target still shows the real node
                None => placement == Placement::Live,
            };
        }

        if from_module {
            if let Err(e) = self.ops.remount_read_only(target) {
                warn!("{:#}", e);
            }
        }

        if node.tally {
            self.report.stats.nodes_mounted += 1;
        }
        true
    }

    fn activate_skeleton(&mut self, node: &StagedNode) {
        let staged = node.staging_path.as_path();
        let real = node.real_path.as_path();
        debug!("replace {} with {}", real.display(), staged.display());

        if let Err(e) = self.ops.bind(staged, staged) {
            error!("{:#}", e);
            self.fail(node);
            return;
        }

        let mounted = self.report.stats.nodes_mounted;
        if !self.activate_staged_children(node) {
            warn!("{} left unchanged, its rebuilt copy is incomplete", real.display());
            self.discard(staged, mounted);
            return;
        }

        if let Err(e) = self.ops.move_mount(staged, real) {
            error!("{:#}", e);
            self.fail(node);
            self.discard(staged, mounted);
            return;
        }

        if let Err(e) = self.ops.make_private(real) {
            warn!("{:#}", e);
        }
    }

    /// Drops a skeleton that never went live, with the mounts counted inside it.
    fn discard(&mut self, staged: &Path, mounted: usize) {
        self.report.stats.nodes_mounted = mounted;
        if let Err(e) = self.ops.detach(staged) {
            warn!("{:#}", e);
        }
    }

    fn fail(&mut self, node: &StagedNode) {
        if node.tally {
            self.report.record_failure(node.owner.as_deref());
        }
    }
}
