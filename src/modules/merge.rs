//! First phase of a run: merging module trees over a partition.
//!
//! The [`MergeEngine`] walks the union of a partition's real tree and every
//! contributing module directory, depth-first and parent before child, and
//! produces a [`StagedNode`] plan. Directories that only gain overridden
//! files are kept live and their files are bound in place. Directories whose
//! listing changes are rebuilt as a skeleton under the staging root: module
//! content is staged next to mirrors of the surviving real entries, and the
//! [`Activator`](super::mount::Activator) later moves the skeleton over the
//! real directory.
//!
//! Nothing here mounts anything. A node that cannot be staged is counted and
//! attributed to its module, and the walk carries on with its siblings.

use anyhow::{bail, Context, Result};
use log::{debug, error, warn};
use nix::unistd::{chown, Gid, Uid};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use super::catalog::Module;
use super::label::{is_opaque, mirror_label, XattrOps};
use super::node::{merged_name, CandidateSet, Layer, NodeKind, Resolution};
use super::partition::Partition;
use super::stats::MountReport;

/// Where a node ends up when activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Directly on the real path
    Live,
    /// Inside a skeleton under the staging root
    Staged,
}

/// What activation does with a staged node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    /// Bind `source` onto the node's target
    Bind {
        source: PathBuf,
        /// Source is module content rather than a mirrored real node
        from_module: bool,
        /// Real node bound instead when `source` cannot be
        fallback: Option<PathBuf>,
    },
    /// Symlink already created in the skeleton
    Symlink,
    /// Real directory kept in place, children placed on real paths
    MergeDir,
    /// Real directory replaced by its staged copy
    Skeleton,
    /// Directory created inside a skeleton
    StagedDir,
}

/// One node of the merged plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedNode {
    pub real_path: PathBuf,
    pub staging_path: PathBuf,
    /// Module failures at this node are attributed to
    pub owner: Option<String>,
    pub action: StageAction,
    /// Counted at activation, as mounted or as failed. Unset for nodes
    /// already accounted for during the merge.
    pub tally: bool,
    pub children: Vec<StagedNode>,
}

impl StagedNode {
    /// Path the node is mounted on for the given placement.
    pub fn target(&self, placement: Placement) -> &Path {
        match placement {
            Placement::Live => &self.real_path,
            Placement::Staged => &self.staging_path,
        }
    }

    /// Looks up the node planned for `real_path` in this subtree.
    pub fn find(&self, real_path: &Path) -> Option<&StagedNode> {
        if self.real_path == real_path {
            return Some(self);
        }
        if !real_path.starts_with(&self.real_path) {
            return None;
        }
        self.children.iter().find_map(|child| child.find(real_path))
    }
}

struct DirPlan {
    real_path: PathBuf,
    staging_path: PathBuf,
    /// Module directories merged here, lowest priority first
    layers: Vec<Layer>,
    merge_real: bool,
    owner: Option<String>,
}

struct ResolvedChild {
    name: OsString,
    set: CandidateSet,
    resolution: Resolution,
}

impl ResolvedChild {
    /// Whether the parent directory cannot stay live with this child in it.
    fn needs_rebuild(&self) -> bool {
        let real = self.set.real;
        match &self.resolution {
            Resolution::Passthrough | Resolution::Skipped { .. } => false,
            Resolution::Hidden { .. } => real.is_some(),
            Resolution::Leaf {
                kind: NodeKind::Symlink,
                ..
            } => true,
            Resolution::Leaf { .. } => real != Some(NodeKind::RegularFile),
            Resolution::Directory { .. } => real != Some(NodeKind::Directory),
        }
    }
}

/// Builds the staged plan of one partition at a time.
pub struct MergeEngine<'a, X: XattrOps + ?Sized> {
    attrs: &'a X,
    report: &'a mut MountReport,
}

impl<'a, X: XattrOps + ?Sized> MergeEngine<'a, X> {
    pub fn new(attrs: &'a X, report: &'a mut MountReport) -> Self {
        Self { attrs, report }
    }

    /// Merges `modules` over `partition`.
    ///
    /// # Arguments
    /// * `partition` - Partition to merge onto
    /// * `modules` - Participating modules, lowest priority first
    ///
    /// # Returns
    /// * `Some(StagedNode)` - Plan rooted at the partition's mount point
    /// * `None` - No module touches the partition, or its root could not be staged
    pub fn merge(&mut self, partition: &Partition, modules: &[Module]) -> Option<StagedNode> {
        let layers = partition.layers(modules);
        if layers.is_empty() {
            debug!("no module touches {}", partition.real_path.display());
            return None;
        }

        for layer in &layers {
            if is_opaque(self.attrs, &layer.path) {
                warn!(
                    "{}: opaque marker on the root of {} ignored",
                    layer.module, partition.name
                );
            }
        }

        self.report.stats.nodes_total += 1;
        let plan = DirPlan {
            real_path: partition.real_path.clone(),
            staging_path: partition.staging_path.clone(),
            owner: layers.last().map(|layer| layer.module.clone()),
            layers,
            merge_real: true,
        };
        self.stage_dir(plan, Placement::Live, Some(&partition.excluded))
    }

    /// Stages one directory and everything beneath it.
    ///
    /// Returns `None` when the directory cannot be staged, or when a rebuilt
    /// copy would lose a real entry. The directory's own failure is recorded
    /// once, whatever the number of errors behind it.
    fn stage_dir(
        &mut self,
        plan: DirPlan,
        placement: Placement,
        excluded: Option<&BTreeSet<OsString>>,
    ) -> Option<StagedNode> {
        let mut failed = false;
        let resolved: Vec<ResolvedChild> = self
            .child_names(&plan, excluded, &mut failed)
            .into_iter()
            .map(|name| {
                let real = if plan.merge_real {
                    NodeKind::probe_real(&plan.real_path.join(&name))
                } else {
                    None
                };
                let set = CandidateSet::collect(self.attrs, &plan.layers, &name, real);
                let resolution = set.resolve();
                ResolvedChild {
                    name,
                    set,
                    resolution,
                }
            })
            .collect();

        let action = match placement {
            Placement::Staged => StageAction::StagedDir,
            Placement::Live if !plan.merge_real || resolved.iter().any(ResolvedChild::needs_rebuild) => {
                StageAction::Skeleton
            }
            Placement::Live => StageAction::MergeDir,
        };

        if action != StageAction::MergeDir {
            if let Err(e) = self.create_staged_dir(&plan) {
                error!("{:#}", e);
                self.fail_once(&mut failed, plan.owner.as_deref());
                return None;
            }
        }
        if action == StageAction::Skeleton {
            debug!("rebuilding {}", plan.real_path.display());
        }

        let child_placement = match action {
            StageAction::MergeDir => Placement::Live,
            _ => Placement::Staged,
        };

        let mut lost = false;
        let mut touched = BTreeSet::new();
        let mut children = Vec::new();
        for child in resolved {
            if child.resolution != Resolution::Passthrough {
                touched.insert(child.name.clone());
            }
            if let Some(node) = self.stage_child(&plan, child, child_placement, &mut lost) {
                children.push(node);
            }
        }

        if child_placement == Placement::Staged && plan.merge_real {
            lost |= !self.mirror_untouched(&plan, &touched, &mut children, &mut failed);
        }

        if lost {
            error!("{} cannot be rebuilt without losing real entries", plan.real_path.display());
            self.fail_once(&mut failed, plan.owner.as_deref());
            return None;
        }

        Some(StagedNode {
            real_path: plan.real_path,
            staging_path: plan.staging_path,
            owner: plan.owner,
            action,
            tally: !failed,
            children,
        })
    }

    fn fail_once(&mut self, failed: &mut bool, owner: Option<&str>) {
        if !*failed {
            *failed = true;
            self.report.record_failure(owner);
        }
    }

    /// Names the layers of `plan` have entries or markers for.
    fn child_names(
        &mut self,
        plan: &DirPlan,
        excluded: Option<&BTreeSet<OsString>>,
        failed: &mut bool,
    ) -> BTreeSet<OsString> {
        let mut names = BTreeSet::new();
        for layer in &plan.layers {
            let entries = match fs::read_dir(&layer.path) {
                Ok(entries) => entries,
                Err(e) => {
                    error!("{}: cannot read {}: {}", layer.module, layer.path.display(), e);
                    self.fail_once(failed, Some(&layer.module));
                    continue;
                }
            };

            for entry in entries.flatten() {
                let Some(name) = merged_name(&entry.file_name()) else {
                    continue;
                };
                if excluded.map_or(false, |set| set.contains(&name)) {
                    debug!(
                        "{}: {} is merged with its own partition",
                        layer.module,
                        layer.path.join(&name).display()
                    );
                    continue;
                }
                names.insert(name);
            }
        }
        names
    }

    fn stage_child(
        &mut self,
        plan: &DirPlan,
        child: ResolvedChild,
        placement: Placement,
        lost: &mut bool,
    ) -> Option<StagedNode> {
        let real_path = plan.real_path.join(&child.name);
        let staging_path = plan.staging_path.join(&child.name);

        match child.resolution {
            Resolution::Passthrough => None,
            Resolution::Hidden { owner } => {
                self.report.stats.nodes_total += 1;
                self.report.stats.nodes_whiteout += 1;
                debug!("{}: removes {}", child.set.entries[owner].module, real_path.display());
                None
            }
            Resolution::Skipped { owner } => {
                self.report.stats.nodes_total += 1;
                self.report.stats.nodes_skipped += 1;
                let module = child.set.entries[owner].module.clone();
                debug!("{}: skips {}", module, real_path.display());
                self.restore_real(&child.set, Some(module), &real_path, &staging_path, placement, lost)
            }
            Resolution::Leaf { winner, kind } => {
                self.report.stats.nodes_total += 1;
                let entry = &child.set.entries[winner];
                match self.stage_leaf(&entry.module, &entry.path, kind, &real_path, &staging_path, placement) {
                    Ok(node) => Some(node),
                    Err(e) => {
                        error!("{}: {:#}", entry.module, e);
                        self.report.record_failure(Some(&entry.module));
                        let owner = Some(entry.module.clone());
                        self.restore_real(&child.set, owner, &real_path, &staging_path, placement, lost)
                    }
                }
            }
            Resolution::Directory {
                layers,
                merge_real,
                opaque,
            } => {
                self.report.stats.nodes_total += 1;
                let layers: Vec<Layer> = layers
                    .into_iter()
                    .map(|index| {
                        let entry = &child.set.entries[index];
                        Layer::new(entry.module.clone(), entry.path.clone())
                    })
                    .collect();
                if opaque {
                    debug!(
                        "{} replaced by {}",
                        real_path.display(),
                        layers.first().map_or("?", |layer| layer.module.as_str())
                    );
                }

                let owner = child.set.owner().map(str::to_string);
                let plan = DirPlan {
                    real_path: real_path.clone(),
                    staging_path: staging_path.clone(),
                    owner: owner.clone(),
                    layers,
                    merge_real,
                };
                match self.stage_dir(plan, placement, None) {
                    Some(node) => Some(node),
                    None => self.restore_real(&child.set, owner, &real_path, &staging_path, placement, lost),
                }
            }
        }
    }

    /// Puts the real node back into a skeleton in place of content that was not staged.
    ///
    /// The node is already accounted for, so the mirror is neither tallied nor
    /// recorded again. If even the mirror fails the skeleton is `lost`.
    fn restore_real(
        &mut self,
        set: &CandidateSet,
        owner: Option<String>,
        real_path: &Path,
        staging_path: &Path,
        placement: Placement,
        lost: &mut bool,
    ) -> Option<StagedNode> {
        if placement != Placement::Staged || set.real.is_none() {
            return None;
        }

        let restored = discard_staged(staging_path).and_then(|_| self.mirror(real_path, staging_path, owner, false));
        match restored {
            Ok(node) => node,
            Err(e) => {
                error!("mirror {}: {:#}", real_path.display(), e);
                *lost = true;
                None
            }
        }
    }

    fn stage_leaf(
        &self,
        module: &str,
        source: &Path,
        kind: NodeKind,
        real_path: &Path,
        staging_path: &Path,
        placement: Placement,
    ) -> Result<StagedNode> {
        let real = NodeKind::probe_real(real_path);

        let action = match kind {
            NodeKind::Symlink if placement == Placement::Live => {
                bail!("cannot place symlink {} on a live directory", real_path.display())
            }
            NodeKind::Symlink => {
                let label_from = if real.is_some() { real_path } else { source };
                clone_symlink(self.attrs, source, staging_path, label_from)?;
                StageAction::Symlink
            }
            _ => {
                self.prepare_file(source, real_path, real.is_some(), staging_path, placement)?;
                let keeps_real = placement == Placement::Staged && real == Some(NodeKind::RegularFile);
                StageAction::Bind {
                    source: source.to_path_buf(),
                    from_module: true,
                    fallback: keeps_real.then(|| real_path.to_path_buf()),
                }
            }
        };

        Ok(StagedNode {
            real_path: real_path.to_path_buf(),
            staging_path: staging_path.to_path_buf(),
            owner: Some(module.to_string()),
            action,
            tally: true,
            children: Vec::new(),
        })
    }

    fn prepare_file(
        &self,
        source: &Path,
        real_path: &Path,
        real_exists: bool,
        staging_path: &Path,
        placement: Placement,
    ) -> Result<()> {
        if real_exists {
            mirror_label(self.attrs, real_path, source)?;
        }
        if placement == Placement::Staged {
            File::create(staging_path)
                .with_context(|| format!("Failed to create {}", staging_path.display()))?;
        }
        Ok(())
    }

    /// Stages a transparent copy of a real node inside a skeleton.
    ///
    /// Returns `Ok(None)` when there is no real node at `real_path`.
    fn mirror(
        &self,
        real_path: &Path,
        staging_path: &Path,
        owner: Option<String>,
        tally: bool,
    ) -> Result<Option<StagedNode>> {
        let action = match NodeKind::probe_real(real_path) {
            None => return Ok(None),
            Some(NodeKind::Directory) => {
                fs::create_dir(staging_path)
                    .with_context(|| format!("Failed to create {}", staging_path.display()))?;
                clone_attributes(self.attrs, real_path, real_path, staging_path)?;
                StageAction::Bind {
                    source: real_path.to_path_buf(),
                    from_module: false,
                    fallback: None,
                }
            }
            Some(NodeKind::Symlink) => {
                clone_symlink(self.attrs, real_path, staging_path, real_path)?;
                StageAction::Symlink
            }
            Some(_) => {
                File::create(staging_path)
                    .with_context(|| format!("Failed to create {}", staging_path.display()))?;
                StageAction::Bind {
                    source: real_path.to_path_buf(),
                    from_module: false,
                    fallback: None,
                }
            }
        };

        Ok(Some(StagedNode {
            real_path: real_path.to_path_buf(),
            staging_path: staging_path.to_path_buf(),
            owner,
            action,
            tally,
            children: Vec::new(),
        }))
    }

    /// Mirrors the real entries of `plan` no module touched.
    ///
    /// Returns `false` when one of them could not be carried over.
    fn mirror_untouched(
        &mut self,
        plan: &DirPlan,
        touched: &BTreeSet<OsString>,
        children: &mut Vec<StagedNode>,
        failed: &mut bool,
    ) -> bool {
        let entries = match fs::read_dir(&plan.real_path) {
            Ok(entries) => entries,
            Err(e) => {
                error!("cannot read {}: {}", plan.real_path.display(), e);
                self.fail_once(failed, plan.owner.as_deref());
                return false;
            }
        };

        let mut names: Vec<OsString> = entries
            .flatten()
            .map(|entry| entry.file_name())
            .filter(|name| !touched.contains(name))
            .collect();
        names.sort();

        let mut complete = true;
        for name in names {
            self.report.stats.nodes_total += 1;
            let real_path = plan.real_path.join(&name);
            match self.mirror(&real_path, &plan.staging_path.join(&name), plan.owner.clone(), true) {
                Ok(node) => children.extend(node),
                Err(e) => {
                    error!("mirror {}: {:#}", real_path.display(), e);
                    self.report.record_failure(plan.owner.as_deref());
                    complete = false;
                }
            }
        }
        complete
    }

    /// Creates the staging directory of `plan` with the attributes of the node it stands in for.
    fn create_staged_dir(&self, plan: &DirPlan) -> Result<()> {
        fs::create_dir_all(&plan.staging_path)
            .with_context(|| format!("Failed to create {}", plan.staging_path.display()))?;

        let real = plan.real_path.as_path();
        let real_node = NodeKind::probe_real(real);
        let module_dir = plan.layers.last().map_or(real, |layer| layer.path.as_path());

        let mode_from = if real_node == Some(NodeKind::Directory) {
            real
        } else {
            module_dir
        };
        let label_from = if real_node.is_some() { real } else { module_dir };
        clone_attributes(self.attrs, mode_from, label_from, &plan.staging_path)
    }
}

/// Copies mode and ownership of `from` and the label of `label_from` onto `to`.
fn clone_attributes<X: XattrOps + ?Sized>(attrs: &X, from: &Path, label_from: &Path, to: &Path) -> Result<()> {
    let metadata =
        fs::symlink_metadata(from).with_context(|| format!("Failed to stat {}", from.display()))?;
    fs::set_permissions(to, fs::Permissions::from_mode(metadata.mode() & 0o7777))
        .with_context(|| format!("Failed to chmod {}", to.display()))?;
    chown(
        to,
        Some(Uid::from_raw(metadata.uid())),
        Some(Gid::from_raw(metadata.gid())),
    )
    .with_context(|| format!("Failed to chown {}", to.display()))?;
    mirror_label(attrs, label_from, to)?;
    Ok(())
}

fn clone_symlink<X: XattrOps + ?Sized>(attrs: &X, src: &Path, dst: &Path, label_from: &Path) -> Result<()> {
    let target = fs::read_link(src).with_context(|| format!("Failed to read link {}", src.display()))?;
    symlink(&target, dst).with_context(|| format!("Failed to create symlink {}", dst.display()))?;
    mirror_label(attrs, label_from, dst)?;
    debug!("clone symlink {} -> {}", dst.display(), target.display());
    Ok(())
}

/// Removes whatever a failed staging attempt left at `path`.
fn discard_staged(path: &Path) -> Result<()> {
    let removed = match fs::symlink_metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    };
    removed.with_context(|| format!("Failed to clear {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::constants::REPLACE_DIR_FILE_NAME;
    use crate::modules::partition::resolve_partitions;
    use crate::modules::testing::MemoryXattrs;
    use std::os::unix::fs::symlink as make_symlink;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        root: PathBuf,
        modules: PathBuf,
        staging: PathBuf,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let temp_dir = tempfile::tempdir()?;
            let base = temp_dir.path().to_path_buf();
            let fixture = Self {
                root: base.join("root"),
                modules: base.join("modules"),
                staging: base.join("staging"),
                _temp_dir: temp_dir,
            };
            fs::create_dir_all(fixture.root.join("system"))?;
            fs::create_dir_all(&fixture.modules)?;
            fs::create_dir_all(&fixture.staging)?;
            Ok(fixture)
        }

        fn real(&self, rel: &str, content: &str) -> Result<PathBuf> {
            write_file(&self.root.join(rel), content)
        }

        fn module_file(&self, module: &str, rel: &str, content: &str) -> Result<PathBuf> {
            write_file(&self.modules.join(module).join(rel), content)
        }

        fn system(&self) -> Partition {
            Partition {
                name: "system".to_string(),
                real_path: self.root.join("system"),
                staging_path: self.staging.join("system"),
                module_subdirs: vec![PathBuf::from("system")],
                excluded: BTreeSet::new(),
            }
        }

        fn module_list(&self, names: &[&str]) -> Vec<Module> {
            names
                .iter()
                .map(|name| Module::load(name.to_string(), self.modules.join(name)))
                .collect()
        }
    }

    fn write_file(path: &Path, content: &str) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(path.to_path_buf())
    }

    fn child_names(node: &StagedNode) -> Vec<String> {
        let mut names: Vec<String> = node
            .children
            .iter()
            .filter_map(|child| child.real_path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_override_binds_in_place() -> Result<()> {
        let fx = Fixture::new()?;
        let real_tool = fx.real("system/bin/tool", "stock")?;
        fx.module_file("a_mod", "system/bin/tool", "a")?;
        let b_tool = fx.module_file("b_mod", "system/bin/tool", "b")?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod", "b_mod"]))
            .expect("plan");

        assert_eq!(plan.action, StageAction::MergeDir);
        let bin = plan.find(&fx.root.join("system/bin")).expect("bin");
        assert_eq!(bin.action, StageAction::MergeDir);
        let tool = plan.find(&real_tool).expect("tool");
        assert_eq!(
            tool.action,
            StageAction::Bind {
                source: b_tool,
                from_module: true,
                fallback: None
            }
        );
        assert_eq!(tool.owner.as_deref(), Some("b_mod"));
        assert_eq!(report.stats.nodes_total, 3);
        Ok(())
    }

    #[test]
    fn test_new_entry_rebuilds_directory() -> Result<()> {
        let fx = Fixture::new()?;
        fx.real("system/bin/tool", "stock")?;
        make_symlink("tool", fx.root.join("system/bin/alias"))?;
        fx.module_file("a_mod", "system/bin/extra", "new")?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod"]))
            .expect("plan");

        let bin = plan.find(&fx.root.join("system/bin")).expect("bin");
        assert_eq!(bin.action, StageAction::Skeleton);
        assert_eq!(child_names(bin), vec!["alias", "extra", "tool"]);

        let staged_bin = fx.staging.join("system/bin");
        assert!(staged_bin.join("extra").is_file());
        assert!(staged_bin.join("tool").is_file());
        assert_eq!(fs::read_link(staged_bin.join("alias"))?, PathBuf::from("tool"));

        let tool = bin.find(&fx.root.join("system/bin/tool")).expect("tool");
        assert_eq!(
            tool.action,
            StageAction::Bind {
                source: fx.root.join("system/bin/tool"),
                from_module: false,
                fallback: None
            }
        );
        // root, bin, extra plus the two mirrored entries
        assert_eq!(report.stats.nodes_total, 5);
        Ok(())
    }

    #[test]
    fn test_remove_marker_hides_real_file() -> Result<()> {
        let fx = Fixture::new()?;
        fx.real("system/etc/foo.conf", "stock")?;
        fx.real("system/etc/hosts", "127.0.0.1")?;
        fx.module_file("a_mod", "system/etc/foo.conf", "lower")?;
        fx.module_file("z_mod", "system/etc/.wh.foo.conf", "")?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod", "z_mod"]))
            .expect("plan");

        let etc = plan.find(&fx.root.join("system/etc")).expect("etc");
        assert_eq!(etc.action, StageAction::Skeleton);
        assert_eq!(child_names(etc), vec!["hosts"]);
        assert!(!fx.staging.join("system/etc/foo.conf").exists());
        assert_eq!(report.stats.nodes_whiteout, 1);
        Ok(())
    }

    #[test]
    fn test_opaque_directory_drops_lower_content() -> Result<()> {
        let fx = Fixture::new()?;
        fx.real("system/lib/plugins/a.so", "")?;
        fx.real("system/lib/plugins/b.so", "")?;
        fx.module_file("a_mod", "system/lib/plugins/c.so", "")?;
        fx.module_file("m_mod", "system/lib/plugins/d.so", "")?;
        fx.module_file("m_mod", &format!("system/lib/plugins/{}", REPLACE_DIR_FILE_NAME), "")?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod", "m_mod"]))
            .expect("plan");

        let lib = plan.find(&fx.root.join("system/lib")).expect("lib");
        assert_eq!(lib.action, StageAction::MergeDir);
        let plugins = plan.find(&fx.root.join("system/lib/plugins")).expect("plugins");
        assert_eq!(plugins.action, StageAction::Skeleton);
        assert_eq!(child_names(plugins), vec!["d.so"]);
        Ok(())
    }

    #[test]
    fn test_skip_marker_leaves_sibling_alone() -> Result<()> {
        let fx = Fixture::new()?;
        fx.real("system/bin/helper", "stock")?;
        let real_tool = fx.real("system/bin/tool", "stock")?;
        fx.module_file("z_mod", "system/bin/helper", "mod")?;
        fx.module_file("z_mod", "system/bin/.skip.helper", "")?;
        fx.module_file("z_mod", "system/bin/tool", "mod")?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["z_mod"]))
            .expect("plan");

        let bin = plan.find(&fx.root.join("system/bin")).expect("bin");
        assert_eq!(bin.action, StageAction::MergeDir);
        assert_eq!(child_names(bin), vec!["tool"]);
        assert!(plan.find(&real_tool).is_some());
        assert_eq!(report.stats.nodes_skipped, 1);
        Ok(())
    }

    #[test]
    fn test_labels_follow_real_nodes() -> Result<()> {
        let fx = Fixture::new()?;
        let real_conf = fx.real("system/etc/a.conf", "stock")?;
        let module_conf = fx.module_file("a_mod", "system/etc/a.conf", "mod")?;
        let module_new = fx.module_file("a_mod", "system/etc/new.conf", "mod")?;

        let attrs = MemoryXattrs::default();
        attrs.set_label(&fx.root.join("system/etc"), "u:object_r:system_etc_dir:s0");
        attrs.set_label(&real_conf, "u:object_r:system_file:s0");
        attrs.set_label(&module_new, "u:object_r:adb_data_file:s0");

        let mut report = MountReport::new();
        MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod"]))
            .expect("plan");

        assert_eq!(
            attrs.label(&fx.staging.join("system/etc")).as_deref(),
            Some("u:object_r:system_etc_dir:s0")
        );
        assert_eq!(attrs.label(&module_conf).as_deref(), Some("u:object_r:system_file:s0"));
        // no real counterpart, the module keeps its own label
        assert_eq!(attrs.label(&module_new).as_deref(), Some("u:object_r:adb_data_file:s0"));
        Ok(())
    }

    #[test]
    fn test_node_failure_is_isolated() -> Result<()> {
        let fx = Fixture::new()?;
        fx.real("system/etc/a.conf", "stock")?;
        fx.real("system/etc/b.conf", "stock")?;
        let bad = fx.module_file("bad_mod", "system/etc/a.conf", "x")?;
        let good = fx.module_file("good_mod", "system/etc/b.conf", "y")?;

        let attrs = MemoryXattrs::default();
        attrs.set_label(&fx.root.join("system/etc/a.conf"), "u:object_r:system_file:s0");
        attrs.fail_writes_to(&bad);

        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["bad_mod", "good_mod"]))
            .expect("plan");

        assert!(plan.find(&fx.root.join("system/etc/a.conf")).is_none());
        let b = plan.find(&fx.root.join("system/etc/b.conf")).expect("b.conf");
        assert_eq!(
            b.action,
            StageAction::Bind {
                source: good,
                from_module: true,
                fallback: None
            }
        );
        assert_eq!(report.stats.nodes_fail, 1);
        assert_eq!(report.failed_modules, vec!["bad_mod"]);
        assert!(report.is_consistent());
        Ok(())
    }

    #[test]
    fn test_failed_leaf_keeps_real_file_in_skeleton() -> Result<()> {
        let fx = Fixture::new()?;
        let real_conf = fx.real("system/etc/a.conf", "stock")?;
        fx.real("system/etc/hosts", "127.0.0.1")?;
        let bad = fx.module_file("bad_mod", "system/etc/a.conf", "x")?;
        fx.module_file("good_mod", "system/etc/new.conf", "y")?;

        let attrs = MemoryXattrs::default();
        attrs.set_label(&real_conf, "u:object_r:system_file:s0");
        attrs.fail_writes_to(&bad);

        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["bad_mod", "good_mod"]))
            .expect("plan");

        let etc = plan.find(&fx.root.join("system/etc")).expect("etc");
        assert_eq!(etc.action, StageAction::Skeleton);
        assert_eq!(child_names(etc), vec!["a.conf", "hosts", "new.conf"]);

        let conf = etc.find(&real_conf).expect("a.conf");
        assert_eq!(
            conf.action,
            StageAction::Bind {
                source: real_conf.clone(),
                from_module: false,
                fallback: None
            }
        );
        assert!(!conf.tally);
        assert!(fx.staging.join("system/etc/a.conf").is_file());
        assert_eq!(report.stats.nodes_fail, 1);
        assert_eq!(report.failed_modules, vec!["bad_mod"]);
        assert!(report.is_consistent());
        Ok(())
    }

    #[test]
    fn test_staged_override_falls_back_to_real_file() -> Result<()> {
        let fx = Fixture::new()?;
        let real_conf = fx.real("system/etc/a.conf", "stock")?;
        let module_conf = fx.module_file("a_mod", "system/etc/a.conf", "x")?;
        let module_new = fx.module_file("a_mod", "system/etc/new.conf", "y")?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod"]))
            .expect("plan");

        let conf = plan.find(&real_conf).expect("a.conf");
        assert_eq!(
            conf.action,
            StageAction::Bind {
                source: module_conf,
                from_module: true,
                fallback: Some(real_conf.clone())
            }
        );
        // nothing real to fall back to
        let new = plan.find(&fx.root.join("system/etc/new.conf")).expect("new.conf");
        assert_eq!(
            new.action,
            StageAction::Bind {
                source: module_new,
                from_module: true,
                fallback: None
            }
        );
        Ok(())
    }

    #[test]
    fn test_unmirrorable_entry_keeps_directory_live() -> Result<()> {
        let fx = Fixture::new()?;
        fx.real("system/etc/hosts", "127.0.0.1")?;
        fx.module_file("good_mod", "system/etc/new.conf", "y")?;
        // a directory in the way of the mirrored hosts file
        fs::create_dir_all(fx.staging.join("system/etc/hosts"))?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["good_mod"]))
            .expect("plan");

        assert_eq!(plan.action, StageAction::MergeDir);
        assert!(plan.find(&fx.root.join("system/etc")).is_none());
        // the mirror and the directory, once each
        assert_eq!(report.stats.nodes_fail, 2);
        assert_eq!(report.failed_modules, vec!["good_mod"]);
        assert!(report.is_consistent());
        Ok(())
    }

    #[test]
    fn test_module_symlink_replaces_real_file() -> Result<()> {
        let fx = Fixture::new()?;
        let real_conf = fx.real("system/etc/a.conf", "stock")?;
        fx.real("system/etc/hosts", "127.0.0.1")?;
        fs::create_dir_all(fx.modules.join("a_mod/system/etc"))?;
        make_symlink("/vendor/etc/a.conf", fx.modules.join("a_mod/system/etc/a.conf"))?;

        let attrs = MemoryXattrs::default();
        attrs.set_label(&real_conf, "u:object_r:system_file:s0");

        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod"]))
            .expect("plan");

        let etc = plan.find(&fx.root.join("system/etc")).expect("etc");
        assert_eq!(etc.action, StageAction::Skeleton);
        assert_eq!(child_names(etc), vec!["a.conf", "hosts"]);

        let link = etc.find(&real_conf).expect("a.conf");
        assert_eq!(link.action, StageAction::Symlink);
        assert_eq!(link.owner.as_deref(), Some("a_mod"));

        let staged_link = fx.staging.join("system/etc/a.conf");
        assert_eq!(fs::read_link(&staged_link)?, PathBuf::from("/vendor/etc/a.conf"));
        assert_eq!(attrs.label(&staged_link).as_deref(), Some("u:object_r:system_file:s0"));
        Ok(())
    }

    #[test]
    fn test_module_directory_replaces_real_file() -> Result<()> {
        let fx = Fixture::new()?;
        let real_conf = fx.real("system/etc/conf", "stock")?;
        let module_xml = fx.module_file("a_mod", "system/etc/conf/extra.xml", "x")?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report)
            .merge(&fx.system(), &fx.module_list(&["a_mod"]))
            .expect("plan");

        let etc = plan.find(&fx.root.join("system/etc")).expect("etc");
        assert_eq!(etc.action, StageAction::Skeleton);

        let conf = etc.find(&real_conf).expect("conf");
        assert_eq!(conf.action, StageAction::StagedDir);
        assert_eq!(child_names(conf), vec!["extra.xml"]);
        let xml = conf.find(&real_conf.join("extra.xml")).expect("extra.xml");
        assert_eq!(
            xml.action,
            StageAction::Bind {
                source: module_xml,
                from_module: true,
                fallback: None
            }
        );

        assert!(fx.staging.join("system/etc/conf").is_dir());
        assert!(fx.staging.join("system/etc/conf/extra.xml").is_file());
        assert_eq!(report.stats.nodes_fail, 0);
        Ok(())
    }

    #[test]
    fn test_system_subtree_merges_into_separate_partition() -> Result<()> {
        let fx = Fixture::new()?;
        let real_lib = fx.real("vendor/lib/x.so", "stock")?;
        let module_lib = fx.module_file("a_mod", "system/vendor/lib/x.so", "mod")?;
        fx.module_file("a_mod", "system/bin/tool", "mod")?;

        let partitions = resolve_partitions(&fx.root, &fx.staging, &[]);
        let system = partitions.iter().find(|p| p.name == "system").expect("system");
        let vendor = partitions.iter().find(|p| p.name == "vendor").expect("vendor");
        let modules = fx.module_list(&["a_mod"]);

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let mut engine = MergeEngine::new(&attrs, &mut report);
        let system_plan = engine.merge(system, &modules).expect("system plan");
        let vendor_plan = engine.merge(vendor, &modules).expect("vendor plan");

        assert_eq!(child_names(&system_plan), vec!["bin"]);
        assert!(system_plan.find(&fx.root.join("system/vendor")).is_none());

        let lib = vendor_plan.find(&real_lib).expect("x.so");
        assert_eq!(
            lib.action,
            StageAction::Bind {
                source: module_lib,
                from_module: true,
                fallback: None
            }
        );
        assert_eq!(lib.real_path, fx.root.join("vendor/lib/x.so"));
        Ok(())
    }

    #[test]
    fn test_untouched_partition_has_no_plan() -> Result<()> {
        let fx = Fixture::new()?;
        fs::create_dir_all(fx.modules.join("a_mod/vendor"))?;

        let attrs = MemoryXattrs::default();
        let mut report = MountReport::new();
        let plan = MergeEngine::new(&attrs, &mut report).merge(&fx.system(), &fx.module_list(&["a_mod"]));
        assert!(plan.is_none());
        assert_eq!(report.stats.nodes_total, 0);
        Ok(())
    }
}
