//! One complete magic mount run.
//!
//! A [`MountSession`] owns the run: it scans the module directory, resolves
//! the partition set, prepares the staging root, merges every partition and
//! only then activates the resulting plans. The caller must already be in the
//! target mount namespace.

use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::path::PathBuf;

use super::catalog::ModuleCatalog;
use super::label::XattrOps;
use super::merge::MergeEngine;
use super::mount::{Activator, MountOps};
use super::partition::resolve_partitions;
use super::staging::StagingRoot;
use super::stats::MountReport;

/// Inputs of a run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory partitions are resolved under, `/` outside of tests
    pub root: PathBuf,
    /// Directory whose subdirectories are modules
    pub module_dir: PathBuf,
    /// Writable location the staging tmpfs is mounted on
    pub staging_root: PathBuf,
    /// Source recorded for the staging tmpfs in the mount table
    pub mount_source: String,
    /// Partitions merged in addition to the built-in ones
    pub extra_partitions: Vec<String>,
}

/// A single merge-and-activate run.
pub struct MountSession<M: MountOps, X: XattrOps> {
    config: SessionConfig,
    mounter: M,
    attrs: X,
}

impl<M: MountOps, X: XattrOps> MountSession<M, X> {
    /// Creates a session.
    ///
    /// # Arguments
    /// * `config` - Paths and names the run works with
    /// * `mounter` - Mount table access
    /// * `attrs` - Extended attribute access
    pub fn new(config: SessionConfig, mounter: M, attrs: X) -> Self {
        Self {
            config,
            mounter,
            attrs,
        }
    }

    /// Runs the merge and activation.
    ///
    /// # Returns
    /// * `Ok(MountReport)` - Statistics and failed modules, node failures included
    /// * `Err` - The module directory is unreadable, no partition exists or
    ///   the staging root cannot be mounted
    pub fn run(&mut self) -> Result<MountReport> {
        let mut report = MountReport::new();

        let catalog = ModuleCatalog::scan(&self.config.module_dir, &mut report.stats)?;
        let modules = catalog.participating();

        let partitions = resolve_partitions(
            &self.config.root,
            &self.config.staging_root,
            &self.config.extra_partitions,
        );
        if partitions.is_empty() {
            bail!("no partition found under {}", self.config.root.display());
        }
        debug!(
            "partitions: {}",
            partitions
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if modules.is_empty() {
            info!("no module to mount");
            return Ok(report);
        }
        info!("{} of {} modules enabled", modules.len(), catalog.all().len());

        let staging = StagingRoot::prepare(
            &self.config.staging_root,
            &self.config.mount_source,
            &mut self.mounter,
        )?;

        let mut engine = MergeEngine::new(&self.attrs, &mut report);
        let plans: Vec<_> = partitions
            .iter()
            .filter_map(|partition| engine.merge(partition, &modules))
            .collect();

        let mut activator = Activator::new(&mut self.mounter, &mut report);
        for plan in &plans {
            activator.activate(plan);
        }

        if let Err(e) = staging.release(&mut self.mounter) {
            warn!("{:#}", e);
        }

        Ok(report)
    }

    /// The mounter, for inspecting what a run did.
    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// The attribute store the run read labels from.
    pub fn attrs(&self) -> &X {
        &self.attrs
    }
}
