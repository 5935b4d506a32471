//! Discovery of installed modules.
//!
//! Every immediate subdirectory of the module directory is a module. Modules
//! are ordered by name, ascending; the lexically later module wins when two
//! modules ship the same path.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::constants::{DISABLE_FILE_NAME, MODULE_ID_PATTERN, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME};
use super::node::is_present;
use super::stats::MountStats;

/// One installed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Module {
    /// Directory name, also the module id
    pub name: String,
    /// Root of the module tree
    pub path: PathBuf,
    /// `disable` marker present
    pub disabled: bool,
    /// `skip_mount` marker present
    pub skip_mount: bool,
    /// `remove` marker present, the module is waiting to be uninstalled
    pub pending_removal: bool,
    /// Name is a well-formed module id
    pub valid_id: bool,
}

impl Module {
    /// Reads the root markers of the module at `path`.
    pub fn load(name: String, path: PathBuf) -> Self {
        Self {
            disabled: is_present(&path.join(DISABLE_FILE_NAME)),
            skip_mount: is_present(&path.join(SKIP_MOUNT_FILE_NAME)),
            pending_removal: is_present(&path.join(REMOVE_FILE_NAME)),
            valid_id: validate_module_id(&name).is_ok(),
            name,
            path,
        }
    }

    /// Whether the module's tree takes part in the merge.
    pub fn participates(&self) -> bool {
        self.exclusion_reason().is_none()
    }

    /// Why the module is left out of the merge, if it is.
    pub fn exclusion_reason(&self) -> Option<&'static str> {
        if !self.valid_id {
            Some("invalid module id")
        } else if self.disabled {
            Some("disabled")
        } else if self.pending_removal {
            Some("pending removal")
        } else if self.skip_mount {
            Some("skip_mount")
        } else {
            None
        }
    }
}

/// Modules found in a module directory, sorted ascending by name.
#[derive(Debug, Default, Clone)]
pub struct ModuleCatalog {
    modules: Vec<Module>,
}

impl ModuleCatalog {
    /// Scans `module_dir` and counts every module directory in `stats`.
    ///
    /// A missing directory yields an empty catalog. Any other failure to
    /// read it is fatal.
    pub fn scan(module_dir: &Path, stats: &mut MountStats) -> Result<Self> {
        let entries = match fs::read_dir(module_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("module directory {} does not exist", module_dir.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read module directory {}", module_dir.display())
                })
            }
        };

        let mut modules = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("Failed to read module directory {}", module_dir.display()))?;
            let file_type = entry.file_type()?;
            if !file_type.is_dir() {
                debug!("ignoring {}: not a directory", entry.path().display());
                continue;
            }

            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    stats.modules_total += 1;
                    warn!("ignoring module with non UTF-8 name {:?}", raw);
                    continue;
                }
            };

            stats.modules_total += 1;
            let module = Module::load(name, entry.path());
            match module.exclusion_reason() {
                Some(reason) => info!("module {} excluded: {}", module.name, reason),
                None => debug!("module {} enabled", module.name),
            }
            modules.push(module);
        }

        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { modules })
    }

    /// Every module found, excluded ones included.
    pub fn all(&self) -> &[Module] {
        &self.modules
    }

    /// Modules whose trees are merged, lowest priority first.
    pub fn participating(&self) -> Vec<Module> {
        self.modules
            .iter()
            .filter(|m| m.participates())
            .cloned()
            .collect()
    }
}

/// Checks that `module_id` starts with a letter and continues with at least
/// one letter, digit, `.`, `_` or `-`.
pub fn validate_module_id(module_id: &str) -> Result<()> {
    if !module_id_regex()?.is_match(module_id) {
        bail!("Invalid module id '{}'", module_id);
    }
    Ok(())
}

/// Compiled once and shared by every check.
fn module_id_regex() -> Result<&'static Regex> {
    static MODULE_ID: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    MODULE_ID
        .get_or_init(|| Regex::new(MODULE_ID_PATTERN))
        .as_ref()
        .map_err(|e| anyhow!("Invalid module id pattern: {}", e))
}
