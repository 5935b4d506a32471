//! Run-scoped statistics and failure bookkeeping.
//!
//! A [`MountReport`] is created by the session at the start of a run, threaded
//! by `&mut` through the catalog, merge engine and activator, and handed back
//! to the caller once every partition has been processed.

use log::warn;
use serde::{Deserialize, Serialize};

/// Counters collected over one run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountStats {
    /// Module directories examined, enabled or not
    pub modules_total: usize,
    /// Paths visited by the merge engine
    pub nodes_total: usize,
    /// Leaves put in place by the activator
    pub nodes_mounted: usize,
    /// Paths excluded by a skip marker
    pub nodes_skipped: usize,
    /// Paths hidden by a remove marker
    pub nodes_whiteout: usize,
    /// Paths that could not be staged or mounted
    pub nodes_fail: usize,
}

/// Outcome of a run: statistics plus the modules that had at least one failing node.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MountReport {
    pub stats: MountStats,
    /// Names of modules with failures, in the order they first failed.
    pub failed_modules: Vec<String>,
}

impl MountReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one failed node and attributes it to `module` when known.
    pub fn record_failure(&mut self, module: Option<&str>) {
        self.stats.nodes_fail += 1;
        match module {
            Some(name) => {
                if !self.failed_modules.iter().any(|m| m == name) {
                    self.failed_modules.push(name.to_string());
                }
            }
            None => warn!("node failure without an owning module"),
        }
    }

    /// `0` when no node failed, `1` otherwise.
    pub fn status(&self) -> i32 {
        if self.stats.nodes_fail == 0 && self.failed_modules.is_empty() {
            0
        } else {
            1
        }
    }

    /// Whether the counters are internally consistent.
    pub fn is_consistent(&self) -> bool {
        let s = &self.stats;
        s.nodes_mounted + s.nodes_skipped + s.nodes_whiteout + s.nodes_fail <= s.nodes_total
    }
}
