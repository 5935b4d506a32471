//! Optional TOML configuration file.
//!
//! ```toml
//! module_dir = "/data/adb/modules"
//! mount_source = "KSU"
//! partitions = ["my_custom", "mi_ext"]   # or "my_custom,mi_ext"
//! debug = false
//! ```

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::partition::parse_partition_list;

/// Values read from the configuration file. Unset keys fall back to built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_dir: Option<PathBuf>,
    /// Staging root; chosen automatically when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "mountsource")]
    pub mount_source: Option<String>,
    /// Partitions merged on top of the built-in ones
    #[serde(deserialize_with = "deserialize_partitions")]
    pub partitions: Vec<String>,
    /// `-` for stdout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub debug: bool,
    /// Process whose mount namespace receives the mounts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_pid: Option<i32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PartitionList {
    List(Vec<String>),
    Joined(String),
}

fn deserialize_partitions<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match PartitionList::deserialize(deserializer)? {
        PartitionList::List(names) => names
            .iter()
            .flat_map(|name| parse_partition_list(name))
            .collect(),
        PartitionList::Joined(joined) => parse_partition_list(&joined),
    })
}

impl Config {
    /// Loads `path`, `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no config file at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
            }
        };

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
            .map(Some)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to toml")
    }
}
