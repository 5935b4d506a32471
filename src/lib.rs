#![doc(html_root_url = "https://docs.rs/magic-mount/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! magic_mount: systemless module overlay for read-only Android partitions
//!
//! Merges the file trees of installed modules over `/system`, `/vendor` and
//! the other partitions using bind mounts only, so the partitions themselves
//! are never modified.
//!
//! ## Features
//!
//! - Ordered module priority (a lexically later module wins a conflict)
//! - Per-path remove and skip markers
//! - Opaque directories that fully replace what lies beneath them
//! - Security labels mirrored from the nodes being replaced
//! - Node-level failures isolated and attributed to their module
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use magic_mount::{MountSession, SessionConfig, SyscallMounter, SystemXattrs};
//! use std::path::PathBuf;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = SessionConfig {
//!     root: PathBuf::from("/"),
//!     module_dir: PathBuf::from("/data/adb/modules"),
//!     staging_root: PathBuf::from("/debug_ramdisk/.magic_mount"),
//!     mount_source: "KSU".to_string(),
//!     extra_partitions: vec!["my_custom".to_string()],
//! };
//!
//! let report = MountSession::new(config, SyscallMounter, SystemXattrs).run()?;
//! println!("{} nodes mounted", report.stats.nodes_mounted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module markers
//!
//! - `disable`, `skip_mount`, `remove` at a module root: the module is not merged
//! - `.wh.<name>` or a 0:0 character device: `<name>` is removed from the view
//! - `.skip.<name>`: `<name>` is left as the partition has it
//! - `.replace`, `.wh..wh..opq` or `trusted.overlay.opaque=y`: the directory is opaque

pub mod modules;

pub use modules::config::Config;
pub use modules::label::SystemXattrs;
pub use modules::mount::SyscallMounter;
pub use modules::session::{MountSession, SessionConfig};

// Re-export commonly used types
pub use modules::stats::{MountReport, MountStats};
