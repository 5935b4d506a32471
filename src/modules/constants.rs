// Default locations
pub const DEFAULT_MODULE_DIR: &str = "/data/adb/modules";
pub const DEFAULT_CONFIG_PATH: &str = "/data/adb/magic_mount/config.toml";
pub const DEFAULT_MOUNT_SOURCE: &str = "KSU";
pub const DEFAULT_TEMP_DIR: &str = "/dev/.magic_mount";
pub const STAGING_DIR_NAME: &str = ".magic_mount";
pub const TMPFS_CANDIDATES: [&str; 3] = ["/mnt/vendor", "/mnt", "/debug_ramdisk"];
pub const NAMESPACE_PID: i32 = 1;

// Module root markers
pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";

/// Well-formed module directory names
pub const MODULE_ID_PATTERN: &str = r"^[a-zA-Z][a-zA-Z0-9._-]+$";

// Per-path markers inside a module tree
pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";
pub const SKIP_PREFIX: &str = ".skip.";
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";

// Extended attributes
pub const SELINUX_XATTR: &str = "security.selinux";
pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";

/// Partitions merged on every run, before any configured extras.
pub const BUILTIN_PARTITIONS: [&str; 6] = ["system", "vendor", "product", "system_ext", "odm", "oem"];

/// The partition every module tree is rooted at.
pub const SYSTEM_PARTITION: &str = "system";
