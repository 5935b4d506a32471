//! Security labels and other extended attributes.
//!
//! Everything that reads or writes an extended attribute goes through
//! [`XattrOps`]. [`SystemXattrs`] talks to the kernel; tests use an in-memory
//! implementation so labels and opaque markers can be exercised without
//! SELinux or `CAP_SYS_ADMIN`.

use anyhow::{Context, Result};
use log::debug;
use std::io;
use std::path::Path;

use super::constants::{
    REPLACE_DIR_FILE_NAME, REPLACE_DIR_XATTR, SELINUX_XATTR, WHITEOUT_OPAQUE,
};
use super::node::is_present;

/// Access to extended attributes. Implementations must not follow symlinks.
pub trait XattrOps {
    /// Reads attribute `name`, `Ok(None)` when the node does not carry it.
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// Writes attribute `name` on `path`.
    fn set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()>;
}

/// Extended attributes of the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemXattrs;

impl XattrOps for SystemXattrs {
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        xattr::get(path, name)
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        xattr::set(path, name, value)
    }
}

/// Reads the security label of `path`.
pub fn lgetfilecon<X: XattrOps + ?Sized>(attrs: &X, path: &Path) -> Result<Option<String>> {
    let con = attrs
        .get(path, SELINUX_XATTR)
        .with_context(|| format!("Failed to get SELinux context for {}", path.display()))?;

    Ok(con.map(|raw| {
        // the kernel hands the label back with its trailing NUL
        let raw = raw.strip_suffix(&[0]).unwrap_or(&raw);
        String::from_utf8_lossy(raw).into_owned()
    }))
}

/// Sets the security label of `path` to `con`.
pub fn lsetfilecon<X: XattrOps + ?Sized>(attrs: &X, path: &Path, con: &str) -> Result<()> {
    debug!("file: {}, con: {}", path.display(), con);
    attrs
        .set(path, SELINUX_XATTR, con.as_bytes())
        .with_context(|| format!("Failed to change SELinux context for {}", path.display()))
}

/// Copies the security label of `from` onto `to`.
///
/// Returns the label that was applied, or `None` when `from` has none.
pub fn mirror_label<X: XattrOps + ?Sized>(attrs: &X, from: &Path, to: &Path) -> Result<Option<String>> {
    match lgetfilecon(attrs, from)? {
        Some(con) => {
            lsetfilecon(attrs, to, &con)?;
            Ok(Some(con))
        }
        None => {
            debug!("{} carries no label, {} keeps its own", from.display(), to.display());
            Ok(None)
        }
    }
}

/// Whether a module directory asks to fully replace what lies beneath it.
pub fn is_opaque<X: XattrOps + ?Sized>(attrs: &X, dir: &Path) -> bool {
    if is_present(&dir.join(REPLACE_DIR_FILE_NAME)) || is_present(&dir.join(WHITEOUT_OPAQUE)) {
        return true;
    }

    match attrs.get(dir, REPLACE_DIR_XATTR) {
        Ok(Some(value)) => value.first() == Some(&b'y'),
        Ok(None) => false,
        Err(e) => {
            debug!("cannot read {} on {}: {}", REPLACE_DIR_XATTR, dir.display(), e);
            false
        }
    }
}
