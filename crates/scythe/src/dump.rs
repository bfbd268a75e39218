//! Persisting transformed modules for offline inspection

use crate::naming::CanonicalName;
use crate::result::ScytheResult;
use crate::source::resource_path;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Where `name` is written under `dir`; `None` if it would land outside
#[must_use]
pub fn module_path(dir: &Path, name: &CanonicalName) -> Option<PathBuf> {
    resource_path(name).map(|relative| dir.join(relative))
}

/// Write `bytes` to `dir/<canonical>.smod`, creating parent directories
pub fn write_module(dir: &Path, name: &CanonicalName, bytes: &[u8]) -> ScytheResult<PathBuf> {
    let path = module_path(dir, name).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("module name `{name}` does not map below {}", dir.display()),
        )
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, bytes)?;
    Ok(path)
}
