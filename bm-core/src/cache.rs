//! Persistent cache for platform documents
//!
//! Aux files are written atomically into the platform's cache directory,
//! readable by root only. Scripts are also executable by root. Documents are
//! redacted before they get here.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use bm_error::{BootmetaError, Result};
use tracing::debug;

use crate::record::AuxFile;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;
const SCRIPT_MODE: u32 = 0o700;

fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| BootmetaError::generic(format!("Failed to create cache directory {}: {}", dir.display(), e)))
}

/// Aux file names must stay inside the cache directory
fn checked_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0');
    if valid {
        Ok(name)
    } else {
        Err(BootmetaError::generic(format!("Refusing to cache file with name '{}'", name)))
    }
}

/// Write one file atomically with owner-only permissions
pub fn write_private(dir: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
    write_with_mode(dir, name, contents, FILE_MODE)
}

fn write_with_mode(dir: &Path, name: &str, contents: &[u8], mode: u32) -> Result<PathBuf> {
    let name = checked_name(name)?;
    ensure_dir(dir)?;

    let path = dir.join(name);
    let temp_path = dir.join(format!(".{}.tmp", name));

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&temp_path)
        .map_err(|e| BootmetaError::generic(format!("Failed to create temp file: {}", e)))?;

    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| BootmetaError::generic(format!("Failed to set permissions: {}", e)))?;

    file.write_all(contents)
        .map_err(|e| BootmetaError::generic(format!("Failed to write to temp file: {}", e)))?;

    file.sync_all()
        .map_err(|e| BootmetaError::generic(format!("Failed to sync temp file: {}", e)))?;

    drop(file);

    fs::rename(&temp_path, &path)
        .map_err(|e| BootmetaError::generic(format!("Failed to rename temp file: {}", e)))?;

    debug!(path = ?path, bytes = contents.len(), "Cached file");
    Ok(path)
}

/// Write every aux file into `dir`, returning the paths written
pub fn write_aux_files(dir: &Path, files: &[AuxFile]) -> Result<Vec<PathBuf>> {
    files
        .iter()
        .map(|file| {
            let mode = if file.executable { SCRIPT_MODE } else { FILE_MODE };
            write_with_mode(dir, &file.name, &file.contents, mode)
        })
        .collect()
}
