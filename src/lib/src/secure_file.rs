//! Secure file operations with restrictive permissions
//!
//! Private signing keys are written with mode 0600 (owner read/write only)
//! on Unix so that key material is never briefly world-readable. Reads of
//! sensitive files warn when the on-disk permissions are too permissive.

use crate::error::TrustError;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// The restrictive permission mode for sensitive files (owner read/write only)
#[cfg(unix)]
pub const SECURE_FILE_MODE: u32 = 0o600;

/// Warn if a sensitive file is readable by group or others (Unix only).
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> Result<(), TrustError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)?;
    let perm_bits = metadata.permissions().mode() & 0o777;

    if perm_bits & 0o077 != 0 {
        log::warn!(
            "file '{}' has overly permissive permissions (mode {:o}), \
             key material should have mode 0600",
            path.display(),
            perm_bits,
        );
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(path: &Path) -> Result<(), TrustError> {
    log::debug!(
        "permission check skipped for '{}': not supported on this platform",
        path.display()
    );
    Ok(())
}

#[cfg(unix)]
pub fn set_secure_permissions(path: &Path) -> Result<(), TrustError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(SECURE_FILE_MODE);
    fs::set_permissions(path, perms)?;

    Ok(())
}

#[cfg(not(unix))]
pub fn set_secure_permissions(path: &Path) -> Result<(), TrustError> {
    log::warn!(
        "cannot set restrictive file permissions for '{}' on this platform",
        path.display()
    );
    Ok(())
}

/// Create a file that has mode 0600 before any data is written.
#[cfg(unix)]
pub fn create_secure_file(path: &Path) -> Result<File, TrustError> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(SECURE_FILE_MODE)
        .open(path)?;

    Ok(file)
}

#[cfg(not(unix))]
pub fn create_secure_file(path: &Path) -> Result<File, TrustError> {
    log::warn!(
        "creating file '{}' without restrictive permissions on this platform",
        path.display()
    );

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    Ok(file)
}

/// Write data to a file created with restrictive permissions.
pub fn write_secure(path: &Path, data: &[u8]) -> Result<(), TrustError> {
    let mut file = create_secure_file(path)?;
    file.write_all(data)?;
    file.sync_all()?;

    // The file may have existed before with looser permissions.
    #[cfg(unix)]
    set_secure_permissions(path)?;

    Ok(())
}

/// Read a sensitive file, warning when its permissions are too permissive.
pub fn read_secure(path: &Path) -> Result<Vec<u8>, TrustError> {
    check_permissions(path)?;

    let mut file = File::open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    Ok(contents)
}
