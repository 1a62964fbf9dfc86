// Permissions hardening for daemon files and directories

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Set a restrictive umask before any files are created
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

/// Ensure a directory exists with 0700 (or 0770 with group access) permissions
pub fn ensure_directory_with_permissions(path: &Path, group_access: bool) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .context(format!("Failed to create directory {}", path.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if group_access { 0o770 } else { 0o700 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .context(format!("Failed to set permissions on {}", path.display()))?;
        debug!("Set directory permissions to {:o}: {}", mode, path.display());
    }

    Ok(())
}

/// Set Unix socket permissions to 0600 (or 0660 with group access)
pub fn set_socket_permissions(path: &Path, group_access: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if group_access { 0o660 } else { 0o600 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .context(format!("Failed to set permissions on {}", path.display()))?;
        debug!("Set socket permissions to {:o}: {}", mode, path.display());
    }

    Ok(())
}
