// Kube Tunnel Manager - PID File Management
// Ensures only one daemon instance runs at a time

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// PID file guard - automatically removes the PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the PID file, failing if another daemon instance is alive
    ///
    /// A PID file left behind by a crashed instance is detected as stale and
    /// replaced.
    pub fn create() -> Result<Self> {
        let path = crate::config::runtime_dir()?.join("daemon.pid");

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(pid_str) => {
                    if let Ok(pid) = pid_str.trim().parse::<u32>() {
                        if Self::is_process_running(pid) {
                            anyhow::bail!(
                                "Daemon is already running with PID {}. \
                                 Stop it first or remove {} if it is stale.",
                                pid,
                                path.display()
                            );
                        }
                        warn!("Removing stale PID file for dead process {}", pid);
                        fs::remove_file(&path).context("Failed to remove stale PID file")?;
                    }
                }
                Err(e) => {
                    warn!("Failed to read PID file {}: {}", path.display(), e);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;

        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self { path })
    }

    /// Check whether a process with the given PID exists
    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        // kill(pid, 0) probes existence without signalling
        unsafe {
            if libc::kill(pid as i32, 0) == 0 {
                return true;
            }
            // EPERM means it exists but belongs to someone else
            *libc::__errno_location() == libc::EPERM
        }
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        warn!("Process existence check not implemented for this platform");
        true
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_rejected() {
        let _guard = PidFileGuard::create().expect("first instance should succeed");

        let result = PidFileGuard::create();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already running"));

        drop(_guard);
        let _guard2 = PidFileGuard::create().expect("should succeed after first is dropped");
    }

    #[test]
    fn current_process_is_running() {
        assert!(PidFileGuard::is_process_running(std::process::id()));
    }

    #[test]
    fn unlikely_pid_is_not_running() {
        assert!(!PidFileGuard::is_process_running(999999));
    }
}
