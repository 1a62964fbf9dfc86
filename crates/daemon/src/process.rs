// Kube Tunnel Manager - Process Controller Module
// Spawns, tracks, and reaps the external processes backing each tunnel stage

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kube_tunnel_common::{Error, ProcessRole, Result};

use crate::commands::{SpawnSpec, FORWARD_SIGNATURE, RELAY_SIGNATURE};

/// Severity assigned to one line of subprocess output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputClass {
    Error,
    Warning,
    Info,
}

const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "failed",
    "unable to",
    "connection refused",
    "lost connection",
    "an error occurred",
];

const WARNING_KEYWORDS: &[&str] = &["warning"];

/// Classify one output line by keyword match
///
/// Deliberately permissive: an extra reconnect cycle costs little, a stuck
/// tunnel costs a lot.
pub fn classify_line(line: &str) -> OutputClass {
    let lower = line.to_lowercase();
    if ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        OutputClass::Error
    } else if WARNING_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        OutputClass::Warning
    } else {
        OutputClass::Info
    }
}

/// One live external process and its output-drain tasks
struct ProcessRecord {
    child: Child,
    drains: Vec<JoinHandle<()>>,
}

/// Tracks every external process by (tunnel, role)
///
/// All mutation goes through the table mutex, so at most one live record can
/// exist per (tunnel, role): `start` removes and reaps any previous record
/// for the slot before inserting the new one.
#[derive(Clone)]
pub struct ProcessController {
    table: Arc<Mutex<HashMap<(Uuid, ProcessRole), ProcessRecord>>>,
    error_marks: Arc<Mutex<HashMap<Uuid, Instant>>>,
}

impl ProcessController {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            error_marks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the external command for a tunnel stage and begin draining its
    /// combined output
    ///
    /// Returns the OS pid on success. Fails with `Error::Spawn` when the
    /// executable is missing or the OS-level launch fails.
    pub async fn start(&self, id: Uuid, role: ProcessRole, spec: &SpawnSpec) -> Result<u32> {
        // The old process for this slot must die before a new one exists
        self.kill_role(id, role).await;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", spec.program, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn(format!("{}: exited before startup", spec.program)))?;

        info!("Spawned {} process for tunnel {} (pid {}): {}", role, id, pid, spec);

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(self.spawn_drain(id, role, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(self.spawn_drain(id, role, stderr));
        }

        self.table
            .lock()
            .await
            .insert((id, role), ProcessRecord { child, drains });

        Ok(pid)
    }

    /// Drain one output stream line by line, classifying as we go
    fn spawn_drain<R>(&self, id: Uuid, role: ProcessRole, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let error_marks = self.error_marks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match classify_line(&line) {
                    OutputClass::Error => {
                        error!("[{} {}] {}", id, role, line);
                        error_marks.lock().await.insert(id, Instant::now());
                    }
                    OutputClass::Warning => warn!("[{} {}] {}", id, role, line),
                    OutputClass::Info => debug!("[{} {}] {}", id, role, line),
                }
            }
        })
    }

    /// Whether the process for a stage is currently running
    pub async fn is_alive(&self, id: Uuid, role: ProcessRole) -> bool {
        let mut table = self.table.lock().await;
        match table.get_mut(&(id, role)) {
            Some(record) => matches!(record.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate and reap the process for one stage; safe when none is running
    pub async fn kill_role(&self, id: Uuid, role: ProcessRole) {
        let record = self.table.lock().await.remove(&(id, role));
        if let Some(ProcessRecord { mut child, drains }) = record {
            for drain in drains {
                drain.abort();
            }
            if let Err(e) = child.start_kill() {
                debug!("Failed to signal {} process for tunnel {}: {}", role, id, e);
            }
            // Reap so the pid cannot linger as a zombie
            let _ = child.wait().await;
            debug!("Killed {} process for tunnel {}", role, id);
        }
    }

    /// Terminate everything belonging to a tunnel; idempotent
    pub async fn kill(&self, id: Uuid) {
        self.kill_role(id, ProcessRole::Forward).await;
        self.kill_role(id, ProcessRole::Relay).await;
        self.clear_error(id).await;
    }

    /// Whether an error-classified output line was seen within the window
    pub async fn recent_error(&self, id: Uuid, within: Duration) -> bool {
        self.error_marks
            .lock()
            .await
            .get(&id)
            .map(|mark| mark.elapsed() <= within)
            .unwrap_or(false)
    }

    /// Drop the error mark for a tunnel
    pub async fn clear_error(&self, id: Uuid) {
        self.error_marks.lock().await.remove(&id);
    }

    /// Force-terminate every known process, then sweep by command signature
    ///
    /// The signature sweep catches processes orphaned by a previous daemon
    /// instance whose handles were lost.
    pub async fn kill_all(&self) {
        let keys: Vec<(Uuid, ProcessRole)> = self.table.lock().await.keys().copied().collect();
        for (id, role) in keys {
            self.kill_role(id, role).await;
        }
        self.error_marks.lock().await.clear();

        for pattern in [FORWARD_SIGNATURE, RELAY_SIGNATURE] {
            match Command::new("pkill").arg("-f").arg(pattern).status().await {
                // pkill exits 1 when nothing matched; that is not a failure
                Ok(status) => debug!("pkill -f '{}' exited with {}", pattern, status),
                Err(e) => warn!("Failed to run pkill sweep for '{}': {}", pattern, e),
            }
        }
    }
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_spec() -> SpawnSpec {
        SpawnSpec::new("sleep", vec!["30".to_string()])
    }

    #[test]
    fn classify_error_keywords() {
        assert_eq!(classify_line("E1010 an error occurred"), OutputClass::Error);
        assert_eq!(
            classify_line("Unable to connect to the server"),
            OutputClass::Error
        );
        assert_eq!(
            classify_line("dial tcp: Connection Refused"),
            OutputClass::Error
        );
        assert_eq!(classify_line("lost connection to pod"), OutputClass::Error);
        assert_eq!(classify_line("handshake FAILED"), OutputClass::Error);
    }

    #[test]
    fn classify_is_permissive_about_warnings() {
        // "warning" escalates even inside an otherwise informational line
        assert_eq!(
            classify_line("Forwarding from 127.0.0.1 (warning: deprecated flag)"),
            OutputClass::Warning
        );
    }

    #[test]
    fn classify_plain_output_as_info() {
        assert_eq!(
            classify_line("Forwarding from 127.0.0.1:8080 -> 80"),
            OutputClass::Info
        );
        assert_eq!(classify_line("Handling connection for 8080"), OutputClass::Info);
    }

    #[tokio::test]
    async fn start_kill_round_trip() {
        let controller = ProcessController::new();
        let id = Uuid::new_v4();

        controller
            .start(id, ProcessRole::Forward, &sleep_spec())
            .await
            .unwrap();
        assert!(controller.is_alive(id, ProcessRole::Forward).await);
        assert!(!controller.is_alive(id, ProcessRole::Relay).await);

        controller.kill(id).await;
        assert!(!controller.is_alive(id, ProcessRole::Forward).await);

        // Killing again must be a no-op
        controller.kill(id).await;
    }

    #[tokio::test]
    async fn second_start_replaces_first_process() {
        let controller = ProcessController::new();
        let id = Uuid::new_v4();

        let first_pid = controller
            .start(id, ProcessRole::Forward, &sleep_spec())
            .await
            .unwrap();
        let second_pid = controller
            .start(id, ProcessRole::Forward, &sleep_spec())
            .await
            .unwrap();

        assert_ne!(first_pid, second_pid);
        // The first process was reaped before the second was registered
        assert!(!std::path::Path::new(&format!("/proc/{}", first_pid)).exists());
        assert!(controller.is_alive(id, ProcessRole::Forward).await);

        controller.kill(id).await;
    }

    #[tokio::test]
    async fn spawn_failure_is_typed() {
        let controller = ProcessController::new();
        let id = Uuid::new_v4();
        let spec = SpawnSpec::new("kube-tunnel-no-such-binary", vec![]);

        let err = controller
            .start(id, ProcessRole::Forward, &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[tokio::test]
    async fn error_output_marks_tunnel() {
        let controller = ProcessController::new();
        let id = Uuid::new_v4();
        let spec = SpawnSpec::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo 'connection refused' >&2; sleep 30".to_string(),
            ],
        );

        controller.start(id, ProcessRole::Forward, &spec).await.unwrap();

        // Give the drain task a moment to observe the line
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(controller.recent_error(id, Duration::from_secs(10)).await);

        controller.clear_error(id).await;
        assert!(!controller.recent_error(id, Duration::from_secs(10)).await);

        controller.kill(id).await;
    }

    #[tokio::test]
    async fn dead_process_is_not_alive() {
        let controller = ProcessController::new();
        let id = Uuid::new_v4();
        let spec = SpawnSpec::new("true", vec![]);

        controller.start(id, ProcessRole::Forward, &spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!controller.is_alive(id, ProcessRole::Forward).await);

        controller.kill(id).await;
    }
}
