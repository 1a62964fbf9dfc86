// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Kube Tunnel Manager Contributors

// Kube Tunnel Manager - Connection Supervisor Module
// Owns the per-tunnel state machine and drives the process lifecycle

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use kube_tunnel_common::{
    Error, ProcessRole, Result, StageStatus, TunnelConfig, TunnelStatusResponse,
};

use crate::commands::SpawnPlanner;
use crate::notify::NotificationThrottler;
use crate::probe;
use crate::process::ProcessController;

/// Event sent when tunnel state changes
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Starting { id: Uuid },
    Connected { id: Uuid },
    Disconnected { id: Uuid, reason: String },
    Error { id: Uuid, error: String },
    AllReady,
}

/// ErrorMark age beyond which the monitor ignores it
const ERROR_MARK_WINDOW: Duration = Duration::from_secs(10);

// Settle delays: fixed wait after spawn before liveness is trusted as a sign
// of success. Overridden under test so state machine tests run in milliseconds.
#[cfg(not(test))]
fn forward_settle_delay() -> Duration {
    Duration::from_secs(2)
}

#[cfg(test)]
fn forward_settle_delay() -> Duration {
    Duration::from_millis(50)
}

#[cfg(not(test))]
fn relay_settle_delay() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
fn relay_settle_delay() -> Duration {
    Duration::from_millis(25)
}

#[cfg(not(test))]
fn restart_delay() -> Duration {
    Duration::from_millis(500)
}

#[cfg(test)]
fn restart_delay() -> Duration {
    Duration::from_millis(10)
}

/// Runtime state of one tunnel
pub struct TunnelState {
    pub config: TunnelConfig,
    pub forward_status: StageStatus,
    pub relay_status: StageStatus,
    pub last_error: Option<String>,
    forward_task: Option<JoinHandle<()>>,
    relay_task: Option<JoinHandle<()>>,
}

impl TunnelState {
    fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            forward_status: StageStatus::Disconnected,
            relay_status: StageStatus::Disconnected,
            last_error: None,
            forward_task: None,
            relay_task: None,
        }
    }

    /// True iff the forward stage is up and any configured relay is too
    pub fn fully_connected(&self) -> bool {
        self.forward_status.is_connected()
            && (!self.config.has_relay() || self.relay_status.is_connected())
    }

    fn status_response(&self) -> TunnelStatusResponse {
        TunnelStatusResponse {
            id: self.config.id,
            name: self.config.name.clone(),
            forward_status: self.forward_status,
            relay_status: self.relay_status,
            fully_connected: self.fully_connected(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Manages all tunnels
///
/// Every status mutation goes through the runtime table's write lock, and the
/// monitor skips tunnels with a stage in Connecting, so no two transitions
/// for the same tunnel ever interleave.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    tunnels: Arc<RwLock<HashMap<Uuid, TunnelState>>>,
    processes: ProcessController,
    planner: Arc<dyn SpawnPlanner>,
    notifier: Arc<NotificationThrottler>,
    event_tx: broadcast::Sender<TunnelEvent>,
    killing: Arc<AtomicBool>,
}

impl ConnectionSupervisor {
    pub fn new(planner: Arc<dyn SpawnPlanner>, notifier: Arc<NotificationThrottler>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            processes: ProcessController::new(),
            planner,
            notifier,
            event_tx,
            killing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    pub fn processes(&self) -> &ProcessController {
        &self.processes
    }

    /// While set, the monitor skips reconciliation entirely
    pub fn is_killing(&self) -> bool {
        self.killing.load(Ordering::SeqCst)
    }

    fn set_killing(&self, on: bool) {
        self.killing.store(on, Ordering::SeqCst);
    }

    /// Register a runtime entry for a tunnel
    pub async fn insert(&self, config: TunnelConfig) {
        let mut tunnels = self.tunnels.write().await;
        tunnels
            .entry(config.id)
            .or_insert_with(|| TunnelState::new(config));
    }

    /// Apply an edited configuration
    ///
    /// An active tunnel is halted first so the next start runs a clean
    /// connect cycle under the new settings.
    pub async fn update(&self, config: TunnelConfig) -> Result<()> {
        let id = config.id;
        let was_active = {
            let tunnels = self.tunnels.read().await;
            let state = tunnels
                .get(&id)
                .ok_or_else(|| Error::TunnelNotFound(id.to_string()))?;
            state.forward_status.is_connected()
                || state.relay_status.is_connected()
                || state.forward_status.is_in_progress()
                || state.relay_status.is_in_progress()
        };

        if was_active {
            self.halt(&id, "Configuration changed").await?;
        }

        let mut tunnels = self.tunnels.write().await;
        if let Some(state) = tunnels.get_mut(&id) {
            state.config = config;
        }
        Ok(())
    }

    /// Stop and forget a tunnel
    pub async fn remove(&self, id: &Uuid) -> Result<()> {
        self.halt(id, "Tunnel removed").await?;
        self.tunnels.write().await.remove(id);
        Ok(())
    }

    pub async fn get_status(&self, id: &Uuid) -> Option<TunnelStatusResponse> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(id).map(|state| state.status_response())
    }

    pub async fn get_config(&self, id: &Uuid) -> Option<TunnelConfig> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(id).map(|state| state.config.clone())
    }

    pub async fn list(&self) -> Vec<TunnelStatusResponse> {
        let tunnels = self.tunnels.read().await;
        let mut statuses: Vec<TunnelStatusResponse> =
            tunnels.values().map(|state| state.status_response()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Start the connect sequence for a tunnel
    pub async fn start(&self, id: Uuid) -> Result<()> {
        let config = {
            let mut tunnels = self.tunnels.write().await;
            let state = tunnels
                .get_mut(&id)
                .ok_or_else(|| Error::TunnelNotFound(id.to_string()))?;

            if !state.config.enabled {
                return Err(Error::Config(format!(
                    "Tunnel '{}' is disabled",
                    state.config.name
                )));
            }
            if state.forward_status.is_in_progress() || state.relay_status.is_in_progress() {
                return Err(Error::Runtime(format!(
                    "Tunnel '{}' is already connecting",
                    state.config.name
                )));
            }
            if state.fully_connected() {
                return Err(Error::Runtime(format!(
                    "Tunnel '{}' is already connected",
                    state.config.name
                )));
            }

            if state.config.use_direct_exec {
                // No discrete forward process; the placeholder counts as up
                // and the relay carries the real lifecycle
                state.forward_status = StageStatus::Connected;
                state.relay_status = StageStatus::Connecting;
            } else {
                state.forward_status = StageStatus::Connecting;
                state.relay_status = StageStatus::Disconnected;
            }
            state.last_error = None;
            state.config.clone()
        };

        info!("Starting tunnel: {} ({})", config.name, id);
        let _ = self.event_tx.send(TunnelEvent::Starting { id });

        if config.use_direct_exec {
            self.spawn_relay_task(id, config).await;
        } else {
            self.spawn_forward_task(id, config).await;
        }

        Ok(())
    }

    /// Stop a tunnel; idempotent terminal reset
    pub async fn stop(&self, id: &Uuid) -> Result<()> {
        self.halt(id, "Stopped by user").await
    }

    /// User- or config-triggered restart with a settle pause between the halves
    pub async fn restart(&self, id: Uuid) -> Result<()> {
        self.halt(&id, "Restarting").await?;
        tokio::time::sleep(restart_delay()).await;
        self.start(id).await
    }

    /// Stop everything and sweep for orphaned processes
    pub async fn stop_all(&self) {
        self.set_killing(true);

        let ids: Vec<Uuid> = self.tunnels.read().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.halt(&id, "Shutting down").await {
                warn!("Failed to stop tunnel {} during shutdown: {}", id, e);
            }
        }
        self.processes.kill_all().await;

        self.set_killing(false);
    }

    /// Cancel the role tasks, kill the processes, reset both stages
    async fn halt(&self, id: &Uuid, reason: &str) -> Result<()> {
        let (name, forward_task, relay_task, was_connected) = {
            let mut tunnels = self.tunnels.write().await;
            let state = tunnels
                .get_mut(id)
                .ok_or_else(|| Error::TunnelNotFound(id.to_string()))?;

            let was_connected =
                state.forward_status.is_connected() || state.relay_status.is_connected();
            state.forward_status = StageStatus::Disconnected;
            state.relay_status = StageStatus::Disconnected;
            (
                state.config.name.clone(),
                state.forward_task.take(),
                state.relay_task.take(),
                was_connected,
            )
        };

        // Tasks first, then processes: a cancelled task cannot respawn
        if let Some(task) = forward_task {
            task.abort();
        }
        if let Some(task) = relay_task {
            task.abort();
        }
        self.processes.kill(*id).await;

        if was_connected {
            let _ = self.event_tx.send(TunnelEvent::Disconnected {
                id: *id,
                reason: reason.to_string(),
            });
        }
        info!("Stopped tunnel: {}", name);
        Ok(())
    }

    async fn spawn_forward_task(&self, id: Uuid, config: TunnelConfig) {
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            supervisor.run_forward_stage(id, config).await;
        });
        if let Some(state) = self.tunnels.write().await.get_mut(&id) {
            state.forward_task = Some(handle);
        }
    }

    async fn spawn_relay_task(&self, id: Uuid, config: TunnelConfig) {
        {
            let mut tunnels = self.tunnels.write().await;
            if let Some(state) = tunnels.get_mut(&id) {
                state.relay_status = StageStatus::Connecting;
            }
        }
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            supervisor.run_relay_stage(id, config).await;
        });
        if let Some(state) = self.tunnels.write().await.get_mut(&id) {
            state.relay_task = Some(handle);
        }
    }

    /// Connect sequence for the forward stage: spawn, settle, verify, then
    /// chain the relay if one is configured
    async fn run_forward_stage(&self, id: Uuid, config: TunnelConfig) {
        let Some(spec) = self.planner.forward_spec(&config) else {
            return;
        };

        if let Err(e) = self.processes.start(id, ProcessRole::Forward, &spec).await {
            self.fail_stage(id, ProcessRole::Forward, &e.to_string()).await;
            return;
        }

        tokio::time::sleep(forward_settle_delay()).await;

        if !self.processes.is_alive(id, ProcessRole::Forward).await {
            self.fail_stage(id, ProcessRole::Forward, "forward process exited while settling")
                .await;
            return;
        }

        self.finish_stage(id, ProcessRole::Forward).await;

        if config.has_relay() {
            self.spawn_relay_task(id, config).await;
        }
    }

    /// Connect sequence for the relay stage
    async fn run_relay_stage(&self, id: Uuid, config: TunnelConfig) {
        let Some(spec) = self.planner.relay_spec(&config) else {
            return;
        };

        if let Err(e) = self.processes.start(id, ProcessRole::Relay, &spec).await {
            self.fail_stage(id, ProcessRole::Relay, &e.to_string()).await;
            return;
        }

        tokio::time::sleep(relay_settle_delay()).await;

        if !self.processes.is_alive(id, ProcessRole::Relay).await {
            self.fail_stage(id, ProcessRole::Relay, "relay process exited while settling")
                .await;
            return;
        }

        self.finish_stage(id, ProcessRole::Relay).await;
    }

    /// Mark a stage Connected and fire the tunnel-level side effects once the
    /// whole chain is up
    async fn finish_stage(&self, id: Uuid, role: ProcessRole) {
        let outcome = {
            let mut tunnels = self.tunnels.write().await;
            match tunnels.get_mut(&id) {
                Some(state) => {
                    match role {
                        ProcessRole::Forward => state.forward_status = StageStatus::Connected,
                        ProcessRole::Relay => state.relay_status = StageStatus::Connected,
                    }
                    Some((state.config.name.clone(), state.fully_connected()))
                }
                None => None,
            }
        };

        let Some((name, fully_connected)) = outcome else {
            return;
        };

        if fully_connected {
            info!("Tunnel connected: {}", name);
            let _ = self.event_tx.send(TunnelEvent::Connected { id });
            // Silent on a first connect; announces recoveries
            self.notifier.connected(&name);
            self.check_all_ready().await;
        }
    }

    /// Record a stage failure and clean up its process
    async fn fail_stage(&self, id: Uuid, role: ProcessRole, error: &str) {
        let name = {
            let mut tunnels = self.tunnels.write().await;
            match tunnels.get_mut(&id) {
                Some(state) => {
                    match role {
                        ProcessRole::Forward => state.forward_status = StageStatus::Error,
                        ProcessRole::Relay => state.relay_status = StageStatus::Error,
                    }
                    state.last_error = Some(error.to_string());
                    Some(state.config.name.clone())
                }
                None => None,
            }
        };

        let Some(name) = name else {
            return;
        };

        warn!("Tunnel '{}' {} stage failed: {}", name, role, error);
        self.processes.kill_role(id, role).await;
        let _ = self.event_tx.send(TunnelEvent::Error {
            id,
            error: error.to_string(),
        });
        self.notifier.error(&name, error);
    }

    /// One reconciliation pass over every tunnel
    pub async fn reconcile_all(&self) {
        if self.is_killing() {
            return;
        }
        let ids: Vec<Uuid> = self.tunnels.read().await.keys().copied().collect();
        for id in ids {
            if self.is_killing() {
                return;
            }
            self.reconcile(id).await;
        }
    }

    /// Compare one tunnel's believed state against its observed health and
    /// drive recovery transitions
    pub async fn reconcile(&self, id: Uuid) {
        let snapshot = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .get(&id)
                .map(|s| (s.config.clone(), s.forward_status, s.relay_status))
        };
        let Some((config, forward_status, relay_status)) = snapshot else {
            return;
        };

        if !config.enabled || !config.auto_reconnect {
            return;
        }
        // A stage mid-transition is owned by its connect task
        if forward_status.is_in_progress() || relay_status.is_in_progress() {
            return;
        }

        if config.use_direct_exec {
            match relay_status {
                StageStatus::Connected => {
                    if self.processes.recent_error(id, ERROR_MARK_WINDOW).await {
                        self.recover(id, &config, "relay reported errors", true).await;
                    } else if !self.processes.is_alive(id, ProcessRole::Relay).await {
                        self.recover(id, &config, "relay process died", true).await;
                    }
                }
                StageStatus::Error => {
                    self.recover(id, &config, "relay in error state", false).await;
                }
                _ => {}
            }
            return;
        }

        match forward_status {
            StageStatus::Connected => {
                if self.processes.recent_error(id, ERROR_MARK_WINDOW).await {
                    self.recover(id, &config, "tunnel reported errors", true).await;
                    return;
                }
                if !self.processes.is_alive(id, ProcessRole::Forward).await {
                    self.recover(id, &config, "forward process died", true).await;
                    return;
                }
                if !probe::local_port_open(config.local_port).await {
                    let reason = format!("local port {} stopped responding", config.local_port);
                    self.recover(id, &config, &reason, true).await;
                    return;
                }

                if let Some(proxy_port) = config.proxy_port {
                    if relay_status.is_connected() && !probe::local_port_open(proxy_port).await {
                        let reason = format!("relay port {} stopped responding", proxy_port);
                        {
                            let mut tunnels = self.tunnels.write().await;
                            if let Some(state) = tunnels.get_mut(&id) {
                                state.relay_status = StageStatus::Error;
                                state.last_error = Some(reason.clone());
                            }
                        }
                        self.recover(id, &config, &reason, true).await;
                    } else if relay_status == StageStatus::Error {
                        self.recover(id, &config, "relay in error state", false).await;
                    }
                }
            }
            StageStatus::Error => {
                self.recover(id, &config, "forward in error state", false).await;
            }
            _ => {}
        }
    }

    /// Tear the tunnel down and immediately re-enter the connect cycle
    async fn recover(&self, id: Uuid, config: &TunnelConfig, reason: &str, was_connected: bool) {
        warn!("Tunnel '{}' unhealthy: {}", config.name, reason);

        if was_connected {
            self.notifier.disconnected(&config.name, reason);
        }
        {
            let mut tunnels = self.tunnels.write().await;
            if let Some(state) = tunnels.get_mut(&id) {
                state.last_error = Some(reason.to_string());
            }
        }

        self.processes.clear_error(id).await;
        if let Err(e) = self.halt(&id, reason).await {
            warn!("Failed to halt tunnel {} for recovery: {}", id, e);
            return;
        }

        if let Err(e) = self.start(id).await {
            warn!("Failed to reconnect tunnel '{}': {}", config.name, e);
        }
    }

    /// Fire the unthrottled all-ready signal when every enabled tunnel is up
    async fn check_all_ready(&self) {
        let all_ready = {
            let tunnels = self.tunnels.read().await;
            let enabled: Vec<&TunnelState> =
                tunnels.values().filter(|s| s.config.enabled).collect();
            !enabled.is_empty() && enabled.iter().all(|s| s.fully_connected())
        };

        if all_ready {
            let _ = self.event_tx.send(TunnelEvent::AllReady);
            self.notifier.all_ready();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::SpawnSpec;
    use crate::notify::NotificationSink;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingSink {
        alerts: StdMutex<Vec<(String, bool)>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, title: &str, _body: &str, is_error: bool) {
            self.alerts.lock().unwrap().push((title.to_string(), is_error));
        }
    }

    impl RecordingSink {
        fn titles(&self) -> Vec<String> {
            self.alerts.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    /// Inert commands standing in for kubectl/socat
    struct FakePlanner {
        forward_cmd: String,
        relay_cmd: String,
    }

    impl FakePlanner {
        fn sleeping() -> Self {
            Self {
                forward_cmd: "sleep 30".to_string(),
                relay_cmd: "sleep 30".to_string(),
            }
        }

        fn with_forward(cmd: &str) -> Self {
            Self {
                forward_cmd: cmd.to_string(),
                relay_cmd: "sleep 30".to_string(),
            }
        }
    }

    impl SpawnPlanner for FakePlanner {
        fn forward_spec(&self, config: &TunnelConfig) -> Option<SpawnSpec> {
            if config.use_direct_exec {
                return None;
            }
            Some(SpawnSpec::new(
                "sh",
                vec!["-c".to_string(), self.forward_cmd.clone()],
            ))
        }

        fn relay_spec(&self, config: &TunnelConfig) -> Option<SpawnSpec> {
            config.proxy_port?;
            Some(SpawnSpec::new(
                "sh",
                vec!["-c".to_string(), self.relay_cmd.clone()],
            ))
        }
    }

    fn supervisor_with(planner: FakePlanner) -> (Arc<RecordingSink>, ConnectionSupervisor) {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(NotificationThrottler::with_cooldown(
            sink.clone(),
            Duration::from_secs(60),
        ));
        (sink, ConnectionSupervisor::new(Arc::new(planner), notifier))
    }

    fn config(name: &str, local_port: u16) -> TunnelConfig {
        TunnelConfig::new(
            name.to_string(),
            "default".to_string(),
            format!("{}-svc", name),
            local_port,
            80,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    #[tokio::test]
    async fn connects_forward_only_tunnel() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let cfg = config("web", 18080);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        let status = sup.get_status(&id).await.unwrap();
        assert_eq!(status.forward_status, StageStatus::Connecting);

        settle().await;
        let status = sup.get_status(&id).await.unwrap();
        assert_eq!(status.forward_status, StageStatus::Connected);
        assert_eq!(status.relay_status, StageStatus::Disconnected);
        assert!(status.fully_connected);
        // No relay configured, so no relay process was ever spawned
        assert!(!sup.processes().is_alive(id, ProcessRole::Relay).await);

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn chains_relay_after_forward() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let mut cfg = config("db", 15432);
        cfg.proxy_port = Some(15431);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        settle().await;

        let status = sup.get_status(&id).await.unwrap();
        assert_eq!(status.forward_status, StageStatus::Connected);
        assert_eq!(status.relay_status, StageStatus::Connected);
        assert!(status.fully_connected);
        assert!(sup.processes().is_alive(id, ProcessRole::Forward).await);
        assert!(sup.processes().is_alive(id, ProcessRole::Relay).await);

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn relay_pending_means_not_fully_connected() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let mut cfg = config("cache", 16379);
        cfg.proxy_port = Some(16380);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        // After the forward settles but before the relay does
        tokio::time::sleep(Duration::from_millis(60)).await;
        let status = sup.get_status(&id).await.unwrap();
        if status.forward_status.is_connected() && !status.relay_status.is_connected() {
            assert!(!status.fully_connected);
        }

        settle().await;
        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn direct_exec_uses_placeholder_forward() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let mut cfg = config("multi", 19000);
        cfg.proxy_port = Some(19001);
        cfg.use_direct_exec = true;
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        // The placeholder is Connected before any settling
        let status = sup.get_status(&id).await.unwrap();
        assert_eq!(status.forward_status, StageStatus::Connected);
        assert_eq!(status.relay_status, StageStatus::Connecting);

        settle().await;
        let status = sup.get_status(&id).await.unwrap();
        assert!(status.fully_connected);
        // Only the relay is a real process
        assert!(!sup.processes().is_alive(id, ProcessRole::Forward).await);
        assert!(sup.processes().is_alive(id, ProcessRole::Relay).await);

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_an_idempotent_terminal_reset() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let mut cfg = config("api", 18081);
        cfg.proxy_port = Some(18082);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        settle().await;
        sup.stop(&id).await.unwrap();

        let status = sup.get_status(&id).await.unwrap();
        assert_eq!(status.forward_status, StageStatus::Disconnected);
        assert_eq!(status.relay_status, StageStatus::Disconnected);
        assert!(!sup.processes().is_alive(id, ProcessRole::Forward).await);
        assert!(!sup.processes().is_alive(id, ProcessRole::Relay).await);

        // Stopping again is safe
        sup.stop(&id).await.unwrap();
        // Stopping an unknown tunnel is not
        assert!(sup.stop(&Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let cfg = config("solo", 18083);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        assert!(sup.start(id).await.is_err());

        settle().await;
        assert!(sup.start(id).await.is_err());

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_tunnel_refuses_to_start() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let mut cfg = config("off", 18084);
        cfg.enabled = false;
        let id = cfg.id;
        sup.insert(cfg).await;

        assert!(matches!(sup.start(id).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn spawn_failure_lands_in_error_state() {
        struct BrokenPlanner;
        impl SpawnPlanner for BrokenPlanner {
            fn forward_spec(&self, _config: &TunnelConfig) -> Option<SpawnSpec> {
                Some(SpawnSpec::new("kube-tunnel-no-such-binary", vec![]))
            }
            fn relay_spec(&self, _config: &TunnelConfig) -> Option<SpawnSpec> {
                None
            }
        }

        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(NotificationThrottler::with_cooldown(
            sink.clone(),
            Duration::from_secs(60),
        ));
        let sup = ConnectionSupervisor::new(Arc::new(BrokenPlanner), notifier);

        let cfg = config("broken", 18085);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        settle().await;

        let status = sup.get_status(&id).await.unwrap();
        assert_eq!(status.forward_status, StageStatus::Error);
        assert!(status.last_error.is_some());
        assert!(sink
            .titles()
            .iter()
            .any(|t| t.starts_with("Tunnel Error")));
    }

    #[tokio::test]
    async fn update_resets_an_active_tunnel() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let cfg = config("edit", 18086);
        let id = cfg.id;
        sup.insert(cfg.clone()).await;

        sup.start(id).await.unwrap();
        settle().await;
        assert!(sup.get_status(&id).await.unwrap().fully_connected);

        let mut edited = cfg;
        edited.local_port = 18087;
        sup.update(edited.clone()).await.unwrap();

        let status = sup.get_status(&id).await.unwrap();
        assert_eq!(status.forward_status, StageStatus::Disconnected);
        assert_eq!(sup.get_config(&id).await.unwrap().local_port, 18087);
    }

    #[tokio::test]
    async fn monitor_recovers_dead_forward_process() {
        // Forward outlives the settle delay, then dies
        let (sink, sup) = supervisor_with(FakePlanner::with_forward("sleep 0.15"));
        let cfg = config("flaky", 18088);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sup.get_status(&id).await.unwrap().forward_status.is_connected());

        // Let the process die, then run a monitor pass
        tokio::time::sleep(Duration::from_millis(150)).await;
        sup.reconcile_all().await;

        assert!(sink
            .titles()
            .iter()
            .any(|t| t.starts_with("Tunnel Disconnected")));
        // The reconnect cycle re-entered Connecting (or already settled again)
        let status = sup.get_status(&id).await.unwrap();
        assert_ne!(status.forward_status, StageStatus::Disconnected);

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn monitor_recovers_on_error_mark() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Healthy long-lived process that printed an error line
        let (sink, sup) = supervisor_with(FakePlanner::with_forward(
            "echo 'lost connection to pod' >&2; sleep 30",
        ));
        let cfg = config("marked", port);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        settle().await;
        assert!(sup.get_status(&id).await.unwrap().forward_status.is_connected());
        assert!(sup
            .processes()
            .recent_error(id, Duration::from_secs(10))
            .await);

        sup.reconcile_all().await;
        assert!(sink
            .titles()
            .iter()
            .any(|t| t.starts_with("Tunnel Disconnected")));

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn monitor_leaves_healthy_tunnel_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (sink, sup) = supervisor_with(FakePlanner::sleeping());
        let cfg = config("steady", port);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        settle().await;

        sup.reconcile_all().await;
        assert!(sup.get_status(&id).await.unwrap().fully_connected);
        assert!(sink.titles().is_empty());

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn killing_flag_suspends_reconciliation() {
        let (sink, sup) = supervisor_with(FakePlanner::with_forward("sleep 0.15"));
        let cfg = config("frozen", 18089);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        sup.set_killing(true);
        sup.reconcile_all().await;
        assert!(sink.titles().is_empty());
        sup.set_killing(false);

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn restart_round_trips_to_connected() {
        let (_sink, sup) = supervisor_with(FakePlanner::sleeping());
        let cfg = config("again", 18090);
        let id = cfg.id;
        sup.insert(cfg).await;

        sup.start(id).await.unwrap();
        settle().await;
        sup.restart(id).await.unwrap();
        settle().await;

        assert!(sup.get_status(&id).await.unwrap().fully_connected);
        sup.stop(&id).await.unwrap();
    }
}
