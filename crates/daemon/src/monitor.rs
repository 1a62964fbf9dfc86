// Kube Tunnel Manager - Health Monitor Module
// Periodic reconciliation of believed tunnel state against observed health

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::supervisor::ConnectionSupervisor;

#[cfg(not(test))]
fn poll_interval() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
fn poll_interval() -> Duration {
    Duration::from_millis(50)
}

/// Drives one reconciliation pass per second over all tunnels
pub struct HealthMonitor {
    supervisor: ConnectionSupervisor,
}

impl HealthMonitor {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        Self { supervisor }
    }

    /// Run until the shutdown channel flips
    ///
    /// Ticks are delayed rather than bursted when a pass overruns, so passes
    /// never overlap. Passes are skipped entirely while a bulk kill is in
    /// flight.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Health monitor started");

        let mut ticker = tokio::time::interval(poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.supervisor.is_killing() {
                        continue;
                    }
                    self.supervisor.reconcile_all().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{SpawnPlanner, SpawnSpec};
    use crate::notify::{NotificationSink, NotificationThrottler};
    use kube_tunnel_common::TunnelConfig;
    use std::sync::Arc;

    struct NullSink;
    impl NotificationSink for NullSink {
        fn notify(&self, _title: &str, _body: &str, _is_error: bool) {}
    }

    struct NullPlanner;
    impl SpawnPlanner for NullPlanner {
        fn forward_spec(&self, _config: &TunnelConfig) -> Option<SpawnSpec> {
            None
        }
        fn relay_spec(&self, _config: &TunnelConfig) -> Option<SpawnSpec> {
            None
        }
    }

    #[tokio::test]
    async fn exits_on_shutdown_signal() {
        let notifier = Arc::new(NotificationThrottler::new(Arc::new(NullSink)));
        let supervisor = ConnectionSupervisor::new(Arc::new(NullPlanner), notifier);
        let monitor = HealthMonitor::new(supervisor);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
