// Kube Tunnel Manager - Notification Module
// Rate-limits user-facing alerts so flapping tunnels do not spam the desktop

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify_rust::{Notification, Timeout};
use tracing::warn;

/// Cooldown between disconnect/error alerts for the same tunnel name
const NOTIFY_COOLDOWN: Duration = Duration::from_secs(60);

/// Receives the alerts the throttler decides to deliver
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str, is_error: bool);

    /// Fired when every enabled tunnel is fully connected
    fn all_ready(&self) {}
}

/// Desktop notification sink
pub struct DesktopSink;

impl NotificationSink for DesktopSink {
    fn notify(&self, title: &str, body: &str, is_error: bool) {
        let mut notification = Notification::new();
        notification
            .summary(title)
            .body(body)
            .icon(if is_error {
                "network-offline"
            } else {
                "network-transmit-receive"
            })
            .timeout(Timeout::Milliseconds(if is_error { 10000 } else { 3000 }));

        if let Err(e) = notification.show() {
            warn!("Failed to show notification: {}", e);
        }
    }
}

/// Per-tunnel-name alert throttle
///
/// Disconnect and error alerts for a name are suppressed inside the cooldown
/// window. A "connected" alert is only delivered while a disconnect/error
/// alert is pending for that name, and clears the pending entry — so the very
/// first successful connect of a tunnel stays silent.
pub struct NotificationThrottler {
    sink: Arc<dyn NotificationSink>,
    last_alert: Mutex<HashMap<String, Instant>>,
    cooldown: Duration,
}

impl NotificationThrottler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self::with_cooldown(sink, NOTIFY_COOLDOWN)
    }

    pub fn with_cooldown(sink: Arc<dyn NotificationSink>, cooldown: Duration) -> Self {
        Self {
            sink,
            last_alert: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// Throttled disconnect alert; returns whether it was delivered
    pub fn disconnected(&self, name: &str, reason: &str) -> bool {
        self.alert(name, &format!("Tunnel Disconnected: {}", name), reason)
    }

    /// Throttled error alert; returns whether it was delivered
    pub fn error(&self, name: &str, error: &str) -> bool {
        self.alert(name, &format!("Tunnel Error: {}", name), error)
    }

    fn alert(&self, name: &str, title: &str, body: &str) -> bool {
        {
            let mut last_alert = self.last_alert.lock().unwrap();
            if let Some(sent) = last_alert.get(name) {
                if sent.elapsed() < self.cooldown {
                    // Still pending; the cooldown window does not slide
                    return false;
                }
            }
            last_alert.insert(name.to_string(), Instant::now());
        }
        self.sink.notify(title, body, true);
        true
    }

    /// Reconnect alert; delivered only when a disconnect/error alert is
    /// pending for this name
    pub fn connected(&self, name: &str) -> bool {
        let pending = self.last_alert.lock().unwrap().remove(name).is_some();
        if pending {
            self.sink.notify(
                &format!("Tunnel Connected: {}", name),
                "Connection restored",
                false,
            );
        }
        pending
    }

    /// Unthrottled pass-through for the all-tunnels-ready signal
    pub fn all_ready(&self) {
        self.sink.all_ready();
    }
}
