// Common types for Kube Tunnel Manager

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a supervised process within a tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// The kubectl port-forward channel into the cluster
    Forward,
    /// The socat listener sharing (or multiplying) the forward channel
    Relay,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Forward => write!(f, "forward"),
            ProcessRole::Relay => write!(f, "relay"),
        }
    }
}

/// Status of a single tunnel stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Disconnected, // no process running for this stage
    Connecting,   // process spawned, waiting out the settle delay
    Connected,    // process alive after settling
    Error,        // spawn failed or process died before settling
}

impl StageStatus {
    /// Check if the stage is serving traffic
    pub fn is_connected(&self) -> bool {
        matches!(self, StageStatus::Connected)
    }

    /// Check if the stage is mid-transition
    pub fn is_in_progress(&self) -> bool {
        matches!(self, StageStatus::Connecting)
    }
}

/// Runtime status of one tunnel, as reported by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatusResponse {
    pub id: Uuid,
    pub name: String,
    pub forward_status: StageStatus,
    pub relay_status: StageStatus,
    pub fully_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A named or numbered port exposed by a discovered service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A service discovered in a cluster namespace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub service_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    pub ports: Vec<ServicePort>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_helpers() {
        assert!(StageStatus::Connected.is_connected());
        assert!(!StageStatus::Connecting.is_connected());
        assert!(StageStatus::Connecting.is_in_progress());
        assert!(!StageStatus::Disconnected.is_in_progress());
        assert!(!StageStatus::Error.is_connected());
    }

    #[test]
    fn stage_status_serde_round_trip() {
        let json = serde_json::to_string(&StageStatus::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
        let back: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageStatus::Disconnected);
    }
}
