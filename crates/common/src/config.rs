// Configuration structures for Kube Tunnel Manager

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One persisted tunnel definition
///
/// A tunnel bridges a local TCP port to a service port inside the cluster,
/// optionally exposing it to other machines through a relay listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Unique tunnel identifier
    pub id: Uuid,
    /// Human-readable tunnel name
    pub name: String,
    /// Cluster namespace the target service lives in
    pub namespace: String,
    /// Target service name
    pub service: String,
    /// Local port the forward stage binds on 127.0.0.1
    pub local_port: u16,
    /// Service port to forward to
    pub remote_port: u16,
    /// Relay listen port; when set, a relay stage is chained after the forward
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    /// Whether this tunnel participates in start-all and monitoring
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Reconnect automatically when the monitor detects a failure
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    /// Multi-connection mode: the relay spawns a fresh upstream session per
    /// inbound client instead of sharing one forward channel
    #[serde(default)]
    pub use_direct_exec: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_auto_reconnect() -> bool {
    true
}

impl TunnelConfig {
    /// Create a new tunnel with a fresh identifier
    pub fn new(
        name: String,
        namespace: String,
        service: String,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            namespace,
            service,
            local_port,
            remote_port,
            proxy_port: None,
            enabled: default_enabled(),
            auto_reconnect: default_auto_reconnect(),
            use_direct_exec: false,
        }
    }

    /// Whether a relay stage is configured at all
    pub fn has_relay(&self) -> bool {
        self.proxy_port.is_some()
    }

    /// Validate the tunnel configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("Name cannot be empty".to_string()));
        }
        if self.namespace.is_empty() {
            return Err(Error::Config("Namespace cannot be empty".to_string()));
        }
        if self.service.is_empty() {
            return Err(Error::Config("Service cannot be empty".to_string()));
        }
        if self.local_port == 0 {
            return Err(Error::Config("Local port must be greater than 0".to_string()));
        }
        if self.remote_port == 0 {
            return Err(Error::Config(
                "Remote port must be greater than 0".to_string(),
            ));
        }

        if let Some(proxy_port) = self.proxy_port {
            if proxy_port == 0 {
                return Err(Error::Config(
                    "Proxy port must be greater than 0".to_string(),
                ));
            }
            if proxy_port == self.local_port {
                return Err(Error::Config(
                    "Proxy port must differ from local port".to_string(),
                ));
            }
        } else if self.use_direct_exec {
            return Err(Error::Config(
                "Direct-exec mode requires a proxy port".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TunnelConfig {
        TunnelConfig::new(
            "postgres".to_string(),
            "data".to_string(),
            "postgres-rw".to_string(),
            5432,
            5432,
        )
    }

    #[test]
    fn valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn defaults_enable_monitoring() {
        let config = base_config();
        assert!(config.enabled);
        assert!(config.auto_reconnect);
        assert!(!config.use_direct_exec);
        assert!(!config.has_relay());
    }

    #[test]
    fn rejects_empty_service() {
        let mut config = base_config();
        config.service = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = base_config();
        config.local_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_proxy_port_clash() {
        let mut config = base_config();
        config.proxy_port = Some(config.local_port);
        assert!(config.validate().is_err());
    }

    #[test]
    fn direct_exec_requires_proxy_port() {
        let mut config = base_config();
        config.use_direct_exec = true;
        assert!(config.validate().is_err());

        config.proxy_port = Some(5431);
        assert!(config.validate().is_ok());
    }
}
