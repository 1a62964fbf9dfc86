// Kube Tunnel Manager - Daemon Config Module
// Daemon-side configuration (listener mode, auth, external tool paths)

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kube_tunnel_common::TunnelStore;

/// Get the runtime directory for daemon state
pub fn runtime_dir() -> Result<PathBuf> {
    let base = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))?;
    Ok(base.join("kube-tunnel-manager"))
}

/// Get the socket path for the daemon
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("kube-tunnel-manager.sock"))
}

/// Listener mode for the daemon
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    UnixSocket,
    /// TCP with HTTP (localhost-only, no TLS)
    TcpHttp,
}

impl Default for ListenerMode {
    fn default() -> Self {
        ListenerMode::UnixSocket
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Listener mode (UnixSocket or TcpHttp)
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind host for TCP mode
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bind port for TCP mode
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Require authentication on the API
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// Path to the authentication token file
    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// kubectl executable used for forwards and discovery
    #[serde(default = "default_kubectl_path")]
    pub kubectl_path: String,

    /// Override for the persisted tunnel list location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnels_path: Option<PathBuf>,

    /// Grant the daemon's group access to the socket and runtime directory
    /// (permissions 0770/0660 instead of 0700/0600)
    #[serde(default)]
    pub group_access: bool,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    3545
}

fn default_require_auth() -> bool {
    true
}

fn default_auth_token_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kube-tunnel-manager")
        .join("daemon.token")
}

fn default_kubectl_path() -> String {
    "kubectl".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            require_auth: default_require_auth(),
            auth_token_path: default_auth_token_path(),
            kubectl_path: default_kubectl_path(),
            tunnels_path: None,
            group_access: false,
        }
    }
}

impl DaemonConfig {
    /// Get the daemon configuration file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(kube_tunnel_common::config_dir()?.join("daemon.toml"))
    }

    /// Load the daemon configuration, falling back to defaults when the file
    /// does not exist
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            debug!("No daemon config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).context(format!("Failed to parse {}", path.display()))?;

        Ok(config)
    }

    /// Open the tunnel store this daemon persists through
    pub fn tunnel_store(&self) -> Result<TunnelStore> {
        match &self.tunnels_path {
            Some(path) => Ok(TunnelStore::new(path.clone())),
            None => TunnelStore::open_default(),
        }
    }
}
