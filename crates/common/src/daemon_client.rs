// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Kube Tunnel Manager Contributors

// Kube Tunnel Manager - Daemon Client Module
// Shared daemon connection logic for the CLI

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Connection mode for client to daemon communication
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (local-only)
    UnixSocket,
    /// TCP with HTTP (localhost only, no TLS)
    Http,
}

impl Default for ConnectionMode {
    fn default() -> Self {
        ConnectionMode::UnixSocket
    }
}

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    /// Connection mode (UnixSocket or Http)
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Daemon host for HTTP mode
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port for HTTP mode
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Socket path override for UnixSocket mode (optional)
    #[serde(default)]
    pub socket_path: String,

    /// Authentication token (if the daemon requires auth)
    #[serde(default)]
    pub auth_token: String,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    3545
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            socket_path: String::new(),
            auth_token: String::new(),
        }
    }
}

impl DaemonClientConfig {
    /// Get the daemon base URL based on connection mode
    pub fn daemon_base_url(&self) -> Result<String> {
        match self.connection_mode {
            ConnectionMode::UnixSocket => {
                // For Unix sockets the authority is ignored by the transport
                Ok("http://daemon".to_string())
            }
            ConnectionMode::Http => Ok(format!(
                "http://{}",
                crate::format_host_port(&self.daemon_host, self.daemon_port)
            )),
        }
    }

    /// Resolve the Unix socket path (for UnixSocket mode)
    ///
    /// An explicit path from the config wins; otherwise the daemon's runtime
    /// directory location is used.
    pub fn resolve_socket_path(&self) -> Result<PathBuf> {
        let candidate = self.socket_path.trim();
        if !candidate.is_empty() {
            return Ok(PathBuf::from(candidate));
        }

        dirs::runtime_dir()
            .map(|runtime_dir| {
                runtime_dir
                    .join("kube-tunnel-manager")
                    .join("kube-tunnel-manager.sock")
            })
            .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
    }
}

/// Create an HTTP client configured to connect to the daemon
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    let mut client_builder = Client::builder().timeout(Duration::from_secs(30));

    match config.connection_mode {
        ConnectionMode::UnixSocket => {
            let socket_path = config.resolve_socket_path()?;
            client_builder = client_builder.unix_socket(socket_path);
        }
        ConnectionMode::Http => {
            // Plain HTTP, no transport setup needed
        }
    }

    client_builder
        .build()
        .context("Failed to build daemon client")
}

/// Add authentication header to a request if a token is configured
pub fn add_auth_header(
    request: reqwest::RequestBuilder,
    config: &DaemonClientConfig,
) -> reqwest::RequestBuilder {
    if !config.auth_token.is_empty() {
        request.header("X-Tunnel-Token", &config.auth_token)
    } else {
        request
    }
}
