// Kube Tunnel Manager - CLI Config Module
// CLI configuration for connecting to the daemon

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use kube_tunnel_common::DaemonClientConfig;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,
}

impl CliConfig {
    /// Load CLI configuration, falling back to defaults when no file exists
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read CLI configuration")?;
        let config: Self =
            toml::from_str(&contents).context("Failed to parse CLI configuration")?;

        Ok(config)
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        Ok(kube_tunnel_common::config_dir()?.join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube_tunnel_common::ConnectionMode;

    #[test]
    fn default_config_uses_unix_socket() {
        let config = CliConfig::default();
        assert_eq!(config.daemon_config.connection_mode, ConnectionMode::UnixSocket);
    }

    #[test]
    fn parses_flattened_daemon_config() {
        let config: CliConfig = toml::from_str(
            r#"
            connection_mode = "http"
            daemon_port = 4000
            auth_token = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon_config.connection_mode, ConnectionMode::Http);
        assert_eq!(config.daemon_config.daemon_port, 4000);
        assert_eq!(config.daemon_config.auth_token, "secret");
    }
}
