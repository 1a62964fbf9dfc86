// Kube Tunnel Manager - Tunnel Store Module
// Persisted, ordered tunnel list shared by CLI and Daemon

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::TunnelConfig;

/// On-disk document wrapping the ordered tunnel list
#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelDocument {
    #[serde(default)]
    tunnels: Vec<TunnelConfig>,
}

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(config_dir.join("kube-tunnel-manager"))
}

/// Get the default path of the persisted tunnel list
pub fn default_store_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("tunnels.toml"))
}

/// Ordered tunnel list persisted as a single TOML document
///
/// The entire file is rewritten on every mutation, so the order the user
/// defined tunnels in survives load/save cycles.
#[derive(Debug, Clone)]
pub struct TunnelStore {
    path: PathBuf,
}

impl TunnelStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Open the store at the default config location
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(default_store_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all tunnels in their persisted order
    ///
    /// A missing file is an empty list, not an error.
    pub fn load(&self) -> Result<Vec<TunnelConfig>> {
        if !self.path.exists() {
            debug!("Tunnel store does not exist: {}", self.path.display());
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)
            .context(format!("Failed to read {}", self.path.display()))?;

        let document: TunnelDocument =
            toml::from_str(&contents).context(format!("Failed to parse {}", self.path.display()))?;

        Ok(document.tunnels)
    }

    /// Rewrite the whole store with the given list
    pub fn save(&self, tunnels: &[TunnelConfig]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let document = TunnelDocument {
            tunnels: tunnels.to_vec(),
        };
        let contents =
            toml::to_string_pretty(&document).context("Failed to serialize tunnel list")?;

        fs::write(&self.path, contents)
            .context(format!("Failed to write {}", self.path.display()))?;

        debug!(
            "Saved {} tunnel(s) to {}",
            tunnels.len(),
            self.path.display()
        );

        Ok(())
    }

    /// Append a tunnel and rewrite the store
    pub fn add(&self, tunnel: TunnelConfig) -> Result<()> {
        let mut tunnels = self.load()?;
        if tunnels.iter().any(|t| t.name == tunnel.name) {
            anyhow::bail!("Tunnel '{}' already exists", tunnel.name);
        }
        tunnels.push(tunnel);
        self.save(&tunnels)
    }

    /// Replace a tunnel in place (position preserved) and rewrite the store
    pub fn update(&self, tunnel: TunnelConfig) -> Result<()> {
        let mut tunnels = self.load()?;
        let slot = tunnels
            .iter_mut()
            .find(|t| t.id == tunnel.id)
            .ok_or_else(|| anyhow::anyhow!("Tunnel not found: {}", tunnel.id))?;
        *slot = tunnel;
        self.save(&tunnels)
    }

    /// Remove a tunnel by id and rewrite the store
    pub fn remove(&self, id: &Uuid) -> Result<TunnelConfig> {
        let mut tunnels = self.load()?;
        let index = tunnels
            .iter()
            .position(|t| t.id == *id)
            .ok_or_else(|| anyhow::anyhow!("Tunnel not found: {}", id))?;
        let removed = tunnels.remove(index);
        self.save(&tunnels)?;
        Ok(removed)
    }

    /// Find a tunnel by name
    pub fn find_by_name(&self, name: &str) -> Result<Option<TunnelConfig>> {
        Ok(self.load()?.into_iter().find(|t| t.name == name))
    }
}
