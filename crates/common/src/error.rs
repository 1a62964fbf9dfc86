// Error types for Kube Tunnel Manager

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Tunnel already exists: {0}")]
    TunnelExists(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Command failed: {0}")]
    ExecutionFailed(String),

    #[error("Failed to parse command output: {0}")]
    ParsingFailed(String),

    #[error("Cluster unreachable: {0}")]
    ClusterUnreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tunnel runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
