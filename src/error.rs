//! Error types shared by the host manager and the update engines.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Duplicate or unknown endpoint name, protected endpoint, bad location.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Endpoint unreachable, or not connected when it had to be.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("registry query failed: {0}")]
    RegistryQuery(String),

    /// Pull, recreate or deploy failure while applying an update.
    #[error("update failed: {0}")]
    UpdateExecution(String),

    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to load settings: {0}")]
    Figment(#[from] figment::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
