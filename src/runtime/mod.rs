use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::models::{PortMap, RestartPolicy};
use chrono::{DateTime, Utc};

use crate::error::Result;

pub mod docker;
pub use docker::{DockerConnector, DockerRuntime};

/// A container as listed by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub created: DateTime<Utc>,
}

/// Everything needed to recreate a container with a different image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub port_bindings: Option<PortMap>,
    pub binds: Vec<String>,
    pub env: Vec<String>,
    pub restart_policy: Option<RestartPolicy>,
    pub network_mode: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
}

/// An inspected container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
    pub created: DateTime<Utc>,
    pub spec: ContainerSpec,
}

/// One container-runtime daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// Pulls `image` and waits until the pull has finished.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Creates and starts a container, returning its id.  A container that
    /// was created but failed to start is removed again.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// Builds runtime clients from endpoint addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ContainerRuntime>>;
}
