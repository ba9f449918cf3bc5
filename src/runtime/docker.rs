use super::{Connector, ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary};
use crate::error::{Error, Result};
use crate::image_ref::{split_tag, DEFAULT_TAG};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures_util::stream::TryStreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Seconds bollard waits on a single API request.
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Opens a client for `address`: `unix://` sockets, or plain `tcp://`
    /// and `http://` daemons.  TLS endpoints are not supported.  Nothing is
    /// sent to the daemon until the first request.
    pub fn connect(address: &str, timeout_secs: u64) -> Result<Docker> {
        let docker = if address.is_empty() || address == "local" {
            Docker::connect_with_local_defaults()?
        } else if address.starts_with("unix://") {
            Docker::connect_with_unix(address, timeout_secs, API_DEFAULT_VERSION)?
        } else if address.starts_with("tcp://") || address.starts_with("http://") {
            Docker::connect_with_http(address, timeout_secs, API_DEFAULT_VERSION)?
        } else {
            return Err(Error::Configuration(format!(
                "unsupported endpoint address: {} (expected unix://, tcp:// or http://)",
                address
            )));
        };
        Ok(docker)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let opts = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut out = Vec::with_capacity(containers.len());
        for c in containers {
            let id = match c.id {
                Some(id) => id,
                None => continue,
            };
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());
            out.push(ContainerSummary {
                id,
                name,
                image: c.image.unwrap_or_default(),
                status: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                created: c
                    .created
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(details_from_inspect(id, detail))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_tag(image);
        info!("Pulling image {}:{}", from_image, tag.unwrap_or(DEFAULT_TAG));
        let opts = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
            ..Default::default()
        };
        let progress: Vec<_> = self
            .docker
            .create_image(Some(opts), None, None)
            .try_collect()
            .await?;
        debug!("Pull of {} finished after {} progress events", image, progress.len());
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let exposed_ports = spec.port_bindings.as_ref().map(|ports| {
            ports
                .keys()
                .map(|port| (port.clone(), HashMap::new()))
                .collect::<HashMap<_, _>>()
        });
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports,
            host_config: Some(HostConfig {
                port_bindings: spec.port_bindings.clone(),
                binds: Some(spec.binds.clone()),
                restart_policy: spec.restart_policy.clone(),
                network_mode: spec.network_mode.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self.docker.create_container(Some(opts), config).await?;
        for warning in &created.warnings {
            debug!("Create warning for {}: {}", spec.name, warning);
        }
        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // leave nothing behind under the name, so the caller can reuse it
            let opts = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(cleanup) = self.docker.remove_container(&created.id, Some(opts)).await {
                warn!("Failed to remove unstarted container {}: {}", spec.name, cleanup);
            }
            return Err(e.into());
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }
}

fn details_from_inspect(requested: &str, detail: ContainerInspectResponse) -> ContainerDetails {
    let config = detail.config.unwrap_or_default();
    let host = detail.host_config.unwrap_or_default();
    let name = detail
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| requested.to_string());

    ContainerDetails {
        id: detail.id.unwrap_or_else(|| requested.to_string()),
        running: detail.state.and_then(|s| s.running).unwrap_or(false),
        created: detail
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc))
            .unwrap_or_default(),
        spec: ContainerSpec {
            name,
            image: config.image.unwrap_or_default(),
            port_bindings: host.port_bindings,
            binds: host.binds.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            restart_policy: host.restart_policy,
            network_mode: host.network_mode,
            cmd: config.cmd,
            entrypoint: config.entrypoint,
            working_dir: config.working_dir.filter(|w| !w.is_empty()),
            labels: config.labels.unwrap_or_default(),
        },
    }
}

/// Connects to Docker daemons over a unix socket or plain HTTP.
pub struct DockerConnector {
    request_timeout_secs: u64,
}

impl DockerConnector {
    pub fn new(request_timeout_secs: u64) -> Self {
        Self {
            request_timeout_secs,
        }
    }
}

impl Default for DockerConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl Connector for DockerConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ContainerRuntime>> {
        let docker = DockerRuntime::connect(address, self.request_timeout_secs)?;
        Ok(Arc::new(DockerRuntime::new(docker)))
    }
}
