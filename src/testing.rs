//! In-memory stand-ins for Docker, the registry and the compose CLI.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::compose::{CommandOutput, ComposeInvocation, ComposeRunner};
use crate::error::{Error, Result};
use crate::image_ref::ImageRef;
use crate::registry::TagRegistry;
use crate::runtime::{
    Connector, ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary,
};

/// State of one fake daemon, shared by every client connected to it.
pub struct FakeBackend {
    reachable: AtomicBool,
    ping_delay: Mutex<Option<Duration>>,
    containers: Mutex<Vec<ContainerDetails>>,
    calls: Mutex<Vec<String>>,
    fail_pull: AtomicBool,
    fail_remove: AtomicBool,
    fail_run_image: Mutex<Option<String>>,
    fail_start_image: Mutex<Option<String>>,
    next_id: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            ping_delay: Mutex::new(None),
            containers: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_pull: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            fail_run_image: Mutex::new(None),
            fail_start_image: Mutex::new(None),
            next_id: AtomicUsize::new(1),
        }
    }
}

impl FakeBackend {
    pub fn add_container(&self, details: ContainerDetails) {
        self.containers.lock().unwrap().push(details);
    }

    pub fn containers(&self) -> Vec<ContainerDetails> {
        self.containers.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_pulls(&self) {
        self.fail_pull.store(true, Ordering::SeqCst);
    }

    pub fn fail_removes(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }

    /// Runs of `image` fail before anything is created.
    pub fn fail_run_of(&self, image: &str) {
        *self.fail_run_image.lock().unwrap() = Some(image.to_string());
    }

    /// Runs of `image` create the container but fail to start it, and the
    /// stopped container is left behind.
    pub fn fail_start_of(&self, image: &str) {
        *self.fail_start_image.lock().unwrap() = Some(image.to_string());
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connection("connection refused".into()))
        }
    }
}

pub struct FakeRuntime {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        let delay = *self.backend.ping_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.backend.reachable()
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
        self.backend.reachable()?;
        Ok(self
            .backend
            .containers()
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id,
                name: c.spec.name,
                image: c.spec.image,
                status: if c.running { "running" } else { "exited" }.to_string(),
                labels: c.spec.labels,
                created: c.created,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        self.backend.reachable()?;
        self.backend
            .containers()
            .into_iter()
            .find(|c| c.id == id || c.spec.name == id)
            .ok_or_else(|| Error::UpdateExecution(format!("no such container: {}", id)))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.backend.reachable()?;
        self.backend.record(format!("pull {}", image));
        if self.backend.fail_pull.load(Ordering::SeqCst) {
            return Err(Error::UpdateExecution(format!("manifest for {} not found", image)));
        }
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.backend.reachable()?;
        self.backend.record(format!("run {} {}", spec.name, spec.image));
        if self.backend.fail_run_image.lock().unwrap().as_deref() == Some(spec.image.as_str()) {
            return Err(Error::UpdateExecution(format!("cannot start {}", spec.image)));
        }
        let mut containers = self.backend.containers.lock().unwrap();
        if containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(Error::UpdateExecution(format!("name {} already in use", spec.name)));
        }
        let id = format!("new-{}", self.backend.next_id.fetch_add(1, Ordering::SeqCst));
        let starts =
            self.backend.fail_start_image.lock().unwrap().as_deref() != Some(spec.image.as_str());
        containers.push(ContainerDetails {
            id: id.clone(),
            running: starts,
            created: Utc::now(),
            spec: spec.clone(),
        });
        if !starts {
            return Err(Error::UpdateExecution(format!(
                "cannot start {}: port is already allocated",
                spec.name
            )));
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.backend.reachable()?;
        self.backend.record(format!("start {}", id));
        let mut containers = self.backend.containers.lock().unwrap();
        match containers.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(Error::UpdateExecution(format!("no such container: {}", id))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.backend.reachable()?;
        self.backend.record(format!("stop {}", id));
        for c in self.backend.containers.lock().unwrap().iter_mut() {
            if c.id == id {
                c.running = false;
            }
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.backend.reachable()?;
        self.backend.record(format!("remove {}", id));
        if self.backend.fail_remove.load(Ordering::SeqCst) {
            return Err(Error::UpdateExecution("removal in progress".to_string()));
        }
        self.backend.containers.lock().unwrap().retain(|c| c.id != id);
        Ok(())
    }
}

/// Hands out a new client per connect, backed by one shared
/// [`FakeBackend`] per address.
#[derive(Default)]
pub struct FakeConnector {
    backends: Mutex<HashMap<String, Arc<FakeBackend>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn backend(&self, address: &str) -> Arc<FakeBackend> {
        self.backends
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        self.backend(address).reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, address: &str, delay: Duration) {
        *self.backend(address).ping_delay.lock().unwrap() = Some(delay);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ContainerRuntime>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeRuntime {
            backend: self.backend(address),
        }))
    }
}

/// Registry answering from fixed tables, tracking concurrent calls.
#[derive(Default)]
pub struct FakeRegistry {
    tags: Mutex<HashMap<String, Vec<String>>>,
    timestamps: Mutex<HashMap<String, DateTime<Utc>>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn with_tags(self, repository: &str, tags: &[&str]) -> Self {
        self.tags.lock().unwrap().insert(
            repository.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn with_timestamp(self, repository: &str, tag: &str, at: DateTime<Utc>) -> Self {
        self.timestamps
            .lock()
            .unwrap()
            .insert(format!("{}:{}", repository, tag), at);
        self
    }

    pub fn failing(self, repository: &str) -> Self {
        self.failing.lock().unwrap().insert(repository.to_string());
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, image: &ImageRef) -> Result<InFlight<'_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&image.repository) {
            return Err(Error::RegistryQuery(format!("{}: 503 Service Unavailable", image)));
        }
        Ok(guard)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TagRegistry for FakeRegistry {
    fn supports(&self, image: &ImageRef) -> bool {
        image.is_default_registry()
    }

    async fn tag_last_updated(&self, image: &ImageRef) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.enter(image).await?;
        let key = format!("{}:{}", image.repository, image.tag);
        Ok(self.timestamps.lock().unwrap().get(&key).copied())
    }

    async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>> {
        let _guard = self.enter(image).await?;
        Ok(self
            .tags
            .lock()
            .unwrap()
            .get(&image.repository)
            .cloned()
            .unwrap_or_default())
    }
}

/// Compose runner that records calls and the manifest seen by `up`.
#[derive(Default)]
pub struct FakeCompose {
    pub fail_up: AtomicBool,
    calls: Mutex<Vec<String>>,
    manifests_at_up: Mutex<Vec<String>>,
    invocations: Mutex<Vec<ComposeInvocation>>,
}

impl FakeCompose {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn manifests_at_up(&self) -> Vec<String> {
        self.manifests_at_up.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> Vec<ComposeInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComposeRunner for FakeCompose {
    async fn pull(&self, invocation: &ComposeInvocation, service: &str) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(format!("pull {}", service));
        self.invocations.lock().unwrap().push(invocation.clone());
        Ok(CommandOutput {
            success: true,
            ..Default::default()
        })
    }

    async fn up(&self, invocation: &ComposeInvocation, service: &str) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(format!("up {}", service));
        let manifest = std::fs::read_to_string(&invocation.manifest).unwrap_or_default();
        self.manifests_at_up.lock().unwrap().push(manifest);
        if self.fail_up.load(Ordering::SeqCst) {
            return Ok(CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("service \"{}\" failed to start", service),
            });
        }
        Ok(CommandOutput {
            success: true,
            ..Default::default()
        })
    }
}

/// A container definition for seeding a [`FakeBackend`].
pub fn container(id: &str, name: &str, image: &str) -> ContainerDetails {
    ContainerDetails {
        id: id.to_string(),
        running: true,
        created: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
        spec: ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        },
    }
}
