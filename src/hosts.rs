//! Connection registry for container-runtime endpoints.
//!
//! [`HostManager`] keeps one runtime client per configured endpoint and
//! answers "give me a client for endpoint X".  A background health check
//! probes every endpoint on a fixed interval, marks unreachable ones as
//! disconnected (keeping their configuration so they are retried) and
//! gives recovered ones a freshly created client.
//!
//! All mutation of the endpoint map goes through a single mutation lock,
//! shared by add/remove/switch and the health check.  Network probes run
//! before that lock is taken, so a slow endpoint never stalls the others.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::config::DEFAULT_LOCAL_ADDRESS;
use crate::error::{Error, Result};
use crate::runtime::{Connector, ContainerRuntime};
use crate::types::{EndpointConfig, EndpointKind, EndpointStatus, LOCAL_ENDPOINT};

pub const HOSTS_FILE: &str = "docker_hosts.json";

/// JSON file holding the endpoints added at runtime.
pub struct HostStore {
    path: PathBuf,
}

impl HostStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<BTreeMap<String, EndpointConfig>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn save(&self, endpoints: &BTreeMap<String, EndpointConfig>) -> Result<()> {
        let json = serde_json::to_string_pretty(endpoints)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

struct Endpoint {
    config: EndpointConfig,
    connected: bool,
    last_health_check: Option<DateTime<Utc>>,
    client: Option<Arc<dyn ContainerRuntime>>,
}

impl Endpoint {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            connected: false,
            last_health_check: None,
            client: None,
        }
    }
}

struct State {
    endpoints: BTreeMap<String, Endpoint>,
    selected: String,
    /// Endpoints that came from the seed list; never written to the store.
    seeded: BTreeSet<String>,
}

impl State {
    fn status(&self, endpoint: &Endpoint) -> EndpointStatus {
        EndpointStatus {
            name: endpoint.config.name.clone(),
            address: endpoint.config.address.clone(),
            kind: endpoint.config.kind,
            display_name: endpoint.config.display_name.clone(),
            connected: endpoint.connected,
            last_health_check: endpoint.last_health_check,
            is_selected: endpoint.config.name == self.selected,
        }
    }

    fn persisted(&self) -> BTreeMap<String, EndpointConfig> {
        self.endpoints
            .iter()
            .filter(|(name, _)| !self.seeded.contains(*name))
            .map(|(name, ep)| (name.clone(), ep.config.clone()))
            .collect()
    }
}

/// Result of probing one endpoint, computed outside the mutation lock.
struct Probe {
    name: String,
    address: String,
    outcome: Result<Arc<dyn ContainerRuntime>>,
}

pub struct HostManager {
    connector: Arc<dyn Connector>,
    store: Option<HostStore>,
    probe_timeout: Duration,
    state: RwLock<State>,
    mutation: Mutex<()>,
}

fn endpoint_config(name: &str, address: &str, display_name: Option<&str>) -> EndpointConfig {
    EndpointConfig {
        name: name.to_string(),
        address: address.to_string(),
        kind: if name == LOCAL_ENDPOINT {
            EndpointKind::Local
        } else {
            EndpointKind::Remote
        },
        display_name: display_name
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(name)
            .to_string(),
        added_at: Utc::now(),
    }
}

impl HostManager {
    /// Builds the registry from the seed list plus any saved endpoints.
    /// Every endpoint starts disconnected; call [`HostManager::initialize`]
    /// or wait for the first health check to connect.
    pub fn new(
        connector: Arc<dyn Connector>,
        seed: &BTreeMap<String, String>,
        store: Option<HostStore>,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let mut endpoints = BTreeMap::new();
        for (name, address) in seed {
            endpoints.insert(name.clone(), Endpoint::new(endpoint_config(name, address, None)));
        }
        let mut seeded: BTreeSet<String> = seed.keys().cloned().collect();
        if !endpoints.contains_key(LOCAL_ENDPOINT) {
            endpoints.insert(
                LOCAL_ENDPOINT.to_string(),
                Endpoint::new(endpoint_config(LOCAL_ENDPOINT, DEFAULT_LOCAL_ADDRESS, None)),
            );
            seeded.insert(LOCAL_ENDPOINT.to_string());
        }

        if let Some(store) = &store {
            for (name, config) in store.load()? {
                if endpoints.contains_key(&name) {
                    debug!("Saved endpoint {} shadowed by seed list", name);
                    continue;
                }
                endpoints.insert(name, Endpoint::new(config));
            }
        }

        Ok(Self {
            connector,
            store,
            probe_timeout,
            state: RwLock::new(State {
                endpoints,
                selected: LOCAL_ENDPOINT.to_string(),
                seeded,
            }),
            mutation: Mutex::new(()),
        })
    }

    /// Runs the first health check so clients exist before first use.
    pub async fn initialize(&self) {
        self.run_health_check().await;
        for status in self.list_statuses().await {
            if status.connected {
                info!("Connected to endpoint {} ({})", status.name, status.address);
            } else {
                warn!("Endpoint {} ({}) is unreachable", status.name, status.address);
            }
        }
    }

    /// Connects to `address`, checks it answers, and registers it as `name`.
    /// Nothing is stored when the endpoint cannot be reached.
    pub async fn add_endpoint(
        &self,
        name: &str,
        address: &str,
        description: Option<&str>,
    ) -> Result<EndpointStatus> {
        let name = name.trim();
        let address = address.trim();
        if name.is_empty() || address.is_empty() {
            return Err(Error::Configuration(
                "endpoint name and address are required".to_string(),
            ));
        }
        if self.state.read().await.endpoints.contains_key(name) {
            return Err(Error::Configuration(format!("endpoint '{}' already exists", name)));
        }

        let client = self.probe(address, None).await.map_err(|e| match e {
            Error::Configuration(_) => e,
            e => Error::Connection(format!("cannot reach '{}' at {}: {}", name, address, e)),
        })?;

        let _guard = self.mutation.lock().await;
        let mut state = self.state.write().await;
        // re-check: another add may have won while we were probing
        if state.endpoints.contains_key(name) {
            return Err(Error::Configuration(format!("endpoint '{}' already exists", name)));
        }

        let mut endpoint = Endpoint::new(endpoint_config(name, address, description));
        endpoint.connected = true;
        endpoint.last_health_check = Some(Utc::now());
        endpoint.client = Some(client);

        if let Some(store) = &self.store {
            let mut persisted = state.persisted();
            persisted.insert(name.to_string(), endpoint.config.clone());
            store.save(&persisted).await?;
        }

        let status = state.status(&endpoint);
        state.endpoints.insert(name.to_string(), endpoint);
        info!("Added endpoint '{}' at {}", name, address);
        Ok(status)
    }

    pub async fn remove_endpoint(&self, name: &str) -> Result<()> {
        if name == LOCAL_ENDPOINT {
            return Err(Error::Configuration("the local endpoint cannot be removed".to_string()));
        }

        let _guard = self.mutation.lock().await;
        let mut state = self.state.write().await;
        if !state.endpoints.contains_key(name) {
            return Err(Error::Configuration(format!("endpoint '{}' not found", name)));
        }

        if let Some(store) = &self.store {
            let mut persisted = state.persisted();
            persisted.remove(name);
            store.save(&persisted).await?;
        }

        state.endpoints.remove(name);
        state.seeded.remove(name);
        if state.selected == name {
            state.selected = LOCAL_ENDPOINT.to_string();
            info!("Selected endpoint '{}' removed, falling back to local", name);
        }
        info!("Removed endpoint '{}'", name);
        Ok(())
    }

    /// Makes `name` the default endpoint.  It must be connected.
    pub async fn switch_selected(&self, name: &str) -> Result<EndpointStatus> {
        let _guard = self.mutation.lock().await;
        let mut state = self.state.write().await;
        let connected = match state.endpoints.get(name) {
            Some(ep) => ep.connected,
            None => return Err(Error::Configuration(format!("endpoint '{}' not found", name))),
        };
        if !connected {
            return Err(Error::Connection(format!("endpoint '{}' is not connected", name)));
        }
        state.selected = name.to_string();
        info!("Switched selected endpoint to '{}'", name);
        let endpoint = &state.endpoints[name];
        Ok(state.status(endpoint))
    }

    /// Client for `name`, or for the selected endpoint when `name` is
    /// `None`.  Unknown and disconnected endpoints yield `None`.
    pub async fn get_handle(&self, name: Option<&str>) -> Option<Arc<dyn ContainerRuntime>> {
        let state = self.state.read().await;
        let name = name.unwrap_or(&state.selected);
        state
            .endpoints
            .get(name)
            .filter(|ep| ep.connected)
            .and_then(|ep| ep.client.clone())
    }

    pub async fn selected(&self) -> String {
        self.state.read().await.selected.clone()
    }

    pub async fn endpoint_config(&self, name: &str) -> Option<EndpointConfig> {
        self.state
            .read()
            .await
            .endpoints
            .get(name)
            .map(|ep| ep.config.clone())
    }

    pub async fn list_statuses(&self) -> Vec<EndpointStatus> {
        let state = self.state.read().await;
        state.endpoints.values().map(|ep| state.status(ep)).collect()
    }

    /// Name and client of every currently connected endpoint.
    pub async fn connected_handles(&self) -> Vec<(String, Arc<dyn ContainerRuntime>)> {
        let state = self.state.read().await;
        state
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.connected)
            .filter_map(|(name, ep)| ep.client.clone().map(|c| (name.clone(), c)))
            .collect()
    }

    /// Pings `existing`, or a newly created client when there is none.
    async fn probe(
        &self,
        address: &str,
        existing: Option<Arc<dyn ContainerRuntime>>,
    ) -> Result<Arc<dyn ContainerRuntime>> {
        let client = match existing {
            Some(client) => client,
            None => self.connector.connect(address).await?,
        };
        match timeout(self.probe_timeout, client.ping()).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Connection(format!(
                "no answer within {}s",
                self.probe_timeout.as_secs_f32()
            ))),
        }
    }

    /// One health-check cycle over every configured endpoint.
    pub async fn run_health_check(&self) {
        let targets: Vec<(String, String, Option<Arc<dyn ContainerRuntime>>)> = {
            let state = self.state.read().await;
            state
                .endpoints
                .values()
                .map(|ep| (ep.config.name.clone(), ep.config.address.clone(), ep.client.clone()))
                .collect()
        };

        let probes = join_all(targets.into_iter().map(|(name, address, client)| async move {
            let outcome = self.probe(&address, client).await;
            Probe {
                name,
                address,
                outcome,
            }
        }))
        .await;

        let _guard = self.mutation.lock().await;
        let mut state = self.state.write().await;
        let now = Utc::now();
        for probe in probes {
            let endpoint = match state.endpoints.get_mut(&probe.name) {
                Some(ep) if ep.config.address == probe.address => ep,
                // removed or replaced while we were probing
                _ => continue,
            };
            endpoint.last_health_check = Some(now);
            match probe.outcome {
                Ok(client) => {
                    if !endpoint.connected {
                        info!("Endpoint '{}' is reachable", probe.name);
                    }
                    endpoint.connected = true;
                    endpoint.client = Some(client);
                }
                Err(e) => {
                    if endpoint.connected {
                        warn!("Endpoint '{}' became unreachable: {}", probe.name, e);
                    } else {
                        debug!("Endpoint '{}' still unreachable: {}", probe.name, e);
                    }
                    endpoint.connected = false;
                    endpoint.client = None;
                }
            }
        }
    }

    /// Spawns the health-check loop.  It runs until the handle is aborted;
    /// the first cycle starts one period from now.
    pub fn spawn_health_monitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.run_health_check().await;
            }
        })
    }
}
