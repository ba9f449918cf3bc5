use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::DOCKER_HUB_URL;
use crate::types::LOCAL_ENDPOINT;

pub const DEFAULT_LOCAL_ADDRESS: &str = "unix:///var/run/docker.sock";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding saved endpoints, the policy and the report cache.
    pub metadata_dir: PathBuf,
    /// Seed endpoints as `name=address` pairs separated by commas.
    /// Addresses use `unix://`, `tcp://` or `http://`; TLS is not supported.
    pub docker_hosts: String,
    pub health_check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub docker_timeout_secs: u64,
    pub registry_url: String,
    pub registry_timeout_secs: u64,
    pub compose_command: Vec<String>,
    pub compose_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("/app"),
            docker_hosts: format!("{}={}", LOCAL_ENDPOINT, DEFAULT_LOCAL_ADDRESS),
            health_check_interval_secs: 30,
            probe_timeout_secs: 5,
            docker_timeout_secs: 120,
            registry_url: DOCKER_HUB_URL.into(),
            registry_timeout_secs: 10,
            compose_command: vec!["docker".into(), "compose".into()],
            compose_timeout_secs: 300,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("composr.toml"))
            .merge(Json::file("composr.json"))
            .merge(Env::prefixed("COMPOSR_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // The conventional variables win over the prefixed ones
        if let Ok(hosts) = std::env::var("DOCKER_HOSTS") {
            config.docker_hosts = hosts;
        }
        if let Ok(dir) = std::env::var("METADATA_DIR") {
            config.metadata_dir = PathBuf::from(dir);
        }

        if config.compose_command.is_empty() {
            return Err(anyhow::anyhow!("compose_command must not be empty"));
        }

        Ok(config)
    }

    pub fn seed_hosts(&self) -> BTreeMap<String, String> {
        parse_hosts(&self.docker_hosts)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn compose_timeout(&self) -> Duration {
        Duration::from_secs(self.compose_timeout_secs)
    }
}

/// Parses `name=address,name=address`.  Entries without `=` are ignored.
pub fn parse_hosts(spec: &str) -> BTreeMap<String, String> {
    spec.split(',')
        .filter_map(|entry| entry.split_once('='))
        .map(|(name, address)| (name.trim().to_string(), address.trim().to_string()))
        .filter(|(name, address)| !name.is_empty() && !address.is_empty())
        .collect()
}
