//! Composr daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;

use composr::compose::ComposeCli;
use composr::config::Config;
use composr::detection::{ReportCache, UpdateChecker, CACHE_FILE};
use composr::executor::UpdateExecutor;
use composr::hosts::{HostManager, HostStore, HOSTS_FILE};
use composr::policy::{PolicyStore, POLICY_FILE};
use composr::registry::HubRegistryClient;
use composr::runtime::DockerConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;
    info!("Starting composr with config: {:?}", cfg);
    tokio::fs::create_dir_all(&cfg.metadata_dir).await?;

    let policy = Arc::new(PolicyStore::load(cfg.metadata_dir.join(POLICY_FILE))?);

    // Endpoints
    let hosts = Arc::new(HostManager::new(
        Arc::new(DockerConnector::new(cfg.docker_timeout_secs)),
        &cfg.seed_hosts(),
        Some(HostStore::new(cfg.metadata_dir.join(HOSTS_FILE))),
        cfg.probe_timeout(),
    )?);
    hosts.initialize().await;
    info!("Selected endpoint: {}", hosts.selected().await);
    let health_handle = hosts.spawn_health_monitor(cfg.health_check_interval());

    // Detection and execution
    let registry = Arc::new(HubRegistryClient::new(
        &cfg.registry_url,
        cfg.registry_timeout(),
    )?);
    let checker = Arc::new(UpdateChecker::new(
        registry,
        Arc::clone(&policy),
        ReportCache::load(cfg.metadata_dir.join(CACHE_FILE)),
    ));
    let compose = Arc::new(ComposeCli::new(
        cfg.compose_command.clone(),
        cfg.compose_timeout(),
    )?);
    let executor = Arc::new(UpdateExecutor::new(
        Arc::clone(&hosts),
        Arc::clone(&policy),
        compose,
    ));

    // Periodic maintenance
    let maintenance_handle = tokio::spawn(async move {
        loop {
            let current = policy.get().await;
            if current.auto_check_enabled {
                if current.auto_update_enabled || current.scheduled_repull_enabled {
                    let summary = executor.perform_auto_updates(&checker).await;
                    if summary.errors > 0 {
                        error!("Maintenance finished with {} errors", summary.errors);
                    }
                } else {
                    checker.run(&hosts).await;
                }
            }
            let hours = current.check_interval_hours.max(1);
            tokio::time::sleep(Duration::from_secs(hours * 3600)).await;
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    health_handle.abort();
    maintenance_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
