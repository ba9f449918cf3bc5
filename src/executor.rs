//! Applying updates.
//!
//! Compose services are updated by retagging the service in its manifest
//! (after a backup) and asking the orchestrator to pull and recreate that
//! one service.  Standalone containers are pulled, stopped, removed and
//! recreated from their inspected configuration under the same name.
//!
//! Work against one compose project on one endpoint is serialized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::compose::{
    backup_manifest, restore_manifest, set_service_image, ComposeInvocation, ComposeRunner,
};
use crate::detection::{collect_containers, UpdateChecker};
use crate::error::{Error, Result};
use crate::hosts::HostManager;
use crate::image_ref::with_tag;
use crate::policy::{PolicyStore, UpdatePolicy};
use crate::runtime::{ContainerDetails, ContainerRuntime, ContainerSpec};
use crate::types::{
    report_key, ComposeAssociation, ContainerSnapshot, EndpointKind, MaintenanceSummary,
    UpdateCheckResult, UpdateOutcome, COMPOSE_PROJECT_LABEL,
};
use crate::version::is_safe_update;

/// True when `result` may be applied without anyone approving it: auto
/// updates are on, the tag is not filtered out, and the candidate is a
/// patch-level bump of the current tag.
pub fn auto_update_eligible(
    policy: &UpdatePolicy,
    container: &ContainerSnapshot,
    result: &UpdateCheckResult,
) -> bool {
    if !policy.auto_update_enabled || !result.update_available {
        return false;
    }
    let tag = &container.image_ref.tag;
    if policy.is_skipped(tag) || !policy.allows_auto_update_tag(tag) {
        return false;
    }
    match &result.candidate_tag {
        Some(candidate) => is_safe_update(&result.current_tag, candidate),
        None => false,
    }
}

/// True when the container's mutable tag is due to be pulled again.
pub fn scheduled_repull_eligible(
    policy: &UpdatePolicy,
    container: &ContainerSnapshot,
    last_repull: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let tag = &container.image_ref.tag;
    if !policy.scheduled_repull_enabled || policy.is_skipped(tag) || !policy.is_repull_tag(tag) {
        return false;
    }
    let interval = ChronoDuration::hours(policy.repull_interval_hours as i64);
    match last_repull {
        Some(at) => now - at >= interval,
        None => true,
    }
}

/// Which image a recreate should run.
enum Target<'a> {
    Tag(&'a str),
    SameImage,
}

pub struct UpdateExecutor {
    hosts: Arc<HostManager>,
    policy: Arc<PolicyStore>,
    compose: Arc<dyn ComposeRunner>,
    project_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    last_repull: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl UpdateExecutor {
    pub fn new(
        hosts: Arc<HostManager>,
        policy: Arc<PolicyStore>,
        compose: Arc<dyn ComposeRunner>,
    ) -> Self {
        Self {
            hosts,
            policy,
            compose,
            project_locks: Mutex::new(HashMap::new()),
            last_repull: Mutex::new(HashMap::new()),
        }
    }

    /// Moves a container to `target_tag`.  Failures are reported in the
    /// outcome, never dropped.
    pub async fn apply_update(
        &self,
        container_id: &str,
        endpoint: &str,
        target_tag: &str,
    ) -> UpdateOutcome {
        info!("Updating container {} on {} to {}", container_id, endpoint, target_tag);
        self.execute(container_id, endpoint, Target::Tag(target_tag)).await
    }

    /// Pulls the container's current image again and recreates it.
    pub async fn repull_container(&self, container_id: &str, endpoint: &str) -> UpdateOutcome {
        info!("Repulling container {} on {}", container_id, endpoint);
        let outcome = self.execute(container_id, endpoint, Target::SameImage).await;
        if outcome.success {
            self.last_repull
                .lock()
                .await
                .insert(report_key(endpoint, &outcome.container), Utc::now());
        }
        outcome
    }

    pub async fn last_repull(&self, container: &ContainerSnapshot) -> Option<DateTime<Utc>> {
        self.last_repull
            .lock()
            .await
            .get(&container.report_key())
            .copied()
    }

    async fn execute(&self, container_id: &str, endpoint: &str, target: Target<'_>) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::new(container_id, endpoint);
        let client = match self.hosts.get_handle(Some(endpoint)).await {
            Some(client) => client,
            None => {
                outcome.error = Some(
                    Error::Connection(format!("endpoint {} not available", endpoint)).to_string(),
                );
                return outcome;
            }
        };

        let details = match client.inspect_container(container_id).await {
            Ok(details) => details,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        outcome.container = details.spec.name.clone();
        outcome.old_image = Some(details.spec.image.clone());
        outcome.new_image = Some(match &target {
            Target::Tag(tag) => with_tag(&details.spec.image, tag),
            Target::SameImage => details.spec.image.clone(),
        });

        let policy = self.policy.get().await;
        let result = match ComposeAssociation::from_labels(&details.spec.labels) {
            Some(compose) => {
                self.execute_compose(&*client, endpoint, &compose, &target, &policy, &mut outcome)
                    .await
            }
            // compose-managed, but not recreatable through the orchestrator
            None if details.spec.labels.contains_key(COMPOSE_PROJECT_LABEL) => {
                Err(Error::UpdateExecution(format!(
                    "missing compose metadata for {}",
                    outcome.container
                )))
            }
            None => {
                self.execute_standalone(&*client, &details, &policy, &mut outcome)
                    .await
            }
        };

        match result {
            Ok(()) => {
                outcome.success = true;
                info!(
                    "Updated {} on {}: {} -> {}",
                    outcome.container,
                    endpoint,
                    outcome.old_image.as_deref().unwrap_or("?"),
                    outcome.new_image.as_deref().unwrap_or("?")
                );
            }
            Err(e) => {
                error!("Update of {} on {} failed: {}", outcome.container, endpoint, e);
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    async fn lock_project(&self, endpoint: &str, project: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.project_locks.lock().await;
            Arc::clone(
                locks
                    .entry((endpoint.to_string(), project.to_string()))
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    async fn execute_compose(
        &self,
        client: &dyn ContainerRuntime,
        endpoint: &str,
        compose: &ComposeAssociation,
        target: &Target<'_>,
        policy: &UpdatePolicy,
        outcome: &mut UpdateOutcome,
    ) -> Result<()> {
        let manifest = compose.manifest_path.as_path();
        if !tokio::fs::try_exists(manifest).await? {
            return Err(Error::Configuration(format!(
                "compose file not found: {}",
                manifest.display()
            )));
        }
        let _project = self.lock_project(endpoint, &compose.project).await;
        let invocation = self.invocation(endpoint, compose).await;

        let tag = match target {
            Target::Tag(tag) => *tag,
            Target::SameImage => {
                self.deploy(&invocation, &compose.service).await?;
                outcome.new_container_id = find_container(client, &outcome.container).await;
                outcome.message = Some(format!("Successfully repulled {}", compose.service));
                return Ok(());
            }
        };

        let backup = if policy.backup_before_update {
            let backup = backup_manifest(manifest).await?;
            outcome.backup_path = Some(backup.clone());
            Some(backup)
        } else {
            None
        };

        // a failed rewrite leaves the manifest untouched, nothing to roll back
        let change = set_service_image(manifest, &compose.service, tag).await?;
        outcome.old_image = Some(change.old_image);
        outcome.new_image = Some(change.new_image);

        if let Err(e) = self.deploy(&invocation, &compose.service).await {
            if let (true, Some(backup)) = (policy.rollback_on_failure, &backup) {
                outcome.rolled_back = rollback_manifest(backup, manifest).await;
            }
            return Err(e);
        }
        outcome.new_container_id = find_container(client, &outcome.container).await;
        outcome.message = Some(format!(
            "Successfully updated and restarted {}",
            compose.service
        ));
        Ok(())
    }

    async fn invocation(&self, endpoint: &str, compose: &ComposeAssociation) -> ComposeInvocation {
        let docker_host = match self.hosts.endpoint_config(endpoint).await {
            Some(config) if config.kind == EndpointKind::Remote => Some(config.address),
            _ => None,
        };
        ComposeInvocation {
            manifest: compose.manifest_path.clone(),
            working_dir: compose
                .working_dir
                .clone()
                .or_else(|| compose.manifest_path.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from(".")),
            project: compose.project.clone(),
            docker_host,
        }
    }

    async fn deploy(&self, invocation: &ComposeInvocation, service: &str) -> Result<()> {
        let pulled = self.compose.pull(invocation, service).await?;
        if !pulled.success {
            warn!("Pull warnings for {}: {}", service, pulled.stderr.trim());
        }
        let up = self.compose.up(invocation, service).await?;
        if !up.success {
            return Err(Error::UpdateExecution(format!(
                "deploy failed: {}",
                up.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn execute_standalone(
        &self,
        client: &dyn ContainerRuntime,
        details: &ContainerDetails,
        policy: &UpdatePolicy,
        outcome: &mut UpdateOutcome,
    ) -> Result<()> {
        let new_image = outcome
            .new_image
            .clone()
            .unwrap_or_else(|| details.spec.image.clone());
        client.pull_image(&new_image).await.map_err(|e| {
            Error::UpdateExecution(format!("failed to pull image {}: {}", new_image, e))
        })?;

        if details.running {
            client.stop_container(&details.id).await?;
        }
        if let Err(e) = client.remove_container(&details.id).await {
            if details.running {
                match client.start_container(&details.id).await {
                    Ok(()) => {
                        outcome.rolled_back = true;
                        info!("Restarted {} after failed removal", details.spec.name);
                    }
                    Err(start) => error!("Failed to restart {}: {}", details.spec.name, start),
                }
            }
            return Err(Error::UpdateExecution(format!(
                "failed to remove {}: {}",
                details.spec.name, e
            )));
        }

        let spec = ContainerSpec {
            image: new_image.clone(),
            ..details.spec.clone()
        };
        match client.run_container(&spec).await {
            Ok(id) => {
                outcome.new_container_id = Some(id);
                outcome.message = Some(format!(
                    "Successfully updated {} to {}",
                    spec.name, new_image
                ));
                Ok(())
            }
            Err(e) => {
                if policy.rollback_on_failure {
                    warn!("Recreating {} from {} after failure", spec.name, details.spec.image);
                    // a container that failed to start can still hold the name
                    if let Some(leftover) = find_container(client, &spec.name).await {
                        if let Err(e) = client.remove_container(&leftover).await {
                            warn!("Failed to remove leftover container {}: {}", leftover, e);
                        }
                    }
                    match client.run_container(&details.spec).await {
                        Ok(id) => {
                            outcome.rolled_back = true;
                            outcome.new_container_id = Some(id);
                        }
                        Err(e) => error!("Rollback of {} failed: {}", spec.name, e),
                    }
                }
                Err(Error::UpdateExecution(format!(
                    "failed to recreate {}: {}",
                    spec.name, e
                )))
            }
        }
    }

    /// Collects and checks every container, then applies safe updates and
    /// due repulls.
    pub async fn perform_auto_updates(&self, checker: &UpdateChecker) -> MaintenanceSummary {
        info!("Performing automatic updates and scheduled repulls...");
        let mut summary = MaintenanceSummary::default();
        let containers = collect_containers(&self.hosts).await;
        if containers.is_empty() {
            summary.timestamp = Some(Utc::now());
            return summary;
        }
        let report = checker.check_all(containers.clone()).await;
        let policy = self.policy.get().await;

        for container in &containers {
            let result = report.results.get(&container.report_key());
            let outcome = match result {
                Some(result) if auto_update_eligible(&policy, container, result) => {
                    let candidate = result.candidate_tag.as_deref().unwrap_or(&result.current_tag);
                    let outcome = self
                        .apply_update(&container.id, &container.endpoint_name, candidate)
                        .await;
                    if outcome.success {
                        summary.auto_updates += 1;
                    }
                    outcome
                }
                _ => {
                    let last = self.last_repull(container).await;
                    if !scheduled_repull_eligible(&policy, container, last, Utc::now()) {
                        continue;
                    }
                    let outcome = self
                        .repull_container(&container.id, &container.endpoint_name)
                        .await;
                    if outcome.success {
                        summary.repulls += 1;
                    }
                    outcome
                }
            };
            if !outcome.success {
                summary.errors += 1;
            }
        }

        summary.timestamp = Some(Utc::now());
        if summary.auto_updates > 0 || summary.repulls > 0 || summary.errors > 0 {
            info!(
                "Automatic maintenance completed: {} updates, {} repulls, {} errors",
                summary.auto_updates, summary.repulls, summary.errors
            );
        }
        summary
    }
}

async fn rollback_manifest(backup: &Path, manifest: &Path) -> bool {
    match restore_manifest(backup, manifest).await {
        Ok(()) => true,
        Err(e) => {
            error!(
                "Rollback of {} failed, backup left at {}: {}",
                manifest.display(),
                backup.display(),
                e
            );
            false
        }
    }
}

/// Id of the container now running under `name`, if it can be found.
async fn find_container(client: &dyn ContainerRuntime, name: &str) -> Option<String> {
    client
        .list_containers(true)
        .await
        .ok()?
        .into_iter()
        .find(|c| c.name == name)
        .map(|c| c.id)
}
