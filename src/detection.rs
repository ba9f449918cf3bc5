//! Update detection across every connected endpoint.
//!
//! Each container is checked on its own: mutable tags by comparing the
//! registry's push time with the container's creation time, semantic
//! tags by looking for a newer version in the registry's tag list.  A
//! failing check is recorded against that container only.  Checks run on
//! a bounded pool and the finished report replaces the cached one in a
//! single swap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::hosts::HostManager;
use crate::image_ref::ImageRef;
use crate::policy::{PolicyStore, UpdatePolicy};
use crate::registry::TagRegistry;
use crate::types::{
    CheckMethod, ComposeAssociation, ContainerSnapshot, UpdateCheckResult, UpdateReport,
};
use crate::version::{classify_tag, find_latest_version, TagKind};

pub const CACHE_FILE: &str = "container_updates_cache.json";

/// The last finished report, optionally mirrored to disk.
pub struct ReportCache {
    current: RwLock<Arc<UpdateReport>>,
    path: Option<PathBuf>,
}

impl ReportCache {
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Arc::new(UpdateReport::default())),
            path: None,
        }
    }

    /// Loads the cached report from `path`.  A missing or unreadable file
    /// starts from an empty report.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let report = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring unreadable update cache {}: {}", path.display(), e);
                UpdateReport::default()
            }),
            Err(_) => UpdateReport::default(),
        };
        Self {
            current: RwLock::new(Arc::new(report)),
            path: Some(path),
        }
    }

    pub async fn get(&self) -> Arc<UpdateReport> {
        Arc::clone(&*self.current.read().await)
    }

    async fn replace(&self, report: Arc<UpdateReport>) {
        if let Some(path) = &self.path {
            if let Err(e) = write_cache(path, &report).await {
                error!("Failed to save update cache: {}", e);
            }
        }
        *self.current.write().await = report;
    }
}

async fn write_cache(path: &Path, report: &UpdateReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

pub struct UpdateChecker {
    registry: Arc<dyn TagRegistry>,
    policy: Arc<PolicyStore>,
    cache: ReportCache,
}

impl UpdateChecker {
    pub fn new(registry: Arc<dyn TagRegistry>, policy: Arc<PolicyStore>, cache: ReportCache) -> Self {
        Self {
            registry,
            policy,
            cache,
        }
    }

    /// The most recent complete report.
    pub async fn cached_report(&self) -> Arc<UpdateReport> {
        self.cache.get().await
    }

    /// Collects containers from every connected endpoint and checks them.
    pub async fn run(&self, hosts: &HostManager) -> Arc<UpdateReport> {
        let containers = collect_containers(hosts).await;
        self.check_all(containers).await
    }

    pub async fn check_all(&self, containers: Vec<ContainerSnapshot>) -> Arc<UpdateReport> {
        let policy = self.policy.get().await;
        let workers = policy.workers_for(containers.len());
        info!(
            "Checking for updates on {} containers ({} at a time)",
            containers.len(),
            workers
        );

        let mut report = UpdateReport {
            total_checked: containers.len(),
            ..Default::default()
        };
        let policy = &policy;
        let mut results = stream::iter(containers)
            .map(|container| async move {
                let result = self.check_container(policy, &container).await;
                (container.report_key(), result)
            })
            .buffer_unordered(workers);

        while let Some((key, result)) = results.next().await {
            if result.method == CheckMethod::Error {
                report.check_errors += 1;
            }
            if result.update_available {
                report.updates_available += 1;
            }
            report.results.insert(key, result);
        }
        report.last_check = Some(Utc::now());

        info!(
            "Update check complete: {} updates available, {} errors",
            report.updates_available, report.check_errors
        );
        let report = Arc::new(report);
        self.cache.replace(Arc::clone(&report)).await;
        report
    }

    /// Checks one container.  Never fails; errors become `method=error`.
    pub async fn check_container(
        &self,
        policy: &UpdatePolicy,
        container: &ContainerSnapshot,
    ) -> UpdateCheckResult {
        let image = &container.image_ref;
        if image.is_unknown() {
            return UpdateCheckResult::new(CheckMethod::Skipped, &image.tag)
                .with_reason("unparseable_image");
        }
        if policy.is_skipped(&image.tag) {
            return UpdateCheckResult::new(CheckMethod::Skipped, &image.tag)
                .with_reason("skipped_by_settings");
        }

        let checked = match classify_tag(&image.tag) {
            TagKind::Mutable => self.check_timestamp(container).await,
            TagKind::Semantic => self.check_versions(image).await,
            TagKind::Generic => Ok(UpdateCheckResult::new(CheckMethod::GenericTagNoCheck, &image.tag)
                .with_reason("generic_tag_no_check")),
        };
        checked.unwrap_or_else(|e| {
            debug!("Update check failed for {}: {}", container.report_key(), e);
            UpdateCheckResult::failed(&image.tag, e)
        })
    }

    async fn check_timestamp(&self, container: &ContainerSnapshot) -> Result<UpdateCheckResult> {
        let image = &container.image_ref;
        if !self.registry.supports(image) {
            return Ok(unsupported(image));
        }
        let mut result = UpdateCheckResult::new(CheckMethod::RegistryTimestamp, &image.tag);
        match self.registry.tag_last_updated(image).await? {
            Some(remote) => {
                result.update_available = remote > container.created_at;
                result.remote_updated = Some(remote);
                if result.update_available {
                    result.candidate_tag = Some(image.tag.clone());
                }
            }
            None => result.reason = Some("no_timestamp_data".to_string()),
        }
        Ok(result)
    }

    async fn check_versions(&self, image: &ImageRef) -> Result<UpdateCheckResult> {
        if !self.registry.supports(image) {
            return Ok(unsupported(image));
        }
        let tags = self.registry.list_tags(image).await?;
        let mut result = UpdateCheckResult::new(CheckMethod::VersionComparison, &image.tag);
        if tags.is_empty() {
            result.reason = Some("could_not_fetch_tags".to_string());
            return Ok(result);
        }
        if let Some(latest) = find_latest_version(&tags, &image.tag) {
            result.update_available = true;
            result.candidate_tag = Some(latest.to_string());
        }
        Ok(result)
    }
}

fn unsupported(image: &ImageRef) -> UpdateCheckResult {
    UpdateCheckResult::new(CheckMethod::Skipped, &image.tag).with_reason("registry_not_supported")
}

/// Lists every container (stopped ones included) on every connected
/// endpoint.  An endpoint that fails to answer is logged and skipped.
pub async fn collect_containers(hosts: &HostManager) -> Vec<ContainerSnapshot> {
    let mut all = Vec::new();
    for (endpoint, client) in hosts.connected_handles().await {
        match client.list_containers(true).await {
            Ok(containers) => {
                debug!("{} containers on {}", containers.len(), endpoint);
                all.extend(containers.into_iter().map(|c| ContainerSnapshot {
                    image_ref: ImageRef::parse(&c.image),
                    compose: ComposeAssociation::from_labels(&c.labels),
                    id: c.id,
                    name: c.name,
                    endpoint_name: endpoint.clone(),
                    status: c.status,
                    raw_image: c.image,
                    created_at: c.created,
                }));
            }
            Err(e) => error!("Failed to get containers from endpoint {}: {}", endpoint, e),
        }
    }
    all
}
