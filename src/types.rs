//! Data structures shared across the crate.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and are
//! what the web layer receives from the host manager and the update
//! engines: endpoint statuses, per-container check results, the batch
//! report and update outcomes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::image_ref::ImageRef;

/// Name of the endpoint that always exists and can never be removed.
pub const LOCAL_ENDPOINT: &str = "local";

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_CONFIG_FILES_LABEL: &str = "com.docker.compose.project.config_files";
pub const COMPOSE_WORKING_DIR_LABEL: &str = "com.docker.compose.project.working_dir";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Local,
    Remote,
}

/// Identity of a configured container-runtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub address: String,
    pub kind: EndpointKind,
    pub display_name: String,
    pub added_at: DateTime<Utc>,
}

/// Point-in-time view of one endpoint, as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,
    pub address: String,
    pub kind: EndpointKind,
    pub display_name: String,
    pub connected: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub is_selected: bool,
}

/// Compose metadata found on a container's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeAssociation {
    pub project: String,
    pub service: String,
    pub manifest_path: PathBuf,
    pub working_dir: Option<PathBuf>,
}

impl ComposeAssociation {
    /// Reads the compose labels.  `None` unless project, service and
    /// config file are all present.
    pub fn from_labels(labels: &HashMap<String, String>) -> Option<Self> {
        let project = labels.get(COMPOSE_PROJECT_LABEL).filter(|v| !v.is_empty())?;
        let service = labels.get(COMPOSE_SERVICE_LABEL).filter(|v| !v.is_empty())?;
        // config_files may list several files; the first one declares the service
        let manifest = labels
            .get(COMPOSE_CONFIG_FILES_LABEL)
            .and_then(|v| v.split(',').map(str::trim).find(|p| !p.is_empty()))?;
        Some(Self {
            project: project.clone(),
            service: service.clone(),
            manifest_path: PathBuf::from(manifest),
            working_dir: labels
                .get(COMPOSE_WORKING_DIR_LABEL)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        })
    }
}

/// A container as seen during one detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub endpoint_name: String,
    pub status: String,
    pub raw_image: String,
    pub image_ref: ImageRef,
    pub compose: Option<ComposeAssociation>,
    pub created_at: DateTime<Utc>,
}

impl ContainerSnapshot {
    /// Key under which this container's result is stored in a report.
    pub fn report_key(&self) -> String {
        report_key(&self.endpoint_name, &self.name)
    }
}

pub fn report_key(endpoint: &str, container: &str) -> String {
    format!("{}:{}", endpoint, container)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMethod {
    RegistryTimestamp,
    VersionComparison,
    Skipped,
    GenericTagNoCheck,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckResult {
    pub update_available: bool,
    pub method: CheckMethod,
    pub current_tag: String,
    pub candidate_tag: Option<String>,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateCheckResult {
    pub fn new(method: CheckMethod, current_tag: &str) -> Self {
        Self {
            update_available: false,
            method,
            current_tag: current_tag.to_string(),
            candidate_tag: None,
            checked_at: Utc::now(),
            reason: None,
            remote_updated: None,
            error: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn failed(current_tag: &str, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(CheckMethod::Error, current_tag)
        }
    }
}

/// Results of one full detection pass.  Replaced wholesale on every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub total_checked: usize,
    pub updates_available: usize,
    pub check_errors: usize,
    pub results: BTreeMap<String, UpdateCheckResult>,
    pub last_check: Option<DateTime<Utc>>,
}

/// What happened when an update or repull was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub success: bool,
    pub container: String,
    pub endpoint: String,
    pub old_image: Option<String>,
    pub new_image: Option<String>,
    pub new_container_id: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub rolled_back: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl UpdateOutcome {
    pub fn new(container: &str, endpoint: &str) -> Self {
        Self {
            success: false,
            container: container.to_string(),
            endpoint: endpoint.to_string(),
            old_image: None,
            new_image: None,
            new_container_id: None,
            backup_path: None,
            rolled_back: false,
            message: None,
            error: None,
        }
    }
}

/// Counters returned by one automatic maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceSummary {
    pub auto_updates: usize,
    pub repulls: usize,
    pub errors: usize,
    pub timestamp: Option<DateTime<Utc>>,
}
