//! Update policy: which containers are checked, which may update on
//! their own, and how updates are applied.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Json, Serialized},
    Figment,
};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

pub const POLICY_FILE: &str = "container_update_settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdatePolicy {
    pub auto_check_enabled: bool,
    pub check_interval_hours: u64,
    pub auto_update_enabled: bool,
    pub exclude_patterns: BTreeSet<String>,
    pub include_patterns: BTreeSet<String>,
    pub max_concurrent_checks: usize,
    pub backup_before_update: bool,
    pub rollback_on_failure: bool,
    pub auto_update_tag_patterns: BTreeSet<String>,
    pub scheduled_repull_enabled: bool,
    pub repull_tag_patterns: BTreeSet<String>,
    pub repull_interval_hours: u64,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            auto_check_enabled: true,
            check_interval_hours: 6,
            auto_update_enabled: false,
            exclude_patterns: ["dev", "nightly"].iter().map(|s| s.to_string()).collect(),
            include_patterns: BTreeSet::new(),
            max_concurrent_checks: 3,
            backup_before_update: true,
            rollback_on_failure: true,
            auto_update_tag_patterns: BTreeSet::new(),
            scheduled_repull_enabled: false,
            repull_tag_patterns: ["latest", "main", "stable"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            repull_interval_hours: 24,
        }
    }
}

/// Case-insensitive substring match of `tag` against any pattern.
fn matches_any(patterns: &BTreeSet<String>, tag: &str) -> bool {
    let tag = tag.to_lowercase();
    patterns.iter().any(|p| tag.contains(&p.to_lowercase()))
}

impl UpdatePolicy {
    /// True when the tag is excluded, or an include list exists and the
    /// tag is not on it.
    pub fn is_skipped(&self, tag: &str) -> bool {
        if matches_any(&self.exclude_patterns, tag) {
            return true;
        }
        !self.include_patterns.is_empty() && !matches_any(&self.include_patterns, tag)
    }

    /// An empty auto-update pattern set admits every tag.
    pub fn allows_auto_update_tag(&self, tag: &str) -> bool {
        self.auto_update_tag_patterns.is_empty() || matches_any(&self.auto_update_tag_patterns, tag)
    }

    pub fn is_repull_tag(&self, tag: &str) -> bool {
        matches_any(&self.repull_tag_patterns, tag)
    }

    /// Worker count for a batch of `containers` checks.
    pub fn workers_for(&self, containers: usize) -> usize {
        self.max_concurrent_checks.max(1).min(containers.max(1))
    }
}

/// Holds the active policy and the file it is saved to.
pub struct PolicyStore {
    path: Option<PathBuf>,
    current: RwLock<UpdatePolicy>,
}

impl PolicyStore {
    /// Loads the policy file, falling back to defaults for missing keys
    /// (or a missing file).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let policy: UpdatePolicy = Figment::from(Serialized::defaults(UpdatePolicy::default()))
            .merge(Json::file(&path))
            .extract()?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(policy),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory(policy: UpdatePolicy) -> Self {
        Self {
            path: None,
            current: RwLock::new(policy),
        }
    }

    pub async fn get(&self) -> UpdatePolicy {
        self.current.read().await.clone()
    }

    /// Replaces the active policy and rewrites the policy file.
    pub async fn save(&self, policy: UpdatePolicy) -> Result<()> {
        let mut current = self.current.write().await;
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&policy)?;
            tokio::fs::write(path, json).await?;
            info!("Saved update policy to {}", path.display());
        }
        *current = policy;
        Ok(())
    }
}
