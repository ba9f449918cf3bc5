//! Compose manifests and the orchestrator CLI.
//!
//! Manifest edits touch only the `image` of one service; everything else
//! in the document is carried through unchanged.  Backups are verbatim
//! byte copies written next to the manifest.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde_yaml::Value;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::image_ref::with_tag;

/// Where and how to run the orchestrator for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeInvocation {
    pub manifest: PathBuf,
    pub working_dir: PathBuf,
    pub project: String,
    /// Daemon address override for remote endpoints.
    pub docker_host: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ComposeRunner: Send + Sync {
    async fn pull(&self, invocation: &ComposeInvocation, service: &str) -> Result<CommandOutput>;

    /// `up -d --force-recreate <service>`.
    async fn up(&self, invocation: &ComposeInvocation, service: &str) -> Result<CommandOutput>;
}

/// Runs `docker compose` (or whatever `command` names) as a subprocess.
pub struct ComposeCli {
    command: Vec<String>,
    timeout: Duration,
}

impl ComposeCli {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Configuration("compose command is empty".to_string()));
        }
        Ok(Self { command, timeout })
    }

    async fn run(&self, invocation: &ComposeInvocation, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg("-f")
            .arg(&invocation.manifest)
            .args(args)
            .current_dir(&invocation.working_dir)
            .env("COMPOSE_PROJECT_NAME", &invocation.project)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(host) = &invocation.docker_host {
            cmd.env("DOCKER_HOST", host);
        }

        debug!(
            "Running {} {} in {}",
            self.command.join(" "),
            args.join(" "),
            invocation.working_dir.display()
        );
        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::UpdateExecution(format!(
                    "{} timed out after {}s",
                    args.join(" "),
                    self.timeout.as_secs()
                )))
            }
        };
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl ComposeRunner for ComposeCli {
    async fn pull(&self, invocation: &ComposeInvocation, service: &str) -> Result<CommandOutput> {
        self.run(invocation, &["pull", service]).await
    }

    async fn up(&self, invocation: &ComposeInvocation, service: &str) -> Result<CommandOutput> {
        self.run(invocation, &["up", "-d", "--force-recreate", service])
            .await
    }
}

/// The `image` change made to a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChange {
    pub old_image: String,
    pub new_image: String,
}

/// Copies `manifest` byte for byte to `<manifest>.backup-<millis>`.
pub async fn backup_manifest(manifest: &Path) -> Result<PathBuf> {
    let file_name = manifest
        .file_name()
        .ok_or_else(|| Error::Configuration(format!("not a file: {}", manifest.display())))?
        .to_string_lossy()
        .into_owned();
    let stamp = Utc::now().timestamp_millis();
    let mut backup = manifest.with_file_name(format!("{}.backup-{}", file_name, stamp));
    let mut n = 1;
    while tokio::fs::try_exists(&backup).await? {
        backup = manifest.with_file_name(format!("{}.backup-{}-{}", file_name, stamp, n));
        n += 1;
    }
    tokio::fs::copy(manifest, &backup).await?;
    info!("Backed up {} to {}", manifest.display(), backup.display());
    Ok(backup)
}

/// Puts the backup's bytes back in place of the manifest.
pub async fn restore_manifest(backup: &Path, manifest: &Path) -> Result<()> {
    tokio::fs::copy(backup, manifest).await?;
    info!("Restored {} from {}", manifest.display(), backup.display());
    Ok(())
}

/// Reads the image currently declared for `service`.
#[cfg(test)]
pub async fn service_image(manifest: &Path, service: &str) -> Result<String> {
    let doc = read_manifest(manifest).await?;
    let image = lookup_service(&doc, service)?
        .get("image")
        .and_then(Value::as_str)
        .ok_or_else(|| no_image(service))?;
    Ok(image.to_string())
}

/// Retags the `image` of `service` to `tag`, leaving the rest of the
/// manifest as it was.
pub async fn set_service_image(manifest: &Path, service: &str, tag: &str) -> Result<ImageChange> {
    let mut doc = read_manifest(manifest).await?;
    lookup_service(&doc, service)?;

    let slot = doc
        .get_mut("services")
        .and_then(|s| s.get_mut(service))
        .and_then(|s| s.get_mut("image"))
        .ok_or_else(|| no_image(service))?;
    let old_image = slot.as_str().ok_or_else(|| no_image(service))?.to_string();
    let new_image = with_tag(&old_image, tag);
    *slot = Value::String(new_image.clone());

    let rendered = serde_yaml::to_string(&doc)?;
    let staging = manifest.with_extension("composr-tmp");
    tokio::fs::write(&staging, rendered).await?;
    tokio::fs::rename(&staging, manifest).await?;

    info!("Updated {} image: {} -> {}", service, old_image, new_image);
    Ok(ImageChange {
        old_image,
        new_image,
    })
}

async fn read_manifest(manifest: &Path) -> Result<Value> {
    let raw = tokio::fs::read_to_string(manifest).await?;
    Ok(serde_yaml::from_str(&raw)?)
}

fn lookup_service<'a>(doc: &'a Value, service: &str) -> Result<&'a Value> {
    doc.get("services")
        .and_then(|s| s.get(service))
        .ok_or_else(|| Error::UpdateExecution(format!("service {} not found in compose file", service)))
}

fn no_image(service: &str) -> Error {
    Error::UpdateExecution(format!("no image specified for service {}", service))
}
