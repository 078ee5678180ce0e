//! Compose-based deployment driver

use crate::error::{Result, SetupError};
use crate::runtime::{CommandRunner, ComposeCli};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of a successful `deploy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentResult {
    pub manifest_path: PathBuf,
    /// When `up -d` returned successfully
    pub started_at: DateTime<Utc>,
    /// False when the pull failed and cached images were used
    pub pulled: bool,
}

/// Outcome of a `teardown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// `down` ran and the manifest was deleted
    Removed,
    /// The manifest was already gone, nothing to do
    AlreadyRemoved,
}

/// Drives `compose pull/up/down` for one manifest at a time
pub struct Deployer<'a, R> {
    runner: &'a R,
    compose: &'a ComposeCli,
}

impl<'a, R: CommandRunner> Deployer<'a, R> {
    pub fn new(runner: &'a R, compose: &'a ComposeCli) -> Self {
        Self { runner, compose }
    }

    /// Pull images then start the services detached.
    ///
    /// A failed pull only logs a warning; `up` may still succeed from cache.
    pub async fn deploy(&self, manifest: &Path) -> Result<DeploymentResult> {
        info!(manifest = %manifest.display(), "Deploying compose manifest");

        let pull = self
            .runner
            .run(&self.compose.for_manifest(manifest, &["pull"]))
            .await;
        let pulled = match pull {
            Ok(output) if output.success => true,
            Ok(output) => {
                warn!(
                    manifest = %manifest.display(),
                    reason = %output.failure_reason(),
                    "Image pull failed, continuing with cached images"
                );
                false
            }
            Err(e) => {
                warn!(manifest = %manifest.display(), error = %e, "Image pull could not run");
                false
            }
        };

        let up = self
            .runner
            .run(&self.compose.for_manifest(manifest, &["up", "-d"]))
            .await?;
        if !up.success {
            return Err(SetupError::deployment(manifest, up.failure_reason()));
        }

        info!(manifest = %manifest.display(), pulled, "Services started");
        Ok(DeploymentResult {
            manifest_path: manifest.to_path_buf(),
            started_at: Utc::now(),
            pulled,
        })
    }

    /// Stop and remove the services, then delete the manifest file.
    ///
    /// A missing manifest means someone already tore it down and is a no-op.
    /// If `down` fails the manifest is kept so the operator can retry.
    pub async fn teardown(&self, manifest: &Path) -> Result<TeardownOutcome> {
        if !manifest.exists() {
            info!(manifest = %manifest.display(), "Manifest already removed, nothing to tear down");
            return Ok(TeardownOutcome::AlreadyRemoved);
        }

        let down = self
            .runner
            .run(&self.compose.for_manifest(manifest, &["down"]))
            .await?;
        if !down.success {
            return Err(SetupError::deployment(manifest, down.failure_reason()));
        }

        match std::fs::remove_file(manifest) {
            Ok(()) => {}
            // Lost a race with a concurrent teardown
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SetupError::filesystem(manifest, e)),
        }

        info!(manifest = %manifest.display(), "Services removed and manifest deleted");
        Ok(TeardownOutcome::Removed)
    }
}
