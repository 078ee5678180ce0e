//! The interactive provisioning flow
//!
//! Strictly sequential: every step waits for its subprocess before the next
//! one starts. Failures for which [`SetupError::is_fatal`] holds abort the
//! run; a failed deployment is reported and the remaining deployments are
//! still attempted.

use crate::config::Config;
use crate::deploy::{Deployer, TeardownOutcome};
use crate::ephemeral::{EphemeralLifecycle, ScheduledTeardown, WatcherLauncher};
use crate::error::{Result, SetupError};
use crate::network::ensure_network;
use crate::prompt::{PromptOutcome, Prompter};
use crate::render::materialize;
use crate::report::Reporter;
use crate::runtime::{probe, CommandRunner};
use crate::teardown::{sweep, RecordStore};
use std::io::{BufRead, Write};
use tracing::{error, info, warn};

/// How a setup run ended
#[derive(Debug)]
pub enum SetupOutcome {
    /// The operator declined; nothing was written
    Cancelled,
    Completed(SetupReport),
}

#[derive(Debug, Default)]
pub struct SetupReport {
    pub test_domain: Option<String>,
    pub scheduled: Option<ScheduledTeardown>,
    /// Deployments that failed to start
    pub failed: Vec<SetupError>,
}

impl SetupReport {
    pub fn all_deployed(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Setup<'a, R, L> {
    config: &'a Config,
    runner: &'a R,
    launcher: &'a L,
}

impl<'a, R: CommandRunner, L: WatcherLauncher> Setup<'a, R, L> {
    pub fn new(config: &'a Config, runner: &'a R, launcher: &'a L) -> Self {
        Self {
            config,
            runner,
            launcher,
        }
    }

    pub async fn run<I: BufRead, O: Write, W: Write>(
        &self,
        prompter: &mut Prompter<I, O>,
        reporter: &mut Reporter<W>,
    ) -> Result<SetupOutcome> {
        reporter.status("Starting Traefik automated setup...");
        let store = RecordStore::new(&self.config.paths.state_dir);
        self.resume_orphaned_teardowns(&store, reporter);

        reporter.status("Checking Docker and Docker Compose...");
        let runtime = match probe(self.runner).await {
            Ok(runtime) => runtime,
            Err(e) => {
                reporter.error(&e.to_string());
                return Err(e);
            }
        };
        reporter.success(&format!(
            "Docker is running, using '{}'",
            runtime.compose.display_name()
        ));

        let inputs = match prompter.collect().map_err(SetupError::Prompt)? {
            PromptOutcome::Proceed(inputs) => inputs,
            PromptOutcome::Cancelled => {
                reporter.status("Setup cancelled.");
                info!("Setup cancelled by operator");
                return Ok(SetupOutcome::Cancelled);
            }
        };

        let artifacts = match materialize(self.config, &inputs) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                reporter.error(&e.to_string());
                return Err(e);
            }
        };
        reporter.success("Configuration files created");

        let mut report = SetupReport {
            test_domain: inputs.test_domain.clone(),
            ..Default::default()
        };

        reporter.status("Setting up Docker network...");
        match ensure_network(self.runner, &runtime, &self.config.proxy.network).await {
            Ok(network) if network.created => {
                reporter.success(&format!("Docker network '{}' created", network.name));
            }
            Ok(network) => {
                reporter.warning(&format!("Docker network '{}' already exists", network.name));
            }
            Err(e) => settle(reporter, &mut report, e)?,
        }

        reporter.status("Deploying Traefik...");
        let deployer = Deployer::new(self.runner, &runtime.compose);
        match deployer.deploy(&artifacts.proxy_manifest).await {
            Ok(result) => {
                if !result.pulled {
                    reporter.warning("Image pull failed, started from cached images");
                }
                reporter.success("Traefik deployed successfully");
            }
            Err(e) => {
                error!(error = %e, "Traefik deployment failed");
                settle(reporter, &mut report, e)?;
            }
        }

        if let (Some(domain), Some(manifest)) =
            (inputs.test_domain.as_deref(), artifacts.test_manifest.as_deref())
        {
            reporter.status("Deploying test page (will auto-remove in 10 minutes)...");
            let lifecycle = EphemeralLifecycle::new(self.runner, &runtime.compose, &store, self.launcher);
            match lifecycle.deploy(domain, manifest).await {
                Ok(scheduled) => {
                    reporter.success(&format!("Test page deployed at https://{}", domain));
                    reporter.warning(&format!(
                        "Test page will auto-remove in 10 minutes (at {})",
                        scheduled.fire_at_local()
                    ));
                    report.scheduled = Some(scheduled);
                }
                Err(e) => {
                    error!(error = %e, domain, "Test page deployment failed");
                    settle(reporter, &mut report, e)?;
                }
            }
        }

        reporter.summary(
            self.config,
            &runtime.compose,
            report.test_domain.as_deref(),
            report.scheduled.as_ref(),
        );
        if report.all_deployed() {
            reporter.success("Setup complete!");
        } else {
            reporter.warning(&format!(
                "Setup finished with {} failed deployment(s)",
                report.failed.len()
            ));
        }

        Ok(SetupOutcome::Completed(report))
    }

    /// Relaunch watchers lost to a crash or reboot; problems are only warnings
    fn resume_orphaned_teardowns<W: Write>(&self, store: &RecordStore, reporter: &mut Reporter<W>) {
        match sweep(store, self.launcher) {
            Ok(sweep) => {
                if !sweep.relaunched.is_empty() {
                    reporter.warning(&format!(
                        "Resumed {} pending test page removal(s) from a previous run",
                        sweep.relaunched.len()
                    ));
                }
                for e in &sweep.errors {
                    reporter.warning(&format!("Could not resume a pending removal: {}", e));
                }
            }
            Err(e) => warn!(error = %e, "Could not scan pending teardowns"),
        }
    }
}

/// Report a failed step; fatal errors end the run, the rest are collected
fn settle<W: Write>(reporter: &mut Reporter<W>, report: &mut SetupReport, err: SetupError) -> Result<()> {
    reporter.error(&err.to_string());
    if err.is_fatal() {
        return Err(err);
    }
    report.failed.push(err);
    Ok(())
}

/// Tear the test page down now instead of waiting for its watcher.
///
/// The watcher later finds the manifest gone and retires its record.
pub async fn remove_test_page<R: CommandRunner>(config: &Config, runner: &R) -> Result<TeardownOutcome> {
    let runtime = probe(runner).await?;
    let outcome = Deployer::new(runner, &runtime.compose)
        .teardown(&config.paths.test_manifest())
        .await?;
    info!(outcome = ?outcome, "Manual test page removal finished");
    Ok(outcome)
}
