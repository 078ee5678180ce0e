//! Container runtime detection and subprocess execution
//!
//! Every interaction with Docker goes through the `docker` / compose CLIs.
//! Success or failure is judged from the exit status alone; stdout is only
//! read where a listing is needed (network names).

use crate::error::{Result, SetupError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Docker engine CLI binary
pub const DOCKER_BIN: &str = "docker";

/// Legacy standalone compose binary
pub const LEGACY_COMPOSE_BIN: &str = "docker-compose";

/// A single subprocess call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-like rendering for logs and user hints
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Short failure description for error messages
    pub fn failure_reason(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        }
    }
}

/// Seam over subprocess execution so the flow can run against a scripted fake
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs invocations as real child processes and waits for them
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!(command = %invocation.command_line(), "Running command");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(ref dir) = invocation.cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| SetupError::Spawn {
            program: invocation.program.clone(),
            source: e,
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Which compose invocation form the host supports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ComposeCli {
    /// `docker compose ...` (CLI plugin)
    Plugin { docker: String },
    /// `docker-compose ...` (legacy standalone binary)
    Standalone { binary: String },
}

impl ComposeCli {
    /// Build a compose invocation with the given trailing arguments
    pub fn invocation(&self, args: &[&str]) -> Invocation {
        match self {
            ComposeCli::Plugin { docker } => {
                let mut all = vec!["compose"];
                all.extend_from_slice(args);
                Invocation::new(docker.clone(), all)
            }
            ComposeCli::Standalone { binary } => Invocation::new(binary.clone(), args.iter().copied()),
        }
    }

    /// `compose -f <manifest> <args...>` run from the compose directory
    pub fn for_manifest(&self, manifest: &Path, args: &[&str]) -> Invocation {
        let manifest_arg = manifest.to_string_lossy().to_string();
        let mut all = vec!["-f", manifest_arg.as_str()];
        all.extend_from_slice(args);
        let invocation = self.invocation(&all);
        match manifest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => invocation.in_dir(dir),
            _ => invocation,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            ComposeCli::Plugin { docker } => format!("{} compose", docker),
            ComposeCli::Standalone { binary } => binary.clone(),
        }
    }
}

/// Result of a successful environment probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub docker: String,
    pub compose: ComposeCli,
}

impl RuntimeHandle {
    pub fn docker(&self, args: &[&str]) -> Invocation {
        Invocation::new(self.docker.clone(), args.iter().copied())
    }
}

/// Verify the engine binary, daemon and a compose variant are usable.
///
/// Spawn failures (binary not on PATH) count as a failed check.
pub async fn probe<R: CommandRunner>(runner: &R) -> Result<RuntimeHandle> {
    info!("Checking Docker installation");

    if !succeeds(runner, &Invocation::new(DOCKER_BIN, ["--version"])).await {
        return Err(SetupError::Environment(
            "Docker is not installed. Please install Docker first.".to_string(),
        ));
    }

    if !succeeds(runner, &Invocation::new(DOCKER_BIN, ["info"])).await {
        return Err(SetupError::Environment(
            "Docker daemon is not running. Please start Docker first.".to_string(),
        ));
    }

    info!("Checking Docker Compose");

    let plugin = ComposeCli::Plugin {
        docker: DOCKER_BIN.to_string(),
    };
    if succeeds(runner, &plugin.invocation(&["version"])).await {
        debug!(compose = %plugin.display_name(), "Using compose plugin");
        return Ok(RuntimeHandle {
            docker: DOCKER_BIN.to_string(),
            compose: plugin,
        });
    }

    let standalone = ComposeCli::Standalone {
        binary: LEGACY_COMPOSE_BIN.to_string(),
    };
    if succeeds(runner, &standalone.invocation(&["--version"])).await {
        debug!(compose = %standalone.display_name(), "Using legacy compose binary");
        return Ok(RuntimeHandle {
            docker: DOCKER_BIN.to_string(),
            compose: standalone,
        });
    }

    Err(SetupError::Environment(
        "Docker Compose is not installed. Please install Docker Compose first.".to_string(),
    ))
}

async fn succeeds<R: CommandRunner>(runner: &R, invocation: &Invocation) -> bool {
    match runner.run(invocation).await {
        Ok(output) => output.success,
        Err(e) => {
            debug!(command = %invocation.command_line(), error = %e, "Probe command could not run");
            false
        }
    }
}
