//! Shared Docker network provisioning

use crate::error::{Result, SetupError};
use crate::runtime::{CommandRunner, RuntimeHandle};
use tracing::{debug, info, warn};

/// The shared external network every routed service joins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub name: String,
    /// Whether this call created it
    pub created: bool,
}

/// Ensure the network `name` exists.
///
/// List-then-create is not atomic: if the create fails but the network shows
/// up in a second listing, another provisioner won the race and the failure
/// is ignored.
pub async fn ensure_network<R: CommandRunner>(
    runner: &R,
    runtime: &RuntimeHandle,
    name: &str,
) -> Result<NetworkHandle> {
    if network_exists(runner, runtime, name).await? {
        debug!(network = name, "Docker network already exists");
        return Ok(NetworkHandle {
            name: name.to_string(),
            created: false,
        });
    }

    info!(network = name, "Creating Docker network");
    let output = runner
        .run(&runtime.docker(&["network", "create", name]))
        .await?;

    if output.success {
        return Ok(NetworkHandle {
            name: name.to_string(),
            created: true,
        });
    }

    if network_exists(runner, runtime, name).await? {
        warn!(network = name, "Network was created concurrently, continuing");
        return Ok(NetworkHandle {
            name: name.to_string(),
            created: false,
        });
    }

    Err(SetupError::Network {
        name: name.to_string(),
        reason: format!("docker network create failed: {}", output.failure_reason()),
    })
}

async fn network_exists<R: CommandRunner>(
    runner: &R,
    runtime: &RuntimeHandle,
    name: &str,
) -> Result<bool> {
    let output = runner
        .run(&runtime.docker(&["network", "ls", "--format", "{{.Name}}"]))
        .await?;

    if !output.success {
        return Err(SetupError::Network {
            name: name.to_string(),
            reason: format!("docker network ls failed: {}", output.failure_reason()),
        });
    }

    Ok(output.stdout.lines().any(|line| line.trim() == name))
}
