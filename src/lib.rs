//! traefik-bootstrap - Interactive Traefik provisioning for a single Docker host
//!
//! This library provides the pieces of a one-shot setup run:
//! - Verifies Docker and a Compose implementation are available
//! - Renders the Traefik static configuration and Compose manifests
//! - Ensures the shared external network exists
//! - Deploys Traefik and, optionally, a disposable test page
//! - Removes the test page after ten minutes through a detached watcher
//!   backed by an on-disk record, so removal survives the setup process

pub mod config;
pub mod deploy;
pub mod ephemeral;
pub mod error;
pub mod network;
pub mod prompt;
pub mod render;
pub mod report;
pub mod runtime;
pub mod setup;
pub mod teardown;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
