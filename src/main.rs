//! traefik-bootstrap - Interactive Traefik setup with a self-removing test page
//!
//! Usage:
//!   traefik-bootstrap                    Run the interactive setup
//!   traefik-bootstrap sweep              Resume teardowns lost to a crash or reboot
//!   traefik-bootstrap status             List pending and failed teardowns
//!   traefik-bootstrap remove-test-page   Remove the test page now

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};
use traefik_bootstrap::config::Config;
use traefik_bootstrap::deploy::TeardownOutcome;
use traefik_bootstrap::ephemeral::{DetachedLauncher, REAP_SUBCOMMAND};
use traefik_bootstrap::prompt::Prompter;
use traefik_bootstrap::report::Reporter;
use traefik_bootstrap::runtime::SystemRunner;
use traefik_bootstrap::setup::{remove_test_page, Setup, SetupOutcome};
use traefik_bootstrap::teardown::{reap, sweep, ReapOutcome, RecordStore};
use traefik_bootstrap::{PKG_NAME, VERSION};

const LOG_DIRECTIVE: &str = "traefik_bootstrap=info";

enum Command {
    Setup,
    Sweep,
    Status,
    RemoveTestPage,
    Reap(PathBuf),
    Help,
    Version,
    Unknown(String),
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// `Ok(false)` means the command ran but did not fully succeed
async fn run() -> Result<bool> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = parse_command(&args);

    match command {
        Command::Help => {
            print_help();
            Ok(true)
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            Ok(true)
        }
        Command::Unknown(arg) => {
            eprintln!("Unknown command: {}", arg);
            print_help();
            Ok(false)
        }
        Command::Reap(record) => handle_reap(&record).await,
        Command::Setup => {
            init_console_logging();
            handle_setup().await
        }
        Command::Sweep => {
            init_console_logging();
            handle_sweep()
        }
        Command::Status => {
            init_console_logging();
            handle_status()
        }
        Command::RemoveTestPage => {
            init_console_logging();
            handle_remove_test_page().await
        }
    }
}

fn parse_command(args: &[String]) -> Command {
    let Some(first) = args.first() else {
        return Command::Setup;
    };

    match first.as_str() {
        "setup" => Command::Setup,
        "sweep" => Command::Sweep,
        "status" => Command::Status,
        "remove-test-page" => Command::RemoveTestPage,
        REAP_SUBCOMMAND => match args.get(1) {
            Some(record) => Command::Reap(PathBuf::from(record)),
            None => Command::Unknown(format!("{} (missing record path)", REAP_SUBCOMMAND)),
        },
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        other => Command::Unknown(other.to_string()),
    }
}

fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(LOG_DIRECTIVE.parse().expect("valid log directive")),
        )
        .init();
}

/// Watchers have no terminal; they append to the log file next to the records
fn init_watcher_logging(store: &RecordStore) -> Result<()> {
    std::fs::create_dir_all(store.root())
        .with_context(|| format!("Failed to create state directory '{}'", store.root().display()))?;
    let log_path = store.log_path();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open watcher log '{}'", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(LOG_DIRECTIVE.parse().expect("valid log directive")),
        )
        .init();
    Ok(())
}

fn load_config() -> Result<Config> {
    let config = Config::discover().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    Ok(config)
}

async fn handle_setup() -> Result<bool> {
    let config = load_config()?;
    info!(
        name = PKG_NAME,
        version = VERSION,
        compose_dir = %config.paths.compose_dir.display(),
        state_dir = %config.paths.state_dir.display(),
        "Starting setup"
    );

    let runner = SystemRunner;
    let launcher = DetachedLauncher::current_exe()?;
    let mut prompter = Prompter::stdio();
    let mut reporter = Reporter::stdout();

    let outcome = Setup::new(&config, &runner, &launcher)
        .run(&mut prompter, &mut reporter)
        .await?;

    Ok(match outcome {
        SetupOutcome::Cancelled => true,
        SetupOutcome::Completed(report) => report.all_deployed(),
    })
}

async fn handle_reap(record: &Path) -> Result<bool> {
    let config = load_config()?;
    let store = RecordStore::new(&config.paths.state_dir);
    init_watcher_logging(&store)?;

    info!(record = %record.display(), pid = std::process::id(), "Teardown watcher started");
    match reap(&store, &SystemRunner, record).await {
        Ok(ReapOutcome::Failed { reason, parked_at }) => {
            error!(reason = %reason, parked_at = %parked_at.display(), "Teardown failed");
            Ok(false)
        }
        Ok(outcome) => {
            info!(outcome = ?outcome, "Teardown watcher finished");
            Ok(true)
        }
        Err(e) => {
            error!(record = %record.display(), error = %e, "Teardown watcher aborted");
            Err(e.into())
        }
    }
}

fn handle_sweep() -> Result<bool> {
    let config = load_config()?;
    let store = RecordStore::new(&config.paths.state_dir);
    let launcher = DetachedLauncher::current_exe()?;
    let report = sweep(&store, &launcher)?;

    let mut reporter = Reporter::stdout();
    reporter.status(&format!(
        "{} pending teardown(s) already watched, {} relaunched",
        report.watched,
        report.relaunched.len()
    ));
    for path in &report.relaunched {
        reporter.success(&format!("Watcher relaunched for {}", path.display()));
    }
    for e in &report.errors {
        reporter.error(e);
    }
    Ok(report.errors.is_empty())
}

fn handle_status() -> Result<bool> {
    let config = load_config()?;
    let store = RecordStore::new(&config.paths.state_dir);
    let mut reporter = Reporter::stdout();
    let mut readable = true;

    for (title, paths) in [
        ("Pending teardowns:", store.list_pending()?),
        ("Failed teardowns:", store.list_failed()?),
    ] {
        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match RecordStore::load(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    reporter.warning(&e.to_string());
                    readable = false;
                }
            }
        }
        reporter.records(title, &records);
    }
    Ok(readable)
}

async fn handle_remove_test_page() -> Result<bool> {
    let config = load_config()?;
    let mut reporter = Reporter::stdout();

    match remove_test_page(&config, &SystemRunner).await {
        Ok(TeardownOutcome::Removed) => {
            reporter.success("Test page removed");
            Ok(true)
        }
        Ok(TeardownOutcome::AlreadyRemoved) => {
            reporter.warning("Test page is not deployed");
            Ok(true)
        }
        Err(e) => {
            reporter.error(&e.to_string());
            Ok(false)
        }
    }
}

fn print_help() {
    println!(
        r#"
{name} {version} - Traefik setup for a single Docker host

USAGE:
    {name} [command]

COMMANDS:
    (none), setup        Run the interactive setup
    sweep                Relaunch removal watchers lost to a crash or reboot
    status               List pending and failed test page removals
    remove-test-page     Remove the test page now
    help                 Show this help
    version              Show version

ENVIRONMENT:
    TRAEFIK_BOOTSTRAP_CONFIG   Path to a TOML config file
                               (default: /etc/traefik-bootstrap.toml if present)
    RUST_LOG                   Log filter, e.g. traefik_bootstrap=debug
"#,
        name = PKG_NAME,
        version = VERSION
    );
}
