//! End-to-end setup runs against a scripted container runtime
//!
//! Run with: cargo test --test setup_flow

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use traefik_bootstrap::config::{Config, PathsConfig};
use traefik_bootstrap::ephemeral::WatcherLauncher;
use traefik_bootstrap::error::{Result, SetupError};
use traefik_bootstrap::prompt::Prompter;
use traefik_bootstrap::report::Reporter;
use traefik_bootstrap::runtime::{CommandOutput, CommandRunner, Invocation};
use traefik_bootstrap::setup::{Setup, SetupOutcome};
use traefik_bootstrap::teardown::{reap, ReapOutcome, RecordStore};

/// Docker host with the compose plugin; `fail_on` prefixes exit non-zero
#[derive(Default)]
struct ScriptedDocker {
    networks: Vec<String>,
    fail_on: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDocker {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedDocker {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let line = invocation.command_line();
        self.calls.lock().unwrap().push(line.clone());

        if line.starts_with("docker-compose") {
            return Err(SetupError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            });
        }

        let failed = self.fail_on.iter().any(|prefix| line.starts_with(prefix.as_str()));
        let stdout = if line.starts_with("docker network ls") {
            self.networks.join("\n")
        } else {
            String::new()
        };
        Ok(CommandOutput {
            success: !failed,
            code: Some(if failed { 1 } else { 0 }),
            stdout,
            stderr: if failed { "scripted failure".to_string() } else { String::new() },
        })
    }
}

#[derive(Default)]
struct CollectingLauncher {
    launched: Mutex<Vec<PathBuf>>,
}

impl WatcherLauncher for CollectingLauncher {
    fn launch(&self, record_path: &Path) -> Result<u32> {
        self.launched.lock().unwrap().push(record_path.to_path_buf());
        Ok(1)
    }
}

fn sandboxed_config(root: &Path) -> Config {
    Config {
        paths: PathsConfig::rooted_at(root),
        ..Config::default()
    }
}

fn acme_email(config: &Config) -> String {
    let text = std::fs::read_to_string(config.paths.proxy_config_file()).unwrap();
    let yaml: serde_yaml_ng::Value = serde_yaml_ng::from_str(&text).unwrap();
    yaml["certificatesResolvers"]["letsencrypt"]["acme"]["email"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn run_setup(
    config: &Config,
    docker: &ScriptedDocker,
    launcher: &CollectingLauncher,
    answers: &str,
) -> (Result<SetupOutcome>, String, String) {
    let mut prompts = Vec::new();
    let mut prompter = Prompter::new(answers.as_bytes(), &mut prompts);
    let mut reporter = Reporter::new(Vec::new());
    let outcome = Setup::new(config, docker, launcher)
        .run(&mut prompter, &mut reporter)
        .await;
    drop(prompter);
    (
        outcome,
        String::from_utf8(reporter.into_inner()).unwrap(),
        String::from_utf8(prompts).unwrap(),
    )
}

#[tokio::test]
async fn test_full_setup_then_timed_removal() {
    let dir = tempfile::tempdir().unwrap();
    let config = sandboxed_config(dir.path());
    let docker = ScriptedDocker::default();
    let launcher = CollectingLauncher::default();

    let (outcome, out, prompts) = run_setup(
        &config,
        &docker,
        &launcher,
        "ops@example.com\ntest.example.com\ny\n",
    )
    .await;

    let SetupOutcome::Completed(report) = outcome.unwrap() else {
        panic!("setup should complete");
    };
    assert!(report.all_deployed());
    assert!(prompts.contains("Continue? (y/n)"));
    assert!(out.contains("https://traefik.test.example.com"));

    let paths = &config.paths;
    assert_eq!(acme_email(&config), "ops@example.com");
    let env = std::fs::read_to_string(paths.env_file()).unwrap();
    assert_eq!(env, "TEST_DOMAIN=test.example.com\n");
    let test_manifest = std::fs::read_to_string(paths.test_manifest()).unwrap();
    assert!(test_manifest.contains("Host(`test.example.com`)"));

    let proxy = paths.proxy_manifest().display().to_string();
    let test = paths.test_manifest().display().to_string();
    assert_eq!(
        docker.calls(),
        vec![
            "docker --version".to_string(),
            "docker info".to_string(),
            "docker compose version".to_string(),
            "docker network ls --format {{.Name}}".to_string(),
            "docker network create traefik".to_string(),
            format!("docker compose -f {} pull", proxy),
            format!("docker compose -f {} up -d", proxy),
            format!("docker compose -f {} pull", test),
            format!("docker compose -f {} up -d", test),
        ]
    );

    // Exactly one watcher, pointed at the persisted record
    let launched = launcher.launched.lock().unwrap().clone();
    assert_eq!(launched.len(), 1);
    let record_path = &launched[0];
    let mut record = RecordStore::load(record_path).unwrap();
    assert_eq!(record.domain, "test.example.com");
    assert_eq!(record.fire_at - record.deployed_at, chrono::Duration::seconds(600));

    // Skip the wait: move the deadline into the past, then run the watcher body
    record.fire_at = Utc::now() - chrono::Duration::seconds(1);
    std::fs::write(record_path, serde_json::to_string(&record).unwrap()).unwrap();

    let store = RecordStore::new(&paths.state_dir);
    let watcher_docker = ScriptedDocker::default();
    let outcome = reap(&store, &watcher_docker, record_path).await.unwrap();

    assert_eq!(outcome, ReapOutcome::TornDown);
    assert_eq!(watcher_docker.calls(), vec![format!("docker compose -f {} down", test)]);
    assert!(!paths.test_manifest().exists());
    assert!(paths.proxy_manifest().exists());
    assert!(store.list_pending().unwrap().is_empty());
}

#[tokio::test]
async fn test_setup_without_domain_runs_proxy_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = sandboxed_config(dir.path());
    let docker = ScriptedDocker {
        networks: vec!["bridge".to_string(), "traefik".to_string()],
        ..Default::default()
    };
    let launcher = CollectingLauncher::default();

    let (outcome, out, prompts) = run_setup(&config, &docker, &launcher, "\n\n").await;

    let SetupOutcome::Completed(report) = outcome.unwrap() else {
        panic!("setup should complete");
    };
    assert!(report.scheduled.is_none());
    assert!(!prompts.contains("Continue?"));
    assert!(out.contains("already exists"));
    assert!(out.contains("only Traefik is running"));

    assert_eq!(acme_email(&config), "admin@example.com");
    assert!(!config.paths.test_manifest().exists());
    assert!(!config.paths.env_file().exists());
    assert!(launcher.launched.lock().unwrap().is_empty());
    assert!(!docker.calls().iter().any(|c| c.starts_with("docker network create")));
}

#[tokio::test]
async fn test_failed_test_page_schedules_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = sandboxed_config(dir.path());
    let test_up = format!(
        "docker compose -f {} up",
        config.paths.test_manifest().display()
    );
    let docker = ScriptedDocker {
        fail_on: vec![test_up],
        ..Default::default()
    };
    let launcher = CollectingLauncher::default();

    let (outcome, out, _) =
        run_setup(&config, &docker, &launcher, "\ntest.example.com\nY\n").await;

    let SetupOutcome::Completed(report) = outcome.unwrap() else {
        panic!("setup should complete");
    };
    assert!(!report.all_deployed());
    assert!(report.scheduled.is_none());
    assert!(out.contains("scripted failure"));
    assert!(launcher.launched.lock().unwrap().is_empty());
    assert!(RecordStore::new(&config.paths.state_dir)
        .list_pending()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_network_failure_aborts_before_deploy() {
    let dir = tempfile::tempdir().unwrap();
    let config = sandboxed_config(dir.path());
    let docker = ScriptedDocker {
        fail_on: vec!["docker network".to_string()],
        ..Default::default()
    };
    let launcher = CollectingLauncher::default();

    let (outcome, _, _) = run_setup(&config, &docker, &launcher, "\n\n").await;

    assert!(outcome.is_err());
    assert!(!docker.calls().iter().any(|c| c.contains(" up -d")));
}

#[tokio::test]
async fn test_rerun_within_ttl_keeps_new_page_until_its_own_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let config = sandboxed_config(dir.path());
    let docker = ScriptedDocker::default();
    let launcher = CollectingLauncher::default();

    run_setup(&config, &docker, &launcher, "\nfirst.example.com\ny\n").await.0.unwrap();
    run_setup(&config, &docker, &launcher, "\nsecond.example.com\ny\n").await.0.unwrap();

    let store = RecordStore::new(&config.paths.state_dir);
    assert_eq!(store.list_pending().unwrap().len(), 1);

    // The first run's watcher wakes up and must leave the second page alone
    let first_record = launcher.launched.lock().unwrap()[0].clone();
    let watcher_docker = ScriptedDocker::default();
    let outcome = reap(&store, &watcher_docker, &first_record).await.unwrap();

    assert_eq!(outcome, ReapOutcome::NothingToDo);
    assert!(watcher_docker.calls().is_empty());
    let manifest = std::fs::read_to_string(config.paths.test_manifest()).unwrap();
    assert!(manifest.contains("Host(`second.example.com`)"));
}

#[tokio::test]
async fn test_yaml_special_email_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let config = sandboxed_config(dir.path());
    let docker = ScriptedDocker::default();
    let launcher = CollectingLauncher::default();

    run_setup(&config, &docker, &launcher, "*ops@example.com\n\n").await.0.unwrap();

    assert_eq!(acme_email(&config), "*ops@example.com");
}
