//! Lifecycle of the disposable test page
//!
//! Deploying the test page also schedules its removal. The removal must
//! happen whether or not the interactive process is still around, so it is
//! handed to a separate watcher process (this binary re-executed as
//! `reap <record>`) that runs in its own session with no inherited standard
//! streams. The deadline lives in a record on disk rather than in the
//! watcher's memory, so a relaunched watcher honors the original deadline.

use crate::deploy::Deployer;
use crate::error::{Result, SetupError};
use crate::runtime::{CommandRunner, ComposeCli};
use crate::teardown::{RecordStore, TeardownRecord};
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{info, warn};

/// Lifetime of the test page
pub const TEST_PAGE_TTL: Duration = Duration::from_secs(600);

/// Subcommand a watcher process is started with
pub const REAP_SUBCOMMAND: &str = "reap";

/// Starts a watcher for a saved teardown record
pub trait WatcherLauncher {
    /// Start the watcher without waiting for it; returns its pid
    fn launch(&self, record_path: &Path) -> Result<u32>;
}

/// Spawns `<program> [prefix args...] reap <record>` fully detached
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    program: PathBuf,
    prefix_args: Vec<String>,
}

impl DetachedLauncher {
    /// Re-execute the running binary
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| SetupError::Spawn {
            program: "current executable".to_string(),
            source: e,
        })?;
        Ok(Self::with_program(program, Vec::new()))
    }

    pub fn with_program(program: impl Into<PathBuf>, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }
}

impl WatcherLauncher for DetachedLauncher {
    fn launch(&self, record_path: &Path) -> Result<u32> {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.prefix_args);
        cmd.arg(REAP_SUBCOMMAND).arg(record_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        // New session: no controlling terminal, so neither a hangup nor a
        // Ctrl-C aimed at the parent reaches the watcher
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| SetupError::Spawn {
            program: self.program.display().to_string(),
            source: e,
        })?;
        let pid = child.id();
        // Dropping the handle neither waits for nor kills the child
        drop(child);

        info!(pid, record = %record_path.display(), "Teardown watcher launched");
        Ok(pid)
    }
}

/// A teardown that has been recorded (and usually handed to a watcher)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTeardown {
    pub record_path: PathBuf,
    pub deployed_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    /// `None` when the watcher could not be started; a later sweep retries
    pub watcher_pid: Option<u32>,
}

impl ScheduledTeardown {
    /// Wall-clock removal time for display, e.g. `14:32:05`
    pub fn fire_at_local(&self) -> String {
        self.fire_at.with_timezone(&Local).format("%H:%M:%S").to_string()
    }
}

/// Deploys the test page and guarantees its removal after the TTL
pub struct EphemeralLifecycle<'a, R, L> {
    runner: &'a R,
    compose: &'a ComposeCli,
    store: &'a RecordStore,
    launcher: &'a L,
}

impl<'a, R: CommandRunner, L: WatcherLauncher> EphemeralLifecycle<'a, R, L> {
    pub fn new(runner: &'a R, compose: &'a ComposeCli, store: &'a RecordStore, launcher: &'a L) -> Self {
        Self {
            runner,
            compose,
            store,
            launcher,
        }
    }

    /// Start the test page, then schedule its teardown.
    ///
    /// If the start fails nothing is scheduled. Waiting teardowns of an earlier
    /// deployment of the same manifest are retired first, so only the new
    /// deadline applies. The record is persisted before the watcher is
    /// launched so a failed launch is recoverable by `sweep`.
    pub async fn deploy(&self, domain: &str, manifest: &Path) -> Result<ScheduledTeardown> {
        let deployment = Deployer::new(self.runner, self.compose).deploy(manifest).await?;

        let superseded = self.store.retire_for_manifest(&deployment.manifest_path)?;
        if !superseded.is_empty() {
            info!(count = superseded.len(), "Earlier test page removals superseded");
        }

        let record = TeardownRecord::new(
            domain,
            &deployment.manifest_path,
            self.compose.clone(),
            deployment.started_at,
            TEST_PAGE_TTL,
        )?;
        let record_path = self.store.save(&record)?;

        let watcher_pid = match self.launcher.launch(&record_path) {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(
                    record = %record_path.display(),
                    error = %e,
                    "Could not start teardown watcher; run `traefik-bootstrap sweep` to retry"
                );
                None
            }
        };

        info!(
            domain,
            fire_at = %record.fire_at,
            ttl_secs = TEST_PAGE_TTL.as_secs(),
            "Test page removal scheduled"
        );

        Ok(ScheduledTeardown {
            record_path,
            deployed_at: record.deployed_at,
            fire_at: record.fire_at,
            watcher_pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRunner;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<PathBuf>>,
        fail: bool,
    }

    impl WatcherLauncher for RecordingLauncher {
        fn launch(&self, record_path: &Path) -> Result<u32> {
            if self.fail {
                return Err(SetupError::Spawn {
                    program: "watcher".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            self.launched.lock().unwrap().push(record_path.to_path_buf());
            Ok(31337)
        }
    }

    fn plugin() -> ComposeCli {
        ComposeCli::Plugin {
            docker: "docker".to_string(),
        }
    }

    #[tokio::test]
    async fn test_deploy_schedules_exactly_one_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let runner = FakeRunner::new();
        runner.on("docker compose", true, "");
        let launcher = RecordingLauncher::default();
        let compose = plugin();

        let lifecycle = EphemeralLifecycle::new(&runner, &compose, &store, &launcher);
        let before = Utc::now();
        let scheduled = lifecycle
            .deploy("test.example.com", Path::new("/opt/traefik/docker-compose-test.yml"))
            .await
            .unwrap();

        assert_eq!(scheduled.watcher_pid, Some(31337));
        assert_eq!(
            scheduled.fire_at - scheduled.deployed_at,
            chrono::Duration::seconds(600)
        );
        assert!(scheduled.deployed_at >= before);
        assert!(scheduled.fire_at - before <= chrono::Duration::seconds(605));

        assert_eq!(*launcher.launched.lock().unwrap(), vec![scheduled.record_path.clone()]);
        assert_eq!(store.list_pending().unwrap(), vec![scheduled.record_path.clone()]);

        let record = RecordStore::load(&scheduled.record_path).unwrap();
        assert_eq!(record.domain, "test.example.com");
        assert_eq!(record.compose, compose);
    }

    #[tokio::test]
    async fn test_redeploy_keeps_only_the_newest_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let runner = FakeRunner::new();
        runner.on("docker compose", true, "");
        let launcher = RecordingLauncher::default();
        let compose = plugin();
        let manifest = Path::new("/opt/traefik/docker-compose-test.yml");

        let lifecycle = EphemeralLifecycle::new(&runner, &compose, &store, &launcher);
        let first = lifecycle.deploy("first.example.com", manifest).await.unwrap();
        let second = lifecycle.deploy("second.example.com", manifest).await.unwrap();

        assert_eq!(store.list_pending().unwrap(), vec![second.record_path.clone()]);
        assert!(!first.record_path.exists());
        assert_eq!(
            RecordStore::load(&second.record_path).unwrap().domain,
            "second.example.com"
        );
        assert_eq!(launcher.launched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_start_schedules_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let runner = FakeRunner::new();
        runner
            .on("docker compose", true, "")
            .on("docker compose -f /m.yml up", false, "");
        let launcher = RecordingLauncher::default();
        let compose = plugin();

        let err = EphemeralLifecycle::new(&runner, &compose, &store, &launcher)
            .deploy("test.example.com", Path::new("/m.yml"))
            .await
            .unwrap_err();

        assert!(matches!(err, SetupError::Deployment { .. }));
        assert!(launcher.launched.lock().unwrap().is_empty());
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_keeps_record_for_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let runner = FakeRunner::new();
        runner.on("docker compose", true, "");
        let launcher = RecordingLauncher {
            fail: true,
            ..Default::default()
        };
        let compose = plugin();

        let scheduled = EphemeralLifecycle::new(&runner, &compose, &store, &launcher)
            .deploy("test.example.com", Path::new("/m.yml"))
            .await
            .unwrap();

        assert_eq!(scheduled.watcher_pid, None);
        assert_eq!(store.list_pending().unwrap(), vec![scheduled.record_path]);
    }

    #[test]
    fn test_fire_at_local_format() {
        let scheduled = ScheduledTeardown {
            record_path: PathBuf::from("/state/pending/x.json"),
            deployed_at: Utc::now(),
            fire_at: Utc::now(),
            watcher_pid: None,
        };
        let shown = scheduled.fire_at_local();
        assert_eq!(shown.len(), 8);
        assert_eq!(shown.matches(':').count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_detached_launcher_runs_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record.json");
        let marker = dir.path().join("record.json.seen");

        // sh -c '<script>' sh reap <record>: $1 is "reap", $2 the record path
        let launcher = DetachedLauncher::with_program(
            "sh",
            vec![
                "-c".to_string(),
                "touch \"$2.seen\"; sleep 5".to_string(),
                "sh".to_string(),
            ],
        );
        let pid = launcher.launch(&record).unwrap();
        assert!(pid > 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !marker.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(marker.exists());

        // The watcher leads its own session, apart from ours
        let pid = pid as libc::pid_t;
        let watcher_session = unsafe { libc::getsid(pid) };
        let own_session = unsafe { libc::getsid(0) };
        unsafe { libc::kill(pid, libc::SIGKILL) };
        assert_eq!(watcher_session, pid);
        assert_ne!(watcher_session, own_session);
    }

    #[test]
    fn test_detached_launcher_missing_program() {
        let launcher = DetachedLauncher::with_program("/nonexistent/traefik-bootstrap", Vec::new());
        let err = launcher.launch(Path::new("/tmp/x.json")).unwrap_err();
        assert!(matches!(err, SetupError::Spawn { .. }));
    }
}
