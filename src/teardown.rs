//! Durable teardown records and the watcher that executes them
//!
//! A scheduled teardown is a JSON record under `<state_dir>/pending/`. The
//! watcher process that owns it holds an exclusive lock on `<id>.lock` for its
//! whole lifetime, so a record whose lock can be taken has no live watcher.
//!
//! Layout:
//!
//! ```text
//! <state_dir>/pending/<id>.json     scheduled, waiting for fire_at
//! <state_dir>/pending/<id>.claimed  teardown in progress
//! <state_dir>/pending/<id>.lock     held by the owning watcher
//! <state_dir>/failed/<id>.json      teardown failed, left for the operator
//! <state_dir>/teardown.log          watcher log output
//! ```
//!
//! Claiming renames `.json` to `.claimed`, which only one process can win.

use crate::deploy::{Deployer, TeardownOutcome};
use crate::error::{Result, SetupError};
use crate::runtime::{CommandRunner, ComposeCli};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PENDING_DIR: &str = "pending";
const FAILED_DIR: &str = "failed";
const RECORD_EXT: &str = "json";
const CLAIMED_EXT: &str = "claimed";
const LOCK_EXT: &str = "lock";

/// Log file used by detached watchers
pub const WATCHER_LOG: &str = "teardown.log";

/// One scheduled removal of the test page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownRecord {
    pub id: Uuid,
    pub domain: String,
    pub manifest_path: PathBuf,
    /// Compose form detected at deploy time, reused verbatim by the watcher
    pub compose: ComposeCli,
    pub deployed_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    /// Set once a teardown attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl TeardownRecord {
    pub fn new(
        domain: &str,
        manifest_path: &Path,
        compose: ComposeCli,
        deployed_at: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SetupError::Config(format!("invalid teardown delay: {}", e)))?;
        Ok(Self {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            manifest_path: manifest_path.to_path_buf(),
            compose,
            deployed_at,
            fire_at: deployed_at + ttl,
            failure: None,
        })
    }

    /// Time left until `fire_at`, zero when overdue
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.fire_at - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

/// File-backed store of teardown records
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join(PENDING_DIR)
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(WATCHER_LOG)
    }

    pub fn record_path(&self, id: &Uuid) -> PathBuf {
        self.pending_dir().join(format!("{}.{}", id, RECORD_EXT))
    }

    fn sibling(record_path: &Path, ext: &str) -> PathBuf {
        record_path.with_extension(ext)
    }

    /// Write a new pending record atomically (temp file + rename)
    pub fn save(&self, record: &TeardownRecord) -> Result<PathBuf> {
        let dir = self.pending_dir();
        std::fs::create_dir_all(&dir).map_err(|e| SetupError::filesystem(&dir, e))?;

        let path = self.record_path(&record.id);
        write_json_atomic(&path, record)?;
        debug!(path = %path.display(), fire_at = %record.fire_at, "Teardown record saved");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<TeardownRecord> {
        let content = std::fs::read_to_string(path).map_err(|e| SetupError::Record {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SetupError::Record {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Pending and in-progress records, sorted by path
    pub fn list_pending(&self) -> Result<Vec<PathBuf>> {
        list_with_ext(&self.pending_dir(), &[RECORD_EXT, CLAIMED_EXT])
    }

    pub fn list_failed(&self) -> Result<Vec<PathBuf>> {
        list_with_ext(&self.failed_dir(), &[RECORD_EXT])
    }

    /// Move the record into the in-progress state.
    ///
    /// Returns the claimed path, or `None` when the record is gone (someone
    /// else finished it). An already-claimed record is resumed: only the lock
    /// holder calls this.
    pub fn claim(&self, record_path: &Path) -> Result<Option<PathBuf>> {
        let claimed = Self::sibling(record_path, CLAIMED_EXT);
        match std::fs::rename(record_path, &claimed) {
            Ok(()) => Ok(Some(claimed)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if claimed.exists() {
                    Ok(Some(claimed))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(SetupError::filesystem(record_path, e)),
        }
    }

    /// Cancel every waiting record that would tear down `manifest`.
    ///
    /// A retired record is claimed and deleted, so its watcher wakes up to
    /// `NothingToDo`. Records already claimed by a watcher are mid-teardown
    /// and are left alone. Returns the ids that were retired.
    pub fn retire_for_manifest(&self, manifest: &Path) -> Result<Vec<Uuid>> {
        let mut retired = Vec::new();

        for path in list_with_ext(&self.pending_dir(), &[RECORD_EXT])? {
            let record = match Self::load(&path) {
                Ok(record) => record,
                Err(e) => {
                    warn!(record = %path.display(), error = %e, "Skipping unreadable teardown record");
                    continue;
                }
            };
            if record.manifest_path != manifest {
                continue;
            }

            // Only a successful rename proves no watcher got there first
            let claimed = Self::sibling(&path, CLAIMED_EXT);
            match std::fs::rename(&path, &claimed) {
                Ok(()) => {
                    self.complete(&claimed)?;
                    info!(id = %record.id, domain = %record.domain, "Superseded teardown retired");
                    retired.push(record.id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(id = %record.id, "Record claimed concurrently, not retired");
                }
                Err(e) => return Err(SetupError::filesystem(&path, e)),
            }
        }

        Ok(retired)
    }

    /// Drop a finished record
    pub fn complete(&self, claimed_path: &Path) -> Result<()> {
        match std::fs::remove_file(claimed_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SetupError::filesystem(claimed_path, e)),
        }
    }

    /// Park a record under `failed/` with the reason attached
    pub fn fail(&self, claimed_path: &Path, reason: &str) -> Result<PathBuf> {
        let mut record = Self::load(claimed_path)?;
        record.failure = Some(reason.to_string());

        let dir = self.failed_dir();
        std::fs::create_dir_all(&dir).map_err(|e| SetupError::filesystem(&dir, e))?;
        let failed_path = dir.join(format!("{}.{}", record.id, RECORD_EXT));
        write_json_atomic(&failed_path, &record)?;
        self.complete(claimed_path)?;
        Ok(failed_path)
    }

    /// Normalize a `.claimed` path back to its `.json` record path
    pub fn canonical_record_path(path: &Path) -> PathBuf {
        Self::sibling(path, RECORD_EXT)
    }

    pub fn lock_path(record_path: &Path) -> PathBuf {
        Self::sibling(record_path, LOCK_EXT)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| SetupError::Record {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).map_err(|e| SetupError::filesystem(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| SetupError::filesystem(path, e))
}

fn list_with_ext(dir: &Path, exts: &[&str]) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SetupError::filesystem(dir, e)),
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| exts.contains(&ext))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Exclusive lock marking a live watcher, held until dropped
#[cfg(unix)]
pub struct WatcherLock {
    path: PathBuf,
    _file: std::fs::File,
}

#[cfg(unix)]
impl WatcherLock {
    /// `Ok(None)` when another process holds the lock
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SetupError::filesystem(path, e))?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(SetupError::filesystem(path, err));
        }

        file.set_len(0).map_err(|e| SetupError::filesystem(path, e))?;
        writeln!(&file, "{}", std::process::id()).map_err(|e| SetupError::filesystem(path, e))?;

        Ok(Some(Self {
            path: path.to_path_buf(),
            _file: file,
        }))
    }

    /// Delete the lock file while still holding it
    pub fn release_and_remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        }
    }
}

#[cfg(not(unix))]
pub struct WatcherLock {
    path: PathBuf,
}

#[cfg(not(unix))]
impl WatcherLock {
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| SetupError::filesystem(path, e))?;
        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }

    pub fn release_and_remove(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// What a watcher run ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Services stopped and manifest deleted
    TornDown,
    /// The manifest was already gone (manual early removal)
    AlreadyRemoved,
    /// Another watcher owns this record
    AlreadyWatched,
    /// The record no longer exists
    NothingToDo,
    /// Teardown failed, record parked under `failed/`
    Failed { reason: String, parked_at: PathBuf },
}

/// Watcher body: wait for `fire_at`, then tear the resource down exactly once
pub async fn reap<R: CommandRunner>(
    store: &RecordStore,
    runner: &R,
    record_path: &Path,
) -> Result<ReapOutcome> {
    let record_path = RecordStore::canonical_record_path(record_path);

    let Some(lock) = WatcherLock::try_acquire(&RecordStore::lock_path(&record_path))? else {
        debug!(record = %record_path.display(), "Record already has a live watcher");
        return Ok(ReapOutcome::AlreadyWatched);
    };

    let outcome = reap_locked(store, runner, &record_path).await;
    lock.release_and_remove();
    outcome
}

async fn reap_locked<R: CommandRunner>(
    store: &RecordStore,
    runner: &R,
    record_path: &Path,
) -> Result<ReapOutcome> {
    let claimed_path = RecordStore::sibling(record_path, CLAIMED_EXT);
    let record = if record_path.exists() {
        RecordStore::load(record_path)?
    } else if claimed_path.exists() {
        // A previous watcher died mid-teardown
        RecordStore::load(&claimed_path)?
    } else {
        return Ok(ReapOutcome::NothingToDo);
    };

    let remaining = record.remaining(Utc::now());
    info!(
        id = %record.id,
        domain = %record.domain,
        fire_at = %record.fire_at,
        remaining_secs = remaining.as_secs(),
        "Watching test page teardown"
    );
    tokio::time::sleep(remaining).await;

    let Some(claimed) = store.claim(record_path)? else {
        return Ok(ReapOutcome::NothingToDo);
    };

    info!(id = %record.id, "Time is up, removing test page");
    let deployer = Deployer::new(runner, &record.compose);
    match deployer.teardown(&record.manifest_path).await {
        Ok(outcome) => {
            store.complete(&claimed)?;
            match outcome {
                TeardownOutcome::Removed => {
                    info!(id = %record.id, domain = %record.domain, "Test page removed successfully");
                    Ok(ReapOutcome::TornDown)
                }
                TeardownOutcome::AlreadyRemoved => {
                    info!(id = %record.id, "Test page was already removed");
                    Ok(ReapOutcome::AlreadyRemoved)
                }
            }
        }
        Err(e) => {
            let reason = e.to_string();
            error!(id = %record.id, error = %reason, "Test page teardown failed, manual removal required");
            let parked_at = store.fail(&claimed, &reason)?;
            Ok(ReapOutcome::Failed { reason, parked_at })
        }
    }
}

/// Summary of a sweep over pending records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records that already had a live watcher
    pub watched: usize,
    /// Records whose watcher was (re)launched
    pub relaunched: Vec<PathBuf>,
    /// Records that could not be relaunched
    pub errors: Vec<String>,
}

/// Relaunch watchers for pending records that lost theirs (e.g. after a reboot)
pub fn sweep<L: crate::ephemeral::WatcherLauncher>(
    store: &RecordStore,
    launcher: &L,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for path in store.list_pending()? {
        let record_path = RecordStore::canonical_record_path(&path);
        let lock_path = RecordStore::lock_path(&record_path);

        match WatcherLock::try_acquire(&lock_path) {
            Ok(None) => {
                report.watched += 1;
                continue;
            }
            Ok(Some(lock)) => {
                // Nobody owns it; free the lock so the new watcher can take it
                drop(lock);
            }
            Err(e) => {
                warn!(record = %record_path.display(), error = %e, "Cannot inspect watcher lock");
                report.errors.push(e.to_string());
                continue;
            }
        }

        match launcher.launch(&record_path) {
            Ok(pid) => {
                info!(record = %record_path.display(), pid, "Relaunched teardown watcher");
                report.relaunched.push(record_path);
            }
            Err(e) => {
                warn!(record = %record_path.display(), error = %e, "Failed to relaunch teardown watcher");
                report.errors.push(e.to_string());
            }
        }
    }

    Ok(report)
}
