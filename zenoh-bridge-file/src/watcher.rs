//! Polling directory watcher.
//!
//! Every tick the watched directory is listed and each regular file is
//! compared with what the previous tick saw. A file whose size and
//! modification time did not change between two ticks is *stable*: it is
//! read and handed to the registered [`FileHandler`] once per identity.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use filebridge_common::{FileEvent, FileIdentity};
use filebridge_framework::RetryPolicy;

/// Errors raised by [`DirectoryWatcher`].
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Watcher already running on {0}")]
    AlreadyRunning(PathBuf),

    #[error("No file handler registered")]
    NoHandler,

    #[error("Failed to create watched directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Listing the directory failed. Retried with backoff by the loop.
    #[error("Failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watcher on {path} did not stop within {timeout_ms}ms")]
    StopTimeout { path: PathBuf, timeout_ms: u64 },
}

/// Outcome of a handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The file was handled; its identity is never offered again.
    Processed,
    /// Offer the file again on a later tick.
    Retry,
}

/// What to do with a file once it was processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PostAction {
    /// Leave the file in place.
    #[default]
    Keep,
    /// Remove the file.
    Delete,
    /// Move the file into `to`, relative to the watched directory unless absolute.
    Move { to: PathBuf },
}

/// Callback receiving stable files.
#[async_trait]
pub trait FileHandler: Send + Sync {
    async fn on_file(&self, event: FileEvent) -> Disposition;
}

#[async_trait]
impl<F> FileHandler for F
where
    F: Fn(FileEvent) -> Disposition + Send + Sync,
{
    async fn on_file(&self, event: FileEvent) -> Disposition {
        self(event)
    }
}

/// Watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Directory to watch (not recursive).
    pub dir: PathBuf,

    /// Delay between two ticks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Read attempts after the first failure before a file is abandoned.
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,

    /// Also pick up files whose name starts with a dot.
    #[serde(default)]
    pub include_hidden: bool,

    /// Create the directory on start when missing.
    #[serde(default = "default_true")]
    pub auto_create: bool,

    /// Action applied to processed files.
    #[serde(default)]
    pub post_action: PostAction,

    /// Delay growth while listing keeps failing.
    #[serde(default = "default_list_backoff")]
    pub list_backoff: RetryPolicy,

    /// How long `stop` waits for the tick in progress.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_read_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_list_backoff() -> RetryPolicy {
    RetryPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(30))
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

impl WatchConfig {
    /// Settings for `dir` with every other field at its default.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval_ms: default_poll_interval_ms(),
            max_read_retries: default_max_read_retries(),
            include_hidden: false,
            auto_create: true,
            post_action: PostAction::default(),
            list_backoff: default_list_backoff(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_post_action(mut self, action: PostAction) -> Self {
        self.post_action = action;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.dir.as_os_str().is_empty() {
            return Err("file.dir must not be empty".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("file.poll_interval_ms must be > 0".to_string());
        }
        if let PostAction::Move { to } = &self.post_action {
            if to.as_os_str().is_empty() {
                return Err("file.post_action.to must not be empty".to_string());
            }
        }
        self.list_backoff
            .validate()
            .map_err(|e| format!("file.list_backoff: {}", e))
    }
}

/// Bookkeeping of what the watcher has seen and done.
///
/// Kept apart from the I/O so the stability and de-duplication rules can be
/// exercised without a file system.
#[derive(Debug, Default)]
struct ScanState {
    /// Observation of each path on the previous tick.
    previous: HashMap<PathBuf, FileIdentity>,
    processed: HashSet<FileIdentity>,
    read_failures: HashMap<FileIdentity, u32>,
    abandoned: HashSet<FileIdentity>,
}

impl ScanState {
    /// Record a listing; return stable identities not handled yet, oldest first.
    fn observe(&mut self, listing: Vec<FileIdentity>) -> Vec<FileIdentity> {
        let current: HashMap<PathBuf, FileIdentity> = listing
            .into_iter()
            .map(|identity| (identity.path.clone(), identity))
            .collect();

        let mut ready: Vec<FileIdentity> = current
            .values()
            .filter(|identity| self.previous.get(&identity.path) == Some(*identity))
            .filter(|identity| {
                !self.processed.contains(*identity) && !self.abandoned.contains(*identity)
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.path.cmp(&b.path))
        });

        let still_present = |identity: &FileIdentity| current.get(&identity.path) == Some(identity);
        self.processed.retain(|identity| still_present(identity));
        self.abandoned.retain(|identity| still_present(identity));
        self.read_failures
            .retain(|identity, _| still_present(identity));

        self.previous = current;
        ready
    }

    fn mark_processed(&mut self, identity: FileIdentity) {
        self.read_failures.remove(&identity);
        self.processed.insert(identity);
    }

    /// Count a failed read. Returns true once the file is abandoned.
    fn record_read_failure(&mut self, identity: &FileIdentity, max_retries: u32) -> bool {
        let failures = self.read_failures.entry(identity.clone()).or_insert(0);
        *failures += 1;
        if *failures > max_retries {
            self.read_failures.remove(identity);
            self.abandoned.insert(identity.clone());
            true
        } else {
            false
        }
    }
}

/// Polls a directory and reports each newly stable file once.
pub struct DirectoryWatcher {
    config: WatchConfig,
    handler: Option<Arc<dyn FileHandler>>,
    state: Arc<Mutex<ScanState>>,
    running: Option<Running>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("config", &self.config)
            .field("has_handler", &self.handler.is_some())
            .field("running", &self.is_running())
            .finish()
    }
}

impl DirectoryWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            handler: None,
            state: Arc::new(Mutex::new(ScanState::default())),
            running: None,
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Register the callback. Takes effect on the next `start`.
    pub fn on_file(&mut self, handler: Arc<dyn FileHandler>) {
        self.handler = Some(handler);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Start polling.
    ///
    /// Identities handled before a previous `stop` are remembered.
    pub async fn start(&mut self) -> Result<(), WatchError> {
        if self.is_running() {
            return Err(WatchError::AlreadyRunning(self.config.dir.clone()));
        }
        let handler = self.handler.clone().ok_or(WatchError::NoHandler)?;

        if self.config.auto_create {
            tokio::fs::create_dir_all(&self.config.dir)
                .await
                .map_err(|source| WatchError::CreateDir {
                    path: self.config.dir.clone(),
                    source,
                })?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            config: self.config.clone(),
            handler,
            state: self.state.clone(),
        };
        let task = tokio::spawn(worker.run(shutdown_rx));

        tracing::info!(
            dir = %self.config.dir.display(),
            poll_interval_ms = self.config.poll_interval_ms,
            "Directory watcher started"
        );

        self.running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop polling.
    ///
    /// Waits up to the stop timeout for the tick in progress, handler call
    /// included, then aborts it. No handler call starts after this returns.
    pub async fn stop(&mut self) -> Result<(), WatchError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.shutdown.send_replace(true);
        let mut task = running.task;

        let outcome = tokio::time::timeout(self.config.stop_timeout(), &mut task).await;
        match outcome {
            Ok(_) => {
                tracing::info!(dir = %self.config.dir.display(), "Directory watcher stopped");
                Ok(())
            }
            Err(_) => {
                task.abort();
                let _ = task.await;
                tracing::warn!(
                    dir = %self.config.dir.display(),
                    timeout_ms = self.config.stop_timeout_ms,
                    "Directory watcher did not stop in time, aborted"
                );
                Err(WatchError::StopTimeout {
                    path: self.config.dir.clone(),
                    timeout_ms: self.config.stop_timeout_ms,
                })
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.send_replace(true);
            running.task.abort();
        }
    }
}

struct Worker {
    config: WatchConfig,
    handler: Arc<dyn FileHandler>,
    state: Arc<Mutex<ScanState>>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut listing_failures = 0;

        loop {
            match self.tick(&shutdown).await {
                Ok(()) => {
                    if listing_failures > 0 {
                        tracing::info!(dir = %self.config.dir.display(), "Directory listing recovered");
                    }
                    listing_failures = 0;
                }
                Err(e) => {
                    listing_failures += 1;
                    tracing::warn!(error = %e, failures = listing_failures, "Directory listing failed");
                }
            }

            let delay = if listing_failures == 0 {
                self.config.poll_interval()
            } else {
                self.config.list_backoff.delay_for(listing_failures)
            };

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(dir = %self.config.dir.display(), "Watch loop exited");
    }

    /// One poll cycle. Only a listing failure is returned.
    async fn tick(&self, shutdown: &watch::Receiver<bool>) -> Result<(), WatchError> {
        let listing = list_files(&self.config.dir, self.config.include_hidden).await?;
        let ready = self.state.lock().observe(listing);

        for identity in ready {
            if *shutdown.borrow() {
                break;
            }

            let bytes = match tokio::fs::read(&identity.path).await {
                Ok(bytes) => bytes,
                Err(source) => {
                    let error = WatchError::FileRead {
                        path: identity.path.clone(),
                        source,
                    };
                    let abandoned = self
                        .state
                        .lock()
                        .record_read_failure(&identity, self.config.max_read_retries);
                    if abandoned {
                        tracing::warn!(error = %error, "Giving up on file");
                    } else {
                        tracing::debug!(error = %error, "Read failed, retrying next tick");
                    }
                    continue;
                }
            };

            if bytes.len() as u64 != identity.size {
                tracing::debug!(path = %identity.path.display(), "File changed while reading");
                continue;
            }

            let event = FileEvent::new(identity.path.clone(), bytes, identity.size, identity.modified);
            match self.handler.on_file(event).await {
                Disposition::Processed => {
                    self.state.lock().mark_processed(identity.clone());
                    self.apply_post_action(&identity.path).await;
                }
                Disposition::Retry => {
                    tracing::debug!(path = %identity.path.display(), "Handler asked for retry");
                }
            }
        }

        Ok(())
    }

    async fn apply_post_action(&self, path: &Path) {
        let result = match &self.config.post_action {
            PostAction::Keep => return,
            PostAction::Delete => tokio::fs::remove_file(path).await,
            PostAction::Move { to } => {
                let target_dir = if to.is_absolute() {
                    to.clone()
                } else {
                    self.config.dir.join(to)
                };
                match (tokio::fs::create_dir_all(&target_dir).await, path.file_name()) {
                    (Ok(()), Some(name)) => tokio::fs::rename(path, target_dir.join(name)).await,
                    (Ok(()), None) => return,
                    (Err(e), _) => Err(e),
                }
            }
        };

        if let Err(e) = result {
            tracing::warn!(
                path = %path.display(),
                action = ?self.config.post_action,
                error = %e,
                "Post action failed"
            );
        }
    }
}

/// Regular files directly under `dir`.
async fn list_files(dir: &Path, include_hidden: bool) -> Result<Vec<FileIdentity>, WatchError> {
    let io_error = |source| WatchError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        if !include_hidden && entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        // Entries can vanish between the listing and the stat.
        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        files.push(FileIdentity {
            path,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(path: &str, size: u64, secs: u64) -> FileIdentity {
        FileIdentity {
            path: PathBuf::from(path),
            size,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_file_needs_two_equal_observations() {
        let mut state = ScanState::default();
        let a = identity("in/a", 3, 10);

        assert!(state.observe(vec![a.clone()]).is_empty());
        assert_eq!(state.observe(vec![a.clone()]), vec![a]);
    }

    #[test]
    fn test_growing_file_is_not_stable() {
        let mut state = ScanState::default();

        state.observe(vec![identity("in/a", 3, 10)]);
        assert!(state.observe(vec![identity("in/a", 6, 11)]).is_empty());
        assert_eq!(state.observe(vec![identity("in/a", 6, 11)]).len(), 1);
    }

    #[test]
    fn test_processed_identity_not_offered_again() {
        let mut state = ScanState::default();
        let a = identity("in/a", 3, 10);

        state.observe(vec![a.clone()]);
        let ready = state.observe(vec![a.clone()]);
        state.mark_processed(ready[0].clone());

        assert!(state.observe(vec![a.clone()]).is_empty());
        assert!(state.observe(vec![a]).is_empty());
    }

    #[test]
    fn test_modified_file_is_new_identity() {
        let mut state = ScanState::default();
        let old = identity("in/a", 3, 10);
        state.observe(vec![old.clone()]);
        state.observe(vec![old.clone()]);
        state.mark_processed(old);

        let new = identity("in/a", 5, 20);
        state.observe(vec![new.clone()]);
        assert_eq!(state.observe(vec![new.clone()]), vec![new]);
        assert!(state.processed.is_empty());
    }

    #[test]
    fn test_vanished_identities_are_forgotten() {
        let mut state = ScanState::default();
        let a = identity("in/a", 3, 10);
        state.observe(vec![a.clone()]);
        state.observe(vec![a.clone()]);
        state.mark_processed(a.clone());

        state.observe(vec![]);
        assert!(state.processed.is_empty());

        // Recreated with the same identity: offered again after stabilizing.
        state.observe(vec![a.clone()]);
        assert_eq!(state.observe(vec![a.clone()]), vec![a]);
    }

    #[test]
    fn test_ready_files_sorted_oldest_first() {
        let mut state = ScanState::default();
        let listing = vec![
            identity("in/c", 1, 30),
            identity("in/a", 1, 10),
            identity("in/b", 1, 10),
        ];
        state.observe(listing.clone());

        let ready: Vec<_> = state
            .observe(listing)
            .into_iter()
            .map(|id| id.path)
            .collect();
        assert_eq!(
            ready,
            vec![
                PathBuf::from("in/a"),
                PathBuf::from("in/b"),
                PathBuf::from("in/c")
            ]
        );
    }

    #[test]
    fn test_read_failures_abandon_after_budget() {
        let mut state = ScanState::default();
        let a = identity("in/a", 3, 10);
        state.observe(vec![a.clone()]);

        assert!(!state.record_read_failure(&a, 2));
        assert_eq!(state.observe(vec![a.clone()]).len(), 1);
        assert!(!state.record_read_failure(&a, 2));
        assert!(state.record_read_failure(&a, 2));

        assert!(state.observe(vec![a]).is_empty());
    }

    fn fast_config(dir: &Path) -> WatchConfig {
        let mut config = WatchConfig::new(dir).with_poll_interval(Duration::from_millis(20));
        config.list_backoff =
            RetryPolicy::unbounded(Duration::from_millis(10), Duration::from_millis(40));
        config.stop_timeout_ms = 2_000;
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_emits_each_stable_file_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("msg"), b"HELLO WORLD!").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"skip me").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = DirectoryWatcher::new(fast_config(dir.path()));
        let sink = seen.clone();
        watcher.on_file(Arc::new(move |event: FileEvent| {
            sink.lock().push(event);
            Disposition::Processed
        }));
        watcher.start().await.unwrap();

        wait_until(|| seen.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.stop().await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].bytes, b"HELLO WORLD!");
        assert_eq!(seen[0].file_name().as_deref(), Some("msg"));
        assert!(dir.path().join("msg").exists());
    }

    #[tokio::test]
    async fn test_retry_disposition_offers_file_again() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("msg"), b"x").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut watcher = DirectoryWatcher::new(fast_config(dir.path()));
        watcher.on_file(Arc::new(move |_event: FileEvent| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Disposition::Retry
            } else {
                Disposition::Processed
            }
        }));
        watcher.start().await.unwrap();

        wait_until(|| calls.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.stop().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_delete_and_move_post_actions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone"), b"x").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut watcher = DirectoryWatcher::new(
            fast_config(dir.path()).with_post_action(PostAction::Delete),
        );
        watcher.on_file(Arc::new(move |_event: FileEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Disposition::Processed
        }));
        watcher.start().await.unwrap();
        wait_until(|| !dir.path().join("gone").exists()).await;
        watcher.stop().await.unwrap();

        let moved = tempfile::tempdir().unwrap();
        std::fs::write(moved.path().join("kept"), b"y").unwrap();
        let mut watcher = DirectoryWatcher::new(
            fast_config(moved.path()).with_post_action(PostAction::Move {
                to: PathBuf::from(".done"),
            }),
        );
        watcher.on_file(Arc::new(|_event: FileEvent| Disposition::Processed));
        watcher.start().await.unwrap();
        wait_until(|| moved.path().join(".done/kept").exists()).await;
        watcher.stop().await.unwrap();

        assert!(!moved.path().join("kept").exists());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_created_or_retried() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("input");

        let mut created = DirectoryWatcher::new(fast_config(&dir));
        created.on_file(Arc::new(|_event: FileEvent| Disposition::Processed));
        created.start().await.unwrap();
        assert!(dir.is_dir());
        created.stop().await.unwrap();

        let late = root.path().join("late");
        let mut config = fast_config(&late);
        config.auto_create = false;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut watcher = DirectoryWatcher::new(config);
        watcher.on_file(Arc::new(move |_event: FileEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Disposition::Processed
        }));
        watcher.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(watcher.is_running());

        std::fs::create_dir(&late).unwrap();
        std::fs::write(late.join("msg"), b"late").unwrap();
        wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_handler_and_single_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DirectoryWatcher::new(fast_config(dir.path()));
        assert!(matches!(watcher.start().await, Err(WatchError::NoHandler)));

        watcher.on_file(Arc::new(|_event: FileEvent| Disposition::Processed));
        watcher.start().await.unwrap();
        assert!(matches!(
            watcher.start().await,
            Err(WatchError::AlreadyRunning(_))
        ));

        watcher.stop().await.unwrap();
        assert!(!watcher.is_running());
        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_handler_in_flight() {
        struct Slow(Arc<AtomicUsize>);

        #[async_trait]
        impl FileHandler for Slow {
            async fn on_file(&self, _event: FileEvent) -> Disposition {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Disposition::Processed
            }
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("msg"), b"x").unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let mut watcher = DirectoryWatcher::new(fast_config(dir.path()));
        watcher.on_file(Arc::new(Slow(done.clone())));
        watcher.start().await.unwrap();

        // First tick observes, second tick starts the slow handler.
        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.stop().await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
