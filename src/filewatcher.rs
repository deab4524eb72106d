//! File-change watcher for configuration and certificate reloads
//!
//! Polls the watched path and invokes a callback when the file is created or
//! rewritten, or when a symlink along the path is repointed at a new target.
//! The symlink case matters because Kubernetes projects ConfigMaps and
//! Secrets as a directory of symlinks that are swapped atomically on update;
//! the file itself is never written in place.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the watched path is re-examined
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Observable aspects of the watched file that signal a change
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct FileState {
    /// Fully resolved path, `None` while the file does not exist
    real_path: Option<PathBuf>,
    modified: Option<SystemTime>,
    len: Option<u64>,
}

impl FileState {
    fn exists(&self) -> bool {
        self.real_path.is_some()
    }
}

async fn observe(path: &Path) -> FileState {
    let real_path = tokio::fs::canonicalize(path).await.ok();
    let metadata = tokio::fs::metadata(path).await.ok();
    FileState {
        real_path,
        modified: metadata.as_ref().and_then(|m| m.modified().ok()),
        len: metadata.as_ref().map(|m| m.len()),
    }
}

/// Watches a single file and fires a callback on observed changes
///
/// The watcher task runs until [`FileWatcher::close`] is called or the
/// watcher is dropped.
#[derive(Debug)]
pub struct FileWatcher {
    stop: CancellationToken,
}

impl FileWatcher {
    /// Watch `path`, invoking `on_event` after each observed change
    ///
    /// The callback fires when the file's modification time, length, or
    /// resolved target changes, but not when the file merely disappears; a
    /// removed file produces an event once it reappears, matching the
    /// create-or-write semantics the reload paths expect.
    pub fn spawn<F, Fut>(path: impl Into<PathBuf>, on_event: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_interval(path, on_event, POLL_INTERVAL)
    }

    pub(crate) fn spawn_with_interval<F, Fut>(
        path: impl Into<PathBuf>,
        on_event: F,
        interval: Duration,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let path = path.into();
        let stop = CancellationToken::new();
        let token = stop.clone();

        tokio::spawn(async move {
            let mut last = observe(&path).await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(file = %path.display(), "file watcher stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                let current = observe(&path).await;
                if current != last {
                    if current.exists() {
                        debug!(file = %path.display(), "file changed");
                        on_event().await;
                    }
                    last = current;
                }
            }
        });

        Self { stop }
    }

    /// Stop the watcher task
    pub fn close(&self) {
        self.stop.cancel();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
