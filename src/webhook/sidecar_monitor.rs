//! Hot-reloading store for sidecar templates
//!
//! The [`SidecarStore`] holds the current template map and is swapped whole
//! on every publish; admission requests take one snapshot and never observe
//! a partially loaded map. The [`SidecarMonitor`] owns the file watcher and
//! feeds reload results to a single consumer through a capacity-one channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::filewatcher::FileWatcher;

use super::sidecar::{load_sidecars, SidecarMap};

/// Atomically swapped slot holding the current sidecar template map
///
/// Readers take one snapshot; no lock is held while the snapshot is used.
/// The initial state is the empty map, which stays in place until the first
/// successful load is published.
#[derive(Default, Debug)]
pub struct SidecarStore {
    current: RwLock<Arc<SidecarMap>>,
}

impl SidecarStore {
    /// Create a store holding the empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current template map
    pub fn load(&self) -> Arc<SidecarMap> {
        Arc::clone(&self.current.read())
    }

    /// Replace the published map with `map`
    pub fn publish(&self, map: SidecarMap) {
        *self.current.write() = Arc::new(map);
    }
}

/// Watches the sidecar configuration file and emits reload results
///
/// Each file-change event (and the initial load at startup) re-runs the
/// loader and sends the outcome on the output channel: the parsed map on
/// success, the empty map on failure. The send blocks until the consumer
/// drains the previous item, so the consumer must be a dedicated task.
#[derive(Debug)]
pub struct SidecarMonitor {
    file_path: PathBuf,
    output: mpsc::Sender<SidecarMap>,
    watcher: Option<FileWatcher>,
}

impl SidecarMonitor {
    /// Create a monitor for `file_path` along with its output channel
    pub fn new(file_path: impl Into<PathBuf>) -> Result<(Self, mpsc::Receiver<SidecarMap>)> {
        let file_path = file_path.into();
        if file_path.as_os_str().is_empty() {
            return Err(Error::config("sidecar configuration file is required"));
        }

        let (output, rx) = mpsc::channel(1);
        Ok((
            Self {
                file_path,
                output,
                watcher: None,
            },
            rx,
        ))
    }

    /// Start watching the file and perform the initial load
    ///
    /// The initial result is delivered before this returns, so the consumer
    /// task must already be draining the channel.
    pub async fn start(&mut self) {
        let path = self.file_path.clone();
        let output = self.output.clone();
        let watcher = FileWatcher::spawn(&self.file_path, move || {
            let path = path.clone();
            let output = output.clone();
            async move {
                process_file(&path, &output).await;
            }
        });
        self.watcher = Some(watcher);

        process_file(&self.file_path, &self.output).await;
    }

    /// Stop the file watcher
    ///
    /// Dropping the monitor afterwards closes the output channel and ends
    /// the consumer task.
    pub fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.close();
        }
    }
}

async fn process_file(path: &Path, output: &mpsc::Sender<SidecarMap>) {
    let map = match load_sidecars(path) {
        Ok(map) => {
            debug!(file = %path.display(), sidecars = map.len(), "sidecar configuration parsed");
            map
        }
        Err(e) => {
            error!(error = %e, "invalid sidecar configuration file");
            SidecarMap::new()
        }
    };

    // A send error only means the consumer is gone during shutdown
    let _ = output.send(map).await;
}
