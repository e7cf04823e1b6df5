//! Beamline directory watcher.
//!
//! Watches a beamline endpoint's root for new detector files and emits them
//! once they are stable (the detector has finished writing).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::safety::RelativePath;
use crate::domain::Endpoint;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watcher task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The `watch` section of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Beamline endpoint whose root is watched
    pub endpoint: String,

    /// Journey plan new files are dispatched with
    pub plan: String,

    /// How long a file must be stable before processing (seconds)
    #[serde(default = "default_stability_delay")]
    pub stability_delay_secs: u64,

    /// File extensions to watch
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_stability_delay() -> u64 {
    5
}
fn default_extensions() -> Vec<String> {
    vec!["h5".to_string()]
}

/// A stable detector file, relative to the endpoint root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFile {
    pub path: RelativePath,
    pub size: u64,
    pub detected_at: DateTime<Utc>,
}

/// Watches one endpoint's local root
pub struct BeamlineWatcher {
    config: WatcherConfig,
    root: PathBuf,
}

impl BeamlineWatcher {
    /// Create a watcher over the endpoint's root path
    pub fn new(config: WatcherConfig, endpoint: &Endpoint) -> Self {
        Self {
            config,
            root: PathBuf::from(&endpoint.root_path),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate(&self) -> Result<(), WatcherError> {
        if !self.root.is_dir() {
            return Err(WatcherError::DirectoryNotFound(self.root.clone()));
        }
        Ok(())
    }

    /// List every matching file already under the root
    pub async fn scan_once(&self) -> Result<Vec<DatasetFile>, WatcherError> {
        self.validate()?;

        let mut files = Vec::new();
        let mut dirs = vec![self.root.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };

                if metadata.is_dir() {
                    dirs.push(path);
                } else if metadata.is_file() && has_extension(&path, &self.config.extensions) {
                    if let Some(relative) = relative_to(&self.root, &path) {
                        files.push(DatasetFile {
                            path: relative,
                            size: metadata.len(),
                            detected_at: Utc::now(),
                        });
                    }
                }
            }
        }

        files.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
        Ok(files)
    }

    /// Watch the root and emit new stable files until stopped
    pub fn watch(&self) -> Result<(mpsc::Receiver<DatasetFile>, WatchHandle), WatcherError> {
        self.validate()?;

        let (event_tx, event_rx) = mpsc::channel::<DatasetFile>(100);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let config = self.config.clone();
        let root = self.root.clone();

        let task = tokio::spawn(async move { run_watcher(config, root, event_tx, stop_rx).await });

        Ok((event_rx, WatchHandle { stop_tx, task }))
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<Result<(), WatcherError>>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<(), WatcherError> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn relative_to(root: &Path, path: &Path) -> Option<RelativePath> {
    let relative = path.strip_prefix(root).ok()?.to_str()?;
    match RelativePath::parse(relative) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!("Ignoring {}: {}", path.display(), e);
            None
        }
    }
}

/// Internal watcher loop
async fn run_watcher(
    config: WatcherConfig,
    root: PathBuf,
    event_tx: mpsc::Sender<DatasetFile>,
    mut stop_rx: mpsc::Receiver<()>,
) -> Result<(), WatcherError> {
    // Files being stabilized (path -> (size, last_seen))
    let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_secs(2), tx)?;
    debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

    let stability_delay = Duration::from_secs(config.stability_delay_secs);
    tracing::info!("Watching {} for detector files", root.display());

    loop {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("Watcher stopping...");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(events)) => {
                for event in events {
                    if !has_extension(&event.path, &config.extensions) {
                        continue;
                    }
                    if let Ok(metadata) = std::fs::metadata(&event.path) {
                        if metadata.is_file() {
                            pending.insert(event.path, (metadata.len(), Instant::now()));
                        }
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!("Watcher error: {:?}", e),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                tracing::error!("Watcher channel disconnected");
                break;
            }
        }

        let now = Instant::now();
        let mut stable = Vec::new();
        pending.retain(|path, (last_size, last_seen)| {
            if now.duration_since(*last_seen) < stability_delay {
                return true;
            }
            match std::fs::metadata(path) {
                Ok(metadata) if metadata.len() == *last_size && *last_size > 0 => {
                    stable.push((path.clone(), *last_size));
                    false
                }
                Ok(metadata) => {
                    // Still being written
                    *last_size = metadata.len();
                    *last_seen = now;
                    true
                }
                Err(_) => false,
            }
        });

        for (path, size) in stable {
            if let Some(relative) = relative_to(&root, &path) {
                tracing::info!("New detector file: {} ({} bytes)", relative, size);
                let file = DatasetFile {
                    path: relative,
                    size,
                    detected_at: Utc::now(),
                };
                if event_tx.send(file).await.is_err() {
                    tracing::debug!("Receiver dropped; watcher stopping");
                    return Ok(());
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}
