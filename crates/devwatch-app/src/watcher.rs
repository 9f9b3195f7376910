//! Settings file watcher
//!
//! Watches `.devwatch/config.toml` and `pubspec.yaml` so the registry can
//! re-evaluate which daemon should run when either changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::{mpsc, oneshot};

use devwatch_core::prelude::*;

use crate::config::DEVWATCH_DIR;

/// Default debounce duration in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Files in the project root whose changes affect the daemon choice
pub const WATCHED_ROOT_FILES: &[&str] = &["pubspec.yaml"];

/// What the watcher reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// One or more watched files changed
    Changed,
    Error { message: String },
}

/// Watches the settings of one project
pub struct ConfigWatcher {
    /// Project root directory
    project_root: PathBuf,
    debounce: Duration,
    /// Handle to stop the watcher
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ConfigWatcher {
    pub fn new(project_root: PathBuf) -> Self {
        Self {
            project_root,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            stop_tx: None,
        }
    }

    /// Set debounce duration in milliseconds
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce = Duration::from_millis(ms);
        self
    }

    /// Start watching; sends [`ConfigEvent`]s to `event_tx`
    pub fn start(&mut self, event_tx: mpsc::Sender<ConfigEvent>) -> std::result::Result<(), String> {
        if self.is_running() {
            return Err("Watcher is already running".to_string());
        }

        let project_root = self.project_root.clone();
        let debounce = self.debounce;
        let (stop_tx, stop_rx) = oneshot::channel();

        self.stop_tx = Some(stop_tx);

        tokio::task::spawn_blocking(move || {
            Self::run_watcher(project_root, debounce, event_tx, stop_rx);
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    fn run_watcher(
        project_root: PathBuf,
        debounce: Duration,
        event_tx: mpsc::Sender<ConfigEvent>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let tx_clone = event_tx.clone();
        let root = project_root.clone();

        let debouncer_result = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let relevant = events
                        .iter()
                        .flat_map(|event| event.paths.iter())
                        .any(|path| is_watched_file(&root, path));
                    if relevant {
                        debug!("Settings changed");
                        let _ = tx_clone.blocking_send(ConfigEvent::Changed);
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!("Settings watcher error: {:?}", error);
                        let _ = tx_clone.blocking_send(ConfigEvent::Error {
                            message: error.to_string(),
                        });
                    }
                }
            }
        });

        let mut debouncer = match debouncer_result {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create settings watcher: {}", e);
                let _ = event_tx.blocking_send(ConfigEvent::Error {
                    message: format!("Failed to create watcher: {}", e),
                });
                return;
            }
        };

        // The settings directory may not exist yet; its creation shows up as a
        // change in the root, but files inside it only once it is watched
        for dir in [project_root.clone(), project_root.join(DEVWATCH_DIR)] {
            if !dir.is_dir() {
                continue;
            }
            if let Err(e) = debouncer.watch(&dir, RecursiveMode::NonRecursive) {
                warn!("Failed to watch {}: {}", dir.display(), e);
            } else {
                info!("Watching: {}", dir.display());
            }
        }

        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                    info!("Settings watcher stopping");
                    break;
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True for the settings file and the project files listed in
/// [`WATCHED_ROOT_FILES`]
pub fn is_watched_file(project_root: &Path, path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return false;
    };

    let in_settings_dir = parent.file_name().and_then(|n| n.to_str()) == Some(DEVWATCH_DIR);
    if in_settings_dir && name == "config.toml" {
        return true;
    }
    if name == DEVWATCH_DIR {
        return true;
    }
    WATCHED_ROOT_FILES.contains(&name) && same_dir(parent, project_root)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    a == b || matches!((dunce::canonicalize(a), dunce::canonicalize(b)), (Ok(x), Ok(y)) if x == y)
}
