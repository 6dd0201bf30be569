use crate::config::{ConfigSnapshot, EngineConfig, SharedConfig};
use crate::config_loader::ConfigLoader;
use anyhow::Result;
use notify::{Event, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Publishes a new immutable configuration snapshot whenever the file changes.
///
/// Consumers hold a `watch::Receiver<SharedConfig>` and clone the current
/// `Arc` once per cycle, so a reload never tears a cycle in progress.
pub struct ConfigWatcher {
    tx: Arc<watch::Sender<SharedConfig>>,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Creates a new configuration watcher with an initial configuration (version 1).
    ///
    /// Returns a tuple of the watcher and a receiver for configuration updates.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        initial_config: EngineConfig,
    ) -> (Self, watch::Receiver<SharedConfig>) {
        let (tx, rx) = watch::channel(ConfigSnapshot::shared(1, initial_config));
        (
            Self {
                tx: Arc::new(tx),
                path: path.into(),
            },
            rx,
        )
    }

    /// Returns another receiver for the same snapshot stream.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SharedConfig> {
        self.tx.subscribe()
    }

    /// Reloads the file now and publishes it if valid.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or fails validation; the
    /// previous snapshot stays in effect.
    pub fn reload(&self) -> Result<u64> {
        reload_into(&self.tx, &self.path)
    }

    /// Watches the configuration file for changes and broadcasts updates.
    ///
    /// # Errors
    ///
    /// Returns an error if file watching cannot be initiated or if the watcher task fails.
    pub async fn watch(&self) -> Result<()> {
        let tx = Arc::clone(&self.tx);
        let config_path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            })?;

            watcher.watch(Path::new(&config_path), RecursiveMode::NonRecursive)?;

            for event in notify_rx {
                if event.kind.is_modify() {
                    tracing::info!(path = %config_path.display(), "Config file changed, reloading");
                    if let Err(e) = reload_into(&tx, &config_path) {
                        tracing::error!("Failed to reload config, keeping previous snapshot: {:#}", e);
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}

fn reload_into(tx: &watch::Sender<SharedConfig>, path: &Path) -> Result<u64> {
    let config = ConfigLoader::load(path)?;
    let version = tx.borrow().version + 1;
    tx.send_replace(ConfigSnapshot::shared(version, config));
    tracing::info!(version, "Config reloaded successfully");
    Ok(version)
}
