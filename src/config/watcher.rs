//! Configuration file watcher for hot reload.
//!
//! Reloads on changes to the configuration file and on SIGHUP. A new
//! configuration is handed on only if it loads and validates.

use crate::config::{load_config, Config};
use futures::future::BoxFuture;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Callback applying a freshly loaded configuration.
pub type ReloadCallback = Box<dyn Fn(Config) -> BoxFuture<'static, ()> + Send + Sync>;

/// Configuration file watcher.
pub struct ConfigWatcher {
    /// Path to the config file.
    config_path: PathBuf,
    /// Callback to invoke when config is reloaded.
    reload_callback: ReloadCallback,
}

impl ConfigWatcher {
    pub fn new(config_path: PathBuf, reload_callback: ReloadCallback) -> Self {
        Self {
            config_path,
            reload_callback,
        }
    }

    /// Get the path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Watch until `shutdown` fires.
    ///
    /// If the file watcher cannot be set up, SIGHUP still triggers reloads.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Dropping the watcher stops file events, so it lives as long as the loop.
        let _watcher = match self.watch_file(tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                error!(error = %e, "failed to watch config file, reload on SIGHUP only");
                None
            }
        };

        #[cfg(unix)]
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "failed to setup SIGHUP handler");
                None
            }
        };

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    let mut reload = self.should_reload(&event);
                    // Editors tend to emit bursts of events for one save.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    while let Ok(event) = rx.try_recv() {
                        reload |= self.should_reload(&event);
                    }
                    if reload {
                        self.try_reload().await;
                    }
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        match sighup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending::<Option<()>>().await,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload().await;
                }

                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    fn watch_file(&self, tx: mpsc::UnboundedSender<Event>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => debug!(error = %e, "file watch error"),
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Watch the directory so editors that replace the file are seen.
        let dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Check if this event should trigger a reload.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        let is_modify_or_create = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));

        is_our_file && is_modify_or_create
    }

    /// Load the file and hand it to the callback; keep the current
    /// configuration on any error.
    async fn try_reload(&self) {
        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "config reload failed, keeping current configuration"
                );
                return;
            }
        };

        info!(services = new_config.services.len(), "new configuration loaded");
        (self.reload_callback)(new_config).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn watcher(path: PathBuf) -> (ConfigWatcher, Arc<AtomicUsize>) {
        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reloads);
        let callback: ReloadCallback = Box::new(move |config| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(config.services.len(), Ordering::SeqCst);
            })
        });
        (ConfigWatcher::new(path, callback), reloads)
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event {
            kind,
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_should_reload_modify_and_create() {
        let (watcher, _) = watcher(PathBuf::from("/test/config.yaml"));

        let modify = event(
            EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Content,
            )),
            "/test/config.yaml",
        );
        let create = event(
            EventKind::Create(notify::event::CreateKind::File),
            "/test/config.yaml",
        );
        assert!(watcher.should_reload(&modify));
        assert!(watcher.should_reload(&create));
    }

    #[test]
    fn test_should_reload_ignores_other_files_and_removal() {
        let (watcher, _) = watcher(PathBuf::from("/test/config.yaml"));

        let other = event(
            EventKind::Modify(notify::event::ModifyKind::Any),
            "/test/other.yaml",
        );
        let removed = event(
            EventKind::Remove(notify::event::RemoveKind::File),
            "/test/config.yaml",
        );
        assert!(!watcher.should_reload(&other));
        assert!(!watcher.should_reload(&removed));
    }

    #[tokio::test]
    async fn test_try_reload_applies_valid_config_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetguard.yaml");
        let (watcher, reloads) = watcher(path.clone());

        std::fs::write(
            &path,
            "services:\n  - name: api\n    instances:\n      - { id: a, host: h, port: 1 }\n",
        )
        .unwrap();
        watcher.try_reload().await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        // Port 0 fails validation.
        std::fs::write(
            &path,
            "services:\n  - name: api\n    instances:\n      - { id: a, host: h, port: 0 }\n",
        )
        .unwrap();
        watcher.try_reload().await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }
}
