//! Config-file watcher driving hot reload.
//!
//! Watches the config *directory* rather than the file: editors that save
//! via rename (vim and friends) replace the inode, and a file watch would
//! go stale after the first save. Events are debounced for 100 ms so a
//! burst of writes triggers one reload.

use crate::daemon::Daemon;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const DEBOUNCE: Duration = Duration::from_millis(100);

pub(crate) fn spawn(daemon: Arc<Daemon>, config_path: PathBuf) {
    let watch_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    tokio::spawn(async move {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();

        let mut watcher =
            match notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }) {
                Ok(watcher) => watcher,
                Err(e) => {
                    error!(error = %e, "failed to create config watcher");
                    return;
                }
            };

        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            error!(path = %watch_dir.display(), error = %e, "failed to watch config directory");
            return;
        }

        info!(path = %config_path.display(), "watching config file for changes");

        let config_name = config_path.file_name().map(|n| n.to_os_string());
        while let Some(changed) = rx.recv().await {
            if changed.file_name().map(|n| n.to_os_string()) != config_name {
                continue;
            }

            // Let the editor finish writing, then collapse the event burst.
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            info!(path = %changed.display(), "config file changed, reloading");
            daemon.reload_config().await;
        }
    });
}
