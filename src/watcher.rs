use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::config::{ConfigSource, JsonConfigFile, RetentionConfig};
use crate::errors::{CutError, Result};

/// Pushes a fresh snapshot into `updates` whenever the config file is
/// created or modified. Watching stops when this value is dropped.
pub struct ConfigFileWatcher {
    _watcher: RecommendedWatcher,
}

fn touches(event: &Event, file_name: &OsStr) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name))
}

impl ConfigFileWatcher {
    pub fn spawn(source: JsonConfigFile, updates: UnboundedSender<RetentionConfig>) -> Result<Self> {
        let file_name: OsString = source
            .path()
            .file_name()
            .ok_or_else(|| {
                CutError::Config(format!("{} is not a file path", source.path().display()))
            })?
            .to_os_string();
        let watch_dir = source
            .path()
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&watch_dir)?;

        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if touches(&event, &file_name) => match source.fetch() {
                Ok(config) => {
                    if updates.send(config).is_err() {
                        debug!("config subscriber gone, dropping update");
                    }
                }
                Err(e) => warn!("ignoring unreadable config change: {}", e),
            },
            Ok(_) => {}
            Err(e) => warn!(error = %e, "config watcher error"),
        })
        .map_err(|e| CutError::Config(e.to_string()))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| CutError::Config(e.to_string()))?;
        info!(path = %watch_dir.display(), "config watcher started");

        Ok(Self { _watcher: watcher })
    }
}
