use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::{CutError, Result};

pub const DEFAULT_MAX_TEXT_HISTORY: u32 = 500;
pub const DEFAULT_MAX_IMAGE_HISTORY: u32 = 30;

pub struct AppPaths {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_file: PathBuf,
    pub pid_file: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CutError::Config("could not determine home directory".into()))?;
        Ok(Self::from_base(home.join(".cuthist")))
    }

    pub fn from_base(base: PathBuf) -> Self {
        Self {
            db_path: base.join("cut.db"),
            config_file: base.join("config.json"),
            pid_file: base.join("cuthist.pid"),
            base_dir: base,
        }
    }
}

/// Retention limits for the two history tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_text_history")]
    pub max_text_history: u32,
    #[serde(default = "default_max_image_history")]
    pub max_image_history: u32,
}

fn default_max_text_history() -> u32 {
    DEFAULT_MAX_TEXT_HISTORY
}

fn default_max_image_history() -> u32 {
    DEFAULT_MAX_IMAGE_HISTORY
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_text_history: DEFAULT_MAX_TEXT_HISTORY,
            max_image_history: DEFAULT_MAX_IMAGE_HISTORY,
        }
    }
}

impl RetentionConfig {
    pub fn new(max_text_history: u32, max_image_history: u32) -> Self {
        Self {
            max_text_history,
            max_image_history,
        }
        .normalized()
    }

    /// Limits are positive; zero is raised to one.
    pub fn normalized(self) -> Self {
        Self {
            max_text_history: self.max_text_history.max(1),
            max_image_history: self.max_image_history.max(1),
        }
    }
}

/// Where the host process keeps its retention settings.
pub trait ConfigSource: Send + Sync {
    fn fetch(&self) -> Result<RetentionConfig>;
}

/// JSON settings file, e.g. `{"max_text_history": 500, "max_image_history": 30}`.
#[derive(Debug, Clone)]
pub struct JsonConfigFile {
    path: PathBuf,
}

impl JsonConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes both limits. Other keys already in the file (settings owned
    /// by another host, such as `auto_start`) are kept.
    pub fn save(&self, config: &RetentionConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut document: Map<String, Value> = match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("replacing unreadable {}: {}", self.path.display(), e);
                Map::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(CutError::Io(e)),
        };
        let limits = serde_json::to_value(config)
            .map_err(|e| CutError::Config(format!("failed to serialize config: {}", e)))?;
        if let Value::Object(limits) = limits {
            document.extend(limits);
        }
        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| CutError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl ConfigSource for JsonConfigFile {
    fn fetch(&self) -> Result<RetentionConfig> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RetentionConfig::default());
            }
            Err(e) => return Err(CutError::Io(e)),
        };
        let config: RetentionConfig = serde_json::from_str(&content).map_err(|e| {
            CutError::Config(format!("failed to parse {}: {}", self.path.display(), e))
        })?;
        Ok(config.normalized())
    }
}

/// Read-only snapshot holder for the retention limits.
///
/// Readers always get a full copy of one snapshot; a pushed update replaces
/// both limits at once.
#[derive(Debug)]
pub struct ConfigProvider {
    snapshot: RwLock<RetentionConfig>,
    loaded: AtomicBool,
}

impl Default for ConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProvider {
    pub fn new() -> Self {
        Self::with_config(RetentionConfig::default())
    }

    pub fn with_config(config: RetentionConfig) -> Self {
        Self {
            snapshot: RwLock::new(config.normalized()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Fetches the host config once. On failure the current snapshot (the
    /// defaults, unless replaced) stays active and the provider still counts
    /// as loaded.
    pub fn load(&self, source: &dyn ConfigSource) -> RetentionConfig {
        match source.fetch() {
            Ok(config) => {
                self.replace(config);
                info!(
                    max_text_history = config.max_text_history,
                    max_image_history = config.max_image_history,
                    "retention config loaded"
                );
            }
            Err(e) => warn!("config unavailable, keeping defaults: {}", e),
        }
        self.loaded.store(true, Ordering::Release);
        self.current()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn current(&self) -> RetentionConfig {
        *self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replace(&self, config: RetentionConfig) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = config.normalized();
    }

    /// Applies every snapshot pushed through `updates` until the returned
    /// subscription is dropped. Must be called inside a tokio runtime.
    pub fn subscribe(
        self: &Arc<Self>,
        mut updates: UnboundedReceiver<RetentionConfig>,
    ) -> ConfigSubscription {
        let provider = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                provider.replace(config);
                info!(
                    max_text_history = config.max_text_history,
                    max_image_history = config.max_image_history,
                    "retention config updated"
                );
            }
        });
        ConfigSubscription { task }
    }
}

pub struct ConfigSubscription {
    task: JoinHandle<()>,
}

impl ConfigSubscription {
    /// Stops applying pushed snapshots. Dropping the subscription does the
    /// same.
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ConfigSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
