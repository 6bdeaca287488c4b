//! Clipboard history ingestion: poll the clipboard, persist new text and
//! images to SQLite with bounded retention, and notify a view of each
//! appended item.

pub mod clipboard;
pub mod config;
pub mod errors;
pub mod hash;
pub mod hotkey;
pub mod image_bridge;
pub mod instance;
pub mod notifier;
pub mod pipeline;
pub mod storage;
pub mod watcher;
