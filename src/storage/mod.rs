pub mod models;
pub mod schema;
pub mod sqlite;

use crate::errors::Result;
use models::{HistoryCounts, ImageItem, NewImageItem, TextItem};

/// CRUD and retention over the text and image history tables.
///
/// Inserts evict the oldest rows past the configured limit before returning.
/// Removals never fail: they report whether a row went away.
pub trait HistoryStore: Send + Sync {
    fn add_text_item(&self, content: &str) -> Result<TextItem>;
    fn add_image_item(&self, image: NewImageItem) -> Result<ImageItem>;
    fn list_text_items(&self) -> Result<Vec<TextItem>>;
    fn list_image_items(&self) -> Result<Vec<ImageItem>>;
    fn get_text_item(&self, id: &str) -> Result<TextItem>;
    fn get_image_item(&self, id: &str) -> Result<ImageItem>;
    fn remove_text_item(&self, id: &str) -> bool;
    fn remove_image_item(&self, id: &str) -> bool;
    fn counts(&self) -> Result<HistoryCounts>;
}
