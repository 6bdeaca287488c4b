use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextItem {
    pub id: String,
    pub content: String,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageItem {
    pub id: String,
    /// Encoded image payload as produced by the image bridge.
    pub content: String,
    pub width: u32,
    pub height: u32,
    /// Byte length of the captured frame before processing.
    pub size: u64,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewImageItem {
    pub content: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

/// A freshly persisted row of either table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryItem {
    Text(TextItem),
    Image(ImageItem),
}

impl HistoryItem {
    pub fn id(&self) -> &str {
        match self {
            HistoryItem::Text(item) => &item.id,
            HistoryItem::Image(item) => &item.id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryCounts {
    pub text_items: i64,
    pub image_items: i64,
}
