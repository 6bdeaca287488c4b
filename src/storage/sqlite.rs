use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use rusqlite::{Connection, Row, Transaction, params};
use tracing::{debug, warn};
use uuid::Uuid;

use super::HistoryStore;
use super::models::{HistoryCounts, ImageItem, NewImageItem, TextItem};
use super::schema::{self, IMAGE_TABLE, TEXT_TABLE};
use crate::config::ConfigProvider;
use crate::errors::{CutError, Result};

const TEXT_COLUMNS: &str = "id, content, createTime";
const IMAGE_COLUMNS: &str = "id, content, width, height, size, createTime";

enum Location {
    File(PathBuf),
    Memory,
}

struct Handle {
    conn: Connection,
    /// Last `createTime` handed out, in microseconds since the epoch.
    last_stamp: i64,
}

impl Handle {
    fn next_stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_micros();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }
}

/// SQLite-backed history store.
///
/// The connection is opened on first use and shared by every caller
/// afterwards. Retention limits are read from the provider at each insert.
pub struct SqliteStore {
    location: Location,
    config: Arc<ConfigProvider>,
    handle: OnceCell<Mutex<Handle>>,
    opens: AtomicUsize,
}

fn stamp_to_time(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn row_to_text_item(row: &Row) -> rusqlite::Result<TextItem> {
    Ok(TextItem {
        id: row.get(0)?,
        content: row.get(1)?,
        create_time: stamp_to_time(row.get(2)?),
    })
}

fn row_to_image_item(row: &Row) -> rusqlite::Result<ImageItem> {
    let size: i64 = row.get(4)?;
    Ok(ImageItem {
        id: row.get(0)?,
        content: row.get(1)?,
        width: row.get(2)?,
        height: row.get(3)?,
        size: u64::try_from(size).unwrap_or_default(),
        create_time: stamp_to_time(row.get(5)?),
    })
}

/// Deletes the oldest rows of `table` until at most `limit` remain.
fn evict_oldest(tx: &Transaction, table: &str, limit: u32) -> rusqlite::Result<usize> {
    let total: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    let overflow = total - i64::from(limit);
    if overflow <= 0 {
        return Ok(0);
    }
    tx.execute(
        &format!(
            "DELETE FROM {table} WHERE id IN
                (SELECT id FROM {table} ORDER BY createTime ASC LIMIT ?1)"
        ),
        params![overflow],
    )
}

fn not_found(kind: &str, id: &str) -> impl FnOnce(rusqlite::Error) -> CutError {
    let message = format!("{} item with id {} not found", kind, id);
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => CutError::NotFound(message),
        other => CutError::Storage(other),
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, config: Arc<ConfigProvider>) -> Self {
        Self::with_location(Location::File(path.into()), config)
    }

    pub fn in_memory(config: Arc<ConfigProvider>) -> Self {
        Self::with_location(Location::Memory, config)
    }

    fn with_location(location: Location, config: Arc<ConfigProvider>) -> Self {
        Self {
            location,
            config,
            handle: OnceCell::new(),
            opens: AtomicUsize::new(0),
        }
    }

    fn open(&self) -> Result<Mutex<Handle>> {
        let conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            Location::Memory => Connection::open_in_memory()?,
        };
        conn.execute(schema::CREATE_TEXT_TABLE, [])?;
        conn.execute(schema::CREATE_IMAGE_TABLE, [])?;
        let last_stamp: Option<i64> = conn.query_row(
            &format!(
                "SELECT MAX(t) FROM (
                    SELECT MAX(createTime) AS t FROM {TEXT_TABLE}
                    UNION ALL
                    SELECT MAX(createTime) FROM {IMAGE_TABLE}
                )"
            ),
            [],
            |row| row.get(0),
        )?;
        let opens = self.opens.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(opens, "history store opened");
        Ok(Mutex::new(Handle {
            conn,
            last_stamp: last_stamp.unwrap_or(0),
        }))
    }

    fn handle(&self) -> Result<MutexGuard<'_, Handle>> {
        let cell = self.handle.get_or_try_init(|| self.open())?;
        Ok(cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn remove_from(&self, table: &str, id: &str) -> bool {
        let result = self.handle().and_then(|handle| {
            let changes = handle
                .conn
                .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
            Ok(changes)
        });
        match result {
            Ok(changes) => changes > 0,
            Err(e) => {
                warn!(table, id, "failed to remove history item: {}", e);
                false
            }
        }
    }

    #[cfg(test)]
    fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let handle = self.handle().unwrap();
        f(&handle.conn)
    }
}

impl HistoryStore for SqliteStore {
    fn add_text_item(&self, content: &str) -> Result<TextItem> {
        if content.is_empty() {
            return Err(CutError::InvalidInput("text content is empty".into()));
        }
        let limit = self.config.current().max_text_history;

        let mut handle = self.handle()?;
        let stamp = handle.next_stamp();
        let id = Uuid::new_v4().to_string();

        let tx = handle.conn.transaction()?;
        tx.execute(
            &format!("INSERT INTO {TEXT_TABLE} ({TEXT_COLUMNS}) VALUES (?1, ?2, ?3)"),
            params![id, content, stamp],
        )?;
        let evicted = evict_oldest(&tx, TEXT_TABLE, limit)?;
        tx.commit()?;

        if evicted > 0 {
            debug!(evicted, limit, "trimmed text history");
        }
        Ok(TextItem {
            id,
            content: content.to_string(),
            create_time: stamp_to_time(stamp),
        })
    }

    fn add_image_item(&self, image: NewImageItem) -> Result<ImageItem> {
        if image.width == 0 || image.height == 0 {
            return Err(CutError::InvalidInput(format!(
                "image dimensions must be positive, got {}x{}",
                image.width, image.height
            )));
        }
        let size = i64::try_from(image.size)
            .map_err(|_| CutError::InvalidInput(format!("image size {} too large", image.size)))?;
        let limit = self.config.current().max_image_history;

        let mut handle = self.handle()?;
        let stamp = handle.next_stamp();
        let id = Uuid::new_v4().to_string();

        let tx = handle.conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO {IMAGE_TABLE} ({IMAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![id, image.content, image.width, image.height, size, stamp],
        )?;
        let evicted = evict_oldest(&tx, IMAGE_TABLE, limit)?;
        tx.commit()?;

        if evicted > 0 {
            debug!(evicted, limit, "trimmed image history");
        }
        Ok(ImageItem {
            id,
            content: image.content,
            width: image.width,
            height: image.height,
            size: image.size,
            create_time: stamp_to_time(stamp),
        })
    }

    fn list_text_items(&self) -> Result<Vec<TextItem>> {
        let handle = self.handle()?;
        let mut stmt = handle.conn.prepare(&format!(
            "SELECT {TEXT_COLUMNS} FROM {TEXT_TABLE} ORDER BY createTime DESC"
        ))?;
        let items = stmt
            .query_map([], row_to_text_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn list_image_items(&self) -> Result<Vec<ImageItem>> {
        let handle = self.handle()?;
        let mut stmt = handle.conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM {IMAGE_TABLE} ORDER BY createTime DESC"
        ))?;
        let items = stmt
            .query_map([], row_to_image_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn get_text_item(&self, id: &str) -> Result<TextItem> {
        let handle = self.handle()?;
        handle
            .conn
            .query_row(
                &format!("SELECT {TEXT_COLUMNS} FROM {TEXT_TABLE} WHERE id = ?1"),
                params![id],
                row_to_text_item,
            )
            .map_err(not_found("Text", id))
    }

    fn get_image_item(&self, id: &str) -> Result<ImageItem> {
        let handle = self.handle()?;
        handle
            .conn
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM {IMAGE_TABLE} WHERE id = ?1"),
                params![id],
                row_to_image_item,
            )
            .map_err(not_found("Image", id))
    }

    fn remove_text_item(&self, id: &str) -> bool {
        self.remove_from(TEXT_TABLE, id)
    }

    fn remove_image_item(&self, id: &str) -> bool {
        self.remove_from(IMAGE_TABLE, id)
    }

    fn counts(&self) -> Result<HistoryCounts> {
        let handle = self.handle()?;
        let text_items =
            handle
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {TEXT_TABLE}"), [], |row| row.get(0))?;
        let image_items =
            handle
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {IMAGE_TABLE}"), [], |row| row.get(0))?;
        Ok(HistoryCounts {
            text_items,
            image_items,
        })
    }
}
