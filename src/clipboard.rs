use arboard::Clipboard;

use crate::errors::{CutError, Result};
use crate::image_bridge::decode_payload;

/// Text access to the system clipboard plus write-back of stored items.
pub trait ClipboardSource: Send + Sync {
    /// Fails when the clipboard holds no text.
    fn read_text(&self) -> Result<String>;
    fn write_text(&self, text: &str) -> Result<()>;
    /// Writes an image payload as stored in the history (PNG data URL).
    fn write_image(&self, content: &str) -> Result<()>;
}

/// The OS clipboard via `arboard`. A handle is opened per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

fn open() -> Result<Clipboard> {
    Clipboard::new().map_err(|e| CutError::Clipboard(e.to_string()))
}

impl ClipboardSource for SystemClipboard {
    fn read_text(&self) -> Result<String> {
        open()?
            .get_text()
            .map_err(|e| CutError::Clipboard(e.to_string()))
    }

    fn write_text(&self, text: &str) -> Result<()> {
        open()?
            .set_text(text)
            .map_err(|e| CutError::Clipboard(e.to_string()))
    }

    fn write_image(&self, content: &str) -> Result<()> {
        let rgba = decode_payload(content)?;
        let (w, h) = rgba.dimensions();
        let img_data = arboard::ImageData {
            width: w as usize,
            height: h as usize,
            bytes: rgba.into_raw().into(),
        };
        open()?
            .set_image(img_data)
            .map_err(|e| CutError::Clipboard(e.to_string()))
    }
}
