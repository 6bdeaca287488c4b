use std::io::Cursor;
use std::sync::{Mutex, PoisonError};

use arboard::Clipboard;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{CutError, Result};
use crate::hash::image_fingerprint;
use crate::storage::models::NewImageItem;

/// Longest edge, in pixels, of a stored image.
pub const MAX_IMAGE_EDGE: u32 = 1600;

pub const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Result of one capture: an encoded, possibly downscaled clipboard image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedImage {
    pub base64_data: String,
    pub width: u32,
    pub height: u32,
    pub original_size: u64,
}

impl From<ProcessedImage> for NewImageItem {
    fn from(image: ProcessedImage) -> Self {
        NewImageItem {
            content: image.base64_data,
            width: image.width,
            height: image.height,
            size: image.original_size,
        }
    }
}

/// Reads, deduplicates, downscales and encodes the clipboard image in one
/// call. Implementations keep their own record of the last image seen.
pub trait ImageProcessor: Send + Sync {
    /// `None` when the clipboard holds no image or the same image as last time.
    fn capture_and_process(&self) -> Result<Option<ProcessedImage>>;
}

/// Raw RGBA pixels as read from the clipboard.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

pub struct ClipboardImageProcessor {
    last_fingerprint: Mutex<Option<String>>,
    max_edge: u32,
}

impl Default for ClipboardImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardImageProcessor {
    pub fn new() -> Self {
        Self::with_max_edge(MAX_IMAGE_EDGE)
    }

    pub fn with_max_edge(max_edge: u32) -> Self {
        Self {
            last_fingerprint: Mutex::new(None),
            max_edge: max_edge.max(1),
        }
    }

    fn read_frame() -> Result<Option<RawFrame>> {
        let mut cb = Clipboard::new().map_err(|e| CutError::Clipboard(e.to_string()))?;
        let img = match cb.get_image() {
            Ok(img) => img,
            Err(arboard::Error::ContentNotAvailable) => return Ok(None),
            Err(e) => return Err(CutError::Clipboard(e.to_string())),
        };
        let width = u32::try_from(img.width)
            .map_err(|_| CutError::Image(format!("image width {} out of range", img.width)))?;
        let height = u32::try_from(img.height)
            .map_err(|_| CutError::Image(format!("image height {} out of range", img.height)))?;
        Ok(Some(RawFrame {
            width,
            height,
            rgba: img.bytes.into_owned(),
        }))
    }

    /// Dedup and encode step. A missing frame forgets the last fingerprint, so
    /// copying the same image again after some text counts as new.
    pub fn process_frame(&self, frame: Option<RawFrame>) -> Result<Option<ProcessedImage>> {
        let mut last = self
            .last_fingerprint
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(frame) = frame else {
            *last = None;
            return Ok(None);
        };
        if frame.width == 0 || frame.height == 0 || frame.rgba.is_empty() {
            return Ok(None);
        }

        let fingerprint = image_fingerprint(frame.width, frame.height, &frame.rgba);
        if last.as_deref() == Some(fingerprint.as_str()) {
            return Ok(None);
        }
        *last = Some(fingerprint);
        drop(last);

        debug!(width = frame.width, height = frame.height, "new clipboard image");
        encode_frame(frame, self.max_edge).map(Some)
    }
}

impl ImageProcessor for ClipboardImageProcessor {
    fn capture_and_process(&self) -> Result<Option<ProcessedImage>> {
        let frame = Self::read_frame()?;
        self.process_frame(frame)
    }
}

/// Forces alpha to opaque, fits the frame within `max_edge` and encodes it
/// as a PNG data URL.
pub fn encode_frame(frame: RawFrame, max_edge: u32) -> Result<ProcessedImage> {
    let original_size = u64::from(frame.width) * u64::from(frame.height) * 4;

    let mut rgba = frame.rgba;
    for alpha in rgba.iter_mut().skip(3).step_by(4) {
        *alpha = 255;
    }
    let buffer = RgbaImage::from_raw(frame.width, frame.height, rgba).ok_or_else(|| {
        CutError::Image(format!(
            "pixel buffer does not match {}x{}",
            frame.width, frame.height
        ))
    })?;

    let mut img = DynamicImage::ImageRgba8(buffer);
    if img.width().max(img.height()) > max_edge {
        img = img.resize(max_edge, max_edge, FilterType::Triangle);
    }

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| CutError::Image(format!("PNG encoding failed: {}", e)))?;

    Ok(ProcessedImage {
        base64_data: format!("{}{}", DATA_URL_PREFIX, B64.encode(&png)),
        width: img.width(),
        height: img.height(),
        original_size,
    })
}

/// Decodes a stored payload (data URL or bare base64) back into pixels.
pub fn decode_payload(content: &str) -> Result<RgbaImage> {
    let encoded = content
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(content);
    let bytes = B64
        .decode(encoded.trim())
        .map_err(|e| CutError::Image(format!("invalid base64 payload: {}", e)))?;
    let img = image::load_from_memory(&bytes).map_err(|e| CutError::Image(e.to_string()))?;
    Ok(img.to_rgba8())
}
