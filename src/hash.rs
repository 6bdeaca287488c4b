use sha2::{Digest, Sha256};

/// Content fingerprint of an RGBA frame. Dimensions are part of the digest so
/// the same pixel buffer reshaped to another size is a different image.
pub fn image_fingerprint(width: u32, height: u32, rgba: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(width.to_le_bytes());
    hasher.update(height.to_le_bytes());
    hasher.update(rgba);
    format!("{:x}", hasher.finalize())
}
