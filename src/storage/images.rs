// src/storage/images.rs
//! Content-addressed image handling: digest, dimension probe, deterministic
//! thumbnail. The pure preparation step is separate from persistence so it
//! can be tested without a database.

use image::imageops::FilterType;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const THUMB_MAX_DIM: u32 = 320;
const ALLOWED_MIME: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// Raw downloaded media, before preparation.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Image ready for persistence.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub id: Uuid,
    pub sha256: String,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: usize,
    pub bytes: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
}

/// Validate, hash and thumbnail one image. Returns `None` for oversized,
/// unsupported, or undecodable payloads.
pub fn prepare_image(img: &NewImage) -> Option<PreparedImage> {
    if img.bytes.is_empty() || img.bytes.len() > MAX_IMAGE_BYTES {
        return None;
    }
    if !ALLOWED_MIME.contains(&img.mime_type.as_str()) {
        return None;
    }

    let sha256 = hex_digest(&img.bytes);

    let decoded = image::load_from_memory(&img.bytes).ok();
    let (width, height) = decoded
        .as_ref()
        .map(|d| (Some(d.width()), Some(d.height())))
        .unwrap_or((None, None));

    // Thumbnail derivation is deterministic: fixed filter, fixed bound,
    // fixed output format. Undecodable bytes get no thumbnail but are kept.
    let thumbnail = decoded.and_then(|d| {
        let thumb = d.resize(THUMB_MAX_DIM, THUMB_MAX_DIM, FilterType::Lanczos3);
        let mut out = std::io::Cursor::new(Vec::new());
        thumb
            .to_rgb8()
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .ok()?;
        Some(out.into_inner())
    });

    Some(PreparedImage {
        id: Uuid::new_v4(),
        sha256,
        mime_type: img.mime_type.clone(),
        width,
        height,
        file_size: img.bytes.len(),
        bytes: img.bytes.clone(),
        thumbnail,
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn prepares_and_thumbnails_png() {
        let bytes = png_bytes(640, 480);
        let prepared = prepare_image(&NewImage {
            bytes: bytes.clone(),
            mime_type: "image/png".into(),
        })
        .unwrap();
        assert_eq!(prepared.width, Some(640));
        assert_eq!(prepared.height, Some(480));
        assert_eq!(prepared.file_size, bytes.len());
        assert_eq!(prepared.sha256.len(), 64);
        let thumb = prepared.thumbnail.expect("thumbnail");
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert!(decoded.width() <= 320 && decoded.height() <= 320);
    }

    #[test]
    fn digest_is_content_addressed() {
        let a = prepare_image(&NewImage {
            bytes: png_bytes(8, 8),
            mime_type: "image/png".into(),
        })
        .unwrap();
        let b = prepare_image(&NewImage {
            bytes: png_bytes(8, 8),
            mime_type: "image/png".into(),
        })
        .unwrap();
        assert_eq!(a.sha256, b.sha256);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn rejects_unsupported_mime_and_oversize() {
        assert!(prepare_image(&NewImage {
            bytes: vec![1, 2, 3],
            mime_type: "application/pdf".into(),
        })
        .is_none());
        assert!(prepare_image(&NewImage {
            bytes: vec![0; MAX_IMAGE_BYTES + 1],
            mime_type: "image/png".into(),
        })
        .is_none());
    }

    #[test]
    fn keeps_undecodable_bytes_without_thumbnail() {
        let prepared = prepare_image(&NewImage {
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
            mime_type: "image/jpeg".into(),
        })
        .unwrap();
        assert!(prepared.thumbnail.is_none());
        assert_eq!(prepared.width, None);
    }
}
