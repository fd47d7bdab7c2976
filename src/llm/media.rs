use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use image::{DynamicImage, GenericImageView, ImageFormat};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Image data is empty")]
    Empty,
    #[error("Unsupported reference image type: {0}")]
    Unsupported(String),
    #[error("Failed to re-encode reference image: {0}")]
    Encode(#[from] image::ImageError),
}

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn normalize_image_mime(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/heif" => "image/heic".to_string(),
        _ => lowered,
    }
}

fn is_supported_image(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "image/png" | "image/jpeg" | "image/webp" | "image/heic"
    )
}

fn is_decodable(mime_type: &str) -> bool {
    matches!(mime_type, "image/png" | "image/jpeg" | "image/webp")
}

static IMAGE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_image_id(prefix: &str) -> String {
    let sequence = IMAGE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_millis())
}

pub fn to_data_uri(mime_type: &str, data_base64: &str) -> String {
    format!("data:{mime_type};base64,{data_base64}")
}

/// Splits a `data:<mime>;base64,<payload>` URI back into its parts.
pub fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (mime_type, payload) = rest.split_once(";base64,")?;
    let bytes = general_purpose::STANDARD.decode(payload.trim()).ok()?;
    Some((mime_type.to_string(), bytes))
}

/// A user-supplied photo, already base64 encoded for inline upload.
/// Immutable once built; the pipeline only borrows it.
#[derive(Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    id: String,
    mime_type: String,
    data: String,
}

impl fmt::Debug for ReferenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceImage")
            .field("id", &self.id)
            .field("mime_type", &self.mime_type)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl ReferenceImage {
    #[cfg(test)]
    pub fn from_parts(
        id: impl Into<String>,
        mime_type: impl Into<String>,
        data_base64: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            mime_type: mime_type.into(),
            data: data_base64.into(),
        }
    }

    /// Sniffs the type, downscales anything whose longer side exceeds
    /// `max_side` (0 disables) and encodes the result.
    pub fn from_bytes(
        bytes: Vec<u8>,
        declared_mime: Option<&str>,
        max_side: u32,
    ) -> Result<Self, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::Empty);
        }

        let declared = declared_mime
            .map(normalize_image_mime)
            .filter(|mime| is_supported_image(mime));
        let mime_type = match declared {
            Some(mime) => mime,
            None => {
                let detected = detect_mime_type(&bytes)
                    .map(|mime| normalize_image_mime(&mime))
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                if !is_supported_image(&detected) {
                    return Err(MediaError::Unsupported(detected));
                }
                detected
            }
        };

        let (bytes, mime_type) = downscale_if_needed(bytes, mime_type, max_side)?;
        Ok(Self {
            id: next_image_id("ref"),
            data: general_purpose::STANDARD.encode(&bytes),
            mime_type,
        })
    }

    pub async fn from_path(path: &Path, max_side: u32) -> Result<Self, MediaError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| MediaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let image = Self::from_bytes(bytes, None, max_side)?;
        debug!(
            "Loaded reference image {} from {} ({}, {} base64 bytes)",
            image.id,
            path.display(),
            image.mime_type,
            image.data.len()
        );
        Ok(image)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn data_base64(&self) -> &str {
        &self.data
    }
}

fn downscale_if_needed(
    bytes: Vec<u8>,
    mime_type: String,
    max_side: u32,
) -> Result<(Vec<u8>, String), MediaError> {
    if max_side == 0 || !is_decodable(&mime_type) {
        return Ok((bytes, mime_type));
    }

    let decoded = match image::load_from_memory(&bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!("Could not decode {} reference image, sending as-is: {}", mime_type, err);
            return Ok((bytes, mime_type));
        }
    };

    let (width, height) = decoded.dimensions();
    if width.max(height) <= max_side {
        return Ok((bytes, mime_type));
    }

    let resized = decoded.thumbnail(max_side, max_side);
    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(resized.to_rgb8()).write_to(&mut encoded, ImageFormat::Jpeg)?;
    debug!(
        "Downscaled reference image from {}x{} to {}x{}",
        width,
        height,
        resized.width(),
        resized.height()
    );
    Ok((encoded.into_inner(), "image/jpeg".to_string()))
}

/// Raw image returned by a generation backend.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImagePayload {
    /// Keeps the backend's MIME type when it names an image, otherwise sniffs.
    pub fn new(bytes: Vec<u8>, mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(normalize_image_mime)
            .filter(|mime| mime.starts_with("image/"))
            .or_else(|| detect_mime_type(&bytes))
            .unwrap_or_else(|| "image/png".to_string());
        Self { bytes, mime_type }
    }

    pub fn data_uri(&self) -> String {
        to_data_uri(&self.mime_type, &general_purpose::STANDARD.encode(&self.bytes))
    }

    pub fn file_extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/heic" => "heic",
            _ => "png",
        }
    }
}
