//! Photo and text normalization.
//!
//! Uploaded images are decoded, turned upright, bounded to the configured
//! width and re-encoded as JPEG together with an inline `data:` preview.
//! Nothing here touches storage: a caller either receives a complete
//! [`NormalizedPhoto`] or an error.

use crate::config::IngestConfig;
use crate::error::{PublishError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use serde::Serialize;
use std::io::Cursor;
use tracing::{debug, instrument, warn};

/// Content type of every normalized photo
pub const NORMALIZED_CONTENT_TYPE: &str = "image/jpeg";

/// ISO-BMFF brands used by HEIC/HEIF containers
const RESTRICTED_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];

const RESTRICTED_FORMAT_MESSAGE: &str = "HEIC/HEIF photos are not supported. \
    Please convert the photo to JPEG or PNG (on iPhone: Settings > Camera > Formats > Most Compatible) \
    and upload it again.";

const GENERIC_DECODE_MESSAGE: &str =
    "This image could not be read. The file may be damaged or in an unsupported format.";

/// A photo ready to be stored and rendered
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedPhoto {
    /// Re-encoded JPEG bytes
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// `data:image/jpeg;base64,...` copy of `bytes`
    #[serde(skip)]
    pub preview_data_uri: String,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
    /// Lowercase extension for storing the untouched upload
    pub original_extension: String,
    pub size_bytes: usize,
}

/// Photo ingestion pipeline
#[derive(Debug, Clone)]
pub struct PhotoIngestor {
    config: IngestConfig,
}

impl PhotoIngestor {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Normalize an upload on the blocking pool
    pub async fn ingest_async(
        &self,
        bytes: Vec<u8>,
        file_name: String,
        mime_type: String,
    ) -> Result<NormalizedPhoto> {
        let ingestor = self.clone();
        tokio::task::spawn_blocking(move || ingestor.ingest(&bytes, &file_name, &mime_type))
            .await
            .map_err(|e| PublishError::GenerationFailed(format!("Photo ingestion task failed: {e}")))?
    }

    /// Normalize an uploaded image
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub fn ingest(&self, bytes: &[u8], file_name: &str, mime_type: &str) -> Result<NormalizedPhoto> {
        let restricted = is_restricted_container(bytes, file_name, mime_type);

        let result = self.normalize(bytes, file_name);
        match result {
            Ok(photo) => {
                metrics::counter!("publisher.photos.ingested").increment(1);
                debug!(
                    width = photo.width,
                    height = photo.height,
                    original_width = photo.original_width,
                    original_height = photo.original_height,
                    size_bytes = photo.size_bytes,
                    "Photo normalized"
                );
                Ok(photo)
            }
            Err(e) => {
                metrics::counter!("publisher.photos.rejected").increment(1);
                warn!(error = %e, restricted_format = restricted, "Photo rejected");
                Err(PublishError::UnsupportedFormat {
                    message: if restricted {
                        RESTRICTED_FORMAT_MESSAGE.to_string()
                    } else {
                        GENERIC_DECODE_MESSAGE.to_string()
                    },
                    restricted_format: restricted,
                })
            }
        }
    }

    fn normalize(&self, bytes: &[u8], file_name: &str) -> anyhow::Result<NormalizedPhoto> {
        anyhow::ensure!(!bytes.is_empty(), "Empty upload");

        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let format = reader.format();
        let mut decoder = reader.into_decoder()?;
        let orientation = decoder.orientation()?;
        let mut image = DynamicImage::from_decoder(decoder)?;
        image.apply_orientation(orientation);

        let (original_width, original_height) = (image.width(), image.height());
        anyhow::ensure!(original_width > 0 && original_height > 0, "Image has no pixels");

        let (target_width, target_height) =
            bounded_dimensions(original_width, original_height, self.config.max_width);
        if target_width != original_width {
            image = image.resize_exact(target_width, target_height, FilterType::Lanczos3);
        }

        let rgb = image.to_rgb8();
        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, self.config.jpeg_quality.clamp(1, 100))
            .encode_image(&rgb)?;

        // Prefer what the encoder actually produced
        let (width, height) = ImageReader::new(Cursor::new(&encoded))
            .with_guessed_format()
            .ok()
            .and_then(|r| r.into_dimensions().ok())
            .unwrap_or((target_width, target_height));

        let original_extension = file_extension(file_name)
            .or_else(|| format.and_then(|f| f.extensions_str().first().map(|e| e.to_string())))
            .unwrap_or_else(|| "bin".to_string());

        let preview_data_uri = format!("data:{};base64,{}", NORMALIZED_CONTENT_TYPE, STANDARD.encode(&encoded));

        Ok(NormalizedPhoto {
            size_bytes: encoded.len(),
            bytes: encoded,
            preview_data_uri,
            width,
            height,
            original_width,
            original_height,
            original_extension,
        })
    }

    /// Trim a text panel and cap it at the configured character bound
    pub fn normalize_text(&self, raw: &str) -> Result<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PublishError::InvalidInput("Text panel is empty".to_string()));
        }
        Ok(cap_chars(trimmed, self.config.text_panel_max_chars))
    }
}

/// Whether the upload looks like a container the decoder cannot read
pub fn is_restricted_container(bytes: &[u8], file_name: &str, mime_type: &str) -> bool {
    let brand_match = bytes.len() >= 12
        && &bytes[4..8] == b"ftyp"
        && RESTRICTED_BRANDS.iter().any(|brand| &bytes[8..12] == *brand);

    let extension_match = matches!(
        file_extension(file_name).as_deref(),
        Some("heic") | Some("heif")
    );

    let mime = mime_type.to_ascii_lowercase();
    let mime_match = mime.starts_with("image/heic") || mime.starts_with("image/heif");

    brand_match || extension_match || mime_match
}

/// Width/height after bounding width to `max_width`, preserving aspect ratio; never upscales
pub fn bounded_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || max_width == 0 {
        return (width, height);
    }
    let scaled_height = (height as u64 * max_width as u64 + width as u64 / 2) / width as u64;
    (max_width, scaled_height.max(1) as u32)
}

pub(crate) fn cap_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn file_extension(file_name: &str) -> Option<String> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};

    fn ingestor() -> PhotoIngestor {
        PhotoIngestor::new(IngestConfig::default())
    }

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn heic_like_bytes() -> Vec<u8> {
        let mut bytes = vec![0x00, 0x00, 0x00, 0x18];
        bytes.extend_from_slice(b"ftypheic");
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(b"mif1heic");
        bytes.extend_from_slice(&[0xAB; 64]);
        bytes
    }

    #[test]
    fn test_wide_photo_is_downscaled_preserving_aspect() {
        let photo = ingestor()
            .ingest(&png_fixture(1600, 900), "beach.png", "image/png")
            .unwrap();

        assert_eq!((photo.width, photo.height), (800, 450));
        assert_eq!((photo.original_width, photo.original_height), (1600, 900));
        assert_eq!(photo.original_extension, "png");
        assert!(photo.preview_data_uri.starts_with("data:image/jpeg;base64,"));
        // JPEG SOI marker
        assert_eq!(&photo.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(photo.size_bytes, photo.bytes.len());
    }

    #[test]
    fn test_small_photo_is_never_upscaled() {
        let photo = ingestor()
            .ingest(&png_fixture(300, 200), "small.PNG", "image/png")
            .unwrap();
        assert_eq!((photo.width, photo.height), (300, 200));
        assert_eq!(photo.original_extension, "png");
    }

    #[test]
    fn test_preview_decodes_to_normalized_bytes() {
        let photo = ingestor()
            .ingest(&png_fixture(100, 100), "a.png", "image/png")
            .unwrap();
        let encoded = photo
            .preview_data_uri
            .strip_prefix("data:image/jpeg;base64,")
            .unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), photo.bytes);
    }

    #[test]
    fn test_heic_container_gets_distinct_message() {
        let err = ingestor()
            .ingest(&heic_like_bytes(), "IMG_0001.jpg", "image/jpeg")
            .unwrap_err();

        match err {
            PublishError::UnsupportedFormat {
                message,
                restricted_format,
            } => {
                assert!(restricted_format);
                assert!(message.contains("HEIC"));
            }
            other => panic!("Expected UnsupportedFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_file_gets_generic_message() {
        let err = ingestor()
            .ingest(b"definitely not an image", "photo.jpg", "image/jpeg")
            .unwrap_err();

        match err {
            PublishError::UnsupportedFormat {
                message,
                restricted_format,
            } => {
                assert!(!restricted_format);
                assert!(!message.contains("HEIC"));
                assert_eq!(message, GENERIC_DECODE_MESSAGE);
            }
            other => panic!("Expected UnsupportedFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_upload_is_rejected() {
        let err = ingestor().ingest(&[], "photo.jpg", "image/jpeg").unwrap_err();
        assert!(matches!(err, PublishError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_restricted_detection_hints() {
        assert!(is_restricted_container(&heic_like_bytes(), "x.bin", "application/octet-stream"));
        assert!(is_restricted_container(b"", "IMG_1.HEIC", ""));
        assert!(is_restricted_container(b"", "photo", "image/heif"));
        assert!(!is_restricted_container(&png_fixture(2, 2), "a.png", "image/png"));
    }

    #[test]
    fn test_decodable_upload_with_heic_name_still_succeeds() {
        let photo = ingestor()
            .ingest(&png_fixture(40, 20), "renamed.heic", "image/heic")
            .unwrap();
        assert_eq!((photo.width, photo.height), (40, 20));
    }

    #[test]
    fn test_bounded_dimensions() {
        assert_eq!(bounded_dimensions(1600, 1200, 800), (800, 600));
        assert_eq!(bounded_dimensions(801, 3, 800), (800, 3));
        assert_eq!(bounded_dimensions(4000, 1, 800), (800, 1));
        assert_eq!(bounded_dimensions(800, 2000, 800), (800, 2000));
    }

    #[test]
    fn test_normalize_text() {
        let ingestor = ingestor();
        assert_eq!(ingestor.normalize_text("  hi there \n").unwrap(), "hi there");
        assert!(matches!(
            ingestor.normalize_text("   "),
            Err(PublishError::InvalidInput(_))
        ));
        let long = "é".repeat(900);
        assert_eq!(ingestor.normalize_text(&long).unwrap().chars().count(), 500);
    }
}
