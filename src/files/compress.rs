//! Image compression for oversized attachments
//!
//! Images above the configured threshold are decoded, resized to a
//! size-tiered bounding box, and re-encoded before upload. Decoding and
//! re-encoding are CPU-bound and run on the blocking pool so the event
//! loop is never starved.

use crate::error::{ColloquyError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::ImageFormat;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

const MB: u64 = 1024 * 1024;

/// Bounding box and quality for one compression pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    /// Longest allowed edge in pixels
    pub max_dimension: u32,
    /// JPEG quality (ignored for PNG output)
    pub quality: u8,
}

/// Pick compression settings from the original file size
///
/// Larger files get a tighter box and lower quality; smaller ones keep
/// more detail.
pub fn optimal_settings(file_size: u64) -> CompressionSettings {
    if file_size > 10 * MB {
        CompressionSettings {
            max_dimension: 1920,
            quality: 80,
        }
    } else if file_size > 5 * MB {
        CompressionSettings {
            max_dimension: 2048,
            quality: 85,
        }
    } else {
        CompressionSettings {
            max_dimension: 2560,
            quality: 90,
        }
    }
}

/// Whether re-encoding this MIME type is worthwhile
pub fn is_compressible(mime: &str) -> bool {
    matches!(
        mime.to_lowercase().as_str(),
        "image/jpeg" | "image/jpg" | "image/png" | "image/webp" | "image/tiff" | "image/bmp"
    )
}

/// A compressed copy written next to the original
#[derive(Debug, Clone)]
pub struct CompressedCopy {
    pub path: PathBuf,
    pub size: u64,
    pub mime: String,
}

/// Compress an image if it exceeds the size threshold
///
/// Returns `None` when the file is small enough or its type is not
/// worth re-encoding. PNG stays PNG; everything else is re-encoded as
/// JPEG at the tiered quality. The copy lands beside the original with
/// a `_compressed` suffix; the caller owns its cleanup.
pub async fn maybe_compress(
    path: &Path,
    size: u64,
    mime: &str,
    threshold: u64,
) -> Result<Option<CompressedCopy>> {
    if size <= threshold || !is_compressible(mime) {
        return Ok(None);
    }

    let settings = optimal_settings(size);
    let input = path.to_path_buf();

    let copy = tokio::task::spawn_blocking(move || compress_blocking(&input, settings))
        .await
        .map_err(|e| ColloquyError::Io(std::io::Error::other(e.to_string())))??;

    Ok(Some(copy))
}

fn compress_blocking(input: &Path, settings: CompressionSettings) -> Result<CompressedCopy> {
    let format = ImageFormat::from_path(input).unwrap_or(ImageFormat::Jpeg);
    let img = image::open(input)
        .map_err(|e| ColloquyError::Validation(format!("unreadable image: {}", e)))?;

    let img = if img.width() > settings.max_dimension || img.height() > settings.max_dimension {
        img.resize(
            settings.max_dimension,
            settings.max_dimension,
            image::imageops::FilterType::Lanczos3,
        )
    } else {
        img
    };

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let dir = input.parent().unwrap_or_else(|| Path::new("."));

    let (output, mime) = match format {
        ImageFormat::Png => {
            let output = dir.join(format!("{}_compressed.png", stem));
            let writer = BufWriter::new(File::create(&output)?);
            let encoder = PngEncoder::new(writer);
            img.write_with_encoder(encoder)
                .map_err(|e| ColloquyError::Io(std::io::Error::other(e.to_string())))?;
            (output, "image/png".to_string())
        }
        _ => {
            let output = dir.join(format!("{}_compressed.jpg", stem));
            let writer = BufWriter::new(File::create(&output)?);
            let encoder = JpegEncoder::new_with_quality(writer, settings.quality);
            // JPEG has no alpha channel; flatten first.
            img.to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| ColloquyError::Io(std::io::Error::other(e.to_string())))?;
            (output, "image/jpeg".to_string())
        }
    };

    let size = std::fs::metadata(&output)?.len();
    Ok(CompressedCopy {
        path: output,
        size,
        mime,
    })
}
