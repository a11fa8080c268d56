//! Attachment classification
//!
//! Pure mapping from a declared MIME type and filename to the closed
//! [`FileKind`] set, testable independently of the upload pipeline.
//! Unknown MIME types fall back to extension sniffing; anything still
//! unrecognized is treated as text so it at least reaches retrieval.

/// What an attachment is used for downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Indexed into a knowledge store for retrieval
    Text,
    /// Attached for the agent's vision input
    Image,
}

const IMAGE_MIMES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "image/gif",
    "image/tiff",
    "image/bmp",
];

const TEXT_MIMES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/csv",
    "application/json",
    "application/msword",
    "application/vnd.ms-excel",
    "text/markdown",
    "application/rtf",
];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "tiff", "bmp"];

/// Classify an attachment by declared MIME type, then filename
pub fn classify(mime: &str, filename: &str) -> FileKind {
    let mime = mime.to_lowercase();
    if IMAGE_MIMES.contains(&mime.as_str()) {
        return FileKind::Image;
    }
    if TEXT_MIMES.contains(&mime.as_str()) || mime.starts_with("text/") {
        return FileKind::Text;
    }

    // Unrecognized MIME type: sniff the extension.
    let extension = filename
        .rsplit('.')
        .next()
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        FileKind::Image
    } else {
        FileKind::Text
    }
}
