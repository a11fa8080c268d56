//! File ingestion pipeline
//!
//! Classifies spooled uploads, compresses oversized images, and fans
//! the batch out to the provider concurrently. A single failure aborts
//! the whole batch with one aggregated error naming each failed file.
//! Temporary local copies never outlive the call: the spool guard
//! removes originals and compressed copies on every exit path.

pub mod classify;
pub mod compress;

pub use classify::{classify, FileKind};
pub use compress::{is_compressible, maybe_compress, optimal_settings, CompressionSettings};

use crate::config::FilesConfig;
use crate::error::{ColloquyError, Result};
use crate::providers::{Provider, UploadPurpose, UploadedFile};
use std::path::PathBuf;
use std::sync::Arc;

/// One uploaded file spooled to local disk by the HTTP layer
#[derive(Debug, Clone)]
pub struct SpooledUpload {
    /// Temporary local copy
    pub path: PathBuf,
    /// Original filename as submitted
    pub name: String,
    /// Declared MIME type
    pub mime: String,
    /// Size on disk in bytes
    pub size: u64,
}

/// Removes temporary files when dropped
///
/// Registered paths are deleted best-effort regardless of how the
/// pipeline exits.
#[derive(Debug, Default)]
pub struct SpoolGuard {
    paths: Vec<PathBuf>,
}

impl SpoolGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Hand cleanup responsibility to someone else
    pub fn release(&mut self) {
        self.paths.clear();
    }
}

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove spooled file");
                }
            }
        }
    }
}

/// One successfully ingested attachment
#[derive(Debug, Clone)]
pub struct IngestedFile {
    /// Provider handle and uploaded size (post-compression for images)
    pub upload: UploadedFile,
    /// Original filename
    pub name: String,
    /// MIME type of the bytes actually uploaded
    pub mime: String,
    pub kind: FileKind,
}

/// Upload outcomes partitioned by kind
#[derive(Debug, Default)]
pub struct IngestedBatch {
    pub text: Vec<IngestedFile>,
    pub images: Vec<IngestedFile>,
}

impl IngestedBatch {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.images.is_empty()
    }

    /// Handles of the text files, for knowledge store provisioning
    pub fn text_handles(&self) -> Vec<String> {
        self.text.iter().map(|f| f.upload.handle.clone()).collect()
    }

    /// Handles of the image files, attached to the user turn
    pub fn image_handles(&self) -> Vec<String> {
        self.images.iter().map(|f| f.upload.handle.clone()).collect()
    }
}

struct FileOutcome {
    name: String,
    result: Result<IngestedFile>,
    compressed_path: Option<PathBuf>,
}

/// The ingestion pipeline service
#[derive(Clone)]
pub struct FilePipeline {
    provider: Arc<dyn Provider>,
    config: FilesConfig,
}

impl FilePipeline {
    pub fn new(provider: Arc<dyn Provider>, config: FilesConfig) -> Self {
        Self { provider, config }
    }

    /// Ingest a batch of spooled uploads
    ///
    /// Uploads run concurrently. If any file fails, the whole batch is
    /// aborted: provider copies of files that did succeed are deleted
    /// best-effort and a single [`ColloquyError::Ingestion`] error names
    /// every failed file. Local spool copies are removed on all paths.
    pub async fn ingest(&self, uploads: Vec<SpooledUpload>) -> Result<IngestedBatch> {
        if uploads.is_empty() {
            return Ok(IngestedBatch::default());
        }

        let mut guard = SpoolGuard::new();
        for upload in &uploads {
            guard.add(upload.path.clone());
        }

        let outcomes =
            futures::future::join_all(uploads.iter().map(|u| self.ingest_one(u))).await;

        // Compressed copies are temporary too, whatever happened.
        for outcome in &outcomes {
            if let Some(path) = &outcome.compressed_path {
                guard.add(path.clone());
            }
        }

        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.name.clone())
            .collect();

        if !failed.is_empty() {
            for outcome in &outcomes {
                if let Ok(file) = &outcome.result {
                    if let Err(e) = self.provider.delete_file(&file.upload.handle).await {
                        tracing::warn!(
                            handle = %file.upload.handle,
                            error = %e,
                            "Failed to delete provider file after aborted batch"
                        );
                    }
                }
            }
            for outcome in &outcomes {
                if let Err(e) = &outcome.result {
                    tracing::warn!(file = %outcome.name, error = %e, "Attachment upload failed");
                }
            }
            metrics::increment_counter!("file_batches_failed_total");
            return Err(ColloquyError::Ingestion { failed }.into());
        }

        let mut batch = IngestedBatch::default();
        for outcome in outcomes {
            let file = outcome.result.expect("no failures past the check");
            match file.kind {
                FileKind::Text => batch.text.push(file),
                FileKind::Image => batch.images.push(file),
            }
        }
        metrics::increment_counter!("file_batches_ingested_total");
        Ok(batch)
    }

    async fn ingest_one(&self, upload: &SpooledUpload) -> FileOutcome {
        let kind = classify(&upload.mime, &upload.name);
        let mut compressed_path = None;

        let result = async {
            match kind {
                FileKind::Text => {
                    let uploaded = self
                        .provider
                        .upload_file(&upload.path, &upload.name, UploadPurpose::Retrieval)
                        .await?;
                    Ok(IngestedFile {
                        upload: uploaded,
                        name: upload.name.clone(),
                        mime: upload.mime.clone(),
                        kind,
                    })
                }
                FileKind::Image => {
                    let copy = maybe_compress(
                        &upload.path,
                        upload.size,
                        &upload.mime,
                        self.config.compress_threshold_bytes,
                    )
                    .await?;

                    let (path, mime) = match &copy {
                        Some(c) => {
                            compressed_path = Some(c.path.clone());
                            (c.path.clone(), c.mime.clone())
                        }
                        None => (upload.path.clone(), upload.mime.clone()),
                    };

                    let uploaded = self
                        .provider
                        .upload_file(&path, &upload.name, UploadPurpose::Vision)
                        .await?;
                    Ok(IngestedFile {
                        upload: uploaded,
                        name: upload.name.clone(),
                        mime,
                        kind,
                    })
                }
            }
        }
        .await;

        FileOutcome {
            name: upload.name.clone(),
            result,
            compressed_path,
        }
    }
}
