//! Base provider trait and common types
//!
//! This module defines the `Provider` trait through which the hosted AI
//! platform is consumed: conversation threads, streamed agent replies,
//! file uploads, and searchable knowledge stores. The platform is an
//! opaque capability; nothing else in the crate talks to it directly.

use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;

/// What an uploaded file will be used for on the provider side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPurpose {
    /// Text-like files indexed into a knowledge store for retrieval
    Retrieval,
    /// Image files attached to the conversation for the agent to see
    Vision,
}

impl UploadPurpose {
    /// Wire value expected by the provider's file endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPurpose::Retrieval => "assistants",
            UploadPurpose::Vision => "vision",
        }
    }
}

/// A provider-assigned handle for one uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Opaque provider file handle
    pub handle: String,
    /// Size the provider recorded, in bytes
    pub size: u64,
}

/// Liveness snapshot of a provider-side knowledge store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub handle: String,
    /// Provider-reported status string; `"expired"` means dead
    pub status: String,
}

impl StoreInfo {
    /// Whether the store can still serve retrieval queries
    pub fn is_live(&self) -> bool {
        self.status != "expired"
    }
}

/// Usage counts reported by the provider for one completed reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Units consumed by the submitted context
    pub input_units: u64,
    /// Units consumed by the generated reply
    pub output_units: u64,
}

/// One event from a streamed agent reply
///
/// The upstream callback/event soup is modeled as a typed stream of
/// exactly these three cases; the streaming proxy consumes it with a
/// plain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// One incremental text fragment
    Delta(String),
    /// The reply finished; usage counts included when reported
    Completed { usage: Option<TokenUsage> },
    /// The reply failed upstream after the stream began
    Failed(String),
}

/// A streamed agent reply
pub type CompletionStream = Pin<Box<dyn Stream<Item = CompletionEvent> + Send>>;

/// The hosted AI platform, consumed as an opaque capability
///
/// Implementations must be cheap to share behind an `Arc`; every method
/// is a single network round trip except [`Provider::stream_reply`],
/// which returns a live stream.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Create a new conversation thread, returning its opaque handle
    async fn create_thread(&self) -> Result<String>;

    /// Append a user turn to a thread
    ///
    /// Image handles, when present, are attached so the agent can see
    /// them during the turn.
    async fn add_user_turn(
        &self,
        thread_ref: &str,
        content: &str,
        image_handles: &[String],
    ) -> Result<()>;

    /// Start the agent's streamed reply for the latest turn
    ///
    /// `store_handle` scopes retrieval to one knowledge store. An
    /// expired store surfaces as `ColloquyError::ResourceExpired` so the
    /// caller can recover and retry.
    async fn stream_reply(
        &self,
        thread_ref: &str,
        agent_ref: &str,
        store_handle: Option<&str>,
    ) -> Result<CompletionStream>;

    /// Upload a local file for the given purpose
    async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
        purpose: UploadPurpose,
    ) -> Result<UploadedFile>;

    /// Delete an uploaded file
    async fn delete_file(&self, handle: &str) -> Result<()>;

    /// Provision a searchable store over the given file handles
    ///
    /// Expiry is anchored to last-activity time with the given window.
    async fn create_store(
        &self,
        label: &str,
        file_handles: &[String],
        expiry_days: i64,
    ) -> Result<String>;

    /// Add files to an existing store
    async fn add_store_files(&self, store_handle: &str, file_handles: &[String]) -> Result<()>;

    /// Fetch a store's liveness status
    ///
    /// A store the provider no longer knows surfaces as
    /// `ColloquyError::ResourceExpired`.
    async fn retrieve_store(&self, store_handle: &str) -> Result<StoreInfo>;

    /// Delete a store on the provider side
    async fn delete_store(&self, store_handle: &str) -> Result<()>;

    /// Best-effort short title for a first message
    ///
    /// Failures are non-fatal for callers; they fall back to a generic
    /// title.
    async fn summarize_title(&self, content: &str) -> Result<String>;
}
