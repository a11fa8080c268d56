//! Test utilities for Colloquy
//!
//! Provides a scripted [`FakeProvider`] standing in for the hosted AI
//! platform. Unit tests and integration tests both drive it, so the
//! module is compiled unconditionally; nothing here is reachable from
//! production code paths.

use crate::error::{ColloquyError, Result};
use crate::providers::{
    CompletionEvent, CompletionStream, Provider, StoreInfo, UploadPurpose, UploadedFile,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

struct FakeState {
    /// Scripted reply event sequences, consumed per stream_reply call
    replies: VecDeque<Vec<CompletionEvent>>,
    /// Per-event delay applied to streamed replies
    reply_delay: Option<Duration>,
    /// Filenames whose upload should fail
    failing_uploads: HashSet<String>,
    /// Live provider stores and their reported status
    stores: HashMap<String, String>,
    /// Thread handles created so far
    threads: Vec<String>,
    /// (thread, content, image handles) of recorded user turns
    turns: Vec<(String, String, Vec<String>)>,
    /// Store handles passed to stream_reply, in call order
    stream_store_refs: Vec<Option<String>>,
    /// Title to return from summarize_title
    title: std::result::Result<String, String>,
    uploaded: usize,
    deleted_files: usize,
    deleted_stores: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            replies: VecDeque::new(),
            reply_delay: None,
            failing_uploads: HashSet::new(),
            stores: HashMap::new(),
            threads: Vec::new(),
            turns: Vec::new(),
            stream_store_refs: Vec::new(),
            title: Ok("\"Quick Summary Title\"".to_string()),
            uploaded: 0,
            deleted_files: 0,
            deleted_stores: 0,
        }
    }
}

/// Scripted provider double
///
/// Default behavior: every call succeeds, uploads get sequential
/// handles, and streamed replies produce two deltas and a completion.
/// Tests can script failures, expiries, and custom reply sequences.
pub struct FakeProvider {
    state: Mutex<FakeState>,
    counter: AtomicUsize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            counter: AtomicUsize::new(0),
        }
    }

    fn next_id(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue one scripted reply sequence for the next stream_reply call
    pub fn push_reply(&self, events: Vec<CompletionEvent>) {
        self.state.lock().unwrap().replies.push_back(events);
    }

    /// Delay each streamed event by the given duration
    pub fn set_reply_delay(&self, delay: Duration) {
        self.state.lock().unwrap().reply_delay = Some(delay);
    }

    /// Make uploads of the given filename fail
    pub fn fail_uploads_named(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_uploads
            .insert(name.to_string());
    }

    /// Mark a provider store as expired
    pub fn expire_store(&self, handle: &str) {
        self.state
            .lock()
            .unwrap()
            .stores
            .insert(handle.to_string(), "expired".to_string());
    }

    /// Register a store handle created outside the provider
    pub fn register_store(&self, handle: &str) {
        self.state
            .lock()
            .unwrap()
            .stores
            .insert(handle.to_string(), "completed".to_string());
    }

    /// Make summarize_title fail
    pub fn fail_titles(&self) {
        self.state.lock().unwrap().title = Err("title model unavailable".to_string());
    }

    /// Set the raw title string the provider returns
    pub fn set_title(&self, title: &str) {
        self.state.lock().unwrap().title = Ok(title.to_string());
    }

    pub fn uploaded_count(&self) -> usize {
        self.state.lock().unwrap().uploaded
    }

    pub fn deleted_count(&self) -> usize {
        self.state.lock().unwrap().deleted_files
    }

    pub fn store_count(&self) -> usize {
        self.state.lock().unwrap().stores.len()
    }

    pub fn deleted_store_count(&self) -> usize {
        self.state.lock().unwrap().deleted_stores
    }

    /// Store handles passed to stream_reply, in call order
    pub fn stream_store_refs(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().stream_store_refs.clone()
    }

    /// Recorded user turns as (thread, content, image handles)
    pub fn turns(&self) -> Vec<(String, String, Vec<String>)> {
        self.state.lock().unwrap().turns.clone()
    }

    fn default_reply() -> Vec<CompletionEvent> {
        vec![
            CompletionEvent::Delta("Hello ".to_string()),
            CompletionEvent::Delta("there!".to_string()),
            CompletionEvent::Completed { usage: None },
        ]
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_thread(&self) -> Result<String> {
        let handle = format!("thread_{}", self.next_id());
        self.state.lock().unwrap().threads.push(handle.clone());
        Ok(handle)
    }

    async fn add_user_turn(
        &self,
        thread_ref: &str,
        content: &str,
        image_handles: &[String],
    ) -> Result<()> {
        self.state.lock().unwrap().turns.push((
            thread_ref.to_string(),
            content.to_string(),
            image_handles.to_vec(),
        ));
        Ok(())
    }

    async fn stream_reply(
        &self,
        _thread_ref: &str,
        _agent_ref: &str,
        store_handle: Option<&str>,
    ) -> Result<CompletionStream> {
        let (events, delay) = {
            let mut state = self.state.lock().unwrap();

            if let Some(handle) = store_handle {
                match state.stores.get(handle) {
                    Some(status) if status == "expired" => {
                        return Err(ColloquyError::ResourceExpired(handle.to_string()).into());
                    }
                    None => {
                        return Err(ColloquyError::ResourceExpired(handle.to_string()).into());
                    }
                    Some(_) => {}
                }
            }

            state
                .stream_store_refs
                .push(store_handle.map(|s| s.to_string()));
            let events = state
                .replies
                .pop_front()
                .unwrap_or_else(Self::default_reply);
            (events, state.reply_delay)
        };

        let stream = futures::stream::iter(events);
        match delay {
            Some(delay) => {
                use futures::StreamExt;
                Ok(Box::pin(stream.then(move |event| async move {
                    tokio::time::sleep(delay).await;
                    event
                })))
            }
            None => Ok(Box::pin(stream)),
        }
    }

    async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
        _purpose: UploadPurpose,
    ) -> Result<UploadedFile> {
        {
            let state = self.state.lock().unwrap();
            if state.failing_uploads.contains(filename) {
                return Err(
                    ColloquyError::UpstreamTransient(format!("upload rejected: {}", filename))
                        .into(),
                );
            }
        }

        let size = tokio::fs::metadata(path).await?.len();
        let handle = format!("file_{}", self.next_id());
        self.state.lock().unwrap().uploaded += 1;
        Ok(UploadedFile { handle, size })
    }

    async fn delete_file(&self, _handle: &str) -> Result<()> {
        self.state.lock().unwrap().deleted_files += 1;
        Ok(())
    }

    async fn create_store(
        &self,
        _label: &str,
        _file_handles: &[String],
        _expiry_days: i64,
    ) -> Result<String> {
        let handle = format!("ks_{}", self.next_id());
        self.state
            .lock()
            .unwrap()
            .stores
            .insert(handle.clone(), "completed".to_string());
        Ok(handle)
    }

    async fn add_store_files(&self, store_handle: &str, _file_handles: &[String]) -> Result<()> {
        let state = self.state.lock().unwrap();
        match state.stores.get(store_handle) {
            Some(status) if status != "expired" => Ok(()),
            _ => Err(ColloquyError::ResourceExpired(store_handle.to_string()).into()),
        }
    }

    async fn retrieve_store(&self, store_handle: &str) -> Result<StoreInfo> {
        let state = self.state.lock().unwrap();
        match state.stores.get(store_handle) {
            Some(status) => Ok(StoreInfo {
                handle: store_handle.to_string(),
                status: status.clone(),
            }),
            None => Err(ColloquyError::ResourceExpired(store_handle.to_string()).into()),
        }
    }

    async fn delete_store(&self, store_handle: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stores.remove(store_handle);
        state.deleted_stores += 1;
        Ok(())
    }

    async fn summarize_title(&self, _content: &str) -> Result<String> {
        match &self.state.lock().unwrap().title {
            Ok(title) => Ok(title.clone()),
            Err(message) => Err(ColloquyError::UpstreamTransient(message.clone()).into()),
        }
    }
}
