//! Hosted platform provider implementation
//!
//! Speaks JSON and multipart over `reqwest` to the assistant platform's
//! REST surface: threads, streamed runs, file uploads, and vector-store
//! style knowledge stores. The streamed run response is an SSE byte
//! stream parsed incrementally into [`CompletionEvent`]s.

use crate::config::ProviderConfig;
use crate::error::{ColloquyError, Result};
use crate::providers::base::{
    CompletionEvent, CompletionStream, Provider, StoreInfo, TokenUsage, UploadPurpose,
    UploadedFile,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

/// Provider adapter for the hosted assistant platform
pub struct HostedProvider {
    client: Client,
    api_base: Url,
    api_key: String,
    title_model: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    id: String,
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct StoreResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl HostedProvider {
    /// Create a provider adapter from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the API key environment variable is unset or
    /// HTTP client initialization fails.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ColloquyError::Config(format!(
                "Provider API key not set (expected env var {})",
                config.api_key_env
            ))
        })?;

        let api_base = Url::parse(&config.api_base)
            .map_err(|e| ColloquyError::Config(format!("Invalid provider api_base: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ColloquyError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base,
            api_key,
            title_model: config.title_model.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        // Url::join treats a base without a trailing slash as a file,
        // so build by appending to the path segments instead.
        let mut url = self.api_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ColloquyError::Config("Provider api_base cannot be a base URL".to_string())
            })?;
            segments.pop_if_empty();
            for part in path.split('/') {
                segments.push(part);
            }
        }
        Ok(url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    /// Turn a non-success response into the matching error category
    async fn classify_failure(response: reqwest::Response) -> anyhow::Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body).into()
    }
}

/// Map a provider HTTP failure onto the error taxonomy
///
/// Expiry signals become `ResourceExpired` so callers can recover;
/// timeouts and 5xx become `UpstreamTransient`; the rest is a plain
/// provider error.
fn classify_status(status: StatusCode, body: &str) -> ColloquyError {
    let lowered = body.to_lowercase();
    let expired_signal = lowered.contains("vector_store")
        || lowered.contains("vector store")
        || lowered.contains("knowledge store");
    if expired_signal && (lowered.contains("expired") || lowered.contains("not found")) {
        return ColloquyError::ResourceExpired(truncate(body, 200));
    }

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return ColloquyError::UpstreamTransient(format!("{}: {}", status, truncate(body, 200)));
    }

    ColloquyError::Provider(format!("{}: {}", status, truncate(body, 200)))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[async_trait]
impl Provider for HostedProvider {
    fn name(&self) -> &str {
        "hosted"
    }

    async fn create_thread(&self) -> Result<String> {
        let url = self.endpoint("threads")?;
        let response = self.authed(self.client.post(url)).json(&json!({})).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        let thread: IdResponse = response.json().await?;
        Ok(thread.id)
    }

    async fn add_user_turn(
        &self,
        thread_ref: &str,
        content: &str,
        image_handles: &[String],
    ) -> Result<()> {
        let url = self.endpoint(&format!("threads/{}/messages", thread_ref))?;

        let body = if image_handles.is_empty() {
            json!({ "role": "user", "content": content })
        } else {
            let mut parts = vec![json!({ "type": "text", "text": content })];
            for handle in image_handles {
                parts.push(json!({
                    "type": "image_file",
                    "image_file": { "file_id": handle }
                }));
            }
            json!({ "role": "user", "content": parts })
        };

        let response = self.authed(self.client.post(url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        Ok(())
    }

    async fn stream_reply(
        &self,
        thread_ref: &str,
        agent_ref: &str,
        store_handle: Option<&str>,
    ) -> Result<CompletionStream> {
        let url = self.endpoint(&format!("threads/{}/runs", thread_ref))?;

        let mut body = json!({
            "assistant_id": agent_ref,
            "stream": true,
        });
        if let Some(store) = store_handle {
            body["tool_resources"] = json!({
                "file_search": { "vector_store_ids": [store] }
            });
        }

        let response = self.authed(self.client.post(url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(parse_completion_stream(response.bytes_stream(), tx));

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
        purpose: UploadPurpose,
    ) -> Result<UploadedFile> {
        let url = self.endpoint("files")?;
        let contents = tokio::fs::read(path).await?;

        let part = reqwest::multipart::Part::bytes(contents).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", purpose.as_str())
            .part("file", part);

        let response = self.authed(self.client.post(url)).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        let file: FileResponse = response.json().await?;
        Ok(UploadedFile {
            handle: file.id,
            size: file.bytes,
        })
    }

    async fn delete_file(&self, handle: &str) -> Result<()> {
        let url = self.endpoint(&format!("files/{}", handle))?;
        let response = self.authed(self.client.delete(url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        Ok(())
    }

    async fn create_store(
        &self,
        label: &str,
        file_handles: &[String],
        expiry_days: i64,
    ) -> Result<String> {
        let url = self.endpoint("vector_stores")?;
        let body = json!({
            "name": label,
            "file_ids": file_handles,
            "expires_after": {
                "anchor": "last_active_at",
                "days": expiry_days,
            },
        });

        let response = self.authed(self.client.post(url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        let store: StoreResponse = response.json().await?;
        Ok(store.id)
    }

    async fn add_store_files(&self, store_handle: &str, file_handles: &[String]) -> Result<()> {
        if file_handles.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(&format!("vector_stores/{}/file_batches", store_handle))?;
        let response = self
            .authed(self.client.post(url))
            .json(&json!({ "file_ids": file_handles }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        Ok(())
    }

    async fn retrieve_store(&self, store_handle: &str) -> Result<StoreInfo> {
        let url = self.endpoint(&format!("vector_stores/{}", store_handle))?;
        let response = self.authed(self.client.get(url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ColloquyError::ResourceExpired(store_handle.to_string()).into());
        }
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let store: StoreResponse = response.json().await?;
        Ok(StoreInfo {
            handle: store.id,
            status: store.status.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn delete_store(&self, store_handle: &str) -> Result<()> {
        let url = self.endpoint(&format!("vector_stores/{}", store_handle))?;
        let response = self.authed(self.client.delete(url)).send().await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Self::classify_failure(response).await);
        }
        Ok(())
    }

    async fn summarize_title(&self, content: &str) -> Result<String> {
        let url = self.endpoint("chat/completions")?;
        let prompt = format!(
            "Summarize this user message in 4 words max for a chat title:\n\"{}\"",
            content
        );
        let body = json!({
            "model": self.title_model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": 16,
        });

        let response = self.authed(self.client.post(url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let title = completion
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(title)
    }
}

// ---------------------------------------------------------------------------
// SSE parser for streamed runs
// ---------------------------------------------------------------------------

/// Parse the run SSE byte stream into completion events
///
/// Runs inside a `tokio::spawn`; consumes the byte stream until it ends
/// or a terminal event is produced. Events are separated by blank lines;
/// each block carries `event:` and `data:` fields. If the byte stream
/// ends without a terminal event, a `Failed` event is synthesized so the
/// consumer never hangs.
pub(crate) async fn parse_completion_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    tx: mpsc::UnboundedSender<CompletionEvent>,
) {
    use futures::StreamExt;

    let mut buffer = String::new();
    let mut terminal_sent = false;

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(e) => {
                if !terminal_sent {
                    let _ = tx.send(CompletionEvent::Failed(format!("stream read error: {}", e)));
                    terminal_sent = true;
                }
                break;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(s) => s.to_string(),
            Err(_) => continue,
        };
        buffer.push_str(&text);

        // SSE events are separated by blank lines (`\n\n`).
        while let Some(pos) = buffer.find("\n\n") {
            let block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();

            if let Some(event) = parse_sse_block(&block) {
                let is_terminal = !matches!(event, CompletionEvent::Delta(_));
                if tx.send(event).is_err() {
                    // Consumer hung up; stop at this suspension point.
                    return;
                }
                if is_terminal {
                    terminal_sent = true;
                    return;
                }
            }
        }
    }

    if !terminal_sent {
        let _ = tx.send(CompletionEvent::Failed(
            "stream ended without completion".to_string(),
        ));
    }
}

/// Parse one SSE block into a completion event
///
/// Returns `None` for blocks that carry no content: pings, step events,
/// the `[DONE]` marker, and anything unrecognized.
pub(crate) fn parse_sse_block(block: &str) -> Option<CompletionEvent> {
    let mut event_type: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        }
        // Lines starting with `:` are SSE comments; all others are ignored.
    }

    let data = data_lines.join("\n");
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match event_type {
        Some("thread.message.delta") => {
            let parsed: serde_json::Value = serde_json::from_str(&data).ok()?;
            let delta = parsed["delta"]["content"]
                .as_array()?
                .iter()
                .filter_map(|part| part["text"]["value"].as_str())
                .collect::<String>();
            if delta.is_empty() {
                None
            } else {
                Some(CompletionEvent::Delta(delta))
            }
        }
        Some("thread.run.completed") => {
            let parsed: serde_json::Value = serde_json::from_str(&data).ok()?;
            let usage = parsed.get("usage").and_then(|u| {
                Some(TokenUsage {
                    input_units: u.get("prompt_tokens")?.as_u64()?,
                    output_units: u.get("completion_tokens")?.as_u64()?,
                })
            });
            Some(CompletionEvent::Completed { usage })
        }
        Some("thread.run.failed") | Some("thread.run.expired") | Some("error") => {
            let parsed: serde_json::Value = serde_json::from_str(&data).unwrap_or_default();
            let message = parsed["last_error"]["message"]
                .as_str()
                .or_else(|| parsed["message"].as_str())
                .unwrap_or("run failed")
                .to_string();
            Some(CompletionEvent::Failed(message))
        }
        _ => None,
    }
}
