//! Streaming response proxy
//!
//! Bridges one provider completion stream into the client-facing SSE
//! stream. Two tasks cooperate per request:
//!
//! - the **pump** drains the upstream typed event stream into an
//!   unbounded FIFO queue and is never blocked by the client;
//! - the **relay** forwards frames through a bounded channel (the
//!   backpressure point: a full channel suspends the relay, frames are
//!   never dropped or reordered), ticks heartbeat comments until the
//!   first delta, and finalizes persistence and usage accounting.
//!
//! Client disconnect is observed as a failed channel send; the relay
//! stops forwarding immediately, persists exactly the delivered text as
//! an incomplete message, commits no usage, and cancels the pump, which
//! stops at its next suspension point without forcibly aborting the
//! upstream call.

use crate::config::StreamConfig;
use crate::error::ColloquyError;
use crate::providers::{CompletionEvent, CompletionStream, TokenUsage};
use crate::quota::{estimate_units, UsageLedger};
use crate::storage::{ChatMessage, MessageStatus, Sender, SqliteStorage};
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Heartbeat comment frame sent until the first delta arrives
const HEARTBEAT_FRAME: &[u8] = b": heartbeat\n\n";

/// One typed frame of the server-to-client stream
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "SESSION")]
    Session { session_id: String, title: String },
    #[serde(rename = "SUCCESS")]
    Success { delta: String },
    #[serde(rename = "END")]
    End,
    #[serde(rename = "ERROR")]
    Error { error: String, code: String },
}

impl Frame {
    /// Encode as one SSE `data:` frame
    pub fn encode(&self) -> Bytes {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            "{\"type\":\"ERROR\",\"error\":\"encoding failure\",\"code\":\"SYSTEM\"}".to_string()
        });
        Bytes::from(format!("data: {}\n\n", json))
    }
}

/// Everything the proxy needs to finalize one streamed exchange
pub struct StreamContext {
    pub storage: Arc<SqliteStorage>,
    pub ledger: UsageLedger,
    pub account_id: String,
    pub session_id: String,
    pub session_title: String,
    /// The submitted text, for usage estimation fallback
    pub user_content: String,
    pub config: StreamConfig,
}

/// What the relay loop ended with
enum StreamOutcome {
    Completed { usage: Option<TokenUsage> },
    Disconnected,
    Failed(String),
    TimedOut,
}

/// Start the proxy tasks and build the streaming HTTP response
///
/// The response headers disable caching and intermediary buffering;
/// compression and SSE are mutually exclusive on this path.
pub fn proxy_response(ctx: StreamContext, upstream: CompletionStream) -> Response {
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(ctx.config.frame_buffer);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<CompletionEvent>();
    let cancel = CancellationToken::new();

    // Pump: upstream -> FIFO queue, never blocked by the client.
    let pump_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut upstream = upstream;
        loop {
            tokio::select! {
                _ = pump_cancel.cancelled() => break,
                event = upstream.next() => match event {
                    Some(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    tokio::spawn(relay(ctx, event_rx, frame_tx, cancel));

    let body = Body::from_stream(
        ReceiverStream::new(frame_rx).map(Ok::<_, Infallible>),
    );

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn relay(
    ctx: StreamContext,
    mut events: mpsc::UnboundedReceiver<CompletionEvent>,
    frames: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    metrics::increment_counter!("streams_started_total");
    let started = std::time::Instant::now();

    let mut connected = true;
    // SESSION goes out first so the client can bind messages to the
    // session before any tokens arrive.
    let session_frame = Frame::Session {
        session_id: ctx.session_id.clone(),
        title: ctx.session_title.clone(),
    };
    if frames.send(session_frame.encode()).await.is_err() {
        connected = false;
    }

    let mut generated = String::new();
    let mut delivered = String::new();
    let mut first_delta = false;

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(ctx.config.heartbeat_secs));
    // The first tick fires immediately; consume it.
    heartbeat.tick().await;

    let deadline = tokio::time::sleep(Duration::from_secs(ctx.config.max_stream_secs));
    tokio::pin!(deadline);

    let outcome = loop {
        if !connected {
            break StreamOutcome::Disconnected;
        }
        tokio::select! {
            _ = &mut deadline => break StreamOutcome::TimedOut,
            _ = heartbeat.tick(), if !first_delta => {
                if frames.send(Bytes::from_static(HEARTBEAT_FRAME)).await.is_err() {
                    connected = false;
                }
            }
            event = events.recv() => match event {
                Some(CompletionEvent::Delta(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    first_delta = true;
                    generated.push_str(&delta);
                    let frame = Frame::Success { delta: delta.clone() };
                    if frames.send(frame.encode()).await.is_ok() {
                        delivered.push_str(&delta);
                    } else {
                        connected = false;
                    }
                }
                Some(CompletionEvent::Completed { usage }) => {
                    break StreamOutcome::Completed { usage };
                }
                Some(CompletionEvent::Failed(message)) => {
                    break StreamOutcome::Failed(message);
                }
                None => break StreamOutcome::Failed("upstream ended unexpectedly".to_string()),
            }
        }
    };

    // Stop the pump at its next suspension point. The upstream provider
    // call itself is left to finish server-side.
    cancel.cancel();

    finalize(&ctx, outcome, connected, generated, delivered, &frames).await;
    metrics::histogram!("stream_duration_seconds", started.elapsed().as_secs_f64());
}

async fn finalize(
    ctx: &StreamContext,
    outcome: StreamOutcome,
    connected: bool,
    generated: String,
    delivered: String,
    frames: &mpsc::Sender<Bytes>,
) {
    match outcome {
        StreamOutcome::Completed { usage } => {
            // Persist and account before END: the END frame is the
            // client's signal that the exchange is fully recorded.
            if let Err(e) = persist_assistant_message(ctx, &generated, MessageStatus::Complete) {
                tracing::error!(session = %ctx.session_id, error = %e, "Failed to persist assistant message");
                send_error_frame(frames, &ColloquyError::Storage(e.to_string())).await;
                return;
            }

            let (input_units, output_units) = match usage {
                Some(usage) => (usage.input_units, usage.output_units),
                None => (estimate_units(&ctx.user_content), estimate_units(&generated)),
            };
            if let Err(e) = ctx
                .ledger
                .commit_usage(&ctx.account_id, input_units, output_units)
            {
                tracing::error!(account = %ctx.account_id, error = %e, "Failed to commit usage");
            }

            let _ = frames.send(Frame::End.encode()).await;
            metrics::increment_counter!("streams_completed_total");
        }
        StreamOutcome::Disconnected => {
            // Keep exactly what the client received; charge nothing.
            if !delivered.is_empty() {
                if let Err(e) =
                    persist_assistant_message(ctx, &delivered, MessageStatus::Incomplete)
                {
                    tracing::error!(session = %ctx.session_id, error = %e, "Failed to persist partial message");
                }
            }
            tracing::info!(session = %ctx.session_id, "Client disconnected mid-stream");
            metrics::increment_counter!("streams_disconnected_total");
        }
        StreamOutcome::Failed(message) => {
            if !generated.is_empty() {
                if let Err(e) =
                    persist_assistant_message(ctx, &generated, MessageStatus::Incomplete)
                {
                    tracing::error!(session = %ctx.session_id, error = %e, "Failed to persist partial message");
                }
            }
            tracing::error!(session = %ctx.session_id, error = %message, "Upstream stream failed");
            if connected {
                send_error_frame(frames, &ColloquyError::UpstreamTransient(message)).await;
            }
            metrics::increment_counter!("streams_failed_total");
        }
        StreamOutcome::TimedOut => {
            if !generated.is_empty() {
                if let Err(e) =
                    persist_assistant_message(ctx, &generated, MessageStatus::Incomplete)
                {
                    tracing::error!(session = %ctx.session_id, error = %e, "Failed to persist partial message");
                }
            }
            tracing::error!(
                session = %ctx.session_id,
                limit_secs = ctx.config.max_stream_secs,
                "Stream exceeded maximum duration"
            );
            if connected {
                send_error_frame(
                    frames,
                    &ColloquyError::UpstreamTransient("stream timed out".to_string()),
                )
                .await;
            }
            metrics::increment_counter!("streams_timed_out_total");
        }
    }
}

async fn send_error_frame(frames: &mpsc::Sender<Bytes>, error: &ColloquyError) {
    let frame = Frame::Error {
        error: error.client_message(),
        code: error.code().to_string(),
    };
    let _ = frames.send(frame.encode()).await;
}

fn persist_assistant_message(
    ctx: &StreamContext,
    content: &str,
    status: MessageStatus,
) -> crate::error::Result<()> {
    ctx.storage.insert_message(&ChatMessage {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: ctx.session_id.clone(),
        sender: Sender::Assistant,
        content: content.to_string(),
        has_files: false,
        status,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{plan_quota, PlanTier, Usage};
    use crate::storage::Profile;
    use futures::StreamExt;
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    fn context(storage: Arc<SqliteStorage>, config: StreamConfig) -> StreamContext {
        StreamContext {
            ledger: UsageLedger::new(storage.clone()),
            storage,
            account_id: "acct1".to_string(),
            session_id: "s1".to_string(),
            session_title: "New Chat".to_string(),
            user_content: "Hello".to_string(),
            config,
        }
    }

    fn seeded_storage(dir: &TempDir) -> Arc<SqliteStorage> {
        let storage =
            Arc::new(SqliteStorage::new_with_path(dir.path().join("test.db")).unwrap());
        storage
            .insert_profile(&Profile {
                id: "acct1".to_string(),
                api_token: "tok_1".to_string(),
                plan: PlanTier::Pro,
                is_active: true,
                quota: plan_quota(PlanTier::Pro),
                usage: Usage::default(),
                quota_last_reset: Some(Utc::now()),
            })
            .unwrap();
        storage
            .insert_session(&crate::storage::ChatSession {
                id: "s1".to_string(),
                owner_id: "acct1".to_string(),
                agent_slug: "storyteller".to_string(),
                thread_ref: "thread_1".to_string(),
                title: "New Chat".to_string(),
                created_at: Utc::now(),
            })
            .unwrap();
        storage
    }

    fn upstream(events: Vec<CompletionEvent>) -> CompletionStream {
        Box::pin(futures::stream::iter(events))
    }

    /// Read every frame from the response body.
    async fn collect_frames(response: Response) -> Vec<String> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec())
            .unwrap()
            .split("\n\n")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_frame_encoding() {
        let frame = Frame::Success {
            delta: "Hi".to_string(),
        };
        let encoded = String::from_utf8(frame.encode().to_vec()).unwrap();
        assert_eq!(encoded, "data: {\"type\":\"SUCCESS\",\"delta\":\"Hi\"}\n\n");

        let end = String::from_utf8(Frame::End.encode().to_vec()).unwrap();
        assert_eq!(end, "data: {\"type\":\"END\"}\n\n");
    }

    #[tokio::test]
    async fn test_stream_ordering_session_first_end_last() {
        let dir = TempDir::new().unwrap();
        let storage = seeded_storage(&dir);
        let ctx = context(storage.clone(), StreamConfig::default());

        let response = proxy_response(
            ctx,
            upstream(vec![
                CompletionEvent::Delta("Hello ".to_string()),
                CompletionEvent::Delta("world".to_string()),
                CompletionEvent::Completed { usage: None },
            ]),
        );

        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let frames = collect_frames(response).await;
        assert!(frames[0].contains("\"SESSION\""));
        assert!(frames[0].contains("\"s1\""));
        assert!(frames[1].contains("\"Hello \""));
        assert!(frames[2].contains("\"world\""));
        assert!(frames.last().unwrap().contains("\"END\""));
    }

    #[tokio::test]
    async fn test_completed_stream_persists_and_commits_usage() {
        let dir = TempDir::new().unwrap();
        let storage = seeded_storage(&dir);
        let ctx = context(storage.clone(), StreamConfig::default());

        let response = proxy_response(
            ctx,
            upstream(vec![
                CompletionEvent::Delta("Hi!".to_string()),
                CompletionEvent::Completed {
                    usage: Some(TokenUsage {
                        input_units: 7,
                        output_units: 11,
                    }),
                },
            ]),
        );
        let _ = collect_frames(response).await;

        let messages = storage.list_messages("s1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hi!");
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert_eq!(messages[0].sender, Sender::Assistant);

        let profile = storage.get_profile("acct1").unwrap().unwrap();
        assert_eq!(profile.usage.input_used, 7);
        assert_eq!(profile.usage.output_used, 11);
    }

    #[tokio::test]
    async fn test_failed_stream_emits_error_frame_and_no_usage() {
        let dir = TempDir::new().unwrap();
        let storage = seeded_storage(&dir);
        let ctx = context(storage.clone(), StreamConfig::default());

        let response = proxy_response(
            ctx,
            upstream(vec![
                CompletionEvent::Delta("partial".to_string()),
                CompletionEvent::Failed("model exploded".to_string()),
            ]),
        );
        let frames = collect_frames(response).await;
        assert!(frames.last().unwrap().contains("\"ERROR\""));
        // Internal detail never reaches the client.
        assert!(!frames.last().unwrap().contains("model exploded"));

        let messages = storage.list_messages("s1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Incomplete);
        assert_eq!(messages[0].content, "partial");

        let profile = storage.get_profile("acct1").unwrap().unwrap();
        assert_eq!(profile.usage.output_used, 0);
    }

    #[tokio::test]
    async fn test_disconnect_persists_delivered_text_only() {
        let dir = TempDir::new().unwrap();
        let storage = seeded_storage(&dir);
        let mut config = StreamConfig::default();
        config.frame_buffer = 1;
        let ctx = context(storage.clone(), config);

        // An upstream that keeps producing after the client leaves.
        let (tx, rx) = mpsc::unbounded_channel();
        for delta in ["one ", "two ", "three "] {
            tx.send(CompletionEvent::Delta(delta.to_string())).unwrap();
        }
        let upstream: CompletionStream =
            Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx));

        let response = proxy_response(ctx, upstream);
        let mut body = response.into_body().into_data_stream();

        // Read the SESSION frame plus the first delta, then hang up.
        let mut seen = String::new();
        while !seen.contains("one ") {
            let chunk = body.next().await.unwrap().unwrap();
            seen.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        drop(body);

        // Late deltas keep flowing upstream; the relay must notice the
        // closed transport and persist only what was delivered.
        tx.send(CompletionEvent::Delta("four".to_string())).unwrap();
        drop(tx);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let messages = storage.list_messages("s1").unwrap();
            if !messages.is_empty() {
                assert_eq!(messages[0].status, MessageStatus::Incomplete);
                assert!(messages[0].content.starts_with("one "));
                assert!(!messages[0].content.contains("four"));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no partial message persisted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let profile = storage.get_profile("acct1").unwrap().unwrap();
        assert_eq!(profile.usage.output_used, 0, "no usage on disconnect");
    }

    #[tokio::test]
    async fn test_heartbeats_before_first_delta() {
        let dir = TempDir::new().unwrap();
        let storage = seeded_storage(&dir);
        let mut config = StreamConfig::default();
        config.heartbeat_secs = 1;
        let ctx = context(storage, config);

        // Delay the only delta past one heartbeat interval.
        let (tx, rx) = mpsc::unbounded_channel();
        let upstream: CompletionStream =
            Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let _ = tx.send(CompletionEvent::Delta("late".to_string()));
            let _ = tx.send(CompletionEvent::Completed { usage: None });
        });

        let response = proxy_response(ctx, upstream);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains(": heartbeat"), "expected a heartbeat comment");
        let heartbeat_pos = text.find(": heartbeat").unwrap();
        let delta_pos = text.find("\"late\"").unwrap();
        assert!(heartbeat_pos < delta_pos, "heartbeats stop once content starts");
        assert!(!text[delta_pos..].contains(": heartbeat"));
    }

    #[tokio::test]
    async fn test_stream_timeout_produces_error_frame() {
        let dir = TempDir::new().unwrap();
        let storage = seeded_storage(&dir);
        let mut config = StreamConfig::default();
        config.max_stream_secs = 1;
        config.heartbeat_secs = 10;
        let ctx = context(storage, config);

        // An upstream that never completes.
        let (_tx, rx) = mpsc::unbounded_channel::<CompletionEvent>();
        let upstream: CompletionStream =
            Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx));

        let response = proxy_response(ctx, upstream);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("\"ERROR\""));
    }
}
