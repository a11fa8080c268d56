//! Message submission endpoint
//!
//! `POST /api/messages` accepts a multipart form (content, agent_slug,
//! session_id?, files[]) or a plain JSON body without files, runs the
//! pre-stream pipeline (validation, plan gating, quota check, file
//! ingestion, knowledge store provisioning, session resolution), then
//! hands off to the streaming proxy. Everything that can be rejected is
//! rejected before the first streamed byte so errors still carry real
//! HTTP status codes.

use crate::config::FilesConfig;
use crate::error::{ColloquyError, Result};
use crate::files::{SpoolGuard, SpooledUpload};
use crate::quota::estimate_units;
use crate::server::stream::{proxy_response, StreamContext};
use crate::server::{ApiError, AppState, AuthedAccount};
use crate::storage::{AttachmentRecord, ChatMessage, MessageStatus, Sender};
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;

/// Cheap pre-estimate of a reply's output units for the quota check
const OUTPUT_UNITS_ESTIMATE: u64 = 512;

/// Cap for JSON submissions (attachments require multipart)
const JSON_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct MessageSubmission {
    content: String,
    agent_slug: String,
    session_id: Option<String>,
    files: Vec<SpooledUpload>,
}

#[derive(Debug, Deserialize)]
struct JsonSubmission {
    content: String,
    agent_slug: String,
    #[serde(default)]
    session_id: Option<String>,
}

/// Handle one message submission, replying with the SSE stream
pub async fn send_message(
    State(state): State<AppState>,
    AuthedAccount(profile): AuthedAccount,
    request: Request,
) -> std::result::Result<Response, ApiError> {
    let mut submission = parse_submission(request, &state.config.files).await?;

    // If any pre-ingestion check rejects the request, the spooled
    // copies still have to go; cleanup moves to the pipeline once
    // ingestion starts.
    let mut spool_guard = SpoolGuard::new();
    for file in &submission.files {
        spool_guard.add(file.path.clone());
    }

    if submission.content.trim().is_empty() {
        return Err(ColloquyError::Validation("content is required".to_string()).into());
    }
    if submission.agent_slug.is_empty() {
        return Err(ColloquyError::Validation("agent_slug is required".to_string()).into());
    }
    let agent = state
        .config
        .agent(&submission.agent_slug)
        .ok_or_else(|| {
            ColloquyError::Validation(format!("unknown agent: {}", submission.agent_slug))
        })?
        .clone();

    if !profile.is_active {
        return Err(
            ColloquyError::Authorization("subscription is not active".to_string()).into(),
        );
    }
    if !profile.plan.allows(agent.tier) {
        return Err(ColloquyError::Authorization(format!(
            "plan {} does not include agent {}",
            profile.plan.as_str(),
            submission.agent_slug
        ))
        .into());
    }

    // Optimistic pre-flight check; the real counts commit on END.
    state.ledger.check_quota(
        &profile,
        estimate_units(&submission.content),
        OUTPUT_UNITS_ESTIMATE,
    )?;

    spool_guard.release();
    let batch = state.files.ingest(std::mem::take(&mut submission.files)).await?;

    let session = state
        .sessions
        .resolve_or_create(
            &profile.id,
            &submission.agent_slug,
            submission.session_id.as_deref(),
            &submission.content,
        )
        .await?;

    // Text attachments need a live knowledge store; without new text
    // files the session's existing store (if any) still scopes
    // retrieval for this turn.
    let store_handle = if !batch.text.is_empty() {
        let store = state
            .knowledge
            .get_or_create_session_store(&profile.id, &session.id, &batch.text_handles())
            .await?;
        Some(store.store_handle)
    } else {
        state
            .storage
            .active_session_store(&profile.id, &session.id)?
            .map(|s| s.store_handle)
    };

    let user_message = ChatMessage {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        sender: Sender::User,
        content: submission.content.clone(),
        has_files: !batch.is_empty(),
        status: MessageStatus::Complete,
        created_at: Utc::now(),
    };
    state.storage.insert_message(&user_message)?;

    for file in batch.text.iter().chain(batch.images.iter()) {
        let store_ref = match file.kind {
            crate::files::FileKind::Text => store_handle.clone(),
            crate::files::FileKind::Image => None,
        };
        state.storage.insert_attachment(&AttachmentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            message_id: user_message.id.clone(),
            file_handle: file.upload.handle.clone(),
            name: file.name.clone(),
            size: file.upload.size,
            mime_type: file.mime.clone(),
            store_ref,
            created_at: Utc::now(),
        })?;
    }

    state
        .provider
        .add_user_turn(
            &session.thread_ref,
            &submission.content,
            &batch.image_handles(),
        )
        .await?;

    // Start the reply stream, transparently recreating an expired
    // knowledge store once before giving up.
    let upstream = match &store_handle {
        Some(handle) => {
            let provider = state.provider.clone();
            let thread_ref = session.thread_ref.clone();
            let agent_ref = agent.agent_ref.clone();
            state
                .knowledge
                .with_store_recovery(&profile.id, handle, move |store| {
                    let provider = provider.clone();
                    let thread_ref = thread_ref.clone();
                    let agent_ref = agent_ref.clone();
                    async move {
                        provider
                            .stream_reply(&thread_ref, &agent_ref, Some(&store))
                            .await
                    }
                })
                .await?
        }
        None => {
            state
                .provider
                .stream_reply(&session.thread_ref, &agent.agent_ref, None)
                .await?
        }
    };

    metrics::increment_counter!("messages_accepted_total");

    let ctx = StreamContext {
        storage: state.storage.clone(),
        ledger: state.ledger.clone(),
        account_id: profile.id,
        session_id: session.id,
        session_title: session.title,
        user_content: submission.content,
        config: state.config.stream.clone(),
    };
    Ok(proxy_response(ctx, upstream))
}

/// Parse a multipart or JSON submission
async fn parse_submission(request: Request, config: &FilesConfig) -> Result<MessageSubmission> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("application/json") {
        let bytes = axum::body::to_bytes(request.into_body(), JSON_BODY_LIMIT)
            .await
            .map_err(|e| ColloquyError::Validation(format!("unreadable body: {}", e)))?;
        let parsed: JsonSubmission = serde_json::from_slice(&bytes)
            .map_err(|e| ColloquyError::Validation(format!("invalid JSON body: {}", e)))?;
        return Ok(MessageSubmission {
            content: parsed.content,
            agent_slug: parsed.agent_slug,
            session_id: parsed.session_id,
            files: Vec::new(),
        });
    }

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ColloquyError::Validation(format!("invalid multipart body: {}", e)))?;
        return parse_multipart(multipart, config).await;
    }

    Err(ColloquyError::Validation(format!("unsupported content type: {}", content_type)).into())
}

async fn parse_multipart(
    mut multipart: Multipart,
    config: &FilesConfig,
) -> Result<MessageSubmission> {
    let mut submission = MessageSubmission::default();
    // Spooled files are removed if parsing fails partway; on success
    // cleanup responsibility moves to the ingestion pipeline.
    let mut guard = SpoolGuard::new();

    let spool_dir = config.spool_dir();
    tokio::fs::create_dir_all(&spool_dir).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ColloquyError::Validation(format!("invalid multipart field: {}", e)))?
    {
        match field.name() {
            Some("content") => {
                submission.content = field
                    .text()
                    .await
                    .map_err(|e| ColloquyError::Validation(format!("unreadable content: {}", e)))?;
            }
            Some("agent_slug") => {
                submission.agent_slug = field
                    .text()
                    .await
                    .map_err(|e| ColloquyError::Validation(format!("unreadable agent_slug: {}", e)))?;
            }
            Some("session_id") => {
                let value = field.text().await.map_err(|e| {
                    ColloquyError::Validation(format!("unreadable session_id: {}", e))
                })?;
                if !value.is_empty() {
                    submission.session_id = Some(value);
                }
            }
            Some("files") => {
                if submission.files.len() >= config.max_files {
                    return Err(ColloquyError::Validation(format!(
                        "too many files (maximum {})",
                        config.max_files
                    ))
                    .into());
                }

                let name = sanitize_filename(field.file_name().unwrap_or("upload"));
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(|e| {
                    ColloquyError::Validation(format!("unreadable file {}: {}", name, e))
                })?;

                if data.len() as u64 > config.max_file_bytes {
                    return Err(ColloquyError::Validation(format!(
                        "file {} exceeds the {} byte limit",
                        name, config.max_file_bytes
                    ))
                    .into());
                }

                let path = spool_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), name));
                tokio::fs::write(&path, &data).await?;
                guard.add(path.clone());
                submission.files.push(SpooledUpload {
                    path,
                    name,
                    mime,
                    size: data.len() as u64,
                });
            }
            _ => {}
        }
    }

    guard.release();
    Ok(submission)
}

/// Strip any path components a client smuggled into the filename
fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() {
        "upload".to_string()
    } else {
        base
    }
}
