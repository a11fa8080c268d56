//! Session listing and history endpoints
//!
//! Read-only CRUD plumbing around the persisted conversations. Every
//! route is owner-scoped: a session belonging to someone else is
//! indistinguishable from a missing one.

use crate::error::ColloquyError;
use crate::server::{ApiError, AppState, AuthedAccount};
use crate::storage::{ChatMessage, ChatSession};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub agent_slug: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<ChatSession>,
}

#[derive(Debug, Serialize)]
pub struct SessionEnvelope {
    pub session: ChatSession,
}

#[derive(Debug, Serialize)]
pub struct MessageList {
    pub messages: Vec<ChatMessage>,
}

/// List the account's sessions, newest first
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthedAccount(profile): AuthedAccount,
    Query(query): Query<ListSessionsQuery>,
) -> std::result::Result<Json<SessionList>, ApiError> {
    let sessions = state
        .storage
        .list_sessions(&profile.id, query.agent_slug.as_deref())?;
    Ok(Json(SessionList { sessions }))
}

/// Fetch one owned session
pub async fn get_session(
    State(state): State<AppState>,
    AuthedAccount(profile): AuthedAccount,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<SessionEnvelope>, ApiError> {
    let session = owned_session(&state, &profile.id, &session_id)?;
    Ok(Json(SessionEnvelope { session }))
}

/// List one owned session's messages, oldest first
pub async fn list_messages(
    State(state): State<AppState>,
    AuthedAccount(profile): AuthedAccount,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<MessageList>, ApiError> {
    owned_session(&state, &profile.id, &session_id)?;
    let messages = state.storage.list_messages(&session_id)?;
    Ok(Json(MessageList { messages }))
}

fn owned_session(
    state: &AppState,
    owner_id: &str,
    session_id: &str,
) -> std::result::Result<ChatSession, ApiError> {
    state
        .storage
        .get_session(session_id)?
        .filter(|s| s.owner_id == owner_id)
        .ok_or_else(|| ColloquyError::NotFound(format!("chat session {}", session_id)).into())
}
