//! HTTP server: router, shared state, authentication, error mapping
//!
//! The router wires the deduplication layer over the mutating routes
//! and exposes the message-send streaming endpoint plus the session
//! CRUD plumbing. All services are explicit state injected into
//! handlers; there is no ambient global state.

pub mod messages;
pub mod sessions;
pub mod stream;

use crate::config::Config;
use crate::dedup::{dedup_middleware, DedupGuard, DedupLayerState};
use crate::error::{ColloquyError, Result};
use crate::files::FilePipeline;
use crate::knowledge::KnowledgeStoreManager;
use crate::providers::Provider;
use crate::quota::UsageLedger;
use crate::session::SessionResolver;
use crate::storage::{Profile, SqliteStorage};
use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::{header::AUTHORIZATION, request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<SqliteStorage>,
    pub provider: Arc<dyn Provider>,
    pub ledger: UsageLedger,
    pub knowledge: KnowledgeStoreManager,
    pub sessions: SessionResolver,
    pub files: FilePipeline,
}

impl AppState {
    pub fn new(config: Arc<Config>, storage: Arc<SqliteStorage>, provider: Arc<dyn Provider>) -> Self {
        Self {
            ledger: UsageLedger::new(storage.clone()),
            knowledge: KnowledgeStoreManager::new(
                storage.clone(),
                provider.clone(),
                config.knowledge.clone(),
            ),
            sessions: SessionResolver::new(storage.clone(), provider.clone()),
            files: FilePipeline::new(provider.clone(), config.files.clone()),
            config,
            storage,
            provider,
        }
    }
}

/// Handler error with HTTP mapping and client-safe body
///
/// Full detail goes to the logs; the client only ever sees the
/// sanitized message plus a classification code.
pub struct ApiError {
    error: anyhow::Error,
    status_override: Option<StatusCode>,
}

impl ApiError {
    pub fn unauthorized(message: &str) -> Self {
        Self {
            error: ColloquyError::Authorization(message.to_string()).into(),
            status_override: Some(StatusCode::UNAUTHORIZED),
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(error: E) -> Self {
        Self {
            error: error.into(),
            status_override: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let colloquy = self.error.downcast_ref::<ColloquyError>();

        let status = self.status_override.unwrap_or(match colloquy {
            Some(ColloquyError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(ColloquyError::Authorization(_)) => StatusCode::FORBIDDEN,
            Some(ColloquyError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ColloquyError::QuotaExceeded { .. }) => StatusCode::FORBIDDEN,
            Some(ColloquyError::UpstreamTransient(_))
            | Some(ColloquyError::ResourceExpired(_))
            | Some(ColloquyError::Ingestion { .. })
            | Some(ColloquyError::Provider(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        });

        let (message, code) = match colloquy {
            Some(e) => (e.client_message(), e.code()),
            None => ("Internal server error".to_string(), "SYSTEM"),
        };

        if status.is_server_error() {
            tracing::error!(error = ?self.error, "Request failed");
        } else {
            tracing::debug!(error = %self.error, "Request rejected");
        }

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

/// The authenticated account, resolved from the bearer token
///
/// Token issuance lives outside this system; here a token is only a
/// lookup key into the profile store. The quota ledger's lazy period
/// rollover runs as part of extraction so handlers always see a
/// current allotment.
pub struct AuthedAccount(pub Profile);

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AuthedAccount {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

        let profile = state
            .storage
            .find_profile_by_token(token)?
            .ok_or_else(|| ApiError::unauthorized("unknown API token"))?;

        let profile = state.ledger.check_and_reset(profile)?;
        Ok(AuthedAccount(profile))
    }
}

/// Build the application router over the given state
pub fn build_router(state: AppState) -> Router {
    let dedup_state = DedupLayerState {
        guard: DedupGuard::new(
            Duration::from_secs(state.config.dedup.ttl_secs),
            state.config.dedup.sweep_probability,
        ),
        max_body_bytes: body_limit(&state.config),
    };

    Router::new()
        .route("/api/messages", post(messages::send_message))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/:id", get(sessions::get_session))
        .route("/api/sessions/:id/messages", get(sessions::list_messages))
        .layer(axum::middleware::from_fn_with_state(
            dedup_state,
            dedup_middleware,
        ))
        .layer(DefaultBodyLimit::max(body_limit(&state.config)))
        .route("/health", get(health))
        .with_state(state)
}

/// Room for the capped attachments plus form overhead
fn body_limit(config: &Config) -> usize {
    (config.files.max_file_bytes as usize) * config.files.max_files + 1024 * 1024
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Bind and serve until shutdown
pub async fn run(state: AppState) -> Result<()> {
    let listen = state.config.server.listen.clone();
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "Server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_maps_taxonomy_to_status() {
        let cases: Vec<(ColloquyError, StatusCode)> = vec![
            (
                ColloquyError::Validation("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ColloquyError::Authorization("x".into()),
                StatusCode::FORBIDDEN,
            ),
            (ColloquyError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ColloquyError::QuotaExceeded {
                    dimension: "input".into(),
                    used: 2,
                    limit: 1,
                },
                StatusCode::FORBIDDEN,
            ),
            (
                ColloquyError::UpstreamTransient("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ColloquyError::Storage("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let response = ApiError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_unauthorized_override() {
        let response = ApiError::unauthorized("unknown API token").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
