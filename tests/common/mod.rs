//! Shared helpers for integration tests
//!
//! Builds the real router over a scratch database and a scripted
//! [`FakeProvider`], plus small utilities for multipart bodies and SSE
//! frame inspection.

// Not every test binary uses every helper.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::Request;
use axum::Router;
use chrono::Utc;
use colloquy::config::{AgentEntry, Config};
use colloquy::quota::{plan_quota, PlanTier, Quota, Usage};
use colloquy::server::{build_router, AppState};
use colloquy::storage::{Profile, SqliteStorage};
use colloquy::test_utils::FakeProvider;
use std::sync::Arc;
use tempfile::TempDir;

pub const TOKEN: &str = "tok_integration";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub provider: Arc<FakeProvider>,
    _dir: TempDir,
}

/// Build a router with one starter account and two configured agents
pub fn test_app() -> TestApp {
    test_app_with(|_| {})
}

/// Same as [`test_app`], with a hook to adjust the configuration
pub fn test_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let dir = TempDir::new().unwrap();

    let mut config = Config::default();
    config.files.spool_dir = Some(dir.path().join("spool"));
    config.agents.insert(
        "storyteller".to_string(),
        AgentEntry {
            agent_ref: "agent_story".to_string(),
            tier: PlanTier::Starter,
        },
    );
    config.agents.insert(
        "carousel".to_string(),
        AgentEntry {
            agent_ref: "agent_carousel".to_string(),
            tier: PlanTier::Pro,
        },
    );

    configure(&mut config);

    let storage = Arc::new(SqliteStorage::new_with_path(dir.path().join("test.db")).unwrap());
    storage
        .insert_profile(&Profile {
            id: "acct1".to_string(),
            api_token: TOKEN.to_string(),
            plan: PlanTier::Starter,
            is_active: true,
            quota: plan_quota(PlanTier::Starter),
            usage: Usage::default(),
            quota_last_reset: Some(Utc::now()),
        })
        .unwrap();

    let provider = Arc::new(FakeProvider::new());
    let state = AppState::new(Arc::new(config), storage, provider.clone());
    TestApp {
        router: build_router(state.clone()),
        state,
        provider,
        _dir: dir,
    }
}

/// Insert a second profile with the given plan and quota
pub fn seed_profile(state: &AppState, id: &str, token: &str, plan: PlanTier, quota: Quota) {
    state
        .storage
        .insert_profile(&Profile {
            id: id.to_string(),
            api_token: token.to_string(),
            plan,
            is_active: true,
            quota,
            usage: Usage::default(),
            quota_last_reset: Some(Utc::now()),
        })
        .unwrap();
}

/// JSON message submission request
pub fn json_message(token: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/messages")
        .header("authorization", format!("Bearer {}", token))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// One part of a multipart body
pub enum Part<'a> {
    Text { name: &'a str, value: &'a str },
    File {
        name: &'a str,
        filename: &'a str,
        mime: &'a str,
        data: &'a [u8],
    },
}

/// Build a multipart/form-data request body
pub fn multipart_message(token: &str, parts: &[Part<'_>]) -> Request<Body> {
    let boundary = "colloquy-test-boundary";
    let mut body: Vec<u8> = Vec::new();

    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        match part {
            Part::Text { name, value } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                filename,
                mime,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                        name, filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime).as_bytes());
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/messages")
        .header("authorization", format!("Bearer {}", token))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

/// Split a collected SSE body into its non-empty frames
pub fn split_frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
