//! Hosted provider adapter integration tests
//!
//! Exercises the reqwest implementation against a `wiremock` server.
//! Use `set_body_raw(bytes, "text/event-stream")` for streamed-run
//! responses so the SSE parsing path is taken.

use colloquy::config::ProviderConfig;
use colloquy::error::ColloquyError;
use colloquy::providers::{CompletionEvent, Provider, UploadPurpose};
use futures::StreamExt;
use serial_test::serial;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY_ENV: &str = "COLLOQUY_TEST_API_KEY";

fn provider_for(base: &str) -> colloquy::providers::HostedProvider {
    std::env::set_var(KEY_ENV, "sk-test");
    colloquy::providers::HostedProvider::new(&ProviderConfig {
        api_base: base.to_string(),
        api_key_env: KEY_ENV.to_string(),
        title_model: "gpt-4o-mini".to_string(),
        request_timeout_secs: 5,
    })
    .expect("provider construction")
}

#[tokio::test]
#[serial]
async fn test_create_thread_sends_auth_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/threads"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("OpenAI-Beta", "assistants=v2"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            br#"{"id":"thread_abc","object":"thread"}"#.to_vec(),
            "application/json",
        ))
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri());
    let thread = provider.create_thread().await.unwrap();
    assert_eq!(thread, "thread_abc");
}

#[tokio::test]
#[serial]
async fn test_upload_file_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            br#"{"id":"file_9","bytes":1234,"purpose":"assistants"}"#.to_vec(),
            "application/json",
        ))
        .mount(&server)
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    let file_path = dir.path().join("notes.txt");
    std::fs::write(&file_path, b"some notes").unwrap();

    let provider = provider_for(&server.uri());
    let uploaded = provider
        .upload_file(&file_path, "notes.txt", UploadPurpose::Retrieval)
        .await
        .unwrap();
    assert_eq!(uploaded.handle, "file_9");
    assert_eq!(uploaded.size, 1234);
}

#[tokio::test]
#[serial]
async fn test_retrieve_store_maps_404_to_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vector_stores/vs_gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri());
    let err = provider.retrieve_store("vs_gone").await.unwrap_err();
    let err = err.downcast::<ColloquyError>().unwrap();
    assert!(matches!(err, ColloquyError::ResourceExpired(_)));
}

#[tokio::test]
#[serial]
async fn test_retrieve_store_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vector_stores/vs_1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            br#"{"id":"vs_1","status":"expired"}"#.to_vec(),
            "application/json",
        ))
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri());
    let info = provider.retrieve_store("vs_1").await.unwrap();
    assert!(!info.is_live());
}

#[tokio::test]
#[serial]
async fn test_stream_reply_parses_sse_events() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "event: thread.run.created\n",
        "data: {\"id\":\"run_1\"}\n\n",
        "event: thread.message.delta\n",
        "data: {\"delta\":{\"content\":[{\"index\":0,\"type\":\"text\",\"text\":{\"value\":\"Hel\"}}]}}\n\n",
        "event: thread.message.delta\n",
        "data: {\"delta\":{\"content\":[{\"index\":0,\"type\":\"text\",\"text\":{\"value\":\"lo\"}}]}}\n\n",
        "event: thread.run.completed\n",
        "data: {\"id\":\"run_1\",\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    );

    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri());
    let mut stream = provider
        .stream_reply("thread_1", "agent_1", None)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert_eq!(
        events[0],
        CompletionEvent::Delta("Hel".to_string()),
        "step events are skipped"
    );
    assert_eq!(events[1], CompletionEvent::Delta("lo".to_string()));
    match &events[2] {
        CompletionEvent::Completed { usage: Some(usage) } => {
            assert_eq!(usage.input_units, 5);
            assert_eq!(usage.output_units, 2);
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert_eq!(events.len(), 3);
}

#[tokio::test]
#[serial]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/threads"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri());
    let err = provider.create_thread().await.unwrap_err();
    let err = err.downcast::<ColloquyError>().unwrap();
    assert!(matches!(err, ColloquyError::UpstreamTransient(_)));
}

#[tokio::test]
#[serial]
async fn test_summarize_title_returns_choice_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            br#"{"choices":[{"message":{"role":"assistant","content":" \"Launch Plan Review\" "}}]}"#
                .to_vec(),
            "application/json",
        ))
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri());
    let title = provider.summarize_title("help me review my launch plan").await.unwrap();
    assert_eq!(title, "\"Launch Plan Review\"");
}
