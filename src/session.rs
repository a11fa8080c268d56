//! Session resolution
//!
//! Loads an existing conversation session (verifying ownership) or
//! creates a new one: an external thread is provisioned first, a short
//! title is synthesized best-effort from the first message, and the row
//! is persisted. Callers always get a session with a valid thread_ref.

use crate::error::{ColloquyError, Result};
use crate::providers::Provider;
use crate::storage::{ChatSession, SqliteStorage};
use chrono::Utc;
use std::sync::Arc;

const FALLBACK_TITLE: &str = "New Chat";

/// Resolves or creates chat sessions
#[derive(Clone)]
pub struct SessionResolver {
    storage: Arc<SqliteStorage>,
    provider: Arc<dyn Provider>,
}

impl SessionResolver {
    pub fn new(storage: Arc<SqliteStorage>, provider: Arc<dyn Provider>) -> Self {
        Self { storage, provider }
    }

    /// Load an owned session or create a new one
    ///
    /// With `session_id`, the session must exist, belong to `owner_id`,
    /// and match `agent_slug`; anything else is NotFound so foreign
    /// sessions are indistinguishable from missing ones. Without it, a
    /// fresh external thread is created and a title synthesized from
    /// the first message.
    pub async fn resolve_or_create(
        &self,
        owner_id: &str,
        agent_slug: &str,
        session_id: Option<&str>,
        first_message: &str,
    ) -> Result<ChatSession> {
        if let Some(id) = session_id {
            let session = self
                .storage
                .get_session(id)?
                .filter(|s| s.owner_id == owner_id && s.agent_slug == agent_slug)
                .ok_or_else(|| ColloquyError::NotFound(format!("chat session {}", id)))?;
            return Ok(session);
        }

        let thread_ref = self.provider.create_thread().await?;
        let title = self.synthesize_title(first_message).await;

        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            agent_slug: agent_slug.to_string(),
            thread_ref,
            title,
            created_at: Utc::now(),
        };
        self.storage.insert_session(&session)?;

        tracing::info!(
            session = %session.id,
            agent = %agent_slug,
            "Created chat session"
        );
        Ok(session)
    }

    /// Best-effort ≤4-word title from the first message
    ///
    /// Summarization failure is non-fatal and falls back to a generic
    /// title.
    async fn synthesize_title(&self, content: &str) -> String {
        match self.provider.summarize_title(content).await {
            Ok(raw) => {
                let title = strip_quotes(raw.trim()).trim();
                if title.is_empty() {
                    FALLBACK_TITLE.to_string()
                } else {
                    title.to_string()
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Title generation failed");
                FALLBACK_TITLE.to_string()
            }
        }
    }
}

/// Remove surrounding quotes (single or double) from a title
fn strip_quotes(title: &str) -> &str {
    title
        .trim_start_matches(['"', '\''])
        .trim_end_matches(['"', '\''])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeProvider;
    use tempfile::TempDir;

    fn resolver(provider: Arc<FakeProvider>) -> (TempDir, SessionResolver) {
        let dir = TempDir::new().unwrap();
        let storage =
            Arc::new(SqliteStorage::new_with_path(dir.path().join("test.db")).unwrap());
        (dir, SessionResolver::new(storage, provider))
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"Launch Plan\""), "Launch Plan");
        assert_eq!(strip_quotes("'Quoted'"), "Quoted");
        assert_eq!(strip_quotes("Plain"), "Plain");
    }

    #[tokio::test]
    async fn test_create_assigns_thread_and_title() {
        let provider = Arc::new(FakeProvider::new());
        let (_dir, resolver) = resolver(provider);

        let session = resolver
            .resolve_or_create("acct1", "storyteller", None, "Help me plan a launch")
            .await
            .unwrap();

        assert!(!session.thread_ref.is_empty());
        // Surrounding quotes from the summarizer are stripped.
        assert_eq!(session.title, "Quick Summary Title");

        let loaded = resolver.storage.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.thread_ref, session.thread_ref);
    }

    #[tokio::test]
    async fn test_title_failure_falls_back() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail_titles();
        let (_dir, resolver) = resolver(provider);

        let session = resolver
            .resolve_or_create("acct1", "storyteller", None, "Hello")
            .await
            .unwrap();
        assert_eq!(session.title, FALLBACK_TITLE);
    }

    #[tokio::test]
    async fn test_empty_title_falls_back() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_title("  \"\"  ");
        let (_dir, resolver) = resolver(provider);

        let session = resolver
            .resolve_or_create("acct1", "storyteller", None, "Hello")
            .await
            .unwrap();
        assert_eq!(session.title, FALLBACK_TITLE);
    }

    #[tokio::test]
    async fn test_resolve_existing_session() {
        let provider = Arc::new(FakeProvider::new());
        let (_dir, resolver) = resolver(provider);

        let created = resolver
            .resolve_or_create("acct1", "storyteller", None, "Hello")
            .await
            .unwrap();
        let resolved = resolver
            .resolve_or_create("acct1", "storyteller", Some(&created.id), "ignored")
            .await
            .unwrap();
        assert_eq!(resolved.id, created.id);
        assert_eq!(resolved.thread_ref, created.thread_ref);
    }

    #[tokio::test]
    async fn test_foreign_session_is_not_found() {
        let provider = Arc::new(FakeProvider::new());
        let (_dir, resolver) = resolver(provider);

        let created = resolver
            .resolve_or_create("acct1", "storyteller", None, "Hello")
            .await
            .unwrap();

        let err = resolver
            .resolve_or_create("acct2", "storyteller", Some(&created.id), "Hello")
            .await
            .unwrap_err();
        let err = err.downcast::<ColloquyError>().unwrap();
        assert!(matches!(err, ColloquyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_agent_mismatch_is_not_found() {
        let provider = Arc::new(FakeProvider::new());
        let (_dir, resolver) = resolver(provider);

        let created = resolver
            .resolve_or_create("acct1", "storyteller", None, "Hello")
            .await
            .unwrap();

        let err = resolver
            .resolve_or_create("acct1", "headlines", Some(&created.id), "Hello")
            .await
            .unwrap_err();
        let err = err.downcast::<ColloquyError>().unwrap();
        assert!(matches!(err, ColloquyError::NotFound(_)));
    }
}
