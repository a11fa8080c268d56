//! Knowledge store lifecycle management
//!
//! Knowledge stores are provider-side searchable file collections with
//! a provider-enforced expiry. This module owns their state machine
//! (`active -> expiring -> expired -> recreating -> active(new)`, with
//! `deleted` terminal), transparent recreation when a store dies under
//! an in-flight request, and the scheduled cleanup and proactive
//! recreation sweeps.

use crate::config::KnowledgeConfig;
use crate::error::{ColloquyError, Result};
use crate::providers::Provider;
use crate::storage::{KnowledgeStore, SqliteStorage, StoreStatus};
use chrono::{Duration, Utc};
use std::future::Future;
use std::sync::Arc;

/// Summary of one proactive recreation sweep
#[derive(Debug, Default, Clone, Copy)]
pub struct RecreationSummary {
    pub total_expiring: usize,
    pub recreated: usize,
}

/// Service wrapping provider store resources and their rows
#[derive(Clone)]
pub struct KnowledgeStoreManager {
    storage: Arc<SqliteStorage>,
    provider: Arc<dyn Provider>,
    config: KnowledgeConfig,
}

impl KnowledgeStoreManager {
    pub fn new(
        storage: Arc<SqliteStorage>,
        provider: Arc<dyn Provider>,
        config: KnowledgeConfig,
    ) -> Self {
        Self {
            storage,
            provider,
            config,
        }
    }

    /// Provision a new store over the given file handles
    ///
    /// The provider expiry is anchored to last-activity time; the row's
    /// `expires_at` mirrors the worst case (no further activity).
    pub async fn create_store(
        &self,
        owner_id: &str,
        label: &str,
        file_handles: &[String],
        session_id: Option<&str>,
    ) -> Result<KnowledgeStore> {
        let handle = self
            .provider
            .create_store(label, file_handles, self.config.expiry_days)
            .await?;

        let now = Utc::now();
        let store = KnowledgeStore {
            id: uuid::Uuid::new_v4().to_string(),
            store_handle: handle,
            owner_id: owner_id.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            file_count: file_handles.len() as i64,
            expires_at: now + Duration::days(self.config.expiry_days),
            status: StoreStatus::Active,
            successor_handle: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_store(&store)?;

        tracing::info!(
            store = %store.store_handle,
            owner = %owner_id,
            files = file_handles.len(),
            "Created knowledge store"
        );
        metrics::increment_counter!("knowledge_stores_created_total");
        Ok(store)
    }

    /// Reuse the session's live store or create a fresh one
    ///
    /// An existing store that fails validation is marked expired and
    /// replaced. New file handles are added to a reused store.
    pub async fn get_or_create_session_store(
        &self,
        owner_id: &str,
        session_id: &str,
        file_handles: &[String],
    ) -> Result<KnowledgeStore> {
        if let Some(existing) = self.storage.active_session_store(owner_id, session_id)? {
            if self.validate(&existing.store_handle).await? {
                if !file_handles.is_empty() {
                    self.provider
                        .add_store_files(&existing.store_handle, file_handles)
                        .await?;
                    self.storage
                        .increment_store_files(&existing.store_handle, file_handles.len() as i64)?;
                }
                return Ok(existing);
            }
            self.storage
                .set_store_status(&existing.store_handle, StoreStatus::Expired)?;
            tracing::warn!(store = %existing.store_handle, "Session store failed validation, replacing");
        }

        let label = format!("session_{}", session_id);
        self.create_store(owner_id, &label, file_handles, Some(session_id))
            .await
    }

    /// Check liveness with the provider
    ///
    /// Returns `false` when the provider reports the store expired or
    /// unknown; other provider faults propagate.
    pub async fn validate(&self, store_handle: &str) -> Result<bool> {
        match self.provider.retrieve_store(store_handle).await {
            Ok(info) => Ok(info.is_live()),
            Err(e) if is_expired_error(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replace an expired store with a fresh one over the same files
    ///
    /// Idempotent under retry: once a store has an active successor,
    /// recreating it again returns that successor instead of minting
    /// another. Attachments and the owning session are re-pointed at
    /// the new handle; the old row ends `expired`.
    pub async fn recreate(&self, store_handle: &str, owner_id: &str) -> Result<KnowledgeStore> {
        let original = self
            .storage
            .get_store(store_handle)?
            .ok_or_else(|| ColloquyError::NotFound(format!("knowledge store {}", store_handle)))?;

        if let Some(successor) = &original.successor_handle {
            if let Some(replacement) = self.storage.get_store(successor)? {
                if replacement.status == StoreStatus::Active {
                    return Ok(replacement);
                }
            }
        }

        self.storage
            .set_store_status(store_handle, StoreStatus::Recreating)?;

        let file_handles = self.storage.file_handles_for_store(store_handle)?;
        let label = format!("{}_recreated", store_handle);

        let replacement = match self
            .create_store(
                owner_id,
                &label,
                &file_handles,
                original.session_id.as_deref(),
            )
            .await
        {
            Ok(store) => store,
            Err(e) => {
                // The old store is dead either way; record that.
                let _ = self
                    .storage
                    .set_store_status(store_handle, StoreStatus::Expired);
                return Err(e);
            }
        };

        self.storage
            .relink_attachments(store_handle, &replacement.store_handle)?;
        self.storage
            .set_store_successor(store_handle, &replacement.store_handle)?;
        self.storage
            .set_store_status(store_handle, StoreStatus::Expired)?;

        tracing::info!(
            old = %store_handle,
            new = %replacement.store_handle,
            "Recreated knowledge store"
        );
        metrics::increment_counter!("knowledge_stores_recreated_total");
        Ok(replacement)
    }

    /// Mark active stores past their expiry as expired
    ///
    /// Provider-side data is not touched; deletion is a separate,
    /// explicit operation.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let expired = self.storage.active_stores_expiring_before(Utc::now())?;
        let mut marked = 0;
        for store in &expired {
            match self
                .storage
                .set_store_status(&store.store_handle, StoreStatus::Expired)
            {
                Ok(()) => {
                    marked += 1;
                    tracing::info!(store = %store.store_handle, "Marked expired knowledge store");
                }
                Err(e) => {
                    tracing::warn!(store = %store.store_handle, error = %e, "Failed to mark store expired")
                }
            }
        }
        Ok(marked)
    }

    /// Proactively recreate stores close to expiry
    ///
    /// Walks active stores within the lookahead window and recreates
    /// each; per-store failures are reported and never abort the batch.
    pub async fn recreate_expiring(&self) -> Result<RecreationSummary> {
        let cutoff = Utc::now() + Duration::days(self.config.lookahead_days);
        let expiring = self.storage.active_stores_expiring_before(cutoff)?;

        let mut summary = RecreationSummary {
            total_expiring: expiring.len(),
            recreated: 0,
        };

        for store in &expiring {
            self.storage
                .set_store_status(&store.store_handle, StoreStatus::Expiring)?;
            match self.recreate(&store.store_handle, &store.owner_id).await {
                Ok(replacement) => {
                    summary.recreated += 1;
                    tracing::info!(
                        old = %store.store_handle,
                        new = %replacement.store_handle,
                        "Proactively recreated expiring store"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        store = %store.store_handle,
                        error = %e,
                        "Failed to proactively recreate store"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Delete a store on the provider and mark the row terminal
    pub async fn delete(&self, store_handle: &str) -> Result<()> {
        self.provider.delete_store(store_handle).await?;
        self.storage
            .set_store_status(store_handle, StoreStatus::Deleted)?;
        tracing::info!(store = %store_handle, "Deleted knowledge store");
        Ok(())
    }

    /// Run an operation with one automatic expiry recovery
    ///
    /// The operation receives the store handle to use. If it fails with
    /// an expiry signal, the store is recreated once and the operation
    /// re-invoked with the new handle. Any other error, and any failure
    /// of the recovery itself, propagates — the caller surfaces a clear
    /// "attachment context unavailable" error rather than silently
    /// dropping file context.
    pub async fn with_store_recovery<T, F, Fut>(
        &self,
        owner_id: &str,
        store_handle: &str,
        operation: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match operation(store_handle.to_string()).await {
            Ok(value) => Ok(value),
            Err(e) if is_expired_error(&e) => {
                tracing::warn!(store = %store_handle, "Store expired mid-request, recreating");
                metrics::increment_counter!("knowledge_store_recoveries_total");
                let replacement = self.recreate(store_handle, owner_id).await.map_err(|re| {
                    tracing::error!(store = %store_handle, error = %re, "Store recovery failed");
                    ColloquyError::ResourceExpired(store_handle.to_string())
                })?;
                operation(replacement.store_handle).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Whether an error is an upstream store-expiry signal
pub fn is_expired_error(error: &anyhow::Error) -> bool {
    if let Some(colloquy) = error.downcast_ref::<ColloquyError>() {
        if matches!(colloquy, ColloquyError::ResourceExpired(_)) {
            return true;
        }
    }
    let message = error.to_string().to_lowercase();
    (message.contains("vector store") || message.contains("knowledge store"))
        && (message.contains("expired") || message.contains("not found"))
}
