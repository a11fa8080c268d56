//! SQLite persistence for sessions, messages, attachments, knowledge
//! stores, and account profiles
//!
//! One `Connection` is opened per operation against a single database
//! file; the schema is created by an idempotent [`SqliteStorage::init`].
//! Timestamps are stored as RFC 3339 text, enums as their lowercase
//! string form.

use crate::error::{ColloquyError, Result};
use crate::quota::{PlanTier, Quota, Usage};
use anyhow::Context;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

pub mod types;
pub use types::{
    AttachmentRecord, ChatMessage, ChatSession, KnowledgeStore, MessageStatus, Profile, Sender,
    StoreStatus,
};

/// Storage backend for all persisted records
pub struct SqliteStorage {
    db_path: PathBuf,
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn bad_column(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unrecognized {}: {}", what, value).into(),
    )
}

impl SqliteStorage {
    /// Create a new storage instance
    ///
    /// Initializes the database file in the user's data directory. The
    /// `COLLOQUY_DB` environment variable overrides the path, which
    /// makes it easy to point the binary at a test DB or alternate file.
    pub fn new() -> Result<Self> {
        if let Ok(override_path) = std::env::var("COLLOQUY_DB") {
            return Self::new_with_path(override_path);
        }

        let proj_dirs = ProjectDirs::from("dev", "colloquy", "colloquy")
            .ok_or_else(|| ColloquyError::Storage("Could not determine data directory".into()))?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .context("Failed to create data directory")
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;

        let db_path = data_dir.join("colloquy.db");
        let storage = Self { db_path };
        storage.init()?;
        Ok(storage)
    }

    /// Create a new storage instance that uses the specified database path
    ///
    /// Primarily useful for tests where the default application data
    /// directory is not desirable.
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create parent directory for database")
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        }

        let storage = Self { db_path };
        storage.init()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .context("Failed to open database")
            .map_err(|e| ColloquyError::Storage(e.to_string()).into())
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                agent_slug TEXT NOT NULL,
                thread_ref TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES chat_sessions(id),
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                has_files INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_attachments (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES chat_sessions(id),
                message_id TEXT NOT NULL REFERENCES chat_messages(id),
                file_handle TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                store_ref TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS knowledge_stores (
                id TEXT PRIMARY KEY,
                store_handle TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                session_id TEXT,
                file_count INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL,
                successor_handle TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                api_token TEXT NOT NULL UNIQUE,
                plan TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                quota JSON NOT NULL,
                usage JSON NOT NULL,
                quota_last_reset TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON chat_messages(session_id);
            CREATE INDEX IF NOT EXISTS idx_attachments_store
                ON chat_attachments(store_ref);
            CREATE INDEX IF NOT EXISTS idx_stores_status
                ON knowledge_stores(status, expires_at);",
        )
        .context("Failed to create tables")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;

        Ok(())
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    /// Insert a new chat session
    pub fn insert_session(&self, session: &ChatSession) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO chat_sessions (id, owner_id, agent_slug, thread_ref, title, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                session.id,
                session.owner_id,
                session.agent_slug,
                session.thread_ref,
                session.title,
                session.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert session")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Load a session by id
    pub fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT id, owner_id, agent_slug, thread_ref, title, created_at
                 FROM chat_sessions WHERE id = ?",
                params![id],
                Self::row_to_session,
            )
            .optional()
            .context("Failed to query session")
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(session)
    }

    /// List an account's sessions, newest first, optionally per agent
    pub fn list_sessions(
        &self,
        owner_id: &str,
        agent_slug: Option<&str>,
    ) -> Result<Vec<ChatSession>> {
        let conn = self.conn()?;
        let mut out = Vec::new();

        match agent_slug {
            Some(slug) => {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, agent_slug, thread_ref, title, created_at
                     FROM chat_sessions WHERE owner_id = ? AND agent_slug = ?
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![owner_id, slug], Self::row_to_session)?;
                for row in rows {
                    out.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, agent_slug, thread_ref, title, created_at
                     FROM chat_sessions WHERE owner_id = ?
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![owner_id], Self::row_to_session)?;
                for row in rows {
                    out.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))?);
                }
            }
        }

        Ok(out)
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
        let created: String = row.get(5)?;
        Ok(ChatSession {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            agent_slug: row.get(2)?,
            thread_ref: row.get(3)?,
            title: row.get(4)?,
            created_at: parse_ts(&created)?,
        })
    }

    // -----------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------

    /// Append a chat message
    pub fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO chat_messages (id, session_id, sender, content, has_files, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                message.id,
                message.session_id,
                message.sender.as_str(),
                message.content,
                message.has_files as i64,
                message.status.as_str(),
                message.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert message")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Transition a message between complete and incomplete
    pub fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE chat_messages SET status = ? WHERE id = ?",
            params![status.as_str(), id],
        )
        .context("Failed to update message status")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List a session's messages, oldest first
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sender, content, has_files, status, created_at
             FROM chat_messages WHERE session_id = ?
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let sender: String = row.get(2)?;
            let status: String = row.get(5)?;
            let created: String = row.get(6)?;
            Ok(ChatMessage {
                id: row.get(0)?,
                session_id: row.get(1)?,
                sender: Sender::parse(&sender).ok_or_else(|| bad_column("sender", &sender))?,
                content: row.get(3)?,
                has_files: row.get::<_, i64>(4)? != 0,
                status: MessageStatus::parse(&status)
                    .ok_or_else(|| bad_column("status", &status))?,
                created_at: parse_ts(&created)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------

    /// Record one uploaded file
    pub fn insert_attachment(&self, attachment: &AttachmentRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO chat_attachments
             (id, session_id, message_id, file_handle, name, size, mime_type, store_ref, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                attachment.id,
                attachment.session_id,
                attachment.message_id,
                attachment.file_handle,
                attachment.name,
                attachment.size as i64,
                attachment.mime_type,
                attachment.store_ref,
                attachment.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert attachment")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List a session's attachments, oldest first
    pub fn list_attachments(&self, session_id: &str) -> Result<Vec<AttachmentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, message_id, file_handle, name, size, mime_type, store_ref, created_at
             FROM chat_attachments WHERE session_id = ?
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let created: String = row.get(8)?;
            Ok(AttachmentRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                message_id: row.get(2)?,
                file_handle: row.get(3)?,
                name: row.get(4)?,
                size: row.get::<_, i64>(5)? as u64,
                mime_type: row.get(6)?,
                store_ref: row.get(7)?,
                created_at: parse_ts(&created)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))?);
        }
        Ok(out)
    }

    /// Provider file handles indexed by a knowledge store
    pub fn file_handles_for_store(&self, store_handle: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT file_handle FROM chat_attachments WHERE store_ref = ?")?;
        let rows = stmt.query_map(params![store_handle], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))?);
        }
        Ok(out)
    }

    /// Re-point attachments from one store handle to its replacement
    pub fn relink_attachments(&self, old_handle: &str, new_handle: &str) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE chat_attachments SET store_ref = ? WHERE store_ref = ?",
                params![new_handle, old_handle],
            )
            .context("Failed to relink attachments")
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(changed)
    }

    // -----------------------------------------------------------------
    // Knowledge stores
    // -----------------------------------------------------------------

    /// Insert a new knowledge store row
    pub fn insert_store(&self, store: &KnowledgeStore) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO knowledge_stores
             (id, store_handle, owner_id, session_id, file_count, expires_at, status,
              successor_handle, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                store.id,
                store.store_handle,
                store.owner_id,
                store.session_id,
                store.file_count,
                store.expires_at.to_rfc3339(),
                store.status.as_str(),
                store.successor_handle,
                store.created_at.to_rfc3339(),
                store.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert knowledge store")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Load a store row by its provider handle
    pub fn get_store(&self, store_handle: &str) -> Result<Option<KnowledgeStore>> {
        let conn = self.conn()?;
        let store = conn
            .query_row(
                "SELECT id, store_handle, owner_id, session_id, file_count, expires_at,
                        status, successor_handle, created_at, updated_at
                 FROM knowledge_stores WHERE store_handle = ?",
                params![store_handle],
                Self::row_to_store,
            )
            .optional()
            .context("Failed to query knowledge store")
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(store)
    }

    /// The live store bound to a session, if any
    pub fn active_session_store(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<Option<KnowledgeStore>> {
        let conn = self.conn()?;
        let store = conn
            .query_row(
                "SELECT id, store_handle, owner_id, session_id, file_count, expires_at,
                        status, successor_handle, created_at, updated_at
                 FROM knowledge_stores
                 WHERE owner_id = ? AND session_id = ? AND status = 'active'
                 ORDER BY created_at DESC LIMIT 1",
                params![owner_id, session_id],
                Self::row_to_store,
            )
            .optional()
            .context("Failed to query session store")
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(store)
    }

    /// Update a store's lifecycle status
    pub fn set_store_status(&self, store_handle: &str, status: StoreStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE knowledge_stores SET status = ?, updated_at = ? WHERE store_handle = ?",
            params![status.as_str(), Utc::now().to_rfc3339(), store_handle],
        )
        .context("Failed to update store status")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Record the replacement handle after a recreation
    pub fn set_store_successor(&self, store_handle: &str, successor: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE knowledge_stores SET successor_handle = ?, updated_at = ?
             WHERE store_handle = ?",
            params![successor, Utc::now().to_rfc3339(), store_handle],
        )
        .context("Failed to record store successor")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Bump the indexed-file counter after adding files to a store
    pub fn increment_store_files(&self, store_handle: &str, added: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE knowledge_stores SET file_count = file_count + ?, updated_at = ?
             WHERE store_handle = ?",
            params![added, Utc::now().to_rfc3339(), store_handle],
        )
        .context("Failed to update store file count")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Bind a store to a session
    pub fn link_store_session(&self, store_handle: &str, session_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE knowledge_stores SET session_id = ?, updated_at = ? WHERE store_handle = ?",
            params![session_id, Utc::now().to_rfc3339(), store_handle],
        )
        .context("Failed to link store to session")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Active stores whose expiry is at or before the cutoff
    ///
    /// Drives both the cleanup job (cutoff = now) and the proactive
    /// recreation job (cutoff = now + lookahead).
    pub fn active_stores_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeStore>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, store_handle, owner_id, session_id, file_count, expires_at,
                    status, successor_handle, created_at, updated_at
             FROM knowledge_stores
             WHERE status = 'active' AND expires_at <= ?",
        )?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], Self::row_to_store)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))?);
        }
        Ok(out)
    }

    fn row_to_store(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeStore> {
        let expires: String = row.get(5)?;
        let status: String = row.get(6)?;
        let created: String = row.get(8)?;
        let updated: String = row.get(9)?;
        Ok(KnowledgeStore {
            id: row.get(0)?,
            store_handle: row.get(1)?,
            owner_id: row.get(2)?,
            session_id: row.get(3)?,
            file_count: row.get(4)?,
            expires_at: parse_ts(&expires)?,
            status: StoreStatus::parse(&status).ok_or_else(|| bad_column("status", &status))?,
            successor_handle: row.get(7)?,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        })
    }

    // -----------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------

    /// Insert an account profile
    pub fn insert_profile(&self, profile: &Profile) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO profiles (id, api_token, plan, is_active, quota, usage, quota_last_reset)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                profile.id,
                profile.api_token,
                profile.plan.as_str(),
                profile.is_active as i64,
                serde_json::to_string(&profile.quota)?,
                serde_json::to_string(&profile.usage)?,
                profile.quota_last_reset.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to insert profile")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Resolve an API token to its profile
    pub fn find_profile_by_token(&self, token: &str) -> Result<Option<Profile>> {
        self.query_profile("SELECT id, api_token, plan, is_active, quota, usage, quota_last_reset
             FROM profiles WHERE api_token = ?", token)
    }

    /// Load a profile by account id
    pub fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        self.query_profile("SELECT id, api_token, plan, is_active, quota, usage, quota_last_reset
             FROM profiles WHERE id = ?", id)
    }

    fn query_profile(&self, sql: &str, key: &str) -> Result<Option<Profile>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(sql, params![key], |row| {
                let plan: String = row.get(2)?;
                let quota: String = row.get(4)?;
                let usage: String = row.get(5)?;
                let reset: Option<String> = row.get(6)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    plan,
                    row.get::<_, i64>(3)? != 0,
                    quota,
                    usage,
                    reset,
                ))
            })
            .optional()
            .context("Failed to query profile")
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;

        let Some((id, api_token, plan, is_active, quota, usage, reset)) = raw else {
            return Ok(None);
        };

        let plan = PlanTier::parse(&plan)
            .ok_or_else(|| ColloquyError::Storage(format!("unrecognized plan: {}", plan)))?;
        let quota: Quota = serde_json::from_str(&quota)
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        let usage: Usage = serde_json::from_str(&usage)
            .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        let quota_last_reset = match reset {
            Some(ts) => Some(
                DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ColloquyError::Storage(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Some(Profile {
            id,
            api_token,
            plan,
            is_active,
            quota,
            usage,
            quota_last_reset,
        }))
    }

    /// Overwrite a profile's consumed-usage counters
    pub fn update_profile_usage(&self, id: &str, usage: &Usage) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE profiles SET usage = ? WHERE id = ?",
            params![serde_json::to_string(usage)?, id],
        )
        .context("Failed to update profile usage")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Reset a profile's ledger for a new billing period
    pub fn reset_profile_ledger(
        &self,
        id: &str,
        quota: &Quota,
        usage: &Usage,
        reset_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE profiles SET quota = ?, usage = ?, quota_last_reset = ? WHERE id = ?",
            params![
                serde_json::to_string(quota)?,
                serde_json::to_string(usage)?,
                reset_at.to_rfc3339(),
                id,
            ],
        )
        .context("Failed to reset profile ledger")
        .map_err(|e| ColloquyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All account ids, for the scheduled quota sweep
    pub fn list_profile_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM profiles")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))?);
        }
        Ok(out)
    }
}
